//! Small helpers shared across the crate.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use anyhow::{bail, Error};
use nix::fcntl::{flock, FlockArg};

/// How a file lock should be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Acquire a flock on an open file, blocking until it is granted.
pub fn lock_file(file: &File, mode: LockMode) -> Result<(), Error> {
    let arg = match mode {
        LockMode::Shared => FlockArg::LockShared,
        LockMode::Exclusive => FlockArg::LockExclusive,
    };
    if let Err(err) = flock(file.as_raw_fd(), arg) {
        bail!("unable to acquire file lock - {}", err);
    }
    Ok(())
}

/// Try to acquire a flock without blocking. Returns false if another
/// process holds a conflicting lock.
pub fn try_lock_file(file: &File, mode: LockMode) -> Result<bool, Error> {
    let arg = match mode {
        LockMode::Shared => FlockArg::LockSharedNonblock,
        LockMode::Exclusive => FlockArg::LockExclusiveNonblock,
    };
    match flock(file.as_raw_fd(), arg) {
        Ok(_) => Ok(true),
        Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => Ok(false),
        Err(err) => bail!("unable to acquire file lock - {}", err),
    }
}

/// Drop any flock held on the file.
pub fn unlock_file(file: &File) -> Result<(), Error> {
    if let Err(err) = flock(file.as_raw_fd(), FlockArg::Unlock) {
        bail!("unable to release file lock - {}", err);
    }
    Ok(())
}

/// Render a tag or key digest as lowercase hex for log messages.
pub fn format_tag(tag: &[u8]) -> String {
    let mut out = String::with_capacity(tag.len() * 2);
    for b in tag {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Total system memory in pages, for the cache allocation caps.
pub fn system_page_count() -> u64 {
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        // sysinfo(2) only fails on a bad pointer; fall back to something
        // large enough that the caps never trigger spuriously.
        return u64::MAX / 2;
    }
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    (info.totalram as u64).saturating_mul(info.mem_unit as u64) / page_size
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn format_tag_hex() {
        assert_eq!(format_tag(&[0xde, 0xad, 0x00, 0x01]), "dead0001");
    }

    #[test]
    fn page_count_nonzero() {
        assert!(system_page_count() > 0);
    }
}
