//! SQLite helpers shared by the keyring store and the hoard index.
//!
//! Both databases are accessed by multiple processes, so every mutation
//! runs inside a transaction and SQLITE_BUSY is handled by one shared
//! retry-with-randomized-backoff utility rather than per call site.

use std::time::Duration;

use rusqlite::{Connection, Transaction};

use crate::error::NexusError;

/// Default number of busy retries before the error is surfaced.
pub const BUSY_RETRY_BUDGET: u32 = 10;

/// Per-connection setup. The busy handler is disabled because the
/// callers own the retry policy.
pub fn setup_conn(conn: &Connection) -> Result<(), NexusError> {
    conn.busy_timeout(Duration::from_millis(0))
        .map_err(sqlite_err)?;
    Ok(())
}

pub fn user_version(conn: &Connection) -> Result<i64, NexusError> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(sqlite_err)
}

pub fn set_user_version(conn: &Connection, version: i64) -> Result<(), NexusError> {
    conn.pragma_update(None, "user_version", version)
        .map_err(sqlite_err)
}

/// Map a rusqlite error to the taxonomy: lock contention becomes
/// `Busy` (retryable), everything else is an I/O failure.
pub fn sqlite_err(err: rusqlite::Error) -> NexusError {
    if let rusqlite::Error::SqliteFailure(code, _) = &err {
        match code.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                return NexusError::Busy;
            }
            _ => {}
        }
    }
    NexusError::IoError(format!("sqlite error: {}", err))
}

/// Sleep for a uniformly-random short interval before a busy retry, so
/// competing processes do not retry in lockstep.
pub fn query_backoff() {
    let mut raw = [0u8; 2];
    // fall back to a fixed delay if the RNG fails
    let ms = match openssl::rand::rand_bytes(&mut raw) {
        Ok(_) => 1 + (u16::from_le_bytes(raw) % 10) as u64,
        Err(_) => 5,
    };
    std::thread::sleep(Duration::from_millis(ms));
}

/// Run `op`, retrying with backoff for up to `budget` transient
/// failures. `Busy` never escapes past here unless the budget runs out.
pub fn retry<T, F>(budget: u32, mut op: F) -> Result<T, NexusError>
where
    F: FnMut() -> Result<T, NexusError>,
{
    let mut tries = 0;
    loop {
        match op() {
            Err(NexusError::Busy) if tries < budget => {
                tries += 1;
                query_backoff();
            }
            other => return other,
        }
    }
}

/// Transaction wrapper with busy retry: begins, runs `body`, commits.
/// A `Busy` from the body rolls back (on drop) and retries the whole
/// transaction.
pub fn transaction<T, F>(conn: &mut Connection, mut body: F) -> Result<T, NexusError>
where
    F: FnMut(&Transaction) -> Result<T, NexusError>,
{
    retry(BUSY_RETRY_BUDGET, || {
        let tx = conn.transaction().map_err(sqlite_err)?;
        let value = body(&tx)?;
        tx.commit().map_err(sqlite_err)?;
        Ok(value)
    })
}
