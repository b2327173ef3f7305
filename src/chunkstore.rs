//! The backing chunk store: a raw file or device holding one
//! variable-length ciphertext per chunk slot, 512-byte aligned.
//!
//! The store is exclusively owned by its device for the device's
//! lifetime. Slot `i` starts at sector `offset + i * chunksize/512`;
//! ciphertext shorter than chunksize leaves the rest of the slot as
//! unused padding.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::NexusError;

pub const SECTOR_SIZE: u64 = 512;

pub struct ChunkStore {
    file: std::fs::File,
    path: PathBuf,
    chunksize: u32,
    offset: u64,
    chunk_count: u64,
}

impl ChunkStore {
    /// Open the backing store and size it: the capacity after the
    /// sector offset is rounded down to a whole number of chunks.
    pub fn open<P: AsRef<Path>>(path: P, chunksize: u32, offset: u64) -> Result<Self, NexusError> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| NexusError::IoError(format!("unable to open {:?} - {}", path, err)))?;

        let len = file
            .metadata()
            .map_err(|err| NexusError::IoError(format!("unable to stat {:?} - {}", path, err)))?
            .len();
        let capacity = len / SECTOR_SIZE;
        if capacity <= offset {
            return Err(NexusError::BadInput(format!(
                "offset {} is >= store capacity {}",
                offset, capacity
            )));
        }
        let chunk_sectors = chunksize as u64 / SECTOR_SIZE;
        let usable = (capacity - offset) & !(chunk_sectors - 1);
        let chunk_count = usable / chunk_sectors;

        Ok(Self {
            file,
            path,
            chunksize,
            offset,
            chunk_count,
        })
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn chunksize(&self) -> u32 {
        self.chunksize
    }

    pub fn chunk_sectors(&self) -> u64 {
        self.chunksize as u64 / SECTOR_SIZE
    }

    fn slot_start(&self, chunk: u64) -> Result<u64, NexusError> {
        if chunk >= self.chunk_count {
            return Err(NexusError::BadInput(format!(
                "chunk {} beyond store capacity {}",
                chunk, self.chunk_count
            )));
        }
        Ok((self.offset + chunk * self.chunk_sectors()) * SECTOR_SIZE)
    }

    /// Read `len` bytes of ciphertext from a chunk slot. A short read
    /// is an I/O error, never silently padded.
    pub fn read_chunk(&self, chunk: u64, len: u32) -> Result<Vec<u8>, NexusError> {
        if len == 0 || len > self.chunksize {
            return Err(NexusError::BadInput(format!(
                "invalid ciphertext length {} for chunk {}",
                len, chunk
            )));
        }
        let start = self.slot_start(chunk)?;
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact_at(&mut buf, start).map_err(|err| {
            NexusError::IoError(format!(
                "read of chunk {} in {:?} failed - {}",
                chunk, self.path, err
            ))
        })?;
        Ok(buf)
    }

    /// Write a chunk's ciphertext into its slot, overwriting whatever
    /// was there before.
    pub fn write_chunk(&self, chunk: u64, data: &[u8]) -> Result<(), NexusError> {
        if data.is_empty() || data.len() > self.chunksize as usize {
            return Err(NexusError::BadInput(format!(
                "invalid ciphertext length {} for chunk {}",
                data.len(),
                chunk
            )));
        }
        let start = self.slot_start(chunk)?;
        self.file.write_all_at(data, start).map_err(|err| {
            NexusError::IoError(format!(
                "write of chunk {} in {:?} failed - {}",
                chunk, self.path, err
            ))
        })
    }

    /// Flush written chunks to stable storage.
    pub fn sync(&self) -> Result<(), NexusError> {
        self.file
            .sync_data()
            .map_err(|err| NexusError::IoError(format!("sync of {:?} failed - {}", self.path, err)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn make_store(sectors: u64, chunksize: u32, offset: u64) -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![0u8; (sectors * SECTOR_SIZE) as usize])
            .unwrap();
        let store = ChunkStore::open(&path, chunksize, offset).unwrap();
        (dir, store)
    }

    #[test]
    fn capacity_rounds_down_to_chunks() {
        // 10 sectors after a 1-sector offset, 4-sector chunks -> 2 chunks
        let (_dir, store) = make_store(11, 2048, 1);
        assert_eq!(store.chunk_count(), 2);
    }

    #[test]
    fn write_read_roundtrip() {
        let (_dir, store) = make_store(64, 2048, 0);
        let data = vec![0xabu8; 777];
        store.write_chunk(3, &data).unwrap();
        assert_eq!(store.read_chunk(3, 777).unwrap(), data);
    }

    #[test]
    fn out_of_range_chunk_rejected() {
        let (_dir, store) = make_store(16, 2048, 0);
        assert!(store.read_chunk(100, 16).is_err());
        assert!(store.write_chunk(100, &[0u8; 16]).is_err());
    }

    #[test]
    fn oversized_ciphertext_rejected() {
        let (_dir, store) = make_store(16, 2048, 0);
        assert!(store.write_chunk(0, &vec![0u8; 2049]).is_err());
        assert!(store.read_chunk(0, 2049).is_err());
    }

    #[test]
    fn offset_must_leave_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0u8; 512])
            .unwrap();
        assert!(ChunkStore::open(&path, 512, 1).is_err());
    }
}
