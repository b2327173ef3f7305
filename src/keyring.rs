//! The keeper's durable keyring: one row of (tag, key, compression) per
//! chunk index, plus the local cache index that records each chunk's
//! ciphertext length, and the persistent dirty/damaged flags.
//!
//! The device core never touches this directly; it sees keyring state
//! only through the user-message channel.

use std::path::Path;

use log::warn;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::NexusError;
use crate::sql;
use crate::transform::Compression;

const KEYRING_VERSION: i64 = 1;

/// Metadata for one chunk, as exchanged over the user-message channel.
/// `length` is the ciphertext length in the backing store; zero means
/// the chunk has never been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    pub tag: Vec<u8>,
    pub key: Vec<u8>,
    pub compression: Compression,
    pub length: u32,
}

pub struct KeyringStore {
    conn: Connection,
    hash_len: usize,
    chunk_count: u64,
}

impl KeyringStore {
    pub fn open<P: AsRef<Path>>(
        path: P,
        hash_len: usize,
        chunk_count: u64,
    ) -> Result<Self, NexusError> {
        let conn = Connection::open(path.as_ref()).map_err(sql::sqlite_err)?;
        sql::setup_conn(&conn)?;

        let version = sql::user_version(&conn)?;
        if version == 0 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS keys (
                    chunk INTEGER PRIMARY KEY NOT NULL,
                    tag BLOB NOT NULL,
                    key BLOB NOT NULL,
                    compression INTEGER NOT NULL);
                CREATE TABLE IF NOT EXISTS chunks (
                    chunk INTEGER PRIMARY KEY NOT NULL,
                    length INTEGER NOT NULL DEFAULT 0);
                CREATE TABLE IF NOT EXISTS flags (
                    name TEXT PRIMARY KEY NOT NULL,
                    value INTEGER NOT NULL DEFAULT 0);",
            )
            .map_err(sql::sqlite_err)?;
            sql::set_user_version(&conn, KEYRING_VERSION)?;
        } else if version != KEYRING_VERSION {
            return Err(NexusError::BadInput(format!(
                "keyring version {} not supported (expected {})",
                version, KEYRING_VERSION
            )));
        }

        Ok(Self {
            conn,
            hash_len,
            chunk_count,
        })
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Look up a chunk. `Ok(None)` means no keyring row exists, which
    /// readers treat the same as a zero-length entry: never written.
    pub fn get(&self, chunk: u64) -> Result<Option<ChunkMeta>, NexusError> {
        if chunk >= self.chunk_count {
            return Err(NexusError::NotFound(chunk));
        }
        let row = self
            .conn
            .query_row(
                "SELECT keys.tag, keys.key, keys.compression, chunks.length
                 FROM keys LEFT JOIN chunks ON keys.chunk == chunks.chunk
                 WHERE keys.chunk == ?1",
                params![chunk as i64],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(sql::sqlite_err)?;

        match row {
            None => Ok(None),
            Some((tag, key, compression, length)) => {
                if tag.len() != self.hash_len || key.len() != self.hash_len {
                    return Err(NexusError::Corruption(format!(
                        "keyring entry for chunk {} has bad tag/key length",
                        chunk
                    )));
                }
                let compression = Compression::from_raw(compression).ok_or_else(|| {
                    NexusError::Corruption(format!(
                        "keyring entry for chunk {} has invalid compression {}",
                        chunk, compression
                    ))
                })?;
                Ok(Some(ChunkMeta {
                    tag,
                    key,
                    compression,
                    length: length.unwrap_or(0) as u32,
                }))
            }
        }
    }

    /// Atomically replace a chunk's keyring row and cache-index length.
    pub fn put(&mut self, chunk: u64, meta: &ChunkMeta) -> Result<(), NexusError> {
        if chunk >= self.chunk_count {
            return Err(NexusError::NotFound(chunk));
        }
        if meta.tag.len() != self.hash_len || meta.key.len() != self.hash_len {
            return Err(NexusError::BadInput(format!(
                "tag/key must be {} bytes",
                self.hash_len
            )));
        }
        sql::transaction(&mut self.conn, |tx| {
            tx.execute(
                "INSERT OR REPLACE INTO keys (chunk, tag, key, compression)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    chunk as i64,
                    meta.tag,
                    meta.key,
                    meta.compression.to_raw()
                ],
            )
            .map_err(sql::sqlite_err)?;
            tx.execute(
                "INSERT OR REPLACE INTO chunks (chunk, length) VALUES (?1, ?2)",
                params![chunk as i64, meta.length as i64],
            )
            .map_err(sql::sqlite_err)?;
            Ok(())
        })
    }

    /// Visit keyring rows for `start <= chunk < end` in ascending order.
    pub fn iterate_range(
        &self,
        start: u64,
        end: u64,
        mut visit: impl FnMut(u64, &ChunkMeta),
    ) -> Result<(), NexusError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT keys.chunk, keys.tag, keys.key, keys.compression, chunks.length
                 FROM keys LEFT JOIN chunks ON keys.chunk == chunks.chunk
                 WHERE keys.chunk >= ?1 AND keys.chunk < ?2
                 ORDER BY keys.chunk ASC",
            )
            .map_err(sql::sqlite_err)?;
        let rows = stmt
            .query_map(params![start as i64, end as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })
            .map_err(sql::sqlite_err)?;
        for row in rows {
            let (chunk, tag, key, compression, length) = row.map_err(sql::sqlite_err)?;
            let compression = match Compression::from_raw(compression) {
                Some(c) => c,
                None => {
                    warn!("skipping keyring entry {} with bad compression", chunk);
                    continue;
                }
            };
            visit(
                chunk as u64,
                &ChunkMeta {
                    tag,
                    key,
                    compression,
                    length: length.unwrap_or(0) as u32,
                },
            );
        }
        Ok(())
    }

    pub fn count(&self) -> Result<u64, NexusError> {
        self.conn
            .query_row("SELECT count(*) FROM keys", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(sql::sqlite_err)
    }

    /// Consistency pass over the whole keyring: every present row must
    /// have digest-sized tag and key, a known compression type and an
    /// in-range chunk index. Returns the number of problems found.
    pub fn validate(&self, supported_compression: u32) -> Result<u64, NexusError> {
        let mut stmt = self
            .conn
            .prepare("SELECT chunk, tag, key, compression FROM keys ORDER BY chunk ASC")
            .map_err(sql::sqlite_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(sql::sqlite_err)?;

        let mut problems = 0;
        for row in rows {
            let (chunk, tag, key, compression) = row.map_err(sql::sqlite_err)?;
            if chunk < 0 || chunk as u64 >= self.chunk_count {
                warn!("keyring entry {} greater than parcel size {}", chunk, self.chunk_count);
                problems += 1;
                continue;
            }
            if tag.len() != self.hash_len {
                warn!("chunk {}: expected tag length {}, found {}", chunk, self.hash_len, tag.len());
                problems += 1;
            }
            if key.len() != self.hash_len {
                warn!("chunk {}: expected key length {}, found {}", chunk, self.hash_len, key.len());
                problems += 1;
            }
            match Compression::from_raw(compression) {
                Some(alg) if crate::transform::compression_type_ok(supported_compression, alg) => {}
                _ => {
                    warn!("chunk {}: invalid or unsupported compression type {}", chunk, compression);
                    problems += 1;
                }
            }
        }
        Ok(problems)
    }

    fn get_flag(&self, name: &str) -> Result<bool, NexusError> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM flags WHERE name == ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql::sqlite_err)?;
        Ok(value.unwrap_or(0) != 0)
    }

    fn set_flag(&self, name: &str, value: bool) -> Result<(), NexusError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO flags (name, value) VALUES (?1, ?2)",
                params![name, value as i64],
            )
            .map_err(sql::sqlite_err)?;
        Ok(())
    }

    /// The cache has uncommitted modifications.
    pub fn dirty(&self) -> Result<bool, NexusError> {
        self.get_flag("dirty")
    }

    pub fn set_dirty(&self, value: bool) -> Result<(), NexusError> {
        self.set_flag("dirty", value)
    }

    /// Data corruption was detected; uploads are disallowed until a
    /// full validation pass clears this.
    pub fn damaged(&self) -> Result<bool, NexusError> {
        self.get_flag("damaged")
    }

    pub fn set_damaged(&self, value: bool) -> Result<(), NexusError> {
        self.set_flag("damaged", value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> KeyringStore {
        let dir = tempfile::tempdir().unwrap();
        // keep the tempdir alive by leaking it; tests are short-lived
        let path = dir.into_path().join("keyring.db");
        KeyringStore::open(path, 20, 100).unwrap()
    }

    fn meta(fill: u8, length: u32) -> ChunkMeta {
        ChunkMeta {
            tag: vec![fill; 20],
            key: vec![fill.wrapping_add(1); 20],
            compression: Compression::Zlib,
            length,
        }
    }

    #[test]
    fn get_put_roundtrip() {
        let mut store = store();
        assert_eq!(store.get(5).unwrap(), None);
        let m = meta(0xaa, 4096);
        store.put(5, &m).unwrap();
        assert_eq!(store.get(5).unwrap(), Some(m.clone()));
        // atomic replace
        let m2 = meta(0xbb, 8192);
        store.put(5, &m2).unwrap();
        assert_eq!(store.get(5).unwrap(), Some(m2));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn out_of_range_rejected() {
        let mut store = store();
        assert!(matches!(store.get(100), Err(NexusError::NotFound(100))));
        assert!(matches!(store.put(100, &meta(1, 1)), Err(NexusError::NotFound(100))));
    }

    #[test]
    fn bad_tag_length_rejected() {
        let mut store = store();
        let mut m = meta(1, 1);
        m.tag = vec![0u8; 16];
        assert!(matches!(store.put(0, &m), Err(NexusError::BadInput(_))));
    }

    #[test]
    fn iterate_range_ordered() {
        let mut store = store();
        for chunk in [7u64, 3, 5] {
            store.put(chunk, &meta(chunk as u8, 100)).unwrap();
        }
        let mut seen = Vec::new();
        store.iterate_range(0, 6, |chunk, _| seen.push(chunk)).unwrap();
        assert_eq!(seen, vec![3, 5]);
    }

    #[test]
    fn flags_persist() {
        let store = store();
        assert!(!store.damaged().unwrap());
        store.set_damaged(true).unwrap();
        assert!(store.damaged().unwrap());
        store.set_damaged(false).unwrap();
        assert!(!store.damaged().unwrap());
    }

    #[test]
    fn validate_counts_problems() {
        let mut store = store();
        store.put(0, &meta(1, 100)).unwrap();
        assert_eq!(store.validate(crate::transform::all_compression_mask()).unwrap(), 0);
        // unsupported compression counts as a problem
        assert_eq!(store.validate(Compression::None.bit()).unwrap(), 1);
    }
}
