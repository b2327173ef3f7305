//! The hoard cache: a host-wide, content-addressed pool of encrypted
//! chunks shared by every parcel on the machine.
//!
//! Chunks live in a dense slot file; a SQLite index maps tags to slot
//! offsets and tracks per-parcel references. Recently-allocated slots
//! are staged in a transient in-memory `slots` overlay (a TEMP table)
//! and flushed into the durable `chunks` table in batches. The file is
//! held under a shared lock during normal operation; shutdown promotes
//! to an exclusive lock for opportunistic cleanup, skipping it if the
//! promotion would block.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::NexusError;
use crate::sql;
use crate::tools::{self, LockMode};
use crate::transform::{self, CryptoSuite};

const HOARD_INDEX_VERSION: i64 = 7;
/// Oldest schema we can migrate forward from.
const HOARD_INDEX_FLOOR: i64 = 5;
/// Slots claimed into the overlay per expansion.
const EXPAND_CHUNKS: u64 = 256;

/// A parcel's identity row in the shared index.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ParcelIdent {
    pub uuid: String,
    pub server: String,
    pub user: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct HoardConfig {
    pub dir: PathBuf,
    pub chunksize: u32,
    pub suite: CryptoSuite,
    /// Never evict below this many hoarded chunks.
    pub min_hoarded_chunks: u64,
    /// Optional hard cap on the slot pool, mainly for small setups.
    pub max_slots: Option<u64>,
}

#[derive(Debug)]
pub struct Hoard {
    conn: Connection,
    file: File,
    config: HoardConfig,
    parcel_id: Option<i64>,
    closed: bool,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Hoard {
    /// Open (creating if necessary) the hoard under `config.dir`,
    /// taking a shared lock on the slot file. When `parcel` is given,
    /// its identity row is registered and reference tracking is
    /// enabled for it.
    pub fn open(config: HoardConfig, parcel: Option<&ParcelIdent>) -> Result<Self, NexusError> {
        if config.chunksize < 512 || !config.chunksize.is_power_of_two() {
            return Err(NexusError::BadInput(
                "hoard chunk size must be >= 512 and a power of 2".to_string(),
            ));
        }
        if !config.dir.is_dir() {
            std::fs::create_dir_all(&config.dir).map_err(|err| {
                NexusError::IoError(format!(
                    "unable to create hoard directory {:?} - {}",
                    config.dir, err
                ))
            })?;
        }

        let file_path = config.dir.join("hoard");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&file_path)
            .map_err(|err| {
                NexusError::IoError(format!("unable to open {:?} - {}", file_path, err))
            })?;
        tools::lock_file(&file, LockMode::Shared)
            .map_err(|err| NexusError::IoError(err.to_string()))?;

        let index_path = config.dir.join("hoard.idx");
        let conn = Connection::open(&index_path).map_err(sql::sqlite_err)?;
        sql::setup_conn(&conn)?;

        let mut hoard = Self {
            conn,
            file,
            config,
            parcel_id: None,
            closed: false,
        };
        hoard.open_index()?;
        if let Some(parcel) = parcel {
            hoard.register_parcel(parcel)?;
        }
        Ok(hoard)
    }

    fn open_index(&mut self) -> Result<(), NexusError> {
        sql::transaction(&mut self.conn, |tx| {
            let version: i64 = tx
                .query_row("PRAGMA user_version", [], |row| row.get(0))
                .map_err(sql::sqlite_err)?;
            if version == 0 {
                create_hoard_index(tx)?;
            } else if version < HOARD_INDEX_FLOOR {
                return Err(NexusError::BadInput(format!(
                    "unrecognized hoard cache version {}, bailing out",
                    version
                )));
            } else if version < HOARD_INDEX_VERSION {
                upgrade_hoard_index(tx, version)?;
            } else if version > HOARD_INDEX_VERSION {
                return Err(NexusError::BadInput(format!(
                    "hoard cache version {} too new (expected {})",
                    version, HOARD_INDEX_VERSION
                )));
            }
            // the transient overlay for recently-allocated slots
            tx.execute_batch(
                "CREATE TEMP TABLE slots (
                    tag BLOB UNIQUE,
                    offset INTEGER UNIQUE NOT NULL,
                    length INTEGER NOT NULL DEFAULT 0,
                    crypto INTEGER NOT NULL DEFAULT 0,
                    last_access INTEGER NOT NULL DEFAULT 0)",
            )
            .map_err(sql::sqlite_err)?;
            Ok(())
        })
    }

    fn register_parcel(&mut self, parcel: &ParcelIdent) -> Result<(), NexusError> {
        let ident = sql::transaction(&mut self.conn, |tx| {
            tx.execute(
                "INSERT OR IGNORE INTO parcels (uuid, server, user, name)
                 VALUES (?1, ?2, ?3, ?4)",
                params![parcel.uuid, parcel.server, parcel.user, parcel.name],
            )
            .map_err(sql::sqlite_err)?;
            let ident: i64 = tx
                .query_row(
                    "SELECT parcel FROM parcels WHERE uuid == ?1",
                    params![parcel.uuid],
                    |row| row.get(0),
                )
                .map_err(sql::sqlite_err)?;
            // refresh metadata if it changed; don't touch the row otherwise
            tx.execute(
                "UPDATE parcels SET server = ?1, user = ?2, name = ?3
                 WHERE parcel == ?4 AND (server != ?1 OR user != ?2 OR name != ?3)",
                params![parcel.server, parcel.user, parcel.name, ident],
            )
            .map_err(sql::sqlite_err)?;
            Ok(ident)
        })?;
        self.parcel_id = Some(ident);
        Ok(())
    }

    /// Look up a chunk by tag. The stored data is digest-verified on
    /// the way out; a mismatch safely invalidates the slot and reports
    /// not-found so the caller refetches from the origin.
    pub fn get(&mut self, tag: &[u8]) -> Result<Option<Vec<u8>>, NexusError> {
        let chunksize = self.config.chunksize as i64;
        let parcel_id = self.parcel_id;

        let found = sql::transaction(&mut self.conn, |tx| {
            let slot_row: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT offset, length FROM temp.slots WHERE tag == ?1",
                    params![tag],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql::sqlite_err)?;

            let (offset, length, from_overlay) = match slot_row {
                Some((offset, length)) => (offset, length, true),
                None => {
                    match tx
                        .query_row(
                            "SELECT offset, length FROM chunks WHERE tag == ?1",
                            params![tag],
                            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                        )
                        .optional()
                        .map_err(sql::sqlite_err)?
                    {
                        Some((offset, length)) => (offset, length, false),
                        None => return Ok(None),
                    }
                }
            };

            if offset < 0 || length <= 0 || length > chunksize {
                warn!(
                    "chunk has unreasonable offset/length {}/{}; invalidating",
                    offset, length
                );
                if from_overlay {
                    invalidate_slot_tx(tx, offset)?;
                } else {
                    invalidate_chunk_tx(tx, offset, tag)?;
                }
                return Ok(None);
            }

            let update = if from_overlay {
                "UPDATE temp.slots SET last_access = ?1 WHERE tag == ?2"
            } else {
                "UPDATE chunks SET last_access = ?1 WHERE tag == ?2"
            };
            tx.execute(update, params![now_secs(), tag])
                .map_err(sql::sqlite_err)?;
            if !from_overlay {
                add_chunk_reference_tx(tx, parcel_id, tag)?;
            }
            Ok(Some((offset, length, from_overlay)))
        })?;

        let (offset, length, from_overlay) = match found {
            Some(found) => found,
            None => return Ok(None),
        };

        let mut data = vec![0u8; length as usize];
        if let Err(err) = self.file.read_exact_at(&mut data, (offset as u64) << 9) {
            warn!("couldn't read chunk at offset {} - {}", offset, err);
            self.invalidate_any(offset, tag, from_overlay)?;
            return Err(NexusError::IoError(format!(
                "hoard read at offset {} failed - {}",
                offset, err
            )));
        }

        // Verify the stored hash against the data. If the reference was
        // released and the slot reused while we were reading, blindly
        // zeroing the row would destroy someone else's chunk, so the
        // invalidation double-checks the (offset, tag) pair.
        let digest = transform::digest(self.config.suite.hash_alg(), &data)?;
        if digest != tag {
            warn!(
                "tag mismatch reading hoard cache at offset {} (expected {}, found {})",
                offset,
                tools::format_tag(tag),
                tools::format_tag(&digest)
            );
            self.invalidate_any(offset, tag, from_overlay)?;
            return Ok(None);
        }

        Ok(Some(data))
    }

    /// Store a chunk under its tag. Already-present tags just gain a
    /// reference for this parcel.
    pub fn put(&mut self, tag: &[u8], data: &[u8]) -> Result<(), NexusError> {
        if data.is_empty() || data.len() > self.config.chunksize as usize {
            return Err(NexusError::BadInput(format!(
                "chunk of {} bytes does not fit a hoard slot",
                data.len()
            )));
        }

        let file = &self.file;
        let parcel_id = self.parcel_id;
        let crypto = self.config.suite.to_raw();
        let min_hoarded = self.config.min_hoarded_chunks;
        let max_slots = self.config.max_slots;
        let step = (self.config.chunksize as u64) >> 9;

        sql::transaction(&mut self.conn, |tx| {
            let in_overlay: Option<i64> = tx
                .query_row(
                    "SELECT offset FROM temp.slots WHERE tag == ?1",
                    params![tag],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql::sqlite_err)?;
            if in_overlay.is_some() {
                return Ok(());
            }

            let in_chunks: Option<i64> = tx
                .query_row(
                    "SELECT offset FROM chunks WHERE tag == ?1",
                    params![tag],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql::sqlite_err)?;
            if in_chunks.is_some() {
                return add_chunk_reference_tx(tx, parcel_id, tag);
            }

            let offset = allocate_slot_tx(tx, parcel_id, step, min_hoarded, max_slots)?;
            tx.execute(
                "UPDATE temp.slots SET tag = ?1, length = ?2, crypto = ?3,
                 last_access = ?4 WHERE offset = ?5",
                params![tag, data.len() as i64, crypto, now_secs(), offset],
            )
            .map_err(sql::sqlite_err)?;

            file.write_all_at(data, (offset as u64) << 9).map_err(|err| {
                NexusError::IoError(format!(
                    "couldn't write hoard cache: offset {}, length {} - {}",
                    offset,
                    data.len(),
                    err
                ))
            })?;
            Ok(())
        })
    }

    /// Flush the slot overlay into the durable `chunks` table.
    pub fn flush(&mut self) -> Result<(), NexusError> {
        let parcel_id = self.parcel_id;
        sql::transaction(&mut self.conn, |tx| flush_slot_cache_tx(tx, parcel_id))
    }

    /// Zero the index row for `(offset, tag)` only if it still
    /// matches; this is the guard against the reclaim-then-reuse race.
    pub fn invalidate(&mut self, offset: i64, tag: &[u8]) -> Result<(), NexusError> {
        sql::transaction(&mut self.conn, |tx| invalidate_chunk_tx(tx, offset, tag))
    }

    fn invalidate_any(
        &mut self,
        offset: i64,
        tag: &[u8],
        from_overlay: bool,
    ) -> Result<(), NexusError> {
        if from_overlay {
            sql::transaction(&mut self.conn, |tx| invalidate_slot_tx(tx, offset))
        } else {
            self.invalidate(offset, tag)
        }
    }

    /// Reconcile this parcel's references with its current working
    /// set: drop references to tags not in `live_tags`, add references
    /// for live tags the cache holds, and garbage-collect the
    /// `referenced` bit on chunks that lost their last holder.
    pub fn sync_refs(&mut self, live_tags: &[Vec<u8>]) -> Result<(), NexusError> {
        let parcel = match self.parcel_id {
            Some(parcel) => parcel,
            None => {
                return Err(NexusError::BadInput(
                    "sync_refs requires a registered parcel".to_string(),
                ))
            }
        };
        sql::transaction(&mut self.conn, |tx| {
            tx.execute_batch("CREATE TEMP TABLE newrefs (tag BLOB PRIMARY KEY NOT NULL)")
                .map_err(sql::sqlite_err)?;
            let result = (|| {
                {
                    let mut insert = tx
                        .prepare("INSERT OR IGNORE INTO temp.newrefs (tag) VALUES (?1)")
                        .map_err(sql::sqlite_err)?;
                    for tag in live_tags {
                        insert.execute(params![tag]).map_err(sql::sqlite_err)?;
                    }
                }
                tx.execute(
                    "UPDATE chunks SET referenced = 0 WHERE tag IN
                     (SELECT tag FROM refs WHERE parcel == ?1
                      AND tag NOT IN (SELECT tag FROM temp.newrefs)
                      AND tag NOT IN (SELECT tag FROM refs WHERE parcel != ?1))",
                    params![parcel],
                )
                .map_err(sql::sqlite_err)?;
                tx.execute(
                    "DELETE FROM refs WHERE parcel == ?1
                     AND tag NOT IN (SELECT tag FROM temp.newrefs)",
                    params![parcel],
                )
                .map_err(sql::sqlite_err)?;
                tx.execute(
                    "INSERT OR IGNORE INTO refs (parcel, tag)
                     SELECT ?1, tag FROM temp.newrefs
                     WHERE tag IN (SELECT tag FROM chunks)",
                    params![parcel],
                )
                .map_err(sql::sqlite_err)?;
                tx.execute(
                    "UPDATE chunks SET referenced = 1 WHERE referenced == 0
                     AND tag IN (SELECT tag FROM temp.newrefs)",
                    [],
                )
                .map_err(sql::sqlite_err)?;
                Ok(())
            })();
            tx.execute_batch("DROP TABLE temp.newrefs")
                .map_err(sql::sqlite_err)?;
            result
        })
    }

    /// Flush the overlay and, if no other process holds the file,
    /// clean up dangling parcel rows and orphaned slot reservations.
    pub fn close(mut self) -> Result<(), NexusError> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<(), NexusError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(err) = self.flush() {
            warn!("couldn't flush hoard slot overlay - {}", err);
        }
        self.try_cleanup()
    }

    /// Opportunistic cleanup under an exclusive lock; skipped entirely
    /// if another process would make the promotion block.
    fn try_cleanup(&mut self) -> Result<(), NexusError> {
        match tools::try_lock_file(&self.file, LockMode::Exclusive) {
            Ok(true) => {}
            Ok(false) => {
                info!("hoard cache in use; skipping cleanup");
                return Ok(());
            }
            Err(err) => return Err(NexusError::IoError(err.to_string())),
        }

        info!("cleaning up hoard cache...");
        let result = sql::transaction(&mut self.conn, |tx| {
            let parcels: Vec<i64> = {
                let mut stmt = tx
                    .prepare("SELECT parcel FROM parcels")
                    .map_err(sql::sqlite_err)?;
                let rows = stmt
                    .query_map([], |row| row.get(0))
                    .map_err(sql::sqlite_err)?;
                rows.collect::<Result<_, _>>().map_err(sql::sqlite_err)?
            };
            let mut removed = 0;
            for ident in parcels {
                let in_use: Option<i64> = tx
                    .query_row(
                        "SELECT parcel FROM refs WHERE parcel == ?1 LIMIT 1",
                        params![ident],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(sql::sqlite_err)?;
                if in_use.is_none() {
                    tx.execute("DELETE FROM parcels WHERE parcel == ?1", params![ident])
                        .map_err(sql::sqlite_err)?;
                    removed += 1;
                }
            }
            if removed > 0 {
                info!("cleaned {} dangling parcel records", removed);
            }

            let orphans = tx
                .execute(
                    "UPDATE chunks SET referenced = 0
                     WHERE referenced == 1 AND tag ISNULL",
                    [],
                )
                .map_err(sql::sqlite_err)?;
            if orphans > 0 {
                info!("cleaned {} orphaned cache slots", orphans);
            }
            Ok(())
        });

        let _ = tools::unlock_file(&self.file);
        result
    }
}

impl Drop for Hoard {
    fn drop(&mut self) {
        if let Err(err) = self.close_inner() {
            warn!("hoard shutdown failed - {}", err);
        }
    }
}

fn create_hoard_index(tx: &Transaction) -> Result<(), NexusError> {
    tx.execute_batch(
        "CREATE TABLE parcels (
            parcel INTEGER PRIMARY KEY NOT NULL,
            uuid TEXT UNIQUE NOT NULL,
            server TEXT NOT NULL,
            user TEXT NOT NULL,
            name TEXT NOT NULL);
        CREATE TABLE chunks (
            tag BLOB UNIQUE,
            offset INTEGER UNIQUE NOT NULL,
            length INTEGER NOT NULL DEFAULT 0,
            crypto INTEGER NOT NULL DEFAULT 0,
            last_access INTEGER NOT NULL DEFAULT 0,
            referenced INTEGER NOT NULL DEFAULT 0);
        CREATE INDEX chunks_lru ON chunks (referenced, last_access);
        CREATE TABLE refs (
            parcel INTEGER NOT NULL,
            tag BLOB NOT NULL);
        CREATE UNIQUE INDEX refs_constraint ON refs (parcel, tag);
        CREATE INDEX refs_bytag ON refs (tag, parcel);",
    )
    .map_err(sql::sqlite_err)?;
    tx.pragma_update(None, "user_version", HOARD_INDEX_VERSION)
        .map_err(sql::sqlite_err)?;
    Ok(())
}

/// Forward-only migrations from older schema versions.
fn upgrade_hoard_index(tx: &Transaction, version: i64) -> Result<(), NexusError> {
    info!(
        "upgrading hoard cache version {} to version {}",
        version, HOARD_INDEX_VERSION
    );
    if version == 5 {
        tx.execute_batch(
            "DROP INDEX chunks_lru;
            CREATE INDEX chunks_lru ON chunks (referenced, last_access);",
        )
        .map_err(sql::sqlite_err)?;
    }
    if version <= 6 {
        tx.execute_batch("CREATE INDEX refs_bytag ON refs (tag, parcel)")
            .map_err(sql::sqlite_err)?;
    }
    tx.pragma_update(None, "user_version", HOARD_INDEX_VERSION)
        .map_err(sql::sqlite_err)?;
    Ok(())
}

fn add_chunk_reference_tx(
    tx: &Transaction,
    parcel_id: Option<i64>,
    tag: &[u8],
) -> Result<(), NexusError> {
    let parcel = match parcel_id {
        Some(parcel) => parcel,
        None => return Ok(()), // reference tracking disabled
    };
    tx.execute(
        "INSERT OR IGNORE INTO refs (parcel, tag) VALUES (?1, ?2)",
        params![parcel, tag],
    )
    .map_err(sql::sqlite_err)?;
    tx.execute(
        "UPDATE chunks SET referenced = 1 WHERE tag == ?1",
        params![tag],
    )
    .map_err(sql::sqlite_err)?;
    Ok(())
}

/// Pick an offset for a new chunk, refilling the overlay as needed.
fn allocate_slot_tx(
    tx: &Transaction,
    parcel_id: Option<i64>,
    step: u64,
    min_hoarded: u64,
    max_slots: Option<u64>,
) -> Result<i64, NexusError> {
    loop {
        let free: Option<i64> = tx
            .query_row(
                "SELECT offset FROM temp.slots WHERE tag ISNULL LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql::sqlite_err)?;
        if let Some(offset) = free {
            return Ok(offset);
        }

        // No free overlay slot: flush the overlay back to the chunks
        // table, then repopulate it and try again.
        flush_slot_cache_tx(tx, parcel_id)?;
        let claimed = expand_slot_cache_tx(tx, step, min_hoarded, max_slots, 1)?;
        if claimed == 0 {
            return Err(NexusError::ResourceExhausted(
                "hoard cache has no reclaimable slots".to_string(),
            ));
        }
    }
}

/// Refill the overlay, in preference order: unallocated slots, then
/// LRU eviction of unreferenced chunks (respecting the minimum-size
/// floor), then pool extension. Free slots and extension are claimed
/// in batches; eviction destroys data, so it is limited to `needed`.
fn expand_slot_cache_tx(
    tx: &Transaction,
    step: u64,
    min_hoarded: u64,
    max_slots: Option<u64>,
    needed: u64,
) -> Result<u64, NexusError> {
    let mut claimed = 0u64;

    // 1: reuse existing unallocated slots
    let reused = tx
        .execute(
            "INSERT OR IGNORE INTO temp.slots (offset)
             SELECT offset FROM chunks
             WHERE referenced == 0 AND tag ISNULL LIMIT ?1",
            params![EXPAND_CHUNKS as i64],
        )
        .map_err(sql::sqlite_err)?;
    claimed += reused as u64;

    // 2: evict unreferenced chunks in LRU order, staying above the floor
    if claimed < needed {
        let want = (needed - claimed) as i64;
        let allowed = if min_hoarded > 0 {
            let hoarded: i64 = tx
                .query_row("SELECT count(tag) FROM chunks", [], |row| row.get(0))
                .map_err(sql::sqlite_err)?;
            (hoarded - min_hoarded as i64).min(want)
        } else {
            want
        };
        if allowed > 0 {
            let evicted = tx
                .execute(
                    "INSERT OR IGNORE INTO temp.slots (offset)
                     SELECT offset FROM chunks
                     WHERE referenced == 0 AND tag NOTNULL
                     ORDER BY last_access LIMIT ?1",
                    params![allowed],
                )
                .map_err(sql::sqlite_err)?;
            claimed += evicted as u64;
        }
    }

    // 3: extend the pool at the next chunk-aligned offsets
    if claimed < needed {
        let (count, max_offset): (i64, Option<i64>) = tx
            .query_row("SELECT count(*), max(offset) FROM chunks", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(sql::sqlite_err)?;
        let batch = EXPAND_CHUNKS.max(needed - claimed);
        let grow = match max_slots {
            Some(cap) => batch.min(cap.saturating_sub(count as u64)),
            None => batch,
        };
        if grow > 0 {
            let start = match max_offset {
                Some(max_offset) if count > 0 => max_offset as u64 + step,
                _ => 0,
            };
            for i in 0..grow {
                tx.execute(
                    "INSERT INTO temp.slots (offset) VALUES (?1)",
                    params![(start + i * step) as i64],
                )
                .map_err(sql::sqlite_err)?;
            }
            tx.execute(
                "INSERT OR IGNORE INTO chunks (offset)
                 SELECT offset FROM temp.slots",
                [],
            )
            .map_err(sql::sqlite_err)?;
            claimed += grow;
        }
    }

    // reserve the chosen slots
    tx.execute(
        "UPDATE chunks SET tag = NULL, length = 0, crypto = 0,
         last_access = 0, referenced = 1
         WHERE offset IN (SELECT offset FROM temp.slots)",
        [],
    )
    .map_err(sql::sqlite_err)?;
    Ok(claimed)
}

/// Install overlay rows into `chunks`. A unique-constraint conflict
/// means another parcel stored the same tag first; that overlay row is
/// dropped and its slot reservation released.
fn flush_slot_cache_tx(tx: &Transaction, parcel_id: Option<i64>) -> Result<(), NexusError> {
    let rows: Vec<(Vec<u8>, i64, i64, i64, i64)> = {
        let mut stmt = tx
            .prepare(
                "SELECT tag, offset, length, crypto, last_access
                 FROM temp.slots WHERE tag NOTNULL",
            )
            .map_err(sql::sqlite_err)?;
        let mapped = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })
            .map_err(sql::sqlite_err)?;
        mapped.collect::<Result<_, _>>().map_err(sql::sqlite_err)?
    };

    let referenced = if parcel_id.is_some() { 1i64 } else { 0i64 };
    for (tag, offset, length, crypto, last_access) in rows {
        let result = tx.execute(
            "UPDATE chunks SET tag = ?1, length = ?2, crypto = ?3,
             last_access = ?4, referenced = ?5 WHERE offset = ?6",
            params![tag, length, crypto, last_access, referenced, offset],
        );
        match result {
            Ok(_) => {}
            Err(err) if is_constraint(&err) => {
                tx.execute(
                    "UPDATE chunks SET referenced = 0 WHERE offset == ?1",
                    params![offset],
                )
                .map_err(sql::sqlite_err)?;
            }
            Err(err) => return Err(sql::sqlite_err(err)),
        }
    }

    if let Some(parcel) = parcel_id {
        tx.execute(
            "INSERT OR IGNORE INTO refs (parcel, tag)
             SELECT ?1, tag FROM temp.slots WHERE tag NOTNULL",
            params![parcel],
        )
        .map_err(sql::sqlite_err)?;
    }
    tx.execute(
        "UPDATE chunks SET referenced = 0 WHERE offset IN
         (SELECT offset FROM temp.slots WHERE tag ISNULL)",
        [],
    )
    .map_err(sql::sqlite_err)?;
    tx.execute("DELETE FROM temp.slots", [])
        .map_err(sql::sqlite_err)?;
    Ok(())
}

fn invalidate_chunk_tx(tx: &Transaction, offset: i64, tag: &[u8]) -> Result<(), NexusError> {
    let still_there: Option<i64> = tx
        .query_row(
            "SELECT offset FROM chunks WHERE offset == ?1 AND tag == ?2",
            params![offset, tag],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql::sqlite_err)?;
    if still_there.is_none() {
        // harmless: the slot was reclaimed and reused while we read it
        warn!(
            "attempted to invalidate tag {} at offset {}, but it does not exist (harmless)",
            tools::format_tag(tag),
            offset
        );
        return Ok(());
    }
    tx.execute(
        "UPDATE chunks SET tag = NULL, length = 0, crypto = 0,
         last_access = 0, referenced = 0 WHERE offset = ?1",
        params![offset],
    )
    .map_err(sql::sqlite_err)?;
    tx.execute("DELETE FROM refs WHERE tag == ?1", params![tag])
        .map_err(sql::sqlite_err)?;
    Ok(())
}

/// Overlay variant: no (offset, tag) recheck is needed because nothing
/// else contends for the overlay.
fn invalidate_slot_tx(tx: &Transaction, offset: i64) -> Result<(), NexusError> {
    tx.execute(
        "UPDATE temp.slots SET tag = NULL, length = 0, crypto = 0,
         last_access = 0 WHERE offset = ?1",
        params![offset],
    )
    .map_err(sql::sqlite_err)?;
    Ok(())
}
