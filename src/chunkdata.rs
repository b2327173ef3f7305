//! Per-chunk cache entries and their state machine.
//!
//! A device owns a fixed population of cache entries, each reusable for
//! any chunk index. The index -> entry relation is kept in a hash map;
//! entries are referenced by their slot in the arena, never by pointer.
//! All table state is guarded by the device's single table mutex; the
//! scatter buffers and ciphertext staging buffers are only touched by
//! whichever actor the current state designates, with bulk work done
//! outside the lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use log::warn;

use crate::device::DeviceInner;
use crate::error::NexusError;
use crate::keyring::ChunkMeta;
use crate::request::PendingFrag;
use crate::scatter::ScatterBuffer;
use crate::thread::Callback;
use crate::transform::{self, TfmState};

/// States of a cache entry. The discriminants index the per-state
/// statistics arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Entry is free or freshly bound; no data yet.
    Invalid = 0,
    /// Waiting for the keyring answer (tag, key, compression).
    LoadMeta = 1,
    /// Metadata present; the next step is decided here.
    Meta = 2,
    /// Backing-store read in flight.
    LoadData = 3,
    /// Ciphertext in the staging buffer, not yet decrypted.
    Encrypted = 4,
    /// Crypto worker active (decrypt + decompress).
    Decrypting = 5,
    /// Plaintext in the buffer; requests are serviced.
    Valid = 6,
    /// Plaintext modified; needs write-back.
    Dirty = 7,
    /// Re-encrypted, but (tag, key) not yet committed to the keyring.
    DirtyMeta = 8,
    /// Waiting for the keyring update to be accepted.
    StoreMeta = 9,
    /// Backing-store write in flight.
    StoreData = 10,
    /// Terminal failure; requests on this entry fail until eviction.
    Error = 11,
}

impl ChunkState {
    pub fn index(self) -> usize {
        self as usize
    }
}

pub(crate) struct ChunkEntry {
    pub chunk: Option<u64>,
    pub state: ChunkState,
    pub state_since: Instant,
    pub buffer: ScatterBuffer,
    /// Ciphertext staging area: filled by the backing read on the way
    /// in, by the crypto worker on the way out. The plaintext buffer is
    /// untouched during write-back so reads stay serviceable.
    pub cipher_buf: Option<Vec<u8>>,
    pub meta: Option<ChunkMeta>,
    pub dirty: bool,
    pub dirty_meta: bool,
    pub accessed: bool,
    pub error: Option<NexusError>,
    pub reservations: u32,
    pub pending: Vec<PendingFrag>,
    pub io_result: Option<Result<(), NexusError>>,
    /// A GET_META reply from the keeper is outstanding.
    pub awaiting_reply: bool,
    /// Entry sits in the user-pending FIFO.
    pub queued_msg: bool,
    /// Write-back requested by eviction pressure or sync.
    pub writeback: bool,
    /// A crypto callback for this entry is scheduled or running.
    pub crypto_scheduled: bool,
    /// Bumped on every buffer modification, so an encode racing a
    /// write can detect that its snapshot went stale.
    pub write_gen: u64,
}

impl ChunkEntry {
    fn new(chunksize: usize) -> Self {
        Self {
            chunk: None,
            state: ChunkState::Invalid,
            state_since: Instant::now(),
            buffer: ScatterBuffer::new(chunksize),
            cipher_buf: None,
            meta: None,
            dirty: false,
            dirty_meta: false,
            accessed: false,
            error: None,
            reservations: 0,
            pending: Vec::new(),
            io_result: None,
            awaiting_reply: false,
            queued_msg: false,
            writeback: false,
            crypto_scheduled: false,
            write_gen: 0,
        }
    }

    fn reset_binding(&mut self) {
        self.chunk = None;
        self.meta = None;
        self.cipher_buf = None;
        self.dirty = false;
        self.dirty_meta = false;
        self.accessed = false;
        self.error = None;
        self.io_result = None;
        self.awaiting_reply = false;
        self.queued_msg = false;
        self.writeback = false;
        self.crypto_scheduled = false;
    }
}

pub(crate) struct ChunkTable {
    pub entries: Vec<ChunkEntry>,
    pub map: HashMap<u64, usize>,
    /// Bound entries in access order, least recent at the front.
    pub lru: VecDeque<usize>,
    pub free: Vec<usize>,
    /// FIFO of entries awaiting keeper pickup.
    pub user_queue: VecDeque<usize>,
    pub user_shutdown: bool,
    /// Scheduled-but-unfinished worker callbacks and I/O jobs.
    pub pending_work: usize,
}

impl ChunkTable {
    pub fn new(cache_entries: usize, chunksize: usize) -> Self {
        let entries: Vec<ChunkEntry> =
            (0..cache_entries).map(|_| ChunkEntry::new(chunksize)).collect();
        let free = (0..cache_entries).rev().collect();
        Self {
            entries,
            map: HashMap::new(),
            lru: VecDeque::new(),
            free,
            user_queue: VecDeque::new(),
            user_shutdown: false,
            pending_work: 0,
        }
    }
}

/// Timestamped state transition; updates the per-state counters.
pub(crate) fn transition(dev: &DeviceInner, table: &mut ChunkTable, idx: usize, to: ChunkState) {
    let entry = &mut table.entries[idx];
    let from = entry.state;
    let elapsed = entry.state_since.elapsed().as_micros() as u64;
    dev.stats.state_transition(from.index(), to.index(), elapsed);
    entry.state = to;
    entry.state_since = Instant::now();
}

fn lru_touch(table: &mut ChunkTable, idx: usize) {
    table.lru.retain(|&i| i != idx);
    table.lru.push_back(idx);
}

fn lru_remove(table: &mut ChunkTable, idx: usize) {
    table.lru.retain(|&i| i != idx);
}

/// Reserve one entry per fragment, all or nothing. On failure no
/// reservation is retained and the caller parks the request.
pub(crate) fn reserve_chunks(
    dev: &Arc<DeviceInner>,
    table: &mut ChunkTable,
    frags: &[crate::request::IoFrag],
) -> bool {
    let mut taken: Vec<(usize, bool)> = Vec::with_capacity(frags.len());
    let mut hits = 0u64;
    let mut misses = 0u64;

    for frag in frags {
        if let Some(&idx) = table.map.get(&frag.cid) {
            table.entries[idx].reservations += 1;
            lru_touch(table, idx);
            taken.push((idx, false));
            hits += 1;
        } else if let Some(idx) = claim_entry(dev, table, frag.cid) {
            table.entries[idx].reservations = 1;
            taken.push((idx, true));
            misses += 1;
        } else {
            // roll back before any I/O was issued
            for (idx, newly_bound) in taken {
                let entry = &mut table.entries[idx];
                entry.reservations -= 1;
                if newly_bound {
                    let cid = entry.chunk.take();
                    entry.reset_binding();
                    if let Some(cid) = cid {
                        table.map.remove(&cid);
                    }
                    lru_remove(table, idx);
                    table.free.push(idx);
                }
            }
            dev.stats
                .cache_alloc_failures
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return false;
        }
    }

    dev.stats
        .cache_hits
        .fetch_add(hits, std::sync::atomic::Ordering::Relaxed);
    dev.stats
        .cache_misses
        .fetch_add(misses, std::sync::atomic::Ordering::Relaxed);
    true
}

/// Find a free entry, or evict the least-recently-accessed reclaimable
/// one. Unreserved DIRTY entries get their write-back kicked off so
/// they become reclaimable later.
fn claim_entry(dev: &Arc<DeviceInner>, table: &mut ChunkTable, cid: u64) -> Option<usize> {
    if let Some(idx) = table.free.pop() {
        bind_entry(table, idx, cid);
        return Some(idx);
    }

    let mut victim = None;
    let candidates: Vec<usize> = table.lru.iter().cloned().collect();
    for idx in candidates {
        let entry = &table.entries[idx];
        if entry.reservations > 0 {
            continue;
        }
        match entry.state {
            ChunkState::Error | ChunkState::Valid => {
                victim = Some(idx);
                break;
            }
            ChunkState::Dirty => {
                if !table.entries[idx].writeback {
                    table.entries[idx].writeback = true;
                    dev.schedule_callback(table, Callback::UpdateChunk, idx);
                }
            }
            _ => {}
        }
    }

    let idx = victim?;
    let old = table.entries[idx].chunk.take();
    if let Some(old_cid) = old {
        table.map.remove(&old_cid);
    }
    if table.entries[idx].state != ChunkState::Invalid {
        transition(dev, table, idx, ChunkState::Invalid);
    }
    lru_remove(table, idx);
    table.entries[idx].reset_binding();
    bind_entry(table, idx, cid);
    Some(idx)
}

fn bind_entry(table: &mut ChunkTable, idx: usize, cid: u64) {
    table.entries[idx].chunk = Some(cid);
    table.map.insert(cid, idx);
    table.lru.push_back(idx);
}

/// Drop one reservation. An entry whose count reaches zero may satisfy
/// a parked request, so the request queue is kicked. Entries that
/// actually serviced data (ACCESSED) move to the recent end of the LRU;
/// failed ones keep their place and fall out sooner.
pub(crate) fn unreserve_chunk(dev: &Arc<DeviceInner>, table: &mut ChunkTable, idx: usize) {
    let entry = &mut table.entries[idx];
    entry.reservations -= 1;
    if entry.reservations == 0 {
        if entry.accessed {
            entry.accessed = false;
            lru_touch(table, idx);
        }
        dev.retry_parked();
    }
    dev.table_cv.notify_all();
}

/// UPDATE_CHUNK callback: re-examine an entry and push it forward.
pub(crate) fn run_chunk(dev: &Arc<DeviceInner>, idx: usize) {
    let mut table = dev.lock_table();

    if table.entries[idx].chunk.is_none() {
        return; // unbound while the callback was queued
    }

    match table.entries[idx].state {
        ChunkState::Invalid => {
            if table.entries[idx].pending.is_empty() {
                return;
            }
            transition(dev, &mut table, idx, ChunkState::LoadMeta);
            queue_usermsg(dev, &mut table, idx);
        }
        ChunkState::Meta => decide_meta(dev, &mut table, idx),
        ChunkState::Encrypted => {
            transition(dev, &mut table, idx, ChunkState::Decrypting);
            table.entries[idx].crypto_scheduled = true;
            dev.schedule_callback(&mut table, Callback::Crypto, idx);
        }
        ChunkState::Valid
        | ChunkState::Dirty
        | ChunkState::DirtyMeta
        | ChunkState::StoreMeta
        | ChunkState::StoreData => {
            deliver_pending(dev, &mut table, idx);
            if table.entries[idx].state == ChunkState::DirtyMeta {
                // crypto finished; hand the new metadata to the keeper
                transition(dev, &mut table, idx, ChunkState::StoreMeta);
                queue_usermsg(dev, &mut table, idx);
            } else if table.entries[idx].state == ChunkState::Dirty
                && table.entries[idx].writeback
                && !table.entries[idx].crypto_scheduled
            {
                table.entries[idx].crypto_scheduled = true;
                dev.schedule_callback(&mut table, Callback::Crypto, idx);
            }
        }
        ChunkState::Error => {
            let err = table.entries[idx]
                .error
                .clone()
                .unwrap_or(NexusError::IoError("chunk in error state".to_string()));
            fail_pending(dev, &mut table, idx, err);
        }
        // in flight; the completion path will reschedule us
        ChunkState::LoadMeta
        | ChunkState::LoadData
        | ChunkState::Decrypting => {}
    }
}

/// Metadata has arrived; pick the path to VALID.
fn decide_meta(dev: &Arc<DeviceInner>, table: &mut ChunkTable, idx: usize) {
    let chunksize = dev.chunksize() as usize;
    let meta = match table.entries[idx].meta.clone() {
        Some(meta) => meta,
        None => {
            error_entry(dev, table, idx, NexusError::IoError("metadata missing".to_string()));
            return;
        }
    };

    // The read-skip is only safe when nothing pending wants the old
    // contents: every fragment must itself overwrite the whole chunk.
    let whole_write = !table.entries[idx].pending.is_empty()
        && table.entries[idx]
            .pending
            .iter()
            .all(|p| p.io.write && p.frag.offset == 0 && p.frag.len as usize == chunksize);

    if whole_write {
        // the writer supplies every byte; skip the read and decrypt
        dev.stats
            .whole_chunk_updates
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        table.entries[idx].buffer.zero();
        transition(dev, table, idx, ChunkState::Valid);
        deliver_pending(dev, table, idx);
    } else if meta.length == 0 {
        // never written: the chunk reads as zeros, no backing I/O
        dev.stats
            .encrypted_discards
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        table.entries[idx].buffer.zero();
        transition(dev, table, idx, ChunkState::Valid);
        deliver_pending(dev, table, idx);
    } else if meta.length as usize > chunksize {
        error_entry(
            dev,
            table,
            idx,
            NexusError::Corruption(format!(
                "keyring reports ciphertext of {} bytes for a {}-byte chunk",
                meta.length, chunksize
            )),
        );
    } else {
        dev.stats
            .chunk_reads
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        transition(dev, table, idx, ChunkState::LoadData);
        dev.schedule_io(table, idx);
    }
}

/// Service the pending fragments this entry can satisfy in its current
/// state: reads from the plaintext buffer, writes applied in place.
fn deliver_pending(dev: &Arc<DeviceInner>, table: &mut ChunkTable, idx: usize) {
    if table.entries[idx].pending.is_empty() {
        return;
    }
    let pending = std::mem::take(&mut table.entries[idx].pending);
    table.entries[idx].accessed = true;
    let mut wrote = false;

    for p in pending {
        let result = if p.io.write {
            wrote = true;
            table.entries[idx].write_gen += 1;
            p.io.copy_to_buffer(&p.frag, &mut table.entries[idx].buffer)
        } else {
            p.io.copy_from_buffer(&p.frag, &table.entries[idx].buffer)
        };
        p.io.complete_fragment(result.err());
        unreserve_chunk(dev, table, idx);
    }

    if wrote {
        table.entries[idx].dirty = true;
        if table.entries[idx].state == ChunkState::Valid {
            transition(dev, table, idx, ChunkState::Dirty);
        }
    }
    dev.table_cv.notify_all();
}

/// Fail every pending fragment with the entry's error.
pub(crate) fn fail_pending(
    dev: &Arc<DeviceInner>,
    table: &mut ChunkTable,
    idx: usize,
    err: NexusError,
) {
    let pending = std::mem::take(&mut table.entries[idx].pending);
    for p in pending {
        p.io.complete_fragment(Some(err.clone()));
        unreserve_chunk(dev, table, idx);
    }
}

/// Drive the entry into the terminal ERROR state.
pub(crate) fn error_entry(
    dev: &Arc<DeviceInner>,
    table: &mut ChunkTable,
    idx: usize,
    err: NexusError,
) {
    dev.stats
        .chunk_errors
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    if let Some(cid) = table.entries[idx].chunk {
        warn!("chunk {}: entering error state - {}", cid, err);
    }
    {
        let entry = &mut table.entries[idx];
        entry.error = Some(err.clone());
        entry.cipher_buf = None;
        entry.dirty = false;
        entry.dirty_meta = false;
        entry.writeback = false;
        entry.crypto_scheduled = false;
        entry.awaiting_reply = false;
    }
    if table.entries[idx].queued_msg {
        table.user_queue.retain(|&i| i != idx);
        table.entries[idx].queued_msg = false;
    }
    if table.entries[idx].state != ChunkState::Error {
        transition(dev, table, idx, ChunkState::Error);
    }
    fail_pending(dev, table, idx, err);
    dev.retry_parked();
    dev.table_cv.notify_all();
}

fn queue_usermsg(dev: &Arc<DeviceInner>, table: &mut ChunkTable, idx: usize) {
    if table.user_shutdown {
        error_entry(dev, table, idx, NexusError::Shutdown);
        return;
    }
    if !table.entries[idx].queued_msg {
        table.entries[idx].queued_msg = true;
        table.user_queue.push_back(idx);
        dev.usermsg_cv.notify_one();
    }
}

/// COMPLETE_IO callback: a backing-store transfer finished.
pub(crate) fn complete_io(dev: &Arc<DeviceInner>, idx: usize) {
    let mut table = dev.lock_table();

    let result = match table.entries[idx].io_result.take() {
        Some(result) => result,
        None => return, // stale completion
    };

    if dev.is_shutdown() {
        // result intentionally discarded
        return;
    }

    match table.entries[idx].state {
        ChunkState::LoadData => match result {
            Ok(()) => {
                transition(dev, &mut table, idx, ChunkState::Encrypted);
                dev.schedule_callback(&mut table, Callback::UpdateChunk, idx);
            }
            Err(err) => error_entry(dev, &mut table, idx, err),
        },
        ChunkState::StoreData => match result {
            Ok(()) => {
                dev.stats
                    .chunk_writes
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                table.entries[idx].cipher_buf = None;
                if table.entries[idx].dirty {
                    // re-dirtied while the store was in flight
                    table.entries[idx].writeback = true;
                    transition(dev, &mut table, idx, ChunkState::Dirty);
                } else {
                    table.entries[idx].dirty_meta = false;
                    transition(dev, &mut table, idx, ChunkState::Valid);
                    dev.retry_parked();
                }
                dev.schedule_callback(&mut table, Callback::UpdateChunk, idx);
                dev.table_cv.notify_all();
            }
            Err(err) => {
                dev.note_write_error();
                error_entry(dev, &mut table, idx, err);
            }
        },
        ChunkState::Error => {}
        state => {
            warn!("I/O completion in unexpected state {:?}", state);
        }
    }
}

/// CRYPTO callback: run the transform pipeline for this entry on the
/// calling worker's private state.
pub(crate) fn chunk_tfm(ts: &mut TfmState, dev: &Arc<DeviceInner>, idx: usize) {
    let mut table = dev.lock_table();
    match table.entries[idx].state {
        ChunkState::Decrypting => {
            let ciphertext = match table.entries[idx].cipher_buf.take() {
                Some(buf) => buf,
                None => return,
            };
            let meta = match table.entries[idx].meta.clone() {
                Some(meta) => meta,
                None => return,
            };
            let suite = dev.suite();
            let chunksize = dev.chunksize() as usize;
            drop(table);

            let result = transform::decode_chunk(
                suite,
                &ciphertext,
                &meta.key,
                &meta.tag,
                meta.compression,
                chunksize,
            );

            table = dev.lock_table();
            if table.entries[idx].state != ChunkState::Decrypting {
                return;
            }
            table.entries[idx].crypto_scheduled = false;
            let scattered = match result {
                Ok(plaintext) => table.entries[idx].buffer.scatter(&plaintext),
                Err(err) => Err(err),
            };
            match scattered {
                Ok(()) => {
                    transition(dev, &mut table, idx, ChunkState::Valid);
                    dev.schedule_callback(&mut table, Callback::UpdateChunk, idx);
                    dev.table_cv.notify_all();
                }
                Err(err) => error_entry(dev, &mut table, idx, err),
            }
        }
        ChunkState::Dirty => {
            if !table.entries[idx].crypto_scheduled {
                return;
            }
            let suite = dev.suite();
            let chunksize = dev.chunksize() as usize;
            let compress_alg = dev.default_compression();
            loop {
                let gen = table.entries[idx].write_gen;
                let plaintext = match table.entries[idx].buffer.gather(chunksize) {
                    Ok(data) => data,
                    Err(err) => {
                        error_entry(dev, &mut table, idx, err);
                        return;
                    }
                };
                drop(table);

                let encoded = transform::encode_chunk(ts, suite, &plaintext, compress_alg);

                table = dev.lock_table();
                if table.entries[idx].state != ChunkState::Dirty {
                    table.entries[idx].crypto_scheduled = false;
                    return;
                }
                if table.entries[idx].write_gen != gen {
                    continue; // snapshot went stale; encode again
                }
                match encoded {
                    Ok(enc) => {
                        let entry = &mut table.entries[idx];
                        entry.meta = Some(ChunkMeta {
                            length: enc.ciphertext.len() as u32,
                            tag: enc.tag,
                            key: enc.key,
                            compression: enc.compression,
                        });
                        entry.cipher_buf = Some(enc.ciphertext);
                        entry.dirty = false;
                        entry.dirty_meta = true;
                        entry.crypto_scheduled = false;
                        transition(dev, &mut table, idx, ChunkState::DirtyMeta);
                        dev.schedule_callback(&mut table, Callback::UpdateChunk, idx);
                    }
                    Err(err) => error_entry(dev, &mut table, idx, err),
                }
                return;
            }
        }
        _ => {}
    }
}

/// Runs on the I/O submission thread: perform the blocking transfer the
/// entry's state calls for, then hand the result to COMPLETE_IO.
pub(crate) fn execute_io(dev: &Arc<DeviceInner>, idx: usize) {
    let mut table = dev.lock_table();
    match table.entries[idx].state {
        ChunkState::LoadData => {
            let (cid, len) = match (
                table.entries[idx].chunk,
                table.entries[idx].meta.as_ref().map(|m| m.length),
            ) {
                (Some(cid), Some(len)) => (cid, len),
                _ => return,
            };
            drop(table);
            let result = dev.store.read_chunk(cid, len);

            table = dev.lock_table();
            if table.entries[idx].state != ChunkState::LoadData {
                return;
            }
            table.entries[idx].io_result = Some(match result {
                Ok(data) => {
                    table.entries[idx].cipher_buf = Some(data);
                    Ok(())
                }
                Err(err) => Err(err),
            });
            dev.schedule_callback(&mut table, Callback::CompleteIo, idx);
        }
        ChunkState::StoreData => {
            let (cid, data) = match (
                table.entries[idx].chunk,
                table.entries[idx].cipher_buf.clone(),
            ) {
                (Some(cid), Some(data)) => (cid, data),
                _ => return,
            };
            drop(table);
            let result = dev.store.write_chunk(cid, &data);

            table = dev.lock_table();
            if table.entries[idx].state != ChunkState::StoreData {
                return;
            }
            table.entries[idx].io_result = Some(result);
            dev.schedule_callback(&mut table, Callback::CompleteIo, idx);
        }
        _ => {}
    }
}
