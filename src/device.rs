//! Device construction, teardown and the public block-device surface.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crossbeam_channel::Receiver;
use lazy_static::lazy_static;
use log::info;
use serde::{Deserialize, Serialize};

use crate::chunkdata::{self, ChunkState, ChunkTable};
use crate::chunkstore::{ChunkStore, SECTOR_SIZE};
use crate::error::NexusError;
use crate::request::{self, BlockRequest, CompletedRequest, RequestQueue, MAX_CHUNKS_PER_IO};
use crate::scatter::PAGE_SIZE;
use crate::stats::{DeviceStats, StatsSnapshot};
use crate::thread::{Callback, WorkItem, WorkerPool};
use crate::tools;
use crate::transform::{self, Compression, CryptoSuite};
use crate::usermsg::{self, UserMessage, UserReply};

/// Largest supported chunk size.
pub const MAX_CHUNKSIZE: u32 = 1 << 20;
/// The cache must be able to hold this many whole requests at once.
pub const MIN_CONCURRENT_REQS: usize = 2;
/// Smallest permitted cache-entry count.
pub const MIN_CACHE_ENTRIES: usize = MIN_CONCURRENT_REQS * MAX_CHUNKS_PER_IO;

// Allocation caps: no device may take more than 1/10 of RAM, and all
// devices together may not take more than 3/10.
const MAX_DEV_ALLOCATION_MULT: u64 = 1;
const MAX_DEV_ALLOCATION_DIV: u64 = 10;
const MAX_ALLOCATION_MULT: u64 = 3;
const MAX_ALLOCATION_DIV: u64 = 10;

lazy_static! {
    /// Pages allocated to chunk caches across all devices.
    static ref CACHE_PAGES: Mutex<u64> = Mutex::new(0);
}

/// Immutable device attributes, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub backing_path: PathBuf,
    pub chunksize: u32,
    pub cache_entries: usize,
    /// Sectors into the backing store where chunk 0 begins.
    pub offset: u64,
    pub suite: CryptoSuite,
    pub default_compression: Compression,
    pub supported_compression: u32,
}

impl DeviceConfig {
    /// Read a device description from its JSON config file.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, NexusError> {
        let data = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            NexusError::IoError(format!("unable to read {:?} - {}", path.as_ref(), err))
        })?;
        serde_json::from_str(&data)
            .map_err(|err| NexusError::BadInput(format!("unable to parse device config - {}", err)))
    }

    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), NexusError> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|err| NexusError::BadInput(format!("unable to encode device config - {}", err)))?;
        std::fs::write(path.as_ref(), data).map_err(|err| {
            NexusError::IoError(format!("unable to write {:?} - {}", path.as_ref(), err))
        })
    }
}

pub(crate) struct DeviceInner {
    pub config: DeviceConfig,
    pub store: ChunkStore,
    pub stats: DeviceStats,
    pub pool: Arc<WorkerPool>,
    pub table: Mutex<ChunkTable>,
    pub table_cv: Condvar,
    pub usermsg_cv: Condvar,
    pub requests: Mutex<RequestQueue>,
    shutdown: AtomicBool,
    user_gone: AtomicBool,
    write_error: AtomicBool,
    need_user: Mutex<u32>,
    cache_pages: u64,
}

impl DeviceInner {
    pub fn lock_table(&self) -> MutexGuard<'_, ChunkTable> {
        self.table.lock().unwrap()
    }

    pub fn chunksize(&self) -> u32 {
        self.config.chunksize
    }

    pub fn chunk_count(&self) -> u64 {
        self.store.chunk_count()
    }

    pub fn suite(&self) -> CryptoSuite {
        self.config.suite
    }

    pub fn default_compression(&self) -> Compression {
        self.config.default_compression
    }

    pub fn supported_compression(&self) -> u32 {
        self.config.supported_compression
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_user_gone(&self) -> bool {
        self.user_gone.load(Ordering::SeqCst)
    }

    pub fn note_write_error(&self) {
        self.write_error.store(true, Ordering::SeqCst);
    }

    pub(crate) fn schedule_callback(
        self: &Arc<Self>,
        table: &mut ChunkTable,
        cb: Callback,
        entry: usize,
    ) {
        table.pending_work += 1;
        self.pool.schedule(
            cb,
            WorkItem {
                dev: self.clone(),
                entry,
            },
        );
    }

    pub(crate) fn schedule_io(self: &Arc<Self>, table: &mut ChunkTable, entry: usize) {
        table.pending_work += 1;
        self.pool.schedule_io(WorkItem {
            dev: self.clone(),
            entry,
        });
    }

    /// Bookkeeping after a worker or I/O callback finishes.
    pub(crate) fn finish_work(self: &Arc<Self>) {
        let mut table = self.lock_table();
        table.pending_work -= 1;
        if table.pending_work == 0 {
            self.table_cv.notify_all();
        }
    }

    /// Wake the request thread if a request is parked waiting for a
    /// reservable entry. Called with the table lock held.
    pub(crate) fn retry_parked(self: &Arc<Self>) {
        let mut queue = self.requests.lock().unwrap();
        if queue.parked {
            queue.parked = false;
            self.pool.schedule_request(self.clone());
        }
    }

    pub(crate) fn wait_usermsg<'a>(
        &self,
        guard: MutexGuard<'a, ChunkTable>,
    ) -> MutexGuard<'a, ChunkTable> {
        self.usermsg_cv.wait(guard).unwrap()
    }

    pub(crate) fn notify_usermsg_all(&self) {
        self.usermsg_cv.notify_all();
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let mut total = CACHE_PAGES.lock().unwrap();
        *total -= self.cache_pages;
        self.pool.unregister_compress(self.config.supported_compression);
    }
}

/// A convergently-encrypting virtual block device over a chunk store.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Validate the configuration and build the device: open the
    /// backing store, account the cache against the RAM caps, register
    /// transforms and allocate the entry table.
    pub fn new(config: DeviceConfig, pool: Arc<WorkerPool>) -> Result<Self, NexusError> {
        if config.chunksize < 512 || !config.chunksize.is_power_of_two() {
            return Err(NexusError::BadInput(
                "chunk size must be >= 512 and a power of 2".to_string(),
            ));
        }
        if config.chunksize > MAX_CHUNKSIZE {
            return Err(NexusError::BadInput(format!(
                "chunk size exceeds configured maximum of {}",
                MAX_CHUNKSIZE
            )));
        }
        if config.cache_entries < MIN_CACHE_ENTRIES {
            return Err(NexusError::BadInput(format!(
                "cache size may not be smaller than {}",
                MIN_CACHE_ENTRIES
            )));
        }
        transform::validate_transforms(config.default_compression, config.supported_compression)?;

        let pages = tools::system_page_count();
        let chunk_pages = ((config.chunksize as u64) + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;
        let cache_pages = config.cache_entries as u64 * chunk_pages;
        if cache_pages > pages * MAX_DEV_ALLOCATION_MULT / MAX_DEV_ALLOCATION_DIV {
            return Err(NexusError::ResourceExhausted(format!(
                "cache size may not be larger than {}/{} of system RAM",
                MAX_DEV_ALLOCATION_MULT, MAX_DEV_ALLOCATION_DIV
            )));
        }
        {
            let mut total = CACHE_PAGES.lock().unwrap();
            if *total + cache_pages > pages * MAX_ALLOCATION_MULT / MAX_ALLOCATION_DIV {
                return Err(NexusError::ResourceExhausted(format!(
                    "will not allocate more than {}/{} of system RAM for cache",
                    MAX_ALLOCATION_MULT, MAX_ALLOCATION_DIV
                )));
            }
            *total += cache_pages;
        }

        let store = match ChunkStore::open(&config.backing_path, config.chunksize, config.offset) {
            Ok(store) => store,
            Err(err) => {
                *CACHE_PAGES.lock().unwrap() -= cache_pages;
                return Err(err);
            }
        };
        if store.chunk_count() == 0 {
            *CACHE_PAGES.lock().unwrap() -= cache_pages;
            return Err(NexusError::BadInput(
                "backing store too small for a single chunk".to_string(),
            ));
        }

        pool.register_compress(config.supported_compression);

        let stats = DeviceStats::default();
        for _ in 0..config.cache_entries {
            stats.state_entered(ChunkState::Invalid.index());
        }
        let table = ChunkTable::new(config.cache_entries, config.chunksize as usize);

        info!(
            "device over {:?}: chunksize {}, {} chunks, {} cache entries, suite {}",
            config.backing_path,
            config.chunksize,
            store.chunk_count(),
            config.cache_entries,
            config.suite.name()
        );

        Ok(Self {
            inner: Arc::new(DeviceInner {
                cache_pages,
                store,
                stats,
                pool,
                table: Mutex::new(table),
                table_cv: Condvar::new(),
                usermsg_cv: Condvar::new(),
                requests: Mutex::new(RequestQueue::new()),
                shutdown: AtomicBool::new(false),
                user_gone: AtomicBool::new(false),
                write_error: AtomicBool::new(false),
                need_user: Mutex::new(0),
                config,
            }),
        })
    }

    pub fn chunksize(&self) -> u32 {
        self.inner.chunksize()
    }

    pub fn chunk_count(&self) -> u64 {
        self.inner.chunk_count()
    }

    pub fn sector_count(&self) -> u64 {
        self.inner.chunk_count() * self.inner.store.chunk_sectors()
    }

    pub fn suite(&self) -> CryptoSuite {
        self.inner.suite()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// A backing-store write has failed since construction; the keeper
    /// uses this to raise the persistent damaged flag.
    pub fn write_errors(&self) -> bool {
        self.inner.write_error.load(Ordering::SeqCst)
    }

    /// Handle an open() of the block device node.
    pub fn open(&self) -> Result<(), NexusError> {
        if self.inner.is_shutdown() {
            return Err(NexusError::Shutdown);
        }
        let mut users = self.inner.need_user.lock().unwrap();
        *users += 1;
        Ok(())
    }

    /// Handle a close(); always paired with `open`.
    pub fn close(&self) {
        let mut users = self.inner.need_user.lock().unwrap();
        if *users > 0 {
            *users -= 1;
        }
    }

    /// Submit a block request. The returned channel delivers the
    /// completion; for writes it fires once the data is in the cache
    /// and the entry is marked dirty, not after write-back.
    pub fn submit(&self, req: BlockRequest) -> Result<Receiver<CompletedRequest>, NexusError> {
        if self.inner.is_shutdown() || self.inner.is_user_gone() {
            return Err(NexusError::Shutdown);
        }
        let (pending, rx) = request::build_request(&self.inner, req)?;
        {
            let mut queue = self.inner.requests.lock().unwrap();
            queue.queue.push_back(pending);
        }
        self.inner.pool.schedule_request(self.inner.clone());
        Ok(rx)
    }

    /// Convenience synchronous read of a sector range.
    pub fn read(&self, sector: u64, byte_len: usize) -> Result<Vec<u8>, NexusError> {
        let segments = make_segments(byte_len)?;
        let rx = self.submit(BlockRequest {
            sector,
            write: false,
            segments,
        })?;
        let completed = rx
            .recv()
            .map_err(|_| NexusError::Shutdown)?;
        completed.result?;
        let mut out = Vec::with_capacity(byte_len);
        for seg in completed.segments {
            out.extend_from_slice(&seg);
        }
        Ok(out)
    }

    /// Convenience synchronous write of a sector range.
    pub fn write(&self, sector: u64, data: &[u8]) -> Result<(), NexusError> {
        let mut segments = make_segments(data.len())?;
        let mut pos = 0;
        for seg in segments.iter_mut() {
            let n = seg.len();
            seg.copy_from_slice(&data[pos..pos + n]);
            pos += n;
        }
        let rx = self.submit(BlockRequest {
            sector,
            write: true,
            segments,
        })?;
        rx.recv().map_err(|_| NexusError::Shutdown)?.result
    }

    /// Block until every dirty chunk has completed write-back, then
    /// flush the backing store. This is the explicit durability point.
    pub fn sync(&self) -> Result<(), NexusError> {
        let inner = &self.inner;
        let mut table = inner.lock_table();
        for idx in 0..table.entries.len() {
            if table.entries[idx].state == ChunkState::Dirty && !table.entries[idx].writeback {
                table.entries[idx].writeback = true;
                inner.schedule_callback(&mut table, Callback::UpdateChunk, idx);
            }
        }
        loop {
            if inner.is_shutdown() {
                return Err(NexusError::Shutdown);
            }
            let busy = table.entries.iter().any(|e| {
                e.dirty
                    || e.dirty_meta
                    || matches!(
                        e.state,
                        ChunkState::Dirty
                            | ChunkState::DirtyMeta
                            | ChunkState::StoreMeta
                            | ChunkState::StoreData
                    )
            });
            if !busy {
                break;
            }
            table = inner.table_cv.wait(table).unwrap();
        }
        drop(table);
        inner.store.sync()
    }

    /// Tear the device down. Refused while the block device has open
    /// handles unless forced. Parked requests fail with `Shutdown`,
    /// in-flight user messages are failed, and the call returns once
    /// active workers have drained. In-flight backing I/O is not
    /// cancelled; its result is discarded.
    pub fn shutdown(&self, force: bool) -> Result<(), NexusError> {
        {
            let users = self.inner.need_user.lock().unwrap();
            if *users > 0 && !force {
                return Err(NexusError::Busy);
            }
        }
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(()); // already down
        }

        let drained: Vec<_> = {
            let mut queue = self.inner.requests.lock().unwrap();
            queue.parked = false;
            queue.queue.drain(..).collect()
        };
        for pending in drained {
            pending.io.abort(NexusError::Shutdown);
        }

        let mut table = self.inner.lock_table();
        usermsg::shutdown_usermsg(&self.inner, &mut table, NexusError::Shutdown);
        for idx in 0..table.entries.len() {
            if !table.entries[idx].pending.is_empty() {
                chunkdata::fail_pending(&self.inner, &mut table, idx, NexusError::Shutdown);
            }
        }
        while table.pending_work > 0 {
            table = self.inner.table_cv.wait(table).unwrap();
        }
        Ok(())
    }

    // --- user-message channel endpoint, used by the keeper ---

    /// Blocking: return the next pending message.
    pub fn next_message(&self) -> Result<UserMessage, NexusError> {
        usermsg::next_message(&self.inner)
    }

    /// Submit a keeper reply, matched to its chunk by index.
    pub fn submit_reply(&self, reply: UserReply) -> Result<(), NexusError> {
        usermsg::submit_reply(&self.inner, reply)
    }

    /// The keeper has disappeared. Without metadata resolution the
    /// device cannot make progress: everything awaiting a keyring
    /// answer fails, and new requests are refused with `Shutdown`.
    pub fn close_user_channel(&self) {
        if self.inner.user_gone.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut table = self.inner.lock_table();
        usermsg::shutdown_usermsg(&self.inner, &mut table, NexusError::UserGone);
    }
}

fn make_segments(byte_len: usize) -> Result<Vec<Vec<u8>>, NexusError> {
    if byte_len == 0 || byte_len % SECTOR_SIZE as usize != 0 {
        return Err(NexusError::BadInput(
            "transfer length must be a positive multiple of the sector size".to_string(),
        ));
    }
    let mut segments = Vec::with_capacity((byte_len + PAGE_SIZE - 1) / PAGE_SIZE);
    let mut remaining = byte_len;
    while remaining > 0 {
        let n = remaining.min(PAGE_SIZE);
        segments.push(vec![0u8; n]);
        remaining -= n;
    }
    Ok(segments)
}
