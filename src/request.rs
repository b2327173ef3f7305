//! Request coalescing: maps block-layer requests onto per-chunk cache
//! operations and aggregates their completions.
//!
//! A single request thread processes the per-device request lists, so a
//! reservation failure can park a request and later retry it at the
//! head of its queue without reordering anything within the device.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::chunkdata;
use crate::device::DeviceInner;
use crate::error::NexusError;
use crate::scatter::{ScatterBuffer, PAGE_SIZE};
use crate::thread::Callback;

/// Most memory segments one request may carry.
pub const MAX_SEGS_PER_IO: usize = 32;
/// Most chunks one request may span.
pub const MAX_CHUNKS_PER_IO: usize = 32;

/// A block-layer request: a contiguous sector range plus the ordered
/// list of memory segments backing it. Segment boundaries never cross
/// page boundaries.
pub struct BlockRequest {
    pub sector: u64,
    pub write: bool,
    pub segments: Vec<Vec<u8>>,
}

impl BlockRequest {
    pub fn byte_len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }
}

/// Completion handed back through the channel returned by `submit`.
pub struct CompletedRequest {
    pub sector: u64,
    pub write: bool,
    pub segments: Vec<Vec<u8>>,
    pub result: Result<(), NexusError>,
}

/// One chunk's share of a request.
#[derive(Debug, Clone)]
pub(crate) struct IoFrag {
    pub cid: u64,
    /// Byte offset into the chunk.
    pub offset: u32,
    /// Byte length within the chunk.
    pub len: u32,
    /// Byte offset into the flattened segment list.
    pub orig_offset: u32,
}

pub(crate) struct PendingFrag {
    pub io: Arc<IoShared>,
    pub frag: IoFrag,
}

struct IoState {
    segments: Vec<Vec<u8>>,
    remaining: u32,
    error: Option<NexusError>,
    done: Option<Sender<CompletedRequest>>,
}

/// Shared in-flight request state; fragments complete from worker
/// threads in any order.
pub(crate) struct IoShared {
    pub write: bool,
    pub sector: u64,
    state: Mutex<IoState>,
}

impl IoShared {
    /// Copy plaintext from the chunk buffer into the request segments.
    pub fn copy_from_buffer(
        &self,
        frag: &IoFrag,
        buffer: &ScatterBuffer,
    ) -> Result<(), NexusError> {
        let mut state = self.state.lock().unwrap();
        let mut seg_pos = frag.orig_offset as usize;
        let mut chunk_pos = frag.offset as usize;
        let mut remaining = frag.len as usize;
        while remaining > 0 {
            let (seg, off) = seek_segment(&state.segments, seg_pos)?;
            let n = remaining.min(state.segments[seg].len() - off);
            buffer.copy_out(chunk_pos, &mut state.segments[seg][off..off + n])?;
            seg_pos += n;
            chunk_pos += n;
            remaining -= n;
        }
        Ok(())
    }

    /// Copy request segments into the chunk buffer (a write overlay).
    pub fn copy_to_buffer(
        &self,
        frag: &IoFrag,
        buffer: &mut ScatterBuffer,
    ) -> Result<(), NexusError> {
        let state = self.state.lock().unwrap();
        let mut seg_pos = frag.orig_offset as usize;
        let mut chunk_pos = frag.offset as usize;
        let mut remaining = frag.len as usize;
        while remaining > 0 {
            let (seg, off) = seek_segment(&state.segments, seg_pos)?;
            let n = remaining.min(state.segments[seg].len() - off);
            buffer.copy_in(chunk_pos, &state.segments[seg][off..off + n])?;
            seg_pos += n;
            chunk_pos += n;
            remaining -= n;
        }
        Ok(())
    }

    /// Record one fragment's completion; the last one completes the
    /// request with the most severe error seen.
    pub fn complete_fragment(&self, error: Option<NexusError>) {
        let mut state = self.state.lock().unwrap();
        if state.remaining == 0 {
            return; // request already aborted
        }
        state.error = NexusError::merge(state.error.take(), error);
        state.remaining -= 1;
        if state.remaining == 0 {
            let segments = std::mem::take(&mut state.segments);
            let result = match state.error.take() {
                Some(err) => Err(err),
                None => Ok(()),
            };
            if let Some(done) = state.done.take() {
                let _ = done.send(CompletedRequest {
                    sector: self.sector,
                    write: self.write,
                    segments,
                    result,
                });
            }
        }
    }

    /// Fail the whole request regardless of fragment progress (device
    /// shutdown path).
    pub fn abort(&self, err: NexusError) {
        let mut state = self.state.lock().unwrap();
        let segments = std::mem::take(&mut state.segments);
        state.remaining = 0;
        if let Some(done) = state.done.take() {
            let _ = done.send(CompletedRequest {
                sector: self.sector,
                write: self.write,
                segments,
                result: Err(err),
            });
        }
    }
}

fn seek_segment(segments: &[Vec<u8>], pos: usize) -> Result<(usize, usize), NexusError> {
    let mut skipped = 0;
    for (i, seg) in segments.iter().enumerate() {
        if pos < skipped + seg.len() {
            return Ok((i, pos - skipped));
        }
        skipped += seg.len();
    }
    Err(NexusError::BadInput(format!(
        "segment offset {} beyond request length {}",
        pos, skipped
    )))
}

/// A request parsed, validated and ready for reservation.
pub(crate) struct PendingRequest {
    pub io: Arc<IoShared>,
    pub frags: Vec<IoFrag>,
}

pub(crate) struct RequestQueue {
    pub queue: std::collections::VecDeque<PendingRequest>,
    /// The head request failed to reserve and awaits a reservable
    /// transition.
    pub parked: bool,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            queue: std::collections::VecDeque::new(),
            parked: false,
        }
    }
}

/// Split a request into per-chunk fragments and validate the §6 bounds.
pub(crate) fn build_request(
    dev: &DeviceInner,
    req: BlockRequest,
) -> Result<(PendingRequest, Receiver<CompletedRequest>), NexusError> {
    let chunk_sectors = dev.store.chunk_sectors();
    let chunksize = dev.chunksize() as u64;
    let byte_len = req.byte_len() as u64;

    if req.segments.is_empty() || req.segments.len() > MAX_SEGS_PER_IO {
        return Err(NexusError::BadInput(format!(
            "request must have 1..={} segments",
            MAX_SEGS_PER_IO
        )));
    }
    if req.segments.iter().any(|s| s.is_empty() || s.len() > PAGE_SIZE) {
        return Err(NexusError::BadInput(
            "request segments must be 1..=PAGE_SIZE bytes".to_string(),
        ));
    }
    if byte_len % crate::chunkstore::SECTOR_SIZE != 0 {
        return Err(NexusError::BadInput(
            "request length is not sector-aligned".to_string(),
        ));
    }
    let nr_sectors = byte_len / crate::chunkstore::SECTOR_SIZE;
    if nr_sectors == 0 || nr_sectors > chunk_sectors * (MAX_CHUNKS_PER_IO as u64 - 1) {
        return Err(NexusError::BadInput(format!(
            "request of {} sectors out of bounds",
            nr_sectors
        )));
    }
    let dev_sectors = dev.chunk_count() * chunk_sectors;
    if req.sector.checked_add(nr_sectors).map_or(true, |end| end > dev_sectors) {
        return Err(NexusError::BadInput(format!(
            "sector range {}+{} beyond device capacity {}",
            req.sector, nr_sectors, dev_sectors
        )));
    }

    let first_cid = req.sector / chunk_sectors;
    let last_cid = (req.sector + nr_sectors - 1) / chunk_sectors;

    let mut frags = Vec::with_capacity((last_cid - first_cid + 1) as usize);
    let mut orig_offset = 0u64;
    let mut sector = req.sector;
    let mut remaining = byte_len;
    for cid in first_cid..=last_cid {
        let offset = (sector - cid * chunk_sectors) * crate::chunkstore::SECTOR_SIZE;
        let len = remaining.min(chunksize - offset);
        frags.push(IoFrag {
            cid,
            offset: offset as u32,
            len: len as u32,
            orig_offset: orig_offset as u32,
        });
        orig_offset += len;
        sector += len / crate::chunkstore::SECTOR_SIZE;
        remaining -= len;
    }

    let (tx, rx) = bounded(1);
    let io = Arc::new(IoShared {
        write: req.write,
        sector: req.sector,
        state: Mutex::new(IoState {
            segments: req.segments,
            remaining: frags.len() as u32,
            error: None,
            done: Some(tx),
        }),
    });

    if req.write {
        dev.stats
            .sectors_written
            .fetch_add(nr_sectors, std::sync::atomic::Ordering::Relaxed);
    } else {
        dev.stats
            .sectors_read
            .fetch_add(nr_sectors, std::sync::atomic::Ordering::Relaxed);
    }

    Ok((PendingRequest { io, frags }, rx))
}

/// Runs on the singleton request thread: drain this device's request
/// list in order, reserving cache entries for each request and handing
/// its fragments to the state machine.
pub(crate) fn run_requests(dev: &Arc<DeviceInner>) {
    loop {
        let pending = {
            let mut queue = dev.requests.lock().unwrap();
            match queue.queue.pop_front() {
                Some(pending) => pending,
                None => return,
            }
        };

        if dev.is_shutdown() {
            pending.io.abort(NexusError::Shutdown);
            continue;
        }

        let mut table = dev.lock_table();
        if !chunkdata::reserve_chunks(dev, &mut table, &pending.frags) {
            // park at the head; retried on the next reservable transition
            let mut queue = dev.requests.lock().unwrap();
            queue.queue.push_front(pending);
            queue.parked = true;
            return;
        }

        for frag in &pending.frags {
            let idx = match table.map.get(&frag.cid) {
                Some(&idx) => idx,
                None => continue, // cannot happen after a successful reserve
            };
            table.entries[idx].pending.push(PendingFrag {
                io: pending.io.clone(),
                frag: frag.clone(),
            });
            dev.schedule_callback(&mut table, Callback::UpdateChunk, idx);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seek_segment_walks_boundaries() {
        let segs = vec![vec![0u8; 512], vec![0u8; 1024], vec![0u8; 512]];
        assert_eq!(seek_segment(&segs, 0).unwrap(), (0, 0));
        assert_eq!(seek_segment(&segs, 511).unwrap(), (0, 511));
        assert_eq!(seek_segment(&segs, 512).unwrap(), (1, 0));
        assert_eq!(seek_segment(&segs, 1536).unwrap(), (2, 0));
        assert!(seek_segment(&segs, 2048).is_err());
    }
}
