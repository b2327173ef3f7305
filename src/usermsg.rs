//! The user-message channel: an ordered, typed exchange between the
//! device core and the keeper process.
//!
//! Requests are delivered to the keeper in enqueue order. GET_META
//! replies may come back in any order and are matched by chunk index;
//! a reply for a chunk that has meanwhile left the pending state is
//! discarded with a warning. UPDATE_META is acknowledged implicitly:
//! once the keeper has picked the message up, the store proceeds.

use std::sync::Arc;

use log::warn;

use crate::chunkdata::{self, ChunkState, ChunkTable};
use crate::device::DeviceInner;
use crate::error::NexusError;
use crate::keyring::ChunkMeta;
use crate::thread::Callback;
use crate::transform;

/// Message from the device core to the keeper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserMessage {
    /// The core needs this chunk's (tag, key, compression, length).
    GetMeta { chunk: u64 },
    /// A write-back produced new metadata; persist it.
    UpdateMeta { chunk: u64, meta: ChunkMeta },
}

/// Keeper's answer to a GET_META.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserReply {
    SetMeta { chunk: u64, meta: ChunkMeta },
    MetaErr { chunk: u64 },
}

/// Block until a message is pending, then deliver it. Returns
/// `Shutdown` once the device is being torn down.
pub(crate) fn next_message(dev: &Arc<DeviceInner>) -> Result<UserMessage, NexusError> {
    let mut table = dev.lock_table();
    loop {
        if table.user_shutdown {
            return Err(NexusError::Shutdown);
        }
        while let Some(idx) = table.user_queue.pop_front() {
            table.entries[idx].queued_msg = false;
            let chunk = match table.entries[idx].chunk {
                Some(chunk) => chunk,
                None => continue,
            };
            match table.entries[idx].state {
                ChunkState::LoadMeta => {
                    table.entries[idx].awaiting_reply = true;
                    return Ok(UserMessage::GetMeta { chunk });
                }
                ChunkState::StoreMeta => {
                    let meta = match table.entries[idx].meta.clone() {
                        Some(meta) => meta,
                        None => {
                            chunkdata::error_entry(
                                dev,
                                &mut table,
                                idx,
                                NexusError::IoError("write-back lost its metadata".to_string()),
                            );
                            continue;
                        }
                    };
                    // implicit ack: the keeper has the update in hand
                    chunkdata::transition(dev, &mut table, idx, ChunkState::StoreData);
                    dev.schedule_io(&mut table, idx);
                    return Ok(UserMessage::UpdateMeta { chunk, meta });
                }
                state => {
                    warn!(
                        "discarding queued user message for chunk {} in state {:?}",
                        chunk, state
                    );
                }
            }
        }
        table = dev.wait_usermsg(table);
    }
}

/// Hand a keeper reply back to the state machine.
pub(crate) fn submit_reply(dev: &Arc<DeviceInner>, reply: UserReply) -> Result<(), NexusError> {
    let chunk = match &reply {
        UserReply::SetMeta { chunk, .. } | UserReply::MetaErr { chunk } => *chunk,
    };

    let mut table = dev.lock_table();
    let idx = match table.map.get(&chunk) {
        Some(&idx) => idx,
        None => {
            warn!("discarding reply for chunk {} with no cache entry", chunk);
            return Ok(());
        }
    };
    if table.entries[idx].state != ChunkState::LoadMeta || !table.entries[idx].awaiting_reply {
        warn!("discarding reply for chunk {} that is no longer pending", chunk);
        return Ok(());
    }
    table.entries[idx].awaiting_reply = false;

    match reply {
        UserReply::SetMeta { meta, .. } => {
            if let Err(err) = validate_meta(dev, &meta) {
                chunkdata::error_entry(dev, &mut table, idx, err);
                return Ok(());
            }
            table.entries[idx].meta = Some(meta);
            chunkdata::transition(dev, &mut table, idx, ChunkState::Meta);
            dev.schedule_callback(&mut table, Callback::UpdateChunk, idx);
        }
        UserReply::MetaErr { .. } => {
            chunkdata::error_entry(dev, &mut table, idx, NexusError::NotFound(chunk));
        }
    }
    Ok(())
}

fn validate_meta(dev: &DeviceInner, meta: &ChunkMeta) -> Result<(), NexusError> {
    let hash_len = dev.suite().hash_len();
    if meta.tag.len() != hash_len || meta.key.len() != hash_len {
        return Err(NexusError::BadInput(format!(
            "tag and key must be {} bytes",
            hash_len
        )));
    }
    if meta.length as u64 > dev.chunksize() as u64 {
        return Err(NexusError::Corruption(format!(
            "ciphertext length {} exceeds chunk size",
            meta.length
        )));
    }
    if meta.length > 0
        && !transform::compression_type_ok(dev.supported_compression(), meta.compression)
    {
        return Err(NexusError::BadInput(format!(
            "compression type {} not accepted by this device",
            meta.compression.name()
        )));
    }
    Ok(())
}

/// Fail every in-flight user exchange with `err`; called with the
/// table lock held, on device shutdown (`Shutdown`) or when the keeper
/// disappears (`UserGone`).
pub(crate) fn shutdown_usermsg(dev: &Arc<DeviceInner>, table: &mut ChunkTable, err: NexusError) {
    table.user_shutdown = true;
    table.user_queue.clear();
    for idx in 0..table.entries.len() {
        let failing = table.entries[idx].queued_msg
            || table.entries[idx].awaiting_reply
            || matches!(
                table.entries[idx].state,
                ChunkState::LoadMeta | ChunkState::StoreMeta
            );
        if failing {
            table.entries[idx].queued_msg = false;
            chunkdata::error_entry(dev, table, idx, err.clone());
        }
    }
    dev.notify_usermsg_all();
}
