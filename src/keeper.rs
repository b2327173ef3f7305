//! The keeper: the user-space peer of the device core.
//!
//! It owns the keyring and services the user-message channel: GET_META
//! lookups are answered from the keyring, UPDATE_META write-backs are
//! persisted into it. It also bridges the local store into the shared
//! hoard cache when a parcel's modified chunks are collected for
//! upload.

use log::{info, warn};

use crate::chunkstore::ChunkStore;
use crate::device::Device;
use crate::error::NexusError;
use crate::hoard::Hoard;
use crate::keyring::{ChunkMeta, KeyringStore};
use crate::tools::format_tag;
use crate::transform::{digest, Compression};
use crate::usermsg::{UserMessage, UserReply};

pub struct Keeper {
    device: Device,
    keyring: KeyringStore,
    hoard: Option<Hoard>,
}

impl Keeper {
    pub fn new(device: Device, keyring: KeyringStore) -> Self {
        Self {
            device,
            keyring,
            hoard: None,
        }
    }

    pub fn with_hoard(device: Device, keyring: KeyringStore, hoard: Hoard) -> Self {
        Self {
            device,
            keyring,
            hoard: Some(hoard),
        }
    }

    /// Service the user-message channel until the device shuts down.
    /// Every metadata update marks the cache dirty; a backing-store
    /// write failure observed by the device raises the damaged flag.
    pub fn run(&mut self) -> Result<(), NexusError> {
        let hash_len = self.device.suite().hash_len();
        let mut marked_dirty = false;

        loop {
            let message = match self.device.next_message() {
                Ok(message) => message,
                Err(NexusError::Shutdown) => break,
                Err(err) => return Err(err),
            };
            match message {
                UserMessage::GetMeta { chunk } => {
                    let reply = match self.keyring.get(chunk) {
                        Ok(Some(meta)) => UserReply::SetMeta { chunk, meta },
                        Ok(None) => UserReply::SetMeta {
                            chunk,
                            // never written: zero length reads as zeros
                            meta: ChunkMeta {
                                tag: vec![0u8; hash_len],
                                key: vec![0u8; hash_len],
                                compression: Compression::None,
                                length: 0,
                            },
                        },
                        Err(err) => {
                            warn!("keyring lookup for chunk {} failed - {}", chunk, err);
                            UserReply::MetaErr { chunk }
                        }
                    };
                    self.device.submit_reply(reply)?;
                }
                UserMessage::UpdateMeta { chunk, meta } => {
                    if !marked_dirty {
                        if let Err(err) = self.keyring.set_dirty(true) {
                            warn!("couldn't mark cache dirty - {}", err);
                        }
                        marked_dirty = true;
                    }
                    if let Err(err) = self.keyring.put(chunk, &meta) {
                        // the entry already stored its data; all we can
                        // do is refuse future uploads
                        warn!("keyring update for chunk {} failed - {}", chunk, err);
                        let _ = self.keyring.set_damaged(true);
                    }
                }
            }
        }

        if self.device.write_errors() {
            self.keyring.set_damaged(true)?;
        }
        Ok(())
    }

    pub fn keyring(&self) -> &KeyringStore {
        &self.keyring
    }

    pub fn keyring_mut(&mut self) -> &mut KeyringStore {
        &mut self.keyring
    }

    pub fn hoard_mut(&mut self) -> Option<&mut Hoard> {
        self.hoard.as_mut()
    }

    /// Reconcile the hoard's references for this parcel with the tags
    /// currently in the keyring.
    pub fn sync_hoard_refs(&mut self) -> Result<(), NexusError> {
        let hoard = match self.hoard.as_mut() {
            Some(hoard) => hoard,
            None => return Ok(()),
        };
        let mut live = Vec::new();
        let chunk_count = self.keyring.chunk_count();
        self.keyring
            .iterate_range(0, chunk_count, |_, meta| {
                if meta.length > 0 {
                    live.push(meta.tag.clone());
                }
            })?;
        live.sort();
        live.dedup();
        hoard.sync_refs(&live)
    }

    /// Copy every written chunk's ciphertext into the hoard, verifying
    /// each tag on the way. Must run while the device is quiesced
    /// (after sync or shutdown). Tag mismatches mark the cache damaged
    /// and abort, since uploads of corrupt data must be prevented.
    pub fn copy_to_hoard(&mut self, store: &ChunkStore) -> Result<u64, NexusError> {
        if self.keyring.damaged()? {
            warn!("local cache marked as damaged; upload disallowed");
            return Err(NexusError::Corruption(
                "local cache marked as damaged".to_string(),
            ));
        }
        if self.keyring.dirty()? {
            warn!("local cache marked as dirty; will not upload until it has been validated");
            return Err(NexusError::BadInput(
                "local cache marked as dirty".to_string(),
            ));
        }
        let hoard = match self.hoard.as_mut() {
            Some(hoard) => hoard,
            None => return Ok(0),
        };

        let hash_alg = self.device.suite().hash_alg();
        let chunk_count = self.keyring.chunk_count();
        let mut rows = Vec::new();
        self.keyring.iterate_range(0, chunk_count, |chunk, meta| {
            if meta.length > 0 {
                rows.push((chunk, meta.tag.clone(), meta.length));
            }
        })?;

        let mut copied = 0;
        for (chunk, tag, length) in rows {
            let data = store.read_chunk(chunk, length)?;
            let actual = digest(hash_alg, &data)?;
            if actual != tag {
                warn!(
                    "chunk {}: tag mismatch (expected {}, found {}); data corruption has occurred",
                    chunk,
                    format_tag(&tag),
                    format_tag(&actual)
                );
                self.keyring.set_damaged(true)?;
                return Err(NexusError::Corruption(format!(
                    "chunk {} does not match its keyring tag",
                    chunk
                )));
            }
            hoard.put(&tag, &data)?;
            copied += 1;
        }
        hoard.flush()?;
        info!("copied {} chunks into the hoard", copied);
        Ok(copied)
    }

    /// Full validation pass: keyring consistency plus (optionally) a
    /// tag check of every written chunk. A clean full check clears the
    /// dirty flag; any problem raises damaged.
    pub fn validate_cache(
        &mut self,
        store: &ChunkStore,
        full_check: bool,
    ) -> Result<bool, NexusError> {
        let supported = crate::transform::all_compression_mask();
        let mut problems = self.keyring.validate(supported)?;

        if full_check {
            let hash_alg = self.device.suite().hash_alg();
            let chunk_count = self.keyring.chunk_count();
            let mut rows = Vec::new();
            self.keyring.iterate_range(0, chunk_count, |chunk, meta| {
                if meta.length > 0 {
                    rows.push((chunk, meta.tag.clone(), meta.length));
                }
            })?;
            for (chunk, tag, length) in rows {
                let data = store.read_chunk(chunk, length)?;
                if digest(hash_alg, &data)? != tag {
                    warn!("chunk {}: tag check failure", chunk);
                    problems += 1;
                }
            }
        }

        if problems > 0 {
            self.keyring.set_damaged(true)?;
            Ok(false)
        } else {
            if full_check {
                self.keyring.set_dirty(false)?;
                self.keyring.set_damaged(false)?;
            }
            Ok(true)
        }
    }
}
