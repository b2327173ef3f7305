//! Nexus: a content-addressed, convergently-encrypted virtual block
//! device.
//!
//! # Data model
//!
//! A backing chunk store holds fixed-size chunks. Each chunk is
//! independently compressed and encrypted under a key derived from its
//! own content (`key = H(compressed plaintext)`) and identified by the
//! digest of its ciphertext (`tag = H(ciphertext)`), so identical
//! plaintext deduplicates to identical storage. A keyring, owned by a
//! user-space keeper process, maps each chunk index to its current
//! (tag, key, compression) triple.
//!
//! # The chunk cache and I/O pipeline
//!
//! The device core keeps a fixed population of cache entries, each
//! holding one decrypted chunk. Logical block requests are split into
//! per-chunk fragments by the request coalescer, which reserves every
//! participating entry up front (all-or-nothing, in chunk-index order)
//! and parks the request if the cache is exhausted. Each entry walks a
//! state machine (keyring lookup, backing read, decrypt, service, and
//! the mirrored write-back pipeline) driven by per-CPU transform
//! workers and the I/O and request singleton threads. Keyring traffic
//! flows over an ordered message channel to the keeper.
//!
//! # The hoard
//!
//! Independently of any single device, the host carries a hoard: a
//! content-addressed, LRU-evicting slot pool shared by all parcels,
//! indexed by a small relational database and protected by file locks
//! so several processes can read it concurrently.

pub mod tools;

mod error;
pub use error::*;

pub mod transform;

mod scatter;
pub use scatter::*;

pub mod sql;

mod keyring;
pub use keyring::*;

mod chunkstore;
pub use chunkstore::*;

mod stats;
pub use stats::*;

pub(crate) mod chunkdata;
pub use chunkdata::ChunkState;

mod thread;
pub use thread::WorkerPool;

mod request;
pub use request::{BlockRequest, CompletedRequest, MAX_CHUNKS_PER_IO, MAX_SEGS_PER_IO};

mod usermsg;
pub use usermsg::{UserMessage, UserReply};

mod device;
pub use device::{Device, DeviceConfig, MAX_CHUNKSIZE, MIN_CACHE_ENTRIES};

mod keeper;
pub use keeper::*;

mod hoard;
pub use hoard::*;
