//! End-to-end device tests: a real file-backed chunk store, the worker
//! pool, and a keeper thread servicing the user-message channel.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::thread;

use nexus::transform::{all_compression_mask, Compression, CryptoSuite};
use nexus::{
    Device, DeviceConfig, Keeper, KeyringStore, NexusError, WorkerPool, MIN_CACHE_ENTRIES,
};

struct Rig {
    dir: tempfile::TempDir,
    pool: Arc<WorkerPool>,
    device: Device,
    keeper: Option<thread::JoinHandle<Result<(), NexusError>>>,
}

fn make_store(dir: &tempfile::TempDir, chunksize: u32, chunks: u64) {
    let backing = dir.path().join("store");
    let file = std::fs::File::create(&backing).unwrap();
    file.set_len(chunks * chunksize as u64).unwrap();
}

fn attach(dir: tempfile::TempDir, pool: Arc<WorkerPool>, chunksize: u32) -> Rig {
    let device = Device::new(
        DeviceConfig {
            backing_path: dir.path().join("store"),
            chunksize,
            cache_entries: MIN_CACHE_ENTRIES,
            offset: 0,
            suite: CryptoSuite::AesSha1,
            default_compression: Compression::Zlib,
            supported_compression: all_compression_mask(),
        },
        pool.clone(),
    )
    .unwrap();

    let keyring = KeyringStore::open(
        dir.path().join("keyring.db"),
        device.suite().hash_len(),
        device.chunk_count(),
    )
    .unwrap();

    let keeper_device = device.clone();
    let keeper = thread::spawn(move || Keeper::new(keeper_device, keyring).run());

    Rig {
        dir,
        pool,
        device,
        keeper: Some(keeper),
    }
}

fn rig_with_store(chunksize: u32, chunks: u64) -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    make_store(&dir, chunksize, chunks);
    let pool = WorkerPool::new().unwrap();
    attach(dir, pool, chunksize)
}

impl Rig {
    fn teardown(mut self) -> (tempfile::TempDir, Arc<WorkerPool>) {
        self.device.shutdown(true).unwrap();
        self.keeper.take().unwrap().join().unwrap().unwrap();
        (self.dir, self.pool)
    }
}

#[test]
fn fresh_write_then_read() {
    let rig = rig_with_store(131072, 8);
    let data = vec![0xa5u8; 512];
    rig.device.write(0, &data).unwrap();
    assert_eq!(rig.device.read(0, 512).unwrap(), data);

    // the rest of chunk 0 reads as zeros
    let whole = rig.device.read(0, 131072).unwrap();
    assert_eq!(&whole[..512], &data[..]);
    assert!(whole[512..].iter().all(|&b| b == 0));
    rig.teardown();
}

#[test]
fn whole_chunk_overwrite_skips_read() {
    let rig = rig_with_store(131072, 8);
    let data = vec![0x01u8; 131072];
    rig.device.write(256, &data).unwrap();
    rig.device.sync().unwrap();

    let stats = rig.device.stats();
    assert_eq!(stats.chunk_reads, 0, "no backing read for a whole-chunk write");
    assert_eq!(stats.chunk_writes, 1, "exactly one backing write");
    assert_eq!(stats.whole_chunk_updates, 1);

    assert_eq!(rig.device.read(256, 131072).unwrap(), data);
    rig.teardown();
}

#[test]
fn identical_plaintext_deduplicates() {
    let rig = rig_with_store(4096, 64);
    let data = vec![0x42u8; 4096];
    rig.device.write(2 * 8, &data).unwrap();
    rig.device.write(3 * 8, &data).unwrap();
    rig.device.sync().unwrap();
    let (dir, _pool) = rig.teardown();

    let keyring = KeyringStore::open(dir.path().join("keyring.db"), 20, 64).unwrap();
    let m2 = keyring.get(2).unwrap().expect("chunk 2 committed");
    let m3 = keyring.get(3).unwrap().expect("chunk 3 committed");
    assert_eq!(m2.key, m3.key, "convergent keys match");
    assert_eq!(m2.tag, m3.tag, "content tags match");
    assert_eq!(m2.length, m3.length);
}

#[test]
fn encrypted_discard_read_returns_zeros() {
    let rig = rig_with_store(131072, 8);
    let out = rig.device.read(3 * 256, 4096).unwrap();
    assert!(out.iter().all(|&b| b == 0));

    let stats = rig.device.stats();
    assert_eq!(stats.encrypted_discards, 1);
    assert_eq!(stats.chunk_reads, 0, "no backing I/O issued");
    rig.teardown();
}

#[test]
fn corruption_is_detected_on_read() {
    let rig = rig_with_store(4096, 64);
    let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    rig.device.write(2 * 8, &data).unwrap();
    rig.device.sync().unwrap();
    let (dir, pool) = rig.teardown();

    // flip one bit of chunk 2's on-disk ciphertext
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.path().join("store"))
            .unwrap();
        let mut byte = [0u8; 1];
        file.read_exact_at(&mut byte, 2 * 4096).unwrap();
        byte[0] ^= 0x01;
        file.write_all_at(&byte, 2 * 4096).unwrap();
    }

    let rig = attach(dir, pool, 4096);
    let err = rig.device.read(2 * 8, 4096).unwrap_err();
    assert!(matches!(err, NexusError::Corruption(_)), "got {:?}", err);
    assert_eq!(rig.device.stats().chunk_errors, 1);

    // the entry stays failed for subsequent requests
    assert!(rig.device.read(2 * 8, 4096).is_err());
    rig.teardown();
}

#[test]
fn concurrent_readers_build_once() {
    let rig = rig_with_store(4096, 64);
    let data = vec![0x5au8; 4096];
    rig.device.write(5 * 8, &data).unwrap();
    rig.device.sync().unwrap();
    let (dir, pool) = rig.teardown();

    // a fresh device so the chunk is uncached
    let rig = attach(dir, pool, 4096);
    let mut readers = Vec::new();
    for _ in 0..8 {
        let device = rig.device.clone();
        let expected = data.clone();
        readers.push(thread::spawn(move || {
            assert_eq!(device.read(5 * 8, 4096).unwrap(), expected);
        }));
    }
    for reader in readers {
        reader.join().unwrap();
    }

    let stats = rig.device.stats();
    assert_eq!(stats.chunk_reads, 1, "backing read performed exactly once");
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 7);
    rig.teardown();
}

#[test]
fn lru_eviction_reclaims_first_accessed() {
    let entries = MIN_CACHE_ENTRIES as u64;
    let rig = rig_with_store(4096, 2 * entries);

    // cache_entries + 1 distinct accesses in ascending order
    for chunk in 0..entries + 1 {
        rig.device.read(chunk * 8, 4096).unwrap();
    }
    let stats = rig.device.stats();
    assert_eq!(stats.cache_misses, entries + 1);
    assert_eq!(stats.total_entries(), entries, "state counts add up");

    // chunk 0 was the least recently accessed, so it was the one
    // evicted; touching it again is a miss...
    rig.device.read(0, 4096).unwrap();
    assert_eq!(rig.device.stats().cache_misses, entries + 2);
    // ...while the most recent chunk is still resident
    rig.device.read(entries * 8, 4096).unwrap();
    assert_eq!(rig.device.stats().cache_misses, entries + 2);
    rig.teardown();
}

#[test]
fn eviction_pressure_writes_back_dirty_chunks() {
    let entries = MIN_CACHE_ENTRIES as u64;
    let rig = rig_with_store(4096, 2 * entries);

    // more dirty chunks than cache entries: evictions must write back
    for chunk in 0..entries + 16 {
        let fill = (chunk % 251) as u8 + 1;
        rig.device.write(chunk * 8, &vec![fill; 4096]).unwrap();
    }
    for chunk in 0..entries + 16 {
        let fill = (chunk % 251) as u8 + 1;
        assert_eq!(
            rig.device.read(chunk * 8, 4096).unwrap(),
            vec![fill; 4096],
            "chunk {} round-trips through eviction",
            chunk
        );
    }
    assert!(rig.device.stats().cache_alloc_failures > 0 || rig.device.stats().chunk_writes > 0);
    rig.teardown();
}

#[test]
fn write_spanning_chunk_boundary() {
    let rig = rig_with_store(4096, 64);
    let data: Vec<u8> = (0..2048u32).map(|i| (i % 199) as u8 + 1).collect();
    // sectors 6..10 cross from chunk 0 into chunk 1
    rig.device.write(6, &data).unwrap();
    assert_eq!(rig.device.read(6, 2048).unwrap(), data);

    // each side individually
    assert_eq!(rig.device.read(6, 1024).unwrap(), data[..1024]);
    assert_eq!(rig.device.read(8, 1024).unwrap(), data[1024..]);
    rig.teardown();
}

#[test]
fn sync_makes_writes_durable() {
    let rig = rig_with_store(4096, 64);
    let data = vec![0x77u8; 4096];
    rig.device.write(4 * 8, &data).unwrap();
    rig.device.sync().unwrap();
    let (dir, pool) = rig.teardown();

    let rig = attach(dir, pool, 4096);
    assert_eq!(rig.device.read(4 * 8, 4096).unwrap(), data);
    rig.teardown();
}

#[test]
fn shutdown_refused_with_open_handles() {
    let rig = rig_with_store(4096, 64);
    rig.device.open().unwrap();
    assert_eq!(rig.device.shutdown(false).unwrap_err(), NexusError::Busy);
    rig.device.close();
    rig.device.shutdown(false).unwrap();

    // the device is gone: new requests fail
    assert!(matches!(
        rig.device.read(0, 512),
        Err(NexusError::Shutdown)
    ));
    let mut rig = rig;
    rig.keeper.take().unwrap().join().unwrap().unwrap();
}

#[test]
fn keeper_disappearance_is_terminal() {
    let rig = rig_with_store(4096, 64);
    rig.device.read(0, 512).unwrap();

    rig.device.close_user_channel();
    // no metadata can be resolved any more; new requests fail
    assert!(matches!(rig.device.read(8, 512), Err(NexusError::Shutdown)));
    rig.teardown();
}

#[test]
fn bad_requests_rejected() {
    let rig = rig_with_store(4096, 8);
    // beyond the device
    assert!(rig.device.read(8 * 8, 512).is_err());
    // unaligned length
    assert!(rig.device.read(0, 100).is_err());
    rig.teardown();
}

#[test]
fn config_validation() {
    let dir = tempfile::tempdir().unwrap();
    make_store(&dir, 4096, 8);
    let pool = WorkerPool::new().unwrap();
    let base = DeviceConfig {
        backing_path: dir.path().join("store"),
        chunksize: 4096,
        cache_entries: MIN_CACHE_ENTRIES,
        offset: 0,
        suite: CryptoSuite::AesSha1,
        default_compression: Compression::Zlib,
        supported_compression: all_compression_mask(),
    };

    let mut bad = base.clone();
    bad.chunksize = 1000; // not a power of two
    assert!(Device::new(bad, pool.clone()).is_err());

    let mut bad = base.clone();
    bad.chunksize = 256; // too small
    assert!(Device::new(bad, pool.clone()).is_err());

    let mut bad = base.clone();
    bad.cache_entries = 4; // below the concurrency floor
    assert!(Device::new(bad, pool.clone()).is_err());

    let mut bad = base.clone();
    bad.supported_compression = 0;
    assert!(Device::new(bad, pool.clone()).is_err());

    assert!(Device::new(base, pool).is_ok());
}

#[test]
fn config_roundtrips_through_json() {
    let dir = tempfile::tempdir().unwrap();
    let config = DeviceConfig {
        backing_path: dir.path().join("store"),
        chunksize: 131072,
        cache_entries: MIN_CACHE_ENTRIES,
        offset: 64,
        suite: CryptoSuite::BlowfishSha1,
        default_compression: Compression::Lzf,
        supported_compression: all_compression_mask(),
    };
    let path = dir.path().join("device.cfg");
    config.save(&path).unwrap();
    let loaded = DeviceConfig::load(&path).unwrap();
    assert_eq!(loaded.chunksize, config.chunksize);
    assert_eq!(loaded.offset, config.offset);
    assert_eq!(loaded.suite, config.suite);
    assert_eq!(loaded.default_compression, config.default_compression);
}

#[test]
fn worker_pool_hotplug() {
    let pool = WorkerPool::new().unwrap();
    let count = pool.worker_count();
    assert!(count >= 1);

    if count > 1 {
        pool.cpu_offline(0).unwrap();
        assert_eq!(pool.worker_count(), count - 1);
        pool.cpu_online(0).unwrap();
        assert_eq!(pool.worker_count(), count);
    }

    // the last worker can never be stopped
    for cpu in 1..count {
        pool.cpu_offline(cpu).unwrap();
    }
    assert_eq!(pool.worker_count(), 1);
    assert!(pool.cpu_offline(0).is_err());
    assert_eq!(pool.worker_count(), 1);
}
