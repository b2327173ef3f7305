//! Keeper-side tests: collecting a parcel's chunks into the shared
//! hoard and validating the local cache.

use std::sync::Arc;
use std::thread;

use nexus::transform::{all_compression_mask, Compression, CryptoSuite};
use nexus::{
    ChunkStore, Device, DeviceConfig, Hoard, HoardConfig, Keeper, KeyringStore, NexusError,
    ParcelIdent, WorkerPool, MIN_CACHE_ENTRIES,
};

const CHUNKSIZE: u32 = 4096;

fn parcel() -> ParcelIdent {
    ParcelIdent {
        uuid: "deadbeef-0000-1111-2222-333344445555".to_string(),
        server: "isr.example.org".to_string(),
        user: "someone".to_string(),
        name: "testdisk".to_string(),
    }
}

/// Run a device session, write the given chunks, sync, shut down.
/// Returns the scratch dir and a (stopped) device handle for the
/// keeper helpers.
fn populated_parcel(fills: &[(u64, u8)]) -> (tempfile::TempDir, Device, Arc<WorkerPool>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let backing = dir.path().join("store");
    std::fs::File::create(&backing)
        .unwrap()
        .set_len(64 * CHUNKSIZE as u64)
        .unwrap();

    let pool = WorkerPool::new().unwrap();
    let device = Device::new(
        DeviceConfig {
            backing_path: backing,
            chunksize: CHUNKSIZE,
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

    let chunk_sectors = CHUNKSIZE as u64 / 512;
    for &(chunk, fill) in fills {
        device
            .write(chunk * chunk_sectors, &vec![fill; CHUNKSIZE as usize])
            .unwrap();
    }
    device.sync().unwrap();
    device.shutdown(true).unwrap();
    keeper.join().unwrap().unwrap();

    (dir, device, pool)
}

fn reopen_keeper(dir: &tempfile::TempDir, device: Device) -> Keeper {
    let keyring = KeyringStore::open(dir.path().join("keyring.db"), 20, 64).unwrap();
    let hoard = Hoard::open(
        HoardConfig {
            dir: dir.path().join("hoard"),
            chunksize: CHUNKSIZE,
            suite: CryptoSuite::AesSha1,
            min_hoarded_chunks: 0,
            max_slots: None,
        },
        Some(&parcel()),
    )
    .unwrap();
    Keeper::with_hoard(device, keyring, hoard)
}

#[test]
fn modified_chunks_are_hoarded() {
    let (dir, device, _pool) = populated_parcel(&[(1, 0x11), (2, 0x22)]);
    let mut keeper = reopen_keeper(&dir, device);
    let store = ChunkStore::open(dir.path().join("store"), CHUNKSIZE, 0).unwrap();

    // a dirty cache must be validated before upload
    assert!(matches!(
        keeper.copy_to_hoard(&store),
        Err(NexusError::BadInput(_))
    ));
    assert!(keeper.validate_cache(&store, true).unwrap());

    let copied = keeper.copy_to_hoard(&store).unwrap();
    assert_eq!(copied, 2);
    keeper.sync_hoard_refs().unwrap();

    // the hoard serves the chunk back by tag
    let tag = keeper.keyring().get(1).unwrap().unwrap().tag;
    let length = keeper.keyring().get(1).unwrap().unwrap().length;
    let expected = store.read_chunk(1, length).unwrap();
    let hoard = keeper.hoard_mut().unwrap();
    assert_eq!(hoard.get(&tag).unwrap(), Some(expected));
}

#[test]
fn validation_clears_dirty_flag() {
    let (dir, device, _pool) = populated_parcel(&[(5, 0x55)]);
    let mut keeper = reopen_keeper(&dir, device);
    let store = ChunkStore::open(dir.path().join("store"), CHUNKSIZE, 0).unwrap();

    // the session's write-backs marked the cache dirty
    assert!(keeper.keyring().dirty().unwrap());
    assert!(keeper.validate_cache(&store, true).unwrap());
    assert!(!keeper.keyring().dirty().unwrap());
    assert!(!keeper.keyring().damaged().unwrap());
}

#[test]
fn damaged_cache_blocks_upload() {
    let (dir, device, _pool) = populated_parcel(&[(7, 0x77)]);

    // corrupt chunk 7's ciphertext behind the keyring's back
    {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.path().join("store"))
            .unwrap();
        let mut byte = [0u8; 1];
        file.read_exact_at(&mut byte, 7 * CHUNKSIZE as u64).unwrap();
        byte[0] ^= 0x80;
        file.write_all_at(&byte, 7 * CHUNKSIZE as u64).unwrap();
    }

    let mut keeper = reopen_keeper(&dir, device);
    let store = ChunkStore::open(dir.path().join("store"), CHUNKSIZE, 0).unwrap();

    assert!(!keeper.validate_cache(&store, true).unwrap());
    assert!(keeper.keyring().damaged().unwrap());

    let err = keeper.copy_to_hoard(&store).unwrap_err();
    assert!(matches!(err, NexusError::Corruption(_)));
}

#[test]
fn sync_refs_drops_stale_references() {
    let (dir, device, _pool) = populated_parcel(&[(1, 0x11)]);
    let mut keeper = reopen_keeper(&dir, device);
    let store = ChunkStore::open(dir.path().join("store"), CHUNKSIZE, 0).unwrap();
    assert!(keeper.validate_cache(&store, true).unwrap());
    keeper.copy_to_hoard(&store).unwrap();
    keeper.sync_hoard_refs().unwrap();
    // applying the same live set again is a no-op
    keeper.sync_hoard_refs().unwrap();
}
