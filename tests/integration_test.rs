use blobstore::storage::{
    BlobStore, LengthPlusFixedPercent, RecordId, SpaceAllocationStrategy, StorageError,
    StoreConfig, WriterDecides,
};
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

const PAGE_SIZE: usize = 2048;

fn open_store(path: &Path, strategy: Box<dyn SpaceAllocationStrategy>) -> BlobStore {
    let config = StoreConfig {
        page_size: PAGE_SIZE,
        cache_frames: 32,
    };
    BlobStore::open(path, config, strategy).unwrap()
}

#[test]
fn test_random_payload_round_trips_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.blob");
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);

    let mut expected = Vec::new();
    {
        let store = open_store(&path, Box::new(WriterDecides::new(512).unwrap()));
        for _ in 0..300 {
            let len = rng.gen_range(0..=store.max_payload_supported());
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let id = store.insert(&payload).unwrap();
            expected.push((id, payload));
        }
        for (id, payload) in &expected {
            assert_eq!(&store.read_to_vec(*id).unwrap().0, payload);
        }
        store.close().unwrap();
    }

    let store = open_store(&path, Box::new(WriterDecides::new(512).unwrap()));
    assert!(store.was_closed_properly().unwrap());
    assert_eq!(store.records_allocated().unwrap() as usize, expected.len());
    for (id, payload) in &expected {
        assert_eq!(&store.read_to_vec(*id).unwrap().0, payload);
    }
    store.close().unwrap();
}

#[test]
fn test_relocation_chains_stay_readable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.blob");
    let store = open_store(&path, Box::new(LengthPlusFixedPercent::new(64, 16, 10).unwrap()));

    // grow one record repeatedly, keeping redirects, so the original id
    // accumulates a chain of MOVED slots
    let original = store.insert(b"v0").unwrap();
    let mut current = original;
    let mut content = Vec::new();
    for round in 1..6usize {
        content = vec![round as u8; round * 150];
        let grown = content.clone();
        current = store
            .write(
                current,
                move |buf| {
                    buf.clear();
                    buf.extend_from_slice(&grown);
                    Ok(true)
                },
                0,
                true,
            )
            .unwrap();
    }
    assert_ne!(current, original);

    // both ends of the chain read the latest content
    let (via_original, resolved) = store.read_to_vec(original).unwrap();
    assert_eq!(via_original, content);
    assert_eq!(resolved, current);
    assert_eq!(store.read_to_vec(current).unwrap().0, content);

    let (found, resolved) = store.has_record_resolving(original).unwrap();
    assert!(found);
    assert_eq!(resolved, current);

    store.close().unwrap();
}

#[test]
fn test_crash_signal_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.blob");

    {
        let store = open_store(&path, Box::new(WriterDecides::new(512).unwrap()));
        store.insert(b"first session").unwrap();
        store.close().unwrap();
    }
    {
        let store = open_store(&path, Box::new(WriterDecides::new(512).unwrap()));
        assert!(store.was_closed_properly().unwrap());
        // persist some work, then drop the store without closing it
        store.insert(b"second session").unwrap();
        store.force().unwrap();
    }
    {
        let store = open_store(&path, Box::new(WriterDecides::new(512).unwrap()));
        assert!(!store.was_closed_properly().unwrap());
        assert_eq!(store.records_allocated().unwrap(), 2);
        store.close().unwrap();
    }
    // a clean close resets the signal
    let store = open_store(&path, Box::new(WriterDecides::new(512).unwrap()));
    assert!(store.was_closed_properly().unwrap());
    store.close().unwrap();
}

#[test]
fn test_scan_accounts_for_every_byte() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.blob");
    let store = open_store(&path, Box::new(WriterDecides::new(128).unwrap()));

    let mut ids = Vec::new();
    for i in 0..100usize {
        ids.push(store.insert(&vec![i as u8; (i * 37) % 900 + 1]).unwrap());
    }
    for id in ids.iter().step_by(3) {
        store.delete(*id).unwrap();
    }

    // every visited slot obeys the page-crossing invariant and the live
    // count matches the counters
    let mut live = 0u32;
    let mut tombstones = 0u32;
    let count = store
        .for_each(|_, _, length, payload| {
            if length >= 0 {
                assert_eq!(payload.len() as i64, length);
                live += 1;
            } else {
                assert!(payload.is_empty());
                tombstones += 1;
            }
            true
        })
        .unwrap();

    assert_eq!(count as u32, live + tombstones);
    assert_eq!(live, store.live_records_count().unwrap());
    assert_eq!(tombstones, store.records_deleted().unwrap());
    assert!(
        store.total_live_records_payload_bytes().unwrap()
            <= store.total_live_records_capacity_bytes().unwrap()
    );
    store.close().unwrap();
}

#[test]
fn test_concurrent_writers_readers_and_deleters() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.blob");
    let store = Arc::new(open_store(&path, Box::new(WriterDecides::new(256).unwrap())));

    let mut handles = Vec::new();
    for t in 0..4u8 {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            let mut kept = Vec::new();
            for i in 0..100usize {
                let payload = vec![t + 1; i % 300 + 1];
                let id = store.insert(&payload).unwrap();
                if i % 5 == 0 {
                    store.delete(id).unwrap();
                } else {
                    kept.push((id, payload));
                }
            }
            for (id, payload) in kept {
                let (data, resolved) = store.read_to_vec(id).unwrap();
                assert_eq!(data, payload);
                assert_eq!(resolved, id);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.records_allocated().unwrap(), 400);
    assert_eq!(store.records_deleted().unwrap(), 80);
    assert_eq!(store.live_records_count().unwrap(), 320);

    store.force().unwrap();
    store.close().unwrap();

    // everything above survives a reopen
    let store = open_store(&path, Box::new(WriterDecides::new(256).unwrap()));
    assert_eq!(store.records_allocated().unwrap(), 400);
    assert_eq!(store.live_records_count().unwrap(), 320);
    store.close().unwrap();
}

#[test]
fn test_stale_id_cleanup_workflow() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.blob");
    let store = open_store(&path, Box::new(WriterDecides::new(64).unwrap()));

    // a client holds on to `stale` while the record relocates
    let stale = store.insert(b"payload v1").unwrap();
    let live = store
        .write(
            stale,
            |buf| {
                buf.clear();
                buf.extend_from_slice(&[0xAB; 500]);
                Ok(true)
            },
            0,
            true,
        )
        .unwrap();
    assert_ne!(live, stale);

    // the client re-learns the id on its next read, then retires the stale
    // slot; the live record is unaffected
    let (_, resolved) = store.read_to_vec(stale).unwrap();
    assert_eq!(resolved, live);
    store.delete(stale).unwrap();

    assert!(!store.has_record(stale).unwrap());
    assert!(store.has_record(live).unwrap());
    assert!(matches!(
        store.delete(stale),
        Err(StorageError::AlreadyDeleted { .. })
    ));

    store.close().unwrap();
}

#[test]
fn test_write_to_null_id_inserts() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.blob");
    let store = open_store(&path, Box::new(WriterDecides::new(64).unwrap()));

    let id = store
        .write(
            RecordId::NULL,
            |buf| {
                buf.extend_from_slice(b"inserted via write");
                Ok(true)
            },
            0,
            false,
        )
        .unwrap();
    assert!(id.is_valid());
    assert_eq!(store.read_to_vec(id).unwrap().0, b"inserted via write");
    store.close().unwrap();
}
