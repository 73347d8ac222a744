//! Record storage contract
//!
//! Every engine runs the same scenarios: they share one file format and must
//! agree on ids, relocation, deletion and scanning.

mod common;

use blobstore_rs::{
    BlobStorage, BlobStoreError, LockFreeBlobStorage, MappedBlobStorage, PagedBlobStorage,
    RecordHeader, RecordId, WriteAction, WriteOptions, DEFAULT_PAGE_SIZE, HEADER_SIZE, NULL_ID,
};
use common::{config, tight_config, Engine};
use std::path::Path;
use tempfile::TempDir;

fn first_record_lands_after_header<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &config(4096)).unwrap();
    let id = storage.insert(b"0123456789").unwrap();
    assert_eq!(id, 1);
    assert_eq!(storage.read_to_vec(id).unwrap(), b"0123456789");
    storage.close().unwrap();

    let bytes = std::fs::read(path).unwrap();
    let header = RecordHeader::decode(&bytes[HEADER_SIZE..], Default::default()).unwrap();
    assert_eq!(header.length(), Some(10));
}

fn small_payloads_get_small_headers<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &tight_config(4096)).unwrap();
    let id = storage.insert(b"0123456789").unwrap();
    storage.close().unwrap();

    let bytes = std::fs::read(path).unwrap();
    match RecordHeader::decode(&bytes[HEADER_SIZE..], Default::default()).unwrap() {
        RecordHeader::Actual(record) => {
            assert_eq!(record.header_size(), 2);
            assert_eq!(record.capacity, 22);
            assert_eq!(record.length, 10);
        }
        other => panic!("record {} decoded as {:?}", id, other),
    }
}

fn payloads_of_every_size_round_trip<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &tight_config(4096)).unwrap();
    let max = storage.max_payload_supported();
    assert_eq!(max, 4091);

    let lengths = [0usize, 1, 6, 200, 254, 255, 1000, 3000, max];
    let ids: Vec<RecordId> = lengths
        .iter()
        .map(|&len| {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            storage.insert(&payload).unwrap()
        })
        .collect();

    for (&len, &id) in lengths.iter().zip(&ids) {
        let payload = storage.read_to_vec(id).unwrap();
        assert_eq!(payload.len(), len, "{}: record {}", E::NAME, id);
        assert!(payload.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    }
    assert_eq!(storage.live_records_count(), lengths.len() as u32);

    assert!(matches!(
        storage.insert(&vec![0u8; max + 1]),
        Err(BlobStoreError::RecordTooLargeForPage { .. })
    ));
}

fn growth_within_capacity_keeps_id<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &config(4096)).unwrap();
    let id = storage.insert(b"small").unwrap();
    let same = storage.update(id, &[3u8; 200], false).unwrap();
    assert_eq!(same, id);
    assert_eq!(storage.read_to_vec(id).unwrap(), vec![3u8; 200]);

    let stats = storage.stats();
    assert_eq!(stats.live_payload_bytes, 200);
    assert_eq!(stats.records_relocated, 0);
}

fn relocation_with_redirect<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &config(4096)).unwrap();
    let old = storage.insert(b"before").unwrap();
    let new = storage.update(old, &[9u8; 1000], true).unwrap();
    assert_ne!(old, new);

    assert_eq!(storage.read_to_vec(old).unwrap(), vec![9u8; 1000]);
    let (len, resolved) = storage.read_record_resolved(old, |p| p.len()).unwrap();
    assert_eq!((len, resolved), (1000, new));
    assert_eq!(storage.resolve_record(old).unwrap(), Some(new));
    assert!(storage.has_record(old).unwrap());

    let stats = storage.stats();
    assert_eq!(stats.records_allocated, 2);
    assert_eq!(stats.records_relocated, 1);
    assert_eq!(stats.live_records, 1);
    assert_eq!(stats.live_payload_bytes, 1000);
}

fn relocation_without_redirect<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &config(4096)).unwrap();
    let old = storage.insert(b"before").unwrap();
    let new = storage.update(old, &[9u8; 1000], false).unwrap();
    assert_ne!(old, new);

    assert!(matches!(
        storage.read_to_vec(old),
        Err(BlobStoreError::RecordDeleted(id)) if id == old
    ));
    assert!(!storage.has_record(old).unwrap());
    assert_eq!(storage.read_to_vec(new).unwrap(), vec![9u8; 1000]);

    let stats = storage.stats();
    assert_eq!(stats.records_deleted, 1);
    assert_eq!(stats.records_relocated, 0);
    assert_eq!(stats.live_records, 1);
}

fn delete_semantics<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &config(4096)).unwrap();
    let doomed = storage.insert(b"doomed").unwrap();
    storage.delete_record(doomed).unwrap();
    assert!(matches!(
        storage.read_to_vec(doomed),
        Err(BlobStoreError::RecordDeleted(_))
    ));
    assert!(matches!(
        storage.delete_record(doomed),
        Err(BlobStoreError::RecordAlreadyDeleted(_))
    ));
    assert!(matches!(
        storage.update(doomed, b"revive", true),
        Err(BlobStoreError::RecordDeleted(_))
    ));

    // deleting a forwarder leaves its target alone
    let old = storage.insert(b"old").unwrap();
    let new = storage.update(old, &[1u8; 700], true).unwrap();
    let before = storage.stats();
    storage.delete_record(old).unwrap();
    assert!(!storage.has_record(old).unwrap());
    assert_eq!(storage.read_to_vec(new).unwrap(), vec![1u8; 700]);
    assert_eq!(storage.stats(), before);
}

fn scan_visits_surviving_headers<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &config(4096)).unwrap();
    let ids: Vec<RecordId> = (0..10u8).map(|i| storage.insert(&[i; 20]).unwrap()).collect();
    for &id in &ids[..3] {
        storage.update(id, &[0xEE; 800], true).unwrap();
    }
    for &id in &ids[3..5] {
        storage.delete_record(id).unwrap();
    }

    let mut actual = 0;
    let mut gone = 0;
    let visited = storage
        .for_each(|record| {
            if record.is_actual() {
                assert_eq!(record.payload.len(), record.length as usize);
                actual += 1;
            } else {
                assert_eq!(record.length, -1);
                assert!(record.payload.is_empty());
                gone += 1;
            }
            true
        })
        .unwrap();

    assert_eq!(visited, 13);
    assert_eq!(actual, 8);
    assert_eq!(gone, 5);
    assert_eq!(storage.live_records_count(), 8);

    let stopped = storage.for_each(|_| false).unwrap();
    assert_eq!(stopped, 1);
}

fn records_are_pushed_to_the_next_page<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &config(DEFAULT_PAGE_SIZE)).unwrap();
    let first = storage.insert(&vec![1u8; 600_000]).unwrap();
    let second = storage.insert(&vec![2u8; 600_000]).unwrap();

    // second record starts exactly at page 1, after a padding record
    assert_eq!(first, 1);
    assert_eq!(
        HEADER_SIZE as u64 + (second as u64 - 1) * 8,
        DEFAULT_PAGE_SIZE as u64
    );

    assert_eq!(storage.read_to_vec(first).unwrap(), vec![1u8; 600_000]);
    assert_eq!(storage.read_to_vec(second).unwrap(), vec![2u8; 600_000]);
    let mut seen = Vec::new();
    storage
        .for_each(|record| {
            seen.push(record.id);
            true
        })
        .unwrap();
    assert_eq!(seen, vec![first, second]);
}

fn oversized_payload_is_rejected_before_allocation<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &config(DEFAULT_PAGE_SIZE)).unwrap();
    assert!(matches!(
        storage.insert(&vec![0u8; 2_000_000]),
        Err(BlobStoreError::LengthOutOfRange { length: 2_000_000, .. })
    ));
    assert_eq!(storage.stats().records_allocated, 0);
    assert_eq!(storage.insert(b"next").unwrap(), 1);
}

fn writer_protocol<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &config(4096)).unwrap();
    let declined = storage
        .write_to_record(NULL_ID, |_| WriteAction::Keep, WriteOptions::new())
        .unwrap();
    assert_eq!(declined, NULL_ID);

    let id = storage
        .write_to_record(
            NULL_ID,
            |content| {
                content.extend_from_slice(b"abc");
                WriteAction::Commit
            },
            WriteOptions::new().size_hint(8),
        )
        .unwrap();

    let kept = storage
        .write_to_record(id, |_| WriteAction::Keep, WriteOptions::new())
        .unwrap();
    assert_eq!(kept, id);

    let appended = storage
        .write_to_record(
            id,
            |content| {
                assert_eq!(content.as_slice(), b"abc");
                content.extend_from_slice(b"def");
                WriteAction::Commit
            },
            WriteOptions::new(),
        )
        .unwrap();
    assert_eq!(appended, id);
    assert_eq!(storage.read_to_vec(id).unwrap(), b"abcdef");
}

fn invalid_ids_are_usage_errors<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &config(4096)).unwrap();
    storage.insert(b"only").unwrap();

    let err = storage.read_to_vec(NULL_ID).unwrap_err();
    assert!(matches!(err, BlobStoreError::InvalidRecordId(0)));
    assert!(err.is_usage());
    assert!(matches!(
        storage.read_to_vec(999),
        Err(BlobStoreError::RecordNotAllocated { record_id: 999, .. })
    ));
    assert!(matches!(
        storage.delete_record(999),
        Err(BlobStoreError::RecordNotAllocated { .. })
    ));
    assert!(!storage.has_record(999).unwrap());
    assert!(!storage.has_record(NULL_ID).unwrap());
}

fn id_inside_a_payload_leaves_file_healthy<E: Engine>(path: &Path) {
    {
        let mut storage = E::open_at(path, &config(4096)).unwrap();
        let id = storage.insert(&[0xFF; 64]).unwrap();
        assert_eq!(id, 1);

        // id 2 lands in the payload of record 1, id 20 in its unused capacity
        for inside in [2, 20] {
            let err = storage.read_to_vec(inside).unwrap_err();
            assert!(matches!(err, BlobStoreError::InvalidRecordId(i) if i == inside));
            assert!(err.is_usage() && !err.is_corruption());
            assert!(matches!(
                storage.update(inside, b"x", false),
                Err(BlobStoreError::InvalidRecordId(_))
            ));
            assert!(matches!(
                storage.delete_record(inside),
                Err(BlobStoreError::InvalidRecordId(_))
            ));
        }
        storage.close().unwrap();
    }

    let storage = E::open_at(path, &config(4096)).unwrap();
    assert_eq!(storage.read_to_vec(1).unwrap(), vec![0xFF; 64]);
    assert_eq!(storage.stats().records_deleted, 0);
}

fn declined_or_failed_writes_leave_record_untouched<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &config(4096)).unwrap();
    let id = storage.insert(b"original").unwrap();
    let before = storage.stats();

    let kept = storage
        .write_to_record(
            id,
            |content| {
                content.as_mut_slice().copy_from_slice(b"SCRIBBLE");
                content.extend_from_slice(b" and more");
                WriteAction::Keep
            },
            WriteOptions::new(),
        )
        .unwrap();
    assert_eq!(kept, id);
    assert_eq!(storage.read_to_vec(id).unwrap(), b"original");

    let too_large = storage.max_payload_supported() + 1;
    let result = storage.write_to_record(
        id,
        |content| {
            content.as_mut_slice()[0] = b'X';
            content.resize(too_large, 0);
            WriteAction::Commit
        },
        WriteOptions::new().leave_redirect(true),
    );
    assert!(matches!(
        result,
        Err(BlobStoreError::RecordTooLargeForPage { .. })
    ));
    assert_eq!(storage.read_to_vec(id).unwrap(), b"original");
    assert_eq!(storage.resolve_record(id).unwrap(), Some(id));
    assert_eq!(storage.stats(), before);
}

fn lifecycle<E: Engine>(path: &Path) {
    let mut storage = E::open_at(path, &config(4096)).unwrap();
    assert_eq!(storage.storage_version().unwrap(), 1);
    assert_eq!(storage.data_format_version().unwrap(), 0);
    storage.set_data_format_version(42).unwrap();
    let id = storage.insert(b"persisted").unwrap();
    assert!(storage.is_dirty());
    storage.force().unwrap();
    assert!(!storage.is_dirty());

    storage.close().unwrap();
    storage.close().unwrap();
    assert!(matches!(storage.force(), Err(BlobStoreError::Closed)));
    assert!(matches!(storage.read_to_vec(id), Err(BlobStoreError::Closed)));
    assert!(matches!(storage.insert(b"late"), Err(BlobStoreError::Closed)));
    drop(storage);

    let storage = E::open_at(path, &config(4096)).unwrap();
    assert_eq!(storage.data_format_version().unwrap(), 42);
    assert_eq!(storage.read_to_vec(id).unwrap(), b"persisted");
    assert_eq!(storage.live_records_count(), 1);
}

macro_rules! contract_tests {
    ($module:ident, $engine:ty) => {
        mod $module {
            use super::*;

            fn run(scenario: fn(&Path)) {
                let dir = TempDir::new().unwrap();
                scenario(&dir.path().join("records.blob"));
            }

            #[test]
            fn test_first_record_lands_after_header() {
                run(first_record_lands_after_header::<$engine>);
            }

            #[test]
            fn test_small_payloads_get_small_headers() {
                run(small_payloads_get_small_headers::<$engine>);
            }

            #[test]
            fn test_payloads_of_every_size_round_trip() {
                run(payloads_of_every_size_round_trip::<$engine>);
            }

            #[test]
            fn test_growth_within_capacity_keeps_id() {
                run(growth_within_capacity_keeps_id::<$engine>);
            }

            #[test]
            fn test_relocation_with_redirect() {
                run(relocation_with_redirect::<$engine>);
            }

            #[test]
            fn test_relocation_without_redirect() {
                run(relocation_without_redirect::<$engine>);
            }

            #[test]
            fn test_delete_semantics() {
                run(delete_semantics::<$engine>);
            }

            #[test]
            fn test_scan_visits_surviving_headers() {
                run(scan_visits_surviving_headers::<$engine>);
            }

            #[test]
            fn test_records_are_pushed_to_the_next_page() {
                run(records_are_pushed_to_the_next_page::<$engine>);
            }

            #[test]
            fn test_oversized_payload_is_rejected_before_allocation() {
                run(oversized_payload_is_rejected_before_allocation::<$engine>);
            }

            #[test]
            fn test_writer_protocol() {
                run(writer_protocol::<$engine>);
            }

            #[test]
            fn test_invalid_ids_are_usage_errors() {
                run(invalid_ids_are_usage_errors::<$engine>);
            }

            #[test]
            fn test_id_inside_a_payload_leaves_file_healthy() {
                run(id_inside_a_payload_leaves_file_healthy::<$engine>);
            }

            #[test]
            fn test_declined_or_failed_writes_leave_record_untouched() {
                run(declined_or_failed_writes_leave_record_untouched::<$engine>);
            }

            #[test]
            fn test_lifecycle() {
                run(lifecycle::<$engine>);
            }
        }
    };
}

contract_tests!(paged, PagedBlobStorage);
contract_tests!(lock_free, LockFreeBlobStorage);
contract_tests!(mapped, MappedBlobStorage);

#[test]
fn test_engines_share_one_format() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.blob");

    let (kept, moved) = {
        let storage = PagedBlobStorage::open(&path, &config(4096)).unwrap();
        let kept = storage.insert(b"written by the page cache").unwrap();
        let moved = storage.insert(b"short").unwrap();
        storage.update(moved, &[5u8; 2000], true).unwrap();
        storage.close().unwrap();
        (kept, moved)
    };

    {
        let mut storage = MappedBlobStorage::open(&path, &config(4096)).unwrap();
        assert_eq!(storage.read_to_vec(kept).unwrap(), b"written by the page cache");
        assert_eq!(storage.read_to_vec(moved).unwrap(), vec![5u8; 2000]);
        storage.update(kept, b"and then by the mapping", false).unwrap();
    }

    let storage = LockFreeBlobStorage::open(&path, &config(4096)).unwrap();
    assert_eq!(storage.read_to_vec(kept).unwrap(), b"and then by the mapping");
    assert_eq!(storage.live_records_count(), 2);
}
