#![no_main]
use blobstore_rs::{BlobStoreError, PagedBlobStorage, RecordId, StorageConfig};
use libfuzzer_sys::{
    arbitrary::{Arbitrary, Unstructured},
    fuzz_target,
};

/// Operations address records by index into the ids handed out so far
#[derive(Debug, Arbitrary)]
enum Op {
    Insert { len: u16, fill: u8 },
    Update { handle: u16, len: u16, fill: u8, redirect: bool },
    Delete { handle: u16 },
    Read { handle: u16 },
    Scan,
}

// Random operations against a small-page in-memory storage: only usage
// errors are acceptable, never corruption.
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<Op> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let config = StorageConfig::new().with_page_size(512);
    let storage = match PagedBlobStorage::in_memory(&config) {
        Ok(storage) => storage,
        Err(_) => return,
    };

    let check = |result: Result<(), BlobStoreError>| {
        if let Err(err) = result {
            assert!(!err.is_corruption(), "storage corrupted itself: {}", err);
        }
    };

    let mut ids: Vec<RecordId> = Vec::new();
    let pick = |ids: &[RecordId], handle: u16| ids.get(handle as usize % ids.len().max(1)).copied();

    for op in ops.iter().take(256) {
        match *op {
            Op::Insert { len, fill } => match storage.insert(&vec![fill; len as usize]) {
                Ok(id) => ids.push(id),
                Err(err) => check(Err(err)),
            },
            Op::Update {
                handle,
                len,
                fill,
                redirect,
            } => {
                let Some(id) = pick(&ids, handle) else { continue };
                match storage.update(id, &vec![fill; len as usize], redirect) {
                    Ok(moved) => ids.push(moved),
                    Err(err) => check(Err(err)),
                }
            }
            Op::Delete { handle } => {
                if let Some(id) = pick(&ids, handle) {
                    check(storage.delete_record(id));
                }
            }
            Op::Read { handle } => {
                if let Some(id) = pick(&ids, handle) {
                    check(storage.read_to_vec(id).map(|_| ()));
                }
            }
            Op::Scan => check(storage.for_each(|_| true).map(|_| ())),
        }
    }
});
