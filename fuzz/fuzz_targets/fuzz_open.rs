#![no_main]
use blobstore_rs::{MappedBlobStorage, PagedBlobStorage, StorageConfig};
use libfuzzer_sys::fuzz_target;

// Opening an arbitrary file must never panic, whichever engine reads it.
fuzz_target!(|data: &[u8]| {
    let path = std::env::temp_dir().join(format!("fuzz-open-{}.blob", std::process::id()));
    if std::fs::write(&path, data).is_err() {
        return;
    }
    let config = StorageConfig::new().with_page_size(4096);

    if let Ok(storage) = PagedBlobStorage::open(&path, &config) {
        let _ = storage.for_each(|_| true);
    }
    if std::fs::write(&path, data).is_ok() {
        if let Ok(storage) = MappedBlobStorage::open(&path, &config) {
            let _ = blobstore_rs::BlobStorage::for_each(&storage, |_| true);
        }
    }

    std::fs::remove_file(&path).ok();
});
