//! Benchmarks for record insert, read, update and scan

use blobstore_rs::{
    AllocationConfig, BlobStorage, LockFreeBlobStorage, MappedBlobStorage, PagedBlobStorage,
    RecordId, StorageConfig,
};
use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use tempfile::TempDir;

const PAYLOAD_SIZES: [usize; 4] = [16, 200, 4 * 1024, 64 * 1024];
const BATCH: usize = 64;

fn config() -> StorageConfig {
    StorageConfig::default()
}

fn benchmark_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    let dir = TempDir::new().unwrap();
    let mut files = 0u32;

    for size in PAYLOAD_SIZES.iter() {
        let payload = vec![0xA5u8; *size];
        group.throughput(Throughput::Elements(BATCH as u64));

        group.bench_with_input(BenchmarkId::new("paged", size), &payload, |b, payload| {
            b.iter_batched(
                || PagedBlobStorage::in_memory(&config()).unwrap(),
                |storage| {
                    for _ in 0..BATCH {
                        black_box(storage.insert(payload).unwrap());
                    }
                    storage
                },
                BatchSize::LargeInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("lock_free", size), &payload, |b, payload| {
            b.iter_batched(
                || LockFreeBlobStorage::in_memory(&config()).unwrap(),
                |storage| {
                    for _ in 0..BATCH {
                        black_box(storage.insert(payload).unwrap());
                    }
                    storage
                },
                BatchSize::LargeInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("mmap", size), &payload, |b, payload| {
            b.iter_batched(
                || {
                    files += 1;
                    let path = dir.path().join(format!("bench-{}.mm", files));
                    MappedBlobStorage::open(path, &config()).unwrap()
                },
                |mut storage| {
                    for _ in 0..BATCH {
                        black_box(storage.insert(payload).unwrap());
                    }
                    storage
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn benchmark_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");

    for size in PAYLOAD_SIZES.iter() {
        let storage = PagedBlobStorage::in_memory(&config()).unwrap();
        let ids: Vec<RecordId> = (0..256)
            .map(|_| storage.insert(&vec![0x5Au8; *size]).unwrap())
            .collect();
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("paged", size), &ids, |b, ids| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % ids.len();
                storage.read_record(ids[i], |payload| black_box(payload.len())).unwrap()
            });
        });
    }

    group.finish();
}

fn benchmark_update_in_place(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_in_place");
    let storage = PagedBlobStorage::in_memory(&config()).unwrap();
    let id = storage.insert(&[0u8; 200]).unwrap();

    group.bench_function("paged_200b", |b| {
        let mut fill = 0u8;
        b.iter(|| {
            fill = fill.wrapping_add(1);
            black_box(storage.update(id, &[fill; 200], true).unwrap())
        });
    });

    group.finish();
}

fn benchmark_relocation_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("relocation");
    let tight = config().with_allocation(AllocationConfig::WriterDecides {
        default_capacity: 16,
    });

    for hops in [1usize, 8, 64].iter() {
        let storage = PagedBlobStorage::in_memory(&tight).unwrap();
        let id = storage.insert(&[1u8; 16]).unwrap();
        for hop in 1..=*hops {
            storage.update(id, &vec![1u8; 16 + hop * 8], true).unwrap();
        }

        group.bench_with_input(BenchmarkId::new("read_through_redirects", hops), &id, |b, id| {
            b.iter(|| storage.read_record(*id, |payload| black_box(payload.len())).unwrap());
        });
    }

    group.finish();
}

fn benchmark_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("for_each");

    for count in [1_000usize, 10_000].iter() {
        let storage = PagedBlobStorage::in_memory(&config()).unwrap();
        for i in 0..*count {
            storage.insert(&(i as u64).to_le_bytes()).unwrap();
        }
        group.throughput(Throughput::Elements(*count as u64));

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                let mut live = 0usize;
                storage
                    .for_each(|record| {
                        live += record.is_actual() as usize;
                        true
                    })
                    .unwrap();
                black_box(live)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_insert,
    benchmark_read,
    benchmark_update_in_place,
    benchmark_relocation_chain,
    benchmark_scan
);
criterion_main!(benches);
