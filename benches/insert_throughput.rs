use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::fs;
use std::path::PathBuf;

use calicodb::{Database, Options};

const PAGE_SIZE: usize = 4096;
const VALUE_SIZE: usize = 100;
const SEED: u64 = 42;

/// Batch sizes committed per transaction.
const BATCH_SIZES: &[usize] = &[1, 100, 1_000];

fn bench_data_dir() -> PathBuf {
    PathBuf::from("target/bench-data-insert")
}

fn db_path(name: &str) -> String {
    bench_data_dir().join(name).to_string_lossy().into_owned()
}

fn create_db(name: &str) -> Database {
    let path = db_path(name);
    let _ = fs::remove_dir_all(&path);
    let options = Options {
        page_size: PAGE_SIZE,
        ..Options::default()
    };
    Database::open(&path, options).expect("failed to create database")
}

fn generate_value(size: usize) -> Vec<u8> {
    vec![b'x'; size]
}

fn random_key(rng: &mut StdRng) -> Vec<u8> {
    format!("key_{:016x}", rng.next_u64()).into_bytes()
}

fn insert_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_throughput");
    let value = generate_value(VALUE_SIZE);

    for &batch in BATCH_SIZES {
        group.throughput(criterion::Throughput::Elements(batch as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch),
            &batch,
            |bencher, &batch| {
                let mut db = create_db(&format!("batch-{batch}"));
                let mut rng = StdRng::seed_from_u64(SEED);
                bencher.iter(|| {
                    let mut txn = db.begin().expect("begin");
                    for _ in 0..batch {
                        let key = random_key(&mut rng);
                        txn.insert(black_box(&key), black_box(&value))
                            .expect("insert");
                    }
                    txn.commit().expect("commit");
                });
            },
        );
    }
    group.finish();
    let _ = fs::remove_dir_all(bench_data_dir());
}

criterion_group!(benches, insert_throughput);
criterion_main!(benches);
