//! Crash and rollback scenarios.
//!
//! A "crash" leaks the database handle (`mem::forget`), so nothing the
//! engine buffered in memory survives, while everything it wrote through
//! the shared `MemStorage` does. Reopening then runs recovery.

use std::mem;
use std::sync::Arc;

use calicodb::{Database, MemStorage, Options, Storage};

fn mem_options(storage: &MemStorage) -> Options {
    let _ = env_logger::builder().is_test(true).try_init();
    Options {
        page_size: 512,
        storage: Some(Arc::new(storage.clone()) as Arc<dyn Storage>),
        ..Options::default()
    }
}

fn crash(db: Database) {
    mem::forget(db);
}

#[test]
fn committed_insert_survives_crash_before_data_flush() {
    let storage = MemStorage::new();
    let mut db = Database::open("db", mem_options(&storage)).unwrap();
    db.insert(b"a", b"1").unwrap();
    // The commit protocol only flushes pages from before the previous
    // commit; "a" lives in the WAL and the cache alone at this point.
    crash(db);

    let mut db = Database::open("db", mem_options(&storage)).unwrap();
    assert_eq!(db.get(b"a").unwrap(), b"1");
    assert_eq!(db.info().record_count, 1);
    db.close().unwrap();
}

#[test]
fn uncommitted_insert_is_lost_across_crash() {
    let storage = MemStorage::new();
    let mut db = Database::open("db", mem_options(&storage)).unwrap();
    db.insert(b"a", b"1").unwrap();

    let mut txn = db.begin().unwrap();
    txn.insert(b"b", b"2").unwrap();
    mem::forget(txn);
    crash(db);

    let mut db = Database::open("db", mem_options(&storage)).unwrap();
    assert_eq!(db.get(b"a").unwrap(), b"1");
    assert!(db.get(b"b").unwrap_err().is_not_found());
    db.close().unwrap();
}

#[test]
fn large_uncommitted_transaction_is_rolled_back_on_recovery() {
    let storage = MemStorage::new();
    let mut db = Database::open("db", mem_options(&storage)).unwrap();
    db.insert(b"anchor", b"v").unwrap();

    // Enough records that whole WAL blocks reach the segment file before
    // the crash; recovery has to roll them forward and then undo them.
    let mut txn = db.begin().unwrap();
    for i in 0..300u32 {
        let key = format!("key{i:05}");
        txn.insert(key.as_bytes(), &[7u8; 48]).unwrap();
    }
    mem::forget(txn);
    crash(db);

    let mut db = Database::open("db", mem_options(&storage)).unwrap();
    assert_eq!(db.get(b"anchor").unwrap(), b"v");
    assert_eq!(db.info().record_count, 1);
    for i in 0..300u32 {
        let key = format!("key{i:05}");
        assert!(db.get(key.as_bytes()).unwrap_err().is_not_found());
    }
    db.close().unwrap();
}

#[test]
fn recovery_is_idempotent_across_repeated_crashes() {
    let storage = MemStorage::new();
    let mut db = Database::open("db", mem_options(&storage)).unwrap();
    for i in 0..50u32 {
        let key = format!("key{i:03}");
        db.insert(key.as_bytes(), key.as_bytes()).unwrap();
    }
    let mut txn = db.begin().unwrap();
    for i in 0..50u32 {
        let key = format!("extra{i:03}");
        txn.insert(key.as_bytes(), &[1u8; 64]).unwrap();
    }
    mem::forget(txn);
    crash(db);

    // First recovery, then crash again immediately.
    let db = Database::open("db", mem_options(&storage)).unwrap();
    crash(db);

    let mut db = Database::open("db", mem_options(&storage)).unwrap();
    assert_eq!(db.info().record_count, 50);
    for i in 0..50u32 {
        let key = format!("key{i:03}");
        assert_eq!(db.get(key.as_bytes()).unwrap(), key.as_bytes());
    }
    db.close().unwrap();
}

#[test]
fn abort_restores_previous_commit() {
    let storage = MemStorage::new();
    let mut db = Database::open("db", mem_options(&storage)).unwrap();

    let mut txn = db.begin().unwrap();
    for i in 0..100u32 {
        let key = format!("key{i:03}");
        txn.insert(key.as_bytes(), &[3u8; 32]).unwrap();
    }
    txn.commit().unwrap();

    let mut txn = db.begin().unwrap();
    for i in 0..50u32 {
        let key = format!("key{i:03}");
        txn.erase(key.as_bytes()).unwrap();
    }
    txn.abort().unwrap();

    assert_eq!(db.info().record_count, 100);
    for i in 0..100u32 {
        let key = format!("key{i:03}");
        assert_eq!(db.get(key.as_bytes()).unwrap(), vec![3u8; 32]);
    }
    db.close().unwrap();
}

#[test]
fn dropping_a_transaction_aborts_it() {
    let storage = MemStorage::new();
    let mut db = Database::open("db", mem_options(&storage)).unwrap();
    db.insert(b"keep", b"v").unwrap();

    {
        let mut txn = db.begin().unwrap();
        txn.insert(b"gone", b"v").unwrap();
        // Dropped without commit.
    }
    assert!(db.get(b"gone").unwrap_err().is_not_found());
    assert_eq!(db.get(b"keep").unwrap(), b"v");
    assert_eq!(db.info().record_count, 1);
    db.close().unwrap();
}

#[test]
fn abort_restores_overflow_chains_and_freelist() {
    let storage = MemStorage::new();
    let mut db = Database::open("db", mem_options(&storage)).unwrap();

    let value = vec![b'x'; 2000];
    db.insert(b"big", &value).unwrap();

    let mut txn = db.begin().unwrap();
    txn.erase(b"big").unwrap();
    txn.insert(b"other", &vec![b'y'; 1200]).unwrap();
    txn.abort().unwrap();

    assert_eq!(db.get(b"big").unwrap(), value);
    assert!(db.get(b"other").unwrap_err().is_not_found());
    db.close().unwrap();
}

#[test]
fn commits_across_many_segments_recover() {
    let storage = MemStorage::new();
    let options = Options {
        // Tiny segments force plenty of segment turnover.
        wal_segment_limit: 4 * 512,
        ..mem_options(&storage)
    };
    let mut db = Database::open("db", options).unwrap();
    for i in 0..200u32 {
        let key = format!("key{i:05}");
        db.insert(key.as_bytes(), &[5u8; 100]).unwrap();
    }
    crash(db);

    let mut db = Database::open("db", mem_options(&storage)).unwrap();
    assert_eq!(db.info().record_count, 200);
    for i in 0..200u32 {
        let key = format!("key{i:05}");
        assert_eq!(db.get(key.as_bytes()).unwrap(), vec![5u8; 100]);
    }
    db.close().unwrap();
}

#[test]
fn torn_wal_tail_reads_as_end_of_log() {
    let storage = MemStorage::new();
    let mut db = Database::open("db", mem_options(&storage)).unwrap();
    db.insert(b"a", b"1").unwrap();

    // Crash mid-transaction with blocks already in the newest segment,
    // then tear that segment mid-block as an interrupted write would.
    let mut txn = db.begin().unwrap();
    for i in 0..300u32 {
        let key = format!("key{i:05}");
        txn.insert(key.as_bytes(), &[7u8; 48]).unwrap();
    }
    mem::forget(txn);
    crash(db);

    let mut segments: Vec<String> = storage
        .get_children("db")
        .unwrap()
        .into_iter()
        .filter(|name| name.starts_with("wal-"))
        .collect();
    segments.sort();
    let last = format!("db/{}", segments.last().unwrap());
    let size = storage.file_size(&last).unwrap();
    assert!(size > 100, "expected blocks in the newest segment");
    storage.resize_file(&last, size - 100).unwrap();

    // The database still opens; the committed record survives and the
    // torn transaction is gone.
    let mut db = Database::open("db", mem_options(&storage)).unwrap();
    assert_eq!(db.get(b"a").unwrap(), b"1");
    assert_eq!(db.info().record_count, 1);
    db.close().unwrap();
}

#[test]
fn corrupt_file_header_refuses_to_open() {
    let storage = MemStorage::new();
    let db = Database::open("db", mem_options(&storage)).unwrap();
    db.close().unwrap();

    let mut editor = storage.random_editor("db/data").unwrap();
    editor.write(&[0xFF, 0xFF, 0xFF, 0xFF], 0).unwrap();

    assert!(matches!(
        Database::open("db", mem_options(&storage)),
        Err(calicodb::Error::Corruption(_))
    ));
}

#[test]
fn sticky_error_clears_on_abort() {
    let storage = MemStorage::new();
    let mut db = Database::open("db", mem_options(&storage)).unwrap();
    db.insert(b"k", b"v").unwrap();
    assert!(db.status().is_ok());

    // A clean transaction leaves no sticky error behind.
    let mut txn = db.begin().unwrap();
    txn.insert(b"k2", b"v2").unwrap();
    txn.abort().unwrap();
    assert!(db.status().is_ok());
    assert!(db.get(b"k2").unwrap_err().is_not_found());
    db.close().unwrap();
}
