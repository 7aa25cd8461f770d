//! CalicoDB: an embedded, single-writer key-value store.
//!
//! Keys and values are arbitrary byte strings. The store is a disk-
//! resident B+tree behind a buffer pool, with a segmented write-ahead log
//! providing durability, transaction rollback, and crash recovery.
//!
//! ```no_run
//! use calicodb::{Database, Options};
//!
//! let mut db = Database::open("/tmp/example", Options::default()).unwrap();
//! db.insert(b"key", b"value").unwrap();
//!
//! let mut txn = db.begin().unwrap();
//! txn.insert(b"a", b"1").unwrap();
//! txn.insert(b"b", b"2").unwrap();
//! txn.commit().unwrap();
//!
//! assert_eq!(db.get(b"a").unwrap(), b"1");
//! db.close().unwrap();
//! ```

mod db;
mod encoding;
mod error;
mod info_log;
mod pager;
mod storage;
mod tree;
mod types;
mod wal;

pub use crate::db::{Cursor, Database, Options, Statistics, Transaction, DEFAULT_PAGE_SIZE};
pub use crate::error::{Error, Result};
pub use crate::info_log::InfoLog;
pub use crate::storage::{
    AppendWriter, MemStorage, PosixStorage, RandomEditor, RandomReader, Storage,
};
pub use crate::types::{Lsn, PageId};
