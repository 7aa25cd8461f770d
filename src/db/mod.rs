//! The public database handle.
//!
//! `Database` ties the layers together: it owns the storage, the pager
//! (which owns the WAL), and the tree, and runs the transaction
//! lifecycle. Mutations outside an explicit transaction run as their own
//! single-operation transaction. Exactly one transaction is active at a
//! time; the borrow held by `Transaction` enforces that statically.

mod recovery;
mod transaction;

pub use transaction::Transaction;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::info_log::{FileInfoLog, InfoLog, NullInfoLog};
use crate::pager::{Pager, MIN_FRAME_COUNT};
use crate::storage::{join_path, PosixStorage, Storage};
use crate::tree::cursor::CursorPosition;
use crate::tree::header::{FileHeader, NodeHeader, FILE_HEADER_SIZE};
use crate::tree::BPlusTree;
use crate::types::{Lsn, PageId};
use crate::wal::record::decode_segment_name;
use crate::wal::Wal;

pub const DEFAULT_PAGE_SIZE: usize = 16_384;
const DEFAULT_CACHE_PAGES: usize = 256;

const DATA_FILENAME: &str = "data";
const LOG_FILENAME: &str = "log";

/// Recognized open-time options.
pub struct Options {
    /// Power of two in `[512, 65536]`. Fixed at creation; ignored when
    /// opening an existing database.
    pub page_size: usize,
    /// Page cache size in bytes; at least 16 pages. Zero picks a default.
    pub cache_size: usize,
    /// Bytes per WAL segment file.
    pub wal_segment_limit: usize,
    /// Directory for WAL segments; defaults to the database directory.
    pub wal_prefix: Option<String>,
    /// Injected storage backend; defaults to the POSIX filesystem.
    pub storage: Option<Arc<dyn Storage>>,
    /// Injected informational log sink; defaults to `<db>/log`.
    pub info_log: Option<Box<dyn InfoLog>>,
    /// Create the database if it does not exist.
    pub create_if_missing: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: 0,
            wal_segment_limit: 0,
            wal_prefix: None,
            storage: None,
            info_log: None,
            create_if_missing: true,
        }
    }
}

impl Options {
    fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || !(512..=65_536).contains(&self.page_size) {
            return Err(Error::InvalidArgument(format!(
                "page size must be a power of two in [512, 65536], got {}",
                self.page_size
            )));
        }
        if self.cache_size != 0 && self.cache_size < MIN_FRAME_COUNT * self.page_size {
            return Err(Error::InvalidArgument(format!(
                "cache size must be at least {} bytes",
                MIN_FRAME_COUNT * self.page_size
            )));
        }
        if self.wal_segment_limit != 0 && self.wal_segment_limit < self.page_size {
            return Err(Error::InvalidArgument(
                "WAL segment limit must hold at least one page".to_string(),
            ));
        }
        Ok(())
    }
}

/// A point-in-time snapshot of engine counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Statistics {
    pub record_count: u64,
    pub page_count: u64,
    pub page_size: usize,
    pub maximum_key_size: usize,
    pub cache_hit_ratio: f64,
}

pub struct Database {
    path: String,
    pub(crate) pager: Pager,
    pub(crate) tree: BPlusTree,
    pub(crate) record_count: u64,
    /// LSN of the most recent durable commit.
    pub(crate) commit_lsn: Lsn,
    pub(crate) in_txn: bool,
    sticky: Option<Error>,
    info_log: Box<dyn InfoLog>,
    closed: bool,
}

impl Database {
    /// Open (or create) the database in directory `path`.
    pub fn open(path: &str, mut options: Options) -> Result<Database> {
        options.validate()?;
        let storage: Arc<dyn Storage> = options
            .storage
            .take()
            .unwrap_or_else(|| Arc::new(PosixStorage::new()));

        let path = path.trim_end_matches('/').to_string();
        let data_path = join_path(&path, DATA_FILENAME);
        let exists = storage.file_exists(&data_path);
        if !exists && !options.create_if_missing {
            return Err(Error::NotFound(format!("database does not exist: {path}")));
        }
        storage.create_directory(&path)?;
        let wal_dir = options.wal_prefix.clone().unwrap_or_else(|| path.clone());
        storage.create_directory(&wal_dir)?;

        let header = if exists {
            let reader = storage.random_reader(&data_path)?;
            let mut bytes = [0u8; FILE_HEADER_SIZE];
            let n = reader.read(&mut bytes, 0)?;
            if n < FILE_HEADER_SIZE {
                return Err(Error::Corruption(
                    "data file is shorter than the file header".to_string(),
                ));
            }
            FileHeader::decode(&bytes)?
        } else {
            Self::create_data_file(storage.as_ref(), &data_path, options.page_size)?
        };
        let page_size = header.page_size;

        let cache_size = if options.cache_size == 0 {
            DEFAULT_CACHE_PAGES * page_size
        } else {
            options.cache_size
        };
        let segment_limit = if options.wal_segment_limit == 0 {
            32 * page_size
        } else {
            options.wal_segment_limit
        };

        let wal = Wal::open(storage.clone(), &wal_dir, page_size, segment_limit)?;
        let mut pager = Pager::open(
            storage.clone(),
            &data_path,
            wal,
            page_size,
            cache_size / page_size,
            header.page_count,
        )?;
        pager.set_freelist_head(header.freelist_head);

        let info_log: Box<dyn InfoLog> = match options.info_log.take() {
            Some(sink) => sink,
            None => match FileInfoLog::open(storage.as_ref(), &join_path(&path, LOG_FILENAME)) {
                Some(sink) => Box::new(sink),
                None => Box::new(NullInfoLog),
            },
        };

        let mut db = Database {
            path,
            pager,
            tree: BPlusTree::new(page_size),
            record_count: header.record_count,
            commit_lsn: Lsn::NULL,
            in_txn: false,
            sticky: None,
            info_log,
            closed: false,
        };
        db.recover_on_open(header.recovery_lsn)?;
        db.log_info(&format!(
            "opened database at {} (page_size={page_size}, page_count={})",
            db.path,
            db.pager.page_count()
        ));
        Ok(db)
    }

    /// Lay down page 1 of a brand-new database: file header plus an empty
    /// external root node.
    fn create_data_file(
        storage: &dyn Storage,
        data_path: &str,
        page_size: usize,
    ) -> Result<FileHeader> {
        let header = FileHeader {
            page_count: 1,
            record_count: 0,
            freelist_head: PageId::NULL,
            recovery_lsn: Lsn::NULL,
            page_size,
        };
        let mut page = crate::pager::Page::new(PageId::ROOT, vec![0u8; page_size]);
        page.set_writable(true);
        header.write(&mut page);
        NodeHeader {
            is_external: true,
            cell_start: page_size as u32,
            ..NodeHeader::default()
        }
        .write(&mut page);

        let mut editor = storage.random_editor(data_path)?;
        editor.write(page.data(), 0)?;
        editor.sync()?;
        Ok(header)
    }

    /// Remove every file belonging to the database at `path`.
    pub fn destroy(path: &str, options: Options) -> Result<()> {
        let storage: Arc<dyn Storage> = options
            .storage
            .unwrap_or_else(|| Arc::new(PosixStorage::new()));
        let path = path.trim_end_matches('/');

        if let Some(wal_dir) = &options.wal_prefix {
            for name in storage.get_children(wal_dir)? {
                if !decode_segment_name(&name).is_null() {
                    storage.remove_file(&join_path(wal_dir, &name))?;
                }
            }
        }
        storage.remove_directory(path)
    }

    /// The sticky error, if a failed transaction is pending abort.
    pub fn status(&self) -> Result<()> {
        match &self.sticky {
            Some(e) => Err(e.redacted_clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn log_info(&mut self, message: &str) {
        self.info_log.log(message);
        log::info!("{message}");
    }

    /// Engine counters and limits.
    pub fn info(&self) -> Statistics {
        Statistics {
            record_count: self.record_count,
            page_count: self.pager.page_count(),
            page_size: self.pager.page_size(),
            maximum_key_size: self.tree.max_key_size(),
            cache_hit_ratio: self.pager.cache_hit_ratio(),
        }
    }

    /// Begin an explicit transaction. The returned guard aborts on drop
    /// unless committed.
    pub fn begin(&mut self) -> Result<Transaction<'_>> {
        self.txn_begin()?;
        Ok(Transaction::new(self))
    }

    /// Insert or replace, as its own transaction.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.txn_begin()?;
        let result = self.txn_insert(key, value);
        self.finish_autocommit(result)
    }

    /// Erase a key, as its own transaction. `NotFound` if absent.
    pub fn erase(&mut self, key: &[u8]) -> Result<()> {
        self.txn_begin()?;
        let result = self.txn_erase(key);
        self.finish_autocommit(result)
    }

    /// Commit a single-operation transaction, rolling back if either the
    /// operation or the commit itself failed.
    fn finish_autocommit(&mut self, result: Result<()>) -> Result<()> {
        let outcome = result.and_then(|()| self.txn_commit());
        if outcome.is_err() && self.in_txn {
            let _ = self.txn_abort();
        }
        outcome
    }

    /// Look up a key. `NotFound` if absent.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.status()?;
        self.validate_key(key)?;
        match self.tree.get(&mut self.pager, key)? {
            Some(value) => Ok(value),
            None => Err(Error::NotFound("key does not exist".to_string())),
        }
    }

    /// An ordered cursor over the records. The cursor borrows the
    /// database exclusively, so no mutation can invalidate it while it
    /// lives.
    pub fn new_cursor(&mut self) -> Cursor<'_> {
        Cursor {
            db: self,
            position: None,
            error: None,
        }
    }

    /// Compact the data file, as its own transaction.
    pub fn vacuum(&mut self) -> Result<()> {
        self.txn_begin()?;
        let result = {
            let Database { tree, pager, .. } = self;
            tree.vacuum(pager)
        };
        match &result {
            Ok(()) => {}
            Err(e) => self.stick(e),
        }
        let outcome = self.finish_autocommit(result);
        if outcome.is_ok() {
            self.log_info("vacuum finished");
        }
        outcome
    }

    /// Flush everything and shut down cleanly.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.in_txn {
            return Err(Error::LogicError(
                "cannot close with an active transaction".to_string(),
            ));
        }
        self.pager.flush(None)?;
        let recovery_lsn = self.pager.recovery_lsn();
        self.pager.wal.remove_before(recovery_lsn)?;
        self.pager.wal.stop()?;
        self.log_info("closed database");
        Ok(())
    }

    pub(crate) fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("keys cannot be empty".to_string()));
        }
        if key.len() > self.tree.max_key_size() {
            return Err(Error::InvalidArgument(format!(
                "key of length {} exceeds the maximum of {}",
                key.len(),
                self.tree.max_key_size()
            )));
        }
        Ok(())
    }

    /// Remember the first non-recoverable error of the transaction.
    pub(crate) fn stick(&mut self, e: &Error) {
        let recoverable = matches!(e, Error::NotFound(_) | Error::InvalidArgument(_));
        if !recoverable && self.sticky.is_none() {
            self.sticky = Some(e.redacted_clone());
        }
    }

    pub(crate) fn txn_begin(&mut self) -> Result<()> {
        if self.in_txn {
            return Err(Error::LogicError(
                "a transaction is already active".to_string(),
            ));
        }
        self.status()?;
        self.pager.begin_txn();
        self.in_txn = true;
        Ok(())
    }

    pub(crate) fn txn_insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(self.in_txn);
        self.status()?;
        self.validate_key(key)?;
        match self.tree.insert(&mut self.pager, key, value) {
            Ok(added) => {
                if added {
                    self.record_count += 1;
                }
                Ok(())
            }
            Err(e) => {
                self.stick(&e);
                Err(e)
            }
        }
    }

    pub(crate) fn txn_erase(&mut self, key: &[u8]) -> Result<()> {
        debug_assert!(self.in_txn);
        self.status()?;
        self.validate_key(key)?;
        match self.tree.erase(&mut self.pager, key) {
            Ok(true) => {
                self.record_count -= 1;
                Ok(())
            }
            Ok(false) => Err(Error::NotFound("key does not exist".to_string())),
            Err(e) => {
                self.stick(&e);
                Err(e)
            }
        }
    }

    pub(crate) fn txn_get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.status()?;
        self.validate_key(key)?;
        match self.tree.get(&mut self.pager, key)? {
            Some(value) => Ok(value),
            None => Err(Error::NotFound("key does not exist".to_string())),
        }
    }

    /// The commit protocol. The durability point is the WAL flush of the
    /// commit record; data pages dirtied before the previous commit are
    /// written back afterwards, and obsolete segments removed.
    pub(crate) fn txn_commit(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(Error::LogicError("no active transaction".to_string()));
        }
        self.status()?;
        let previous_commit = self.commit_lsn;

        let result = (|| -> Result<Lsn> {
            self.write_header()?;
            let commit_lsn = self.pager.wal.log_commit()?;
            self.pager.wal.flush()?;
            debug_assert!(self.pager.wal.flushed_lsn() >= commit_lsn);
            self.pager.wal.advance()?;
            self.pager.flush(Some(previous_commit))?;
            let recovery_lsn = self.pager.recovery_lsn();
            self.pager.wal.remove_before(recovery_lsn)?;
            Ok(commit_lsn)
        })();

        match result {
            Ok(commit_lsn) => {
                self.commit_lsn = commit_lsn;
                self.pager.finish_txn();
                self.in_txn = false;
                Ok(())
            }
            Err(e) => {
                self.stick(&e);
                Err(e)
            }
        }
    }

    /// The abort protocol: undo with full images, persist the undone
    /// pages, drop the transaction's WAL suffix, reload header state.
    pub(crate) fn txn_abort(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(Error::LogicError("no active transaction".to_string()));
        }
        self.pager.reset_borrows();
        self.pager.finish_txn();
        self.pager.wal.flush()?;
        self.pager.recover_undo(self.commit_lsn)?;
        self.pager.flush(None)?;
        self.pager.wal.truncate(self.commit_lsn)?;
        self.pager.rewind_recovery_floor(self.commit_lsn);
        self.load_header_state()?;
        self.sticky = None;
        self.in_txn = false;
        self.log_info(&format!("rolled back to lsn {}", self.commit_lsn));
        Ok(())
    }

    /// Refresh in-memory state from the (restored) file header.
    pub(crate) fn load_header_state(&mut self) -> Result<()> {
        let page = self.pager.acquire(PageId::ROOT)?;
        let header = FileHeader::read(&page)?;
        self.pager.release(page)?;

        self.record_count = header.record_count;
        self.pager.set_freelist_head(header.freelist_head);
        if self.pager.page_count() > header.page_count {
            self.pager.truncate(header.page_count)?;
        } else {
            self.pager.set_page_count(header.page_count);
        }
        Ok(())
    }

    /// Write current engine state into page 1 as an ordinary tracked
    /// write. Part of the commit protocol.
    pub(crate) fn write_header(&mut self) -> Result<()> {
        let recovery_lsn = self.pager.recovery_lsn();
        let header = FileHeader {
            page_count: self.pager.page_count(),
            record_count: self.record_count,
            freelist_head: self.pager.freelist_head(),
            recovery_lsn,
            page_size: self.pager.page_size(),
        };
        let mut page = self.pager.acquire(PageId::ROOT)?;
        if let Err(e) = self.pager.upgrade(&mut page) {
            self.pager.release(page)?;
            return Err(e);
        }
        header.write(&mut page);
        self.pager.release(page)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed && !self.in_txn {
            if let Err(e) = self.shutdown() {
                log::warn!("error while closing database: {e}");
            }
        }
    }
}

/// A stateful position over the ordered records.
pub struct Cursor<'a> {
    db: &'a mut Database,
    position: Option<CursorPosition>,
    error: Option<Error>,
}

impl Cursor<'_> {
    fn apply(&mut self, moved: Result<Option<CursorPosition>>) {
        match moved {
            Ok(position) => {
                self.position = position;
                self.error = None;
            }
            Err(e) => {
                self.position = None;
                self.error = Some(e);
            }
        }
    }

    pub fn seek_first(&mut self) {
        let moved = self.db.tree.seek_first(&mut self.db.pager);
        self.apply(moved);
    }

    pub fn seek_last(&mut self) {
        let moved = self.db.tree.seek_last(&mut self.db.pager);
        self.apply(moved);
    }

    /// Position at the first record with key >= `key`.
    pub fn seek(&mut self, key: &[u8]) {
        if let Err(e) = self.db.validate_key(key) {
            self.position = None;
            self.error = Some(e);
            return;
        }
        let moved = self.db.tree.seek_position(&mut self.db.pager, key);
        self.apply(moved);
    }

    pub fn next(&mut self) {
        match self.position {
            Some(position) => {
                let moved = self.db.tree.next_position(&mut self.db.pager, position);
                self.apply(moved);
            }
            None => self.position = None,
        }
    }

    pub fn previous(&mut self) {
        match self.position {
            Some(position) => {
                let moved = self
                    .db
                    .tree
                    .previous_position(&mut self.db.pager, position);
                self.apply(moved);
            }
            None => self.position = None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.position.is_some() && self.error.is_none()
    }

    pub fn status(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(e.redacted_clone()),
            None => Ok(()),
        }
    }

    pub fn key(&mut self) -> Result<Vec<u8>> {
        let Some(position) = self.position else {
            return Err(Error::NotFound("cursor is not valid".to_string()));
        };
        let (key, _) = self.db.tree.read_entry(&mut self.db.pager, position)?;
        Ok(key)
    }

    pub fn value(&mut self) -> Result<Vec<u8>> {
        let Some(position) = self.position else {
            return Err(Error::NotFound("cursor is not valid".to_string()));
        };
        let (_, value) = self.db.tree.read_entry(&mut self.db.pager, position)?;
        Ok(value)
    }
}
