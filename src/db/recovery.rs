//! Open-time crash recovery.
//!
//! Roll the log forward from the stored recovery LSN, applying whatever
//! the data file is missing; if the log does not end at a commit record,
//! roll backward undoing the tail with full images. Both passes are
//! idempotent under the page-LSN check, so a crash during recovery just
//! means recovery runs again.
//!
//! After an undo pass the engine commits a baseline header whose recovery
//! LSN points past the undone records; they can then never be replayed,
//! and their segments are unlinked.

use crate::error::Result;
use crate::types::Lsn;

use super::Database;

impl Database {
    pub(crate) fn recover_on_open(&mut self, recovery_lsn: Lsn) -> Result<()> {
        if self.pager.wal.is_empty() {
            // Fresh database, or a clean shutdown that consumed the log.
            self.pager.wal.start()?;
            return Ok(());
        }
        self.log_info(&format!("rolling forward from lsn {recovery_lsn}"));
        let summary = self.pager.recover_redo(recovery_lsn)?;
        self.log_info(&format!("rolled forward to lsn {}", summary.last_lsn));
        self.commit_lsn = summary.commit_lsn;

        let needs_undo = summary.last_lsn != summary.commit_lsn;
        if needs_undo {
            log::warn!(
                "missing commit record: rolling backward to lsn {}",
                summary.commit_lsn
            );
            self.pager.recover_undo(summary.commit_lsn)?;
            self.log_info(&format!("rolled backward to lsn {}", summary.commit_lsn));
        }
        self.pager.flush(None)?;
        self.load_header_state()?;
        self.pager.wal.start()?;

        if needs_undo {
            self.commit_baseline()?;
        }
        let recovery_lsn = self.pager.recovery_lsn();
        self.pager.wal.remove_before(recovery_lsn)?;
        Ok(())
    }

    /// Commit a header update whose recovery LSN points past everything
    /// currently in the log, fencing off undone records for good.
    fn commit_baseline(&mut self) -> Result<()> {
        self.pager.begin_txn();
        let result = (|| -> Result<Lsn> {
            let fence = self.pager.wal.current_lsn().next();
            let header = crate::tree::header::FileHeader {
                page_count: self.pager.page_count(),
                record_count: self.record_count,
                freelist_head: self.pager.freelist_head(),
                recovery_lsn: fence,
                page_size: self.pager.page_size(),
            };
            let mut page = self.pager.acquire(crate::types::PageId::ROOT)?;
            if let Err(e) = self.pager.upgrade(&mut page) {
                self.pager.release(page)?;
                return Err(e);
            }
            header.write(&mut page);
            self.pager.release(page)?;

            let commit_lsn = self.pager.wal.log_commit()?;
            self.pager.wal.flush()?;
            self.pager.wal.advance()?;
            self.pager.flush(None)?;
            Ok(commit_lsn)
        })();
        self.pager.finish_txn();
        self.commit_lsn = result?;
        Ok(())
    }
}
