//! Explicit transactions.
//!
//! `Transaction` borrows the database mutably for its lifetime, so there
//! is exactly one live transaction and no database call can slip past it.
//! Dropping a transaction that was neither committed nor aborted rolls it
//! back.

use crate::error::Result;

use super::Database;

pub struct Transaction<'a> {
    db: &'a mut Database,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(db: &'a mut Database) -> Transaction<'a> {
        Transaction {
            db,
            finished: false,
        }
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.txn_insert(key, value)
    }

    /// `NotFound` if the key is absent.
    pub fn erase(&mut self, key: &[u8]) -> Result<()> {
        self.db.txn_erase(key)
    }

    /// Reads inside the transaction observe its uncommitted writes.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.db.txn_get(key)
    }

    pub fn status(&self) -> Result<()> {
        self.db.status()
    }

    /// Make the transaction durable. On failure the transaction is rolled
    /// back and the original error returned.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        match self.db.txn_commit() {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.db.txn_abort();
                Err(e)
            }
        }
    }

    /// Undo every change made in the transaction.
    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        self.db.txn_abort()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.db.txn_abort() {
                log::warn!("implicit abort failed: {e}");
            }
        }
    }
}
