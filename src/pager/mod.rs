//! The buffer pool.
//!
//! Pages are exposed as borrowed handles (`Page`) holding a copy of the
//! frame contents. Exactly one writable borrow per page is allowed at a
//! time. The pager coordinates write-ahead logging on every mutation: the
//! first upgrade of a page within a transaction logs a full before-image,
//! and releasing a modified page logs a delta record and stamps the page
//! LSN. Dirty pages stay cached until `flush` writes them back, which is
//! only permitted once their WAL records are durable.

mod cache;
mod frames;
mod freelist;
pub mod page;
pub mod pointer_map;

pub use page::{Page, PageDelta};

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{RandomEditor, Storage};
use crate::tree::header::read_page_lsn_raw;
use crate::types::{Lsn, PageId};
use crate::wal::{Wal, WalPayload};
use cache::PageCache;
use frames::FramePool;
use page::compress_deltas;

/// Smallest number of page frames the pool will be built with.
pub const MIN_FRAME_COUNT: usize = 16;

/// What a forward replay saw.
#[derive(Debug, Clone, Copy)]
pub struct RedoSummary {
    pub last_lsn: Lsn,
    pub commit_lsn: Lsn,
}

pub struct Pager {
    storage: Arc<dyn Storage>,
    data_path: String,
    file: Box<dyn RandomEditor>,
    pub(crate) wal: Wal,
    frames: FramePool,
    cache: PageCache,
    /// `(page_id, record_lsn)` in first-dirtied order. `record_lsn` is the
    /// page's LSN when it first went dirty in this commit epoch and is not
    /// updated by later writes.
    dirty: Vec<(PageId, Lsn)>,
    /// Pages whose before-image has been logged this transaction.
    imaged: HashSet<PageId>,
    in_txn: bool,
    page_count: u64,
    page_size: usize,
    freelist_head: PageId,
    recovery_floor: Lsn,
}

impl Pager {
    pub fn open(
        storage: Arc<dyn Storage>,
        data_path: &str,
        wal: Wal,
        page_size: usize,
        frame_count: usize,
        page_count: u64,
    ) -> Result<Pager> {
        let file = storage.random_editor(data_path)?;
        Ok(Pager {
            storage,
            data_path: data_path.to_string(),
            file,
            wal,
            frames: FramePool::new(page_size, frame_count.max(MIN_FRAME_COUNT)),
            cache: PageCache::new(),
            dirty: Vec::new(),
            imaged: HashSet::new(),
            in_txn: false,
            page_count,
            page_size,
            freelist_head: PageId::NULL,
            recovery_floor: Lsn::NULL,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn set_page_count(&mut self, page_count: u64) {
        self.page_count = page_count;
    }

    pub fn freelist_head(&self) -> PageId {
        self.freelist_head
    }

    pub fn set_freelist_head(&mut self, head: PageId) {
        self.freelist_head = head;
    }

    pub fn begin_txn(&mut self) {
        self.in_txn = true;
    }

    /// Leave the transaction and forget which pages have before-images.
    pub fn finish_txn(&mut self) {
        self.in_txn = false;
        self.imaged.clear();
    }

    /// Drop any borrows leaked by a failed operation's error path.
    pub fn reset_borrows(&mut self) {
        self.frames.reset_borrows();
    }

    pub fn cache_hit_ratio(&self) -> f64 {
        self.cache.hit_ratio()
    }

    fn write_back(&mut self, id: PageId, frame: usize) -> Result<()> {
        debug_assert_eq!(self.frames.frame(frame).page_id, id);
        let offset = id.file_offset(self.page_size);
        self.file.write(self.frames.data(frame), offset)?;
        Ok(())
    }

    /// Find a frame for `id`, evicting if the free stack is empty.
    /// Candidates are scanned FIFO; pinned frames and frames whose LSN is
    /// past the WAL durability point are bypassed.
    fn grab_frame(&mut self, id: PageId) -> Result<usize> {
        if let Some(frame) = self.frames.take_free(id) {
            return Ok(frame);
        }
        for attempt in 0..2 {
            let flushed = self.wal.flushed_lsn();
            let candidate = {
                let frames = &self.frames;
                self.cache.evict_candidate(|victim, frame| {
                    if frames.frame(frame).refcount > 0 || frames.frame(frame).write_borrowed {
                        return false;
                    }
                    read_page_lsn_raw(frames.data(frame), victim) <= flushed
                })
            };
            if let Some((victim, frame)) = candidate {
                if let Some(position) = self.dirty.iter().position(|(d, _)| *d == victim) {
                    self.write_back(victim, frame)?;
                    self.dirty.remove(position);
                }
                self.cache.erase(victim);
                self.frames.give_back(frame);
                return Ok(self.frames.take_free(id).expect("frame was just freed"));
            }
            if attempt == 0 && self.wal.is_running() {
                self.wal.flush()?;
            }
        }
        Err(Error::LogicError(
            "frame pool exhausted: every frame is pinned".to_string(),
        ))
    }

    /// Read-only borrow of a page, through the cache.
    pub fn acquire(&mut self, id: PageId) -> Result<Page> {
        debug_assert!(!id.is_null());
        if let Some(frame) = self.cache.get(id) {
            self.frames.pin(frame);
            return Ok(Page::new(id, self.frames.data(frame).to_vec()));
        }
        let frame = self.grab_frame(id)?;
        let offset = id.file_offset(self.page_size);
        let n = self.file.read(self.frames.data_mut(frame), offset)?;
        if n < self.page_size {
            // The page may live only in the WAL and the cache so far.
            self.frames.data_mut(frame)[n..].fill(0);
        }
        if id.0 > self.page_count {
            // Recovery replays records for pages the stored header does
            // not cover yet.
            self.page_count = id.0;
        }
        self.cache.insert(id, frame);
        self.frames.pin(frame);
        Ok(Page::new(id, self.frames.data(frame).to_vec()))
    }

    /// Install a zeroed frame for a page that has never existed.
    fn acquire_fresh(&mut self, id: PageId) -> Result<Page> {
        debug_assert!(!self.cache.contains(id));
        let frame = self.grab_frame(id)?;
        self.frames.data_mut(frame).fill(0);
        self.cache.insert(id, frame);
        self.frames.pin(frame);
        Ok(Page::new(id, vec![0; self.page_size]))
    }

    /// Turn a read borrow into the page's single write borrow. The first
    /// upgrade of a page within a transaction logs its before-image.
    pub fn upgrade(&mut self, page: &mut Page) -> Result<()> {
        if page.is_writable() {
            return Err(Error::LogicError(format!(
                "page {} is already writable",
                page.id()
            )));
        }
        let frame = self
            .cache
            .peek(page.id())
            .ok_or_else(|| Error::LogicError(format!("page {} is not resident", page.id())))?;
        if self.frames.frame(frame).write_borrowed {
            return Err(Error::LogicError(format!(
                "page {} already has a writer",
                page.id()
            )));
        }
        self.frames.frame_mut(frame).write_borrowed = true;
        page.set_writable(true);

        if self.in_txn && !self.imaged.contains(&page.id()) {
            self.wal.log_image(page.id(), page.data())?;
            self.imaged.insert(page.id());
        }
        Ok(())
    }

    /// Return a borrow. A writable page with modifications gets its LSN
    /// stamped, its deltas logged, and its bytes copied back to the frame.
    pub fn release(&mut self, mut page: Page) -> Result<()> {
        let id = page.id();
        let frame = self
            .cache
            .peek(id)
            .ok_or_else(|| Error::LogicError(format!("released page {id} is not resident")))?;

        if page.is_writable() {
            self.frames.frame_mut(frame).write_borrowed = false;
            if !page.deltas().is_empty() {
                let lsn = self.wal.current_lsn().next();
                crate::tree::header::write_page_lsn(&mut page, lsn);
                compress_deltas(page.deltas_mut());
                let spans: Vec<(usize, usize)> = page
                    .deltas()
                    .iter()
                    .map(|d| (d.offset, d.size))
                    .collect();
                let assigned = self.wal.log_deltas(id, page.data(), &spans)?;
                debug_assert_eq!(assigned, lsn);
                self.frames.data_mut(frame).copy_from_slice(page.data());
                if !self.dirty.iter().any(|(d, _)| *d == id) {
                    self.dirty.push((id, lsn));
                }
            }
        }
        self.frames.unpin(frame);
        Ok(())
    }

    /// Install already-logged content during recovery or abort: no new WAL
    /// records, no LSN stamping (the bytes carry their own LSN).
    pub(crate) fn apply_restored(&mut self, page: Page) -> Result<()> {
        let id = page.id();
        let frame = self
            .cache
            .peek(id)
            .ok_or_else(|| Error::LogicError(format!("restored page {id} is not resident")))?;
        self.frames.data_mut(frame).copy_from_slice(page.data());
        if !self.dirty.iter().any(|(d, _)| *d == id) {
            let lsn = read_page_lsn_raw(page.data(), id);
            self.dirty.push((id, lsn));
        }
        self.frames.unpin(frame);
        Ok(())
    }

    /// Hand out a writable page: off the freelist if possible, otherwise
    /// by extending the file. Reserved positions (the root and pointer-map
    /// pages) are skipped.
    pub fn allocate(&mut self) -> Result<Page> {
        if let Some(page) = self.freelist_pop()? {
            return Ok(page);
        }
        let mut id = PageId(self.page_count + 1);
        if pointer_map::is_map_page(id, self.page_size) {
            self.page_count += 1;
            id = PageId(self.page_count + 1);
        }
        self.page_count += 1;
        let mut page = self.acquire_fresh(id)?;
        self.upgrade(&mut page)?;
        Ok(page)
    }

    /// Give a page back for reuse; it is pushed onto the freelist.
    pub fn free(&mut self, page: Page) -> Result<()> {
        self.freelist_push(page)
    }

    /// Write back every dirty page whose record LSN is at or below
    /// `up_to` (all of them when `None`). Pages are never written while
    /// their WAL records are not durable.
    pub fn flush(&mut self, up_to: Option<Lsn>) -> Result<()> {
        if self.wal.is_running() {
            self.wal.flush()?;
        }
        let flushed = self.wal.flushed_lsn();
        let entries = std::mem::take(&mut self.dirty);
        let mut keep = Vec::new();
        let mut failure = None;
        for (id, record_lsn) in entries {
            if failure.is_some() {
                keep.push((id, record_lsn));
                continue;
            }
            if let Some(limit) = up_to {
                if record_lsn > limit {
                    keep.push((id, record_lsn));
                    continue;
                }
            }
            let Some(frame) = self.cache.peek(id) else {
                // Truncation already discarded this page.
                continue;
            };
            let page_lsn = read_page_lsn_raw(self.frames.data(frame), id);
            if page_lsn > flushed {
                keep.push((id, record_lsn));
                failure = Some(Error::LogicError(format!(
                    "page {id} (lsn {page_lsn}) is ahead of the durable WAL ({flushed})"
                )));
                continue;
            }
            if let Err(e) = self.write_back(id, frame) {
                keep.push((id, record_lsn));
                failure = Some(e);
            }
        }
        self.dirty = keep;
        if let Some(error) = failure {
            return Err(error);
        }
        self.file.sync()?;
        let _ = self.recovery_lsn();
        Ok(())
    }

    /// Lowest LSN that might still need replay: the minimum record LSN
    /// over dirty pages, or the WAL's durability point when nothing is
    /// dirty. Monotonically non-decreasing.
    pub fn recovery_lsn(&mut self) -> Lsn {
        let computed = self
            .dirty
            .iter()
            .map(|&(_, lsn)| lsn)
            .min()
            .unwrap_or_else(|| self.wal.flushed_lsn());
        if computed > self.recovery_floor {
            self.recovery_floor = computed;
        }
        self.recovery_floor
    }

    /// Replay records with LSN >= `from`, applying deltas and images to
    /// pages whose LSN is behind, and tracking the last commit seen.
    pub fn recover_redo(&mut self, from: Lsn) -> Result<RedoSummary> {
        let mut summary = RedoSummary {
            last_lsn: Lsn::NULL,
            commit_lsn: Lsn::NULL,
        };
        for (id, is_last) in self.wal.segments_forward(from)? {
            for (lsn, payload) in self.wal.read_segment_records(id, is_last)? {
                if lsn < from {
                    continue;
                }
                summary.last_lsn = lsn;
                match payload {
                    WalPayload::Commit => summary.commit_lsn = lsn,
                    WalPayload::Delta { page_id, deltas } => {
                        let mut page = self.acquire(page_id)?;
                        if lsn > page.lsn() {
                            for delta in &deltas {
                                let end = delta.offset + delta.data.len();
                                if end > self.page_size {
                                    self.release(page)?;
                                    return Err(Error::Corruption(format!(
                                        "delta for page {page_id} overruns the page"
                                    )));
                                }
                                page.data_mut_untracked()[delta.offset..end]
                                    .copy_from_slice(&delta.data);
                            }
                            self.apply_restored(page)?;
                        } else {
                            self.release(page)?;
                        }
                    }
                    WalPayload::FullImage { page_id, image } => {
                        let mut page = self.acquire(page_id)?;
                        if image.len() != self.page_size {
                            self.release(page)?;
                            return Err(Error::Corruption(format!(
                                "image for page {page_id} has size {}",
                                image.len()
                            )));
                        }
                        if lsn > page.lsn() {
                            page.data_mut_untracked().copy_from_slice(&image);
                            self.apply_restored(page)?;
                        } else {
                            self.release(page)?;
                        }
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Walk the log backward applying full images until a record with
    /// LSN <= `to` is reached. Used by abort and by the undo half of
    /// open-time recovery.
    pub fn recover_undo(&mut self, to: Lsn) -> Result<()> {
        for (id, is_last) in self.wal.segments_backward() {
            let records = self.wal.read_segment_records(id, is_last)?;
            for (lsn, payload) in records.into_iter().rev() {
                if lsn <= to {
                    return Ok(());
                }
                if let WalPayload::FullImage { page_id, image } = payload {
                    if image.len() != self.page_size {
                        return Err(Error::Corruption(format!(
                            "image for page {page_id} has size {}",
                            image.len()
                        )));
                    }
                    let mut page = self.acquire(page_id)?;
                    page.data_mut_untracked().copy_from_slice(&image);
                    self.apply_restored(page)?;
                }
            }
        }
        Ok(())
    }

    /// Pull the recovery floor back after the log has been truncated.
    pub fn rewind_recovery_floor(&mut self, lsn: Lsn) {
        if self.recovery_floor > lsn {
            self.recovery_floor = lsn;
        }
    }

    /// Shrink the file to `new_page_count` pages and drop cache entries
    /// beyond the boundary.
    pub fn truncate(&mut self, new_page_count: u64) -> Result<()> {
        for (_, frame) in self.cache.purge_beyond(new_page_count) {
            self.frames.give_back(frame);
        }
        self.dirty.retain(|(id, _)| id.0 <= new_page_count);
        self.storage
            .resize_file(&self.data_path, new_page_count * self.page_size as u64)?;
        self.page_count = new_page_count;
        Ok(())
    }
}
