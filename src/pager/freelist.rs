//! The free-page list.
//!
//! Freed pages form a LIFO stack threaded through the pages themselves:
//! each freelist page stores its successor's id right after the page LSN,
//! and the head id lives in the file header. Every update is an ordinary
//! tracked page write, so freelist changes are WAL-logged and roll back
//! with the transaction.

use crate::encoding::{get_u64, put_u64};
use crate::error::Result;
use crate::pager::pointer_map::PointerKind;
use crate::pager::{Page, Pager};
use crate::types::PageId;

const NEXT_OFFSET: usize = 8;

impl Pager {
    /// Prepend `page` to the freelist.
    pub(crate) fn freelist_push(&mut self, mut page: Page) -> Result<()> {
        debug_assert!(!page.id().is_root());
        if !page.is_writable() {
            self.upgrade(&mut page)?;
        }
        let id = page.id();
        let old_head = self.freelist_head();
        put_u64(page.span(NEXT_OFFSET, 8), old_head.0);
        self.release(page)?;

        if !old_head.is_null() {
            self.ptrmap_write(old_head, PointerKind::Freelist, id)?;
        }
        self.ptrmap_write(id, PointerKind::Freelist, PageId::NULL)?;
        self.set_freelist_head(id);
        Ok(())
    }

    /// Pop the head of the freelist, returning it as a writable page. The
    /// caller decides the page's new role and pointer-map entry.
    pub(crate) fn freelist_pop(&mut self) -> Result<Option<Page>> {
        let head = self.freelist_head();
        if head.is_null() {
            return Ok(None);
        }
        let mut page = self.acquire(head)?;
        if let Err(e) = self.upgrade(&mut page) {
            self.release(page)?;
            return Err(e);
        }
        let next = PageId(get_u64(page.view(NEXT_OFFSET, 8)));
        if !next.is_null() {
            self.ptrmap_write(next, PointerKind::Freelist, PageId::NULL)?;
        }
        self.set_freelist_head(next);
        Ok(Some(page))
    }
}
