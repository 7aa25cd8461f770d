//! Vacuum: shrink the data file by moving pages near the end into freed
//! slots, then truncating.
//!
//! Each step looks at the last page of the file. A free page is unlinked
//! from the freelist and dropped; an in-use page is copied into a slot
//! popped off the freelist, after which the one page that points at it
//! (found through the pointer map, or the node's own parent link) is
//! rewritten. When nothing can move, the file is as small as the live
//! data allows.

use crate::encoding::{get_u64, put_u64};
use crate::error::{Error, Result};
use crate::pager::pointer_map::{is_map_page, PointerEntry, PointerKind};
use crate::pager::{Page, Pager};
use crate::tree::BPlusTree;
use crate::types::PageId;

const LINK_OFFSET: usize = 8;

impl BPlusTree {
    /// Compact the file. Runs inside the caller's transaction.
    pub fn vacuum(&mut self, pager: &mut Pager) -> Result<()> {
        loop {
            let end = pager.page_count();
            if end <= 1 {
                return Ok(());
            }
            let last = PageId(end);
            if is_map_page(last, pager.page_size()) {
                // A trailing map page describes nothing.
                pager.truncate(end - 1)?;
                continue;
            }
            let Some(entry) = pager.ptrmap_read(last)? else {
                // Nothing on record for this page; stop rather than guess.
                return Ok(());
            };
            match entry.kind {
                PointerKind::Freelist => {
                    self.unlink_free_page(pager, last, entry.back_ptr)?;
                    pager.truncate(end - 1)?;
                }
                PointerKind::TreeRoot => {
                    return Err(Error::Corruption(
                        "tree root recorded at the end of the file".to_string(),
                    ));
                }
                _ => {
                    let Some(target) = pager.freelist_pop()? else {
                        return Ok(());
                    };
                    debug_assert!(target.id().0 < end);
                    self.relocate_page(pager, last, target, entry)?;
                    pager.truncate(end - 1)?;
                }
            }
        }
    }

    /// Remove `id` from the freelist; `predecessor` is the trunk page
    /// pointing at it (null when `id` is the head).
    fn unlink_free_page(
        &mut self,
        pager: &mut Pager,
        id: PageId,
        predecessor: PageId,
    ) -> Result<()> {
        // Upgrading forces a before-image into the log; truncation is not
        // logged, so this is what lets abort resurrect the page.
        let mut page = pager.acquire(id)?;
        pager.upgrade(&mut page)?;
        let next = PageId(get_u64(page.view(LINK_OFFSET, 8)));
        pager.release(page)?;

        if predecessor.is_null() {
            if pager.freelist_head() != id {
                return Err(Error::Corruption(format!(
                    "freelist page {id} has no predecessor but is not the head"
                )));
            }
            pager.set_freelist_head(next);
        } else {
            let mut trunk = pager.acquire(predecessor)?;
            pager.upgrade(&mut trunk)?;
            put_u64(trunk.span(LINK_OFFSET, 8), next.0);
            pager.release(trunk)?;
        }
        if !next.is_null() {
            pager.ptrmap_write(next, PointerKind::Freelist, predecessor)?;
        }
        Ok(())
    }

    /// Copy `from` into `target` and rewrite every pointer at it.
    fn relocate_page(
        &mut self,
        pager: &mut Pager,
        from: PageId,
        mut target: Page,
        entry: PointerEntry,
    ) -> Result<()> {
        // Log the source's before-image: truncation is not logged, and
        // abort needs the bytes to restore the page.
        let mut source = pager.acquire(from)?;
        pager.upgrade(&mut source)?;
        let data = source.data().to_vec();
        pager.release(source)?;

        let to = target.id();
        target.span(0, data.len()).copy_from_slice(&data);
        pager.release(target)?;

        match entry.kind {
            PointerKind::TreeNode => self.redirect_tree_node(pager, from, to),
            PointerKind::OverflowHead => {
                self.redirect_overflow_head(pager, from, to, entry.back_ptr, &data)
            }
            PointerKind::OverflowLink => {
                let predecessor = entry.back_ptr;
                let mut link = pager.acquire(predecessor)?;
                pager.upgrade(&mut link)?;
                put_u64(link.span(LINK_OFFSET, 8), to.0);
                pager.release(link)?;

                let next = PageId(get_u64(&data[LINK_OFFSET..LINK_OFFSET + 8]));
                if !next.is_null() {
                    pager.ptrmap_write(next, PointerKind::OverflowLink, to)?;
                }
                pager.ptrmap_write(to, PointerKind::OverflowLink, predecessor)?;
                Ok(())
            }
            PointerKind::Freelist | PointerKind::TreeRoot => unreachable!("handled by caller"),
        }
    }

    fn redirect_tree_node(&mut self, pager: &mut Pager, from: PageId, to: PageId) -> Result<()> {
        let node = self.acquire_node(pager, to, false)?;
        let parent_id = node.header.parent_id;
        let is_external = node.is_external();
        let prev = node.header.prev_id;
        let next = node.header.next_id;
        let mut children = Vec::new();
        let mut overflow_heads = Vec::new();
        if is_external {
            for index in 0..node.cell_count() {
                let cell = node.read_cell(index);
                if cell.has_overflow() {
                    overflow_heads.push(cell.overflow_id());
                }
            }
        } else {
            children.extend((0..=node.cell_count()).map(|i| node.child_id(i)));
        }
        self.release_node(pager, node)?;
        pager.ptrmap_write(to, PointerKind::TreeNode, PageId::NULL)?;

        if parent_id.is_null() {
            return Err(Error::Corruption(format!(
                "relocated node {from} has no parent"
            )));
        }
        let mut parent = self.acquire_node(pager, parent_id, true)?;
        let position = self.find_child_index(&parent, from)?;
        parent.set_child_id(position, to);
        self.release_node(pager, parent)?;

        if is_external {
            if !prev.is_null() {
                let mut left = self.acquire_node(pager, prev, true)?;
                left.header.next_id = to;
                self.release_node(pager, left)?;
            }
            if !next.is_null() {
                let mut right = self.acquire_node(pager, next, true)?;
                right.header.prev_id = to;
                self.release_node(pager, right)?;
            }
            for head in overflow_heads {
                pager.ptrmap_write(head, PointerKind::OverflowHead, to)?;
            }
        } else {
            for child_id in children {
                let mut child = self.acquire_node(pager, child_id, true)?;
                child.header.parent_id = to;
                self.release_node(pager, child)?;
            }
        }
        Ok(())
    }

    fn redirect_overflow_head(
        &mut self,
        pager: &mut Pager,
        from: PageId,
        to: PageId,
        owner: PageId,
        data: &[u8],
    ) -> Result<()> {
        let mut node = self.acquire_node(pager, owner, true)?;
        let mut found = false;
        for index in 0..node.cell_count() {
            let cell = node.read_cell(index);
            if cell.has_overflow() && cell.overflow_id() == from {
                let offset = node.get_slot(index) + cell.size() - 8;
                put_u64(node.page.span(offset, 8), to.0);
                found = true;
                break;
            }
        }
        self.release_node(pager, node)?;
        if !found {
            return Err(Error::Corruption(format!(
                "no cell in node {owner} references overflow chain {from}"
            )));
        }
        let next = PageId(get_u64(&data[LINK_OFFSET..LINK_OFFSET + 8]));
        if !next.is_null() {
            pager.ptrmap_write(next, PointerKind::OverflowLink, to)?;
        }
        pager.ptrmap_write(to, PointerKind::OverflowHead, owner)?;
        Ok(())
    }
}
