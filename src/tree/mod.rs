//! The B+tree index.
//!
//! A single root lives on page 1 from creation. External (leaf) nodes hold
//! the key/value cells and form a doubly-linked sibling list; internal
//! nodes hold separator/child cells plus a rightmost child in the header.
//! The tree grows at the root: an overflowing root moves its payload into
//! a fresh child and becomes an internal node over it.
//!
//! Separator semantics: for an internal cell with key `K` and left child
//! `C`, every key under `C` is `< K`; `K` itself lives to the right. An
//! exact separator hit therefore descends the child after the cell.

pub mod cursor;
pub mod header;
pub mod node;
mod overflow;
mod vacuum;

use crate::error::{Error, Result};
use crate::pager::pointer_map::PointerKind;
use crate::pager::Pager;
use crate::types::PageId;
use header::{NodeHeader, FILE_HEADER_SIZE, NODE_HEADER_SIZE};
use node::{compute_max_local, compute_min_local, determine_cell_size, Cell, Node, CELL_POINTER_SIZE};

pub struct BPlusTree {
    min_local: usize,
    max_local: usize,
}

impl BPlusTree {
    pub fn new(page_size: usize) -> BPlusTree {
        BPlusTree {
            min_local: compute_min_local(page_size),
            max_local: compute_max_local(page_size),
        }
    }

    /// Longest key an external cell can hold locally.
    pub fn max_key_size(&self) -> usize {
        self.max_local
    }

    fn acquire_node(&self, pager: &mut Pager, id: PageId, writable: bool) -> Result<Node> {
        let mut page = pager.acquire(id)?;
        if writable {
            if let Err(e) = pager.upgrade(&mut page) {
                pager.release(page)?;
                return Err(e);
            }
        }
        Node::from_page(page, self.min_local, self.max_local)
    }

    fn allocate_node(&self, pager: &mut Pager, is_external: bool) -> Result<Node> {
        let page = pager.allocate()?;
        pager.ptrmap_write(page.id(), PointerKind::TreeNode, PageId::NULL)?;
        Ok(Node::init(page, is_external, self.min_local, self.max_local))
    }

    fn release_node(&self, pager: &mut Pager, node: Node) -> Result<()> {
        pager.release(node.finish())
    }

    fn free_node(&self, pager: &mut Pager, node: Node) -> Result<()> {
        pager.free(node.into_page())
    }

    /// Descend to the external node that owns `key`.
    fn find_external(&self, pager: &mut Pager, key: &[u8]) -> Result<(Node, usize, bool)> {
        let mut node = self.acquire_node(pager, PageId::ROOT, false)?;
        loop {
            let (index, exact) = node.seek(key);
            if node.is_external() {
                return Ok((node, index, exact));
            }
            let child_index = if exact { index + 1 } else { index };
            let child = node.child_id(child_index);
            if child.is_null() {
                let id = node.id();
                self.release_node(pager, node)?;
                return Err(Error::Corruption(format!(
                    "internal node {id} has a null child"
                )));
            }
            self.release_node(pager, node)?;
            node = self.acquire_node(pager, child, false)?;
        }
    }

    pub fn get(&self, pager: &mut Pager, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (node, index, exact) = self.find_external(pager, key)?;
        if !exact {
            self.release_node(pager, node)?;
            return Ok(None);
        }
        let cell = node.read_cell(index);
        self.release_node(pager, node)?;
        Ok(Some(self.collect_value(pager, &cell)?))
    }

    pub(crate) fn collect_value(&self, pager: &mut Pager, cell: &Cell) -> Result<Vec<u8>> {
        let mut value = cell.local_value().to_vec();
        if cell.has_overflow() {
            let remaining = cell.value_size() - value.len();
            value.extend(overflow::read_chain(pager, cell.overflow_id(), remaining)?);
        }
        Ok(value)
    }

    /// Insert or replace. Returns whether a new key was added.
    pub fn insert(&mut self, pager: &mut Pager, key: &[u8], value: &[u8]) -> Result<bool> {
        let (mut node, index, exact) = self.find_external(pager, key)?;
        pager.upgrade(&mut node.page)?;

        if exact {
            let cell = node.read_cell(index);
            if cell.has_overflow() {
                overflow::destroy_chain(pager, cell.overflow_id())?;
            }
            node.erase_cell(index);
        }
        self.emplace(pager, &mut node, index, key, value)?;
        self.resolve_overflow(pager, node)?;
        Ok(!exact)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn erase(&mut self, pager: &mut Pager, key: &[u8]) -> Result<bool> {
        let (mut node, index, exact) = self.find_external(pager, key)?;
        if !exact {
            self.release_node(pager, node)?;
            return Ok(false);
        }
        pager.upgrade(&mut node.page)?;
        let cell = node.read_cell(index);
        if cell.has_overflow() {
            overflow::destroy_chain(pager, cell.overflow_id())?;
        }
        node.erase_cell(index);
        self.resolve_underflow(pager, node)?;
        Ok(true)
    }

    /// Build the cell for `key`/`value` in `node`, spilling the value tail
    /// to an overflow chain when it exceeds the local budget.
    fn emplace(
        &self,
        pager: &mut Pager,
        node: &mut Node,
        index: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let mut local_size = value.len();
        determine_cell_size(key.len(), &mut local_size, self.min_local, self.max_local);
        let (local, remote) = value.split_at(local_size);
        let overflow_id = if remote.is_empty() {
            PageId::NULL
        } else {
            overflow::build_chain(pager, node.id(), remote)?
        };
        node.write_cell(
            index,
            Cell::new_external(key, local, value.len(), overflow_id),
        );
        Ok(())
    }

    fn resolve_overflow(&mut self, pager: &mut Pager, mut node: Node) -> Result<()> {
        while node.overflow.is_some() {
            node = if node.id().is_root() {
                self.split_root(pager, node)?
            } else {
                self.split_non_root(pager, node)?
            };
        }
        self.release_node(pager, node)
    }

    /// Move the root's payload (and its overflow cell) into a fresh child,
    /// then reset the root to an internal node over that child.
    fn split_root(&mut self, pager: &mut Pager, mut root: Node) -> Result<Node> {
        debug_assert!(root.overflow.is_some());
        let mut child_page = pager.allocate()?;
        pager.ptrmap_write(child_page.id(), PointerKind::TreeNode, PageId::NULL)?;

        // Cell bodies keep their offsets; the slot array shifts down to
        // the child's (smaller) header area.
        let after_root_headers = FILE_HEADER_SIZE + NODE_HEADER_SIZE;
        let size = root.page.size() - after_root_headers;
        child_page
            .span(after_root_headers, size)
            .copy_from_slice(&root.page.data()[after_root_headers..]);
        let slots = root.cell_count() * CELL_POINTER_SIZE;
        let slot_bytes =
            root.page.data()[after_root_headers..after_root_headers + slots].to_vec();
        child_page
            .span(NODE_HEADER_SIZE, slots)
            .copy_from_slice(&slot_bytes);

        let mut child = Node::init(
            child_page,
            root.header.is_external,
            self.min_local,
            self.max_local,
        );
        child.header = root.header;
        child.header.parent_id = PageId::ROOT;
        child.overflow = root.overflow.take();

        root.header = NodeHeader {
            is_external: false,
            next_id: child.id(),
            cell_start: root.page.size() as u32,
            ..NodeHeader::default()
        };
        self.release_node(pager, root)?;

        self.fix_parent_links(pager, &child)?;
        self.repoint_overflow_heads(pager, &child)?;
        Ok(child)
    }

    /// Split an overflowing non-root node and post the separator to the
    /// parent, which is returned (it may be overflowing in turn).
    fn split_non_root(&mut self, pager: &mut Pager, mut node: Node) -> Result<Node> {
        debug_assert!(node.overflow.is_some());
        let parent_id = node.header.parent_id;
        debug_assert!(!parent_id.is_null());
        let mut parent = self.acquire_node(pager, parent_id, true)?;
        let mut sibling = self.allocate_node(pager, node.is_external())?;

        let separator = if node.is_external() {
            self.split_external(&mut node, &mut sibling)
        } else {
            self.split_internal(&mut node, &mut sibling)
        };

        // Keep the leaf list doubly linked.
        if node.is_external() && !sibling.header.next_id.is_null() {
            let mut right = self.acquire_node(pager, sibling.header.next_id, true)?;
            right.header.prev_id = sibling.id();
            self.release_node(pager, right)?;
        }

        let (index, exact) = parent.seek(separator.key());
        debug_assert!(!exact);
        parent.write_cell(index, separator);
        // The slot that used to point at `node` must follow the new
        // separator and point at the sibling.
        let offset = usize::from(parent.overflow.is_none());
        parent.set_child_id(index + offset, sibling.id());

        self.fix_parent_links(pager, &sibling)?;
        if node.is_external() {
            self.repoint_overflow_heads(pager, &node)?;
            self.repoint_overflow_heads(pager, &sibling)?;
        }
        self.release_node(pager, node)?;
        self.release_node(pager, sibling)?;
        Ok(parent)
    }

    fn split_external(&mut self, left: &mut Node, right: &mut Node) -> Cell {
        let (overflow_index, overflow) = left.overflow.take().expect("node is overflowing");

        right.header.next_id = left.header.next_id;
        right.header.prev_id = left.id();
        right.header.parent_id = left.header.parent_id;
        left.header.next_id = right.id();

        if overflow_index == left.cell_count() {
            // Sequential append: move a single cell and put the new cell
            // in the sibling, which keeps append workloads from
            // rewriting half the node on every split.
            transfer_cells(left, right, |_, _, counter| counter == 0);
            let at = right.cell_count();
            right.write_cell(at, overflow);
        } else if overflow_index == 0 {
            transfer_cells(left, right, |l, r, counter| {
                counter == 0 || l.usable_space() < r.usable_space()
            });
            left.write_cell(0, overflow);
        } else {
            let needed = overflow.size() + CELL_POINTER_SIZE;
            transfer_cells(left, right, |l, _, counter| {
                counter == 0 || (l.cell_count() > overflow_index && l.usable_space() < needed)
            });
            if left.cell_count() > overflow_index {
                left.write_cell(overflow_index, overflow);
            } else {
                right.write_cell(0, overflow);
            }
        }
        debug_assert!(left.overflow.is_none() && right.overflow.is_none());
        right.read_cell(0).promote(left.id())
    }

    fn split_internal(&mut self, left: &mut Node, right: &mut Node) -> Cell {
        let (overflow_index, mut overflow) = left.overflow.take().expect("node is overflowing");

        right.header.next_id = left.header.next_id;
        right.header.parent_id = left.header.parent_id;

        if overflow_index > 0 && overflow_index < left.cell_count() {
            // The overflow cell itself becomes the separator: lift it.
            left.header.next_id = overflow.child_id();
            transfer_cells(left, right, |l, _, _| l.cell_count() > overflow_index);
            overflow.set_child_id(left.id());
            debug_assert!(left.overflow.is_none() && right.overflow.is_none());
            return overflow;
        }
        if overflow_index == 0 {
            transfer_cells(left, right, |l, r, counter| {
                counter == 0 || l.usable_space() < r.usable_space()
            });
            left.write_cell(0, overflow);
        } else {
            transfer_cells(left, right, |_, _, counter| counter == 0);
            let at = right.cell_count();
            right.write_cell(at, overflow);
        }
        debug_assert!(left.overflow.is_none() && right.overflow.is_none());

        // Lift the last cell of the left half.
        let last = left.cell_count() - 1;
        let mut separator = left.read_cell(last);
        left.erase_cell(last);
        left.header.next_id = separator.child_id();
        separator.set_child_id(left.id());
        separator
    }

    /// Point every child of `node` back at it. Used after cells move
    /// between internal nodes.
    fn fix_parent_links(&self, pager: &mut Pager, node: &Node) -> Result<()> {
        if node.is_external() {
            return Ok(());
        }
        let id = node.id();
        let mut children: Vec<PageId> =
            (0..=node.cell_count()).map(|i| node.child_id(i)).collect();
        if let Some((_, cell)) = &node.overflow {
            children.push(cell.child_id());
        }
        for child_id in children {
            let mut child = self.acquire_node(pager, child_id, true)?;
            child.header.parent_id = id;
            self.release_node(pager, child)?;
        }
        Ok(())
    }

    /// Re-point overflow-chain heads at `node` after its cells moved in
    /// from another node.
    fn repoint_overflow_heads(&self, pager: &mut Pager, node: &Node) -> Result<()> {
        if !node.is_external() {
            return Ok(());
        }
        for index in 0..node.cell_count() {
            let cell = node.read_cell(index);
            if cell.has_overflow() {
                pager.ptrmap_write(cell.overflow_id(), PointerKind::OverflowHead, node.id())?;
            }
        }
        Ok(())
    }

    /// A non-root node is under-full when more than half of its usable
    /// area is free.
    fn is_underflowing(&self, node: &Node) -> bool {
        node.usable_space() * 2 > node.max_usable_space()
    }

    fn find_child_index(&self, parent: &Node, id: PageId) -> Result<usize> {
        for index in 0..=parent.cell_count() {
            if parent.child_id(index) == id {
                return Ok(index);
            }
        }
        Err(Error::Corruption(format!(
            "node {} is not a child of its recorded parent {}",
            id,
            parent.id()
        )))
    }

    fn resolve_underflow(&mut self, pager: &mut Pager, mut node: Node) -> Result<()> {
        loop {
            if node.id().is_root() {
                return self.fix_root(pager, node);
            }
            if !self.is_underflowing(&node) {
                return self.release_node(pager, node);
            }
            let parent_id = node.header.parent_id;
            let mut parent = self.acquire_node(pager, parent_id, true)?;
            let position = self.find_child_index(&parent, node.id())?;
            self.try_repair(pager, &mut parent, position, node)?;
            node = parent;
        }
    }

    /// Try, in order: rotate from the left sibling, rotate from the right
    /// sibling, merge left, merge right. An irreparable node is left
    /// under-full; ordering invariants are unaffected.
    fn try_repair(
        &mut self,
        pager: &mut Pager,
        parent: &mut Node,
        position: usize,
        node: Node,
    ) -> Result<()> {
        let mut node = node;
        if position > 0 {
            let left_id = parent.child_id(position - 1);
            let mut left = self.acquire_node(pager, left_id, true)?;
            let rotated = self.try_rotate_from_left(pager, parent, position, &mut left, &mut node)?;
            self.release_node(pager, left)?;
            if rotated {
                return self.release_node(pager, node);
            }
        }
        if position < parent.cell_count() {
            let right_id = parent.child_id(position + 1);
            let mut right = self.acquire_node(pager, right_id, true)?;
            let rotated =
                self.try_rotate_from_right(pager, parent, position, &mut node, &mut right)?;
            self.release_node(pager, right)?;
            if rotated {
                return self.release_node(pager, node);
            }
        }
        if position > 0 {
            let left_id = parent.child_id(position - 1);
            let left = self.acquire_node(pager, left_id, true)?;
            if self.can_merge(&left, &node, parent, position - 1) {
                return self.merge(pager, parent, position - 1, left, node);
            }
            self.release_node(pager, left)?;
        }
        if position < parent.cell_count() {
            let right_id = parent.child_id(position + 1);
            let right = self.acquire_node(pager, right_id, true)?;
            if self.can_merge(&node, &right, parent, position) {
                return self.merge(pager, parent, position, node, right);
            }
            self.release_node(pager, right)?;
        }
        self.release_node(pager, node)
    }

    /// Will the separator swap fit in the parent?
    fn parent_can_swap(&self, parent: &Node, sep_index: usize, new_sep: &Cell) -> bool {
        let old = parent.read_cell(sep_index);
        parent.usable_space() + old.size() >= new_sep.size()
    }

    fn try_rotate_from_left(
        &mut self,
        pager: &mut Pager,
        parent: &mut Node,
        position: usize,
        left: &mut Node,
        node: &mut Node,
    ) -> Result<bool> {
        if left.cell_count() < 2 {
            return Ok(false);
        }
        if node.is_external() {
            let cell = left.read_cell(left.cell_count() - 1);
            if node.usable_space() < cell.size() + CELL_POINTER_SIZE {
                return Ok(false);
            }
            let new_sep = cell.promote(left.id());
            if !self.parent_can_swap(parent, position - 1, &new_sep) {
                return Ok(false);
            }
            left.erase_cell(left.cell_count() - 1);
            if cell.has_overflow() {
                pager.ptrmap_write(cell.overflow_id(), PointerKind::OverflowHead, node.id())?;
            }
            node.write_cell(0, cell);
            debug_assert!(node.overflow.is_none());
            parent.erase_cell(position - 1);
            parent.write_cell(position - 1, new_sep);
            debug_assert!(parent.overflow.is_none());
        } else {
            let separator = parent.read_cell(position - 1);
            let donor = left.read_cell(left.cell_count() - 1);
            let mut pulled_down = separator.clone();
            pulled_down.set_child_id(left.header.next_id);
            if node.usable_space() < pulled_down.size() + CELL_POINTER_SIZE {
                return Ok(false);
            }
            let mut new_sep = donor.clone();
            new_sep.set_child_id(left.id());
            if !self.parent_can_swap(parent, position - 1, &new_sep) {
                return Ok(false);
            }
            let moved_child = left.header.next_id;
            node.write_cell(0, pulled_down);
            debug_assert!(node.overflow.is_none());
            left.erase_cell(left.cell_count() - 1);
            left.header.next_id = donor.child_id();
            parent.erase_cell(position - 1);
            parent.write_cell(position - 1, new_sep);
            debug_assert!(parent.overflow.is_none());

            let mut child = self.acquire_node(pager, moved_child, true)?;
            child.header.parent_id = node.id();
            self.release_node(pager, child)?;
        }
        Ok(true)
    }

    fn try_rotate_from_right(
        &mut self,
        pager: &mut Pager,
        parent: &mut Node,
        position: usize,
        node: &mut Node,
        right: &mut Node,
    ) -> Result<bool> {
        if right.cell_count() < 2 {
            return Ok(false);
        }
        if node.is_external() {
            let cell = right.read_cell(0);
            if node.usable_space() < cell.size() + CELL_POINTER_SIZE {
                return Ok(false);
            }
            let new_sep = right.read_cell(1).promote(node.id());
            if !self.parent_can_swap(parent, position, &new_sep) {
                return Ok(false);
            }
            right.erase_cell(0);
            if cell.has_overflow() {
                pager.ptrmap_write(cell.overflow_id(), PointerKind::OverflowHead, node.id())?;
            }
            let at = node.cell_count();
            node.write_cell(at, cell);
            debug_assert!(node.overflow.is_none());
            parent.erase_cell(position);
            parent.write_cell(position, new_sep);
            debug_assert!(parent.overflow.is_none());
        } else {
            let separator = parent.read_cell(position);
            let first = right.read_cell(0);
            let mut pulled_down = separator.clone();
            pulled_down.set_child_id(node.header.next_id);
            if node.usable_space() < pulled_down.size() + CELL_POINTER_SIZE {
                return Ok(false);
            }
            let mut new_sep = first.clone();
            new_sep.set_child_id(node.id());
            if !self.parent_can_swap(parent, position, &new_sep) {
                return Ok(false);
            }
            let moved_child = first.child_id();
            let at = node.cell_count();
            node.write_cell(at, pulled_down);
            debug_assert!(node.overflow.is_none());
            node.header.next_id = moved_child;
            right.erase_cell(0);
            parent.erase_cell(position);
            parent.write_cell(position, new_sep);
            debug_assert!(parent.overflow.is_none());

            let mut child = self.acquire_node(pager, moved_child, true)?;
            child.header.parent_id = node.id();
            self.release_node(pager, child)?;
        }
        Ok(true)
    }

    fn can_merge(&self, left: &Node, right: &Node, parent: &Node, sep_index: usize) -> bool {
        let mut combined = left.cell_usage() + right.cell_usage();
        if !left.is_external() {
            let separator = parent.read_cell(sep_index);
            combined += separator.size() + CELL_POINTER_SIZE;
        }
        combined <= left.max_usable_space()
    }

    /// Absorb `right` into `left`, drop the separator from the parent, and
    /// free the right page.
    fn merge(
        &mut self,
        pager: &mut Pager,
        parent: &mut Node,
        sep_index: usize,
        mut left: Node,
        right: Node,
    ) -> Result<()> {
        if left.is_external() {
            for index in 0..right.cell_count() {
                let cell = right.read_cell(index);
                let at = left.cell_count();
                left.write_cell(at, cell);
                debug_assert!(left.overflow.is_none());
            }
            left.header.next_id = right.header.next_id;
            if !right.header.next_id.is_null() {
                let mut next = self.acquire_node(pager, right.header.next_id, true)?;
                next.header.prev_id = left.id();
                self.release_node(pager, next)?;
            }
        } else {
            let mut pulled_down = parent.read_cell(sep_index);
            pulled_down.set_child_id(left.header.next_id);
            let at = left.cell_count();
            left.write_cell(at, pulled_down);
            debug_assert!(left.overflow.is_none());
            for index in 0..right.cell_count() {
                let cell = right.read_cell(index);
                let at = left.cell_count();
                left.write_cell(at, cell);
                debug_assert!(left.overflow.is_none());
            }
            left.header.next_id = right.header.next_id;
        }
        parent.erase_cell(sep_index);
        parent.set_child_id(sep_index, left.id());

        if left.is_external() {
            self.repoint_overflow_heads(pager, &left)?;
        } else {
            self.fix_parent_links(pager, &left)?;
        }
        self.free_node(pager, right)?;
        self.release_node(pager, left)
    }

    /// Collapse an empty internal root onto its only child.
    fn fix_root(&mut self, pager: &mut Pager, mut root: Node) -> Result<()> {
        loop {
            if root.is_external() || root.cell_count() > 0 || root.header.next_id.is_null() {
                return self.release_node(pager, root);
            }
            let child_id = root.header.next_id;
            let mut child = self.acquire_node(pager, child_id, true)?;

            // The root's header area is larger; the child's slot array
            // must fit behind it.
            let needed =
                FILE_HEADER_SIZE + NODE_HEADER_SIZE + child.cell_count() * CELL_POINTER_SIZE;
            if (child.header.cell_start as usize) < needed {
                child.defragment(None);
            }
            if (child.header.cell_start as usize) < needed {
                // Too full to pull up; keep the extra level.
                self.release_node(pager, child)?;
                return self.release_node(pager, root);
            }

            let slots = child.cell_count() * CELL_POINTER_SIZE;
            let slot_bytes = child.page.data()[NODE_HEADER_SIZE..NODE_HEADER_SIZE + slots].to_vec();
            root.page
                .span(FILE_HEADER_SIZE + NODE_HEADER_SIZE, slots)
                .copy_from_slice(&slot_bytes);
            let start = child.header.cell_start as usize;
            let body = child.page.data()[start..].to_vec();
            root.page.span(start, body.len()).copy_from_slice(&body);

            root.header = child.header;
            root.header.parent_id = PageId::NULL;

            self.free_node(pager, child)?;
            if root.is_external() {
                self.repoint_overflow_heads(pager, &root)?;
            } else {
                self.fix_parent_links(pager, &root)?;
            }
        }
    }
}

fn transfer_cells(
    src: &mut Node,
    dst: &mut Node,
    mut predicate: impl FnMut(&Node, &Node, usize) -> bool,
) {
    let mut counter = 0;
    while src.cell_count() > 0 && predicate(src, dst, counter) {
        let last = src.cell_count() - 1;
        let cell = src.read_cell(last);
        src.erase_cell(last);
        dst.write_cell(0, cell);
        debug_assert!(dst.overflow.is_none());
        counter += 1;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemStorage, Storage};
    use crate::wal::Wal;
    use rand::prelude::*;
    use std::sync::Arc;

    const PAGE_SIZE: usize = 512;

    fn test_pager(storage: &MemStorage) -> Pager {
        storage.create_directory("db").unwrap();
        let storage: Arc<dyn Storage> = Arc::new(storage.clone());
        let mut wal = Wal::open(storage.clone(), "db", PAGE_SIZE, 32 * PAGE_SIZE).unwrap();
        wal.start().unwrap();
        let mut pager =
            Pager::open(storage, "db/data", wal, PAGE_SIZE, 64, 1).unwrap();
        pager.begin_txn();

        // Materialize the root as an empty external node.
        let mut root = pager.acquire(PageId::ROOT).unwrap();
        pager.upgrade(&mut root).unwrap();
        let tree = BPlusTree::new(PAGE_SIZE);
        let node = Node::init(root, true, tree.min_local, tree.max_local);
        pager.release(node.finish()).unwrap();
        pager
    }

    fn key(i: u32) -> Vec<u8> {
        format!("k{i:05}").into_bytes()
    }

    #[test]
    fn insert_then_get_small_set() {
        let storage = MemStorage::new();
        let mut pager = test_pager(&storage);
        let mut tree = BPlusTree::new(PAGE_SIZE);

        assert!(tree.insert(&mut pager, b"b", b"2").unwrap());
        assert!(tree.insert(&mut pager, b"a", b"1").unwrap());
        assert!(tree.insert(&mut pager, b"c", b"3").unwrap());
        // Replacement is not an addition.
        assert!(!tree.insert(&mut pager, b"b", b"22").unwrap());

        assert_eq!(tree.get(&mut pager, b"a").unwrap().unwrap(), b"1");
        assert_eq!(tree.get(&mut pager, b"b").unwrap().unwrap(), b"22");
        assert_eq!(tree.get(&mut pager, b"c").unwrap().unwrap(), b"3");
        assert_eq!(tree.get(&mut pager, b"d").unwrap(), None);
    }

    #[test]
    fn sequential_inserts_split_the_root() {
        let storage = MemStorage::new();
        let mut pager = test_pager(&storage);
        let mut tree = BPlusTree::new(PAGE_SIZE);

        for i in 0..200 {
            tree.insert(&mut pager, &key(i), &[i as u8; 16]).unwrap();
        }
        for i in 0..200 {
            assert_eq!(
                tree.get(&mut pager, &key(i)).unwrap().unwrap(),
                vec![i as u8; 16],
                "missing {i}"
            );
        }
        let keys = validation::check_order_and_links(&tree, &mut pager);
        assert_eq!(keys.len(), 200);
    }

    #[test]
    fn random_inserts_keep_order() {
        let storage = MemStorage::new();
        let mut pager = test_pager(&storage);
        let mut tree = BPlusTree::new(PAGE_SIZE);

        let mut order: Vec<u32> = (0..500).collect();
        order.shuffle(&mut StdRng::seed_from_u64(0xCA11C0));
        for i in &order {
            tree.insert(&mut pager, &key(*i), i.to_string().as_bytes())
                .unwrap();
        }
        for i in 0..500 {
            assert_eq!(
                tree.get(&mut pager, &key(i)).unwrap().unwrap(),
                i.to_string().as_bytes()
            );
        }
        let keys = validation::check_order_and_links(&tree, &mut pager);
        assert_eq!(keys.len(), 500);
    }

    #[test]
    fn overflow_values_round_trip() {
        let storage = MemStorage::new();
        let mut pager = test_pager(&storage);
        let mut tree = BPlusTree::new(PAGE_SIZE);

        let value = vec![b'x'; 1024];
        tree.insert(&mut pager, b"k", &value).unwrap();
        assert_eq!(tree.get(&mut pager, b"k").unwrap().unwrap(), value);

        // Replacing the value releases the old chain.
        let smaller = vec![b'y'; 700];
        tree.insert(&mut pager, b"k", &smaller).unwrap();
        assert_eq!(tree.get(&mut pager, b"k").unwrap().unwrap(), smaller);
        assert!(!pager.freelist_head().is_null());
    }

    #[test]
    fn erase_returns_presence() {
        let storage = MemStorage::new();
        let mut pager = test_pager(&storage);
        let mut tree = BPlusTree::new(PAGE_SIZE);

        tree.insert(&mut pager, b"a", b"1").unwrap();
        assert!(tree.erase(&mut pager, b"a").unwrap());
        assert!(!tree.erase(&mut pager, b"a").unwrap());
        assert_eq!(tree.get(&mut pager, b"a").unwrap(), None);
    }

    #[test]
    fn erase_everything_collapses_back() {
        let storage = MemStorage::new();
        let mut pager = test_pager(&storage);
        let mut tree = BPlusTree::new(PAGE_SIZE);

        for i in 0..300 {
            tree.insert(&mut pager, &key(i), &[7u8; 24]).unwrap();
        }
        // Erase in an order that exercises leftmost, rightmost, and
        // middle merges.
        let mut order: Vec<u32> = (0..300).collect();
        order.shuffle(&mut StdRng::seed_from_u64(7));
        for i in order {
            assert!(tree.erase(&mut pager, &key(i)).unwrap(), "missing {i}");
        }
        let keys = validation::check_order_and_links(&tree, &mut pager);
        assert!(keys.is_empty());

        // The tree is usable after collapsing to an empty root.
        tree.insert(&mut pager, b"again", b"v").unwrap();
        assert_eq!(tree.get(&mut pager, b"again").unwrap().unwrap(), b"v");
    }

    #[test]
    fn mixed_workload_stays_consistent() {
        let storage = MemStorage::new();
        let mut pager = test_pager(&storage);
        let mut tree = BPlusTree::new(PAGE_SIZE);
        let mut rng = StdRng::seed_from_u64(42);
        let mut model = std::collections::BTreeMap::new();

        for _ in 0..2000 {
            let k = key(rng.gen_range(0..400));
            if rng.gen_bool(0.3) {
                let expected = model.remove(&k).is_some();
                assert_eq!(tree.erase(&mut pager, &k).unwrap(), expected);
            } else {
                let v = vec![rng.gen::<u8>(); rng.gen_range(0..64)];
                model.insert(k.clone(), v.clone());
                tree.insert(&mut pager, &k, &v).unwrap();
            }
        }
        for (k, v) in &model {
            assert_eq!(tree.get(&mut pager, k).unwrap().unwrap(), *v);
        }
        let keys = validation::check_order_and_links(&tree, &mut pager);
        assert_eq!(keys.len(), model.len());
    }
}
