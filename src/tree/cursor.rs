//! Cursor positioning over the external node list.
//!
//! A position is `(page_id, index)` into an external node. Movement walks
//! the sibling links, skipping any empty leaves underflow resolution left
//! behind. The public `Cursor` type in the `db` module wraps these
//! operations; its exclusive borrow of the database is what guarantees no
//! mutation can invalidate a live position.

use crate::error::Result;
use crate::pager::Pager;
use crate::tree::BPlusTree;
use crate::types::PageId;

pub type CursorPosition = (PageId, usize);

impl BPlusTree {
    fn leftmost_leaf(&self, pager: &mut Pager) -> Result<PageId> {
        let mut node = self.acquire_node(pager, PageId::ROOT, false)?;
        while !node.is_external() {
            let next = node.child_id(0);
            self.release_node(pager, node)?;
            node = self.acquire_node(pager, next, false)?;
        }
        let id = node.id();
        self.release_node(pager, node)?;
        Ok(id)
    }

    fn rightmost_leaf(&self, pager: &mut Pager) -> Result<PageId> {
        let mut node = self.acquire_node(pager, PageId::ROOT, false)?;
        while !node.is_external() {
            let next = node.child_id(node.cell_count());
            self.release_node(pager, node)?;
            node = self.acquire_node(pager, next, false)?;
        }
        let id = node.id();
        self.release_node(pager, node)?;
        Ok(id)
    }

    /// Skip forward across empty leaves starting at `id`.
    fn first_occupied_from(
        &self,
        pager: &mut Pager,
        mut id: PageId,
    ) -> Result<Option<CursorPosition>> {
        while !id.is_null() {
            let node = self.acquire_node(pager, id, false)?;
            let count = node.cell_count();
            let next = node.header.next_id;
            self.release_node(pager, node)?;
            if count > 0 {
                return Ok(Some((id, 0)));
            }
            id = next;
        }
        Ok(None)
    }

    /// Skip backward across empty leaves starting at `id`, positioning on
    /// the last cell.
    fn last_occupied_from(
        &self,
        pager: &mut Pager,
        mut id: PageId,
    ) -> Result<Option<CursorPosition>> {
        while !id.is_null() {
            let node = self.acquire_node(pager, id, false)?;
            let count = node.cell_count();
            let prev = node.header.prev_id;
            self.release_node(pager, node)?;
            if count > 0 {
                return Ok(Some((id, count - 1)));
            }
            id = prev;
        }
        Ok(None)
    }

    pub(crate) fn seek_first(&self, pager: &mut Pager) -> Result<Option<CursorPosition>> {
        let leaf = self.leftmost_leaf(pager)?;
        self.first_occupied_from(pager, leaf)
    }

    pub(crate) fn seek_last(&self, pager: &mut Pager) -> Result<Option<CursorPosition>> {
        let leaf = self.rightmost_leaf(pager)?;
        self.last_occupied_from(pager, leaf)
    }

    /// Position at the first entry with key >= `key`.
    pub(crate) fn seek_position(
        &self,
        pager: &mut Pager,
        key: &[u8],
    ) -> Result<Option<CursorPosition>> {
        let (node, index, _) = self.find_external(pager, key)?;
        let id = node.id();
        let count = node.cell_count();
        let next = node.header.next_id;
        self.release_node(pager, node)?;
        if index < count {
            return Ok(Some((id, index)));
        }
        self.first_occupied_from(pager, next)
    }

    pub(crate) fn next_position(
        &self,
        pager: &mut Pager,
        position: CursorPosition,
    ) -> Result<Option<CursorPosition>> {
        let (id, index) = position;
        let node = self.acquire_node(pager, id, false)?;
        let count = node.cell_count();
        let next = node.header.next_id;
        self.release_node(pager, node)?;
        if index + 1 < count {
            return Ok(Some((id, index + 1)));
        }
        self.first_occupied_from(pager, next)
    }

    pub(crate) fn previous_position(
        &self,
        pager: &mut Pager,
        position: CursorPosition,
    ) -> Result<Option<CursorPosition>> {
        let (id, index) = position;
        if index > 0 {
            return Ok(Some((id, index - 1)));
        }
        let node = self.acquire_node(pager, id, false)?;
        let prev = node.header.prev_id;
        self.release_node(pager, node)?;
        self.last_occupied_from(pager, prev)
    }

    /// Copy the key and full value at `position`.
    pub(crate) fn read_entry(
        &self,
        pager: &mut Pager,
        position: CursorPosition,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let (id, index) = position;
        let node = self.acquire_node(pager, id, false)?;
        let cell = node.read_cell(index);
        self.release_node(pager, node)?;
        let key = cell.key().to_vec();
        let value = self.collect_value(pager, &cell)?;
        Ok((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::Pager;
    use crate::storage::{MemStorage, Storage};
    use crate::tree::node::Node;
    use crate::wal::Wal;
    use rand::prelude::*;
    use std::sync::Arc;

    const PAGE_SIZE: usize = 512;

    fn setup(storage: &MemStorage) -> (BPlusTree, Pager) {
        storage.create_directory("db").unwrap();
        let storage: Arc<dyn Storage> = Arc::new(storage.clone());
        let mut wal = Wal::open(storage.clone(), "db", PAGE_SIZE, 32 * PAGE_SIZE).unwrap();
        wal.start().unwrap();
        let mut pager = Pager::open(storage, "db/data", wal, PAGE_SIZE, 64, 1).unwrap();
        pager.begin_txn();
        let tree = BPlusTree::new(PAGE_SIZE);
        let mut root = pager.acquire(PageId::ROOT).unwrap();
        pager.upgrade(&mut root).unwrap();
        let node = Node::init(root, true, tree.min_local, tree.max_local);
        pager.release(node.finish()).unwrap();
        (tree, pager)
    }

    #[test]
    fn empty_tree_has_no_positions() {
        let storage = MemStorage::new();
        let (tree, mut pager) = setup(&storage);
        assert!(tree.seek_first(&mut pager).unwrap().is_none());
        assert!(tree.seek_last(&mut pager).unwrap().is_none());
        assert!(tree.seek_position(&mut pager, b"x").unwrap().is_none());
    }

    #[test]
    fn forward_scan_is_ordered() {
        let storage = MemStorage::new();
        let (mut tree, mut pager) = setup(&storage);

        let mut order: Vec<u32> = (0..300).collect();
        order.shuffle(&mut StdRng::seed_from_u64(3));
        for i in &order {
            let key = format!("k{i:04}");
            tree.insert(&mut pager, key.as_bytes(), key.as_bytes())
                .unwrap();
        }

        let mut position = tree.seek_first(&mut pager).unwrap();
        let mut seen = Vec::new();
        while let Some(current) = position {
            let (key, value) = tree.read_entry(&mut pager, current).unwrap();
            assert_eq!(key, value);
            seen.push(key);
            position = tree.next_position(&mut pager, current).unwrap();
        }
        assert_eq!(seen.len(), 300);
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn backward_scan_mirrors_forward() {
        let storage = MemStorage::new();
        let (mut tree, mut pager) = setup(&storage);
        for i in 0..100 {
            let key = format!("k{i:04}");
            tree.insert(&mut pager, key.as_bytes(), b"v").unwrap();
        }
        let mut position = tree.seek_last(&mut pager).unwrap();
        let mut seen = Vec::new();
        while let Some(current) = position {
            seen.push(tree.read_entry(&mut pager, current).unwrap().0);
            position = tree.previous_position(&mut pager, current).unwrap();
        }
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|pair| pair[0] > pair[1]));
    }

    #[test]
    fn seek_lands_on_lower_bound() {
        let storage = MemStorage::new();
        let (mut tree, mut pager) = setup(&storage);
        for i in (0..100).step_by(2) {
            let key = format!("k{i:04}");
            tree.insert(&mut pager, key.as_bytes(), b"v").unwrap();
        }
        // Exact hit.
        let position = tree.seek_position(&mut pager, b"k0010").unwrap().unwrap();
        assert_eq!(tree.read_entry(&mut pager, position).unwrap().0, b"k0010");
        // Between keys: the next even key.
        let position = tree.seek_position(&mut pager, b"k0011").unwrap().unwrap();
        assert_eq!(tree.read_entry(&mut pager, position).unwrap().0, b"k0012");
        // Past the end.
        assert!(tree.seek_position(&mut pager, b"k9999").unwrap().is_none());
    }
}
