//! B+tree node layout and intra-node space management.
//!
//! A node is one page: the node header, then a sorted array of 2-byte cell
//! pointers growing upward, then a gap, then cell bodies packed against the
//! end of the page. Freed cell space goes on an intra-node free-block list
//! (blocks of 4+ bytes) or into the fragment counter (smaller scraps); when
//! neither the gap nor the free list can satisfy an allocation, the node is
//! defragmented in one pass.
//!
//! Cell formats:
//!
//! ```text
//! Internal:  left_child_id (8) | key_size (2) | key
//! External:  value_size (4) | key_size (2) | key | local value | [overflow_id (8)]
//! ```
//!
//! The overflow id is present exactly when the payload does not fit the
//! node's `max_local` budget; the key always stays fully local.

use crate::encoding::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
use crate::error::{Error, Result};
use crate::pager::Page;
use crate::tree::header::{page_offset, NodeHeader, NODE_HEADER_SIZE};
use crate::types::PageId;

pub const CELL_POINTER_SIZE: usize = 2;
pub const MAX_CELL_HEADER_SIZE: usize = 4 + 2 + 8;
const EXTERNAL_PREFIX_SIZE: usize = 4 + 2;
const INTERNAL_PREFIX_SIZE: usize = 8 + 2;
const MIN_BLOCK_SIZE: usize = 4;

pub fn compute_min_local(page_size: usize) -> usize {
    debug_assert!(page_size.is_power_of_two());
    // Adapted from a similar computation in SQLite3.
    (page_size - NODE_HEADER_SIZE) * 32 / 256 - MAX_CELL_HEADER_SIZE - CELL_POINTER_SIZE
}

pub fn compute_max_local(page_size: usize) -> usize {
    debug_assert!(page_size.is_power_of_two());
    (page_size - NODE_HEADER_SIZE) * 64 / 256 - MAX_CELL_HEADER_SIZE - CELL_POINTER_SIZE
}

/// Decide how many value bytes stay local for an external cell, and return
/// the cell's stored size. On return `value_size` holds the local count.
pub fn determine_cell_size(
    key_size: usize,
    value_size: &mut usize,
    min_local: usize,
    max_local: usize,
) -> usize {
    debug_assert!(key_size > 0 && key_size <= max_local);
    let total = key_size + *value_size;
    if total > max_local {
        let remote = total - key_size.max(min_local);
        *value_size -= remote;
        EXTERNAL_PREFIX_SIZE + total - remote + 8
    } else {
        EXTERNAL_PREFIX_SIZE + total
    }
}

/// An out-of-node copy of one cell.
#[derive(Debug, Clone)]
pub struct Cell {
    bytes: Vec<u8>,
    key_size: usize,
    total_ps: usize,
    local_ps: usize,
    is_external: bool,
}

impl Cell {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_external(&self) -> bool {
        self.is_external
    }

    pub fn key(&self) -> &[u8] {
        let prefix = if self.is_external {
            EXTERNAL_PREFIX_SIZE
        } else {
            INTERNAL_PREFIX_SIZE
        };
        &self.bytes[prefix..prefix + self.key_size]
    }

    pub fn total_payload_size(&self) -> usize {
        self.total_ps
    }

    /// Total value size, including any overflow tail.
    pub fn value_size(&self) -> usize {
        debug_assert!(self.is_external);
        self.total_ps - self.key_size
    }

    pub fn local_value(&self) -> &[u8] {
        debug_assert!(self.is_external);
        let start = EXTERNAL_PREFIX_SIZE + self.key_size;
        &self.bytes[start..EXTERNAL_PREFIX_SIZE + self.local_ps]
    }

    pub fn has_overflow(&self) -> bool {
        self.is_external && self.local_ps < self.total_ps
    }

    pub fn overflow_id(&self) -> PageId {
        debug_assert!(self.has_overflow());
        let offset = self.bytes.len() - 8;
        PageId(get_u64(&self.bytes[offset..]))
    }

    pub fn child_id(&self) -> PageId {
        debug_assert!(!self.is_external);
        PageId(get_u64(&self.bytes[0..8]))
    }

    pub fn set_child_id(&mut self, id: PageId) {
        debug_assert!(!self.is_external);
        put_u64(&mut self.bytes[0..8], id.0);
    }

    /// Build an external cell image. `local_value` is the locally-stored
    /// prefix of a `value_size`-byte value; the rest hangs off
    /// `overflow_id`.
    pub fn new_external(
        key: &[u8],
        local_value: &[u8],
        value_size: usize,
        overflow_id: PageId,
    ) -> Cell {
        debug_assert_eq!(local_value.len() == value_size, overflow_id.is_null());
        let mut bytes =
            Vec::with_capacity(EXTERNAL_PREFIX_SIZE + key.len() + local_value.len() + 8);
        bytes.extend_from_slice(&[0u8; EXTERNAL_PREFIX_SIZE]);
        put_u32(&mut bytes[0..4], value_size as u32);
        put_u16(&mut bytes[4..6], key.len() as u16);
        bytes.extend_from_slice(key);
        bytes.extend_from_slice(local_value);
        if !overflow_id.is_null() {
            let mut field = [0u8; 8];
            put_u64(&mut field, overflow_id.0);
            bytes.extend_from_slice(&field);
        }
        Cell {
            bytes,
            key_size: key.len(),
            total_ps: key.len() + value_size,
            local_ps: key.len() + local_value.len(),
            is_external: true,
        }
    }

    /// Build an internal cell image.
    pub fn new_internal(key: &[u8], child_id: PageId) -> Cell {
        let mut bytes = Vec::with_capacity(INTERNAL_PREFIX_SIZE + key.len());
        bytes.extend_from_slice(&[0u8; INTERNAL_PREFIX_SIZE]);
        put_u64(&mut bytes[0..8], child_id.0);
        put_u16(&mut bytes[8..10], key.len() as u16);
        bytes.extend_from_slice(key);
        Cell {
            bytes,
            key_size: key.len(),
            total_ps: key.len(),
            local_ps: key.len(),
            is_external: false,
        }
    }

    /// Separator form of this cell for insertion into an internal node:
    /// the key, pointing left at `child_id`.
    pub fn promote(&self, child_id: PageId) -> Cell {
        Cell::new_internal(self.key(), child_id)
    }
}

#[derive(Debug)]
pub struct Node {
    pub page: Page,
    pub header: NodeHeader,
    /// The one cell that did not fit, with the index it belongs at.
    pub overflow: Option<(usize, Cell)>,
    min_local: usize,
    max_local: usize,
}

impl Node {
    /// Wrap an acquired page. `cell_start == 0` means the node was just
    /// initialized and the cell area starts at the end of the page.
    pub fn from_page(page: Page, min_local: usize, max_local: usize) -> Result<Node> {
        let mut header = NodeHeader::read(&page)?;
        if header.cell_start == 0 {
            header.cell_start = page.size() as u32;
        }
        let node = Node {
            page,
            header,
            overflow: None,
            min_local,
            max_local,
        };
        if node.cell_area_offset() > node.header.cell_start as usize {
            return Err(Error::Corruption(format!(
                "page {} cell pointers overlap the cell area",
                node.page.id()
            )));
        }
        Ok(node)
    }

    /// Reset a writable page to an empty node.
    pub fn init(page: Page, is_external: bool, min_local: usize, max_local: usize) -> Node {
        debug_assert!(page.is_writable());
        let header = NodeHeader {
            is_external,
            cell_start: page.size() as u32,
            ..NodeHeader::default()
        };
        Node {
            page,
            header,
            overflow: None,
            min_local,
            max_local,
        }
    }

    /// Write the header back and surrender the page.
    pub fn finish(mut self) -> Page {
        debug_assert!(self.overflow.is_none());
        if self.page.is_writable() {
            self.header.write(&mut self.page);
        }
        self.page
    }

    /// Surrender the page without writing the header. For nodes that are
    /// about to be freed.
    pub fn into_page(self) -> Page {
        self.page
    }

    pub fn id(&self) -> PageId {
        self.page.id()
    }

    pub fn is_external(&self) -> bool {
        self.header.is_external
    }

    pub fn cell_count(&self) -> usize {
        self.header.cell_count as usize
    }

    pub fn min_local(&self) -> usize {
        self.min_local
    }

    pub fn max_local(&self) -> usize {
        self.max_local
    }

    fn slots_offset(&self) -> usize {
        page_offset(self.page.id()) + NODE_HEADER_SIZE
    }

    fn cell_area_offset(&self) -> usize {
        self.slots_offset() + self.cell_count() * CELL_POINTER_SIZE
    }

    fn gap_size(&self) -> usize {
        self.header.cell_start as usize - self.cell_area_offset()
    }

    /// Free bytes available for cells: the gap plus the free-block list.
    pub fn usable_space(&self) -> usize {
        self.gap_size() + self.header.free_total as usize
    }

    /// Capacity of the cell region (everything after the headers).
    pub fn max_usable_space(&self) -> usize {
        self.page.size() - self.slots_offset()
    }

    /// Bytes consumed by live cells, their pointers, and fragmentation.
    pub fn cell_usage(&self) -> usize {
        self.max_usable_space() - self.usable_space()
    }

    pub fn get_slot(&self, index: usize) -> usize {
        debug_assert!(index < self.cell_count());
        let offset = self.slots_offset() + index * CELL_POINTER_SIZE;
        get_u16(&self.page.data()[offset..offset + 2]) as usize
    }

    fn set_slot(&mut self, index: usize, pointer: usize) {
        let offset = self.slots_offset() + index * CELL_POINTER_SIZE;
        put_u16(self.page.span(offset, CELL_POINTER_SIZE), pointer as u16);
    }

    fn insert_slot(&mut self, index: usize, pointer: usize) {
        debug_assert!(index <= self.cell_count());
        let offset = self.slots_offset() + index * CELL_POINTER_SIZE;
        let shifted = (self.cell_count() - index) * CELL_POINTER_SIZE;
        let span = self.page.span(offset, shifted + CELL_POINTER_SIZE);
        span.copy_within(..shifted, CELL_POINTER_SIZE);
        put_u16(&mut span[..2], pointer as u16);
        self.header.cell_count += 1;
    }

    fn remove_slot(&mut self, index: usize) {
        debug_assert!(index < self.cell_count());
        let offset = self.slots_offset() + index * CELL_POINTER_SIZE;
        let shifted = (self.cell_count() - index - 1) * CELL_POINTER_SIZE;
        let span = self.page.span(offset, shifted + CELL_POINTER_SIZE);
        span.copy_within(CELL_POINTER_SIZE.., 0);
        self.header.cell_count -= 1;
    }

    fn cell_size_at(&self, offset: usize) -> usize {
        let data = &self.page.data()[offset..];
        if self.header.is_external {
            let payload = get_u32(&data[0..4]) as usize + get_u16(&data[4..6]) as usize;
            if payload <= self.max_local {
                EXTERNAL_PREFIX_SIZE + payload
            } else {
                let key_size = get_u16(&data[4..6]) as usize;
                EXTERNAL_PREFIX_SIZE + self.min_local.max(key_size) + 8
            }
        } else {
            INTERNAL_PREFIX_SIZE + get_u16(&data[8..10]) as usize
        }
    }

    pub fn read_key_at(&self, offset: usize) -> &[u8] {
        let data = &self.page.data()[offset..];
        if self.header.is_external {
            let key_size = get_u16(&data[4..6]) as usize;
            &data[EXTERNAL_PREFIX_SIZE..EXTERNAL_PREFIX_SIZE + key_size]
        } else {
            let key_size = get_u16(&data[8..10]) as usize;
            &data[INTERNAL_PREFIX_SIZE..INTERNAL_PREFIX_SIZE + key_size]
        }
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        self.read_key_at(self.get_slot(index))
    }

    /// Copy the cell at `index` out of the node.
    pub fn read_cell(&self, index: usize) -> Cell {
        let offset = self.get_slot(index);
        let size = self.cell_size_at(offset);
        let bytes = self.page.data()[offset..offset + size].to_vec();
        if self.header.is_external {
            let value_size = get_u32(&bytes[0..4]) as usize;
            let key_size = get_u16(&bytes[4..6]) as usize;
            let total_ps = value_size + key_size;
            let local_ps = if total_ps > self.max_local {
                self.min_local.max(key_size)
            } else {
                total_ps
            };
            Cell {
                bytes,
                key_size,
                total_ps,
                local_ps,
                is_external: true,
            }
        } else {
            let key_size = get_u16(&bytes[8..10]) as usize;
            Cell {
                bytes,
                key_size,
                total_ps: key_size,
                local_ps: key_size,
                is_external: false,
            }
        }
    }

    /// Binary search for `key`. Returns `(index, exact)`.
    pub fn seek(&self, key: &[u8]) -> (usize, bool) {
        let mut lower = 0;
        let mut upper = self.cell_count();
        while lower < upper {
            let mid = (lower + upper) / 2;
            match key.cmp(self.key_at(mid)) {
                std::cmp::Ordering::Equal => return (mid, true),
                std::cmp::Ordering::Less => upper = mid,
                std::cmp::Ordering::Greater => lower = mid + 1,
            }
        }
        (lower, false)
    }

    /// Child page at `index`; `index == cell_count` selects the rightmost
    /// child stored in the header.
    pub fn child_id(&self, index: usize) -> PageId {
        debug_assert!(!self.header.is_external);
        if index == self.cell_count() {
            self.header.next_id
        } else {
            let offset = self.get_slot(index);
            PageId(get_u64(&self.page.data()[offset..offset + 8]))
        }
    }

    pub fn set_child_id(&mut self, index: usize, child: PageId) {
        debug_assert!(!self.header.is_external);
        if index == self.cell_count() {
            self.header.next_id = child;
        } else {
            let offset = self.get_slot(index);
            put_u64(self.page.span(offset, 8), child.0);
        }
    }

    /// Write a cell at `index`. If it does not fit, the cell parks in the
    /// node's out-of-band overflow slot and the caller must rebalance.
    pub fn write_cell(&mut self, index: usize, cell: Cell) {
        debug_assert_eq!(cell.is_external, self.header.is_external);
        if let Some(offset) = self.allocate_block(index, cell.size()) {
            self.page
                .span(offset, cell.size())
                .copy_from_slice(&cell.bytes);
        } else {
            debug_assert!(self.overflow.is_none());
            self.overflow = Some((index, cell));
        }
    }

    pub fn erase_cell(&mut self, index: usize) {
        let offset = self.get_slot(index);
        let size = self.cell_size_at(offset);
        self.free_block(offset, size);
        self.remove_slot(index);
    }

    fn free_next_pointer(&self, offset: usize) -> usize {
        get_u16(&self.page.data()[offset..offset + 2]) as usize
    }

    fn free_block_size(&self, offset: usize) -> usize {
        get_u16(&self.page.data()[offset + 2..offset + 4]) as usize
    }

    fn free_block(&mut self, offset: usize, size: usize) {
        debug_assert!(offset + size <= self.page.size());
        if size < MIN_BLOCK_SIZE {
            self.header.frag_count += size as u16;
        } else {
            let head = self.header.free_start;
            let span = self.page.span(offset, 4);
            put_u16(&mut span[0..2], head);
            put_u16(&mut span[2..4], size as u16);
            self.header.free_start = offset as u16;
        }
        self.header.free_total += size as u16;
    }

    fn allocate_from_gap(&mut self, size: usize) -> usize {
        if size <= self.gap_size() {
            self.header.cell_start -= size as u32;
            self.header.cell_start as usize
        } else {
            0
        }
    }

    fn allocate_from_free_list(&mut self, size: usize) -> usize {
        let mut prev = 0usize;
        let mut current = self.header.free_start as usize;
        while current != 0 {
            let block_size = self.free_block_size(current);
            if size <= block_size {
                return self.take_free_space(prev, current, size);
            }
            prev = current;
            current = self.free_next_pointer(current);
        }
        0
    }

    fn take_free_space(&mut self, prev: usize, current: usize, size: usize) -> usize {
        let next = self.free_next_pointer(current);
        let block_size = self.free_block_size(current);
        debug_assert!(block_size >= size);
        let diff = block_size - size;

        if diff < MIN_BLOCK_SIZE {
            self.header.frag_count += diff as u16;
            if prev == 0 {
                self.header.free_start = next as u16;
            } else {
                put_u16(self.page.span(prev, 2), next as u16);
            }
        } else {
            put_u16(self.page.span(current + 2, 2), diff as u16);
        }
        debug_assert!(self.header.free_total as usize >= size);
        self.header.free_total -= size as u16;
        current + diff
    }

    fn allocate_space(&mut self, size: usize) -> usize {
        let offset = self.allocate_from_gap(size);
        if offset != 0 {
            return offset;
        }
        self.allocate_from_free_list(size)
    }

    /// Reserve `size` bytes and a cell pointer at `index`. Returns the
    /// body offset, or `None` when the node cannot hold the cell.
    fn allocate_block(&mut self, index: usize, size: usize) -> Option<usize> {
        debug_assert!(self.overflow.is_none());
        debug_assert!(index <= self.cell_count());
        let can_allocate = size + CELL_POINTER_SIZE <= self.usable_space();

        // Room for the cell pointer itself?
        if self.cell_area_offset() + CELL_POINTER_SIZE > self.header.cell_start as usize {
            if !can_allocate {
                return None;
            }
            self.defragment(None);
        }
        // A placeholder pointer reserves the slot before the body exists.
        self.insert_slot(index, self.page.size() - 1);

        let mut offset = self.allocate_space(size);
        if offset == 0 && can_allocate {
            self.defragment(Some(index));
            offset = self.allocate_space(size);
        }
        if offset == 0 {
            self.remove_slot(index);
            return None;
        }
        self.set_slot(index, offset);
        Some(offset)
    }

    /// Repack live cells against the end of the page, clearing the free
    /// list and the fragment counter. `skip` names a placeholder slot with
    /// no backing cell.
    pub fn defragment(&mut self, skip: Option<usize>) {
        let count = self.cell_count();
        let page_size = self.page.size();
        let mut scratch = vec![0u8; page_size];
        let mut pointers = vec![0usize; count];
        let mut end = page_size;

        for index in 0..count {
            if skip == Some(index) {
                continue;
            }
            let offset = self.get_slot(index);
            let size = self.cell_size_at(offset);
            end -= size;
            scratch[end..end + size].copy_from_slice(&self.page.data()[offset..offset + size]);
            pointers[index] = end;
        }
        let area = self.cell_area_offset();
        self.page
            .span(area, page_size - area)
            .copy_from_slice(&scratch[area..]);
        for (index, pointer) in pointers.iter().enumerate() {
            if skip == Some(index) {
                continue;
            }
            self.set_slot(index, *pointer);
        }
        self.header.cell_start = end as u32;
        self.header.frag_count = 0;
        self.header.free_start = 0;
        self.header.free_total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Lsn;

    const PAGE_SIZE: usize = 512;

    fn writable_page(id: u64) -> Page {
        let mut page = Page::new(PageId(id), vec![0u8; PAGE_SIZE]);
        page.set_writable(true);
        page
    }

    fn external_node(id: u64) -> Node {
        let (min, max) = (compute_min_local(PAGE_SIZE), compute_max_local(PAGE_SIZE));
        Node::init(writable_page(id), true, min, max)
    }

    fn put(node: &mut Node, key: &[u8], value: &[u8]) {
        let (index, exact) = node.seek(key);
        assert!(!exact);
        let cell = Cell::new_external(key, value, value.len(), PageId::NULL);
        node.write_cell(index, cell);
        assert!(node.overflow.is_none());
    }

    #[test]
    fn cells_stay_sorted() {
        let mut node = external_node(3);
        for key in ["delta", "alpha", "echo", "charlie", "bravo"] {
            put(&mut node, key.as_bytes(), b"v");
        }
        let keys: Vec<&[u8]> = (0..node.cell_count()).map(|i| node.key_at(i)).collect();
        assert_eq!(keys, vec![&b"alpha"[..], b"bravo", b"charlie", b"delta", b"echo"]);

        let (index, exact) = node.seek(b"charlie");
        assert!(exact);
        assert_eq!(index, 2);
        let (index, exact) = node.seek(b"dawn");
        assert!(!exact);
        assert_eq!(index, 3);
    }

    #[test]
    fn erase_and_reuse_freed_space() {
        let mut node = external_node(3);
        for i in 0..10u8 {
            put(&mut node, &[b'k', i], &[i; 20]);
        }
        let before = node.usable_space();
        let (index, _) = node.seek(&[b'k', 4]);
        node.erase_cell(index);
        assert!(node.usable_space() > before);

        // The freed block satisfies an allocation of the same shape.
        put(&mut node, &[b'k', 4], &[9; 20]);
        let cell = node.read_cell(node.seek(&[b'k', 4]).0);
        assert_eq!(cell.local_value(), &[9; 20]);
    }

    #[test]
    fn defragment_reclaims_fragmented_space() {
        let mut node = external_node(3);
        for i in 0..12u8 {
            put(&mut node, &[b'k', i], &[i; 8]);
        }
        for i in (0..12u8).step_by(2) {
            let (index, exact) = node.seek(&[b'k', i]);
            assert!(exact);
            node.erase_cell(index);
        }
        let usable = node.usable_space();
        node.defragment(None);
        assert_eq!(node.usable_space(), usable);
        assert_eq!(node.header.frag_count, 0);
        assert_eq!(node.header.free_total, 0);

        // Survivors are intact.
        for i in (1..12u8).step_by(2) {
            let (index, exact) = node.seek(&[b'k', i]);
            assert!(exact);
            assert_eq!(node.read_cell(index).local_value(), &[i; 8]);
        }
    }

    #[test]
    fn node_overflows_into_scratch_cell() {
        let mut node = external_node(3);
        let max = node.max_local();
        let mut count = 0u8;
        loop {
            let key = [b'x', count];
            let (index, _) = node.seek(&key);
            let cell = Cell::new_external(&key, &vec![7u8; max - 40], max - 40, PageId::NULL);
            node.write_cell(index, cell);
            if node.overflow.is_some() {
                break;
            }
            count += 1;
            assert!(count < 50, "node never overflowed");
        }
        let (index, cell) = node.overflow.take().unwrap();
        assert_eq!(cell.key(), &[b'x', count]);
        assert!(index <= node.cell_count());
    }

    #[test]
    fn oversized_payload_gets_overflow_id() {
        let (min, max) = (compute_min_local(PAGE_SIZE), compute_max_local(PAGE_SIZE));
        let mut value_size = 1000;
        let size = determine_cell_size(1, &mut value_size, min, max);
        assert!(value_size < 1000);
        assert_eq!(size, EXTERNAL_PREFIX_SIZE + 1 + value_size + 8);

        let cell = Cell::new_external(b"k", &vec![b'x'; value_size], 1000, PageId(42));
        assert!(cell.has_overflow());
        assert_eq!(cell.overflow_id(), PageId(42));
        assert_eq!(cell.value_size(), 1000);
        assert_eq!(cell.local_value().len(), value_size);
    }

    #[test]
    fn internal_cells_carry_children() {
        let (min, max) = (compute_min_local(PAGE_SIZE), compute_max_local(PAGE_SIZE));
        let mut node = Node::init(writable_page(4), false, min, max);
        node.header.next_id = PageId(9);

        let cell = Cell::new_internal(b"m", PageId(7));
        node.write_cell(0, cell);
        assert_eq!(node.child_id(0), PageId(7));
        assert_eq!(node.child_id(1), PageId(9));

        node.set_child_id(0, PageId(8));
        assert_eq!(node.child_id(0), PageId(8));

        let lifted = node.read_cell(0);
        assert_eq!(lifted.key(), b"m");
        assert_eq!(lifted.child_id(), PageId(8));
    }

    #[test]
    fn header_written_on_finish() {
        let mut node = external_node(3);
        put(&mut node, b"a", b"1");
        let count = node.header.cell_count;
        let page = node.finish();
        assert_eq!(crate::tree::header::NodeHeader::read(&page).unwrap().cell_count, count);
        assert_eq!(page.lsn(), Lsn::NULL);
    }
}
