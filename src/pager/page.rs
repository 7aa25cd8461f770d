//! Borrowed page handles and modified-range (delta) tracking.
//!
//! A `Page` owns a copy of its frame's bytes while borrowed from the pager.
//! Reads go through `view`; writes go through `span`, which records the
//! touched byte range. At release time the accumulated ranges are merged
//! and become one WAL delta record.

use crate::types::{Lsn, PageId};

/// One modified byte range of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDelta {
    pub offset: usize,
    pub size: usize,
}

fn can_merge(lhs: &PageDelta, rhs: &PageDelta) -> bool {
    // Precondition: lhs.offset <= rhs.offset. Overlapping or touching
    // ranges merge.
    rhs.offset <= lhs.offset + lhs.size
}

fn merge(lhs: &PageDelta, rhs: &PageDelta) -> PageDelta {
    let rhs_end = rhs.offset + rhs.size;
    PageDelta {
        offset: lhs.offset,
        size: lhs.size.max(rhs_end - lhs.offset),
    }
}

/// Insert a delta keeping the list ordered by offset, merging with a
/// neighbor when the new range overlaps or touches it.
pub fn insert_delta(deltas: &mut Vec<PageDelta>, delta: PageDelta) {
    debug_assert!(delta.size > 0);
    let index = deltas.partition_point(|d| d.offset <= delta.offset);
    if index < deltas.len() && can_merge(&delta, &deltas[index]) {
        deltas[index] = merge(&delta, &deltas[index]);
        return;
    }
    if index > 0 && can_merge(&deltas[index - 1], &delta) {
        deltas[index - 1] = merge(&deltas[index - 1], &delta);
        return;
    }
    deltas.insert(index, delta);
}

/// One linear sweep merging overlapping/adjacent runs. Afterwards no two
/// deltas overlap or touch and offsets strictly ascend.
pub fn compress_deltas(deltas: &mut Vec<PageDelta>) {
    if deltas.len() < 2 {
        return;
    }
    let mut out = 0;
    for index in 1..deltas.len() {
        let rhs = deltas[index];
        if can_merge(&deltas[out], &rhs) {
            deltas[out] = merge(&deltas[out], &rhs);
        } else {
            out += 1;
            deltas[out] = rhs;
        }
    }
    deltas.truncate(out + 1);
}

#[derive(Debug)]
pub struct Page {
    id: PageId,
    data: Vec<u8>,
    writable: bool,
    deltas: Vec<PageDelta>,
}

impl Page {
    pub(crate) fn new(id: PageId, data: Vec<u8>) -> Page {
        Page {
            id,
            data,
            writable: false,
            deltas: Vec::new(),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn view(&self, offset: usize, size: usize) -> &[u8] {
        &self.data[offset..offset + size]
    }

    /// Mutable access to a byte range; the range is recorded as modified.
    pub fn span(&mut self, offset: usize, size: usize) -> &mut [u8] {
        debug_assert!(self.writable, "span() on a read-only page");
        insert_delta(&mut self.deltas, PageDelta { offset, size });
        &mut self.data[offset..offset + size]
    }

    /// The page LSN stamped into the node header on this page.
    pub fn lsn(&self) -> Lsn {
        crate::tree::header::read_page_lsn(self)
    }

    pub(crate) fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    pub(crate) fn deltas(&self) -> &[PageDelta] {
        &self.deltas
    }

    pub(crate) fn deltas_mut(&mut self) -> &mut Vec<PageDelta> {
        &mut self.deltas
    }

    /// Raw mutable bytes without delta tracking. Recovery and abort use
    /// this to install content that is already in the log.
    pub(crate) fn data_mut_untracked(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(offset: usize, size: usize) -> PageDelta {
        PageDelta { offset, size }
    }

    #[test]
    fn insert_keeps_order_and_merges_overlap() {
        let mut deltas = Vec::new();
        insert_delta(&mut deltas, d(10, 4));
        insert_delta(&mut deltas, d(0, 2));
        insert_delta(&mut deltas, d(30, 1));
        assert_eq!(deltas, vec![d(0, 2), d(10, 4), d(30, 1)]);

        // Overlaps [10, 14) from the left.
        insert_delta(&mut deltas, d(8, 3));
        assert_eq!(deltas, vec![d(0, 2), d(8, 6), d(30, 1)]);

        // Touching ranges merge too.
        insert_delta(&mut deltas, d(2, 3));
        assert_eq!(deltas, vec![d(0, 5), d(8, 6), d(30, 1)]);
    }

    #[test]
    fn compress_leaves_disjoint_runs() {
        let mut deltas = vec![d(0, 4), d(2, 4), d(6, 2), d(20, 5), d(26, 1)];
        compress_deltas(&mut deltas);
        assert_eq!(deltas, vec![d(0, 8), d(20, 5), d(26, 1)]);

        // No two deltas overlap or touch.
        for pair in deltas.windows(2) {
            assert!(pair[0].offset + pair[0].size < pair[1].offset);
        }
    }

    #[test]
    fn compress_subsumed_range() {
        let mut deltas = vec![d(0, 10), d(2, 3)];
        compress_deltas(&mut deltas);
        assert_eq!(deltas, vec![d(0, 10)]);
    }

    #[test]
    fn span_records_deltas() {
        let mut page = Page::new(PageId(2), vec![0u8; 64]);
        page.set_writable(true);
        page.span(4, 4).copy_from_slice(&[1, 2, 3, 4]);
        page.span(6, 4).copy_from_slice(&[9, 9, 9, 9]);
        assert_eq!(page.deltas(), &[d(4, 6)]);
        assert_eq!(page.view(4, 6), &[1, 2, 9, 9, 9, 9]);
    }
}
