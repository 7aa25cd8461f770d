//! Pointer-map sidecar pages.
//!
//! Every region of `entries_per_map` pages is preceded by one reserved map
//! page whose entries record, for each page in the region, the single page
//! that points at it and the relationship kind. Vacuum follows these back
//! pointers when it relocates pages.
//!
//! A map page starts with the usual 8-byte page LSN; entries follow, 9
//! bytes each: `back_ptr (u64) | kind (u8)`.

use crate::encoding::{get_u64, put_u64};
use crate::error::{Error, Result};
use crate::pager::Pager;
use crate::types::PageId;

const ENTRY_SIZE: usize = 9;
const ENTRIES_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PointerKind {
    TreeRoot = 1,
    TreeNode = 2,
    Freelist = 3,
    OverflowHead = 4,
    OverflowLink = 5,
}

impl PointerKind {
    fn from_u8(value: u8) -> Option<PointerKind> {
        match value {
            1 => Some(PointerKind::TreeRoot),
            2 => Some(PointerKind::TreeNode),
            3 => Some(PointerKind::Freelist),
            4 => Some(PointerKind::OverflowHead),
            5 => Some(PointerKind::OverflowLink),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerEntry {
    pub back_ptr: PageId,
    pub kind: PointerKind,
}

pub fn entries_per_map(page_size: usize) -> u64 {
    ((page_size - ENTRIES_OFFSET) / ENTRY_SIZE) as u64
}

/// The map page responsible for `id`. Each group is one map page followed
/// by the `entries_per_map` pages it describes.
pub fn map_page(id: PageId, page_size: usize) -> PageId {
    debug_assert!(id.0 >= 2);
    let group = entries_per_map(page_size) + 1;
    PageId((id.0 - 2) / group * group + 2)
}

pub fn is_map_page(id: PageId, page_size: usize) -> bool {
    id.0 >= 2 && map_page(id, page_size) == id
}

fn entry_offset(map_id: PageId, id: PageId) -> usize {
    debug_assert!(id.0 > map_id.0);
    ENTRIES_OFFSET + (id.0 - map_id.0 - 1) as usize * ENTRY_SIZE
}

impl Pager {
    /// Record that `back_ptr` is the page pointing at `id`.
    pub(crate) fn ptrmap_write(
        &mut self,
        id: PageId,
        kind: PointerKind,
        back_ptr: PageId,
    ) -> Result<()> {
        debug_assert!(!is_map_page(id, self.page_size()) && !id.is_root());
        let map_id = map_page(id, self.page_size());
        let mut page = self.acquire(map_id)?;
        if let Err(e) = self.upgrade(&mut page) {
            self.release(page)?;
            return Err(e);
        }
        let offset = entry_offset(map_id, id);
        let out = page.span(offset, ENTRY_SIZE);
        put_u64(&mut out[0..8], back_ptr.0);
        out[8] = kind as u8;
        self.release(page)
    }

    /// Read the pointer-map entry for `id`, or `None` if it was never set.
    pub(crate) fn ptrmap_read(&mut self, id: PageId) -> Result<Option<PointerEntry>> {
        let map_id = map_page(id, self.page_size());
        if map_id.0 > self.page_count() {
            return Ok(None);
        }
        let page = self.acquire(map_id)?;
        let offset = entry_offset(map_id, id);
        let data = page.view(offset, ENTRY_SIZE);
        let back_ptr = PageId(get_u64(&data[0..8]));
        let kind = data[8];
        self.release(page)?;
        match PointerKind::from_u8(kind) {
            Some(kind) => Ok(Some(PointerEntry { back_ptr, kind })),
            None if kind == 0 => Ok(None),
            None => Err(Error::Corruption(format!(
                "pointer map entry for page {id} has invalid kind {kind}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_pages_repeat_per_region() {
        let page_size = 512;
        let entries = entries_per_map(page_size);
        assert_eq!(entries, 56);

        assert_eq!(map_page(PageId(2), page_size), PageId(2));
        assert_eq!(map_page(PageId(3), page_size), PageId(2));
        assert_eq!(map_page(PageId(2 + entries), page_size), PageId(2));
        assert_eq!(
            map_page(PageId(2 + entries + 1), page_size),
            PageId(2 + entries + 1)
        );

        assert!(is_map_page(PageId(2), page_size));
        assert!(!is_map_page(PageId(3), page_size));
        assert!(is_map_page(PageId(2 + entries + 1), page_size));
        assert!(!is_map_page(PageId::ROOT, page_size));
    }

    #[test]
    fn entry_offsets_stay_in_bounds() {
        let page_size = 512;
        let entries = entries_per_map(page_size);
        let map = PageId(2);
        assert_eq!(entry_offset(map, PageId(3)), ENTRIES_OFFSET);
        let last = PageId(2 + entries);
        let offset = entry_offset(map, last);
        assert!(offset + ENTRY_SIZE <= page_size);
    }
}
