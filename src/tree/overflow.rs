//! Overflow chains: linked pages holding the tail of a value that did not
//! fit its external cell.
//!
//! Each chain page stores the page LSN, then the next link id, then
//! `page_size - 16` content bytes. Chains are null-terminated.

use crate::encoding::{get_u64, put_u64};
use crate::error::{Error, Result};
use crate::pager::pointer_map::PointerKind;
use crate::pager::Pager;
use crate::types::PageId;

const NEXT_OFFSET: usize = 8;
pub(crate) const CONTENT_OFFSET: usize = 16;

pub(crate) fn content_size(page_size: usize) -> usize {
    page_size - CONTENT_OFFSET
}

pub(crate) fn chain_next(data: &[u8]) -> PageId {
    PageId(get_u64(&data[NEXT_OFFSET..NEXT_OFFSET + 8]))
}

/// Build a chain holding `payload`, returning the head id. `owner` is the
/// external node whose cell will reference the head.
pub(crate) fn build_chain(pager: &mut Pager, owner: PageId, payload: &[u8]) -> Result<PageId> {
    debug_assert!(!payload.is_empty());
    let mut head = PageId::NULL;
    let mut prev: Option<crate::pager::Page> = None;

    for chunk in payload.chunks(content_size(pager.page_size())) {
        let mut page = pager.allocate()?;
        put_u64(page.span(NEXT_OFFSET, 8), PageId::NULL.0);
        page.span(CONTENT_OFFSET, chunk.len()).copy_from_slice(chunk);

        match prev.take() {
            Some(mut link) => {
                put_u64(link.span(NEXT_OFFSET, 8), page.id().0);
                pager.ptrmap_write(page.id(), PointerKind::OverflowLink, link.id())?;
                pager.release(link)?;
            }
            None => {
                head = page.id();
                pager.ptrmap_write(page.id(), PointerKind::OverflowHead, owner)?;
            }
        }
        prev = Some(page);
    }
    if let Some(link) = prev {
        pager.release(link)?;
    }
    Ok(head)
}

/// Copy `len` bytes out of the chain rooted at `head`.
pub(crate) fn read_chain(pager: &mut Pager, head: PageId, len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut id = head;
    while out.len() < len {
        if id.is_null() {
            return Err(Error::Corruption(format!(
                "overflow chain ended {} bytes early",
                len - out.len()
            )));
        }
        let page = pager.acquire(id)?;
        let chunk = (len - out.len()).min(content_size(page.size()));
        out.extend_from_slice(page.view(CONTENT_OFFSET, chunk));
        id = chain_next(page.data());
        pager.release(page)?;
    }
    Ok(out)
}

/// Push every page of the chain onto the freelist.
pub(crate) fn destroy_chain(pager: &mut Pager, head: PageId) -> Result<()> {
    let mut id = head;
    while !id.is_null() {
        let page = pager.acquire(id)?;
        id = chain_next(page.data());
        pager.free(page)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemStorage, Storage};
    use crate::wal::Wal;
    use std::sync::Arc;

    fn test_pager(storage: &MemStorage) -> Pager {
        storage.create_directory("db").unwrap();
        let storage: Arc<dyn Storage> = Arc::new(storage.clone());
        let mut wal = Wal::open(storage.clone(), "db", 512, 16 * 512).unwrap();
        wal.start().unwrap();
        let mut pager = Pager::open(storage, "db/data", wal, 512, 16, 1).unwrap();
        pager.begin_txn();
        pager
    }

    #[test]
    fn chain_round_trip() {
        let storage = MemStorage::new();
        let mut pager = test_pager(&storage);

        let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        let head = build_chain(&mut pager, PageId::ROOT, &payload).unwrap();
        assert!(!head.is_null());

        let out = read_chain(&mut pager, head, payload.len()).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn destroy_returns_pages_to_freelist() {
        let storage = MemStorage::new();
        let mut pager = test_pager(&storage);

        let payload = vec![3u8; 1200];
        let head = build_chain(&mut pager, PageId::ROOT, &payload).unwrap();
        let count = pager.page_count();

        destroy_chain(&mut pager, head).unwrap();
        assert!(!pager.freelist_head().is_null());

        // The chain pages are reused instead of extending the file.
        let page = pager.allocate().unwrap();
        assert!(page.id().0 <= count);
        pager.release(page).unwrap();
    }

    #[test]
    fn truncated_chain_is_corruption() {
        let storage = MemStorage::new();
        let mut pager = test_pager(&storage);

        let payload = vec![7u8; 600];
        let head = build_chain(&mut pager, PageId::ROOT, &payload).unwrap();
        let err = read_chain(&mut pager, head, 4000).unwrap_err();
        assert!(err.is_corruption());
    }
}
