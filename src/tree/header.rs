//! On-disk header layouts.
//!
//! The file header occupies the first 42 bytes of the root page:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic
//! 4       4     header_crc     (over bytes 8..42)
//! 8       8     page_count
//! 16      8     record_count
//! 24      8     freelist_head
//! 32      8     recovery_lsn
//! 40      2     page_size      (0 encodes 65536)
//! ```
//!
//! Every page carries an 8-byte page LSN at `page_offset` (42 on the root,
//! 0 elsewhere). Tree nodes follow the LSN with the rest of the 43-byte
//! node header; overflow, freelist, and pointer-map pages lay out their
//! content after the LSN.

use crate::encoding::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
use crate::error::{Error, Result};
use crate::pager::Page;
use crate::types::{Lsn, PageId};

pub const MAGIC_CODE: u32 = 0xB119_24E1;
pub const FILE_HEADER_SIZE: usize = 42;
pub const NODE_HEADER_SIZE: usize = 43;

/// Offset of the node header (and the page LSN) on a page.
pub fn page_offset(id: PageId) -> usize {
    if id.is_root() {
        FILE_HEADER_SIZE
    } else {
        0
    }
}

pub fn read_page_lsn_raw(data: &[u8], id: PageId) -> Lsn {
    let offset = page_offset(id);
    Lsn(get_u64(&data[offset..offset + 8]))
}

pub fn read_page_lsn(page: &Page) -> Lsn {
    read_page_lsn_raw(page.data(), page.id())
}

/// Stamp the page LSN; the write registers a delta like any other.
pub fn write_page_lsn(page: &mut Page, lsn: Lsn) {
    let offset = page_offset(page.id());
    put_u64(page.span(offset, 8), lsn.0);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileHeader {
    pub page_count: u64,
    pub record_count: u64,
    pub freelist_head: PageId,
    pub recovery_lsn: Lsn,
    pub page_size: usize,
}

impl FileHeader {
    fn encode_page_size(page_size: usize) -> u16 {
        if page_size == 65_536 {
            0
        } else {
            page_size as u16
        }
    }

    fn decode_page_size(raw: u16) -> usize {
        if raw == 0 {
            65_536
        } else {
            raw as usize
        }
    }

    fn crc_of(bytes: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[8..FILE_HEADER_SIZE]);
        hasher.finalize()
    }

    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0u8; FILE_HEADER_SIZE];
        put_u32(&mut out[0..4], MAGIC_CODE);
        put_u64(&mut out[8..16], self.page_count);
        put_u64(&mut out[16..24], self.record_count);
        put_u64(&mut out[24..32], self.freelist_head.0);
        put_u64(&mut out[32..40], self.recovery_lsn.0);
        put_u16(&mut out[40..42], Self::encode_page_size(self.page_size));
        let crc = Self::crc_of(&out);
        put_u32(&mut out[4..8], crc);
        out
    }

    pub fn decode(data: &[u8]) -> Result<FileHeader> {
        if data.len() < FILE_HEADER_SIZE {
            return Err(Error::Corruption(
                "file header is truncated".to_string(),
            ));
        }
        if get_u32(&data[0..4]) != MAGIC_CODE {
            return Err(Error::Corruption(format!(
                "bad magic code {:#010x}",
                get_u32(&data[0..4])
            )));
        }
        let expected = get_u32(&data[4..8]);
        let actual = Self::crc_of(&data[..FILE_HEADER_SIZE]);
        if expected != actual {
            return Err(Error::Corruption(format!(
                "file header crc mismatch: expected {expected:08x}, got {actual:08x}"
            )));
        }
        let page_size = Self::decode_page_size(get_u16(&data[40..42]));
        if !page_size.is_power_of_two() || !(512..=65_536).contains(&page_size) {
            return Err(Error::Corruption(format!(
                "impossible page size {page_size}"
            )));
        }
        Ok(FileHeader {
            page_count: get_u64(&data[8..16]),
            record_count: get_u64(&data[16..24]),
            freelist_head: PageId(get_u64(&data[24..32])),
            recovery_lsn: Lsn(get_u64(&data[32..40])),
            page_size,
        })
    }

    /// Write the header into the root page as an ordinary tracked write.
    pub fn write(&self, page: &mut Page) {
        debug_assert!(page.id().is_root());
        let encoded = self.encode();
        page.span(0, FILE_HEADER_SIZE).copy_from_slice(&encoded);
    }

    pub fn read(page: &Page) -> Result<FileHeader> {
        Self::decode(page.view(0, FILE_HEADER_SIZE))
    }
}

/* Node Header Format (offsets relative to page_offset):
 *     Offset  Size  Name
 *     0       8     page_lsn
 *     8       1     flags
 *     9       8     parent_id
 *     17      8     next_id
 *     25      8     prev_id
 *     33      2     cell_count
 *     35      2     cell_start
 *     37      2     frag_count
 *     39      2     free_start
 *     41      2     free_total
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeHeader {
    pub page_lsn: Lsn,
    pub is_external: bool,
    pub parent_id: PageId,
    pub next_id: PageId,
    pub prev_id: PageId,
    pub cell_count: u16,
    /// In-memory this can be the full page size (65536); on disk it is a
    /// u16 where 0 stands for 65536.
    pub cell_start: u32,
    pub frag_count: u16,
    pub free_start: u16,
    pub free_total: u16,
}

const FLAG_EXTERNAL: u8 = 1;

impl NodeHeader {
    pub fn read(page: &Page) -> Result<NodeHeader> {
        let base = page_offset(page.id());
        let data = page.view(base, NODE_HEADER_SIZE);
        let flags = data[8];
        if flags & !FLAG_EXTERNAL != 0 {
            return Err(Error::Corruption(format!(
                "page {} has invalid node flags {flags:#04x}",
                page.id()
            )));
        }
        Ok(NodeHeader {
            page_lsn: Lsn(get_u64(&data[0..8])),
            is_external: flags & FLAG_EXTERNAL != 0,
            parent_id: PageId(get_u64(&data[9..17])),
            next_id: PageId(get_u64(&data[17..25])),
            prev_id: PageId(get_u64(&data[25..33])),
            cell_count: get_u16(&data[33..35]),
            cell_start: get_u16(&data[35..37]) as u32,
            frag_count: get_u16(&data[37..39]),
            free_start: get_u16(&data[39..41]),
            free_total: get_u16(&data[41..43]),
        })
    }

    /// Write every field except the page LSN, which the pager owns.
    pub fn write(&self, page: &mut Page) {
        let base = page_offset(page.id());
        let data = page.span(base + 8, NODE_HEADER_SIZE - 8);
        data[0] = if self.is_external { FLAG_EXTERNAL } else { 0 };
        put_u64(&mut data[1..9], self.parent_id.0);
        put_u64(&mut data[9..17], self.next_id.0);
        put_u64(&mut data[17..25], self.prev_id.0);
        put_u16(&mut data[25..27], self.cell_count);
        put_u16(&mut data[27..29], self.cell_start as u16);
        put_u16(&mut data[29..31], self.frag_count);
        put_u16(&mut data[31..33], self.free_start);
        put_u16(&mut data[33..35], self.free_total);
    }
}
