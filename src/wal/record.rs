//! WAL record framing and payload encoding.
//!
//! Every physical record is a 15-byte header followed by a payload
//! fragment:
//!
//! ```text
//! Offset  Size  Field
//! 0       8     lsn
//! 8       2     size      (bytes of payload in this fragment)
//! 10      1     type      (fragment state, see below)
//! 11      4     crc32     (over the whole logical payload)
//! ```
//!
//! A logical record that fits in the space remaining in a block is written
//! as a single FULL fragment; otherwise it is split into FIRST, zero or
//! more MIDDLE, and a LAST fragment, all carrying the same LSN and CRC.
//! Fragments never span segment files.
//!
//! The payload's leading byte selects the payload kind: a full page image,
//! a set of byte-range deltas, or a commit marker.

use crate::encoding::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
use crate::error::{Error, Result};
use crate::types::{Lsn, PageId};

pub const WAL_RECORD_HEADER_SIZE: usize = 15;

pub const WAL_SEGMENT_PREFIX: &str = "wal-";

/// Build the file name of a WAL segment: `wal-` plus the zero-padded id.
pub fn encode_segment_name(id: crate::types::SegmentId) -> String {
    format!("{WAL_SEGMENT_PREFIX}{:08}", id.0)
}

/// Parse a segment file name; returns null for names that are not segments.
pub fn decode_segment_name(name: &str) -> crate::types::SegmentId {
    let Some(digits) = name.strip_prefix(WAL_SEGMENT_PREFIX) else {
        return crate::types::SegmentId::NULL;
    };
    if digits.is_empty() || !digits.bytes().all(|c| c.is_ascii_digit()) {
        return crate::types::SegmentId::NULL;
    }
    match digits.parse::<u64>() {
        Ok(value) => crate::types::SegmentId(value),
        Err(_) => crate::types::SegmentId::NULL,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FragmentType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl FragmentType {
    pub fn from_u8(value: u8) -> Option<FragmentType> {
        match value {
            1 => Some(FragmentType::Full),
            2 => Some(FragmentType::First),
            3 => Some(FragmentType::Middle),
            4 => Some(FragmentType::Last),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub lsn: Lsn,
    pub size: u16,
    pub fragment: u8,
    pub crc: u32,
}

impl RecordHeader {
    pub fn write(&self, out: &mut [u8]) {
        put_u64(&mut out[0..8], self.lsn.0);
        put_u16(&mut out[8..10], self.size);
        out[10] = self.fragment;
        put_u32(&mut out[11..15], self.crc);
    }

    pub fn read(data: &[u8]) -> RecordHeader {
        RecordHeader {
            lsn: Lsn(get_u64(&data[0..8])),
            size: get_u16(&data[8..10]),
            fragment: data[10],
            crc: get_u32(&data[11..15]),
        }
    }

    /// A zeroed header marks block padding: nothing further in this block.
    pub fn is_padding(&self) -> bool {
        self.fragment == 0
    }
}

const PAYLOAD_FULL_IMAGE: u8 = 1;
const PAYLOAD_DELTA: u8 = 2;
const PAYLOAD_COMMIT: u8 = 3;

/// One contiguous modified byte range within a delta payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaContent {
    pub offset: usize,
    pub data: Vec<u8>,
}

/// A decoded logical WAL payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalPayload {
    FullImage { page_id: PageId, image: Vec<u8> },
    Delta { page_id: PageId, deltas: Vec<DeltaContent> },
    Commit,
}

pub fn encode_full_image(page_id: PageId, image: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + image.len());
    buf.push(PAYLOAD_FULL_IMAGE);
    buf.extend_from_slice(&[0u8; 8]);
    put_u64(&mut buf[1..9], page_id.0);
    buf.extend_from_slice(image);
    buf
}

/// Encode the modified ranges of `page` described by `deltas`. Ranges wider
/// than `u16::MAX` bytes are chunked so every entry's size fits the format.
pub fn encode_deltas(page_id: PageId, page: &[u8], deltas: &[(usize, usize)]) -> Vec<u8> {
    let mut entries: Vec<(usize, usize)> = Vec::with_capacity(deltas.len());
    for &(offset, size) in deltas {
        debug_assert!(offset + size <= page.len());
        let mut offset = offset;
        let mut size = size;
        while size > u16::MAX as usize {
            entries.push((offset, u16::MAX as usize));
            offset += u16::MAX as usize;
            size -= u16::MAX as usize;
        }
        entries.push((offset, size));
    }

    let total: usize = entries.iter().map(|(_, size)| 4 + size).sum();
    let mut buf = Vec::with_capacity(1 + 8 + 2 + total);
    buf.push(PAYLOAD_DELTA);
    buf.extend_from_slice(&[0u8; 10]);
    put_u64(&mut buf[1..9], page_id.0);
    put_u16(&mut buf[9..11], entries.len() as u16);
    for (offset, size) in entries {
        let mut field = [0u8; 4];
        put_u16(&mut field[0..2], offset as u16);
        put_u16(&mut field[2..4], size as u16);
        buf.extend_from_slice(&field);
        buf.extend_from_slice(&page[offset..offset + size]);
    }
    buf
}

pub fn encode_commit() -> Vec<u8> {
    vec![PAYLOAD_COMMIT]
}

pub fn decode_payload(payload: &[u8]) -> Result<WalPayload> {
    let corrupt = |what: &str| Error::Corruption(format!("WAL payload is malformed: {what}"));
    let Some(&kind) = payload.first() else {
        return Err(corrupt("empty payload"));
    };
    match kind {
        PAYLOAD_FULL_IMAGE => {
            if payload.len() < 9 {
                return Err(corrupt("truncated full image"));
            }
            Ok(WalPayload::FullImage {
                page_id: PageId(get_u64(&payload[1..9])),
                image: payload[9..].to_vec(),
            })
        }
        PAYLOAD_DELTA => {
            if payload.len() < 11 {
                return Err(corrupt("truncated delta header"));
            }
            let page_id = PageId(get_u64(&payload[1..9]));
            let count = get_u16(&payload[9..11]) as usize;
            let mut deltas = Vec::with_capacity(count);
            let mut cursor = 11;
            for _ in 0..count {
                if cursor + 4 > payload.len() {
                    return Err(corrupt("truncated delta entry"));
                }
                let offset = get_u16(&payload[cursor..cursor + 2]) as usize;
                let size = get_u16(&payload[cursor + 2..cursor + 4]) as usize;
                cursor += 4;
                if cursor + size > payload.len() {
                    return Err(corrupt("delta entry overruns payload"));
                }
                deltas.push(DeltaContent {
                    offset,
                    data: payload[cursor..cursor + size].to_vec(),
                });
                cursor += size;
            }
            if cursor != payload.len() {
                return Err(corrupt("trailing bytes after delta entries"));
            }
            Ok(WalPayload::Delta { page_id, deltas })
        }
        PAYLOAD_COMMIT => Ok(WalPayload::Commit),
        other => Err(corrupt(&format!("unknown payload type {other}"))),
    }
}

pub fn payload_crc(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SegmentId;

    #[test]
    fn segment_names() {
        assert_eq!(encode_segment_name(SegmentId(7)), "wal-00000007");
        assert_eq!(decode_segment_name("wal-00000007"), SegmentId(7));
        assert_eq!(decode_segment_name("wal-123456789"), SegmentId(123456789));
        assert_eq!(decode_segment_name("data"), SegmentId::NULL);
        assert_eq!(decode_segment_name("wal-"), SegmentId::NULL);
        assert_eq!(decode_segment_name("wal-12ab"), SegmentId::NULL);
    }

    #[test]
    fn record_header_round_trip() {
        let header = RecordHeader {
            lsn: Lsn(42),
            size: 513,
            fragment: FragmentType::First as u8,
            crc: 0xCAFE_F00D,
        };
        let mut buf = [0u8; WAL_RECORD_HEADER_SIZE];
        header.write(&mut buf);
        let out = RecordHeader::read(&buf);
        assert_eq!(out.lsn, Lsn(42));
        assert_eq!(out.size, 513);
        assert_eq!(out.fragment, FragmentType::First as u8);
        assert_eq!(out.crc, 0xCAFE_F00D);
        assert!(!out.is_padding());
        assert!(RecordHeader::read(&[0u8; WAL_RECORD_HEADER_SIZE]).is_padding());
    }

    #[test]
    fn full_image_round_trip() {
        let payload = encode_full_image(PageId(3), &[7u8; 64]);
        match decode_payload(&payload).unwrap() {
            WalPayload::FullImage { page_id, image } => {
                assert_eq!(page_id, PageId(3));
                assert_eq!(image, vec![7u8; 64]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn delta_round_trip() {
        let mut page = vec![0u8; 256];
        for (i, byte) in page.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let payload = encode_deltas(PageId(9), &page, &[(4, 8), (100, 3)]);
        match decode_payload(&payload).unwrap() {
            WalPayload::Delta { page_id, deltas } => {
                assert_eq!(page_id, PageId(9));
                assert_eq!(deltas.len(), 2);
                assert_eq!(deltas[0].offset, 4);
                assert_eq!(deltas[0].data, page[4..12].to_vec());
                assert_eq!(deltas[1].offset, 100);
                assert_eq!(deltas[1].data, page[100..103].to_vec());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn commit_round_trip() {
        assert_eq!(decode_payload(&encode_commit()).unwrap(), WalPayload::Commit);
    }

    #[test]
    fn garbage_payload_is_corruption() {
        assert!(decode_payload(&[]).unwrap_err().is_corruption());
        assert!(decode_payload(&[99]).unwrap_err().is_corruption());
        // Delta entry that claims more bytes than remain.
        let mut bad = encode_deltas(PageId(1), &[0u8; 32], &[(0, 4)]);
        bad.truncate(bad.len() - 2);
        assert!(decode_payload(&bad).unwrap_err().is_corruption());
    }
}
