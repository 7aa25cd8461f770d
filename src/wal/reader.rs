//! Block-structured reader for a single WAL segment.
//!
//! Reassembles logical records from fragments and verifies the payload CRC
//! once a record is complete. A clean end of the segment surfaces as
//! `NotFound`; torn writes and bad CRCs surface as `Corruption`, and it is
//! the caller's business to downgrade those to end-of-log when the segment
//! is the last one.

use crate::error::{Error, Result};
use crate::storage::RandomReader;
use crate::types::Lsn;
use crate::wal::record::{FragmentType, RecordHeader, WAL_RECORD_HEADER_SIZE};

pub struct LogReader {
    file: Box<dyn RandomReader>,
    tail: Vec<u8>,
    tail_len: usize,
    offset: usize,
    block: u64,
    loaded: bool,
}

impl LogReader {
    pub fn new(file: Box<dyn RandomReader>, block_size: usize) -> LogReader {
        LogReader {
            file,
            tail: vec![0; block_size],
            tail_len: 0,
            offset: 0,
            block: 0,
            loaded: false,
        }
    }

    fn eof() -> Error {
        Error::NotFound("reached the end of the segment".to_string())
    }

    fn corrupt(what: &str) -> Error {
        Error::Corruption(format!("cannot read WAL record: {what}"))
    }

    /// Load the block at `self.block` into the tail buffer. A short read is
    /// a torn tail write: report it as corruption so the caller can decide
    /// whether it marks the end of the log.
    fn load_block(&mut self, mid_record: bool) -> Result<()> {
        let block_size = self.tail.len();
        let n = self
            .file
            .read(&mut self.tail, self.block * block_size as u64)?;
        if n == 0 {
            return Err(if mid_record {
                Self::corrupt("logical record is incomplete")
            } else {
                Self::eof()
            });
        }
        if n < block_size {
            return Err(Self::corrupt("segment ends with a torn block"));
        }
        self.tail_len = n;
        self.offset = 0;
        self.loaded = true;
        Ok(())
    }

    /// Read the next fully-reassembled logical record.
    ///
    /// Returns `NotFound` at the clean end of the segment.
    pub fn read_record(&mut self) -> Result<(Lsn, Vec<u8>)> {
        let mut payload = Vec::new();
        let mut lsn = Lsn::NULL;
        let mut expected_crc = 0u32;
        let mut in_progress = false;

        loop {
            if !self.loaded {
                self.load_block(in_progress)?;
            }

            if self.tail_len - self.offset <= WAL_RECORD_HEADER_SIZE {
                self.block += 1;
                self.loaded = false;
                self.load_block(in_progress)?;
            }

            let header =
                RecordHeader::read(&self.tail[self.offset..self.offset + WAL_RECORD_HEADER_SIZE]);
            if header.is_padding() {
                // Zero bytes at a block tail; skip to the next block.
                self.block += 1;
                self.loaded = false;
                continue;
            }

            let Some(fragment) = FragmentType::from_u8(header.fragment) else {
                return Err(Self::corrupt(&format!(
                    "invalid fragment type {}",
                    header.fragment
                )));
            };
            let size = header.size as usize;
            if self.offset + WAL_RECORD_HEADER_SIZE + size > self.tail_len {
                return Err(Self::corrupt("fragment overruns its block"));
            }

            match (in_progress, fragment) {
                (false, FragmentType::Full | FragmentType::First) => {
                    lsn = header.lsn;
                    expected_crc = header.crc;
                }
                (true, FragmentType::Middle | FragmentType::Last) => {
                    if header.lsn != lsn {
                        return Err(Self::corrupt(&format!(
                            "fragment lsn {} does not continue record {lsn}",
                            header.lsn
                        )));
                    }
                }
                _ => return Err(Self::corrupt("fragments are out of order")),
            }

            let start = self.offset + WAL_RECORD_HEADER_SIZE;
            payload.extend_from_slice(&self.tail[start..start + size]);
            self.offset = start + size;

            match fragment {
                FragmentType::Full | FragmentType::Last => {
                    let crc = crate::wal::record::payload_crc(&payload);
                    if crc != expected_crc {
                        return Err(Self::corrupt(&format!(
                            "crc mismatch for record {lsn}: expected {expected_crc:08x}, got {crc:08x}"
                        )));
                    }
                    return Ok((lsn, payload));
                }
                _ => in_progress = true,
            }
        }
    }

    /// LSN of the first record in the segment, if any.
    pub fn read_first_lsn(&mut self) -> Result<Lsn> {
        // The writer never emits a block without starting a record at
        // offset zero of the first block.
        let mut header = [0u8; WAL_RECORD_HEADER_SIZE];
        let n = self.file.read(&mut header, 0)?;
        if n < WAL_RECORD_HEADER_SIZE {
            return Err(Self::eof());
        }
        let header = RecordHeader::read(&header);
        if header.is_padding() {
            return Err(Self::eof());
        }
        Ok(header.lsn)
    }
}
