//! Block-structured writer for a single WAL segment.
//!
//! A segment is a sequence of blocks sized equal to the database page
//! size. Records are appended back-to-back within a block; a record that
//! does not fit the remaining space is split into fragments. `flush`
//! zero-pads the partial tail block, so block boundaries stay aligned and
//! the reader can skip padding by fragment type.

use crate::error::Result;
use crate::storage::AppendWriter;
use crate::types::Lsn;
use crate::wal::record::{payload_crc, FragmentType, RecordHeader, WAL_RECORD_HEADER_SIZE};

pub struct LogWriter {
    file: Box<dyn AppendWriter>,
    tail: Vec<u8>,
    offset: usize,
    block_count: usize,
}

impl LogWriter {
    pub fn new(file: Box<dyn AppendWriter>, block_size: usize) -> LogWriter {
        LogWriter {
            file,
            tail: vec![0; block_size],
            offset: 0,
            block_count: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.tail.len()
    }

    /// Total bytes this segment will occupy once flushed.
    pub fn bytes_written(&self) -> usize {
        self.block_count * self.tail.len() + self.offset
    }

    /// Frame `payload` as one logical record and buffer it.
    pub fn write_record(&mut self, lsn: Lsn, payload: &[u8]) -> Result<()> {
        let crc = payload_crc(payload);
        let mut rest = payload;
        let mut first = true;

        loop {
            let space = self.tail.len() - self.offset;
            if space <= WAL_RECORD_HEADER_SIZE {
                // Not even a header fits; the rest of the block stays zero.
                self.write_block()?;
                continue;
            }

            let take = rest.len().min(space - WAL_RECORD_HEADER_SIZE);
            let fragment = match (first, take == rest.len()) {
                (true, true) => FragmentType::Full,
                (true, false) => FragmentType::First,
                (false, true) => FragmentType::Last,
                (false, false) => FragmentType::Middle,
            };
            let header = RecordHeader {
                lsn,
                size: take as u16,
                fragment: fragment as u8,
                crc,
            };
            header.write(&mut self.tail[self.offset..self.offset + WAL_RECORD_HEADER_SIZE]);
            self.offset += WAL_RECORD_HEADER_SIZE;
            self.tail[self.offset..self.offset + take].copy_from_slice(&rest[..take]);
            self.offset += take;
            rest = &rest[take..];

            if self.offset == self.tail.len() {
                self.write_block()?;
            }
            if rest.is_empty() {
                return Ok(());
            }
            first = false;
        }
    }

    /// Write out the partial tail block (zero-padded) and sync the file.
    pub fn flush(&mut self) -> Result<()> {
        if self.offset > 0 {
            self.tail[self.offset..].fill(0);
            self.write_block()?;
        }
        self.file.sync()
    }

    fn write_block(&mut self) -> Result<()> {
        self.file.write(&self.tail)?;
        self.tail.fill(0);
        self.offset = 0;
        self.block_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemStorage, Storage};

    #[test]
    fn records_pack_back_to_back() {
        let storage = MemStorage::new();
        let mut writer = LogWriter::new(storage.append_writer("wal-00000001").unwrap(), 256);

        writer.write_record(Lsn(1), &[1u8; 10]).unwrap();
        writer.write_record(Lsn(2), &[2u8; 10]).unwrap();
        assert_eq!(writer.bytes_written(), 2 * (WAL_RECORD_HEADER_SIZE + 10));

        writer.flush().unwrap();
        // Flushing pads to a whole block.
        assert_eq!(storage.file_size("wal-00000001").unwrap(), 256);
    }

    #[test]
    fn long_record_spans_blocks() {
        let storage = MemStorage::new();
        let mut writer = LogWriter::new(storage.append_writer("wal-00000001").unwrap(), 64);

        // Needs three fragments at this block size.
        writer.write_record(Lsn(1), &[9u8; 120]).unwrap();
        writer.flush().unwrap();
        assert_eq!(storage.file_size("wal-00000001").unwrap(), 3 * 64);
    }
}
