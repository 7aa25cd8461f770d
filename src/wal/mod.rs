//! Write-ahead log: durable, ordered, append-only storage for page images,
//! page deltas, and commit markers.
//!
//! The log is a sequence of segment files named `wal-NNNNNNNN` under the
//! WAL directory. Records never span segments, so dropping a suffix of the
//! log (transaction abort) and dropping a prefix (checkpoint cleanup) are
//! both whole-file operations. The engine finalizes the current segment at
//! every commit, which is what guarantees a commit LSN always ends a
//! finalized segment.

mod reader;
pub(crate) mod record;
mod writer;

pub use record::{DeltaContent, WalPayload};

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{join_path, Storage};
use crate::types::{Lsn, PageId, SegmentId};
use reader::LogReader;
use record::{
    decode_payload, decode_segment_name, encode_commit, encode_deltas, encode_full_image,
    encode_segment_name, WAL_RECORD_HEADER_SIZE,
};
use writer::LogWriter;

/// Callback invoked for each logical record during a roll.
pub type RollCallback<'a> = &'a mut dyn FnMut(Lsn, WalPayload) -> Result<()>;

pub struct Wal {
    storage: Arc<dyn Storage>,
    dir: String,
    page_size: usize,
    segment_limit: usize,
    /// Known segments with their memoized first LSNs.
    segments: BTreeMap<SegmentId, Option<Lsn>>,
    writer: Option<LogWriter>,
    writing_id: SegmentId,
    /// High-water mark for segment ids; never reused, even after truncation.
    next_id: SegmentId,
    last_lsn: Lsn,
    flushed_lsn: Lsn,
}

impl Wal {
    /// Open the log over whatever segments exist in `dir`. The writer is
    /// not started; recovery reads the log first, then calls `start`.
    pub fn open(
        storage: Arc<dyn Storage>,
        dir: &str,
        page_size: usize,
        segment_limit: usize,
    ) -> Result<Wal> {
        let mut segments = BTreeMap::new();
        for name in storage.get_children(dir)? {
            let id = decode_segment_name(&name);
            if !id.is_null() {
                segments.insert(id, None);
            }
        }
        let next_id = segments
            .keys()
            .next_back()
            .copied()
            .unwrap_or(SegmentId::NULL)
            .next();

        let mut wal = Wal {
            storage,
            dir: dir.to_string(),
            page_size,
            segment_limit,
            segments,
            writer: None,
            writing_id: SegmentId::NULL,
            next_id,
            last_lsn: Lsn::NULL,
            flushed_lsn: Lsn::NULL,
        };
        wal.last_lsn = wal.scan_last_lsn()?;
        wal.flushed_lsn = wal.last_lsn;
        Ok(wal)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.writer.is_some()
    }

    /// Last assigned LSN.
    pub fn current_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// Highest LSN known durable. A lower bound on durability.
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn
    }

    fn segment_path(&self, id: SegmentId) -> String {
        join_path(&self.dir, &encode_segment_name(id))
    }

    /// Open a fresh segment for appending.
    pub fn start(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let id = self.next_id;
        self.next_id = id.next();
        let file = self.storage.append_writer(&self.segment_path(id))?;
        self.writer = Some(LogWriter::new(file, self.page_size));
        self.writing_id = id;
        self.segments.insert(id, None);
        Ok(())
    }

    /// Flush, then close the writer. An empty trailing segment is unlinked.
    pub fn stop(&mut self) -> Result<()> {
        if self.writer.is_none() {
            return Ok(());
        }
        self.flush()?;
        self.writer = None;
        if self.segments.get(&self.writing_id) == Some(&None) {
            self.segments.remove(&self.writing_id);
            self.storage.remove_file(&self.segment_path(self.writing_id))?;
        }
        self.writing_id = SegmentId::NULL;
        Ok(())
    }

    fn writer_mut(&mut self) -> Result<&mut LogWriter> {
        self.writer
            .as_mut()
            .ok_or_else(|| Error::LogicError("WAL writer is not running".to_string()))
    }

    /// Worst-case framed size of a payload, counting one header per block
    /// it could touch.
    fn framed_size(&self, payload_len: usize) -> usize {
        let per_block = self.page_size - WAL_RECORD_HEADER_SIZE;
        let fragments = payload_len / per_block + 2;
        payload_len + fragments * WAL_RECORD_HEADER_SIZE
    }

    fn log(&mut self, payload: Vec<u8>) -> Result<Lsn> {
        // Keep whole records inside one segment: if this one will not fit
        // in the space remaining, finalize the segment first. A record too
        // large for any segment gets a dedicated oversized segment.
        let needed = self.framed_size(payload.len());
        let written = self.writer_mut()?.bytes_written();
        if written > 0 && written + needed > self.segment_limit {
            self.advance()?;
        }

        let lsn = self.last_lsn.next();
        self.writer_mut()?.write_record(lsn, &payload)?;
        self.last_lsn = lsn;
        let slot = self.segments.entry(self.writing_id).or_insert(None);
        if slot.is_none() {
            *slot = Some(lsn);
        }
        Ok(lsn)
    }

    /// Log a pre-mutation snapshot of a page.
    pub fn log_image(&mut self, page_id: PageId, image: &[u8]) -> Result<Lsn> {
        self.log(encode_full_image(page_id, image))
    }

    /// Log the modified byte ranges of a page.
    pub fn log_deltas(
        &mut self,
        page_id: PageId,
        page: &[u8],
        deltas: &[(usize, usize)],
    ) -> Result<Lsn> {
        self.log(encode_deltas(page_id, page, deltas))
    }

    /// Log a commit marker.
    pub fn log_commit(&mut self) -> Result<Lsn> {
        self.log(encode_commit())
    }

    /// Sync buffered records to disk and advance the durability point.
    pub fn flush(&mut self) -> Result<()> {
        let last = self.last_lsn;
        self.writer_mut()?.flush()?;
        self.flushed_lsn = last;
        Ok(())
    }

    /// Finalize the current segment and open the next one. A segment with
    /// no records is kept as-is.
    pub fn advance(&mut self) -> Result<()> {
        if self.segments.get(&self.writing_id) == Some(&None) {
            return Ok(());
        }
        self.flush()?;
        self.writer = None;
        self.start()
    }

    /// Drop every record with an LSN greater than `lsn`. Only called when
    /// `lsn` terminates a finalized segment (the commit protocol advances
    /// the segment at each commit), so this is segment-granular.
    pub fn truncate(&mut self, lsn: Lsn) -> Result<()> {
        // Anything still buffered is by definition after `lsn`.
        self.writer = None;
        self.writing_id = SegmentId::NULL;

        let ids: Vec<SegmentId> = self.segments.keys().rev().copied().collect();
        for id in ids {
            let first = self.first_lsn(id)?;
            match first {
                Some(first) if first <= lsn => break,
                _ => {
                    self.segments.remove(&id);
                    self.storage.remove_file(&self.segment_path(id))?;
                }
            }
        }
        self.last_lsn = lsn;
        self.flushed_lsn = self.flushed_lsn.min(lsn);
        self.start()
    }

    /// Unlink every segment whose highest LSN is below `lsn`. A segment
    /// qualifies exactly when its successor starts at or before `lsn`.
    pub fn remove_before(&mut self, lsn: Lsn) -> Result<()> {
        loop {
            let mut ids = self.segments.keys().copied();
            let (Some(first), Some(second)) = (ids.next(), ids.next()) else {
                return Ok(());
            };
            if first == self.writing_id {
                return Ok(());
            }
            match self.first_lsn(second)? {
                Some(second_first) if second_first <= lsn => {
                    self.segments.remove(&first);
                    self.storage.remove_file(&self.segment_path(first))?;
                }
                _ => return Ok(()),
            }
        }
    }

    /// First LSN of a segment, or `None` if the segment holds no records.
    fn first_lsn(&mut self, id: SegmentId) -> Result<Option<Lsn>> {
        if let Some(Some(lsn)) = self.segments.get(&id) {
            return Ok(Some(*lsn));
        }
        let file = self.storage.random_reader(&self.segment_path(id))?;
        let mut reader = LogReader::new(file, self.page_size);
        match reader.read_first_lsn() {
            Ok(lsn) => {
                self.segments.insert(id, Some(lsn));
                Ok(Some(lsn))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn open_reader(&self, id: SegmentId, is_last: bool) -> Result<LogReader> {
        match self.storage.random_reader(&self.segment_path(id)) {
            Ok(file) => Ok(LogReader::new(file, self.page_size)),
            Err(e) if e.is_not_found() && !is_last => Err(Error::Corruption(format!(
                "missing WAL segment {id} mid-log"
            ))),
            Err(e) => Err(e),
        }
    }

    /// The segments to visit for a forward roll from `from`, in ascending
    /// order, each flagged with whether it is the newest segment.
    pub fn segments_forward(&mut self, from: Lsn) -> Result<Vec<(SegmentId, bool)>> {
        let ids: Vec<SegmentId> = self.segments.keys().copied().collect();

        // Start at the newest segment that begins at or before `from`.
        let mut start = 0;
        for (index, id) in ids.iter().enumerate() {
            match self.first_lsn(*id)? {
                Some(first) if first <= from => start = index,
                _ => break,
            }
        }
        let count = ids.len();
        Ok(ids
            .into_iter()
            .enumerate()
            .skip(start)
            .map(|(index, id)| (id, index + 1 == count))
            .collect())
    }

    /// All segments in descending order, flagged like `segments_forward`.
    pub fn segments_backward(&self) -> Vec<(SegmentId, bool)> {
        let count = self.segments.len();
        self.segments
            .keys()
            .copied()
            .enumerate()
            .rev()
            .map(|(index, id)| (id, index + 1 == count))
            .collect()
    }

    /// Read and decode every logical record of one segment. In the newest
    /// segment (`is_last`), a torn or corrupt tail marks the end of the
    /// log; anywhere else it is fatal corruption.
    pub fn read_segment_records(
        &self,
        id: SegmentId,
        is_last: bool,
    ) -> Result<Vec<(Lsn, WalPayload)>> {
        let mut reader = self.open_reader(id, is_last)?;
        let mut records = Vec::new();
        loop {
            match reader.read_record() {
                Ok((lsn, payload)) => records.push((lsn, decode_payload(&payload)?)),
                Err(e) if e.is_not_found() => break,
                Err(e) if e.is_corruption() && is_last => {
                    log::warn!("treating corrupt WAL tail as end-of-log: {e}");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Apply `cb` to every record with LSN >= `from`, in LSN order.
    pub fn roll_forward(&mut self, from: Lsn, cb: RollCallback) -> Result<()> {
        for (id, is_last) in self.segments_forward(from)? {
            for (lsn, payload) in self.read_segment_records(id, is_last)? {
                if lsn >= from {
                    cb(lsn, payload)?;
                }
            }
        }
        Ok(())
    }

    /// Apply `cb` to records in reverse LSN order until one with
    /// LSN <= `to` has been reached.
    pub fn roll_backward(&mut self, to: Lsn, cb: RollCallback) -> Result<()> {
        for (id, is_last) in self.segments_backward() {
            for (lsn, payload) in self.read_segment_records(id, is_last)?.into_iter().rev() {
                if lsn <= to {
                    return Ok(());
                }
                cb(lsn, payload)?;
            }
        }
        Ok(())
    }

    /// Find the newest LSN present in the log by scanning backward over
    /// segments until one yields a record.
    fn scan_last_lsn(&mut self) -> Result<Lsn> {
        for (id, is_last) in self.segments_backward() {
            if let Some((lsn, _)) = self.read_segment_records(id, is_last)?.pop() {
                return Ok(lsn);
            }
        }
        Ok(Lsn::NULL)
    }
}
