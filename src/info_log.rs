//! Line-oriented informational logging.
//!
//! The engine reports milestones (open, recovery, commit, abort) to an
//! injectable sink. The default sink appends to the `log` file in the
//! database directory; anything implementing `InfoLog` can be supplied
//! through the options instead. Ambient diagnostics additionally go
//! through the `log` crate facade.

use crate::storage::{AppendWriter, Storage};

pub trait InfoLog: Send {
    fn log(&mut self, message: &str);
}

pub(crate) struct FileInfoLog {
    file: Box<dyn AppendWriter>,
}

impl FileInfoLog {
    pub(crate) fn open(storage: &dyn Storage, path: &str) -> Option<FileInfoLog> {
        match storage.append_writer(path) {
            Ok(file) => Some(FileInfoLog { file }),
            Err(e) => {
                log::warn!("could not open info log at {path}: {e}");
                None
            }
        }
    }
}

impl InfoLog for FileInfoLog {
    fn log(&mut self, message: &str) {
        let line = format!("{message}\n");
        let _ = self.file.write(line.as_bytes());
    }
}

/// Discards everything. Used when no sink could be opened.
pub(crate) struct NullInfoLog;

impl InfoLog for NullInfoLog {
    fn log(&mut self, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    #[test]
    fn file_sink_appends_lines() {
        let storage = MemStorage::new();
        let mut sink = FileInfoLog::open(&storage, "db/log").unwrap();
        sink.log("opened database");
        sink.log("recovery finished");

        let mut buf = vec![0u8; 64];
        let reader = storage.random_reader("db/log").unwrap();
        let n = reader.read(&mut buf, 0).unwrap();
        assert_eq!(
            std::str::from_utf8(&buf[..n]).unwrap(),
            "opened database\nrecovery finished\n"
        );
    }
}
