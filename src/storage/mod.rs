//! Filesystem abstraction consumed by the engine.
//!
//! The engine never touches `std::fs` directly: it goes through the
//! `Storage` capability trait and the three typed handle traits below. Two
//! implementations are provided, a POSIX-backed one for real databases and
//! an in-memory one used by tests (which doubles as the crash simulation
//! harness, since "disk" state survives dropping the database handle).

mod memory;
mod posix;

pub use memory::MemStorage;
pub use posix::PosixStorage;

use crate::error::Result;

/// Random-access read-only file handle.
pub trait RandomReader: Send + Sync + std::fmt::Debug {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; fewer than requested means end-of-file was reached.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
}

/// Random-access read/write file handle.
pub trait RandomEditor: Send + Sync {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn write(&mut self, data: &[u8], offset: u64) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// Append-only file handle.
pub trait AppendWriter: Send + Sync {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// A path space with directories, plus constructors for the typed handles.
///
/// Paths are plain UTF-8 strings joined with '/'. Implementations must open
/// files exclusively for the lifetime of the handle set.
pub trait Storage: Send + Sync + std::fmt::Debug {
    fn create_directory(&self, path: &str) -> Result<()>;
    fn remove_directory(&self, path: &str) -> Result<()>;
    fn file_exists(&self, path: &str) -> bool;
    fn file_size(&self, path: &str) -> Result<u64>;
    fn remove_file(&self, path: &str) -> Result<()>;
    fn rename_file(&self, from: &str, to: &str) -> Result<()>;
    fn resize_file(&self, path: &str, size: u64) -> Result<()>;
    /// Names (not full paths) of the entries directly under `path`.
    fn get_children(&self, path: &str) -> Result<Vec<String>>;
    fn random_reader(&self, path: &str) -> Result<Box<dyn RandomReader>>;
    fn random_editor(&self, path: &str) -> Result<Box<dyn RandomEditor>>;
    fn append_writer(&self, path: &str) -> Result<Box<dyn AppendWriter>>;
}

/// Join a directory path and a file name.
pub(crate) fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_path_handles_separators() {
        assert_eq!(join_path("/tmp/db", "data"), "/tmp/db/data");
        assert_eq!(join_path("/tmp/db/", "data"), "/tmp/db/data");
        assert_eq!(join_path("", "data"), "data");
    }
}
