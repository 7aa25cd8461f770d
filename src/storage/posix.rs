//! `std::fs`-backed storage.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::storage::{AppendWriter, RandomEditor, RandomReader, Storage};

#[derive(Debug, Default)]
pub struct PosixStorage;

impl PosixStorage {
    pub fn new() -> Self {
        Self
    }
}

fn not_found(path: &str) -> Error {
    Error::NotFound(format!("file does not exist: {path}"))
}

fn map_open(path: &str, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        not_found(path)
    } else {
        Error::Io(err)
    }
}

impl Storage for PosixStorage {
    fn create_directory(&self, path: &str) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn remove_directory(&self, path: &str) -> Result<()> {
        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    fn file_exists(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        let meta = std::fs::metadata(path).map_err(|e| map_open(path, e))?;
        Ok(meta.len())
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        std::fs::remove_file(path).map_err(|e| map_open(path, e))
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        std::fs::rename(from, to).map_err(|e| map_open(from, e))
    }

    fn resize_file(&self, path: &str, size: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| map_open(path, e))?;
        file.set_len(size)?;
        Ok(())
    }

    fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path).map_err(|e| map_open(path, e))? {
            let entry = entry?;
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn random_reader(&self, path: &str) -> Result<Box<dyn RandomReader>> {
        let file = File::open(path).map_err(|e| map_open(path, e))?;
        Ok(Box::new(PosixReader {
            file: Mutex::new(file),
        }))
    }

    fn random_editor(&self, path: &str) -> Result<Box<dyn RandomEditor>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| map_open(path, e))?;
        Ok(Box::new(PosixEditor {
            file: Mutex::new(file),
        }))
    }

    fn append_writer(&self, path: &str) -> Result<Box<dyn AppendWriter>> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| map_open(path, e))?;
        Ok(Box::new(PosixAppender { file }))
    }
}

#[derive(Debug)]
struct PosixReader {
    file: Mutex<File>,
}

fn read_at(file: &mut File, buf: &mut [u8], offset: u64) -> Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

impl RandomReader for PosixReader {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        read_at(&mut self.file.lock(), buf, offset)
    }
}

struct PosixEditor {
    file: Mutex<File>,
}

impl RandomEditor for PosixEditor {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        read_at(&mut self.file.lock(), buf, offset)
    }

    fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

struct PosixAppender {
    file: File,
}

impl AppendWriter for PosixAppender {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn editor_round_trip() {
        let dir = tempdir().unwrap();
        let storage = PosixStorage::new();
        let path = dir.path().join("blob").to_string_lossy().into_owned();

        let mut editor = storage.random_editor(&path).unwrap();
        editor.write(b"hello world", 0).unwrap();
        editor.write(b"W", 6).unwrap();
        editor.sync().unwrap();

        let mut buf = [0u8; 11];
        let n = editor.read(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello World");
        assert_eq!(storage.file_size(&path).unwrap(), 11);
    }

    #[test]
    fn short_read_past_eof() {
        let dir = tempdir().unwrap();
        let storage = PosixStorage::new();
        let path = dir.path().join("short").to_string_lossy().into_owned();

        let mut editor = storage.random_editor(&path).unwrap();
        editor.write(b"abc", 0).unwrap();

        let mut buf = [0u8; 8];
        let n = editor.read(&mut buf, 1).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"bc");
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let storage = PosixStorage::new();
        let path = dir.path().join("nope").to_string_lossy().into_owned();
        assert!(storage.random_reader(&path).unwrap_err().is_not_found());
        assert!(storage.file_size(&path).unwrap_err().is_not_found());
    }

    #[test]
    fn children_lists_names() {
        let dir = tempdir().unwrap();
        let storage = PosixStorage::new();
        let base = dir.path().to_string_lossy().into_owned();
        for name in ["wal-00000001", "wal-00000002", "data"] {
            let mut w = storage
                .append_writer(&crate::storage::join_path(&base, name))
                .unwrap();
            w.write(b"x").unwrap();
        }
        let mut children = storage.get_children(&base).unwrap();
        children.sort();
        assert_eq!(children, vec!["data", "wal-00000001", "wal-00000002"]);
    }
}
