//! In-memory storage for tests.
//!
//! Files are byte vectors behind a shared table, so cloning the storage
//! handle shares the "disk". A test can drop a `Database` without closing
//! it and reopen against the same `MemStorage` to model a process crash:
//! whatever the engine wrote through the handles is still there, whatever
//! it buffered in its own memory is gone.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::storage::{AppendWriter, RandomEditor, RandomReader, Storage};

type FileData = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Default)]
struct Tree {
    files: HashMap<String, FileData>,
    directories: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    tree: Arc<Mutex<Tree>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, path: &str) -> Option<FileData> {
        self.tree.lock().files.get(path).cloned()
    }

    fn lookup_or_create(&self, path: &str) -> FileData {
        self.tree
            .lock()
            .files
            .entry(path.to_string())
            .or_default()
            .clone()
    }
}

fn not_found(path: &str) -> Error {
    Error::NotFound(format!("file does not exist: {path}"))
}

impl Storage for MemStorage {
    fn create_directory(&self, path: &str) -> Result<()> {
        let mut tree = self.tree.lock();
        let path = path.trim_end_matches('/').to_string();
        if !tree.directories.contains(&path) {
            tree.directories.push(path);
        }
        Ok(())
    }

    fn remove_directory(&self, path: &str) -> Result<()> {
        let mut tree = self.tree.lock();
        let path = path.trim_end_matches('/').to_string();
        let prefix = format!("{path}/");
        tree.files.retain(|name, _| !name.starts_with(&prefix));
        tree.directories.retain(|d| *d != path);
        Ok(())
    }

    fn file_exists(&self, path: &str) -> bool {
        self.tree.lock().files.contains_key(path)
    }

    fn file_size(&self, path: &str) -> Result<u64> {
        let file = self.lookup(path).ok_or_else(|| not_found(path))?;
        let len = file.lock().len();
        Ok(len as u64)
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        self.tree
            .lock()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let mut tree = self.tree.lock();
        let data = tree.files.remove(from).ok_or_else(|| not_found(from))?;
        tree.files.insert(to.to_string(), data);
        Ok(())
    }

    fn resize_file(&self, path: &str, size: u64) -> Result<()> {
        let file = self.lookup(path).ok_or_else(|| not_found(path))?;
        file.lock().resize(size as usize, 0);
        Ok(())
    }

    fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let tree = self.tree.lock();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut names = Vec::new();
        for name in tree.files.keys() {
            if let Some(rest) = name.strip_prefix(&prefix) {
                if !rest.contains('/') {
                    names.push(rest.to_string());
                }
            }
        }
        Ok(names)
    }

    fn random_reader(&self, path: &str) -> Result<Box<dyn RandomReader>> {
        let data = self.lookup(path).ok_or_else(|| not_found(path))?;
        Ok(Box::new(MemFile { data }))
    }

    fn random_editor(&self, path: &str) -> Result<Box<dyn RandomEditor>> {
        let data = self.lookup_or_create(path);
        Ok(Box::new(MemFile { data }))
    }

    fn append_writer(&self, path: &str) -> Result<Box<dyn AppendWriter>> {
        let data = self.lookup_or_create(path);
        Ok(Box::new(MemFile { data }))
    }
}

#[derive(Debug)]
struct MemFile {
    data: FileData,
}

impl RandomReader for MemFile {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        read_from(&self.data, buf, offset)
    }
}

fn read_from(data: &FileData, buf: &mut [u8], offset: u64) -> Result<usize> {
    let data = data.lock();
    let offset = offset as usize;
    if offset >= data.len() {
        return Ok(0);
    }
    let n = buf.len().min(data.len() - offset);
    buf[..n].copy_from_slice(&data[offset..offset + n]);
    Ok(n)
}

impl RandomEditor for MemFile {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        read_from(&self.data, buf, offset)
    }

    fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        let mut file = self.data.lock();
        let end = offset as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

impl AppendWriter for MemFile {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.data.lock().extend_from_slice(data);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}
