//! File access used by the loader and the machine assembler.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Read-whole-file storage backend.
pub trait Storage {
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;
}

/// Files below a host directory.
#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Storage for DirStorage {
    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.root.join(path);
        fs::read(&full).map_err(|e| Error::not_found(format!("{}: {e}", full.display())))
    }
}

/// In-memory file table.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, bytes: Vec<u8>) {
        self.files.insert(path.into(), bytes);
    }
}

impl Storage for MemoryStorage {
    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_found(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_reports_missing_files() {
        let mut storage = MemoryStorage::new();
        storage.insert("mfp.stm", vec![1, 2, 3]);
        assert_eq!(storage.read_file("mfp.stm").unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            storage.read_file("psg.stm"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn dir_storage_maps_io_errors_to_not_found() {
        let storage = DirStorage::new("/nonexistent-stbox-dir");
        assert!(matches!(
            storage.read_file("glue.stm"),
            Err(Error::NotFound(_))
        ));
    }
}
