//! # Piece Staging
//!
//! A provider stages a deal's piece and its metadata between receiving the
//! data and handing it to sealing. Files are named after the proposal cid
//! so every collaborator derives the same path for a deal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use smkt_core::Cid;

use crate::error::FileStoreError;

/// Staged file name of a deal's piece.
pub fn piece_file(proposal: &Cid) -> String {
    format!("{}.piece", proposal.to_hex())
}

/// Staged file name of a deal's metadata.
pub fn metadata_file(proposal: &Cid) -> String {
    format!("{}.meta", proposal.to_hex())
}

/// Staging area for piece bytes.
pub trait FileStore: Send + Sync {
    /// The path `name` is staged at.
    fn path_for(&self, name: &str) -> PathBuf;

    /// Write `data` under `name`, replacing any earlier content.
    fn stage(&self, name: &str, data: &[u8]) -> Result<PathBuf, FileStoreError>;

    /// Read a staged file.
    fn read(&self, path: &Path) -> Result<Vec<u8>, FileStoreError>;

    /// Delete a staged file.
    fn remove(&self, path: &Path) -> Result<(), FileStoreError>;
}

// ── In-memory ────────────────────────────────────────────────────────

/// Staging area held in memory.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryFileStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of staged files.
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl FileStore for MemoryFileStore {
    fn path_for(&self, name: &str) -> PathBuf {
        Path::new("/staging").join(name)
    }

    fn stage(&self, name: &str, data: &[u8]) -> Result<PathBuf, FileStoreError> {
        let path = self.path_for(name);
        self.files.write().insert(path.clone(), data.to_vec());
        Ok(path)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, FileStoreError> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| FileStoreError::NotFound(path.to_path_buf()))
    }

    fn remove(&self, path: &Path) -> Result<(), FileStoreError> {
        self.files
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FileStoreError::NotFound(path.to_path_buf()))
    }
}

// ── On disk ──────────────────────────────────────────────────────────

/// Staging area under a root directory.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Stage under `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FileStoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| FileStoreError::io(&root, e))?;
        Ok(Self { root })
    }

    /// The staging directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileStore for LocalFileStore {
    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn stage(&self, name: &str, data: &[u8]) -> Result<PathBuf, FileStoreError> {
        let path = self.path_for(name);
        std::fs::write(&path, data).map_err(|e| FileStoreError::io(&path, e))?;
        Ok(path)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, FileStoreError> {
        std::fs::read(path).map_err(|e| FileStoreError::io(path, e))
    }

    fn remove(&self, path: &Path) -> Result<(), FileStoreError> {
        std::fs::remove_file(path).map_err(|e| FileStoreError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn FileStore) {
        let cid = Cid::digest(b"proposal");
        let path = store.stage(&piece_file(&cid), b"bytes").unwrap();
        assert_eq!(path, store.path_for(&piece_file(&cid)));
        assert_eq!(store.read(&path).unwrap(), b"bytes");

        store.stage(&piece_file(&cid), b"newer").unwrap();
        assert_eq!(store.read(&path).unwrap(), b"newer");

        store.remove(&path).unwrap();
        assert_eq!(store.read(&path), Err(FileStoreError::NotFound(path.clone())));
        assert!(matches!(store.remove(&path), Err(FileStoreError::NotFound(_))));
    }

    #[test]
    fn memory_store_stages_reads_and_removes() {
        let store = MemoryFileStore::new();
        exercise(&store);
        assert!(store.is_empty());
    }

    #[test]
    fn local_store_stages_reads_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path().join("staging")).unwrap();
        assert!(store.root().is_dir());
        exercise(&store);
    }

    #[test]
    fn piece_and_metadata_names_differ() {
        let cid = Cid::digest(b"p");
        assert_ne!(piece_file(&cid), metadata_file(&cid));
        assert!(piece_file(&cid).starts_with(&cid.to_hex()));
    }
}
