use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    NotFound(String),
    Io(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "key {key} not found"),
            Self::Io(message) => write!(f, "storage io error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Blob store addressed by string key. Chunk keys are the decimal form of
/// the chunk ID; the index manifest lives under an out-of-band key.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct MemoryStorage {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.read()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.blobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

/// One directory per index; keys become file names.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|error| {
            StorageError::Io(format!("failed to create {}: {error}", root.display()))
        })?;
        Ok(Self { root })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl Storage for FsStorage {
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.blob_path(key);
        fs::read(&path).map_err(|error| map_read_error(&path, key, error))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.blob_path(key);
        fs::write(&path, data)
            .map_err(|error| StorageError::Io(format!("failed to write {}: {error}", path.display())))
    }
}

fn map_read_error(path: &Path, key: &str, error: std::io::Error) -> StorageError {
    if error.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(format!("failed to read {}: {error}", path.display()))
    }
}
