//! Remote blob store seam
//!
//! A network transport implements [`RemoteBlobStore`]; the tiered cache
//! access only ever talks to a remote through this trait.

use crate::{CacheKey, CasStore, Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::sync::{Arc, PoisonError, RwLock};

/// A shared blob store reached over some transport
pub trait RemoteBlobStore: Send + Sync {
    /// Human readable name for logs
    fn name(&self) -> &str;

    /// Whether the remote holds `key`
    ///
    /// # Errors
    ///
    /// Returns error if the remote cannot be queried
    fn contains(&self, key: &CacheKey) -> Result<bool>;

    /// Open the blob stored under `key`, `None` on a miss
    ///
    /// # Errors
    ///
    /// Returns error if the remote cannot be read
    fn fetch(&self, key: &CacheKey) -> Result<Option<Box<dyn Read + Send>>>;

    /// Upload the content of `reader` under `key`
    ///
    /// # Errors
    ///
    /// Returns error if the upload fails
    fn upload(&self, key: &CacheKey, reader: &mut dyn Read) -> Result<()>;
}

/// In-memory remote, shared between clones
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<CacheKey, Arc<[u8]>>>>,
}

impl MemoryBlobStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs held
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the store holds no blobs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the blob stored under `key`
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|data| data.to_vec())
    }
}

impl fmt::Debug for MemoryBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlobStore")
            .field("blobs", &self.len())
            .finish()
    }
}

impl RemoteBlobStore for MemoryBlobStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn contains(&self, key: &CacheKey) -> Result<bool> {
        Ok(self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key))
    }

    fn fetch(&self, key: &CacheKey) -> Result<Option<Box<dyn Read + Send>>> {
        let blob = self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        Ok(blob.map(|data| Box::new(Cursor::new(data)) as Box<dyn Read + Send>))
    }

    fn upload(&self, key: &CacheKey, reader: &mut dyn Read) -> Result<()> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| Error::remote(key, e.to_string()))?;
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*key, data.into());
        Ok(())
    }
}

/// A directory shared between machines acts as a remote
impl RemoteBlobStore for CasStore {
    fn name(&self) -> &str {
        "directory"
    }

    fn contains(&self, key: &CacheKey) -> Result<bool> {
        Ok(Self::contains(self, key))
    }

    fn fetch(&self, key: &CacheKey) -> Result<Option<Box<dyn Read + Send>>> {
        Ok(self
            .open(key)?
            .map(|file| Box::new(file) as Box<dyn Read + Send>))
    }

    fn upload(&self, key: &CacheKey, reader: &mut dyn Read) -> Result<()> {
        self.write_with(key, |out| std::io::copy(reader, out))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContentHash;
    use tempfile::TempDir;

    fn read_all(mut reader: Box<dyn Read + Send>) -> Vec<u8> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn memory_store_upload_and_fetch() {
        let remote = MemoryBlobStore::new();
        let key = ContentHash::from_data(b"payload");

        assert!(!RemoteBlobStore::contains(&remote, &key).unwrap());
        assert!(remote.fetch(&key).unwrap().is_none());

        remote.upload(&key, &mut &b"payload"[..]).unwrap();

        assert!(RemoteBlobStore::contains(&remote, &key).unwrap());
        assert_eq!(read_all(remote.fetch(&key).unwrap().unwrap()), b"payload");
        assert_eq!(remote.len(), 1);
    }

    #[test]
    fn memory_store_clones_share_blobs() {
        let remote = MemoryBlobStore::new();
        let other = remote.clone();
        let key = ContentHash::from_data(b"shared");

        other.upload(&key, &mut &b"shared"[..]).unwrap();
        assert_eq!(remote.get(&key).unwrap(), b"shared");
    }

    #[test]
    fn directory_store_acts_as_remote() {
        let tmp = TempDir::new().unwrap();
        let remote: Box<dyn RemoteBlobStore> = Box::new(CasStore::new(tmp.path()));
        let key = ContentHash::from_data(b"on disk");

        remote.upload(&key, &mut &b"on disk"[..]).unwrap();
        assert!(remote.contains(&key).unwrap());
        assert_eq!(read_all(remote.fetch(&key).unwrap().unwrap()), b"on disk");
        assert_eq!(remote.name(), "directory");
    }
}
