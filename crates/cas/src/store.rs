//! Local content-addressable blob store
//!
//! Blobs fan out over two directory levels named by the first four hex
//! digits of their key.
//!
//! ## Layout
//!
//! ```text
//! ~/.cache/stowage/cas/
//!   ab/
//!     cd/
//!       abcd0123...   one file per blob, named by its full hash
//! ```
//!
//! Writes go to a temporary file next to the final location and are renamed
//! into place, so readers never observe a partially written blob.

use crate::{CacheKey, ContentHash, Error, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

/// Content-addressable storage on the local disk
#[derive(Debug, Clone)]
pub struct CasStore {
    root: PathBuf,
}

impl CasStore {
    /// Open a store rooted at `root`; nothing is created until the first write
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path for a blob based on its key
    ///
    /// Uses a two-level directory structure: `{root}/{key[0:2]}/{key[2:4]}/{key}`
    fn blob_path(&self, key: &CacheKey) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    /// Whether a blob is stored under `key`
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.blob_path(key).is_file()
    }

    /// Open a blob for reading, `None` if the store does not hold it
    ///
    /// # Errors
    ///
    /// Returns error if the blob exists but cannot be opened
    pub fn open(&self, key: &CacheKey) -> Result<Option<fs::File>> {
        let path = self.blob_path(key);
        match fs::File::open(&path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, &path, "open")),
        }
    }

    /// Read a whole blob into memory, `None` if the store does not hold it
    ///
    /// # Errors
    ///
    /// Returns error if the blob exists but cannot be read
    pub fn read(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(key);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, &path, "read")),
        }
    }

    /// Write a blob under `key`, producing its content with `write`
    ///
    /// Returns the number of bytes written. An existing blob is replaced.
    ///
    /// # Errors
    ///
    /// Returns error if IO operations fail or `write` fails
    pub fn write_with<F>(&self, key: &CacheKey, write: F) -> Result<u64>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<u64>,
    {
        let path = self.blob_path(key);
        let parent = path
            .parent()
            .ok_or_else(|| Error::io_no_path(io::ErrorKind::InvalidInput.into(), "blob_path"))?;
        fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| Error::io(e, parent, "create"))?;
        let written = write(tmp.as_file_mut()).map_err(|e| Error::io(e, tmp.path(), "write"))?;
        tmp.as_file_mut()
            .flush()
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::io(e, tmp.path(), "sync"))?;

        // Publish under the final name
        tmp.persist(&path)
            .map_err(|e| Error::io(e.error, &path, "rename"))?;

        Ok(written)
    }

    /// Write an in-memory blob under `key`
    ///
    /// # Errors
    ///
    /// Returns error if IO operations fail
    pub fn put(&self, key: &CacheKey, data: &[u8]) -> Result<()> {
        self.write_with(key, |out| {
            out.write_all(data)?;
            Ok(data.len() as u64)
        })?;
        Ok(())
    }

    /// Size in bytes of a stored blob
    ///
    /// # Errors
    ///
    /// Returns error if no blob is stored under `key`
    pub fn size(&self, key: &CacheKey) -> Result<u64> {
        let path = self.blob_path(key);
        let metadata = fs::metadata(&path).map_err(|e| Error::io(e, &path, "metadata"))?;
        Ok(metadata.len())
    }

    /// Delete a blob
    ///
    /// # Errors
    ///
    /// Returns error if IO operations fail
    pub fn delete(&self, key: &CacheKey) -> Result<()> {
        let path = self.blob_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &path, "remove_file")),
        }
    }

    /// List all blob keys in the store
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be walked
    pub fn list(&self) -> Result<Vec<CacheKey>> {
        let mut keys = Vec::new();

        if !self.root.exists() {
            return Ok(keys);
        }

        // Blobs live exactly three levels below the root
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                Error::io(e.into(), path, "read_dir")
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(key) = ContentHash::from_hex(name) {
                    keys.push(key);
                }
            }
        }

        Ok(keys)
    }

    /// Sum of the sizes of every stored blob
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be walked or a blob cannot be inspected
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for key in &self.list()? {
            total += self.size(key)?;
        }
        Ok(total)
    }
}
