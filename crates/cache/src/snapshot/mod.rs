//! Content snapshots of output trees
//!
//! A snapshot records what an output looked like: the type of every node,
//! file content hashes and lengths, and a Merkle hash for each directory.
//! Snapshots are produced by [`capture`] from the live file system and by
//! [`reconstruct`] from a stored manifest; both produce identical values for
//! identical trees.

mod capture;
mod reconstruct;

pub use capture::capture;
pub use reconstruct::reconstruct;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use stowage_cas::{ContentHash, ContentHasher};

/// Type of a node in an output tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    /// A directory
    Directory,
    /// A regular file
    RegularFile,
    /// Nothing exists at the path
    Missing,
}

impl FileType {
    const fn tag(self) -> u8 {
        match self {
            Self::Directory => b'd',
            Self::RegularFile => b'f',
            Self::Missing => b'm',
        }
    }
}

/// Declared kind of an output property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeType {
    /// A single file
    File,
    /// A directory tree
    Directory,
}

impl fmt::Display for TreeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::Directory => f.write_str("directory"),
        }
    }
}

/// A regular file with known content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegularFileSnapshot {
    /// Absolute path of the file
    pub absolute_path: PathBuf,
    /// File name
    pub name: String,
    /// Hash of the file content
    pub hash: ContentHash,
    /// Content length in bytes
    pub length: u64,
}

/// A path where nothing exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingFileSnapshot {
    /// Absolute path
    pub absolute_path: PathBuf,
    /// Last path component
    pub name: String,
}

/// A directory and everything below it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySnapshot {
    absolute_path: PathBuf,
    name: String,
    hash: ContentHash,
    children: Vec<FileSystemSnapshot>,
}

impl DirectorySnapshot {
    /// Build a directory node, sorting `children` by name and hashing them
    #[must_use]
    pub fn new(
        absolute_path: impl Into<PathBuf>,
        name: impl Into<String>,
        mut children: Vec<FileSystemSnapshot>,
    ) -> Self {
        children.sort_by(|a, b| a.name().cmp(b.name()));

        let mut hasher = ContentHasher::new();
        hasher.update(b"DIR");
        for child in &children {
            hasher.update(child.name());
            hasher.update([0u8, child.file_type().tag()]);
            hasher.update_hash(&child.hash());
        }

        Self {
            absolute_path: absolute_path.into(),
            name: name.into(),
            hash: hasher.finish(),
            children,
        }
    }

    /// Absolute path of the directory
    #[must_use]
    pub fn absolute_path(&self) -> &Path {
        &self.absolute_path
    }

    /// Directory name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Merkle hash over the children
    #[must_use]
    pub const fn hash(&self) -> ContentHash {
        self.hash
    }

    /// Children sorted by name
    #[must_use]
    pub fn children(&self) -> &[FileSystemSnapshot] {
        &self.children
    }
}

/// Snapshot of one node of an output tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSystemSnapshot {
    /// A directory
    Directory(DirectorySnapshot),
    /// A regular file
    RegularFile(RegularFileSnapshot),
    /// Nothing at the path
    Missing(MissingFileSnapshot),
}

impl FileSystemSnapshot {
    /// Snapshot of a path where nothing exists
    #[must_use]
    pub fn missing(absolute_path: impl Into<PathBuf>) -> Self {
        let absolute_path = absolute_path.into();
        let name = file_name(&absolute_path);
        Self::Missing(MissingFileSnapshot {
            absolute_path,
            name,
        })
    }

    /// Node type
    #[must_use]
    pub const fn file_type(&self) -> FileType {
        match self {
            Self::Directory(_) => FileType::Directory,
            Self::RegularFile(_) => FileType::RegularFile,
            Self::Missing(_) => FileType::Missing,
        }
    }

    /// Absolute path of the node
    #[must_use]
    pub fn absolute_path(&self) -> &Path {
        match self {
            Self::Directory(dir) => &dir.absolute_path,
            Self::RegularFile(file) => &file.absolute_path,
            Self::Missing(missing) => &missing.absolute_path,
        }
    }

    /// Last path component
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Directory(dir) => &dir.name,
            Self::RegularFile(file) => &file.name,
            Self::Missing(missing) => &missing.name,
        }
    }

    /// Content hash, Merkle hash for directories, zero for missing paths
    #[must_use]
    pub const fn hash(&self) -> ContentHash {
        match self {
            Self::Directory(dir) => dir.hash,
            Self::RegularFile(file) => file.hash,
            Self::Missing(_) => ContentHash::ZERO,
        }
    }

    /// Content length of a file, zero otherwise
    #[must_use]
    pub const fn length(&self) -> u64 {
        match self {
            Self::RegularFile(file) => file.length,
            Self::Directory(_) | Self::Missing(_) => 0,
        }
    }

    /// Visit every node root first, with its `/`-separated path relative to this node
    ///
    /// The root is visited with an empty relative path. Children are visited
    /// in name order.
    pub fn visit_pre_order<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, &Self),
    {
        visit(self, "", &mut visitor);
    }
}

fn visit<F>(node: &FileSystemSnapshot, relative_path: &str, visitor: &mut F)
where
    F: FnMut(&str, &FileSystemSnapshot),
{
    visitor(relative_path, node);
    if let FileSystemSnapshot::Directory(dir) = node {
        for child in &dir.children {
            let child_path = if relative_path.is_empty() {
                child.name().to_string()
            } else {
                format!("{relative_path}/{}", child.name())
            };
            visit(child, &child_path, visitor);
        }
    }
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Split a manifest path into its components
///
/// Returns `None` for paths that do not name something strictly below the
/// root: absolute paths, paths with `..` and paths with no components.
pub(crate) fn relative_components(relative_path: &str) -> Option<Vec<&str>> {
    if relative_path.starts_with('/') {
        return None;
    }
    let mut components = Vec::new();
    for component in relative_path.split('/') {
        match component {
            "" | "." => {}
            ".." => return None,
            name => components.push(name),
        }
    }
    if components.is_empty() {
        None
    } else {
        Some(components)
    }
}
