//! Rebuild a snapshot from a property's manifest entries
//!
//! Reconstruction never reads the disk: the snapshot is derived from the
//! pre-order entry list alone. Directory trees are rebuilt with an explicit
//! stack of open directory frames. Each entry closes the frames that are not
//! among its ancestors, opens frames for ancestors not yet open, and then
//! attaches itself to the innermost frame.

use super::{DirectorySnapshot, FileSystemSnapshot, RegularFileSnapshot, TreeType, file_name};
use super::{FileType, relative_components};
use crate::manifest::ManifestEntry;
use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Derive the snapshot of an output from its pre-order manifest entries
///
/// Returns `None` when the output does not exist. Entries that would land
/// outside of `root` end the reconstruction: that entry and everything after
/// it are ignored.
///
/// # Errors
///
/// Returns an integrity error when the entries cannot describe an output of
/// the declared type
pub fn reconstruct(
    tree_type: TreeType,
    root: &Path,
    entries: &[ManifestEntry],
) -> Result<Option<FileSystemSnapshot>> {
    match tree_type {
        TreeType::File => reconstruct_file(root, entries),
        TreeType::Directory => reconstruct_directory(root, entries),
    }
}

fn reconstruct_file(root: &Path, entries: &[ManifestEntry]) -> Result<Option<FileSystemSnapshot>> {
    let [entry] = entries else {
        return Err(Error::integrity(format!(
            "expected a single manifest entry for file output {}, found {}",
            root.display(),
            entries.len()
        )));
    };
    match entry.entry_type {
        FileType::RegularFile => Ok(Some(file_snapshot(root.to_path_buf(), entry))),
        FileType::Missing => Ok(None),
        FileType::Directory => Err(Error::integrity(format!(
            "directory manifest entry found for file output {}",
            root.display()
        ))),
    }
}

fn reconstruct_directory(
    root: &Path,
    entries: &[ManifestEntry],
) -> Result<Option<FileSystemSnapshot>> {
    let Some((root_entry, rest)) = entries.split_first() else {
        return Err(Error::integrity(format!(
            "no manifest entries for directory output {}",
            root.display()
        )));
    };
    match root_entry.entry_type {
        FileType::Directory => {}
        FileType::Missing => return Ok(None),
        FileType::RegularFile => {
            return Err(Error::integrity(format!(
                "file manifest entry found for directory output {}",
                root.display()
            )));
        }
    }

    let mut stack = FrameStack::new(root);
    for entry in rest {
        let Some(components) = relative_components(&entry.relative_path) else {
            tracing::debug!(
                root = %root.display(),
                path = %entry.relative_path,
                "Manifest entry outside of output root, ignoring remaining entries"
            );
            break;
        };
        let Some((name, ancestors)) = components.split_last() else {
            break;
        };

        stack.align(ancestors);
        match entry.entry_type {
            FileType::Directory => stack.open(name),
            FileType::RegularFile => {
                let path = stack.top().absolute_path.join(name);
                stack.attach(file_snapshot(path, entry));
            }
            FileType::Missing => {}
        }
    }

    Ok(Some(FileSystemSnapshot::Directory(stack.finish())))
}

fn file_snapshot(absolute_path: PathBuf, entry: &ManifestEntry) -> FileSystemSnapshot {
    FileSystemSnapshot::RegularFile(RegularFileSnapshot {
        name: file_name(&absolute_path),
        absolute_path,
        hash: entry.content_hash,
        length: entry.length,
    })
}

/// A directory whose children are still being collected
#[derive(Debug)]
struct DirectoryFrame {
    absolute_path: PathBuf,
    name: String,
    children: Vec<FileSystemSnapshot>,
}

impl DirectoryFrame {
    fn close(self) -> DirectorySnapshot {
        DirectorySnapshot::new(self.absolute_path, self.name, self.children)
    }
}

/// The root frame plus the chain of directories currently open below it
#[derive(Debug)]
struct FrameStack {
    root: DirectoryFrame,
    open: Vec<DirectoryFrame>,
}

impl FrameStack {
    fn new(root: &Path) -> Self {
        Self {
            root: DirectoryFrame {
                absolute_path: root.to_path_buf(),
                name: file_name(root),
                children: Vec::new(),
            },
            open: Vec::new(),
        }
    }

    fn top(&self) -> &DirectoryFrame {
        self.open.last().unwrap_or(&self.root)
    }

    fn top_mut(&mut self) -> &mut DirectoryFrame {
        self.open.last_mut().unwrap_or(&mut self.root)
    }

    /// Make `ancestors` exactly the chain of open frames below the root
    fn align(&mut self, ancestors: &[&str]) {
        let common = self
            .open
            .iter()
            .zip(ancestors)
            .take_while(|(frame, name)| frame.name == **name)
            .count();
        while self.open.len() > common {
            self.close_top();
        }
        for name in &ancestors[common..] {
            self.open(name);
        }
    }

    fn open(&mut self, name: &str) {
        let absolute_path = self.top().absolute_path.join(name);
        self.open.push(DirectoryFrame {
            absolute_path,
            name: name.to_string(),
            children: Vec::new(),
        });
    }

    fn attach(&mut self, child: FileSystemSnapshot) {
        self.top_mut().children.push(child);
    }

    fn close_top(&mut self) {
        if let Some(frame) = self.open.pop() {
            let closed = FileSystemSnapshot::Directory(frame.close());
            self.attach(closed);
        }
    }

    fn finish(mut self) -> DirectorySnapshot {
        while !self.open.is_empty() {
            self.close_top();
        }
        self.root.close()
    }
}
