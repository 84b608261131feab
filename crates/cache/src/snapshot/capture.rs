//! Snapshot the live file system

use super::{DirectorySnapshot, FileSystemSnapshot, RegularFileSnapshot, file_name};
use crate::{Error, Result};
use std::fs;
use std::io;
use std::path::Path;
use stowage_cas::ContentHash;
use walkdir::WalkDir;

/// Snapshot whatever currently exists at `root`
///
/// # Errors
///
/// Returns error if the tree cannot be walked or a file cannot be read
pub fn capture(root: &Path) -> Result<FileSystemSnapshot> {
    let metadata = match fs::metadata(root) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(FileSystemSnapshot::missing(root));
        }
        Err(e) => return Err(Error::io(e, root, "metadata")),
    };

    if !metadata.is_dir() {
        return hash_file(root, file_name(root));
    }

    // Children arrive before their parent; pending[d] collects finished
    // nodes at depth d until the parent at depth d - 1 shows up.
    let mut pending: Vec<Vec<FileSystemSnapshot>> = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .contents_first(true)
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            Error::io(e.into(), path, "walk")
        })?;
        let depth = entry.depth();
        if pending.len() <= depth + 1 {
            pending.resize_with(depth + 2, Vec::new);
        }

        // Names below the root end up in manifest paths and must survive the round trip
        let name = if depth == 0 {
            file_name(entry.path())
        } else {
            utf8_name(entry.path())?
        };
        let node = if entry.file_type().is_dir() {
            let children = std::mem::take(&mut pending[depth + 1]);
            FileSystemSnapshot::Directory(DirectorySnapshot::new(entry.path(), name, children))
        } else {
            hash_file(entry.path(), name)?
        };
        pending[depth].push(node);
    }

    pending
        .first_mut()
        .and_then(Vec::pop)
        .ok_or_else(|| Error::integrity(format!("no snapshot produced for {}", root.display())))
}

fn utf8_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::integrity(format!(
                "cannot cache '{}': file name is not valid UTF-8",
                path.display()
            ))
        })
}

fn hash_file(path: &Path, name: String) -> Result<FileSystemSnapshot> {
    let mut file = fs::File::open(path).map_err(|e| Error::io(e, path, "open"))?;
    let (hash, length) =
        ContentHash::from_reader(&mut file).map_err(|e| Error::io(e, path, "read"))?;
    Ok(FileSystemSnapshot::RegularFile(RegularFileSnapshot {
        absolute_path: path.to_path_buf(),
        name,
        hash,
        length,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::FileType;
    use tempfile::TempDir;

    #[test]
    fn captures_missing_path() {
        let tmp = TempDir::new().unwrap();
        let snapshot = capture(&tmp.path().join("nothing")).unwrap();
        assert_eq!(snapshot.file_type(), FileType::Missing);
        assert_eq!(snapshot.name(), "nothing");
    }

    #[test]
    fn captures_single_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.bin");
        fs::write(&path, b"hello world").unwrap();

        let snapshot = capture(&path).unwrap();
        assert_eq!(snapshot.file_type(), FileType::RegularFile);
        assert_eq!(snapshot.length(), 11);
        assert_eq!(snapshot.hash(), ContentHash::from_data(b"hello world"));
    }

    #[test]
    fn captures_nested_directories() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("out");
        fs::create_dir_all(root.join("b/deep")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::write(root.join("b/c.txt"), b"c").unwrap();
        fs::write(root.join("b/deep/d.txt"), b"d").unwrap();

        let snapshot = capture(&root).unwrap();

        let mut visited = Vec::new();
        snapshot.visit_pre_order(|path, node| visited.push((path.to_string(), node.file_type())));
        assert_eq!(
            visited,
            vec![
                (String::new(), FileType::Directory),
                ("a.txt".to_string(), FileType::RegularFile),
                ("b".to_string(), FileType::Directory),
                ("b/c.txt".to_string(), FileType::RegularFile),
                ("b/deep".to_string(), FileType::Directory),
                ("b/deep/d.txt".to_string(), FileType::RegularFile),
                ("empty".to_string(), FileType::Directory),
            ]
        );
        assert_eq!(snapshot.absolute_path(), root);
    }

    #[test]
    fn identical_trees_have_identical_hashes() {
        let tmp = TempDir::new().unwrap();
        for name in ["one", "two"] {
            let root = tmp.path().join(name);
            fs::create_dir_all(root.join("sub")).unwrap();
            fs::write(root.join("sub/file"), b"same").unwrap();
        }

        let one = capture(&tmp.path().join("one")).unwrap();
        let two = capture(&tmp.path().join("two")).unwrap();
        assert_eq!(one.hash(), two.hash());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn non_utf8_names_are_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("out");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join(OsStr::from_bytes(b"caf\xe9.txt")), b"latin-1").unwrap();

        let err = capture(&root).unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert!(err.to_string().contains("not valid UTF-8"));
    }
}
