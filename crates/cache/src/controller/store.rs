//! Store pipeline: snapshots to manifest and content blobs

use super::{BuildCacheController, RemoteStoreOutcome, StoreOutcome, property_error, resolve};
use crate::entity::CacheableEntity;
use crate::io::copy_with_buffer;
use crate::manifest::{self, CacheManifest, ManifestEntry, OriginMetadata};
use crate::operations::span::{Side, SpanPair};
use crate::operations::{OperationDescriptor, OperationResult, OperationSink};
use crate::snapshot::{FileSystemSnapshot, FileType, TreeType};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use stowage_cas::{BlobWriter, CacheAccess, CacheKey, StoreHandler};

pub(super) fn store<A: CacheAccess>(
    controller: &BuildCacheController<A>,
    key: &CacheKey,
    entity: &dyn CacheableEntity,
    snapshots: &BTreeMap<String, FileSystemSnapshot>,
    execution_time: Duration,
) -> Result<StoreOutcome> {
    let mut property_manifests = BTreeMap::new();
    let mut roots = Vec::new();
    let mut content_size = 0u64;
    entity.visit_output_trees(&mut |name, tree_type, root| {
        let snapshot = snapshots
            .get(name)
            .ok_or_else(|| property_error(name, root, "no snapshot provided"))?;
        assert_correct_type(tree_type, snapshot)?;

        let entries = manifest::entries_for(snapshot);
        content_size += entries.iter().map(|entry| entry.length).sum::<u64>();
        property_manifests.insert(name.to_string(), entries);
        roots.push((name.to_string(), root.to_path_buf()));
        Ok(())
    })?;

    let manifest = CacheManifest {
        origin_metadata: OriginMetadata {
            build_invocation_id: controller.config.build_invocation_id.clone(),
            execution_time,
        },
        entity_type: entity.entity_type().to_string(),
        entity_identity: entity.identity().to_string(),
        property_manifests,
    };
    assert_key_not_content(key, &manifest)?;
    let manifest_bytes = manifest.to_bytes()?;
    let total_upload_size = content_size + manifest_bytes.len() as u64;

    let operations = StoreOperations::new(*key, total_upload_size, controller.sink.clone());
    let handler = OperationFiringStoreHandler {
        operations: &operations,
        buffer_size: controller.config.buffer_size,
    };

    for (name, root) in &roots {
        let Some(entries) = manifest.property_manifests.get(name) else {
            continue;
        };
        let sources = content_sources(root, entries);
        tracing::debug!(
            key = %key,
            property = %name,
            blobs = sources.len(),
            "Storing output content"
        );
        controller.access.store(&sources, &handler);
    }

    // A manifest is only useful if all of its content made it into the cache
    if operations.spans.has_failures(Side::Local) {
        tracing::warn!(key = %key, "Output content could not be stored, skipping manifest");
    } else {
        let manifest_blob = BTreeMap::from([(*key, ManifestBlob(&manifest_bytes))]);
        controller.access.store(&manifest_blob, &handler);
    }

    let outcome = operations.close()?;
    tracing::info!(
        key = %key,
        entity = %entity.identity(),
        entries = outcome.entry_count,
        size = outcome.total_size,
        "Stored outputs in build cache"
    );
    Ok(outcome)
}

fn assert_correct_type(tree_type: TreeType, snapshot: &FileSystemSnapshot) -> Result<()> {
    let expected = match tree_type {
        TreeType::Directory => FileType::Directory,
        TreeType::File => FileType::RegularFile,
    };
    let actual = snapshot.file_type();
    if actual == FileType::Missing || actual == expected {
        return Ok(());
    }
    Err(Error::integrity(format!(
        "expected '{}' to be a {tree_type}",
        snapshot.absolute_path().display()
    )))
}

/// The manifest and its content share one key space
fn assert_key_not_content(key: &CacheKey, manifest: &CacheManifest) -> Result<()> {
    let clash = manifest
        .property_manifests
        .iter()
        .flat_map(|(name, entries)| entries.iter().map(move |entry| (name, entry)))
        .find(|(_, entry)| entry.entry_type == FileType::RegularFile && entry.content_hash == *key);
    match clash {
        Some((name, entry)) => Err(Error::integrity(format!(
            "cache key {key} is also the content hash of '{}' in output property '{name}'",
            entry.relative_path
        ))),
        None => Ok(()),
    }
}

/// Group the files of one property by content hash
fn content_sources(root: &Path, entries: &[ManifestEntry]) -> BTreeMap<CacheKey, ContentSource> {
    let mut sources: BTreeMap<CacheKey, ContentSource> = BTreeMap::new();
    for entry in entries {
        if entry.entry_type != FileType::RegularFile {
            continue;
        }
        sources
            .entry(entry.content_hash)
            .or_insert_with(|| ContentSource {
                paths: Vec::new(),
                length: entry.length,
            })
            .paths
            .push(resolve(root, &entry.relative_path));
    }
    sources
}

/// Per-call state of a store
struct StoreOperations {
    key: CacheKey,
    total_upload_size: u64,
    spans: SpanPair,
    pack_entry_count: AtomicU64,
    pack_size: AtomicU64,
    store_encountered: AtomicBool,
}

impl StoreOperations {
    fn new(key: CacheKey, total_upload_size: u64, sink: Arc<dyn OperationSink>) -> Self {
        let operations = Self {
            key,
            total_upload_size,
            spans: SpanPair::new(sink),
            pack_entry_count: AtomicU64::new(0),
            pack_size: AtomicU64::new(0),
            store_encountered: AtomicBool::new(false),
        };
        // Serializing the manifest already counts as packing
        operations
            .spans
            .ensure_started(Side::Local, || OperationDescriptor::pack(key));
        operations
    }

    fn record_packed(&self, size: u64) {
        self.pack_entry_count.fetch_add(1, Ordering::Relaxed);
        self.pack_size.fetch_add(size, Ordering::Relaxed);
    }

    fn close(&self) -> Result<StoreOutcome> {
        let entry_count = self.pack_entry_count.load(Ordering::Acquire);
        let total_size = self.pack_size.load(Ordering::Acquire);
        let stored = self.store_encountered.load(Ordering::Acquire);

        let (pack, remote) = self.spans.close(
            || OperationResult::Pack {
                entry_count,
                size: total_size,
            },
            || OperationResult::RemoteStore { stored },
        );

        if let Some(Err(error)) = pack {
            return Err(error);
        }
        let remote = match remote {
            None => RemoteStoreOutcome::NotAttempted,
            Some(Ok(_)) if stored => RemoteStoreOutcome::Stored,
            Some(Ok(_)) => RemoteStoreOutcome::NotStored,
            Some(Err(error)) => {
                tracing::warn!(
                    key = %self.key,
                    error = %error,
                    "Storing in remote build cache failed"
                );
                RemoteStoreOutcome::Failed(error)
            }
        };
        Ok(StoreOutcome {
            entry_count,
            total_size,
            remote,
        })
    }
}

/// Store handler feeding the operations of one call
struct OperationFiringStoreHandler<'a> {
    operations: &'a StoreOperations,
    buffer_size: usize,
}

impl<P: BlobSource> StoreHandler<P> for OperationFiringStoreHandler<'_> {
    fn create_writer<'a>(&'a self, _key: &CacheKey, payload: &'a P) -> Box<dyn BlobWriter + 'a> {
        Box::new(CountingWriter {
            source: payload,
            operations: self.operations,
            buffer_size: self.buffer_size,
            marked: AtomicBool::new(false),
        })
    }

    fn ensure_store_operation_started(&self, _key: &CacheKey) {
        let operations = self.operations;
        operations.spans.ensure_started(Side::Remote, || {
            OperationDescriptor::remote_store(operations.key, operations.total_upload_size)
        });
    }

    fn record_store_finished(&self, _key: &CacheKey, stored: bool) {
        if stored {
            self.operations
                .store_encountered
                .store(true, Ordering::Release);
        }
    }

    fn record_store_failure(&self, key: &CacheKey, error: stowage_cas::Error) {
        tracing::debug!(key = %key, error = %error, "Remote store failed");
        self.operations.spans.fail(Side::Remote, error.into());
    }

    fn record_pack_failure(&self, key: &CacheKey, error: stowage_cas::Error) {
        tracing::debug!(key = %key, error = %error, "Packing failed");
        self.operations.spans.fail(Side::Local, error.into());
    }
}

/// Content to be stored
trait BlobSource: Sync {
    fn open(&self) -> io::Result<Box<dyn Read + '_>>;

    fn length(&self) -> u64;
}

/// Files sharing one content hash
#[derive(Debug)]
struct ContentSource {
    paths: Vec<PathBuf>,
    length: u64,
}

impl BlobSource for ContentSource {
    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        // Any of the files will do; fall back to the next if one vanished
        let mut last_error = None;
        for path in &self.paths {
            match File::open(path) {
                Ok(file) => return Ok(Box::new(file)),
                Err(e) => {
                    last_error = Some(io::Error::new(
                        e.kind(),
                        format!("{}: {e}", path.display()),
                    ));
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no source file")))
    }

    fn length(&self) -> u64 {
        self.length
    }
}

/// The serialized manifest
struct ManifestBlob<'a>(&'a [u8]);

impl BlobSource for ManifestBlob<'_> {
    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.0))
    }

    fn length(&self) -> u64 {
        self.0.len() as u64
    }
}

/// Writer accounting for its blob the first time the content is consumed
///
/// Both access modes go through [`CountingWriter::mark_stored`], and the
/// mark only counts once, so a consumer using one mode on top of the other
/// does not count the blob twice.
struct CountingWriter<'a, S> {
    source: &'a S,
    operations: &'a StoreOperations,
    buffer_size: usize,
    marked: AtomicBool,
}

impl<S: BlobSource> CountingWriter<'_, S> {
    fn mark_stored(&self) {
        if !self.marked.swap(true, Ordering::AcqRel) {
            self.operations.record_packed(self.source.length());
        }
    }
}

impl<S: BlobSource> BlobWriter for CountingWriter<'_, S> {
    fn open_stream(&self) -> io::Result<Box<dyn Read + '_>> {
        self.mark_stored();
        self.source.open()
    }

    fn write_to(&self, out: &mut dyn Write) -> io::Result<u64> {
        self.mark_stored();
        let mut input = self.source.open()?;
        copy_with_buffer(&mut input, out, self.buffer_size)
    }

    fn size(&self) -> u64 {
        self.source.length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::span::tests::RecordingSink;
    use stowage_cas::ContentHash;

    fn operations() -> StoreOperations {
        StoreOperations::new(
            ContentHash::from_data(b"key"),
            0,
            Arc::new(RecordingSink::default()),
        )
    }

    #[test]
    fn counting_writer_counts_once_across_access_modes() {
        let operations = operations();
        let source = ManifestBlob(b"manifest bytes");
        let writer = CountingWriter {
            source: &source,
            operations: &operations,
            buffer_size: 4,
            marked: AtomicBool::new(false),
        };

        let mut out = Vec::new();
        writer.write_to(&mut out).unwrap();
        let mut stream = writer.open_stream().unwrap();
        let mut again = Vec::new();
        stream.read_to_end(&mut again).unwrap();

        assert_eq!(out, b"manifest bytes");
        assert_eq!(again, b"manifest bytes");
        assert_eq!(operations.pack_entry_count.load(Ordering::SeqCst), 1);
        assert_eq!(operations.pack_size.load(Ordering::SeqCst), 14);
    }

    #[test]
    fn unconsumed_writer_counts_nothing() {
        let operations = operations();
        let source = ManifestBlob(b"never read");
        let writer = CountingWriter {
            source: &source,
            operations: &operations,
            buffer_size: 4,
            marked: AtomicBool::new(false),
        };
        assert_eq!(writer.size(), 10);
        assert_eq!(operations.pack_entry_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn content_source_falls_back_to_other_paths() {
        let tmp = tempfile::TempDir::new().unwrap();
        let present = tmp.path().join("present");
        std::fs::write(&present, b"same").unwrap();
        let source = ContentSource {
            paths: vec![tmp.path().join("vanished"), present],
            length: 4,
        };

        let mut content = Vec::new();
        source.open().unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"same");
    }

    #[test]
    fn content_sources_group_identical_files() {
        let hash = ContentHash::from_data(b"same");
        let file = |path: &str| ManifestEntry {
            entry_type: FileType::RegularFile,
            relative_path: path.to_string(),
            content_hash: hash,
            length: 4,
        };
        let entries = [
            ManifestEntry {
                entry_type: FileType::Directory,
                relative_path: String::new(),
                content_hash: ContentHash::ZERO,
                length: 0,
            },
            file("a.txt"),
            file("b/c.txt"),
        ];

        let sources = content_sources(Path::new("/out"), &entries);
        assert_eq!(sources.len(), 1);
        assert_eq!(
            sources[&hash].paths,
            vec![PathBuf::from("/out/a.txt"), PathBuf::from("/out/b/c.txt")]
        );
    }

    #[test]
    fn missing_snapshots_pass_the_type_check() {
        let missing = FileSystemSnapshot::missing("/out/dir");
        assert!(assert_correct_type(TreeType::Directory, &missing).is_ok());
        assert!(assert_correct_type(TreeType::File, &missing).is_ok());

        let dir = FileSystemSnapshot::Directory(crate::snapshot::DirectorySnapshot::new(
            "/out/dir",
            "dir",
            Vec::new(),
        ));
        let err = assert_correct_type(TreeType::File, &dir).unwrap_err();
        assert!(err.to_string().contains("to be a file"));
    }

    #[test]
    fn manifest_key_must_differ_from_content_hashes() {
        let content = ContentHash::from_data(b"jar");
        let manifest = CacheManifest {
            origin_metadata: OriginMetadata {
                build_invocation_id: "build".to_string(),
                execution_time: Duration::ZERO,
            },
            entity_type: "task".to_string(),
            entity_identity: ":jar".to_string(),
            property_manifests: BTreeMap::from([(
                "jar".to_string(),
                vec![ManifestEntry {
                    entry_type: FileType::RegularFile,
                    relative_path: String::new(),
                    content_hash: content,
                    length: 3,
                }],
            )]),
        };

        let err = assert_key_not_content(&content, &manifest).unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert!(err.to_string().contains("'jar'"));
        assert!(assert_key_not_content(&ContentHash::from_data(b":jar"), &manifest).is_ok());
    }
}
