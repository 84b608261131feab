//! Load pipeline: manifest and content blobs back to output trees

use super::{BuildCacheController, LoadResult, RemoteLoadOutcome, property_error, resolve};
use crate::entity::CacheableEntity;
use crate::io::{CountingReader, FanOutWriter, copy_with_buffer};
use crate::manifest::{CacheManifest, ManifestEntry, OriginMetadata};
use crate::operations::span::{Side, SpanPair};
use crate::operations::{OperationDescriptor, OperationResult, OperationSink};
use crate::snapshot::{FileSystemSnapshot, FileType, TreeType, reconstruct, relative_components};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use stowage_cas::{CacheAccess, CacheKey, LoadHandler};

/// What a load restored, before the operations are closed
struct Loaded {
    origin_metadata: OriginMetadata,
    snapshots: BTreeMap<String, FileSystemSnapshot>,
    missing_content: BTreeMap<String, Vec<CacheKey>>,
}

pub(super) fn load<A: CacheAccess>(
    controller: &BuildCacheController<A>,
    key: &CacheKey,
    entity: &dyn CacheableEntity,
) -> Result<Option<LoadResult>> {
    let operations = LoadOperations::new(*key, controller.sink.clone());
    let loaded = load_entry(controller, key, entity, &operations);
    let result = operations.close(loaded)?;

    match &result {
        Some(result) if result.is_complete() => tracing::info!(
            key = %key,
            entity = %entity.identity(),
            entries = result.artifact_entry_count,
            "Loaded outputs from build cache"
        ),
        Some(result) => tracing::warn!(
            key = %key,
            entity = %entity.identity(),
            missing = result.missing_content.values().map(Vec::len).sum::<usize>(),
            "Loaded outputs from build cache, but some content is missing"
        ),
        None => tracing::debug!(key = %key, "Build cache miss"),
    }
    Ok(result)
}

fn load_entry<A: CacheAccess>(
    controller: &BuildCacheController<A>,
    key: &CacheKey,
    entity: &dyn CacheableEntity,
    operations: &LoadOperations,
) -> Result<Option<Loaded>> {
    let reader = ManifestReader::default();
    let handler = OperationFiringLoadHandler::new(operations, &reader);
    controller.access.load(&BTreeMap::from([(*key, ())]), &handler);
    let Some((manifest, manifest_size)) = reader.take()? else {
        return Ok(None);
    };

    let total_size = manifest_size + manifest.content_length();
    operations.ensure_unpack_started(Some(total_size));

    let unpacker = FanOutUnpacker {
        buffer_size: controller.config.buffer_size,
    };
    // Every property is checked against the manifest before any output is touched
    let mut properties = Vec::new();
    entity.visit_output_trees(&mut |name, tree_type, root| {
        let entries = manifest
            .property_manifests
            .get(name)
            .ok_or_else(|| property_error(name, root, "not present in cache manifest"))?;
        validate_entries(tree_type, entries)
            .map_err(|message| property_error(name, root, message))?;
        properties.push((name.to_string(), tree_type, root.to_path_buf(), entries));
        Ok(())
    })?;

    let mut snapshots = BTreeMap::new();
    let mut missing_content = BTreeMap::new();
    for (name, tree_type, root, entries) in properties {
        controller.file_system.invalidate(&[root.clone()]);
        clean_output(tree_type, &root)?;
        let destinations = prepare_destinations(&root, entries)?;

        let handler = OperationFiringLoadHandler::new(operations, &unpacker);
        controller.access.load(&destinations, &handler);
        let undelivered = handler.into_undelivered();

        let snapshot = reconstruct(tree_type, &root, entries)?;
        if undelivered.is_empty() {
            if let Some(snapshot) = &snapshot {
                controller.file_system.record(&name, snapshot);
            }
        } else {
            tracing::warn!(
                property = %name,
                missing = undelivered.len(),
                "Cached content unavailable, output is incomplete"
            );
            missing_content.insert(name.clone(), undelivered);
        }
        if let Some(snapshot) = snapshot {
            snapshots.insert(name, snapshot);
        }
    }

    Ok(Some(Loaded {
        origin_metadata: manifest.origin_metadata,
        snapshots,
        missing_content,
    }))
}

/// Reject manifests that cannot describe the declared output, before touching the disk
fn validate_entries(
    tree_type: TreeType,
    entries: &[ManifestEntry],
) -> std::result::Result<(), String> {
    let Some((root, rest)) = entries.split_first() else {
        return Err("no manifest entries".to_string());
    };
    if !root.relative_path.is_empty() {
        return Err(format!("root entry has path '{}'", root.relative_path));
    }
    match (tree_type, root.entry_type) {
        (TreeType::File, FileType::Directory) => {
            return Err("directory manifest entry found for a file output".to_string());
        }
        (TreeType::Directory, FileType::RegularFile) => {
            return Err("file manifest entry found for a directory output".to_string());
        }
        _ => {}
    }
    if tree_type == TreeType::File && !rest.is_empty() {
        return Err(format!(
            "expected a single manifest entry, found {}",
            entries.len()
        ));
    }
    for entry in rest {
        if relative_components(&entry.relative_path).is_none() {
            return Err(format!(
                "manifest entry '{}' does not lie below the output root",
                entry.relative_path
            ));
        }
    }
    Ok(())
}

/// Remove whatever a previous build left at an output location
fn clean_output(tree_type: TreeType, root: &Path) -> Result<()> {
    match tree_type {
        TreeType::Directory => ensure_empty_directory(root),
        TreeType::File => {
            let created_parent = match root.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => make_directory(parent)?,
                _ => false,
            };
            if !created_parent && fs::symlink_metadata(root).is_ok() {
                delete_recursively(root)?;
            }
            Ok(())
        }
    }
}

fn ensure_empty_directory(dir: &Path) -> Result<()> {
    match fs::symlink_metadata(dir) {
        Ok(metadata) if metadata.is_dir() => {
            for entry in fs::read_dir(dir).map_err(|e| Error::io(e, dir, "read_dir"))? {
                let entry = entry.map_err(|e| Error::io(e, dir, "read_dir"))?;
                delete_recursively(&entry.path())?;
            }
            Ok(())
        }
        Ok(_) => {
            fs::remove_file(dir).map_err(|e| Error::io(e, dir, "remove_file"))?;
            fs::create_dir_all(dir).map_err(|e| Error::io(e, dir, "create_dir_all"))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(dir).map_err(|e| Error::io(e, dir, "create_dir_all"))
        }
        Err(e) => Err(Error::io(e, dir, "metadata")),
    }
}

/// Make sure `target` is a directory; returns whether it had to be created
fn make_directory(target: &Path) -> Result<bool> {
    if target.is_dir() {
        return Ok(false);
    }
    if target.is_file() {
        fs::remove_file(target).map_err(|e| Error::io(e, target, "remove_file"))?;
    }
    fs::create_dir_all(target).map_err(|e| Error::io(e, target, "create_dir_all"))?;
    Ok(true)
}

fn delete_recursively(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path).map_err(|e| Error::io(e, path, "metadata"))?;
    if metadata.is_dir() {
        fs::remove_dir_all(path).map_err(|e| Error::io(e, path, "remove_dir_all"))
    } else {
        fs::remove_file(path).map_err(|e| Error::io(e, path, "remove_file"))
    }
}

fn delete_quietly(path: &Path) {
    if fs::symlink_metadata(path).is_ok() {
        if let Err(e) = delete_recursively(path) {
            tracing::debug!(path = %path.display(), error = %e, "Could not remove stale output");
        }
    }
}

/// Apply directory and missing entries, and collect file destinations by content hash
fn prepare_destinations(
    root: &Path,
    entries: &[ManifestEntry],
) -> Result<BTreeMap<CacheKey, Vec<PathBuf>>> {
    let mut destinations: BTreeMap<CacheKey, Vec<PathBuf>> = BTreeMap::new();
    for entry in entries {
        let path = resolve(root, &entry.relative_path);
        match entry.entry_type {
            FileType::Directory => {
                fs::create_dir_all(&path).map_err(|e| Error::io(e, &path, "create_dir_all"))?;
            }
            FileType::RegularFile => destinations.entry(entry.content_hash).or_default().push(path),
            FileType::Missing => delete_quietly(&path),
        }
    }
    Ok(destinations)
}

/// Per-call state of a load
struct LoadOperations {
    key: CacheKey,
    spans: SpanPair,
    unpacked_entry_count: AtomicU64,
    unpacked_size: AtomicU64,
    downloaded_size: AtomicU64,
    miss_encountered: AtomicBool,
}

impl LoadOperations {
    fn new(key: CacheKey, sink: Arc<dyn OperationSink>) -> Self {
        Self {
            key,
            spans: SpanPair::new(sink),
            unpacked_entry_count: AtomicU64::new(0),
            unpacked_size: AtomicU64::new(0),
            downloaded_size: AtomicU64::new(0),
            miss_encountered: AtomicBool::new(false),
        }
    }

    fn ensure_unpack_started(&self, archive_size: Option<u64>) {
        let key = self.key;
        self.spans
            .ensure_started(Side::Local, || OperationDescriptor::unpack(key, archive_size));
    }

    fn close(&self, loaded: Result<Option<Loaded>>) -> Result<Option<LoadResult>> {
        let entry_count = self.unpacked_entry_count.load(Ordering::Acquire);
        let downloaded_size = self.downloaded_size.load(Ordering::Acquire);
        let missed = self.miss_encountered.load(Ordering::Acquire);

        let (unpack, remote) = self.spans.close(
            || OperationResult::Unpack { entry_count },
            || {
                if missed {
                    OperationResult::RemoteLoadMiss
                } else {
                    OperationResult::RemoteLoadHit {
                        size: downloaded_size,
                    }
                }
            },
        );

        let loaded = loaded?;
        if let Some(Err(error)) = unpack {
            return Err(error);
        }
        let Some(loaded) = loaded else {
            if let Some(Err(error)) = &remote {
                tracing::warn!(
                    key = %self.key,
                    error = %error,
                    "Loading from remote build cache failed"
                );
            }
            return Ok(None);
        };

        tracing::debug!(
            key = %self.key,
            unpacked_size = self.unpacked_size.load(Ordering::Acquire),
            "Unpacked build cache entry"
        );
        let remote = match remote {
            None => RemoteLoadOutcome::NotAttempted,
            Some(Ok(_)) if missed => RemoteLoadOutcome::Miss,
            Some(Ok(_)) => RemoteLoadOutcome::Hit { downloaded_size },
            Some(Err(error)) => RemoteLoadOutcome::Failed(error),
        };
        Ok(Some(LoadResult {
            artifact_entry_count: entry_count,
            origin_metadata: loaded.origin_metadata,
            resulting_snapshots: loaded.snapshots,
            missing_content: loaded.missing_content,
            remote,
        }))
    }
}

/// Consumes the content of one blob
trait Unpack<P>: Sync {
    fn unpack(&self, input: &mut dyn Read, payload: &P) -> stowage_cas::Result<()>;
}

/// Load handler feeding the operations of one call
///
/// Also remembers which keys could not be delivered by this batch.
struct OperationFiringLoadHandler<'a, U> {
    operations: &'a LoadOperations,
    unpack: &'a U,
    undelivered: Mutex<Vec<CacheKey>>,
}

impl<'a, U> OperationFiringLoadHandler<'a, U> {
    const fn new(operations: &'a LoadOperations, unpack: &'a U) -> Self {
        Self {
            operations,
            unpack,
            undelivered: Mutex::new(Vec::new()),
        }
    }

    fn not_delivered(&self, key: &CacheKey) {
        self.undelivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*key);
    }

    fn into_undelivered(self) -> Vec<CacheKey> {
        let mut keys = self
            .undelivered
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        keys.sort();
        keys.dedup();
        keys
    }
}

impl<P, U: Unpack<P>> LoadHandler<P> for OperationFiringLoadHandler<'_, U> {
    fn handle(
        &self,
        _key: &CacheKey,
        input: &mut dyn Read,
        payload: &P,
    ) -> stowage_cas::Result<()> {
        let mut counting = CountingReader::new(input);
        self.unpack.unpack(&mut counting, payload)?;
        self.operations
            .unpacked_size
            .fetch_add(counting.count(), Ordering::Relaxed);
        self.operations
            .unpacked_entry_count
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn ensure_load_operation_started(&self, _key: &CacheKey) {
        let key = self.operations.key;
        self.operations
            .spans
            .ensure_started(Side::Remote, || OperationDescriptor::remote_load(key));
    }

    fn record_load_hit(&self, _key: &CacheKey, size: u64) {
        self.operations
            .downloaded_size
            .fetch_add(size, Ordering::Relaxed);
    }

    fn record_load_miss(&self, key: &CacheKey) {
        self.operations
            .miss_encountered
            .store(true, Ordering::Release);
        self.not_delivered(key);
    }

    fn record_load_failure(&self, key: &CacheKey, error: stowage_cas::Error) {
        tracing::debug!(key = %key, error = %error, "Remote load failed");
        self.operations.spans.fail(Side::Remote, error.into());
        self.not_delivered(key);
    }

    fn record_unpack_failure(&self, key: &CacheKey, error: stowage_cas::Error) {
        tracing::debug!(key = %key, error = %error, "Unpacking failed");
        self.operations.ensure_unpack_started(None);
        self.operations.spans.fail(Side::Local, error.into());
        self.not_delivered(key);
    }
}

/// Reads and parses the manifest blob
#[derive(Default)]
struct ManifestReader {
    slot: Mutex<Option<Result<(CacheManifest, u64)>>>,
}

impl ManifestReader {
    fn take(&self) -> Result<Option<(CacheManifest, u64)>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .transpose()
    }
}

impl Unpack<()> for ManifestReader {
    fn unpack(&self, input: &mut dyn Read, _payload: &()) -> stowage_cas::Result<()> {
        let mut bytes = Vec::new();
        input
            .read_to_end(&mut bytes)
            .map_err(|e| stowage_cas::Error::io_no_path(e, "read manifest"))?;
        let parsed =
            CacheManifest::from_bytes(&bytes).map(|manifest| (manifest, bytes.len() as u64));
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(parsed);
        Ok(())
    }
}

/// Copies a blob into every file sharing its content
struct FanOutUnpacker {
    buffer_size: usize,
}

impl Unpack<Vec<PathBuf>> for FanOutUnpacker {
    fn unpack(&self, input: &mut dyn Read, destinations: &Vec<PathBuf>) -> stowage_cas::Result<()> {
        let mut outputs = Vec::with_capacity(destinations.len());
        for path in destinations {
            let file = File::create(path).map_err(|e| stowage_cas::Error::io(e, path, "create"))?;
            outputs.push((path.clone(), file));
        }
        let mut writer = FanOutWriter::new(outputs);
        copy_with_buffer(input, &mut writer, self.buffer_size)
            .map_err(|e| stowage_cas::Error::io_no_path(e, "unpack"))?;
        Ok(())
    }
}
