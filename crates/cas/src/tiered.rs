//! Local disk store with an optional remote tier behind it

use crate::access::{CacheAccess, LoadHandler, StoreHandler};
use crate::remote::RemoteBlobStore;
use crate::{CacheKey, CasStore, Error, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

/// Default number of entries transferred in parallel
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 8;

/// [`CacheAccess`] over a local [`CasStore`] and an optional remote
///
/// Loads are served locally when possible. Remote hits are written through
/// into the local store before being handed to the caller. Stores always land
/// locally first and are then uploaded from the local copy.
pub struct TieredCacheAccess {
    local: CasStore,
    remote: Option<Arc<dyn RemoteBlobStore>>,
    pool: ThreadPool,
}

impl TieredCacheAccess {
    /// Create an access over `local` transferring up to `max_concurrent_transfers` entries at once
    ///
    /// # Errors
    ///
    /// Returns error if the transfer thread pool cannot be created
    pub fn new(local: CasStore, max_concurrent_transfers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(max_concurrent_transfers.max(1))
            .thread_name(|i| format!("stowage-transfer-{i}"))
            .build()
            .map_err(|e| Error::configuration(format!("transfer pool: {e}")))?;
        Ok(Self {
            local,
            remote: None,
            pool,
        })
    }

    /// Put `remote` behind the local store
    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn RemoteBlobStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// The local store
    #[must_use]
    pub fn local(&self) -> &CasStore {
        &self.local
    }

    fn load_entry<P>(&self, key: &CacheKey, payload: &P, handler: &dyn LoadHandler<P>) {
        match self.local.open(key) {
            Ok(Some(mut file)) => {
                tracing::debug!(key = %key, "Local cache hit");
                deliver(key, &mut file, payload, handler);
            }
            Ok(None) => match &self.remote {
                Some(remote) => self.load_remote(remote.as_ref(), key, payload, handler),
                None => {
                    tracing::debug!(key = %key, "Local cache miss");
                    handler.record_load_miss(key);
                }
            },
            Err(e) => handler.record_unpack_failure(key, e),
        }
    }

    fn load_remote<P>(
        &self,
        remote: &dyn RemoteBlobStore,
        key: &CacheKey,
        payload: &P,
        handler: &dyn LoadHandler<P>,
    ) {
        handler.ensure_load_operation_started(key);
        let mut fetched = match remote.fetch(key) {
            Ok(Some(reader)) => reader,
            Ok(None) => {
                tracing::debug!(key = %key, remote = remote.name(), "Remote cache miss");
                handler.record_load_miss(key);
                return;
            }
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    remote = remote.name(),
                    error = %e,
                    "Remote cache fetch failed"
                );
                handler.record_load_failure(key, e);
                return;
            }
        };

        let size = match self
            .local
            .write_with(key, |out| io::copy(&mut fetched, out))
        {
            Ok(size) => size,
            Err(e) => {
                handler.record_load_failure(key, e);
                return;
            }
        };
        tracing::debug!(key = %key, size, remote = remote.name(), "Remote cache hit");
        handler.record_load_hit(key, size);

        match self.local.open(key) {
            Ok(Some(mut file)) => deliver(key, &mut file, payload, handler),
            Ok(None) => handler.record_unpack_failure(
                key,
                Error::io_no_path(io::ErrorKind::NotFound.into(), "open downloaded blob"),
            ),
            Err(e) => handler.record_unpack_failure(key, e),
        }
    }

    fn store_entry<P>(&self, key: &CacheKey, payload: &P, handler: &dyn StoreHandler<P>) {
        if self.local.contains(key) {
            tracing::debug!(key = %key, "Already stored locally");
        } else {
            let writer = handler.create_writer(key, payload);
            match self.local.write_with(key, |out| writer.write_to(out)) {
                Ok(written) => tracing::debug!(key = %key, written, "Stored locally"),
                Err(e) => {
                    handler.record_pack_failure(key, e);
                    return;
                }
            }
        }

        if let Some(remote) = &self.remote {
            handler.ensure_store_operation_started(key);
            match self.upload(remote.as_ref(), key) {
                Ok(stored) => handler.record_store_finished(key, stored),
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        remote = remote.name(),
                        error = %e,
                        "Remote cache upload failed"
                    );
                    handler.record_store_failure(key, e);
                }
            }
        }
    }

    /// Upload the local copy of `key` unless the remote already has it
    fn upload(&self, remote: &dyn RemoteBlobStore, key: &CacheKey) -> Result<bool> {
        if remote.contains(key)? {
            return Ok(false);
        }
        let mut file = self.local.open(key)?.ok_or_else(|| {
            Error::io_no_path(io::ErrorKind::NotFound.into(), "open local blob for upload")
        })?;
        remote.upload(key, &mut file)?;
        Ok(true)
    }
}

fn deliver<P>(key: &CacheKey, input: &mut dyn Read, payload: &P, handler: &dyn LoadHandler<P>) {
    if let Err(e) = handler.handle(key, input, payload) {
        handler.record_unpack_failure(key, e);
    }
}

impl CacheAccess for TieredCacheAccess {
    fn load<P: Sync>(&self, entries: &BTreeMap<CacheKey, P>, handler: &dyn LoadHandler<P>) {
        self.pool.install(|| {
            entries
                .par_iter()
                .for_each(|(key, payload)| self.load_entry(key, payload, handler));
        });
    }

    fn store<P: Sync>(&self, entries: &BTreeMap<CacheKey, P>, handler: &dyn StoreHandler<P>) {
        self.pool.install(|| {
            entries
                .par_iter()
                .for_each(|(key, payload)| self.store_entry(key, payload, handler));
        });
    }
}

impl fmt::Debug for TieredCacheAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredCacheAccess")
            .field("local", &self.local.root())
            .field("remote", &self.remote.as_ref().map(|r| r.name()))
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::BlobWriter;
    use crate::{ContentHash, MemoryBlobStore};
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct BytesWriter<'a>(&'a [u8]);

    impl BlobWriter for BytesWriter<'_> {
        fn open_stream(&self) -> io::Result<Box<dyn Read + '_>> {
            Ok(Box::new(self.0))
        }

        fn write_to(&self, out: &mut dyn Write) -> io::Result<u64> {
            out.write_all(self.0)?;
            Ok(self.0.len() as u64)
        }

        fn size(&self) -> u64 {
            self.0.len() as u64
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        delivered: Mutex<BTreeMap<CacheKey, Vec<u8>>>,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            let mut events = self.events.lock().unwrap().clone();
            events.sort();
            events
        }
    }

    impl StoreHandler<Vec<u8>> for Recorder {
        fn create_writer<'a>(
            &'a self,
            _key: &CacheKey,
            payload: &'a Vec<u8>,
        ) -> Box<dyn BlobWriter + 'a> {
            Box::new(BytesWriter(payload))
        }

        fn ensure_store_operation_started(&self, _key: &CacheKey) {
            self.push("store-started".into());
        }

        fn record_store_finished(&self, _key: &CacheKey, stored: bool) {
            self.push(format!("store-finished:{stored}"));
        }

        fn record_store_failure(&self, _key: &CacheKey, _error: Error) {
            self.push("store-failure".into());
        }

        fn record_pack_failure(&self, _key: &CacheKey, _error: Error) {
            self.push("pack-failure".into());
        }
    }

    impl LoadHandler<()> for Recorder {
        fn handle(&self, key: &CacheKey, input: &mut dyn Read, _payload: &()) -> Result<()> {
            let mut data = Vec::new();
            input
                .read_to_end(&mut data)
                .map_err(|e| Error::io_no_path(e, "read"))?;
            self.delivered.lock().unwrap().insert(*key, data);
            Ok(())
        }

        fn ensure_load_operation_started(&self, _key: &CacheKey) {
            self.push("load-started".into());
        }

        fn record_load_hit(&self, _key: &CacheKey, size: u64) {
            self.push(format!("load-hit:{size}"));
        }

        fn record_load_miss(&self, _key: &CacheKey) {
            self.push("load-miss".into());
        }

        fn record_load_failure(&self, _key: &CacheKey, _error: Error) {
            self.push("load-failure".into());
        }

        fn record_unpack_failure(&self, _key: &CacheKey, _error: Error) {
            self.push("unpack-failure".into());
        }
    }

    struct FailingRemote;

    impl RemoteBlobStore for FailingRemote {
        fn name(&self) -> &str {
            "failing"
        }

        fn contains(&self, key: &CacheKey) -> Result<bool> {
            Err(Error::remote(key, "connection refused"))
        }

        fn fetch(&self, key: &CacheKey) -> Result<Option<Box<dyn Read + Send>>> {
            Err(Error::remote(key, "connection refused"))
        }

        fn upload(&self, key: &CacheKey, _reader: &mut dyn Read) -> Result<()> {
            Err(Error::remote(key, "connection refused"))
        }
    }

    fn blobs(contents: &[&[u8]]) -> BTreeMap<CacheKey, Vec<u8>> {
        contents
            .iter()
            .map(|c| (ContentHash::from_data(c), c.to_vec()))
            .collect()
    }

    fn keys_of<P>(entries: &BTreeMap<CacheKey, P>) -> BTreeMap<CacheKey, ()> {
        entries.keys().map(|k| (*k, ())).collect()
    }

    #[test]
    fn store_then_load_locally() {
        let tmp = TempDir::new().unwrap();
        let access = TieredCacheAccess::new(CasStore::new(tmp.path()), 4).unwrap();
        let entries = blobs(&[b"one", b"two", b"three"]);

        let recorder = Recorder::default();
        access.store(&entries, &recorder);
        // No remote, no remote events
        assert!(recorder.events().is_empty());
        assert_eq!(access.local().list().unwrap().len(), 3);

        let recorder = Recorder::default();
        access.load(&keys_of(&entries), &recorder);
        assert!(recorder.events().is_empty());
        assert_eq!(*recorder.delivered.lock().unwrap(), entries);
    }

    #[test]
    fn local_miss_without_remote_is_reported() {
        let tmp = TempDir::new().unwrap();
        let access = TieredCacheAccess::new(CasStore::new(tmp.path()), 1).unwrap();
        let entries = blobs(&[b"absent"]);

        let recorder = Recorder::default();
        access.load(&keys_of(&entries), &recorder);
        assert_eq!(recorder.events(), vec!["load-miss".to_string()]);
        assert!(recorder.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn store_uploads_once_to_remote() {
        let tmp = TempDir::new().unwrap();
        let remote = MemoryBlobStore::new();
        let access = TieredCacheAccess::new(CasStore::new(tmp.path()), 2)
            .unwrap()
            .with_remote(Arc::new(remote.clone()));
        let entries = blobs(&[b"alpha", b"beta"]);

        let recorder = Recorder::default();
        access.store(&entries, &recorder);
        assert_eq!(
            recorder.events(),
            vec![
                "store-finished:true",
                "store-finished:true",
                "store-started",
                "store-started"
            ]
        );
        assert_eq!(remote.len(), 2);

        let recorder = Recorder::default();
        access.store(&entries, &recorder);
        assert_eq!(
            recorder.events(),
            vec![
                "store-finished:false",
                "store-finished:false",
                "store-started",
                "store-started"
            ]
        );
    }

    #[test]
    fn remote_hit_is_written_through_locally() {
        let remote = MemoryBlobStore::new();
        let entries = blobs(&[b"remote content"]);
        for (key, data) in &entries {
            remote.upload(key, &mut data.as_slice()).unwrap();
        }

        let tmp = TempDir::new().unwrap();
        let access = TieredCacheAccess::new(CasStore::new(tmp.path()), 2)
            .unwrap()
            .with_remote(Arc::new(remote));

        let recorder = Recorder::default();
        access.load(&keys_of(&entries), &recorder);
        assert_eq!(recorder.events(), vec!["load-hit:14", "load-started"]);
        assert_eq!(*recorder.delivered.lock().unwrap(), entries);

        // Second load is served locally without touching the remote
        let recorder = Recorder::default();
        access.load(&keys_of(&entries), &recorder);
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn remote_miss_and_failures_are_reported() {
        let tmp = TempDir::new().unwrap();
        let entries = blobs(&[b"nowhere"]);

        let access = TieredCacheAccess::new(CasStore::new(tmp.path()), 1)
            .unwrap()
            .with_remote(Arc::new(MemoryBlobStore::new()));
        let recorder = Recorder::default();
        access.load(&keys_of(&entries), &recorder);
        assert_eq!(recorder.events(), vec!["load-miss", "load-started"]);

        let access = TieredCacheAccess::new(CasStore::new(tmp.path()), 1)
            .unwrap()
            .with_remote(Arc::new(FailingRemote));
        let recorder = Recorder::default();
        access.load(&keys_of(&entries), &recorder);
        assert_eq!(recorder.events(), vec!["load-failure", "load-started"]);

        let recorder = Recorder::default();
        access.store(&entries, &recorder);
        assert_eq!(recorder.events(), vec!["store-failure", "store-started"]);
        // The local copy survives a remote failure
        assert!(access.local().contains(&ContentHash::from_data(b"nowhere")));
    }
}
