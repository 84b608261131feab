//! The build cache controller
//!
//! [`BuildCacheController::store`] turns output snapshots into a manifest and
//! deduplicated content blobs; [`BuildCacheController::load`] replaces the
//! declared outputs with what a stored manifest describes. Both are blocking;
//! the [`CacheAccess`] may transfer blobs in parallel underneath.

mod load;
mod store;

use crate::config::ControllerConfig;
use crate::entity::{CacheableEntity, FileSystemView, NoopFileSystemView};
use crate::manifest::OriginMetadata;
use crate::operations::{OperationSink, TracingOperationSink};
use crate::snapshot::FileSystemSnapshot;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stowage_cas::{CacheAccess, CacheKey};

/// What happened with the remote tier during a store
#[derive(Debug, Default)]
pub enum RemoteStoreOutcome {
    /// The remote tier was not involved
    #[default]
    NotAttempted,
    /// At least one blob was uploaded
    Stored,
    /// The remote tier already held everything
    NotStored,
    /// Uploading failed; the entry is still stored locally
    Failed(Error),
}

/// Result of a successful store
#[derive(Debug, Default)]
pub struct StoreOutcome {
    /// Blobs actually written, manifest included
    pub entry_count: u64,
    /// Bytes actually written, manifest included
    pub total_size: u64,
    /// Remote tier outcome
    pub remote: RemoteStoreOutcome,
}

/// What happened with the remote tier during a load
#[derive(Debug, Default)]
pub enum RemoteLoadOutcome {
    /// Everything was available locally
    #[default]
    NotAttempted,
    /// Blobs were downloaded
    Hit {
        /// Bytes downloaded
        downloaded_size: u64,
    },
    /// The remote tier lacked at least one blob
    Miss,
    /// Downloading failed
    Failed(Error),
}

/// Outputs restored from the cache
#[derive(Debug)]
pub struct LoadResult {
    /// Blobs delivered, manifest included
    pub artifact_entry_count: u64,
    /// Provenance recorded when the entry was stored
    pub origin_metadata: OriginMetadata,
    /// Snapshot of every restored output that exists, by property
    pub resulting_snapshots: BTreeMap<String, FileSystemSnapshot>,
    /// Content hashes that could not be delivered, by property
    pub missing_content: BTreeMap<String, Vec<CacheKey>>,
    /// Remote tier outcome
    pub remote: RemoteLoadOutcome,
}

impl LoadResult {
    /// Whether every output was fully restored
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing_content.is_empty()
    }
}

/// Stores and loads the outputs of cacheable entities
pub struct BuildCacheController<A> {
    config: ControllerConfig,
    access: A,
    file_system: Arc<dyn FileSystemView>,
    sink: Arc<dyn OperationSink>,
}

impl<A: CacheAccess> BuildCacheController<A> {
    /// Create a controller over `access`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid
    pub fn new(config: ControllerConfig, access: A) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            enabled = config.enabled,
            build_invocation_id = %config.build_invocation_id,
            "Creating build cache controller"
        );
        Ok(Self {
            config,
            access,
            file_system: Arc::new(NoopFileSystemView),
            sink: Arc::new(TracingOperationSink),
        })
    }

    /// Keep `view` consistent with restored outputs
    #[must_use]
    pub fn with_file_system_view(mut self, view: Arc<dyn FileSystemView>) -> Self {
        self.file_system = view;
        self
    }

    /// Report operations to `sink`
    #[must_use]
    pub fn with_operation_sink(mut self, sink: Arc<dyn OperationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Whether the controller loads and stores anything
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The underlying cache access
    #[must_use]
    pub const fn access(&self) -> &A {
        &self.access
    }

    /// Restore the outputs of `entity` from the entry stored under `key`
    ///
    /// Returns `None` on a cache miss, in which case the outputs are untouched.
    /// Content the cache can no longer supply does not fail the load; it is
    /// listed in [`LoadResult::missing_content`].
    ///
    /// # Errors
    ///
    /// Returns error if the manifest is malformed or inconsistent with the
    /// declared outputs, or if the outputs cannot be cleaned or written
    pub fn load(&self, key: &CacheKey, entity: &dyn CacheableEntity) -> Result<Option<LoadResult>> {
        if !self.config.enabled {
            tracing::debug!(key = %key, "Build cache disabled, skipping load");
            return Ok(None);
        }
        load::load(self, key, entity)
    }

    /// Store the outputs of `entity`, described by `snapshots`, under `key`
    ///
    /// Failing to reach the remote tier does not fail the store; see
    /// [`StoreOutcome::remote`].
    ///
    /// # Errors
    ///
    /// Returns error if a snapshot does not match its declared output type,
    /// or if content cannot be written to the cache
    pub fn store(
        &self,
        key: &CacheKey,
        entity: &dyn CacheableEntity,
        snapshots: &BTreeMap<String, FileSystemSnapshot>,
        execution_time: Duration,
    ) -> Result<StoreOutcome> {
        if !self.config.enabled {
            tracing::debug!(key = %key, "Build cache disabled, skipping store");
            return Ok(StoreOutcome::default());
        }
        store::store(self, key, entity, snapshots, execution_time)
    }
}

impl<A> fmt::Debug for BuildCacheController<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildCacheController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Location of a manifest entry below an output root
fn resolve(root: &Path, relative_path: &str) -> PathBuf {
    if relative_path.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative_path)
    }
}

fn property_error(property: &str, root: &Path, message: impl fmt::Display) -> Error {
    Error::integrity(format!(
        "output property '{property}' ({}): {message}",
        root.display()
    ))
}
