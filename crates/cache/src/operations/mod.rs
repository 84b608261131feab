//! Instrumentation of cache operations
//!
//! Every `store` reports a pack operation and, when the remote tier is
//! involved, a remote store operation. Every `load` that touches the disk
//! reports an unpack operation and, when the remote tier is involved, a
//! remote load operation. Operations are started on demand and reported to an
//! [`OperationSink`].

mod sink;
pub(crate) mod span;

pub use sink::{OperationSink, TracingOperationSink};

use std::fmt;
use stowage_cas::CacheKey;
use uuid::Uuid;

/// Kind of a cache operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Writing entry content into the cache
    Pack,
    /// Writing cached content to the output locations
    Unpack,
    /// Downloading from the remote tier
    RemoteLoad,
    /// Uploading to the remote tier
    RemoteStore,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pack => "pack",
            Self::Unpack => "unpack",
            Self::RemoteLoad => "remote_load",
            Self::RemoteStore => "remote_store",
        })
    }
}

/// What an operation works on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationDetails {
    /// Packing the entry stored under `key`
    Pack {
        /// Manifest key
        key: CacheKey,
    },
    /// Unpacking the entry stored under `key`
    Unpack {
        /// Manifest key
        key: CacheKey,
        /// Manifest size plus the size of every entry, if known when started
        archive_size: Option<u64>,
    },
    /// Downloading the entry stored under `key`
    RemoteLoad {
        /// Manifest key
        key: CacheKey,
    },
    /// Uploading the entry stored under `key`
    RemoteStore {
        /// Manifest key
        key: CacheKey,
        /// Manifest size plus the size of every entry
        archive_size: u64,
    },
}

impl OperationDetails {
    /// Kind of the operation
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Pack { .. } => OperationKind::Pack,
            Self::Unpack { .. } => OperationKind::Unpack,
            Self::RemoteLoad { .. } => OperationKind::RemoteLoad,
            Self::RemoteStore { .. } => OperationKind::RemoteStore,
        }
    }

    /// Manifest key the operation is about
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        match self {
            Self::Pack { key }
            | Self::Unpack { key, .. }
            | Self::RemoteLoad { key }
            | Self::RemoteStore { key, .. } => key,
        }
    }
}

/// Description of an operation, supplied when it starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    /// Name shown in reports
    pub display_name: String,
    /// Short present-tense description for progress displays
    pub progress_display_name: &'static str,
    /// What the operation works on
    pub details: OperationDetails,
}

impl OperationDescriptor {
    pub(crate) fn pack(key: CacheKey) -> Self {
        Self {
            display_name: format!("Pack build cache entry {key}"),
            progress_display_name: "Packing build cache entry",
            details: OperationDetails::Pack { key },
        }
    }

    pub(crate) fn unpack(key: CacheKey, archive_size: Option<u64>) -> Self {
        Self {
            display_name: format!("Unpack build cache entry {key}"),
            progress_display_name: "Unpacking build cache entry",
            details: OperationDetails::Unpack { key, archive_size },
        }
    }

    pub(crate) fn remote_load(key: CacheKey) -> Self {
        Self {
            display_name: format!("Load entry {key} from remote build cache"),
            progress_display_name: "Requesting from remote build cache",
            details: OperationDetails::RemoteLoad { key },
        }
    }

    pub(crate) fn remote_store(key: CacheKey, archive_size: u64) -> Self {
        Self {
            display_name: format!("Store entry {key} in remote build cache"),
            progress_display_name: "Uploading to remote build cache",
            details: OperationDetails::RemoteStore { key, archive_size },
        }
    }
}

/// An operation that has been started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedOperation {
    /// Unique id of the operation
    pub id: Uuid,
    /// Operation this one is nested in
    pub parent: Option<Uuid>,
    /// What the operation is
    pub descriptor: OperationDescriptor,
}

/// Successful outcome of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    /// Blobs actually written into the cache, manifest included
    Pack {
        /// Number of blobs written
        entry_count: u64,
        /// Bytes written
        size: u64,
    },
    /// Blobs delivered to the output locations, manifest included
    Unpack {
        /// Number of blobs delivered
        entry_count: u64,
    },
    /// Everything needed was downloaded
    RemoteLoadHit {
        /// Bytes downloaded
        size: u64,
    },
    /// The remote tier lacked at least one blob
    RemoteLoadMiss,
    /// The remote store finished
    RemoteStore {
        /// Whether anything was actually uploaded
        stored: bool,
    },
}
