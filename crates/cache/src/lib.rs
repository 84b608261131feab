//! Build output caching for stowage
//!
//! This crate stores the outputs of a build step in a content-addressed cache
//! and restores them later:
//! - [`snapshot`]: Merkle snapshots of output files and directories
//! - [`manifest`]: the JSON manifest describing every output tree of an entry
//! - [`BuildCacheController`]: the store and load pipelines on top of a
//!   [`CacheAccess`](stowage_cas::CacheAccess)
//! - [`operations`]: on-demand pack, unpack and remote transfer operations
//!
//! # Overview
//!
//! Storing an entry writes one blob per distinct file content plus a manifest
//! blob under the entry's cache key. Loading reads the manifest, cleans the
//! declared outputs and fans each content blob out to every file that shares
//! it. Content the cache no longer holds leaves the load incomplete rather
//! than failing it.

pub mod config;
mod controller;
pub mod entity;
mod error;
mod events;
mod io;
pub mod manifest;
pub mod operations;
pub mod snapshot;

pub use error::{Error, Result};

pub use config::{ControllerConfig, DEFAULT_BUFFER_SIZE};
pub use controller::{
    BuildCacheController, LoadResult, RemoteLoadOutcome, RemoteStoreOutcome, StoreOutcome,
};
pub use entity::{CacheableEntity, FileSystemView, NoopFileSystemView, OutputTreeSet};
pub use manifest::{CacheManifest, ManifestEntry, OriginMetadata, entries_for};
pub use operations::{
    OperationDescriptor, OperationDetails, OperationKind, OperationResult, OperationSink,
    StartedOperation, TracingOperationSink,
};
pub use snapshot::{
    DirectorySnapshot, FileSystemSnapshot, FileType, MissingFileSnapshot, RegularFileSnapshot,
    TreeType, capture, reconstruct,
};
