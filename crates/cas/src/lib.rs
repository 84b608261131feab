//! Content-addressed blob storage for stowage
//!
//! This crate provides:
//! - [`ContentHash`]: SHA-256 keys for blobs and manifests
//! - [`CasStore`]: a local content-addressed store on disk
//! - [`RemoteBlobStore`]: the seam a shared remote cache plugs into
//! - [`CacheAccess`]: the batched load/store primitive the cache controller
//!   drives, with [`TieredCacheAccess`] as its local + remote implementation

pub mod access;
mod error;
mod hash;
pub mod paths;
pub mod remote;
mod store;
pub mod tiered;

pub use access::{BlobWriter, CacheAccess, LoadHandler, StoreHandler};
pub use error::{Error, Result};
pub use hash::{CacheKey, ContentHash, ContentHasher};
pub use paths::default_cache_root;
pub use remote::{MemoryBlobStore, RemoteBlobStore};
pub use store::CasStore;
pub use tiered::{DEFAULT_MAX_CONCURRENT_TRANSFERS, TieredCacheAccess};
