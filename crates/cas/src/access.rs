//! Keyed blob load/store primitive used by the cache controller
//!
//! A [`CacheAccess`] receives a batch of keys with a caller payload per key,
//! and reports progress back through a handler. Handlers are called from
//! whichever thread serves the entry, so they must tolerate concurrent
//! invocation for different keys.

use crate::{CacheKey, Error, Result};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Content of one blob about to be stored
///
/// Either access mode may be used by the cache access; implementations
/// produce the same bytes through both.
pub trait BlobWriter {
    /// Open the content as a readable stream
    ///
    /// # Errors
    ///
    /// Returns error if the content cannot be opened
    fn open_stream(&self) -> io::Result<Box<dyn Read + '_>>;

    /// Write the content into `out`, returning the bytes written
    ///
    /// # Errors
    ///
    /// Returns error if the content cannot be read or `out` fails
    fn write_to(&self, out: &mut dyn Write) -> io::Result<u64>;

    /// Expected length of the content
    fn size(&self) -> u64;
}

/// Callbacks driving a [`CacheAccess::store`] batch
pub trait StoreHandler<P>: Sync {
    /// Produce the content for `key`
    fn create_writer<'a>(&'a self, key: &CacheKey, payload: &'a P) -> Box<dyn BlobWriter + 'a>;

    /// A transfer to the remote tier is about to happen
    fn ensure_store_operation_started(&self, key: &CacheKey);

    /// The remote tier finished with `key`; `stored` is false when it already held it
    fn record_store_finished(&self, key: &CacheKey, stored: bool);

    /// Transfer of `key` to the remote tier failed
    fn record_store_failure(&self, key: &CacheKey, error: Error);

    /// Producing the content of `key` failed
    fn record_pack_failure(&self, key: &CacheKey, error: Error);
}

/// Callbacks driving a [`CacheAccess::load`] batch
pub trait LoadHandler<P>: Sync {
    /// Consume the content of `key`
    ///
    /// # Errors
    ///
    /// Returns error if the content cannot be materialized; the cache access
    /// reports it back through [`LoadHandler::record_unpack_failure`]
    fn handle(&self, key: &CacheKey, input: &mut dyn Read, payload: &P) -> Result<()>;

    /// A transfer from the remote tier is about to happen
    fn ensure_load_operation_started(&self, key: &CacheKey);

    /// `key` was downloaded from the remote tier
    fn record_load_hit(&self, key: &CacheKey, size: u64);

    /// No tier holds `key`
    fn record_load_miss(&self, key: &CacheKey);

    /// Transfer of `key` from the remote tier failed
    fn record_load_failure(&self, key: &CacheKey, error: Error);

    /// Consuming the content of `key` failed
    fn record_unpack_failure(&self, key: &CacheKey, error: Error);
}

/// Keyed blob store used by the controller
///
/// Both operations return once every entry has been processed. Per-entry
/// problems are reported through the handler, never returned.
pub trait CacheAccess: Send + Sync {
    /// Load every key in `entries`
    fn load<P: Sync>(&self, entries: &BTreeMap<CacheKey, P>, handler: &dyn LoadHandler<P>);

    /// Store every key in `entries`
    fn store<P: Sync>(&self, entries: &BTreeMap<CacheKey, P>, handler: &dyn StoreHandler<P>);
}

impl<A: CacheAccess> CacheAccess for Arc<A> {
    fn load<P: Sync>(&self, entries: &BTreeMap<CacheKey, P>, handler: &dyn LoadHandler<P>) {
        self.as_ref().load(entries, handler);
    }

    fn store<P: Sync>(&self, entries: &BTreeMap<CacheKey, P>, handler: &dyn StoreHandler<P>) {
        self.as_ref().store(entries, handler);
    }
}
