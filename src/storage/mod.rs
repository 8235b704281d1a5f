//! Pluggable key/value stores backing a node.
//!
//! Every engine synchronizes itself internally, so a single `Arc<dyn Storage>` can be shared by
//! the request handlers, lookups and the refresher at the same time.

mod arc;
mod ttl;

pub use self::arc::ArcStorage;
pub use self::ttl::TtlStorage;

use std::time::Instant;

use crate::error::Result;

/// A value together with the time it was written.
#[derive(Clone, Debug)]
struct StorageEntry {
    timestamp: Instant,
    value: Vec<u8>,
}

impl StorageEntry {
    fn new(value: Vec<u8>) -> Self {
        StorageEntry {
            timestamp: Instant::now(),
            value,
        }
    }
}

/// A stored `(key, value)` pair.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Snapshot iterator over the entries of a store.
pub type StorageIter = Box<dyn Iterator<Item = Result<Entry>> + Send>;

/// A key/value store. A zero-length value is a tombstone marking a deleted key.
pub trait Storage: Send + Sync {
    /// Stores `value` under `key`, overwriting any previous value.
    fn put(&self, key: Vec<u8>, value: Vec<u8>);

    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Returns a snapshot of the stored entries. The snapshot does not reflect later mutations.
    fn iter(&self) -> StorageIter;

    /// Performs proactive maintenance such as dropping expired entries.
    fn cull(&self);
}
