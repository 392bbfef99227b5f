//! Coordination store abstraction
//!
//! A typed facade over any linearizable KV store with TTLs, atomic
//! create/compare-and-swap, recursive delete, and resumable watches.
//! The controller and every node runtime share one store handle; all
//! cross-node state transitions go through it.

pub mod memory;
pub mod paths;

pub use memory::MemoryStore;
pub use paths::JobPaths;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Atomic create found the key present.
    #[error("key already exists: {key}")]
    AlreadyExists { key: String },

    /// Compare-and-swap found a different value than expected.
    #[error("compare failed on {key}")]
    Conflict { key: String },

    /// Key absent (or expired).
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// The requested watch index was compacted away.
    #[error("watch index {requested} compacted, oldest retained is {oldest}")]
    IndexCompacted { requested: u64, oldest: u64 },

    /// The store lost quorum or the connection to it; retryable.
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
}

/// A key with its value and the store index of its last modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub index: u64,
}

/// What happened to a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Create,
    Update,
    Delete,
    /// TTL ran out; semantically a delete initiated by the store itself.
    Expire,
}

/// One observed mutation under a watched prefix.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// Store-wide modification index of this event; watches resume from here.
    pub index: u64,
    pub key: String,
    pub action: WatchAction,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Lazy sequence of watch events. The stream ends when the watch is lost;
/// restart it from the last observed index plus one.
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

/// Contract consumed from the coordination store.
///
/// Implementations must be linearizable: every mutation gets a unique,
/// strictly increasing modification index, and watches deliver mutations
/// in index order.
#[async_trait]
pub trait CoordStore: Send + Sync + 'static {
    /// Atomically create `key`; fails with `AlreadyExists` when present.
    /// Returns the modification index.
    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError>;

    /// Unconditionally set `key`, creating it if absent.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError>;

    /// Atomically replace the value of `key`.
    ///
    /// With `prev_value = Some(v)` the swap only succeeds if the current
    /// value equals `v`; with `None` any current value is accepted. The key
    /// must exist either way. A successful swap re-arms the TTL.
    async fn compare_and_swap(
        &self,
        key: &str,
        prev_value: Option<&str>,
        next: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError>;

    /// Read a single key.
    async fn get(&self, key: &str) -> Result<KeyValue, StoreError>;

    /// Enumerate the direct and nested children of `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    /// Delete a key, or a whole subtree with `recursive`.
    async fn delete(&self, key: &str, recursive: bool) -> Result<(), StoreError>;

    /// Watch `prefix` (a single key or a subtree) starting at `from_index`.
    ///
    /// Events already emitted with `index >= from_index` are replayed first,
    /// then the stream follows live mutations.
    async fn watch(&self, prefix: &str, from_index: u64) -> Result<WatchStream, StoreError>;

    /// The store's current modification index.
    async fn latest_index(&self) -> Result<u64, StoreError>;
}
