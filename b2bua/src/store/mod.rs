//! Shared key-value store abstraction.
//!
//! Routing rules, config snapshots and session records all live in a flat
//! keyspace with TTLs and prefix watch. The in-process [`MemoryStore`]
//! implements the contract for single-node deployments and tests; a
//! networked backend can be swapped in behind the same trait for horizontal
//! scale-out. All multi-key updates in the core are independent idempotent
//! puts, so no backend needs cross-key transactions.

use std::time::Duration;
use tokio::sync::broadcast;

mod memory;

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Change notification from a prefix watch
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

#[async_trait::async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All live key/value pairs under `prefix`
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Subscribe to changes under `prefix`
    fn watch_prefix(&self, prefix: &str) -> broadcast::Receiver<WatchEvent>;

    /// Health probe
    async fn ping(&self) -> Result<(), StoreError>;
}
