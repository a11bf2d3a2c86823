//! Queue store adapters.
//!
//! A queue store keeps one ordered list per queue name. Entries are pushed
//! at the head and popped from the tail, so each named queue is FIFO.
//! No ordering is promised across different names.
//!
//! - **In-Memory**: for tests and single-process use
//! - **Redis**: `LPUSH`/`RPOP` lists, one key per queue name
//!
//! # Examples
//!
//! ```rust,no_run
//! use popq::queue::{InMemoryQueueStore, QueueStore};
//!
//! # async fn example() -> popq::PopqResult<()> {
//! let store = InMemoryQueueStore::new();
//! store.push("emails", "{}").await?;
//! assert_eq!(store.length("emails").await?, 1);
//! # Ok(())
//! # }
//! ```

use crate::config::StoreConfig;
use crate::error::PopqResult;
use async_trait::async_trait;
use std::sync::Arc;

pub mod memory;
pub use memory::InMemoryQueueStore;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub mod redis;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub use redis::RedisQueueStore;

/// Trait that all queue stores must implement.
///
/// Every operation is atomic on its own; nothing spans two calls.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert an entry at the head of the queue.
    async fn push(&self, name: &str, entry: &str) -> PopqResult<()>;

    /// Remove and return the entry at the tail, or `None` if the queue is empty.
    async fn pop(&self, name: &str) -> PopqResult<Option<String>>;

    /// Put a popped entry back at the tail so it is the next one popped.
    async fn restore(&self, name: &str, entry: &str) -> PopqResult<()>;

    /// Number of entries waiting in the queue.
    async fn length(&self, name: &str) -> PopqResult<u64>;

    /// Snapshot of all entries, oldest first. Does not remove anything.
    async fn range(&self, name: &str) -> PopqResult<Vec<String>>;

    /// Health check for the store
    async fn health_check(&self) -> PopqResult<()>;
}

/// Store key of the list holding `name`'s entries.
pub fn queue_key(prefix: &str, name: &str) -> String {
    format!("{}:{}", prefix, name)
}

/// Factory methods for creating queue stores
pub struct QueueStoreFactory;

impl QueueStoreFactory {
    /// Create an in-memory queue store
    pub fn in_memory() -> Arc<dyn QueueStore> {
        Arc::new(InMemoryQueueStore::new())
    }

    /// Create a Redis queue store from the store configuration
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub async fn redis(config: &StoreConfig) -> PopqResult<Arc<dyn QueueStore>> {
        let url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| crate::error::PopqError::config("Redis URL not configured"))?;
        let store = RedisQueueStore::new(url, &config.key_prefix).await?;
        Ok(Arc::new(store))
    }

    /// Create the queue store the configuration points at: Redis when a URL
    /// is set and the feature is enabled, in-memory otherwise.
    pub async fn from_config(config: &StoreConfig) -> PopqResult<Arc<dyn QueueStore>> {
        #[cfg(feature = "redis-queue")]
        if config.redis_url.is_some() {
            return Self::redis(config).await;
        }

        if config.redis_url.is_some() {
            tracing::warn!("Redis URL configured but the redis-queue feature is disabled, using in-memory queue");
        }
        Ok(Self::in_memory())
    }
}
