//! Redis queue store.
//!
//! Each queue name maps to one Redis list at `<key_prefix>:<name>`.
//! Entries are `LPUSH`ed at the head and `RPOP`ped from the tail, so every
//! command is a single atomic list operation. Nothing here spans two
//! commands; callers own any multi-step sequencing.

use super::{QueueStore, queue_key};
use crate::error::{PopqError, PopqResult};
use async_trait::async_trait;

use redis::{AsyncCommands, Client, aio::ConnectionManager};

use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Redis queue store implementation
#[derive(Clone)]
pub struct RedisQueueStore {
    /// Redis connection manager, reconnects on its own
    conn: ConnectionManager,
    /// Key prefix for queue lists
    key_prefix: String,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisQueueStore {
    /// Connect to Redis at `connection_string`; queue keys use `key_prefix`.
    pub async fn new(connection_string: &str, key_prefix: &str) -> PopqResult<Self> {
        let client = Client::open(connection_string)
            .map_err(|e| PopqError::io(format!("Failed to create Redis client: {}", e), e))?;

        let conn = timeout(Duration::from_secs(10), client.get_connection_manager())
            .await
            .map_err(|e| PopqError::io("Timed out connecting to Redis", e))?
            .map_err(|e| {
                PopqError::io(format!("Failed to create Redis connection manager: {}", e), e)
            })?;

        info!(key_prefix, "Connected to Redis queue store");

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn key(&self, name: &str) -> String {
        queue_key(&self.key_prefix, name)
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn push(&self, name: &str, entry: &str) -> PopqResult<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.key(name), entry)
            .await
            .map_err(|e| PopqError::io(format!("Failed to push to queue '{}': {}", name, e), e))?;
        debug!(queue = name, "Pushed queue entry");
        Ok(())
    }

    async fn pop(&self, name: &str) -> PopqResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.rpop(self.key(name), None)
            .await
            .map_err(|e| PopqError::io(format!("Failed to pop from queue '{}': {}", name, e), e))
    }

    async fn restore(&self, name: &str, entry: &str) -> PopqResult<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(self.key(name), entry)
            .await
            .map_err(|e| {
                PopqError::io(format!("Failed to restore entry to queue '{}': {}", name, e), e)
            })
    }

    async fn length(&self, name: &str) -> PopqResult<u64> {
        let mut conn = self.conn.clone();
        conn.llen(self.key(name)).await.map_err(|e| {
            PopqError::io(format!("Failed to read length of queue '{}': {}", name, e), e)
        })
    }

    async fn range(&self, name: &str) -> PopqResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut entries: Vec<String> = conn
            .lrange(self.key(name), 0, -1)
            .await
            .map_err(|e| PopqError::io(format!("Failed to read queue '{}': {}", name, e), e))?;
        // LRANGE lists head to tail; the tail holds the oldest entry.
        entries.reverse();
        Ok(entries)
    }

    async fn health_check(&self) -> PopqResult<()> {
        let mut conn = self.conn.clone();

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| PopqError::io(format!("Redis health check failed: {}", e), e))?;

        if pong != "PONG" {
            return Err(PopqError::Io {
                message: "Redis health check failed: unexpected response".to_string(),
                source: None,
            });
        }

        Ok(())
    }
}
