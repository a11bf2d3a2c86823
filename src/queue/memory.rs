//! In-memory queue store.
//!
//! Keeps one `VecDeque` per queue name behind an async lock. Nothing survives
//! a restart; use it for tests and single-process setups.

use super::QueueStore;
use crate::error::PopqResult;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// In-memory queue store implementation
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    /// Entries per queue name; head is the front, tail is the back
    lists: RwLock<HashMap<String, VecDeque<String>>>,
}

impl InMemoryQueueStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn push(&self, name: &str, entry: &str) -> PopqResult<()> {
        let mut lists = self.lists.write().await;
        lists
            .entry(name.to_string())
            .or_default()
            .push_front(entry.to_string());
        Ok(())
    }

    async fn pop(&self, name: &str) -> PopqResult<Option<String>> {
        let mut lists = self.lists.write().await;
        Ok(lists.get_mut(name).and_then(|list| list.pop_back()))
    }

    async fn restore(&self, name: &str, entry: &str) -> PopqResult<()> {
        let mut lists = self.lists.write().await;
        lists
            .entry(name.to_string())
            .or_default()
            .push_back(entry.to_string());
        Ok(())
    }

    async fn length(&self, name: &str) -> PopqResult<u64> {
        let lists = self.lists.read().await;
        Ok(lists.get(name).map_or(0, |list| list.len() as u64))
    }

    async fn range(&self, name: &str) -> PopqResult<Vec<String>> {
        let lists = self.lists.read().await;
        Ok(lists
            .get(name)
            .map(|list| list.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn health_check(&self) -> PopqResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_per_name() {
        let store = InMemoryQueueStore::new();
        store.push("a", "1").await.unwrap();
        store.push("a", "2").await.unwrap();
        store.push("b", "x").await.unwrap();
        store.push("a", "3").await.unwrap();

        assert_eq!(store.pop("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.pop("a").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.pop("b").await.unwrap().as_deref(), Some("x"));
        assert_eq!(store.pop("a").await.unwrap().as_deref(), Some("3"));
        assert_eq!(store.pop("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pop_unknown_name_is_empty() {
        let store = InMemoryQueueStore::new();
        assert_eq!(store.pop("missing").await.unwrap(), None);
        assert_eq!(store.length("missing").await.unwrap(), 0);
        assert!(store.range("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_length_tracks_pushes_minus_pops() {
        let store = InMemoryQueueStore::new();
        for i in 0..5 {
            store.push("a", &i.to_string()).await.unwrap();
        }
        store.pop("a").await.unwrap();
        store.pop("a").await.unwrap();
        assert_eq!(store.length("a").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_range_is_oldest_first_and_non_destructive() {
        let store = InMemoryQueueStore::new();
        store.push("a", "1").await.unwrap();
        store.push("a", "2").await.unwrap();
        store.push("a", "3").await.unwrap();

        assert_eq!(store.range("a").await.unwrap(), vec!["1", "2", "3"]);
        assert_eq!(store.length("a").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_restore_is_popped_next() {
        let store = InMemoryQueueStore::new();
        store.push("a", "1").await.unwrap();
        store.push("a", "2").await.unwrap();

        let first = store.pop("a").await.unwrap().unwrap();
        store.restore("a", &first).await.unwrap();

        assert_eq!(store.pop("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.length("a").await.unwrap(), 1);
    }
}
