//! In-memory job store.
//!
//! Collections are `BTreeMap`s keyed by job id, so iteration follows
//! creation order. All operations take the single store lock, which makes
//! each one atomic.

use super::{JobFilter, JobPatch, JobSort, JobStore, ReturnDocument};
use crate::error::{PopqError, PopqResult};
use crate::job::{JobId, JobRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// In-memory job store implementation
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    collections: RwLock<HashMap<String, BTreeMap<JobId, JobRecord>>>,
}

impl InMemoryJobStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all collections
    pub async fn len(&self) -> usize {
        let collections = self.collections.read().await;
        collections.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, collection: &str, record: &JobRecord) -> PopqResult<()> {
        let mut collections = self.collections.write().await;
        let records = collections.entry(collection.to_string()).or_default();
        if records.contains_key(&record.id) {
            return Err(PopqError::DuplicateId {
                id: record.id.clone(),
            });
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> PopqResult<Option<JobRecord>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned())
    }

    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: &JobPatch,
        returning: ReturnDocument,
    ) -> PopqResult<JobRecord> {
        let mut collections = self.collections.write().await;
        let record = collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| PopqError::NotFound { id: id.to_string() })?;

        let before = match returning {
            ReturnDocument::Before => Some(record.clone()),
            ReturnDocument::After => None,
        };
        patch.apply(record);

        Ok(before.unwrap_or_else(|| record.clone()))
    }

    async fn query(
        &self,
        collection: &str,
        filter: &JobFilter,
        sort: JobSort,
        skip: u64,
        limit: Option<u64>,
    ) -> PopqResult<Vec<JobRecord>> {
        let collections = self.collections.read().await;
        let Some(records) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<&JobRecord> = records.values().filter(|r| filter.matches(r)).collect();
        matched.sort_by(|a, b| sort.compare(a, b));

        let skip = usize::try_from(skip).unwrap_or(usize::MAX);
        let limit = limit
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(usize::MAX);

        Ok(matched.into_iter().skip(skip).take(limit).cloned().collect())
    }

    async fn count(&self, collection: &str, filter: &JobFilter) -> PopqResult<u64> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map_or(0, |records| {
            records.values().filter(|r| filter.matches(r)).count() as u64
        }))
    }

    async fn health_check(&self) -> PopqResult<()> {
        Ok(())
    }
}
