//! Job record stores.
//!
//! A job store persists [`JobRecord`]s in named collections and supports
//! insert, atomic update-by-id, filtered paginated queries, and counts.
//! Time-window filters use the id's embedded creation second
//! (see [`job_id_floor`](crate::job::job_id_floor)) instead of an indexed
//! timestamp field.
//!
//! - **In-Memory**: ordered maps, used by the test-suite
//! - **MongoDB**: one collection per configured name

use crate::error::PopqResult;
use crate::job::{FailedReason, JobId, JobRecord, JobStatus, RunSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;

pub mod memory;
pub use memory::InMemoryJobStore;

#[cfg(feature = "mongo-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "mongo-store")))]
pub mod mongo;

#[cfg(feature = "mongo-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "mongo-store")))]
pub use mongo::MongoJobStore;

/// Which version of a record an update returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnDocument {
    /// The record as it was before the update
    Before,
    /// The record after the update was applied
    After,
}

/// Optional fields of a job record that a patch can unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobField {
    PickedAt,
    FinishedAt,
    Duration,
    Delay,
    Status,
    RequeuedAt,
}

impl JobField {
    /// Persisted field name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobField::PickedAt => "pickedAt",
            JobField::FinishedAt => "finishedAt",
            JobField::Duration => "duration",
            JobField::Delay => "delay",
            JobField::Status => "status",
            JobField::RequeuedAt => "requeuedAt",
        }
    }
}

/// Atomic partial update of one job record.
///
/// Mirrors document-store update operators: increment, set, unset, and
/// append-to-sequence. All parts apply together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    /// Added to `attempts`
    pub inc_attempts: u32,
    pub set_picked_at: Option<DateTime<Utc>>,
    pub set_finished_at: Option<DateTime<Utc>>,
    pub set_duration: Option<i64>,
    pub set_delay: Option<i64>,
    pub set_status: Option<JobStatus>,
    pub set_requeued_at: Option<DateTime<Utc>>,
    /// Fields removed from the record
    pub unset: Vec<JobField>,
    /// Appended to `failedReason`
    pub push_failed_reason: Option<FailedReason>,
    /// Appended to `runHistory`
    pub push_run_history: Option<RunSnapshot>,
}

impl JobPatch {
    /// Apply the patch to an in-memory record. Unsets run before sets.
    pub fn apply(&self, record: &mut JobRecord) {
        for field in &self.unset {
            match field {
                JobField::PickedAt => record.picked_at = None,
                JobField::FinishedAt => record.finished_at = None,
                JobField::Duration => record.duration = None,
                JobField::Delay => record.delay = None,
                JobField::Status => record.status = None,
                JobField::RequeuedAt => record.requeued_at = None,
            }
        }

        record.attempts = record.attempts.saturating_add(self.inc_attempts);

        if let Some(at) = self.set_picked_at {
            record.picked_at = Some(at);
        }
        if let Some(at) = self.set_finished_at {
            record.finished_at = Some(at);
        }
        if let Some(ms) = self.set_duration {
            record.duration = Some(ms);
        }
        if let Some(ms) = self.set_delay {
            record.delay = Some(ms);
        }
        if let Some(status) = self.set_status {
            record.status = Some(status);
        }
        if let Some(at) = self.set_requeued_at {
            record.requeued_at = Some(at);
        }
        if let Some(reason) = &self.push_failed_reason {
            record.failed_reason.push(reason.clone());
        }
        if let Some(snapshot) = &self.push_run_history {
            record.run_history.push(snapshot.clone());
        }
    }
}

/// Status constraint of a [`JobFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    /// Any status, including none
    #[default]
    Any,
    /// No status yet: queued or in flight
    Pending,
    /// Exactly this terminal status
    Is(JobStatus),
}

/// Free-text search over payload sub-fields.
///
/// Matches when any of `fields` inside `data` equals `term` as a string or,
/// when `term` parses as an integer, as that number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSearch {
    pub term: String,
    pub fields: Vec<String>,
}

impl PayloadSearch {
    /// The term as an integer, if it is one.
    pub fn numeric_term(&self) -> Option<i64> {
        self.term.trim().parse().ok()
    }

    fn matches(&self, data: &serde_json::Value) -> bool {
        let number = self.numeric_term();
        self.fields.iter().any(|field| {
            let pointer = format!("/{}", field.replace('.', "/"));
            match data.pointer(&pointer) {
                Some(serde_json::Value::String(s)) => *s == self.term,
                Some(serde_json::Value::Number(n)) => number.is_some() && n.as_i64() == number,
                _ => false,
            }
        })
    }
}

/// Filter for queries and counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    /// Queue name
    pub name: Option<String>,
    /// Only ids at or above this one (creation-time floor)
    pub id_gte: Option<JobId>,
    pub status: StatusFilter,
    pub search: Option<PayloadSearch>,
}

impl JobFilter {
    /// Filter on a queue name.
    pub fn for_queue(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Only jobs created at or after `at`.
    pub fn created_since(mut self, at: DateTime<Utc>) -> Self {
        self.id_gte = Some(crate::job::job_id_floor(at));
        self
    }

    pub fn with_status(mut self, status: StatusFilter) -> Self {
        self.status = status;
        self
    }

    pub fn with_search(mut self, search: PayloadSearch) -> Self {
        self.search = Some(search);
        self
    }

    /// Whether `record` satisfies the filter.
    pub fn matches(&self, record: &JobRecord) -> bool {
        if let Some(name) = &self.name {
            if record.name != *name {
                return false;
            }
        }
        if let Some(floor) = &self.id_gte {
            if record.id < *floor {
                return false;
            }
        }
        let status_ok = match self.status {
            StatusFilter::Any => true,
            StatusFilter::Pending => record.status.is_none(),
            StatusFilter::Is(status) => record.status == Some(status),
        };
        if !status_ok {
            return false;
        }
        self.search
            .as_ref()
            .is_none_or(|search| search.matches(&record.data))
    }
}

/// Sortable record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    /// Creation order
    #[default]
    Id,
    CreatedOn,
    FinishedAt,
    Attempts,
}

impl SortField {
    /// Persisted field name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::Id => "_id",
            SortField::CreatedOn => "created_on",
            SortField::FinishedAt => "finishedAt",
            SortField::Attempts => "attempts",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Ascending,
    /// Newest first
    #[default]
    Descending,
}

/// Query ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobSort {
    pub field: SortField,
    pub order: SortOrder,
}

impl JobSort {
    pub fn new(field: SortField, order: SortOrder) -> Self {
        Self { field, order }
    }

    /// Compare two records under this ordering. Missing values sort first
    /// in ascending order.
    pub fn compare(&self, a: &JobRecord, b: &JobRecord) -> Ordering {
        let ordering = match self.field {
            SortField::Id => a.id.cmp(&b.id),
            SortField::CreatedOn => a.created_on.cmp(&b.created_on),
            SortField::FinishedAt => a.finished_at.cmp(&b.finished_at),
            SortField::Attempts => a.attempts.cmp(&b.attempts),
        }
        .then_with(|| a.id.cmp(&b.id));

        match self.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }
}

/// Trait that all job record stores must implement.
///
/// Every method names the collection it works on.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a record. Fails with `DuplicateId` if the id exists.
    async fn insert(&self, collection: &str, record: &JobRecord) -> PopqResult<()>;

    /// Load a record by id.
    async fn find_by_id(&self, collection: &str, id: &str) -> PopqResult<Option<JobRecord>>;

    /// Atomically apply `patch` to the record with `id`. Fails with
    /// `NotFound` if there is no such record.
    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: &JobPatch,
        returning: ReturnDocument,
    ) -> PopqResult<JobRecord>;

    /// Paginated read.
    async fn query(
        &self,
        collection: &str,
        filter: &JobFilter,
        sort: JobSort,
        skip: u64,
        limit: Option<u64>,
    ) -> PopqResult<Vec<JobRecord>>;

    /// Number of records matching `filter`.
    async fn count(&self, collection: &str, filter: &JobFilter) -> PopqResult<u64>;

    /// Health check for the store
    async fn health_check(&self) -> PopqResult<()>;
}

/// Factory methods for creating job stores
pub struct JobStoreFactory;

impl JobStoreFactory {
    /// Create an in-memory job store
    pub fn in_memory() -> Arc<dyn JobStore> {
        Arc::new(InMemoryJobStore::new())
    }

    /// Create a MongoDB job store from the store configuration
    #[cfg(feature = "mongo-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "mongo-store")))]
    pub async fn mongo(config: &crate::config::StoreConfig) -> PopqResult<Arc<dyn JobStore>> {
        let url = config
            .mongo_url
            .as_deref()
            .ok_or_else(|| crate::error::PopqError::config("MongoDB URL not configured"))?;
        let store = MongoJobStore::new(url, &config.database_name).await?;
        Ok(Arc::new(store))
    }

    /// Create the job store the configuration points at: MongoDB when a URL
    /// is set and the feature is enabled, in-memory otherwise.
    pub async fn from_config(config: &crate::config::StoreConfig) -> PopqResult<Arc<dyn JobStore>> {
        #[cfg(feature = "mongo-store")]
        if config.mongo_url.is_some() {
            return Self::mongo(config).await;
        }

        if config.mongo_url.is_some() {
            tracing::warn!("MongoDB URL configured but the mongo-store feature is disabled, using in-memory store");
        }
        Ok(Self::in_memory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn search(term: &str) -> PayloadSearch {
        PayloadSearch {
            term: term.to_string(),
            fields: vec!["mediaId".to_string(), "contentNumber".to_string()],
        }
    }

    #[test]
    fn test_patch_unset_then_set() {
        let mut job = JobRecord::new("a", json!({}));
        let now = Utc::now();
        job.picked_at = Some(now);
        job.status = Some(JobStatus::Failed);

        let patch = JobPatch {
            unset: vec![JobField::PickedAt, JobField::Status],
            set_requeued_at: Some(now),
            push_failed_reason: Some(FailedReason {
                reason: "boom".to_string(),
                time: now,
            }),
            ..Default::default()
        };
        patch.apply(&mut job);

        assert_eq!(job.picked_at, None);
        assert_eq!(job.status, None);
        assert_eq!(job.requeued_at, Some(now));
        assert_eq!(job.failed_reason.len(), 1);
    }

    #[test]
    fn test_patch_increments_attempts() {
        let mut job = JobRecord::new("a", json!({}));
        let patch = JobPatch {
            inc_attempts: 1,
            ..Default::default()
        };
        patch.apply(&mut job);
        patch.apply(&mut job);
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn test_search_matches_string_and_number() {
        let by_media = JobRecord::new("a", json!({"mediaId": "m-42"}));
        let by_number = JobRecord::new("a", json!({"contentNumber": 42}));
        let neither = JobRecord::new("a", json!({"other": "42"}));

        let filter = JobFilter::for_queue("a").with_search(search("42"));
        assert!(!filter.matches(&by_media));
        assert!(filter.matches(&by_number));
        assert!(!filter.matches(&neither));

        let filter = JobFilter::for_queue("a").with_search(search("m-42"));
        assert!(filter.matches(&by_media));
        assert!(!filter.matches(&by_number));
    }

    #[test]
    fn test_search_nested_field() {
        let job = JobRecord::new("a", json!({"media": {"id": "x"}}));
        let filter = JobFilter::default().with_search(PayloadSearch {
            term: "x".to_string(),
            fields: vec!["media.id".to_string()],
        });
        assert!(filter.matches(&job));
    }

    #[test]
    fn test_filter_status_and_window() {
        let mut done = JobRecord::new("a", json!({}));
        done.status = Some(JobStatus::Done);
        let pending = JobRecord::new("a", json!({}));

        let failed_only = JobFilter::for_queue("a").with_status(StatusFilter::Is(JobStatus::Failed));
        assert!(!failed_only.matches(&done));

        let pending_only = JobFilter::for_queue("a").with_status(StatusFilter::Pending);
        assert!(pending_only.matches(&pending));
        assert!(!pending_only.matches(&done));

        let future = JobFilter::for_queue("a").created_since(Utc::now() + Duration::hours(1));
        assert!(!future.matches(&pending));

        let other_queue = JobFilter::for_queue("b");
        assert!(!other_queue.matches(&pending));
    }

    #[test]
    fn test_sort_descending_by_attempts() {
        let mut a = JobRecord::new("a", json!({}));
        a.attempts = 1;
        let mut b = JobRecord::new("a", json!({}));
        b.attempts = 3;

        let sort = JobSort::new(SortField::Attempts, SortOrder::Descending);
        assert_eq!(sort.compare(&a, &b), Ordering::Greater);
        assert_eq!(JobSort::new(SortField::Attempts, SortOrder::Ascending).compare(&a, &b), Ordering::Less);
    }
}
