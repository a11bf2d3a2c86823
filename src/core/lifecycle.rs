//! Job lifecycle engine.
//!
//! Owns every state transition of a job:
//!
//! ```text
//! Queued -> Picked -> Done
//!                  -> Requeued -> Queued
//!                  -> Failed
//! ```
//!
//! `Done` and `Failed` are terminal. The engine talks to both stores but
//! never retries a store call itself; every error is returned to the caller,
//! which decides whether the operation is worth repeating.

use crate::config::StoreConfig;
use crate::core::registry::RunnerRegistry;
use crate::error::{PopqError, PopqResult};
use crate::job::{FailedReason, JobId, JobRecord, JobStatus};
use crate::queue::QueueStore;
use crate::store::{JobField, JobFilter, JobPatch, JobSort, JobStore, ReturnDocument, SortField, SortOrder, StatusFilter};
use crate::utils::duration_ms;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Failure reason recorded for operator-triggered requeues.
pub const MANUAL_REQUEUE_REASON: &str = "manually requeued";

/// Which branch a failure took.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// The job went back to the queue
    Retried(JobRecord),
    /// The retry limit was reached; the job is `failed`
    Terminal(JobRecord),
}

impl FailOutcome {
    pub fn into_record(self) -> JobRecord {
        match self {
            FailOutcome::Retried(record) | FailOutcome::Terminal(record) => record,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FailOutcome::Terminal(_))
    }
}

/// Moves jobs between states using the queue store and the job store.
pub struct LifecycleEngine {
    queue: Arc<dyn QueueStore>,
    store: Arc<dyn JobStore>,
    registry: Arc<RunnerRegistry>,
    retry_limit: u32,
    collections: StoreConfig,
}

impl LifecycleEngine {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        store: Arc<dyn JobStore>,
        registry: Arc<RunnerRegistry>,
        retry_limit: u32,
        collections: StoreConfig,
    ) -> Self {
        Self {
            queue,
            store,
            registry,
            retry_limit,
            collections,
        }
    }

    pub fn queue(&self) -> &Arc<dyn QueueStore> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Collection new records of queue `name` go to: the runner option
    /// if this process defined one, else the configured mapping.
    pub async fn collection_for(&self, name: &str) -> String {
        match self.registry.collection_name(name).await {
            Some(collection) => collection,
            None => self.collections.collection_for(name).to_string(),
        }
    }

    /// Every collection that may hold records of `name`, preferred first.
    /// A producer that saw a different configuration may have written to
    /// the configured or the default collection.
    async fn candidate_collections(&self, name: &str) -> Vec<String> {
        let mut candidates = vec![self.collection_for(name).await];
        for fallback in [
            self.collections.collection_for(name),
            self.collections.collection_name.as_str(),
        ] {
            if !candidates.iter().any(|c| c == fallback) {
                candidates.push(fallback.to_string());
            }
        }
        candidates
    }

    async fn collection_of(&self, job: &JobRecord) -> String {
        match &job.collection {
            Some(collection) => collection.clone(),
            None => self.collection_for(&job.name).await,
        }
    }

    /// Apply `patch` and return the updated record, tagged with the
    /// collection it lives in.
    async fn update(&self, collection: &str, id: &str, patch: &JobPatch) -> PopqResult<JobRecord> {
        let mut record = self
            .store
            .update_by_id(collection, id, patch, ReturnDocument::After)
            .await?;
        record
            .collection
            .get_or_insert_with(|| collection.to_string());
        Ok(record)
    }

    /// Create a job and make it eligible for picking.
    ///
    /// The record is inserted before the entry is pushed: if the push fails
    /// the record is left orphaned, which reconciliation can repair, instead
    /// of an entry with no record behind it.
    pub async fn enqueue(&self, name: &str, data: serde_json::Value) -> PopqResult<JobId> {
        let collection = self.collection_for(name).await;
        let mut record = JobRecord::new(name, data);
        record.collection = Some(collection.clone());
        let entry = record.to_entry()?;

        self.store.insert(&collection, &record).await?;
        self.queue.push(name, &entry).await?;

        debug!(queue = name, job_id = %record.id, "Job enqueued");
        Ok(record.id)
    }

    /// Pop the next entry of `name` and mark its record picked.
    ///
    /// Returns `None` when the queue is empty. The returned record is the
    /// stored one after the update, so `attempts` already counts this pick.
    ///
    /// An entry that cannot be parsed, or whose record is missing or
    /// undecodable, is dropped and reported as an entry fault. If the store
    /// update fails transiently the entry is put back so it is the next one
    /// popped.
    ///
    /// Entries name their record's collection; older entries without one
    /// are looked up in every candidate collection.
    pub async fn pick(&self, name: &str) -> PopqResult<Option<JobRecord>> {
        let Some(entry) = self.queue.pop(name).await? else {
            return Ok(None);
        };

        let job = JobRecord::from_entry(&entry).inspect_err(|e| {
            error!(queue = name, error = %e, "Dropping malformed queue entry");
        })?;

        let candidates = match &job.collection {
            Some(collection) => vec![collection.clone()],
            None => self.candidate_collections(name).await,
        };
        let patch = JobPatch {
            inc_attempts: 1,
            set_picked_at: Some(Utc::now()),
            ..Default::default()
        };

        let mut picked = Err(PopqError::NotFound { id: job.id.clone() });
        for collection in &candidates {
            picked = self.update(collection, &job.id, &patch).await;
            if !matches!(picked, Err(PopqError::NotFound { .. })) {
                break;
            }
        }

        match picked {
            Ok(record) => {
                debug!(queue = name, job_id = %record.id, attempts = record.attempts, "Job picked");
                Ok(Some(record))
            }
            Err(e) if e.is_transient() => {
                if let Err(restore_err) = self.queue.restore(name, &entry).await {
                    error!(
                        queue = name,
                        job_id = %job.id,
                        error = %restore_err,
                        "Failed to restore queue entry after store error"
                    );
                }
                Err(e)
            }
            Err(e) => {
                if matches!(e, PopqError::NotFound { .. }) {
                    error!(queue = name, job_id = %job.id, "Dropping queue entry with no job record");
                } else {
                    error!(queue = name, job_id = %job.id, error = %e, "Dropping queue entry");
                }
                Err(e)
            }
        }
    }

    /// Mark a picked job `done`.
    pub async fn finish(&self, job: &JobRecord) -> PopqResult<JobRecord> {
        let now = Utc::now();
        let duration = job
            .picked_at
            .map_or(0, |picked| (now - picked).num_milliseconds());
        let delay = (now - job.created_on).num_milliseconds();

        let patch = JobPatch {
            set_finished_at: Some(now),
            set_duration: Some(duration),
            set_delay: Some(delay),
            set_status: Some(JobStatus::Done),
            ..Default::default()
        };

        let collection = self.collection_of(job).await;
        let record = self.update(&collection, &job.id, &patch).await?;

        info!(queue = %job.name, job_id = %job.id, duration_ms = duration, "Job done");
        Ok(record)
    }

    /// Record a failure and push the job back if it was retried.
    ///
    /// Retries while `attempts < retry_limit`; the failure at or past the
    /// limit is terminal. `force` always retries.
    pub async fn fail(&self, job: &JobRecord, reason: &str, force: bool) -> PopqResult<FailOutcome> {
        let outcome = self.record_failure(job, reason, force).await?;
        if let FailOutcome::Retried(record) = &outcome {
            self.push_entry(record).await?;
        }
        Ok(outcome)
    }

    /// The store half of [`fail`](Self::fail): writes the failure but does
    /// not touch the queue.
    pub async fn record_failure(
        &self,
        job: &JobRecord,
        reason: &str,
        force: bool,
    ) -> PopqResult<FailOutcome> {
        let now = Utc::now();
        let failed_reason = FailedReason {
            reason: reason.to_string(),
            time: now,
        };
        let collection = self.collection_of(job).await;

        if job.attempts >= self.retry_limit && !force {
            let patch = JobPatch {
                set_finished_at: Some(now),
                set_status: Some(JobStatus::Failed),
                set_requeued_at: Some(now),
                push_failed_reason: Some(failed_reason),
                ..Default::default()
            };
            let record = self.update(&collection, &job.id, &patch).await?;

            warn!(
                queue = %job.name,
                job_id = %job.id,
                attempts = job.attempts,
                reason,
                "Job failed permanently"
            );
            return Ok(FailOutcome::Terminal(record));
        }

        let patch = JobPatch {
            unset: vec![
                JobField::PickedAt,
                JobField::FinishedAt,
                JobField::Status,
                JobField::Duration,
                JobField::Delay,
            ],
            set_requeued_at: Some(now),
            push_failed_reason: Some(failed_reason),
            push_run_history: Some(job.snapshot()),
            ..Default::default()
        };
        let record = self.update(&collection, &job.id, &patch).await?;

        info!(
            queue = %job.name,
            job_id = %job.id,
            attempts = job.attempts,
            force,
            reason,
            "Job requeued"
        );
        Ok(FailOutcome::Retried(record))
    }

    /// Push a queue entry for `record` onto its queue.
    pub async fn push_entry(&self, record: &JobRecord) -> PopqResult<()> {
        let entry = record.to_entry()?;
        self.queue.push(&record.name, &entry).await
    }

    /// Operator requeue: force the job with `id` back onto queue `name`,
    /// whatever its attempt count or status.
    pub async fn requeue(&self, name: &str, id: &str) -> PopqResult<JobRecord> {
        let mut found = None;
        for collection in self.candidate_collections(name).await {
            if let Some(mut record) = self.store.find_by_id(&collection, id).await? {
                record.collection.get_or_insert(collection);
                found = Some(record);
                break;
            }
        }
        let record = found.ok_or_else(|| PopqError::NotFound { id: id.to_string() })?;

        let outcome = self.fail(&record, MANUAL_REQUEUE_REASON, true).await?;
        Ok(outcome.into_record())
    }

    /// Re-push non-terminal records of `names` that have no queue entry.
    ///
    /// Only records whose last activity is older than `stale_after` are
    /// touched, and jobs in `in_flight` are always skipped. Every candidate
    /// collection of a name is scanned. Returns how many entries were pushed.
    pub async fn reconcile(
        &self,
        names: &[String],
        stale_after: Duration,
        in_flight: &HashSet<JobId>,
    ) -> PopqResult<usize> {
        let stale_ms = i64::try_from(duration_ms(stale_after)).unwrap_or(i64::MAX);
        let now = Utc::now();
        let mut repaired = 0;

        for name in names {
            let queued: HashSet<JobId> = self
                .queue
                .range(name)
                .await?
                .iter()
                .filter_map(|entry| JobRecord::from_entry(entry).ok())
                .map(|record| record.id)
                .collect();

            for collection in self.candidate_collections(name).await {
                let pending = self
                    .store
                    .query(
                        &collection,
                        &JobFilter::for_queue(name.as_str()).with_status(StatusFilter::Pending),
                        JobSort::new(SortField::Id, SortOrder::Ascending),
                        0,
                        None,
                    )
                    .await?;

                for mut record in pending {
                    if queued.contains(&record.id) || in_flight.contains(&record.id) {
                        continue;
                    }
                    if (now - record.last_activity()).num_milliseconds() < stale_ms {
                        continue;
                    }

                    record.collection.get_or_insert_with(|| collection.clone());
                    self.push_entry(&record).await?;
                    repaired += 1;
                    warn!(queue = %name, job_id = %record.id, collection = %collection, "Re-pushed job with no queue entry");
                }
            }
        }

        Ok(repaired)
    }
}
