//! The PopQueue facade.
//!
//! [`PopQueue`] ties the pieces together: the [`RunnerRegistry`] holding
//! handlers, the [`LifecycleEngine`] moving jobs between states, and the
//! [`Scheduler`] draining the queues in the background. Producers and
//! operators only ever talk to this type.

use crate::config::{PopQueueConfig, RunnerOptions};
use crate::error::{PopqError, PopqResult};
use crate::job::{JobId, JobRecord, JobStatus};
use crate::queue::{QueueStore, QueueStoreFactory};
use crate::store::{JobFilter, JobSort, JobStore, JobStoreFactory, PayloadSearch, StatusFilter};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;

pub mod lifecycle;
pub mod registry;
pub mod scheduler;

pub use lifecycle::{FailOutcome, LifecycleEngine, MANUAL_REQUEUE_REASON};
pub use registry::{JobHandler, ResolvedRunner, RunnerDefinition, RunnerRegistry};
pub use scheduler::{RunOutcome, Scheduler};

/// Query of [`PopQueue::get_paginated_executed_queue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedQueueQuery {
    /// Window start is midnight UTC, `last_n_days` days ago
    pub last_n_days: u32,
    pub skip: u64,
    /// `None` returns everything after `skip`
    pub limit: Option<u64>,
    pub sort: JobSort,
    /// Matched against the configured payload search fields
    pub search: Option<String>,
    pub status: Option<JobStatus>,
}

impl Default for ExecutedQueueQuery {
    fn default() -> Self {
        Self {
            last_n_days: 1,
            skip: 0,
            limit: None,
            sort: JobSort::default(),
            search: None,
            status: None,
        }
    }
}

impl ExecutedQueueQuery {
    pub fn with_page(mut self, skip: u64, limit: u64) -> Self {
        self.skip = skip;
        self.limit = Some(limit);
        self
    }

    pub fn with_last_n_days(mut self, days: u32) -> Self {
        self.last_n_days = days;
        self
    }

    pub fn with_sort(mut self, sort: JobSort) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// A durable named work-queue.
///
/// # Examples
///
/// ```rust
/// use popq::prelude::*;
///
/// # async fn example() -> PopqResult<()> {
/// let queue = PopQueue::new(PopQueueConfig::default())?;
/// queue
///     .define("emails", |job: JobRecord| async move {
///         println!("sending {}", job.data);
///         Ok::<(), PopqError>(())
///     }, RunnerOptions::default())
///     .await?;
///
/// queue.start().await?;
/// let id = queue.enqueue(&serde_json::json!({"to": "user@example.com"}), "emails").await?;
/// println!("enqueued {}", id);
/// queue.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct PopQueue {
    config: PopQueueConfig,
    registry: Arc<RunnerRegistry>,
    engine: Arc<LifecycleEngine>,
    scheduler: Arc<Scheduler>,
}

impl PopQueue {
    /// Create a queue backed by in-memory stores.
    pub fn new(config: PopQueueConfig) -> PopqResult<Self> {
        Self::with_stores(
            config,
            QueueStoreFactory::in_memory(),
            JobStoreFactory::in_memory(),
        )
    }

    /// Create a queue over the given stores.
    pub fn with_stores(
        config: PopQueueConfig,
        queue: Arc<dyn QueueStore>,
        store: Arc<dyn JobStore>,
    ) -> PopqResult<Self> {
        config
            .validate()
            .map_err(|errors| PopqError::config(errors.join("; ")))?;

        let registry = Arc::new(RunnerRegistry::new());
        let engine = Arc::new(LifecycleEngine::new(
            queue,
            store,
            Arc::clone(&registry),
            config.retry_limit,
            config.store.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            config.scheduler.clone(),
        ));

        Ok(Self {
            config,
            registry,
            engine,
            scheduler,
        })
    }

    /// Connect to the stores named in the configuration.
    pub async fn connect(config: PopQueueConfig) -> PopqResult<Self> {
        let queue = QueueStoreFactory::from_config(&config.store).await?;
        let store = JobStoreFactory::from_config(&config.store).await?;
        Self::with_stores(config, queue, store)
    }

    /// Register the handler for queue `name`. Must be called before
    /// [`start`](Self::start); the last definition for a name wins.
    pub async fn define<H>(
        &self,
        name: impl Into<String>,
        handler: H,
        options: RunnerOptions,
    ) -> PopqResult<()>
    where
        H: JobHandler,
    {
        self.registry.define(name, handler, options).await
    }

    /// Start the poll loop. Closes the registry to further definitions.
    pub async fn start(&self) -> PopqResult<()> {
        self.registry.close();
        self.scheduler.start().await?;

        tracing::info!(
            runners = self.registry.len().await,
            retry_limit = self.config.retry_limit,
            "PopQueue started"
        );
        Ok(())
    }

    /// Stop the poll loop and wait for it to exit.
    pub async fn stop(&self) -> PopqResult<()> {
        self.scheduler.stop().await?;
        tracing::info!("PopQueue stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Enqueue `payload` on queue `name`.
    pub async fn enqueue<T: Serialize>(&self, payload: &T, name: &str) -> PopqResult<JobId> {
        let data = serde_json::to_value(payload)?;
        self.engine.enqueue(name, data).await
    }

    /// Number of entries waiting in queue `name`.
    pub async fn get_queue_length(&self, name: &str) -> PopqResult<u64> {
        self.engine.queue().length(name).await
    }

    /// Snapshot of the jobs waiting in queue `name`, oldest first.
    /// Entries that fail to parse are logged and left out.
    pub async fn get_current_queue(&self, name: &str) -> PopqResult<Vec<JobRecord>> {
        let entries = self.engine.queue().range(name).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| match JobRecord::from_entry(entry) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::error!(queue = name, error = %e, "Failed to parse queue entry");
                    None
                }
            })
            .collect())
    }

    /// Jobs of queue `name` created in the last `hours` hours.
    pub async fn get_count_in_last_n_hours(&self, name: &str, hours: u32) -> PopqResult<u64> {
        let since = Utc::now() - ChronoDuration::hours(i64::from(hours));
        let collection = self.engine.collection_for(name).await;
        self.engine
            .store()
            .count(&collection, &JobFilter::for_queue(name).created_since(since))
            .await
    }

    /// Page through the jobs of queue `name` created since midnight UTC,
    /// `last_n_days` days ago.
    pub async fn get_paginated_executed_queue(
        &self,
        name: &str,
        query: &ExecutedQueueQuery,
    ) -> PopqResult<Vec<JobRecord>> {
        let day = (Utc::now() - ChronoDuration::days(i64::from(query.last_n_days))).date_naive();
        let since = day
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc())
            .ok_or_else(|| PopqError::config("Invalid executed queue window"))?;

        let mut filter = JobFilter::for_queue(name).created_since(since);
        if let Some(term) = query.search.as_deref().filter(|t| !t.trim().is_empty()) {
            filter = filter.with_search(PayloadSearch {
                term: term.to_string(),
                fields: self.config.search_fields.clone(),
            });
        }
        if let Some(status) = query.status {
            filter = filter.with_status(StatusFilter::Is(status));
        }

        let collection = self.engine.collection_for(name).await;
        self.engine
            .store()
            .query(&collection, &filter, query.sort, query.skip, query.limit)
            .await
    }

    /// Force job `id` back onto queue `name`, even if it is terminal.
    pub async fn requeue_job(&self, name: &str, id: &str) -> PopqResult<JobRecord> {
        self.engine.requeue(name, id).await
    }

    /// Pick and handle one job from `name`, outside the poll loop.
    pub async fn run(&self, name: &str) -> PopqResult<RunOutcome> {
        self.scheduler.run(name).await
    }

    /// Sweep all registered queues until idle. Returns the number of jobs
    /// handled.
    pub async fn drain(&self) -> PopqResult<usize> {
        self.scheduler.drain().await
    }

    /// Run one reconciliation pass now.
    pub async fn reconcile(&self) -> PopqResult<usize> {
        self.scheduler.reconcile().await
    }

    /// Ping both stores.
    pub async fn health_check(&self) -> PopqResult<()> {
        self.engine.queue().health_check().await?;
        self.engine.store().health_check().await
    }

    /// The error that stopped the poll loop, if any.
    pub async fn last_error(&self) -> Option<String> {
        self.scheduler.last_error().await
    }

    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PopQueueConfig {
        &self.config
    }
}

impl Drop for PopQueue {
    fn drop(&mut self) {
        // No async in Drop: abort the poll loop instead of waiting for it.
        if self.scheduler.is_running() {
            tracing::warn!("PopQueue dropped while running. Call stop() for a graceful shutdown.");
            self.scheduler.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::job_id_floor;
    use crate::queue::InMemoryQueueStore;
    use crate::store::{InMemoryJobStore, SortField, SortOrder};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::sleep;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        queue: PopQueue,
        queue_store: Arc<InMemoryQueueStore>,
        job_store: Arc<InMemoryJobStore>,
    }

    fn harness(config: PopQueueConfig) -> Harness {
        let queue_store = Arc::new(InMemoryQueueStore::new());
        let job_store = Arc::new(InMemoryJobStore::new());
        let queue = PopQueue::with_stores(config, queue_store.clone(), job_store.clone()).unwrap();
        Harness {
            queue,
            queue_store,
            job_store,
        }
    }

    async fn record(h: &Harness, id: &str) -> JobRecord {
        h.job_store
            .find_by_id("pop_queues", id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unregistered_runner_requeues_job() {
        let h = harness(PopQueueConfig::testing());
        let id = h.queue.enqueue(&json!({"to": "x"}), "emails").await.unwrap();

        let outcome = h.queue.run("emails").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Retried(_)));

        let job = record(&h, &id).await;
        assert_eq!(job.status, None);
        assert_eq!(job.failed_reason[0].reason, "Runner emails not defined");
        assert_eq!(h.queue.get_queue_length("emails").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_limit_one_fails_terminally() {
        let h = harness(PopQueueConfig::testing().with_retry_limit(1));
        h.queue
            .define(
                "a",
                |_job: JobRecord| async { Err::<(), PopqError>(PopqError::handler("boom")) },
                RunnerOptions::default(),
            )
            .await
            .unwrap();
        let id = h.queue.enqueue(&json!({}), "a").await.unwrap();

        assert_eq!(h.queue.drain().await.unwrap(), 1);

        let job = record(&h, &id).await;
        assert_eq!(job.status, Some(JobStatus::Failed));
        assert_eq!(job.failed_reason.len(), 1);
        assert_eq!(job.failed_reason[0].reason, "boom");
        assert_eq!(h.queue.get_queue_length("a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slow_handler_times_out_and_retries() {
        let h = harness(PopQueueConfig::testing());
        h.queue
            .define(
                "slow",
                |_job: JobRecord| async {
                    sleep(Duration::from_secs(2)).await;
                    Ok::<(), PopqError>(())
                },
                RunnerOptions::default().with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        let id = h.queue.enqueue(&json!({}), "slow").await.unwrap();

        let outcome = h.queue.run("slow").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Retried(_)));

        let job = record(&h, &id).await;
        assert_eq!(job.failed_reason.last().unwrap().reason, "Timeout");
        assert_eq!(job.run_history.len(), 1);
        assert_eq!(h.queue.get_queue_length("slow").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_loop_drains_busy_queue_and_goes_idle() {
        let h = harness(PopQueueConfig::testing());
        for name in ["a", "b"] {
            h.queue
                .define(name, |_job: JobRecord| async { Ok::<(), PopqError>(()) }, RunnerOptions::default())
                .await
                .unwrap();
        }
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(h.queue.enqueue(&json!({ "i": i }), "a").await.unwrap());
        }

        h.queue.start().await.unwrap();

        let mut done = 0;
        for _ in 0..100 {
            done = 0;
            for id in &ids {
                if record(&h, id).await.status == Some(JobStatus::Done) {
                    done += 1;
                }
            }
            if done == ids.len() && !h.queue.scheduler.is_draining() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(done, 3);
        assert_eq!(h.queue.get_queue_length("a").await.unwrap(), 0);
        assert!(h.queue.is_running());
        h.queue.stop().await.unwrap();
        assert!(!h.queue.is_running());
    }

    #[tokio::test]
    async fn test_define_after_start_is_rejected() {
        let h = harness(PopQueueConfig::testing());
        h.queue.start().await.unwrap();

        let err = assert_err!(
            h.queue
                .define("late", |_job: JobRecord| async { Ok::<(), PopqError>(()) }, RunnerOptions::default())
                .await
        );
        assert!(matches!(err, PopqError::RegistryClosed { .. }));
        h.queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = PopQueueConfig::default();
        config.scheduler.rearm_interval_ms = 0;
        assert!(matches!(
            PopQueue::new(config),
            Err(PopqError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_current_queue_skips_malformed_entries() {
        let h = harness(PopQueueConfig::testing());
        let first = h.queue.enqueue(&json!({"n": 1}), "a").await.unwrap();
        h.queue_store.push("a", "{broken").await.unwrap();
        let second = h.queue.enqueue(&json!({"n": 2}), "a").await.unwrap();

        let current = h.queue.get_current_queue("a").await.unwrap();
        let ids: Vec<_> = current.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(h.queue.get_queue_length("a").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_count_in_last_n_hours() {
        let h = harness(PopQueueConfig::testing());
        h.queue.enqueue(&json!({}), "a").await.unwrap();
        h.queue.enqueue(&json!({}), "b").await.unwrap();

        let mut old = JobRecord::new("a", json!({}));
        old.id = job_id_floor(Utc::now() - ChronoDuration::hours(3));
        h.job_store.insert("pop_queues", &old).await.unwrap();

        assert_eq!(h.queue.get_count_in_last_n_hours("a", 1).await.unwrap(), 1);
        assert_eq!(h.queue.get_count_in_last_n_hours("a", 4).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_paginated_executed_queue() {
        let h = harness(PopQueueConfig::testing().with_retry_limit(1));
        h.queue
            .define(
                "media",
                |job: JobRecord| async move {
                    if job.data["fail"].as_bool().unwrap_or(false) {
                        return Err(PopqError::handler("transcode failed"));
                    }
                    Ok(())
                },
                RunnerOptions::default(),
            )
            .await
            .unwrap();

        let mut ids = Vec::new();
        for i in 0..4 {
            let payload = json!({"mediaId": format!("m-{}", i), "contentNumber": 40 + i, "fail": i == 3});
            ids.push(h.queue.enqueue(&payload, "media").await.unwrap());
        }
        let mut old = JobRecord::new("media", json!({"mediaId": "m-0"}));
        old.id = job_id_floor(Utc::now() - ChronoDuration::days(5));
        h.job_store.insert("pop_queues", &old).await.unwrap();

        assert_eq!(h.queue.drain().await.unwrap(), 4);

        let all = h
            .queue
            .get_paginated_executed_queue("media", &ExecutedQueueQuery::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].id, ids[3]);

        let page = h
            .queue
            .get_paginated_executed_queue(
                "media",
                &ExecutedQueueQuery::default()
                    .with_sort(JobSort::new(SortField::Id, SortOrder::Ascending))
                    .with_page(1, 2),
            )
            .await
            .unwrap();
        let page_ids: Vec<_> = page.iter().map(|r| r.id.clone()).collect();
        assert_eq!(page_ids, ids[1..3].to_vec());

        let failed = h
            .queue
            .get_paginated_executed_queue(
                "media",
                &ExecutedQueueQuery::default().with_status(JobStatus::Failed),
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failed_reason[0].reason, "transcode failed");

        let by_media = h
            .queue
            .get_paginated_executed_queue("media", &ExecutedQueueQuery::default().with_search("m-0"))
            .await
            .unwrap();
        assert_eq!(by_media.len(), 1);

        let by_number = h
            .queue
            .get_paginated_executed_queue("media", &ExecutedQueueQuery::default().with_search("42"))
            .await
            .unwrap();
        assert_eq!(by_number[0].id, ids[2]);

        let wide = h
            .queue
            .get_paginated_executed_queue(
                "media",
                &ExecutedQueueQuery::default()
                    .with_last_n_days(7)
                    .with_search("m-0"),
            )
            .await
            .unwrap();
        assert_eq!(wide.len(), 2);
    }

    #[tokio::test]
    async fn test_requeue_job_reactivates_done_job() {
        let h = harness(PopQueueConfig::testing());
        h.queue
            .define("a", |_job: JobRecord| async { Ok::<(), PopqError>(()) }, RunnerOptions::default())
            .await
            .unwrap();
        let id = h.queue.enqueue(&json!({}), "a").await.unwrap();
        h.queue.drain().await.unwrap();
        assert_eq!(record(&h, &id).await.status, Some(JobStatus::Done));

        let job = h.queue.requeue_job("a", &id).await.unwrap();
        assert_eq!(job.status, None);
        assert_eq!(job.finished_at, None);
        assert_eq!(h.queue.get_current_queue("a").await.unwrap()[0].id, id);

        h.queue.drain().await.unwrap();
        let job = record(&h, &id).await;
        assert_eq!(job.status, Some(JobStatus::Done));
        assert_eq!(job.attempts, 2);
        assert_eq!(job.run_history.len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_recovers_lost_entry() {
        let h = harness(
            PopQueueConfig::testing().with_scheduler(
                crate::config::SchedulerConfig::default()
                    .with_default_timeout_ms(1_000)
                    .with_reconcile(60_000, 1_000),
            ),
        );
        h.queue
            .define("a", |_job: JobRecord| async { Ok::<(), PopqError>(()) }, RunnerOptions::default())
            .await
            .unwrap();

        let mut lost = JobRecord::new("a", json!({}));
        lost.created_on = Utc::now() - ChronoDuration::minutes(5);
        h.job_store.insert("pop_queues", &lost).await.unwrap();

        assert_eq!(h.queue.reconcile().await.unwrap(), 1);
        assert_eq!(h.queue.drain().await.unwrap(), 1);
        assert_eq!(record(&h, &lost.id).await.status, Some(JobStatus::Done));
    }

    #[tokio::test]
    async fn test_worker_collection_unknown_to_producer() {
        let queue_store = Arc::new(InMemoryQueueStore::new());
        let job_store = Arc::new(InMemoryJobStore::new());
        let producer =
            PopQueue::with_stores(PopQueueConfig::testing(), queue_store.clone(), job_store.clone())
                .unwrap();
        let worker =
            PopQueue::with_stores(PopQueueConfig::testing(), queue_store.clone(), job_store.clone())
                .unwrap();
        worker
            .define(
                "reports",
                |_job: JobRecord| async { Ok::<(), PopqError>(()) },
                RunnerOptions::default().with_collection("report_jobs"),
            )
            .await
            .unwrap();

        let id = producer.enqueue(&json!({"report": 1}), "reports").await.unwrap();
        assert_eq!(worker.drain().await.unwrap(), 1);
        assert_eq!(worker.get_queue_length("reports").await.unwrap(), 0);

        let job = job_store.find_by_id("pop_queues", &id).await.unwrap().unwrap();
        assert_eq!(job.status, Some(JobStatus::Done));
        assert_eq!(worker.reconcile().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_configured_collection_shared_by_processes() {
        let queue_store = Arc::new(InMemoryQueueStore::new());
        let job_store = Arc::new(InMemoryJobStore::new());
        let config = PopQueueConfig::testing().with_store(
            crate::config::StoreConfig::default().with_queue_collection("reports", "report_jobs"),
        );
        let producer =
            PopQueue::with_stores(config.clone(), queue_store.clone(), job_store.clone()).unwrap();
        let worker = PopQueue::with_stores(config, queue_store.clone(), job_store.clone()).unwrap();
        worker
            .define("reports", |_job: JobRecord| async { Ok::<(), PopqError>(()) }, RunnerOptions::default())
            .await
            .unwrap();

        let id = producer.enqueue(&json!({}), "reports").await.unwrap();
        assert!(job_store.find_by_id("report_jobs", &id).await.unwrap().is_some());
        assert_eq!(producer.get_count_in_last_n_hours("reports", 1).await.unwrap(), 1);

        assert_eq!(worker.drain().await.unwrap(), 1);
        let done = producer
            .get_paginated_executed_queue(
                "reports",
                &ExecutedQueueQuery::default().with_status(JobStatus::Done),
            )
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, id);
    }

    #[tokio::test]
    async fn test_health_check() {
        let h = harness(PopQueueConfig::testing());
        assert_ok!(h.queue.health_check().await);
        assert!(h.queue.last_error().await.is_none());
    }
}
