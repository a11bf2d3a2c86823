//! Poll loop scheduler.
//!
//! A single logical worker drains every registered queue in round-robin
//! sweeps: one pick per name per sweep, until a whole sweep finds every
//! queue empty. A background task re-arms the loop on a fixed period and
//! runs the reconciliation pass on its own, slower, period.

use crate::config::SchedulerConfig;
use crate::core::lifecycle::{FailOutcome, LifecycleEngine};
use crate::core::registry::{JobHandler, RunnerRegistry};
use crate::error::{PopqError, PopqResult};
use crate::job::{JobId, JobRecord};
use crate::utils::{calculate_backoff, duration_ms};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at, sleep, timeout};

/// Result of one pick-and-dispatch on a single queue.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The queue was empty
    Idle,
    /// The handler succeeded; the record is `done`
    Done(JobRecord),
    /// The job failed and went back to the queue
    Retried(JobRecord),
    /// The job failed permanently
    Failed(JobRecord),
}

impl RunOutcome {
    pub fn is_idle(&self) -> bool {
        matches!(self, RunOutcome::Idle)
    }
}

/// Resets the loop flag when a drain ends, however it ends.
struct LoopGuard<'a>(&'a AtomicBool);

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives the lifecycle engine across all registered queues.
pub struct Scheduler {
    engine: Arc<LifecycleEngine>,
    registry: Arc<RunnerRegistry>,
    config: SchedulerConfig,
    /// A drain is in progress
    loop_running: AtomicBool,
    /// The background task is alive
    is_running: Arc<AtomicBool>,
    /// Stop was requested
    is_stopping: AtomicBool,
    shutdown: Notify,
    /// Jobs picked and not yet settled, across the loop and direct `run`s
    in_flight: RwLock<HashSet<JobId>>,
    /// Held shared from pop until the job is in `in_flight`; reconcile
    /// takes it exclusively so it never sees a popped, untracked job
    pick_gate: RwLock<()>,
    last_error: RwLock<Option<String>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<LifecycleEngine>,
        registry: Arc<RunnerRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            config,
            loop_running: AtomicBool::new(false),
            is_running: Arc::new(AtomicBool::new(false)),
            is_stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
            in_flight: RwLock::new(HashSet::new()),
            pick_gate: RwLock::new(()),
            last_error: RwLock::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Pick one job from `name` and see it through to `finish` or `fail`.
    ///
    /// Works for any name, registered or not. A job picked for a name
    /// without a runner is failed with `Runner <name> not defined`.
    pub async fn run(&self, name: &str) -> PopqResult<RunOutcome> {
        let job = {
            let _gate = self.pick_gate.read().await;
            let Some(job) = self.engine.pick(name).await? else {
                return Ok(RunOutcome::Idle);
            };
            self.in_flight.write().await.insert(job.id.clone());
            job
        };

        let job_id = job.id.clone();
        let outcome = self.dispatch(name, job).await;
        self.in_flight.write().await.remove(&job_id);
        outcome
    }

    async fn dispatch(&self, name: &str, job: JobRecord) -> PopqResult<RunOutcome> {
        let Some(runner) = self.registry.resolve(name).await else {
            let reason = PopqError::RunnerNotDefined {
                name: name.to_string(),
            }
            .to_string();
            tracing::warn!(queue = name, job_id = %job.id, "{}", reason);
            return self.settle_failure(job, &reason).await;
        };

        let budget = runner.timeout.unwrap_or_else(|| self.config.default_timeout());
        match execute(runner.handler, job.clone(), budget).await {
            Ok(()) => {
                let record = self
                    .with_store_retry("finish", &job.id, || self.engine.finish(&job))
                    .await?;
                Ok(RunOutcome::Done(record))
            }
            Err(reason) => self.settle_failure(job, &reason).await,
        }
    }

    async fn settle_failure(&self, job: JobRecord, reason: &str) -> PopqResult<RunOutcome> {
        let outcome = self
            .with_store_retry("fail", &job.id, || {
                self.engine.record_failure(&job, reason, false)
            })
            .await?;

        match outcome {
            FailOutcome::Retried(record) => {
                self.with_store_retry("requeue", &record.id, || self.engine.push_entry(&record))
                    .await?;
                Ok(RunOutcome::Retried(record))
            }
            FailOutcome::Terminal(record) => Ok(RunOutcome::Failed(record)),
        }
    }

    /// Repeat a store write while it fails transiently, backing off
    /// exponentially between attempts.
    async fn with_store_retry<T, F, Fut>(&self, operation: &str, job_id: &str, mut f: F) -> PopqResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PopqResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.store_retry_attempts => {
                    attempt += 1;
                    let backoff_ms = calculate_backoff(attempt, self.config.store_retry_base_delay_ms);
                    tracing::warn!(
                        job_id,
                        operation,
                        attempt,
                        backoff_ms,
                        error = %e,
                        "Store write failed, retrying"
                    );
                    sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sweep all registered queues until one full sweep is idle.
    ///
    /// Returns the number of jobs handled. A call made while another drain
    /// is active does nothing and returns `Ok(0)`.
    ///
    /// Transient store errors count the queue as idle for the sweep; a
    /// dropped queue entry is logged and the sweep moves on. Any other error
    /// stops the drain, is kept for [`last_error`](Self::last_error), and is
    /// returned.
    pub async fn drain(&self) -> PopqResult<usize> {
        if self
            .loop_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Drain already in progress");
            return Ok(0);
        }
        let _guard = LoopGuard(&self.loop_running);

        let names = self.registry.names().await;
        if names.is_empty() {
            return Ok(0);
        }

        let mut handled = 0;
        loop {
            let mut idle = 0;
            for name in &names {
                if self.is_stopping.load(Ordering::Acquire) {
                    return Ok(handled);
                }

                match self.run(name).await {
                    Ok(RunOutcome::Idle) => idle += 1,
                    Ok(_) => handled += 1,
                    Err(e) if e.is_transient() => {
                        tracing::warn!(queue = %name, error = %e, "Store unavailable, skipping queue this sweep");
                        idle += 1;
                    }
                    Err(e) if e.is_entry_fault() => {
                        tracing::error!(queue = %name, error = %e, "Dropped unusable queue entry");
                    }
                    Err(e) => {
                        tracing::error!(queue = %name, error = %e, "Poll loop stopped on fatal error");
                        *self.last_error.write().await = Some(e.to_string());
                        return Err(e);
                    }
                }
            }

            if idle == names.len() {
                tracing::debug!(handled, "All queues idle");
                return Ok(handled);
            }
        }
    }

    /// Re-push stale records that lost their queue entry.
    pub async fn reconcile(&self) -> PopqResult<usize> {
        let names = self.registry.names().await;
        let _gate = self.pick_gate.write().await;
        let in_flight = self.in_flight.read().await.clone();
        let repaired = self
            .engine
            .reconcile(&names, self.config.reconcile_stale_after(), &in_flight)
            .await?;
        if repaired > 0 {
            tracing::info!(repaired, "Reconciliation re-pushed orphaned jobs");
        }
        Ok(repaired)
    }

    /// Start the background task. Drains immediately, then on every re-arm
    /// tick.
    pub async fn start(self: &Arc<Self>) -> PopqResult<()> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PopqError::AlreadyRunning);
        }

        self.is_stopping.store(false, Ordering::Release);
        *self.last_error.write().await = None;

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.background().await });
        *self.handle.lock().await = Some(handle);

        tracing::info!(
            rearm_ms = self.config.rearm_interval_ms,
            reconcile_ms = self.config.reconcile_interval_ms,
            "Poll loop started"
        );
        Ok(())
    }

    async fn background(self: Arc<Self>) {
        let mut rearm = interval(self.config.rearm_interval());
        rearm.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reconcile_every = self.config.reconcile_interval();
        let mut reconcile = interval_at(Instant::now() + reconcile_every, reconcile_every);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = rearm.tick() => {
                    if self.drain().await.is_err() {
                        break;
                    }
                }
                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile().await {
                        tracing::warn!(error = %e, "Reconciliation pass failed");
                    }
                }
            }
        }

        self.is_running.store(false, Ordering::Release);
        tracing::info!("Poll loop stopped");
    }

    /// Signal the background task and wait for it to exit. The job being
    /// handled, if any, is seen through first.
    pub async fn stop(&self) -> PopqResult<()> {
        let handle = self
            .handle
            .lock()
            .await
            .take()
            .ok_or(PopqError::NotRunning)?;

        self.is_stopping.store(true, Ordering::Release);
        self.shutdown.notify_one();

        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Poll loop task ended abnormally");
        }
        self.is_running.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Whether a drain is in progress.
    pub fn is_draining(&self) -> bool {
        self.loop_running.load(Ordering::Acquire)
    }

    /// The error that stopped the poll loop, if any.
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Abort the background task without waiting for it.
    pub(crate) fn abort(&self) {
        if let Ok(mut guard) = self.handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Run `handler` on `job`, racing it against `budget`.
///
/// The handler runs in its own task, so a panic surfaces as a join error
/// and a timed-out handler is aborted. Returns the failure reason on error.
async fn execute(handler: Arc<dyn JobHandler>, job: JobRecord, budget: Duration) -> Result<(), String> {
    let job_id = job.id.clone();
    let mut handle = tokio::spawn(async move { handler.handle(job).await });

    match timeout(budget, &mut handle).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => {
            tracing::error!(job_id = %job_id, error = %e, "Handler failed");
            Err(e.to_string())
        }
        Ok(Err(join_error)) => {
            tracing::error!(job_id = %job_id, error = %join_error, "Handler panicked");
            Err(format!("Handler panicked: {}", join_error))
        }
        Err(_) => {
            handle.abort();
            let err = PopqError::Timeout {
                timeout_ms: duration_ms(budget),
            };
            tracing::error!(job_id = %job_id, timeout_ms = duration_ms(budget), "Handler timed out");
            Err(err.to_string())
        }
    }
}
