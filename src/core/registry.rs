//! Runner registry.
//!
//! Maps a queue name to the handler that processes its jobs and the
//! per-queue [`RunnerOptions`]. Definitions live for the process lifetime
//! and are never persisted: handlers must be defined again after a restart,
//! before the poll loop starts.
//!
//! # Examples
//!
//! ```rust
//! use popq::prelude::*;
//!
//! # async fn example() -> PopqResult<()> {
//! let registry = RunnerRegistry::new();
//! registry
//!     .define("emails", |job: JobRecord| async move {
//!         println!("sending {}", job.data);
//!         Ok::<(), PopqError>(())
//!     }, RunnerOptions::default())
//!     .await?;
//! assert!(registry.resolve("emails").await.is_some());
//! # Ok(())
//! # }
//! ```

use crate::config::RunnerOptions;
use crate::error::{PopqError, PopqResult};
use crate::job::JobRecord;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Processes the jobs of one queue.
///
/// Return `Err` to fail the job; the error's message becomes the recorded
/// failure reason. Use [`PopqError::handler`] for custom reasons.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Handle one picked job.
    async fn handle(&self, job: JobRecord) -> PopqResult<()>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PopqResult<()>> + Send + 'static,
{
    async fn handle(&self, job: JobRecord) -> PopqResult<()> {
        (self)(job).await
    }
}

/// A registered queue name with its handler and options.
#[derive(Clone)]
pub struct RunnerDefinition {
    pub name: String,
    pub handler: Arc<dyn JobHandler>,
    pub options: RunnerOptions,
}

impl std::fmt::Debug for RunnerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerDefinition")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// What the scheduler needs to run one job.
#[derive(Clone)]
pub struct ResolvedRunner {
    pub handler: Arc<dyn JobHandler>,
    /// Explicit runner timeout, if any
    pub timeout: Option<Duration>,
}

/// Registry of runners keyed by queue name.
///
/// Names are kept in first-definition order; that order is the sweep order.
/// Once [`close`](Self::close) is called, further definitions are rejected.
#[derive(Debug, Default)]
pub struct RunnerRegistry {
    runners: RwLock<Vec<RunnerDefinition>>,
    closed: AtomicBool,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or overwrite the runner for `name`. Last definition wins.
    pub async fn define<H>(
        &self,
        name: impl Into<String>,
        handler: H,
        options: RunnerOptions,
    ) -> PopqResult<()>
    where
        H: JobHandler,
    {
        self.define_arc(name, Arc::new(handler), options).await
    }

    /// [`define`](Self::define) for an already shared handler.
    pub async fn define_arc(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        options: RunnerOptions,
    ) -> PopqResult<()> {
        let name = name.into();
        if self.is_closed() {
            return Err(PopqError::RegistryClosed { name });
        }

        let definition = RunnerDefinition {
            name: name.clone(),
            handler,
            options,
        };

        let mut runners = self.runners.write().await;
        match runners.iter_mut().find(|r| r.name == name) {
            Some(existing) => {
                tracing::debug!(queue = %name, "Runner redefined");
                *existing = definition;
            }
            None => {
                tracing::debug!(queue = %name, "Runner defined");
                runners.push(definition);
            }
        }
        Ok(())
    }

    /// Look up the runner for `name`. `None` means the name was never
    /// defined, a configuration fault rather than a transient error.
    pub async fn resolve(&self, name: &str) -> Option<ResolvedRunner> {
        let runners = self.runners.read().await;
        runners.iter().find(|r| r.name == name).map(|r| ResolvedRunner {
            handler: Arc::clone(&r.handler),
            timeout: r.options.timeout,
        })
    }

    /// Alternate collection configured for `name`, if any.
    pub async fn collection_name(&self, name: &str) -> Option<String> {
        let runners = self.runners.read().await;
        runners
            .iter()
            .find(|r| r.name == name)
            .and_then(|r| r.options.collection_name.clone())
    }

    /// Registered names in definition order.
    pub async fn names(&self) -> Vec<String> {
        let runners = self.runners.read().await;
        runners.iter().map(|r| r.name.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.runners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Reject all further definitions.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
