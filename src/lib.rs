//! # popq
//!
//! A durable named work-queue for async Rust applications.
//!
//! Producers enqueue jobs with arbitrary JSON payloads on named queues;
//! registered handlers later pick and process them, with automatic retry,
//! failure history, and timeout enforcement.
//!
//! ## Features
//!
//! - **Two stores**: an ordered list per queue name (Redis) hands jobs over,
//!   a document collection (MongoDB) keeps the authoritative job records
//! - **Retries with history**: every failure is recorded; prior attempts are
//!   kept in the run history
//! - **Bounded handlers**: each handler races its timeout and is aborted if
//!   it loses
//! - **Round-robin poll loop**: a single worker drains all queues fairly,
//!   then idles until the next re-arm tick
//! - **Reconciliation**: jobs that lost their queue entry are found and
//!   pushed back
//!
//! ## Quick Start
//!
//! ```rust
//! use popq::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> PopqResult<()> {
//!     let queue = PopQueue::new(PopQueueConfig::default())?;
//!
//!     queue
//!         .define("thumbnails", |job: JobRecord| async move {
//!             println!("rendering {}", job.data["mediaId"]);
//!             Ok::<(), PopqError>(())
//!         }, RunnerOptions::default())
//!         .await?;
//!
//!     queue.enqueue(&json!({"mediaId": "m-1"}), "thumbnails").await?;
//!     assert_eq!(queue.drain().await?, 1);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod job;
pub mod logging;
pub mod queue;
pub mod store;
pub mod utils;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::core::registry::{JobHandler, RunnerRegistry};
    pub use crate::core::{ExecutedQueueQuery, PopQueue, RunOutcome};
    pub use crate::error::{PopqError, PopqResult};
    pub use crate::job::{JobId, JobRecord, JobStatus};
    pub use crate::logging::init_tracing;
    pub use crate::queue::QueueStore;
    pub use crate::store::{JobSort, JobStore, SortField, SortOrder};
    pub use async_trait::async_trait;
}

pub use crate::config::*;
pub use crate::core::registry::{JobHandler, RunnerRegistry};
pub use crate::core::{ExecutedQueueQuery, PopQueue, RunOutcome};
pub use crate::error::{PopqError, PopqResult};
pub use crate::job::{JobId, JobRecord, JobStatus};
pub use crate::queue::QueueStore;
pub use crate::store::{JobSort, JobStore, SortField, SortOrder};
pub use async_trait::async_trait;
