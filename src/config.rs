//! Configuration types for popq.
//!
//! This module contains the settings for the backing stores, the retry
//! policy, the poll loop scheduler, and logging.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration for a [`PopQueue`](crate::core::PopQueue).
///
/// # Examples
///
/// ```rust
/// use popq::config::{PopQueueConfig, SchedulerConfig};
///
/// let config = PopQueueConfig::default()
///     .with_retry_limit(5)
///     .with_scheduler(SchedulerConfig::default().with_rearm_interval_ms(5_000));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopQueueConfig {
    /// Backing store locations and names
    pub store: StoreConfig,

    /// A job is retried while `attempts < retry_limit`
    pub retry_limit: u32,

    /// Poll loop settings
    pub scheduler: SchedulerConfig,

    /// Payload sub-fields matched by the executed-queue search
    pub search_fields: Vec<String>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for PopQueueConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            retry_limit: 3,
            scheduler: SchedulerConfig::default(),
            search_fields: vec!["mediaId".to_string(), "contentNumber".to_string()],
            logging: LoggingConfig::default(),
        }
    }
}

impl PopQueueConfig {
    /// Create a configuration for tests: fast timers, quick store retries.
    pub fn testing() -> Self {
        Self {
            scheduler: SchedulerConfig {
                rearm_interval_ms: 50,
                default_timeout_ms: 5_000,
                reconcile_interval_ms: 60_000,
                reconcile_stale_after_ms: 60_000,
                store_retry_attempts: 2,
                store_retry_base_delay_ms: 5,
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set the retry limit.
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Replace the store configuration.
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Replace the scheduler configuration.
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Replace the payload fields used by search.
    pub fn with_search_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.store.collection_name.is_empty() {
            errors.push("Collection name must not be empty".to_string());
        }

        if self.store.database_name.is_empty() {
            errors.push("Database name must not be empty".to_string());
        }

        if let Some(name) = self
            .store
            .queue_collections
            .iter()
            .find_map(|(name, collection)| collection.is_empty().then_some(name))
        {
            errors.push(format!("Collection for queue '{}' must not be empty", name));
        }

        if self.store.key_prefix.is_empty() {
            errors.push("Queue key prefix must not be empty".to_string());
        }

        if self.scheduler.rearm_interval_ms == 0 {
            errors.push("Re-arm interval must be greater than 0".to_string());
        }

        if self.scheduler.default_timeout_ms == 0 {
            errors.push("Default handler timeout must be greater than 0".to_string());
        }

        if self.scheduler.reconcile_interval_ms == 0 {
            errors.push("Reconcile interval must be greater than 0".to_string());
        }

        if self.scheduler.reconcile_stale_after_ms < self.scheduler.default_timeout_ms {
            errors.push(
                "Reconcile staleness threshold must not be shorter than the handler timeout"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Where and under which names jobs are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    pub redis_url: Option<String>,

    /// MongoDB connection string (e.g., "mongodb://localhost:27017")
    pub mongo_url: Option<String>,

    /// Database holding the job collections
    pub database_name: String,

    /// Default collection for job records
    pub collection_name: String,

    /// Queue name to collection, for queues kept outside the default one.
    /// Shared by every process using the same stores, so producers and
    /// workers agree without defining runners.
    #[serde(default)]
    pub queue_collections: BTreeMap<String, String>,

    /// Queue keys are `<key_prefix>:<queue name>`
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            mongo_url: None,
            database_name: "circle".to_string(),
            collection_name: "pop_queues".to_string(),
            queue_collections: BTreeMap::new(),
            key_prefix: "pop:queue".to_string(),
        }
    }
}

impl StoreConfig {
    /// Set the Redis connection string.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Set the MongoDB connection string.
    pub fn with_mongo_url(mut self, url: impl Into<String>) -> Self {
        self.mongo_url = Some(url.into());
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, name: impl Into<String>) -> Self {
        self.database_name = name.into();
        self
    }

    /// Set the default collection name.
    pub fn with_collection(mut self, name: impl Into<String>) -> Self {
        self.collection_name = name.into();
        self
    }

    /// Keep the records of queue `queue` in `collection`.
    pub fn with_queue_collection(
        mut self,
        queue: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        self.queue_collections.insert(queue.into(), collection.into());
        self
    }

    /// Configured collection for queue `name`, or the default one.
    pub fn collection_for(&self, name: &str) -> &str {
        self.queue_collections
            .get(name)
            .map_or(self.collection_name.as_str(), String::as_str)
    }
}

/// Poll loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the timer that restarts an idle loop (in milliseconds)
    pub rearm_interval_ms: u64,

    /// Handler budget when a runner sets none (in milliseconds)
    pub default_timeout_ms: u64,

    /// Period of the reconciliation pass (in milliseconds)
    pub reconcile_interval_ms: u64,

    /// Non-terminal jobs idle for longer than this without a queue entry are
    /// re-pushed by reconciliation (in milliseconds)
    pub reconcile_stale_after_ms: u64,

    /// Attempts for a `finish`/`fail` write after a handler ran
    pub store_retry_attempts: u32,

    /// Base delay between those attempts (in milliseconds)
    pub store_retry_base_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rearm_interval_ms: 15_000,         // 15 seconds
            default_timeout_ms: 600_000,       // 10 minutes
            reconcile_interval_ms: 300_000,    // 5 minutes
            reconcile_stale_after_ms: 3_600_000, // 1 hour
            store_retry_attempts: 3,
            store_retry_base_delay_ms: 200,
        }
    }
}

impl SchedulerConfig {
    /// Set the re-arm interval.
    pub fn with_rearm_interval_ms(mut self, interval_ms: u64) -> Self {
        self.rearm_interval_ms = interval_ms;
        self
    }

    /// Set the default handler timeout.
    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Set the reconciliation interval and staleness threshold.
    pub fn with_reconcile(mut self, interval_ms: u64, stale_after_ms: u64) -> Self {
        self.reconcile_interval_ms = interval_ms;
        self.reconcile_stale_after_ms = stale_after_ms;
        self
    }

    pub fn rearm_interval(&self) -> Duration {
        self.rearm_interval_ms.millis()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout_ms.millis()
    }

    pub fn reconcile_interval(&self) -> Duration {
        self.reconcile_interval_ms.millis()
    }

    pub fn reconcile_stale_after(&self) -> Duration {
        self.reconcile_stale_after_ms.millis()
    }
}

/// Per-queue runner options given to `define`.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Handler budget; the scheduler default applies when `None`
    pub timeout: Option<Duration>,

    /// Collection for this queue's records, taking precedence over
    /// [`StoreConfig::queue_collections`] in this process
    pub collection_name: Option<String>,
}

impl RunnerOptions {
    /// Set the handler timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set an alternate collection name.
    pub fn with_collection(mut self, name: impl Into<String>) -> Self {
        self.collection_name = Some(name.into());
        self
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Helper trait for converting durations in configuration.
pub trait DurationExt {
    /// Convert milliseconds to Duration
    fn millis(self) -> Duration;
}

impl DurationExt for u64 {
    fn millis(self) -> Duration {
        Duration::from_millis(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PopQueueConfig::default();
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.store.collection_name, "pop_queues");
        assert_eq!(config.store.database_name, "circle");
        assert_eq!(config.store.key_prefix, "pop:queue");
        assert_eq!(config.scheduler.rearm_interval(), Duration::from_secs(15));
        assert_eq!(config.scheduler.default_timeout(), Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_config() {
        let config = PopQueueConfig::testing();
        assert_eq!(config.scheduler.rearm_interval_ms, 50);
        assert!(matches!(config.logging.level, LogLevel::Debug));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = PopQueueConfig::default();
        config.scheduler.rearm_interval_ms = 0;
        config.store.collection_name.clear();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("Re-arm")));
        assert!(errors.iter().any(|e| e.contains("Collection")));
    }

    #[test]
    fn test_stale_threshold_must_cover_timeout() {
        let config = PopQueueConfig::default()
            .with_scheduler(SchedulerConfig::default().with_reconcile(1_000, 1_000));
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("staleness")));
    }

    #[test]
    fn test_builders() {
        let config = PopQueueConfig::default()
            .with_retry_limit(1)
            .with_store(
                StoreConfig::default()
                    .with_redis_url("redis://localhost:6379")
                    .with_collection("jobs"),
            )
            .with_search_fields(["orderId"]);
        assert_eq!(config.retry_limit, 1);
        assert_eq!(config.store.collection_name, "jobs");
        assert_eq!(config.search_fields, vec!["orderId".to_string()]);

        let options = RunnerOptions::default()
            .with_timeout(Duration::from_millis(100))
            .with_collection("emails_jobs");
        assert_eq!(options.timeout, Some(Duration::from_millis(100)));
        assert_eq!(options.collection_name.as_deref(), Some("emails_jobs"));
    }

    #[test]
    fn test_queue_collections() {
        let store = StoreConfig::default().with_queue_collection("reports", "report_jobs");
        assert_eq!(store.collection_for("reports"), "report_jobs");
        assert_eq!(store.collection_for("emails"), "pop_queues");

        let config = PopQueueConfig::default()
            .with_store(StoreConfig::default().with_queue_collection("reports", ""));
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("'reports'")));
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = PopQueueConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: PopQueueConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.retry_limit, config.retry_limit);
        assert_eq!(parsed.store.key_prefix, config.store.key_prefix);
    }

    #[test]
    fn test_duration_ext() {
        assert_eq!(1500u64.millis(), Duration::from_millis(1500));
    }
}
