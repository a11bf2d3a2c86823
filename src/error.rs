//! Error types for popq operations.

use thiserror::Error;

/// Result type used throughout popq.
pub type PopqResult<T> = Result<T, PopqError>;

/// Main error type for popq operations.
#[derive(Error, Debug)]
pub enum PopqError {
    /// A backing store could not be reached or rejected the operation
    #[error("Store error: {message}")]
    Io {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No job record matches the given id
    #[error("Job '{id}' not found")]
    NotFound {
        /// The id that was looked up
        id: String,
    },

    /// A job record with this id already exists
    #[error("Job '{id}' already exists")]
    DuplicateId {
        /// The conflicting id
        id: String,
    },

    /// A job was picked for a queue name with no registered runner
    #[error("Runner {name} not defined")]
    RunnerNotDefined {
        /// The queue name
        name: String,
    },

    /// The job handler returned an error. Displays the bare message, which
    /// becomes the recorded failure reason.
    #[error("{message}")]
    Handler {
        /// Error message
        message: String,
    },

    /// The job handler exceeded its time budget
    #[error("Timeout")]
    Timeout {
        /// Budget in milliseconds
        timeout_ms: u64,
    },

    /// A queue entry could not be parsed back into a job record
    #[error("Malformed queue entry: {message}")]
    MalformedEntry {
        /// Parse error message
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record could not be encoded for, or decoded from, the document store
    #[error("Encoding error: {message}")]
    Encoding {
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// Runners can no longer be defined once the poll loop started
    #[error("Runner registry is closed, cannot define '{name}' after start")]
    RegistryClosed {
        /// The queue name that was being defined
        name: String,
    },

    /// The poll loop is already running
    #[error("PopQueue is already running")]
    AlreadyRunning,

    /// The poll loop is not running
    #[error("PopQueue is not running")]
    NotRunning,
}

impl PopqError {
    /// Create a new store I/O error
    pub fn io<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Io {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a handler error; use this from job handlers to fail a job
    /// with a specific reason.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an encoding error
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Whether retrying the same store operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// Whether the error concerns a single unusable queue entry or record
    /// rather than the stores themselves. Such entries are dropped and the
    /// loop moves on; repeating the operation would fail the same way.
    pub fn is_entry_fault(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::MalformedEntry { .. } | Self::Encoding { .. }
        )
    }
}
