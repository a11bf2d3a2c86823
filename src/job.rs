//! Job record definitions and identifier helpers.

use crate::error::{PopqError, PopqResult};
use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique, creation-time-ordered job identifier (24-char ObjectId hex).
pub type JobId = String;

/// Terminal status of a job. A queued or in-flight job has no status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Handler completed successfully
    Done,
    /// Retry limit reached
    Failed,
}

impl JobStatus {
    /// Wire representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedReason {
    /// Failure reason
    pub reason: String,
    /// When the failure was recorded
    pub time: DateTime<Utc>,
}

/// Telemetry of a prior attempt, captured when a retry is issued.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSnapshot {
    #[serde(rename = "pickedAt", default, skip_serializing_if = "Option::is_none")]
    pub picked_at: Option<DateTime<Utc>>,
    #[serde(rename = "finishedAt", default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

/// Persisted, authoritative state of one unit of work.
///
/// The same schema is serialized to text for queue entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    /// Unique identifier, assigned at enqueue
    #[serde(rename = "_id")]
    pub id: JobId,
    /// Queue name
    pub name: String,
    /// Opaque producer payload
    pub data: serde_json::Value,
    /// Enqueue time
    pub created_on: DateTime<Utc>,
    /// Number of picks so far
    #[serde(default)]
    pub attempts: u32,
    /// Most recent pick time, cleared on requeue
    #[serde(rename = "pickedAt", default, skip_serializing_if = "Option::is_none")]
    pub picked_at: Option<DateTime<Utc>>,
    #[serde(rename = "finishedAt", default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// `finished_at - picked_at` in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// `finished_at - created_on` in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(rename = "failedReason", default, skip_serializing_if = "Vec::is_empty")]
    pub failed_reason: Vec<FailedReason>,
    #[serde(rename = "runHistory", default, skip_serializing_if = "Vec::is_empty")]
    pub run_history: Vec<RunSnapshot>,
    #[serde(rename = "requeuedAt", default, skip_serializing_if = "Option::is_none")]
    pub requeued_at: Option<DateTime<Utc>>,
    /// Collection the record was inserted into. Travels with queue entries
    /// so a worker finds the record whatever its own configuration says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

impl JobRecord {
    /// Build a fresh record for `name` with a newly generated id.
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: new_job_id(),
            name: name.into(),
            data,
            created_on: Utc::now(),
            attempts: 0,
            picked_at: None,
            finished_at: None,
            duration: None,
            delay: None,
            status: None,
            failed_reason: Vec::new(),
            run_history: Vec::new(),
            requeued_at: None,
            collection: None,
        }
    }

    /// Whether the job reached `done` or `failed`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_some()
    }

    /// Snapshot of the current attempt for the run history.
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            picked_at: self.picked_at,
            finished_at: self.finished_at,
            status: self.status,
            duration: self.duration,
        }
    }

    /// Most recent time anything happened to this job.
    pub fn last_activity(&self) -> DateTime<Utc> {
        [self.picked_at, self.requeued_at]
            .into_iter()
            .flatten()
            .fold(self.created_on, Ord::max)
    }

    /// Serialize into the text form stored in the queue store.
    pub fn to_entry(&self) -> PopqResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a queue entry back into a record.
    pub fn from_entry(entry: &str) -> PopqResult<Self> {
        serde_json::from_str(entry).map_err(|e| PopqError::MalformedEntry {
            message: e.to_string(),
        })
    }
}

/// Generate a new job id.
pub fn new_job_id() -> JobId {
    ObjectId::new().to_hex()
}

/// The smallest id that could have been generated at `at`.
///
/// Ids carry their creation second in the high-order bytes, so
/// `id >= job_id_floor(t)` selects jobs created at or after `t`.
pub fn job_id_floor(at: DateTime<Utc>) -> JobId {
    let secs = at.timestamp().clamp(0, u32::MAX as i64) as u32;
    let mut bytes = [0u8; 12];
    bytes[..4].copy_from_slice(&secs.to_be_bytes());
    ObjectId::from_bytes(bytes).to_hex()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_new_record_defaults() {
        let job = JobRecord::new("emails", json!({"to": "a@b.c"}));
        assert_eq!(job.id.len(), 24);
        assert_eq!(job.attempts, 0);
        assert!(!job.is_terminal());
        assert!(job.failed_reason.is_empty());
    }

    #[test]
    fn test_wire_field_names() {
        let mut job = JobRecord::new("emails", json!({}));
        job.picked_at = Some(Utc::now());
        job.status = Some(JobStatus::Failed);
        let value = serde_json::to_value(&job).unwrap();

        assert!(value.get("_id").is_some());
        assert!(value.get("created_on").is_some());
        assert!(value.get("pickedAt").is_some());
        assert_eq!(value["status"], "failed");
        assert!(value.get("finishedAt").is_none());
        assert!(value.get("runHistory").is_none());
    }

    #[test]
    fn test_malformed_entry() {
        let err = JobRecord::from_entry("{not json").unwrap_err();
        assert!(matches!(err, PopqError::MalformedEntry { .. }));
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let now = Utc::now();
        let floor = job_id_floor(now - Duration::seconds(5));
        let id = new_job_id();
        assert!(id >= floor);
        assert!(job_id_floor(now + Duration::hours(1)) > id);
    }

    #[test]
    fn test_last_activity_is_latest_timestamp() {
        let mut job = JobRecord::new("a", json!(null));
        assert_eq!(job.last_activity(), job.created_on);
        let picked = job.created_on + Duration::seconds(3);
        job.picked_at = Some(picked);
        assert_eq!(job.last_activity(), picked);
        let requeued = picked + Duration::seconds(3);
        job.requeued_at = Some(requeued);
        assert_eq!(job.last_activity(), requeued);

        // picked again after the retry
        let repicked = requeued + Duration::seconds(3);
        job.picked_at = Some(repicked);
        assert_eq!(job.last_activity(), repicked);
    }
}
