//! MongoDB job store.
//!
//! Records live in one collection per configured name inside a single
//! database. Updates use `findOneAndUpdate` so each patch is atomic on its
//! document; nothing spans two documents.
//!
//! Timestamps are stored as BSON dates (millisecond precision), so sorting
//! and date queries on them work server side. Queue entries keep the JSON
//! text form of [`JobRecord`].

use super::{JobFilter, JobPatch, JobSort, JobStore, ReturnDocument, SortField, SortOrder, StatusFilter};
use crate::error::{PopqError, PopqResult};
use crate::job::{FailedReason, JobRecord, JobStatus, RunSnapshot};
use async_trait::async_trait;
use bson::{Bson, DateTime, Document, doc};
use futures::TryStreamExt;
use mongodb::{
    Client, Collection, Database,
    error::{ErrorKind, WriteFailure},
    options::{FindOneAndUpdateOptions, FindOptions},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct FailedReasonRow {
    reason: String,
    time: DateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub(crate) struct RunSnapshotRow {
    #[serde(rename = "pickedAt", default, skip_serializing_if = "Option::is_none")]
    picked_at: Option<DateTime>,
    #[serde(rename = "finishedAt", default, skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<i64>,
}

/// Stored shape of a [`JobRecord`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct JobRow {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    data: serde_json::Value,
    created_on: DateTime,
    #[serde(default)]
    attempts: u32,
    #[serde(rename = "pickedAt", default, skip_serializing_if = "Option::is_none")]
    picked_at: Option<DateTime>,
    #[serde(rename = "finishedAt", default, skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delay: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<JobStatus>,
    #[serde(rename = "failedReason", default, skip_serializing_if = "Vec::is_empty")]
    failed_reason: Vec<FailedReasonRow>,
    #[serde(rename = "runHistory", default, skip_serializing_if = "Vec::is_empty")]
    run_history: Vec<RunSnapshotRow>,
    #[serde(rename = "requeuedAt", default, skip_serializing_if = "Option::is_none")]
    requeued_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collection: Option<String>,
}

impl From<&FailedReason> for FailedReasonRow {
    fn from(reason: &FailedReason) -> Self {
        Self {
            reason: reason.reason.clone(),
            time: DateTime::from_chrono(reason.time),
        }
    }
}

impl From<&RunSnapshot> for RunSnapshotRow {
    fn from(snapshot: &RunSnapshot) -> Self {
        Self {
            picked_at: snapshot.picked_at.map(DateTime::from_chrono),
            finished_at: snapshot.finished_at.map(DateTime::from_chrono),
            status: snapshot.status,
            duration: snapshot.duration,
        }
    }
}

impl From<&JobRecord> for JobRow {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            data: record.data.clone(),
            created_on: DateTime::from_chrono(record.created_on),
            attempts: record.attempts,
            picked_at: record.picked_at.map(DateTime::from_chrono),
            finished_at: record.finished_at.map(DateTime::from_chrono),
            duration: record.duration,
            delay: record.delay,
            status: record.status,
            failed_reason: record.failed_reason.iter().map(Into::into).collect(),
            run_history: record.run_history.iter().map(Into::into).collect(),
            requeued_at: record.requeued_at.map(DateTime::from_chrono),
            collection: record.collection.clone(),
        }
    }
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            data: row.data,
            created_on: row.created_on.to_chrono(),
            attempts: row.attempts,
            picked_at: row.picked_at.map(DateTime::to_chrono),
            finished_at: row.finished_at.map(DateTime::to_chrono),
            duration: row.duration,
            delay: row.delay,
            status: row.status,
            failed_reason: row
                .failed_reason
                .into_iter()
                .map(|r| FailedReason {
                    reason: r.reason,
                    time: r.time.to_chrono(),
                })
                .collect(),
            run_history: row
                .run_history
                .into_iter()
                .map(|s| RunSnapshot {
                    picked_at: s.picked_at.map(DateTime::to_chrono),
                    finished_at: s.finished_at.map(DateTime::to_chrono),
                    status: s.status,
                    duration: s.duration,
                })
                .collect(),
            requeued_at: row.requeued_at.map(DateTime::to_chrono),
            collection: row.collection,
        }
    }
}

/// Map a driver error. Encoding failures concern one document and are not
/// worth repeating; bad arguments are configuration faults. Everything else
/// (network, server selection, server errors) may pass.
fn store_error(context: impl std::fmt::Display, err: mongodb::error::Error) -> PopqError {
    let message = format!("{}: {}", context, err);
    if matches!(
        *err.kind,
        ErrorKind::BsonDeserialization(_) | ErrorKind::BsonSerialization(_)
    ) {
        return PopqError::encoding(message);
    }
    if matches!(*err.kind, ErrorKind::InvalidArgument { .. }) {
        return PopqError::config(message);
    }
    PopqError::io(message, err)
}

/// A job store backed by MongoDB
#[derive(Clone, Debug)]
pub struct MongoJobStore {
    database: Database,
}

impl MongoJobStore {
    /// Connect to `uri` and use database `database_name`.
    pub async fn new(uri: &str, database_name: &str) -> PopqResult<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| PopqError::io(format!("Failed to create MongoDB client: {}", e), e))?;

        info!(database = database_name, "Connected to MongoDB job store");

        Ok(Self {
            database: client.database(database_name),
        })
    }

    /// Use an already connected database handle.
    pub fn with_database(database: Database) -> Self {
        Self { database }
    }

    fn collection(&self, name: &str) -> Collection<JobRow> {
        self.database.collection(name)
    }

    #[cfg(test)]
    pub async fn drop_collection(&self, name: &str) -> Result<(), mongodb::error::Error> {
        self.collection(name).drop(None).await
    }
}

fn to_bson<T: Serialize>(value: &T) -> PopqResult<Bson> {
    bson::to_bson(value).map_err(|e| PopqError::encoding(e.to_string()))
}

fn update_document(patch: &JobPatch) -> PopqResult<Document> {
    let mut set = Document::new();
    if let Some(at) = patch.set_picked_at {
        set.insert("pickedAt", DateTime::from_chrono(at));
    }
    if let Some(at) = patch.set_finished_at {
        set.insert("finishedAt", DateTime::from_chrono(at));
    }
    if let Some(ms) = patch.set_duration {
        set.insert("duration", ms);
    }
    if let Some(ms) = patch.set_delay {
        set.insert("delay", ms);
    }
    if let Some(status) = patch.set_status {
        set.insert("status", status.as_str());
    }
    if let Some(at) = patch.set_requeued_at {
        set.insert("requeuedAt", DateTime::from_chrono(at));
    }

    let mut unset = Document::new();
    for field in &patch.unset {
        unset.insert(field.as_str(), 1);
    }

    let mut push = Document::new();
    if let Some(reason) = &patch.push_failed_reason {
        push.insert("failedReason", to_bson(&FailedReasonRow::from(reason))?);
    }
    if let Some(snapshot) = &patch.push_run_history {
        push.insert("runHistory", to_bson(&RunSnapshotRow::from(snapshot))?);
    }

    let mut update = Document::new();
    if patch.inc_attempts > 0 {
        update.insert("$inc", doc! { "attempts": i64::from(patch.inc_attempts) });
    }
    if !set.is_empty() {
        update.insert("$set", set);
    }
    if !unset.is_empty() {
        update.insert("$unset", unset);
    }
    if !push.is_empty() {
        update.insert("$push", push);
    }
    Ok(update)
}

fn filter_document(filter: &JobFilter) -> Document {
    let mut document = Document::new();
    if let Some(name) = &filter.name {
        document.insert("name", name.as_str());
    }
    if let Some(floor) = &filter.id_gte {
        document.insert("_id", doc! { "$gte": floor.as_str() });
    }
    match filter.status {
        StatusFilter::Any => {}
        StatusFilter::Pending => {
            document.insert("status", doc! { "$exists": false });
        }
        StatusFilter::Is(status) => {
            document.insert("status", status.as_str());
        }
    }
    if let Some(search) = &filter.search {
        let number = search.numeric_term();
        let mut clauses = Vec::new();
        for field in &search.fields {
            let path = format!("data.{}", field);
            let mut by_text = Document::new();
            by_text.insert(path.clone(), search.term.as_str());
            clauses.push(Bson::Document(by_text));
            if let Some(n) = number {
                let mut by_number = Document::new();
                by_number.insert(path, n);
                clauses.push(Bson::Document(by_number));
            }
        }
        if !clauses.is_empty() {
            document.insert("$or", Bson::Array(clauses));
        }
    }
    document
}

fn sort_document(sort: JobSort) -> Document {
    let direction = match sort.order {
        SortOrder::Ascending => 1,
        SortOrder::Descending => -1,
    };
    let mut document = Document::new();
    document.insert(sort.field.as_str(), direction);
    if sort.field != SortField::Id {
        document.insert("_id", direction);
    }
    document
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY_CODE
    )
}

#[async_trait]
impl JobStore for MongoJobStore {
    #[instrument(skip_all, err, fields(collection = collection, job_id = %record.id))]
    async fn insert(&self, collection: &str, record: &JobRecord) -> PopqResult<()> {
        self.collection(collection)
            .insert_one(JobRow::from(record), None)
            .await
            .map_err(|e| {
                if is_duplicate_key(&e) {
                    PopqError::DuplicateId {
                        id: record.id.clone(),
                    }
                } else {
                    store_error("Failed to insert job", e)
                }
            })?;
        Ok(())
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> PopqResult<Option<JobRecord>> {
        let row = self
            .collection(collection)
            .find_one(doc! { "_id": id }, None)
            .await
            .map_err(|e| store_error(format_args!("Failed to load job {}", id), e))?;
        Ok(row.map(Into::into))
    }

    #[instrument(skip_all, err, fields(collection = collection, job_id = id))]
    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: &JobPatch,
        returning: ReturnDocument,
    ) -> PopqResult<JobRecord> {
        let update = update_document(patch)?;
        if update.is_empty() {
            return self
                .find_by_id(collection, id)
                .await?
                .ok_or_else(|| PopqError::NotFound { id: id.to_string() });
        }

        let return_document = match returning {
            ReturnDocument::Before => mongodb::options::ReturnDocument::Before,
            ReturnDocument::After => mongodb::options::ReturnDocument::After,
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(return_document)
            .build();

        self.collection(collection)
            .find_one_and_update(doc! { "_id": id }, update, options)
            .await
            .map_err(|e| store_error(format_args!("Failed to update job {}", id), e))?
            .map(Into::into)
            .ok_or_else(|| PopqError::NotFound { id: id.to_string() })
    }

    async fn query(
        &self,
        collection: &str,
        filter: &JobFilter,
        sort: JobSort,
        skip: u64,
        limit: Option<u64>,
    ) -> PopqResult<Vec<JobRecord>> {
        let options = FindOptions::builder()
            .sort(sort_document(sort))
            .skip(skip)
            .limit(limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
            .build();

        let cursor = self
            .collection(collection)
            .find(filter_document(filter), options)
            .await
            .map_err(|e| store_error("Failed to query jobs", e))?;

        let rows: Vec<JobRow> = cursor
            .try_collect()
            .await
            .map_err(|e| store_error("Failed to read job cursor", e))?;
        let records: Vec<JobRecord> = rows.into_iter().map(Into::into).collect();

        debug!(collection, count = records.len(), "Queried jobs");
        Ok(records)
    }

    async fn count(&self, collection: &str, filter: &JobFilter) -> PopqResult<u64> {
        self.collection(collection)
            .count_documents(filter_document(filter), None)
            .await
            .map_err(|e| store_error("Failed to count jobs", e))
    }

    async fn health_check(&self) -> PopqResult<()> {
        self.database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| PopqError::io(format!("MongoDB health check failed: {}", e), e))?;
        Ok(())
    }
}
