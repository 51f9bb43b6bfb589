//! Job model
//!
//! A [`Job`] is one submitted URL and everything known about fetching it. Jobs live in the
//! [`JobStore`] as JSON and are re-read on every access; nothing here caches state between
//! calls, because the HTTP handlers and the fetch workers only ever meet through the store.

mod reporter;
mod status;

use chrono::{Local, NaiveDateTime, TimeDelta, Timelike};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value};
use std::{
    path::{Path, PathBuf},
    pin::pin,
};
use ulid::Ulid;

use crate::db::{JobStore, StoreError};
use crate::dispatch::TaskHandle;
use crate::fetch::{PART_SUFFIX, ProgressInfo};

pub use reporter::ProgressReporter;
pub use status::JobStatus;

/// Seconds without an update after which an unfinished job counts as stuck.
pub const STUCK_AFTER_SECS: i64 = 120;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Failed to serialize job: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Job {
    pub id: Option<Ulid>,
    pub url: String,
    pub title: String,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub status: JobStatus,
    pub speed: String,
    pub eta: String,
    pub task_id: Option<TaskHandle>,
    #[serde(with = "timestamp")]
    pub last_update: Option<NaiveDateTime>,
    pub filename: Option<String>,
    pub downloads_path: Option<PathBuf>,
    /// Derived on load, never read back from storage
    pub stuck: bool,
}

impl Job {
    /// New, unsaved job for `url`. The title starts out as the URL itself.
    pub fn new(url: impl Into<String>, downloads_path: impl Into<PathBuf>) -> Self {
        let url = url.into();
        Self {
            title: url.clone(),
            url,
            downloads_path: Some(downloads_path.into()),
            ..Default::default()
        }
    }

    /// Parse a stored payload.
    ///
    /// Never fails: a field that is missing or has the wrong type falls back to its
    /// default, and a payload that isn't a JSON object at all yields a default job.
    pub fn materialize(payload: &str) -> Self {
        let fields = match serde_json::from_str::<Value>(payload) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                tracing::warn!(kind = ?other, "Stored job is not a JSON object, using defaults");
                Map::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse stored job, using defaults");
                Map::new()
            }
        };

        let text = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_owned);
        let bytes = |key: &str| fields.get(key).and_then(Value::as_u64).unwrap_or_default();

        let mut job = Self {
            id: text("id").and_then(|id| Ulid::from_string(&id).ok()),
            url: text("url").unwrap_or_default(),
            title: text("title").unwrap_or_default(),
            downloaded_bytes: bytes("downloaded_bytes"),
            total_bytes: bytes("total_bytes"),
            status: text("status").map(JobStatus::from).unwrap_or_default(),
            speed: text("speed").unwrap_or_default(),
            eta: text("eta").unwrap_or_default(),
            task_id: text("task_id").and_then(|id| id.parse().ok()),
            last_update: text("last_update")
                .and_then(|ts| NaiveDateTime::parse_from_str(&ts, TIMESTAMP_FORMAT).ok()),
            filename: text("filename").filter(|name| !name.is_empty()),
            downloads_path: text("downloads_path")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            stuck: false,
        };
        job.stuck = job.is_stuck_at(now());
        job
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Stuck means no news for longer than [`STUCK_AFTER_SECS`] on a job that hasn't finished.
    pub fn is_stuck_at(&self, now: NaiveDateTime) -> bool {
        match self.last_update {
            Some(last) => {
                last + TimeDelta::seconds(STUCK_AFTER_SECS) < now && !self.status.is_finished()
            }
            None => false,
        }
    }

    /// Directory the fetched file goes to, falling back to the process-wide default.
    pub fn downloads_dir<'a>(&'a self, default: &'a Path) -> &'a Path {
        self.downloads_path.as_deref().unwrap_or(default)
    }

    /// Write the job under its id, assigning a fresh one first if it has none.
    #[tracing::instrument(level = "debug", skip_all, fields(id = ?self.id, url = %self.url))]
    pub async fn save(mut self, store: &JobStore) -> Result<Self, JobError> {
        let id = *self.id.get_or_insert_with(Ulid::new);
        store.put(&id.to_string(), self.to_json()?).await?;
        Ok(self)
    }

    /// `Ok(None)` when nothing is stored under `id`.
    pub async fn find(store: &JobStore, id: Ulid) -> Result<Option<Self>, StoreError> {
        Ok(store
            .get(&id.to_string())
            .await?
            .map(|payload| Self::materialize(&payload)))
    }

    /// First stored job submitted with exactly this URL.
    ///
    /// A full scan. Records that fail to load are logged and skipped rather than ending
    /// the search early.
    pub async fn find_by_url(store: &JobStore, url: &str) -> Result<Option<Self>, StoreError> {
        let mut records = pin!(store.scan().await?);
        while let Some(record) = records.next().await {
            match record {
                Ok(payload) => {
                    let job = Self::materialize(&payload);
                    if job.url == url {
                        return Ok(Some(job));
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable job record"),
            }
        }
        Ok(None)
    }

    /// Remove the record. Whatever task is still running for it keeps running.
    pub async fn delete(&self, store: &JobStore) -> Result<(), StoreError> {
        if let Some(id) = self.id {
            store.delete(&id.to_string()).await?;
        }
        Ok(())
    }

    /// Fold one engine progress report into the job and persist it.
    pub async fn apply_progress(
        mut self,
        store: &JobStore,
        info: &ProgressInfo,
    ) -> Result<Self, JobError> {
        if let Some(title) = info.tmpfilename.as_deref().and_then(title_from_temp_path) {
            self.title = title;
        }

        self.status = info
            .status
            .as_deref()
            .map(JobStatus::from)
            .unwrap_or(JobStatus::Pending);

        if self.status.is_finished() {
            // finished reports carry the final size, not a running counter
            let size = info.total_bytes.or(info.downloaded_bytes).unwrap_or(0);
            self.downloaded_bytes = size;
            self.total_bytes = size;
        } else {
            self.downloaded_bytes = info.downloaded_bytes.unwrap_or(0);
            self.total_bytes = info
                .total_bytes
                .or(info.total_bytes_estimate.map(|estimate| estimate as u64))
                .unwrap_or(0);
        }

        self.speed = info.speed.clone().unwrap_or_default();
        self.eta = info.eta.clone().unwrap_or_default();
        self.last_update = Some(now());
        self.filename = None;
        self.stuck = false;

        self.save(store).await
    }

    /// Record the final file once the engine is done with it. Leaves the status alone.
    pub async fn apply_completion(
        mut self,
        store: &JobStore,
        final_path: &Path,
    ) -> Result<Self, JobError> {
        let size = tokio::fs::metadata(final_path).await?.len();
        self.filename = final_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        self.downloaded_bytes = size;
        self.total_bytes = size;

        self.save(store).await
    }
}

/// Local wall clock, truncated to whole seconds like the stored form.
fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// `/downloads/Some Clip-abc.mp4.part` -> `Some Clip-abc.mp4`
fn title_from_temp_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    Some(name.strip_suffix(PART_SUFFIX).unwrap_or(name).to_string())
}

mod timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::Serializer;

    // `None` is stored as an empty string so listings sort unset timestamps first
    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.collect_str(&ts.format(TIMESTAMP_FORMAT)),
            None => serializer.serialize_str(""),
        }
    }
}
