//! Job listing and lifecycle operations behind the HTTP routes.

use futures::StreamExt;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

use crate::db::{JobStore, StoreError};
use crate::dispatch::{CancelOutcome, DispatchError, Dispatcher};
use crate::job::{Job, JobError, JobStatus};

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("Job {0} not found")]
    NotFound(Ulid),
    #[error("Job {0} has not been downloaded yet")]
    NotDownloaded(Ulid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Debug, Clone)]
pub struct JobService {
    store: JobStore,
    dispatcher: Dispatcher,
    downloads_path: Arc<PathBuf>,
    restart_delay: Duration,
}

impl JobService {
    pub fn new(
        store: JobStore,
        dispatcher: Dispatcher,
        downloads_path: PathBuf,
        restart_delay: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            downloads_path: Arc::new(downloads_path),
            restart_delay,
        }
    }

    async fn require(&self, id: Ulid) -> Result<Job, ServiceError> {
        Job::find(&self.store, id)
            .await?
            .ok_or(ServiceError::NotFound(id))
    }

    /// Every stored job, ordered by status and then by last update, oldest first.
    ///
    /// Records that can't be read are logged and left out rather than failing the listing.
    pub async fn list(&self) -> Result<Vec<Job>, ServiceError> {
        let mut jobs: Vec<Job> = self
            .store
            .scan()
            .await?
            .filter_map(|record| async move {
                match record {
                    Ok(payload) => Some(Job::materialize(&payload)),
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable job record");
                        None
                    }
                }
            })
            .collect()
            .await;
        jobs.sort_by(|a, b| {
            (a.status.as_str(), a.last_update).cmp(&(b.status.as_str(), b.last_update))
        });
        Ok(jobs)
    }

    /// Queue a download for every new URL in `text`, one per line.
    ///
    /// Blank lines and URLs that already have a job are skipped. Returns the jobs created.
    #[instrument(skip_all)]
    pub async fn add_from_urls(&self, text: &str) -> Result<Vec<Job>, ServiceError> {
        let mut created = Vec::new();

        for url in text.split('\n').map(str::trim).filter(|url| !url.is_empty()) {
            if let Some(existing) = Job::find_by_url(&self.store, url).await? {
                debug!(url, id = ?existing.id, "URL already queued, skipping");
                continue;
            }

            let id = Ulid::new();
            let job = Job {
                id: Some(id),
                ..Job::new(url, self.downloads_path.as_path())
            }
            .save(&self.store)
            .await?;

            let handle = self.dispatcher.dispatch(id)?;

            // a fast worker may already have reported; build on what is stored now
            let mut job = Job::find(&self.store, id).await?.unwrap_or(job);
            job.task_id = Some(handle);
            if job.status == JobStatus::Unset {
                job.status = JobStatus::Pending;
            }
            let job = job.save(&self.store).await?;

            info!(%id, url, task = %handle, "Download queued");
            created.push(job);
        }

        Ok(created)
    }

    /// Cancel the job's task if it still has one, then delete the record and everything
    /// the dispatcher still tracks for it.
    ///
    /// A cancellation error keeps the record. The outcome is `None` for jobs that never
    /// had a task.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: Ulid) -> Result<Option<CancelOutcome>, ServiceError> {
        let job = self.require(id).await?;

        let outcome = match job.task_id {
            Some(handle) => {
                let outcome = self.dispatcher.cancel(handle).map_err(|e| {
                    error!(task = %handle, error = %e, "Failed to revoke task");
                    e
                })?;
                match outcome {
                    CancelOutcome::Revoked => info!(task = %handle, "Task revoked"),
                    CancelOutcome::AlreadyFinished => {
                        warn!(task = %handle, "Task already finished, nothing to revoke")
                    }
                    CancelOutcome::NotTracked => {
                        warn!(task = %handle, "Task unknown to this process, nothing to revoke")
                    }
                }
                Some(outcome)
            }
            None => None,
        };

        job.delete(&self.store).await?;
        let dropped = self.dispatcher.forget(id)?;
        info!(dropped, "Job removed");
        Ok(outcome)
    }

    /// Schedule another fetch of the job after the restart delay.
    ///
    /// Any task still running for it is left alone.
    #[instrument(skip(self))]
    pub async fn restart(&self, id: Ulid) -> Result<Job, ServiceError> {
        let job = self.require(id).await?;
        let handle = self.dispatcher.dispatch_delayed(id, self.restart_delay)?;

        let job = Job {
            task_id: Some(handle),
            ..job
        }
        .save(&self.store)
        .await?;
        info!(task = %handle, delay = ?self.restart_delay, "Job restarted");
        Ok(job)
    }

    /// Where the job's finished file lives. Only the file name part of the stored name is
    /// used, so a record can't point outside its downloads directory.
    pub async fn file_path(&self, id: Ulid) -> Result<PathBuf, ServiceError> {
        let job = self.require(id).await?;
        let name = job
            .filename
            .as_deref()
            .and_then(|name| Path::new(name).file_name())
            .ok_or(ServiceError::NotDownloaded(id))?;

        Ok(job.downloads_dir(&self.downloads_path).join(name))
    }
}
