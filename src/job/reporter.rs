//! Applies fetch engine events to a job record.

use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};
use ulid::Ulid;

use super::{Job, JobError};
use crate::db::JobStore;
use crate::fetch::{FetchEvent, ProgressInfo};

/// Bound to one job. Holds nothing but the id and the store, so it can run wherever the
/// engine runs.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    store: JobStore,
    job_id: Ulid,
}

impl ProgressReporter {
    pub fn new(store: JobStore, job_id: Ulid) -> Self {
        Self { store, job_id }
    }

    /// Re-read the record before every change so writes made by others since the task
    /// started (a new task handle after a restart, say) survive. `None` once the job has
    /// been removed.
    async fn current(&self) -> Result<Option<Job>, JobError> {
        let job = Job::find(&self.store, self.job_id).await?;
        if job.is_none() {
            debug!(job = %self.job_id, "Job no longer stored, dropping event");
        }
        Ok(job)
    }

    pub async fn on_progress(&self, info: &ProgressInfo) -> Result<(), JobError> {
        if let Some(job) = self.current().await? {
            trace!(
                job = %self.job_id,
                status = ?info.status,
                bytes = info.downloaded_bytes,
                total = info.total_bytes,
                file = ?info.filename,
                "Download progress"
            );
            job.apply_progress(&self.store, info).await?;
        }
        Ok(())
    }

    pub async fn on_post_process(&self, final_path: &Path) -> Result<(), JobError> {
        debug!(job = %self.job_id, path = ?final_path, "Post hook triggered");
        if let Some(job) = self.current().await? {
            job.apply_completion(&self.store, final_path).await?;
        }
        Ok(())
    }

    pub async fn handle(&self, event: FetchEvent) -> Result<(), JobError> {
        match event {
            FetchEvent::Progress(info) => self.on_progress(&info).await,
            FetchEvent::PostProcessed(path) => self.on_post_process(&path).await,
        }
    }

    /// Apply events until every sender is gone. A failed update is logged and the next
    /// event is still applied.
    #[instrument(name = "progress_reporter", level = "debug", skip_all, fields(job = %self.job_id))]
    pub async fn run(self, mut events: mpsc::Receiver<FetchEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event).await {
                warn!(job = %self.job_id, error = %e, "Failed to record download progress");
            }
        }
        trace!("Progress channel closed");
    }
}
