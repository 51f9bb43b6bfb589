use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

use super::{Shared, TaskHandle, TaskState};
use crate::db::JobStore;
use crate::fetch::{FetchError, FetchRequest, Fetcher};
use crate::job::{Job, ProgressReporter};

/// Events buffered between an engine and the reporter writing them to the store
const PROGRESS_BUFFER: usize = 32;

/// Time an engine gets to wind down after its task is revoked before it is dropped
const CANCEL_GRACE: Duration = Duration::from_secs(2);

pub(super) struct Worker {
    pub index: usize,
    pub shared: Arc<Shared>,
    pub queue: Arc<Mutex<mpsc::UnboundedReceiver<TaskHandle>>>,
    pub store: JobStore,
    pub fetcher: Arc<dyn Fetcher>,
    pub downloads_path: Arc<PathBuf>,
}

impl Worker {
    async fn next(&self) -> Option<TaskHandle> {
        tokio::select! {
            _ = self.shared.shutdown.cancelled() => None,
            handle = async { self.queue.lock().await.recv().await } => handle,
        }
    }

    pub async fn run(self) {
        debug!(worker = self.index, "Worker started");

        while let Some(handle) = self.next().await {
            let Some((job_id, token)) = self.shared.begin(handle) else {
                debug!(worker = self.index, task = %handle, "Skipping revoked task");
                continue;
            };
            let state = self.execute(handle, job_id, token).await;
            self.shared.set_state(handle, state);
        }

        debug!(worker = self.index, "Worker stopped");
    }

    #[instrument(name = "task", skip(self, token), fields(worker = self.index))]
    async fn execute(&self, handle: TaskHandle, job_id: Ulid, token: CancellationToken) -> TaskState {
        let job = match Job::find(&self.store, job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!("Job vanished before its task started");
                return TaskState::Failed;
            }
            Err(e) => {
                error!(error = %e, "Failed to load job");
                return TaskState::Failed;
            }
        };

        let request = FetchRequest {
            job_id,
            url: job.url.clone(),
            output_dir: job.downloads_dir(&self.downloads_path).to_path_buf(),
        };
        info!(url = %request.url, dir = ?request.output_dir, "Starting download");

        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        let reporter = tokio::spawn(ProgressReporter::new(self.store.clone(), job_id).run(rx));

        // the engine owns the only sender, so the reporter drains and stops once the fetch
        // future is gone
        let result = {
            let fetch = self.fetcher.fetch(request, tx, token.clone());
            tokio::pin!(fetch);

            let finished = tokio::select! {
                result = &mut fetch => Some(result),
                _ = token.cancelled() => None,
            };
            match finished {
                Some(result) => result,
                None => match tokio::time::timeout(CANCEL_GRACE, &mut fetch).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Engine ignored cancellation, dropping it");
                        Err(FetchError::Cancelled)
                    }
                },
            }
        };
        if let Err(e) = reporter.await {
            error!(error = %e, "Progress reporter crashed");
        }

        match result {
            Ok(path) => {
                info!(path = ?path, "Download completed");
                TaskState::Succeeded
            }
            Err(FetchError::Cancelled) => {
                info!("Download cancelled");
                TaskState::Revoked
            }
            Err(e) => {
                error!(error = %e, "Download failed");
                TaskState::Failed
            }
        }
    }
}
