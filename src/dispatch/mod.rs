//! Task dispatcher
//!
//! A small in-process task backend: a queue, a pool of workers pulling from it, and a
//! table of task states that answers "is it done yet" and honours revocation. Jobs are
//! only ever referred to by id, a worker loads the job itself when the task starts.

mod worker;

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::db::JobStore;
use crate::fetch::Fetcher;

/// How long a completed task's state stays queryable
const RETENTION: Duration = Duration::from_secs(60 * 60);

/// Opaque handle of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(Ulid);

impl TaskHandle {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskHandle {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting out a delay before it is queued
    Scheduled,
    Queued,
    Running,
    Succeeded,
    Failed,
    Revoked,
}

impl TaskState {
    /// Ready tasks will never run (again).
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Revoked)
    }
}

/// What a cancellation request amounted to. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was pending or running and has been told to stop
    Revoked,
    /// The task had already completed, nothing to do
    AlreadyFinished,
    /// The backend has never seen this handle, e.g. it predates a restart of the process
    NotTracked,
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("Task backend is not running")]
    BackendUnavailable,
    #[error("Task table lock poisoned: {0}")]
    Poisoned(String),
}

impl<T> From<std::sync::PoisonError<MutexGuard<'_, T>>> for DispatchError {
    fn from(err: std::sync::PoisonError<MutexGuard<'_, T>>) -> Self {
        DispatchError::Poisoned(err.to_string())
    }
}

#[derive(Debug)]
struct TaskEntry {
    job_id: Ulid,
    state: TaskState,
    token: CancellationToken,
    /// Set once the state is ready
    finished_at: Option<Instant>,
}

impl TaskEntry {
    fn transition(&mut self, state: TaskState) {
        self.state = state;
        if state.is_ready() && self.finished_at.is_none() {
            self.finished_at = Some(Instant::now());
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.finished_at
            .is_some_and(|at| now.saturating_duration_since(at) > RETENTION)
    }
}

#[derive(Debug)]
struct Shared {
    tasks: Mutex<HashMap<TaskHandle, TaskEntry>>,
    queue: mpsc::UnboundedSender<TaskHandle>,
    shutdown: CancellationToken,
}

impl Shared {
    fn tasks(&self) -> Result<MutexGuard<'_, HashMap<TaskHandle, TaskEntry>>, DispatchError> {
        Ok(self.tasks.lock()?)
    }

    fn ensure_running(&self) -> Result<(), DispatchError> {
        if self.shutdown.is_cancelled() || self.queue.is_closed() {
            Err(DispatchError::BackendUnavailable)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, handle: TaskHandle, state: TaskState) {
        match self.tasks.lock() {
            Ok(mut tasks) => {
                if let Some(entry) = tasks.get_mut(&handle) {
                    // a revocation sticks, whatever the worker thinks happened afterwards
                    if entry.state != TaskState::Revoked {
                        entry.transition(state);
                    }
                }
            }
            Err(e) => warn!(task = %handle, error = %e, "Failed to update task state"),
        }
    }

    /// Move a queued task to running. `None` if it was revoked while waiting.
    fn begin(&self, handle: TaskHandle) -> Option<(Ulid, CancellationToken)> {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(task = %handle, error = %e, "Failed to start task");
                return None;
            }
        };
        let entry = tasks.get_mut(&handle)?;
        if entry.state.is_ready() {
            return None;
        }
        entry.transition(TaskState::Running);
        Some((entry.job_id, entry.token.clone()))
    }

    /// Drop completed tasks that finished more than [`RETENTION`] before `now`.
    fn evict_expired(tasks: &mut HashMap<TaskHandle, TaskEntry>, now: Instant) {
        let before = tasks.len();
        tasks.retain(|_, entry| !entry.expired(now));
        let evicted = before - tasks.len();
        if evicted > 0 {
            debug!(evicted, "Evicted completed tasks");
        }
    }
}

/// Front of the task backend. Cheap to clone; all clones share the same queue and workers.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Start `workers` fetch workers (at least one) on the current runtime. Jobs without
    /// a downloads path of their own are fetched into `downloads_path`.
    pub fn start(
        store: JobStore,
        fetcher: Arc<dyn Fetcher>,
        workers: usize,
        downloads_path: PathBuf,
    ) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            tasks: Mutex::new(HashMap::new()),
            queue,
            shutdown: CancellationToken::new(),
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let downloads_path = Arc::new(downloads_path);
        for index in 0..workers.max(1) {
            let worker = worker::Worker {
                index,
                shared: shared.clone(),
                queue: rx.clone(),
                store: store.clone(),
                fetcher: fetcher.clone(),
                downloads_path: downloads_path.clone(),
            };
            tokio::spawn(worker.run());
        }
        info!(workers = workers.max(1), "Task backend started");

        Self { shared }
    }

    /// Queue a fetch of job `job_id`.
    pub fn dispatch(&self, job_id: Ulid) -> Result<TaskHandle, DispatchError> {
        self.submit(job_id, None)
    }

    /// Queue a fetch of job `job_id` once `delay` has passed.
    pub fn dispatch_delayed(
        &self,
        job_id: Ulid,
        delay: Duration,
    ) -> Result<TaskHandle, DispatchError> {
        self.submit(job_id, Some(delay))
    }

    fn submit(&self, job_id: Ulid, delay: Option<Duration>) -> Result<TaskHandle, DispatchError> {
        self.shared.ensure_running()?;

        let handle = TaskHandle::new();
        let token = self.shared.shutdown.child_token();
        let state = if delay.is_some() {
            TaskState::Scheduled
        } else {
            TaskState::Queued
        };
        {
            let mut tasks = self.shared.tasks()?;
            Shared::evict_expired(&mut tasks, Instant::now());
            tasks.insert(
                handle,
                TaskEntry {
                    job_id,
                    state,
                    token: token.clone(),
                    finished_at: None,
                },
            );
        }

        match delay {
            None => {
                self.shared
                    .queue
                    .send(handle)
                    .map_err(|_| DispatchError::BackendUnavailable)?;
            }
            Some(delay) => {
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!(task = %handle, "Scheduled task revoked before its delay ran out");
                        }
                        _ = tokio::time::sleep(delay) => {
                            shared.set_state(handle, TaskState::Queued);
                            if shared.queue.send(handle).is_err() {
                                shared.set_state(handle, TaskState::Failed);
                            }
                        }
                    }
                });
            }
        }

        info!(job = %job_id, task = %handle, ?delay, "Task dispatched");
        Ok(handle)
    }

    /// Revoke a task unless it already completed.
    ///
    /// A queued task will be skipped; a running one has its fetch torn down. Termination
    /// is requested here and happens asynchronously.
    pub fn cancel(&self, handle: TaskHandle) -> Result<CancelOutcome, DispatchError> {
        self.shared.ensure_running()?;

        let mut tasks = self.shared.tasks()?;
        let Some(entry) = tasks.get_mut(&handle) else {
            debug!(task = %handle, "Cancel requested for unknown task");
            return Ok(CancelOutcome::NotTracked);
        };

        if entry.state.is_ready() {
            return Ok(CancelOutcome::AlreadyFinished);
        }

        entry.transition(TaskState::Revoked);
        entry.token.cancel();
        info!(job = %entry.job_id, task = %handle, "Task revoked");
        Ok(CancelOutcome::Revoked)
    }

    /// Stop every task of `job_id` and drop them from the task table. For jobs that are
    /// gone for good; their handles read as unknown afterwards.
    pub fn forget(&self, job_id: Ulid) -> Result<usize, DispatchError> {
        let mut tasks = self.shared.tasks()?;
        let before = tasks.len();
        tasks.retain(|handle, entry| {
            if entry.job_id != job_id {
                return true;
            }
            if !entry.state.is_ready() {
                debug!(task = %handle, "Revoking task of forgotten job");
                entry.token.cancel();
            }
            false
        });
        Ok(before - tasks.len())
    }

    pub fn state(&self, handle: TaskHandle) -> Result<Option<TaskState>, DispatchError> {
        Ok(self.shared.tasks()?.get(&handle).map(|entry| entry.state))
    }

    /// Whether the task has completed (successfully, with an error, or by revocation).
    /// Unknown handles are not ready.
    pub fn is_ready(&self, handle: TaskHandle) -> Result<bool, DispatchError> {
        Ok(self.state(handle)?.is_some_and(TaskState::is_ready))
    }

    /// Stop the workers and cancel everything in flight.
    pub fn shutdown(&self) {
        info!("Shutting down task backend");
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchError, FetchEvent, FetchRequest, ProgressInfo};
    use crate::job::{Job, JobStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes a small file and reports it like a real engine would.
    #[derive(Default)]
    struct InstantFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for InstantFetcher {
        async fn fetch(
            &self,
            request: FetchRequest,
            sink: mpsc::Sender<FetchEvent>,
            _cancel: CancellationToken,
        ) -> Result<PathBuf, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let path = request.output_dir.join("Clip-abc.mp4");
            tokio::fs::write(&path, vec![7u8; 128]).await?;
            let _ = sink
                .send(FetchEvent::Progress(ProgressInfo {
                    status: Some("finished".into()),
                    total_bytes: Some(128),
                    ..Default::default()
                }))
                .await;
            let _ = sink.send(FetchEvent::PostProcessed(path.clone())).await;
            Ok(path)
        }
    }

    /// Never finishes on its own.
    struct IdleFetcher;

    #[async_trait]
    impl Fetcher for IdleFetcher {
        async fn fetch(
            &self,
            _request: FetchRequest,
            _sink: mpsc::Sender<FetchEvent>,
            cancel: CancellationToken,
        ) -> Result<PathBuf, FetchError> {
            cancel.cancelled().await;
            Err(FetchError::Cancelled)
        }
    }

    /// Pays no attention to its cancellation token.
    struct StubbornFetcher;

    #[async_trait]
    impl Fetcher for StubbornFetcher {
        async fn fetch(
            &self,
            _request: FetchRequest,
            _sink: mpsc::Sender<FetchEvent>,
            _cancel: CancellationToken,
        ) -> Result<PathBuf, FetchError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(FetchError::NoOutput)
        }
    }

    struct BrokenFetcher;

    #[async_trait]
    impl Fetcher for BrokenFetcher {
        async fn fetch(
            &self,
            _request: FetchRequest,
            _sink: mpsc::Sender<FetchEvent>,
            _cancel: CancellationToken,
        ) -> Result<PathBuf, FetchError> {
            Err(FetchError::EngineExited { code: Some(1) })
        }
    }

    async fn wait_for(dispatcher: &Dispatcher, handle: TaskHandle, wanted: TaskState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.state(handle).unwrap() != Some(wanted) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "task never reached {wanted:?}, last seen {:?}",
                dispatcher.state(handle)
            )
        });
    }

    async fn saved_job(store: &JobStore, dir: &std::path::Path) -> Ulid {
        Job::new("https://example.com/v1", dir)
            .save(store)
            .await
            .unwrap()
            .id
            .unwrap()
    }

    #[tokio::test]
    async fn runs_dispatched_job_to_completion() {
        let store = JobStore::memory().await;
        let dir = tempfile::tempdir().unwrap();
        let job_id = saved_job(&store, dir.path()).await;
        let dispatcher = Dispatcher::start(
            store.clone(),
            Arc::new(InstantFetcher::default()),
            2,
            dir.path().to_path_buf(),
        );

        let handle = dispatcher.dispatch(job_id).unwrap();
        wait_for(&dispatcher, handle, TaskState::Succeeded).await;
        assert!(dispatcher.is_ready(handle).unwrap());

        let job = Job::find(&store, job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.filename.as_deref(), Some("Clip-abc.mp4"));
        assert_eq!(job.total_bytes, 128);
    }

    #[tokio::test]
    async fn falls_back_to_default_downloads_path() {
        let store = JobStore::memory().await;
        let dir = tempfile::tempdir().unwrap();
        let job_id = Job {
            downloads_path: None,
            ..Job::new("https://example.com/v1", "/unused")
        }
        .save(&store)
        .await
        .unwrap()
        .id
        .unwrap();
        let dispatcher = Dispatcher::start(
            store.clone(),
            Arc::new(InstantFetcher::default()),
            1,
            dir.path().to_path_buf(),
        );

        let handle = dispatcher.dispatch(job_id).unwrap();
        wait_for(&dispatcher, handle, TaskState::Succeeded).await;
        assert!(dir.path().join("Clip-abc.mp4").exists());
    }

    #[tokio::test]
    async fn revokes_running_task() {
        let store = JobStore::memory().await;
        let dir = tempfile::tempdir().unwrap();
        let job_id = saved_job(&store, dir.path()).await;
        let dispatcher =
            Dispatcher::start(store, Arc::new(IdleFetcher), 1, dir.path().to_path_buf());

        let handle = dispatcher.dispatch(job_id).unwrap();
        wait_for(&dispatcher, handle, TaskState::Running).await;
        assert!(!dispatcher.is_ready(handle).unwrap());

        assert_eq!(dispatcher.cancel(handle).unwrap(), CancelOutcome::Revoked);
        assert!(dispatcher.is_ready(handle).unwrap());

        // the worker is free again once the engine has wound down
        let second = dispatcher.dispatch(job_id).unwrap();
        wait_for(&dispatcher, second, TaskState::Running).await;
        assert_eq!(dispatcher.state(handle).unwrap(), Some(TaskState::Revoked));
    }

    #[tokio::test]
    async fn revoked_queued_task_never_runs() {
        let store = JobStore::memory().await;
        let dir = tempfile::tempdir().unwrap();
        let job_id = saved_job(&store, dir.path()).await;
        let fetcher = Arc::new(InstantFetcher::default());
        let dispatcher =
            Dispatcher::start(store, fetcher.clone(), 1, dir.path().to_path_buf());

        let handle = dispatcher
            .dispatch_delayed(job_id, Duration::from_millis(200))
            .unwrap();
        assert_eq!(dispatcher.state(handle).unwrap(), Some(TaskState::Scheduled));
        assert_eq!(dispatcher.cancel(handle).unwrap(), CancelOutcome::Revoked);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.state(handle).unwrap(), Some(TaskState::Revoked));
    }

    #[tokio::test]
    async fn delayed_task_runs_after_its_delay() {
        let store = JobStore::memory().await;
        let dir = tempfile::tempdir().unwrap();
        let job_id = saved_job(&store, dir.path()).await;
        let fetcher = Arc::new(InstantFetcher::default());
        let dispatcher =
            Dispatcher::start(store, fetcher.clone(), 1, dir.path().to_path_buf());

        let handle = dispatcher
            .dispatch_delayed(job_id, Duration::from_millis(50))
            .unwrap();
        assert!(!dispatcher.is_ready(handle).unwrap());
        wait_for(&dispatcher, handle, TaskState::Succeeded).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_outcomes_for_finished_and_unknown_tasks() {
        let store = JobStore::memory().await;
        let dir = tempfile::tempdir().unwrap();
        let job_id = saved_job(&store, dir.path()).await;
        let dispatcher = Dispatcher::start(
            store,
            Arc::new(InstantFetcher::default()),
            1,
            dir.path().to_path_buf(),
        );

        let handle = dispatcher.dispatch(job_id).unwrap();
        wait_for(&dispatcher, handle, TaskState::Succeeded).await;
        assert_eq!(
            dispatcher.cancel(handle).unwrap(),
            CancelOutcome::AlreadyFinished
        );

        let stranger = TaskHandle::new();
        assert_eq!(
            dispatcher.cancel(stranger).unwrap(),
            CancelOutcome::NotTracked
        );
        assert!(!dispatcher.is_ready(stranger).unwrap());
        assert_eq!(dispatcher.state(stranger).unwrap(), None);
    }

    #[tokio::test]
    async fn engine_failure_marks_task_failed() {
        let store = JobStore::memory().await;
        let dir = tempfile::tempdir().unwrap();
        let job_id = saved_job(&store, dir.path()).await;
        let dispatcher =
            Dispatcher::start(store.clone(), Arc::new(BrokenFetcher), 1, dir.path().to_path_buf());

        let handle = dispatcher.dispatch(job_id).unwrap();
        wait_for(&dispatcher, handle, TaskState::Failed).await;

        // nothing is written back; the job just stops getting updates
        let job = Job::find(&store, job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Unset);
    }

    #[tokio::test]
    async fn missing_job_fails_the_task() {
        let store = JobStore::memory().await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(InstantFetcher::default());
        let dispatcher =
            Dispatcher::start(store, fetcher.clone(), 1, dir.path().to_path_buf());

        let handle = dispatcher.dispatch(Ulid::new()).unwrap();
        wait_for(&dispatcher, handle, TaskState::Failed).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejects_work_after_shutdown() {
        let store = JobStore::memory().await;
        let dir = tempfile::tempdir().unwrap();
        let dispatcher =
            Dispatcher::start(store, Arc::new(IdleFetcher), 1, dir.path().to_path_buf());
        dispatcher.shutdown();

        assert!(matches!(
            dispatcher.dispatch(Ulid::new()),
            Err(DispatchError::BackendUnavailable)
        ));
        assert!(matches!(
            dispatcher.cancel(TaskHandle::new()),
            Err(DispatchError::BackendUnavailable)
        ));
    }

    #[tokio::test]
    async fn engine_ignoring_revocation_is_dropped() {
        let store = JobStore::memory().await;
        let dir = tempfile::tempdir().unwrap();
        let job_id = saved_job(&store, dir.path()).await;
        let dispatcher =
            Dispatcher::start(store, Arc::new(StubbornFetcher), 1, dir.path().to_path_buf());

        let handle = dispatcher.dispatch(job_id).unwrap();
        wait_for(&dispatcher, handle, TaskState::Running).await;
        assert_eq!(dispatcher.cancel(handle).unwrap(), CancelOutcome::Revoked);

        // the only worker only gets to the next task once the stuck engine is gone
        let next = dispatcher.dispatch(job_id).unwrap();
        wait_for(&dispatcher, next, TaskState::Running).await;
    }

    #[tokio::test]
    async fn forget_drops_and_stops_every_task_of_a_job() {
        let store = JobStore::memory().await;
        let dir = tempfile::tempdir().unwrap();
        let job_id = saved_job(&store, dir.path()).await;
        let other_job = saved_job(&store, dir.path()).await;
        let dispatcher =
            Dispatcher::start(store, Arc::new(IdleFetcher), 1, dir.path().to_path_buf());

        let running = dispatcher.dispatch(job_id).unwrap();
        wait_for(&dispatcher, running, TaskState::Running).await;
        let scheduled = dispatcher
            .dispatch_delayed(job_id, Duration::from_secs(60))
            .unwrap();
        let unrelated = dispatcher
            .dispatch_delayed(other_job, Duration::from_secs(60))
            .unwrap();

        assert_eq!(dispatcher.forget(job_id).unwrap(), 2);
        assert_eq!(dispatcher.state(running).unwrap(), None);
        assert_eq!(dispatcher.state(scheduled).unwrap(), None);
        assert_eq!(dispatcher.cancel(running).unwrap(), CancelOutcome::NotTracked);
        assert_eq!(
            dispatcher.state(unrelated).unwrap(),
            Some(TaskState::Scheduled)
        );

        // the worker was released, so new work still runs
        let next = dispatcher.dispatch(other_job).unwrap();
        wait_for(&dispatcher, next, TaskState::Running).await;
    }

    #[tokio::test]
    async fn completed_tasks_expire_after_retention() {
        let store = JobStore::memory().await;
        let dir = tempfile::tempdir().unwrap();
        let job_id = saved_job(&store, dir.path()).await;
        let dispatcher =
            Dispatcher::start(store, Arc::new(IdleFetcher), 1, dir.path().to_path_buf());

        let done = dispatcher.dispatch(job_id).unwrap();
        wait_for(&dispatcher, done, TaskState::Running).await;
        dispatcher.cancel(done).unwrap();
        let pending = dispatcher
            .dispatch_delayed(job_id, Duration::from_secs(60))
            .unwrap();

        let later = Instant::now() + RETENTION + Duration::from_secs(1);
        Shared::evict_expired(&mut dispatcher.shared.tasks().unwrap(), later);

        assert_eq!(dispatcher.state(done).unwrap(), None);
        assert_eq!(dispatcher.state(pending).unwrap(), Some(TaskState::Scheduled));
    }

    #[test]
    fn handle_round_trips_through_text() {
        let handle = TaskHandle::new();
        assert_eq!(handle.to_string().parse::<TaskHandle>().unwrap(), handle);
        assert!("not-a-handle".parse::<TaskHandle>().is_err());
        assert_eq!(
            serde_json::to_string(&handle).unwrap(),
            format!("\"{handle}\"")
        );
    }
}
