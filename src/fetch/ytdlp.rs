//! yt-dlp process driver
//!
//! yt-dlp is told to print one JSON progress line per update and the final file path once
//! it has moved the file into place. Both are tagged so they can be picked out of the rest
//! of its output.

use async_trait::async_trait;
use std::{
    ffi::OsString,
    path::PathBuf,
    process::{ExitStatus, Stdio},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{ChildStdout, Command},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::{FetchError, FetchEvent, FetchOptions, FetchRequest, Fetcher, ProgressInfo};

const PROGRESS_TAG: &str = "[progress]";
const FINAL_TAG: &str = "[final]";

pub struct YtDlp {
    binary: PathBuf,
    options: FetchOptions,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>, options: FetchOptions) -> Self {
        Self {
            binary: binary.into(),
            options,
        }
    }

    fn args(&self, request: &FetchRequest) -> Vec<OsString> {
        let options = &self.options;
        let output = request.output_dir.join(&options.output_template);

        let mut args: Vec<OsString> = vec![
            "--newline".into(),
            "--progress".into(),
            "--color".into(),
            "never".into(),
            "--retries".into(),
            options.retries.to_string().into(),
            "--fragment-retries".into(),
            options.fragment_retries.to_string().into(),
            "--concurrent-fragments".into(),
            options.concurrent_fragments.to_string().into(),
            "--user-agent".into(),
            options.user_agent.clone().into(),
            "--add-header".into(),
            format!("Accept-Language:{}", options.accept_language).into(),
            "--progress-template".into(),
            format!("download:{PROGRESS_TAG}%(progress)j").into(),
            "--print".into(),
            format!("after_move:{FINAL_TAG}%(filepath)s").into(),
            "--output".into(),
            output.into_os_string(),
        ];
        if options.no_playlist {
            args.push("--no-playlist".into());
        }
        args.push("--".into());
        args.push(request.url.clone().into());
        args
    }

    async fn pump(
        stdout: ChildStdout,
        sink: &mpsc::Sender<FetchEvent>,
    ) -> Result<Option<PathBuf>, FetchError> {
        let mut lines = BufReader::new(stdout).lines();
        let mut final_path = None;

        while let Some(line) = lines.next_line().await? {
            match parse_line(&line) {
                Some(event) => {
                    if let FetchEvent::PostProcessed(path) = &event {
                        final_path = Some(path.clone());
                    }
                    if sink.send(event).await.is_err() {
                        trace!("Progress receiver gone, continuing without reports");
                    }
                }
                None => trace!(line = %line, "yt-dlp output"),
            }
        }
        Ok(final_path)
    }
}

/// Turn one line of tagged yt-dlp output into an event.
pub(crate) fn parse_line(line: &str) -> Option<FetchEvent> {
    if let Some(json) = line.strip_prefix(PROGRESS_TAG) {
        match serde_json::from_str::<ProgressInfo>(json) {
            Ok(info) => Some(FetchEvent::Progress(info)),
            Err(e) => {
                warn!(error = %e, "Unparseable progress line from yt-dlp");
                None
            }
        }
    } else {
        line.strip_prefix(FINAL_TAG)
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(|path| FetchEvent::PostProcessed(PathBuf::from(path)))
    }
}

#[async_trait]
impl Fetcher for YtDlp {
    #[instrument(name = "ytdlp", level = "debug", skip_all, fields(job = %request.job_id, url = %request.url))]
    async fn fetch(
        &self,
        request: FetchRequest,
        sink: mpsc::Sender<FetchEvent>,
        cancel: CancellationToken,
    ) -> Result<PathBuf, FetchError> {
        let mut child = Command::new(&self.binary)
            .args(self.args(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        info!(pid = child.id(), "Started yt-dlp");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "tubequeue::ytdlp", "{line}");
                }
            });
        }
        let stdout = child.stdout.take().ok_or(FetchError::NoOutput)?;

        let outcome: Option<Result<(Option<PathBuf>, ExitStatus), FetchError>> = tokio::select! {
            result = async {
                let final_path = Self::pump(stdout, &sink).await?;
                let status = child.wait().await?;
                Ok::<_, FetchError>((final_path, status))
            } => Some(result),
            _ = cancel.cancelled() => None,
        };

        let Some(result) = outcome else {
            info!("Cancelling yt-dlp");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill yt-dlp");
            }
            return Err(FetchError::Cancelled);
        };

        let (final_path, status) = result?;
        if !status.success() {
            return Err(FetchError::EngineExited {
                code: status.code(),
            });
        }
        final_path.ok_or(FetchError::NoOutput)
    }
}
