//! Direct HTTP download engine
//!
//! For URLs that point straight at a file. Writes to `<target>.part`, resumes with a
//! `Range` request when an attempt dies halfway, and only renames to the final name once
//! the body is complete.

use async_trait::async_trait;
use bytesize::ByteSize;
use futures_util::StreamExt;
use rand::Rng;
use reqwest::{
    Client, StatusCode,
    header::{self, HeaderMap, HeaderValue},
};
use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tokio::{fs::File, io::AsyncWriteExt, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use super::{FetchError, FetchEvent, FetchOptions, FetchRequest, Fetcher, ProgressInfo, part_path};

const REPORT_INTERVAL: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct HttpFetcher {
    client: Client,
    options: FetchOptions,
}

impl HttpFetcher {
    pub fn new(options: FetchOptions) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        match HeaderValue::from_str(&options.accept_language) {
            Ok(value) => {
                headers.insert(header::ACCEPT_LANGUAGE, value);
            }
            Err(e) => warn!(error = %e, "Ignoring invalid Accept-Language value"),
        }

        let client = Client::builder()
            .user_agent(options.user_agent.clone())
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        Ok(Self { client, options })
    }

    fn target_path(&self, request: &FetchRequest) -> PathBuf {
        let (title, ext) = title_and_extension(&request.url);
        let name = self
            .options
            .render_filename(&title, &request.job_id.to_string(), &ext);
        request.output_dir.join(name)
    }

    /// One request. Returns the number of bytes in the part file afterwards.
    async fn attempt(
        &self,
        url: &str,
        part: &Path,
        sink: &mpsc::Sender<FetchEvent>,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError> {
        let resume_from = tokio::fs::metadata(part).await.map_or(0, |m| m.len());

        let mut request = self.client.get(url);
        if resume_from > 0 {
            info!(resume_from, "Attempting to resume download");
            request = request.header(header::RANGE, format!("bytes={resume_from}-"));
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = request.send() => response?,
        };
        trace!(status = %response.status(), "Got response");

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && resume_from > 0 {
            debug!("Server has nothing past the part file, treating it as complete");
            return Ok(resume_from);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let resumed = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        let mut downloaded = if resumed { resume_from } else { 0 };
        let total = response.content_length().map(|len| len + downloaded);

        let mut file = if resumed {
            tokio::fs::OpenOptions::new().append(true).open(part).await?
        } else {
            File::create(part).await?
        };

        match total {
            Some(bytes) => info!(bytes, path = ?part, "Starting download"),
            None => info!(path = ?part, "Starting download of unknown size"),
        }

        let mut meter = Meter::new(downloaded);
        report(sink, meter.progress("downloading", part, downloaded, total)).await;

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(downloaded, "Download cancelled during transfer");
                    file.flush().await?;
                    return Err(FetchError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if meter.due() {
                report(sink, meter.progress("downloading", part, downloaded, total)).await;
            }
        }

        file.flush().await?;
        file.shutdown().await?;
        info!(bytes = downloaded, "Transfer completed");
        Ok(downloaded)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(name = "http_fetch", level = "debug", skip_all, fields(job = %request.job_id, url = %request.url))]
    async fn fetch(
        &self,
        request: FetchRequest,
        sink: mpsc::Sender<FetchEvent>,
        cancel: CancellationToken,
    ) -> Result<PathBuf, FetchError> {
        let target = self.target_path(&request);
        let part = part_path(&target);
        debug!(path = ?target, "Final download path");

        let mut retry = 0;
        loop {
            match self.attempt(&request.url, &part, &sink, &cancel).await {
                Ok(_) => break,
                Err(e) if e.is_transient() && retry < self.options.retries => {
                    retry += 1;
                    let delay = backoff(retry);
                    warn!(
                        error = %e,
                        retry,
                        max_retries = self.options.retries,
                        delay_ms = delay.as_millis() as u64,
                        "Download failed with retryable error"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }

        tokio::fs::rename(&part, &target).await?;
        let size = tokio::fs::metadata(&target).await?.len();

        report(
            &sink,
            ProgressInfo {
                status: Some("finished".into()),
                tmpfilename: Some(part),
                filename: Some(target.clone()),
                downloaded_bytes: Some(size),
                total_bytes: Some(size),
                ..Default::default()
            },
        )
        .await;
        if sink
            .send(FetchEvent::PostProcessed(target.clone()))
            .await
            .is_err()
        {
            trace!("Progress receiver gone before completion");
        }

        Ok(target)
    }
}

async fn report(sink: &mpsc::Sender<FetchEvent>, info: ProgressInfo) {
    if sink.send(FetchEvent::Progress(info)).await.is_err() {
        trace!("Progress receiver gone, continuing without reports");
    }
}

/// Exponential backoff with a little jitter so parallel workers don't retry in lockstep.
fn backoff(retry: u32) -> Duration {
    let base = Duration::from_millis(500).saturating_mul(1 << retry.saturating_sub(1).min(8));
    let jitter = Duration::from_millis(rand::rng().random_range(0..250));
    base.min(MAX_BACKOFF) + jitter
}

/// Title and extension for the output file, taken from the last URL path segment.
fn title_and_extension(url: &str) -> (String, String) {
    let segment = Url::parse(url).ok().and_then(|u| {
        u.path_segments()?
            .filter(|s| !s.is_empty())
            .next_back()
            .map(str::to_owned)
    });
    let name = segment
        .map(|s| {
            urlencoding::decode(&s)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| s.clone())
        })
        .unwrap_or_else(|| "download".to_string())
        .replace(['/', '\\'], "_");

    let path = Path::new(&name);
    let title = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string();
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("bin")
        .to_string();
    (title, ext)
}

/// Tracks transfer rate for the human-readable speed and ETA strings.
struct Meter {
    started: Instant,
    start_bytes: u64,
    last_report: Instant,
}

impl Meter {
    fn new(start_bytes: u64) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            start_bytes,
            last_report: now,
        }
    }

    fn due(&mut self) -> bool {
        if self.last_report.elapsed() >= REPORT_INTERVAL {
            self.last_report = Instant::now();
            true
        } else {
            false
        }
    }

    fn progress(&self, status: &str, part: &Path, downloaded: u64, total: Option<u64>) -> ProgressInfo {
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = (elapsed > 0.0)
            .then(|| downloaded.saturating_sub(self.start_bytes) as f64 / elapsed)
            .filter(|rate| *rate > 0.0);

        ProgressInfo {
            status: Some(status.to_string()),
            tmpfilename: Some(part.to_path_buf()),
            filename: None,
            downloaded_bytes: Some(downloaded),
            total_bytes: total,
            total_bytes_estimate: None,
            speed: rate.map(|r| format!("{}/s", ByteSize::b(r as u64))),
            eta: rate
                .zip(total)
                .map(|(r, total)| format_eta((total.saturating_sub(downloaded) as f64 / r) as u64)),
        }
    }
}

fn format_eta(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}
