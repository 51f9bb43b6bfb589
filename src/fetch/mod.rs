//! Fetch engines
//!
//! The engines are the only code that knows how media actually gets downloaded. Everything
//! else sees them through [`Fetcher`]: hand over a request, receive a stream of
//! [`FetchEvent`]s on a channel, and get the final file path back.

mod http;
mod ytdlp;

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

pub use http::HttpFetcher;
pub use ytdlp::YtDlp;

/// Suffix engines append to files that are still being written.
pub const PART_SUFFIX: &str = ".part";

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Status(reqwest::StatusCode),
    #[error("Engine exited with {}", code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}")))]
    EngineExited { code: Option<i32> },
    #[error("Engine finished without reporting a file")]
    NoOutput,
    #[error("Download cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_body() || e.is_request(),
            Self::Status(status) => status.is_server_error() || status.as_u16() == 429,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// One progress report, shaped like the engine's own progress dictionary.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProgressInfo {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tmpfilename: Option<PathBuf>,
    #[serde(default)]
    pub filename: Option<PathBuf>,
    #[serde(default)]
    pub downloaded_bytes: Option<u64>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    /// Engines report this one as a float
    #[serde(default)]
    pub total_bytes_estimate: Option<f64>,
    #[serde(default, rename = "_speed_str")]
    pub speed: Option<String>,
    #[serde(default, rename = "_eta_str")]
    pub eta: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    /// Repeated while the transfer runs
    Progress(ProgressInfo),
    /// Sent once, after the final file is in place
    PostProcessed(PathBuf),
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub job_id: Ulid,
    pub url: String,
    pub output_dir: PathBuf,
}

/// How every engine is asked to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Retries for transient network errors
    pub retries: u32,
    /// Retries for individual fragments of segmented media
    pub fragment_retries: u32,
    /// Fragments fetched in parallel within one file
    pub concurrent_fragments: u32,
    /// File name template; `%(title)s`, `%(id)s` and `%(ext)s` are substituted
    pub output_template: String,
    pub user_agent: String,
    pub accept_language: String,
    /// Only ever fetch the single item a URL points at
    pub no_playlist: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            retries: 10,
            fragment_retries: 10,
            concurrent_fragments: 1,
            output_template: "%(title)s-%(id)s.%(ext)s".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36".to_string(),
            accept_language: "it-IT,it;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
            no_playlist: true,
        }
    }
}

impl FetchOptions {
    pub fn render_filename(&self, title: &str, id: &str, ext: &str) -> String {
        self.output_template
            .replace("%(title)s", title)
            .replace("%(id)s", id)
            .replace("%(ext)s", ext)
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `request.url` into `request.output_dir`, reporting on `sink`.
    ///
    /// Must stop promptly once `cancel` fires. Send failures on `sink` only mean
    /// nobody is listening anymore and must not abort the transfer.
    async fn fetch(
        &self,
        request: FetchRequest,
        sink: mpsc::Sender<FetchEvent>,
        cancel: CancellationToken,
    ) -> Result<PathBuf, FetchError>;
}

/// `video.mp4` -> `video.mp4.part`
pub fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}
