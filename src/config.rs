//! Config module for tubequeue

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::fetch::{FetchError, FetchOptions, Fetcher, HttpFetcher, YtDlp};

#[derive(ValueEnum, Debug, Clone, Default)]
#[clap(rename_all = "lowercase")]
pub enum DatabaseAuthMethod {
    #[default]
    None,
    Root,
}

#[derive(Parser, Debug, Clone)]
pub struct DatabaseConfig {
    /// Full SurrealDB endpoint, e.g. `mem://` or `surrealkv://./database`.
    /// Overrides the store host/port pair when set.
    #[clap(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Host of the job record store
    #[clap(long, env = "STORE_HOST", default_value = "localhost")]
    pub store_host: String,

    /// Port of the job record store
    #[clap(long, env = "STORE_PORT", default_value_t = 8000)]
    pub store_port: u16,

    #[clap(long, env = "DATABASE_AUTH_METHOD", value_enum, default_value = "none")]
    pub db_auth_method: DatabaseAuthMethod,

    #[clap(long, env = "SURREAL_ROOT_USERNAME", default_value = "root")]
    #[clap(required_if_eq("db_auth_method", "root"))]
    pub root_username: Option<String>,

    #[clap(long, env = "SURREAL_ROOT_PASSWORD", default_value = "root")]
    #[clap(required_if_eq("db_auth_method", "root"))]
    pub root_password: Option<String>,

    #[clap(long, env = "SURREAL_NAMESPACE", default_value = "tubequeue")]
    pub db_namespace: String,

    #[clap(long, env = "SURREAL_DATABASE", default_value = "tubequeue")]
    pub db_database: String,
}

impl DatabaseConfig {
    pub fn connection_url(&self) -> String {
        self.database_url
            .clone()
            .unwrap_or_else(|| format!("ws://{}:{}", self.store_host, self.store_port))
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
pub enum FetchEngine {
    /// Drive an external yt-dlp process
    #[default]
    Ytdlp,
    /// Plain HTTP(S) GET, for direct file links
    Http,
}

#[derive(Parser, Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent fetch workers
    #[clap(long, env = "WORKERS", default_value_t = 2)]
    pub workers: usize,

    #[clap(long, env = "FETCH_ENGINE", value_enum, default_value = "ytdlp")]
    pub engine: FetchEngine,

    /// yt-dlp executable, looked up on PATH unless absolute
    #[clap(long, env = "YTDLP_PATH", default_value = "yt-dlp")]
    pub ytdlp_path: PathBuf,

    /// Seconds a restarted job waits before it is picked up again
    #[clap(long, env = "RESTART_DELAY", default_value_t = 5)]
    pub restart_delay: u64,
}

impl WorkerConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay)
    }

    pub fn fetcher(&self) -> Result<Arc<dyn Fetcher>, FetchError> {
        let options = FetchOptions::default();
        Ok(match self.engine {
            FetchEngine::Ytdlp => Arc::new(YtDlp::new(self.ytdlp_path.clone(), options)),
            FetchEngine::Http => Arc::new(HttpFetcher::new(options)?),
        })
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid downloads path specified ({0}): not a directory")]
    NotADirectory(PathBuf),
    #[error("Invalid downloads path specified ({0}): not writable")]
    NotWritable(PathBuf),
}

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Downloads directory path
    #[clap(short = 'D', long, env = "DOWNLOAD_PATH", default_value = "/downloads/")]
    pub downloads_path: PathBuf,

    /// Listen host
    #[clap(short = 'l', long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Listen port
    #[clap(short = 'p', long, env = "LISTEN_PORT", default_value_t = 5000)]
    pub listen_port: u16,

    /// Enable debug logging
    #[clap(short = 'd', long)]
    pub debug: bool,

    #[clap(flatten)]
    pub db_config: DatabaseConfig,

    #[clap(flatten)]
    pub worker_config: WorkerConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_downloads_path(&self.downloads_path)
    }
}

/// The downloads directory must exist and accept new files.
pub fn validate_downloads_path(path: &Path) -> Result<(), ConfigError> {
    if !path.is_dir() {
        return Err(ConfigError::NotADirectory(path.to_path_buf()));
    }
    // Probing with a real file catches read-only mounts that permission bits miss
    tempfile::tempfile_in(path).map_err(|e| {
        tracing::debug!(path = ?path, error = %e, "Downloads path write check failed");
        ConfigError::NotWritable(path.to_path_buf())
    })?;
    Ok(())
}

pub fn config() -> Config {
    Config::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_surface() {
        let config = Config::parse_from(["tubequeue"]);
        assert_eq!(config.downloads_path, PathBuf::from("/downloads/"));
        assert_eq!(config.listen_host, "0.0.0.0");
        assert_eq!(config.listen_port, 5000);
        assert_eq!(config.worker_config.restart_delay(), Duration::from_secs(5));
        assert_eq!(config.worker_config.engine, FetchEngine::Ytdlp);
    }

    #[test]
    fn store_url_prefers_explicit_database_url() {
        let config = Config::parse_from(["tubequeue", "--store-host", "kv", "--store-port", "9000"]);
        assert_eq!(config.db_config.connection_url(), "ws://kv:9000");

        let config = Config::parse_from(["tubequeue", "--database-url", "mem://"]);
        assert_eq!(config.db_config.connection_url(), "mem://");
    }

    #[test]
    fn downloads_path_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(validate_downloads_path(dir.path()), Ok(()));

        let file = dir.path().join("plain-file");
        std::fs::write(&file, b"x").unwrap();
        assert_eq!(
            validate_downloads_path(&file),
            Err(ConfigError::NotADirectory(file.clone()))
        );

        let missing = dir.path().join("missing");
        assert!(matches!(
            validate_downloads_path(&missing),
            Err(ConfigError::NotADirectory(_))
        ));
    }
}
