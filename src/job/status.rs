use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a job as reported to clients.
///
/// The fetch engine owns most of the vocabulary, so anything not recognised is kept
/// verbatim in [`JobStatus::Other`]. The string form is what gets stored and what
/// listings sort on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    /// Freshly created, not yet handed to the dispatcher
    #[default]
    Unset,
    /// Dispatched, waiting for the engine's first report
    Pending,
    Downloading,
    /// Engine-reported failure of a single attempt
    Error,
    Finished,
    Other(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unset => "",
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Error => "error",
            Self::Finished => "finished",
            Self::Other(s) => s,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl From<String> for JobStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" => Self::Unset,
            "pending" => Self::Pending,
            "downloading" => Self::Downloading,
            "error" => Self::Error,
            "finished" => Self::Finished,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for JobStatus {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<JobStatus> for String {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
