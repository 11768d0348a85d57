//! Conversion job schema
//!
//! Payload shapes of `doc:convert`, `doc:progress` and `doc:result`.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::events::deserialize_job_id;

/// Highest accepted job priority
pub const MAX_PRIORITY: u8 = 10;

/// Error text of the terminal result of a cancelled job
pub const CANCELLED_MESSAGE: &str = "Job cancelled";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Source file not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Unsupported conversion: {extension} to {target}")]
    Unsupported { extension: String, target: TargetFormat },

    #[error("{}", CANCELLED_MESSAGE)]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    #[default]
    Pdf,
    Text,
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pdf => f.write_str("pdf"),
            Self::Text => f.write_str("text"),
        }
    }
}

/// Where the source document comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSource {
    Path(PathBuf),
    Url(String),
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => f.write_str(url),
        }
    }
}

/// Raw `doc:convert` fields before validation
#[derive(Debug, Deserialize)]
struct RawJob {
    #[serde(default, deserialize_with = "deserialize_optional_job_id")]
    id: Option<String>,
    #[serde(default)]
    source_url: Option<String>,
    #[serde(default)]
    source_path: Option<PathBuf>,
    #[serde(default)]
    target_format: Option<TargetFormat>,
    #[serde(default)]
    options: Option<Map<String, Value>>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

fn deserialize_optional_job_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_job_id(deserializer).map(Some)
}

/// A validated conversion request
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionJob {
    pub id: String,
    pub source: JobSource,
    pub target_format: TargetFormat,
    pub options: Map<String, Value>,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
}

impl ConversionJob {
    /// A local-file job with defaults for everything else
    pub fn from_path(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            source: JobSource::Path(path.into()),
            target_format: TargetFormat::default(),
            options: Map::new(),
            priority: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_target(mut self, target_format: TargetFormat) -> Self {
        self.target_format = target_format;
        self
    }

    /// Validate a `doc:convert` payload
    ///
    /// Exactly one of `source_path` and `source_url` must be set. A missing id
    /// gets a fresh one.
    pub fn from_payload(payload: &Value) -> Result<Self, JobError> {
        let raw: RawJob = serde_json::from_value(payload.clone()).map_err(|e| JobError::Validation(e.to_string()))?;

        let source_path = raw.source_path.filter(|p| !p.as_os_str().is_empty());
        let source_url = raw.source_url.filter(|u| !u.is_empty());
        let source = match (source_path, source_url) {
            (Some(path), None) => JobSource::Path(path),
            (None, Some(url)) => JobSource::Url(url),
            (None, None) => {
                return Err(JobError::Validation(
                    "Either source_url or source_path must be provided".to_string(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(JobError::Validation(
                    "Only one of source_url or source_path may be provided".to_string(),
                ));
            }
        };

        let priority = match raw.priority.unwrap_or(0) {
            p @ 0..=10 => p as u8,
            p => {
                return Err(JobError::Validation(format!(
                    "priority must be between 0 and {}, got {}",
                    MAX_PRIORITY, p
                )));
            }
        };

        Ok(Self {
            id: raw.id.unwrap_or_else(|| Uuid::now_v7().to_string()),
            source,
            target_format: raw.target_format.unwrap_or_default(),
            options: raw.options.unwrap_or_default(),
            priority,
            created_at: raw.created_at.unwrap_or_else(Utc::now),
        })
    }
}

/// Payload of `doc:progress`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub progress: u8,
    pub status: JobStatus,
    #[serde(default)]
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

impl JobProgress {
    pub fn new(job_id: impl Into<String>, progress: u8, status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            progress: progress.min(100),
            status,
            message: message.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Payload of `doc:result`; exactly one per accepted job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub success: bool,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub output_text: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl JobResult {
    pub fn success(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            success: true,
            output_path: None,
            output_text: None,
            error: None,
            metadata: Map::new(),
            completed_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn failure(job_id: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::success(job_id)
        }
    }

    pub fn cancelled(job_id: impl Into<String>) -> Self {
        Self::failure(job_id, CANCELLED_MESSAGE)
    }

    pub fn is_cancelled(&self) -> bool {
        !self.success && self.error.as_deref() == Some(CANCELLED_MESSAGE)
    }

    /// Output data forwarded upstream: path, text and metadata
    pub fn output(&self) -> Option<Value> {
        if !self.success {
            return None;
        }
        let mut out = Map::new();
        if let Some(path) = &self.output_path {
            out.insert("output_path".to_string(), Value::String(path.display().to_string()));
        }
        if let Some(text) = &self.output_text {
            out.insert("output_text".to_string(), Value::String(text.clone()));
        }
        out.insert("metadata".to_string(), Value::Object(self.metadata.clone()));
        out.insert("duration_ms".to_string(), Value::from(self.duration_ms));
        Some(Value::Object(out))
    }
}
