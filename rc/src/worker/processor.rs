//! Document processor
//!
//! Resolves a job's source, routes it to text extraction, a PDF copy or a native
//! converter, and reports progress through a [`ProgressSink`]. Blocking work runs
//! on the blocking pool so the bus loop and the socket keepalive never stall.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use super::converter::{ConvertError, ConvertRequest, Converter};
use super::job::{ConversionJob, JobError, JobResult, JobSource, TargetFormat};

/// Extensions always read as text for a `text` target
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "rst", "csv", "json", "log"];

/// Progress report from inside a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub progress: u8,
    pub message: String,
}

/// Sending half of a job's progress channel
///
/// Safe to use from the blocking pool; the job task drains the receiver and
/// republishes on the bus.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, progress: u8, message: impl Into<String>) {
        let _ = self.tx.send(ProgressUpdate {
            progress,
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub output_dir: PathBuf,
    pub conversion_timeout: Duration,
    pub download_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            output_dir: std::env::temp_dir().join("ragflow").join("output"),
            conversion_timeout: Duration::from_secs(300),
            download_timeout: Duration::from_secs(120),
        }
    }
}

pub struct DocumentProcessor {
    config: ProcessorConfig,
    converters: Vec<Arc<dyn Converter>>,
    http: reqwest::Client,
}

impl DocumentProcessor {
    pub fn new(config: ProcessorConfig) -> Result<Self, reqwest::Error> {
        debug!(?config, "DocumentProcessor::new: called");
        let http = reqwest::Client::builder().timeout(config.download_timeout).build()?;
        Ok(Self {
            config,
            converters: Vec::new(),
            http,
        })
    }

    /// Register a converter; earlier ones win for a shared extension
    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converters.push(converter);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    /// Run a job to a result; never fails, errors become failed results
    pub async fn process(&self, job: &ConversionJob, progress: &ProgressSink, cancel: &CancellationToken) -> JobResult {
        let started = Instant::now();
        info!(job_id = %job.id, source = %job.source, target = %job.target_format, "Starting processing");

        let mut result = match self.run(job, progress, cancel).await {
            Ok(result) => result,
            Err(JobError::Cancelled) => JobResult::cancelled(&job.id),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Processing failed");
                JobResult::failure(&job.id, e)
            }
        };
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn run(
        &self,
        job: &ConversionJob,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<JobResult, JobError> {
        progress.report(0, "Starting conversion...");

        let source = match &job.source {
            JobSource::Path(path) => {
                if !path.exists() {
                    return Err(JobError::SourceNotFound(path.clone()));
                }
                path.clone()
            }
            JobSource::Url(url) => {
                progress.report(10, "Downloading file...");
                self.download(&job.id, url, cancel).await?
            }
        };

        progress.report(20, "Reading file...");
        let extension = extension_of(&source);
        let size = tokio::fs::metadata(&source).await?.len();

        let mut result = JobResult::success(&job.id);
        result.metadata = metadata(&job.source, size, &extension);

        match job.target_format {
            TargetFormat::Text if self.reads_as_text(&extension) => {
                progress.report(50, "Reading text file...");
                let path = source.clone();
                let text = tokio::task::spawn_blocking(move || read_text(&path))
                    .await
                    .map_err(|e| JobError::Conversion(e.to_string()))??;
                result.output_text = Some(text);
            }
            TargetFormat::Pdf if extension == "pdf" => {
                progress.report(50, "Copying PDF...");
                let dir = self.job_dir(&job.id);
                tokio::fs::create_dir_all(&dir).await?;
                let target = dir.join(file_name(&source));
                tokio::fs::copy(&source, &target).await?;
                result.output_path = Some(target);
            }
            TargetFormat::Pdf => {
                let converter = self.converter_for(&extension).ok_or_else(|| JobError::Unsupported {
                    extension: extension.clone(),
                    target: job.target_format,
                })?;
                progress.report(50, format!("Converting with {}...", converter.name()));

                let request = ConvertRequest {
                    source: source.clone(),
                    output_dir: self.job_dir(&job.id),
                    timeout: self.config.conversion_timeout,
                    cancel: cancel.clone(),
                    options: job.options.clone(),
                };
                let name = converter.name().to_string();
                let output = tokio::task::spawn_blocking(move || converter.convert(&request))
                    .await
                    .map_err(|e| JobError::Conversion(e.to_string()))?
                    .map_err(|e| match e {
                        ConvertError::Cancelled => JobError::Cancelled,
                        other => JobError::Conversion(other.to_string()),
                    })?;
                result.output_path = Some(output);
                result.metadata.insert("converter".to_string(), Value::String(name));
            }
            TargetFormat::Text => {
                return Err(JobError::Unsupported {
                    extension,
                    target: job.target_format,
                });
            }
        }

        progress.report(100, "Conversion complete");
        info!(job_id = %job.id, "Processing complete");
        Ok(result)
    }

    /// Known text formats, plus anything no converter claims
    fn reads_as_text(&self, extension: &str) -> bool {
        TEXT_EXTENSIONS.contains(&extension) || (extension != "pdf" && self.converter_for(extension).is_none())
    }

    fn converter_for(&self, extension: &str) -> Option<Arc<dyn Converter>> {
        self.converters.iter().find(|c| c.supports(extension)).cloned()
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.config.output_dir.join(job_component(job_id))
    }

    async fn download(&self, job_id: &str, url: &str, cancel: &CancellationToken) -> Result<PathBuf, JobError> {
        debug!(%job_id, %url, "DocumentProcessor::download: called");
        let parsed = Url::parse(url).map_err(|e| JobError::Download(format!("invalid url '{}': {}", url, e)))?;
        let remote_name = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .unwrap_or("download")
            .to_string();

        let dir = self.config.output_dir.join("downloads");
        tokio::fs::create_dir_all(&dir).await?;
        let file_name = match safe_component(&remote_name) {
            name if name.is_empty() => "download".to_string(),
            name => name,
        };
        let target = dir.join(format!("{}-{}", job_component(job_id), file_name));

        let fetch = async {
            let response = self
                .http
                .get(parsed.clone())
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| JobError::Download(e.to_string()))?;
            let bytes = response.bytes().await.map_err(|e| JobError::Download(e.to_string()))?;
            tokio::fs::write(&target, &bytes).await?;
            debug!(%job_id, bytes = bytes.len(), path = %target.display(), "DocumentProcessor::download: saved");
            Ok::<_, JobError>(())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(JobError::Cancelled),
            fetched = fetch => fetched.map(|()| target.clone()),
        }
    }
}

fn metadata(source: &JobSource, size: u64, extension: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("source".to_string(), json!(source.to_string()));
    map.insert("size".to_string(), json!(size));
    map.insert("format".to_string(), json!(extension));
    map
}

/// Lowercase extension without the dot; empty when there is none
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string())
}

/// Make a name usable as a single path component
fn safe_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

/// Directory name for a job
///
/// Ids that are already safe are used as is. Any other id gets a hash of the
/// raw id appended, so distinct ids never share a directory and none maps to "".
fn job_component(job_id: &str) -> String {
    let clean = safe_component(job_id);
    if !clean.is_empty() && clean == job_id {
        return clean;
    }
    let hash = fnv1a(job_id.as_bytes());
    if clean.is_empty() {
        format!("{:08x}", hash)
    } else {
        format!("{}-{:08x}", clean, hash)
    }
}

/// 32-bit FNV-1a, stable across builds and platforms
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0x811c_9dc5, |hash, &b| (hash ^ u32::from(b)).wrapping_mul(0x0100_0193))
}

/// UTF-8, falling back to Latin-1 (every byte is a valid code point)
fn read_text(path: &Path) -> Result<String, JobError> {
    let bytes = std::fs::read(path)?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(e) => Ok(e.into_bytes().into_iter().map(char::from).collect()),
    }
}
