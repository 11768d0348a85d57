//! Native document converters
//!
//! Converters are blocking and run on the blocking pool. A converter that spawns
//! a process owns it: on cancellation or timeout it kills and reaps its child.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often a running conversion checks for completion and cancellation
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stderr bytes kept for error reports
const STDERR_LIMIT: u64 = 64 * 1024;

/// Longest wait for the stderr reader after the child exits
const STDERR_WAIT: Duration = Duration::from_secs(2);

/// Source extensions LibreOffice converts to PDF
pub const LIBREOFFICE_EXTENSIONS: &[&str] = &[
    "doc", "docx", "odt", "rtf", "xls", "xlsx", "xlsm", "ods", "csv", "ppt", "pptx", "odp",
];

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{0}")]
    Failed(String),

    #[error("Conversion timed out after {0:?}")]
    Timeout(Duration),

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("Expected output not found: {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One conversion to PDF
#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub options: Map<String, Value>,
}

pub trait Converter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this converter handles a lowercase extension without the dot
    fn supports(&self, extension: &str) -> bool;

    /// Convert and return the produced file
    fn convert(&self, request: &ConvertRequest) -> Result<PathBuf, ConvertError>;
}

/// Headless `soffice --convert-to pdf`
#[derive(Debug, Clone)]
pub struct LibreOfficeConverter {
    program: PathBuf,
}

impl LibreOfficeConverter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    fn command(&self, request: &ConvertRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "--headless",
            "--invisible",
            "--nologo",
            "--nofirststartwizard",
            "--convert-to",
            "pdf",
            "--outdir",
        ])
        .arg(&request.output_dir)
        .arg(&request.source)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
        cmd
    }
}

impl Default for LibreOfficeConverter {
    fn default() -> Self {
        Self::new("soffice")
    }
}

impl Converter for LibreOfficeConverter {
    fn name(&self) -> &str {
        "libreoffice"
    }

    fn supports(&self, extension: &str) -> bool {
        LIBREOFFICE_EXTENSIONS.contains(&extension)
    }

    fn convert(&self, request: &ConvertRequest) -> Result<PathBuf, ConvertError> {
        debug!(source = %request.source.display(), "LibreOfficeConverter::convert: called");
        fs::create_dir_all(&request.output_dir)?;

        let mut child = self.command(request).spawn().map_err(|e| {
            ConvertError::Failed(format!("failed to start {}: {}", self.program.display(), e))
        })?;
        let started = Instant::now();
        let stderr = StderrTail::capture(&mut child);

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if request.cancel.is_cancelled() {
                info!(pid = child.id(), "Conversion cancelled, killing converter");
                kill_and_reap(&mut child);
                return Err(ConvertError::Cancelled);
            }
            if started.elapsed() >= request.timeout {
                warn!(pid = child.id(), timeout = ?request.timeout, "Conversion timed out, killing converter");
                kill_and_reap(&mut child);
                return Err(ConvertError::Timeout(request.timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            return Err(ConvertError::Failed(format!(
                "{} exited with {}: {}",
                self.program.display(),
                status,
                stderr.collect().trim()
            )));
        }

        let output = expected_output(&request.source, &request.output_dir);
        if !output.exists() {
            return Err(ConvertError::MissingOutput(output));
        }
        debug!(output = %output.display(), elapsed = ?started.elapsed(), "LibreOfficeConverter::convert: done");
        Ok(output)
    }
}

/// `<dir>/<stem>.pdf`
pub fn expected_output(source: &Path, output_dir: &Path) -> PathBuf {
    let stem = source.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    output_dir.join(format!("{}.pdf", stem))
}

/// Drains a child's stderr on its own thread so the child never blocks on a full pipe
///
/// Keeps the first [`STDERR_LIMIT`] bytes and discards the rest.
struct StderrTail {
    rx: Option<mpsc::Receiver<String>>,
}

impl StderrTail {
    fn capture(child: &mut Child) -> Self {
        let Some(mut pipe) = child.stderr.take() else {
            return Self { rx: None };
        };
        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("soffice-stderr".to_string())
            .spawn(move || {
                let mut kept = Vec::new();
                let _ = (&mut pipe).take(STDERR_LIMIT).read_to_end(&mut kept);
                let _ = io::copy(&mut pipe, &mut io::sink());
                let _ = tx.send(String::from_utf8_lossy(&kept).into_owned());
            });
        match spawned {
            Ok(_) => Self { rx: Some(rx) },
            Err(e) => {
                warn!(error = %e, "Could not start stderr reader");
                Self { rx: None }
            }
        }
    }

    /// Captured text; a grandchild still holding the pipe bounds the wait
    fn collect(self) -> String {
        self.rx
            .and_then(|rx| rx.recv_timeout(STDERR_WAIT).ok())
            .unwrap_or_default()
    }
}

fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "kill_and_reap: kill failed");
    }
    let _ = child.wait();
}
