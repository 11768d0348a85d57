//! Document conversion worker
//!
//! Consumes `doc:convert` and `doc:cancel`, publishes `doc:progress`, `doc:result`
//! and `doc:cancelled`.

mod converter;
mod job;
mod processor;
#[allow(clippy::module_inception)]
mod worker;

pub use converter::{
    ConvertError, ConvertRequest, Converter, LIBREOFFICE_EXTENSIONS, LibreOfficeConverter, POLL_INTERVAL,
    expected_output,
};
pub use job::{
    CANCELLED_MESSAGE, ConversionJob, JobError, JobProgress, JobResult, JobSource, JobStatus, MAX_PRIORITY,
    TargetFormat,
};
pub use processor::{DocumentProcessor, ProcessorConfig, ProgressSink, ProgressUpdate, TEXT_EXTENSIONS, extension_of};
pub use worker::{DEFAULT_JOB_STOP_TIMEOUT, DocConverterWorker, SOURCE};
