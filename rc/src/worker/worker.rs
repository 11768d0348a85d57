//! Document conversion worker
//!
//! Subscribes to `doc:convert` and `doc:cancel`. Each accepted job runs as its own
//! task tracked in the active-jobs map; the bus handlers only admit, look up and
//! cancel, so the dispatch loop never waits on a conversion.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{ConversionJob, JobProgress, JobResult, JobStatus};
use super::processor::{DocumentProcessor, ProgressSink, ProgressUpdate};
use crate::events::{
    DOC_CANCEL, DOC_CANCELLED, DOC_CONVERT, DOC_PROGRESS, DOC_RESULT, Event, EventBus, EventHandler, HandlerResult,
    JobRef, job_id_of, panic_message,
};

/// Source tag on worker events
pub const SOURCE: &str = "DocConverterWorker";

/// Grace period for active jobs on `stop`
pub const DEFAULT_JOB_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct ActiveJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type ActiveJobs = Arc<Mutex<HashMap<String, ActiveJob>>>;

fn lock(jobs: &ActiveJobs) -> MutexGuard<'_, HashMap<String, ActiveJob>> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a job from the map when its task ends, however it ends
struct Deregister {
    jobs: ActiveJobs,
    id: String,
    settled: bool,
}

impl Deregister {
    fn new(jobs: ActiveJobs, id: String) -> Self {
        Self {
            jobs,
            id,
            settled: false,
        }
    }

    /// Leave the map and report whether the job was cancelled first
    ///
    /// Cancels are issued under the same lock, so once this returns `false` no
    /// `doc:cancelled` can follow for this job.
    fn settle(&mut self, cancel: &CancellationToken) -> bool {
        let mut jobs = lock(&self.jobs);
        jobs.remove(&self.id);
        self.settled = true;
        cancel.is_cancelled()
    }
}

impl Drop for Deregister {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        lock(&self.jobs).remove(&self.id);
        debug!(job_id = %self.id, "Deregister::drop: job removed");
    }
}

pub struct DocConverterWorker {
    bus: EventBus,
    jobs: ActiveJobs,
    convert_handler: Arc<dyn EventHandler>,
    cancel_handler: Arc<dyn EventHandler>,
    stop_timeout: Duration,
}

impl DocConverterWorker {
    pub fn new(bus: EventBus, processor: DocumentProcessor) -> Self {
        debug!("DocConverterWorker::new: called");
        let jobs: ActiveJobs = Arc::new(Mutex::new(HashMap::new()));
        let convert_handler = Arc::new(ConvertHandler {
            bus: bus.clone(),
            processor: Arc::new(processor),
            jobs: jobs.clone(),
        });
        let cancel_handler = Arc::new(CancelHandler {
            bus: bus.clone(),
            jobs: jobs.clone(),
        });
        Self {
            bus,
            jobs,
            convert_handler,
            cancel_handler,
            stop_timeout: DEFAULT_JOB_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn start(&self) {
        self.bus
            .subscribe(DOC_CONVERT, self.convert_handler.clone())
            .subscribe(DOC_CANCEL, self.cancel_handler.clone());
        info!("Document converter worker started");
    }

    /// Unsubscribe, cancel every active job and wait for them
    ///
    /// Jobs still running after the grace period are aborted.
    pub async fn stop(&self) {
        debug!("DocConverterWorker::stop: called");
        self.bus
            .unsubscribe(DOC_CONVERT, &self.convert_handler)
            .unsubscribe(DOC_CANCEL, &self.cancel_handler);

        let drained: Vec<(String, ActiveJob)> = lock(&self.jobs).drain().collect();
        for (id, job) in &drained {
            job.cancel.cancel();
            warn!(job_id = %id, "Cancelled job");
        }

        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        for (id, mut job) in drained {
            if tokio::time::timeout_at(deadline, &mut job.handle).await.is_err() {
                warn!(job_id = %id, "Job did not stop in time, aborting");
                job.handle.abort();
            }
        }

        info!("Document converter worker stopped");
    }

    pub fn active_job_count(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        lock(&self.jobs).contains_key(job_id)
    }
}

struct ConvertHandler {
    bus: EventBus,
    processor: Arc<DocumentProcessor>,
    jobs: ActiveJobs,
}

impl ConvertHandler {
    /// Duplicate check, spawn and insert under one lock
    fn admit(&self, job: ConversionJob) {
        let mut jobs = lock(&self.jobs);
        if jobs.contains_key(&job.id) {
            warn!(job_id = %job.id, "Job already running, ignoring duplicate request");
            return;
        }

        let id = job.id.clone();
        let cancel = CancellationToken::new();
        let guard = Deregister::new(self.jobs.clone(), id.clone());
        let handle = tokio::spawn(run_job(
            self.bus.clone(),
            self.processor.clone(),
            job,
            cancel.clone(),
            guard,
        ));
        jobs.insert(id.clone(), ActiveJob { cancel, handle });
        info!(job_id = %id, active = jobs.len(), "Starting conversion job");
    }
}

#[async_trait]
impl EventHandler for ConvertHandler {
    async fn handle(&self, event: &Event) -> HandlerResult {
        match ConversionJob::from_payload(event.payload()) {
            Ok(job) => self.admit(job),
            Err(e) => {
                let id = job_id_of(event.payload()).unwrap_or_else(|| Uuid::now_v7().to_string());
                warn!(job_id = %id, error = %e, "Rejected conversion request");
                self.bus.publish(result_event(&JobResult::failure(id, e)));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "DocConverterWorker::convert"
    }
}

struct CancelHandler {
    bus: EventBus,
    jobs: ActiveJobs,
}

impl CancelHandler {
    fn cancel(&self, id: &str) -> bool {
        let jobs = lock(&self.jobs);
        match jobs.get(id) {
            Some(job) if !job.handle.is_finished() && !job.cancel.is_cancelled() => {
                job.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl EventHandler for CancelHandler {
    async fn handle(&self, event: &Event) -> HandlerResult {
        let id = match event.decode::<JobRef>() {
            Ok(job) => job.id,
            Err(e) => {
                warn!(error = %e, "Cancel request missing job ID");
                return Ok(());
            }
        };

        if self.cancel(&id) {
            info!(job_id = %id, "Cancelled job");
            self.bus.publish(
                Event::new(DOC_CANCELLED)
                    .with_payload(JobRef { id })
                    .with_source(SOURCE),
            );
        } else {
            warn!(job_id = %id, "Job not found or already done");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "DocConverterWorker::cancel"
    }
}

fn result_event(result: &JobResult) -> Event {
    Event::new(DOC_RESULT).with_payload(result).with_source(SOURCE)
}

/// Republish progress, never going backwards
struct ProgressRelay<'a> {
    bus: &'a EventBus,
    job_id: &'a str,
    last: u8,
}

impl ProgressRelay<'_> {
    fn relay(&mut self, update: ProgressUpdate) {
        let progress = update.progress.min(100).max(self.last);
        self.last = progress;
        let payload = JobProgress::new(self.job_id, progress, JobStatus::Processing, update.message);
        self.bus
            .publish(Event::new(DOC_PROGRESS).with_payload(payload).with_source(SOURCE));
    }
}

/// Body of one job task: progress while it runs, then exactly one result
async fn run_job(
    bus: EventBus,
    processor: Arc<DocumentProcessor>,
    job: ConversionJob,
    cancel: CancellationToken,
    mut guard: Deregister,
) {
    let started = Instant::now();
    let (sink, mut updates) = ProgressSink::channel();
    let mut relay = ProgressRelay {
        bus: &bus,
        job_id: &job.id,
        last: 0,
    };

    let work = AssertUnwindSafe(processor.process(&job, &sink, &cancel)).catch_unwind();
    tokio::pin!(work);

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            Some(update) = updates.recv() => relay.relay(update),
            outcome = &mut work => break Some(outcome),
        }
    };

    while let Ok(update) = updates.try_recv() {
        relay.relay(update);
    }

    let outcome = if guard.settle(&cancel) { None } else { outcome };

    let result = match outcome {
        Some(Ok(result)) => result,
        Some(Err(panic)) => {
            error!(job_id = %job.id, panic = panic_message(panic.as_ref()), "Job panicked");
            JobResult::failure(&job.id, format!("Job panicked: {}", panic_message(panic.as_ref())))
        }
        None => {
            info!(job_id = %job.id, "Job was cancelled");
            let mut result = JobResult::cancelled(&job.id);
            result.duration_ms = started.elapsed().as_millis() as u64;
            result
        }
    };

    info!(
        job_id = %job.id,
        success = result.success,
        duration_ms = result.duration_ms,
        "Job finished"
    );
    bus.publish(result_event(&result));
}
