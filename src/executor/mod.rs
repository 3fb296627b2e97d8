// Erasure Executor
//
// Organized structure:
// - job.rs: the job record, its options and per-pass history
// - progress.rs: events streamed to the caller
// - worker.rs: the blocking pass loop
//
// Each job runs on its own blocking worker. The caller talks to it only through
// the handle: events flow out, control messages flow in.

pub mod job;
pub mod progress;
mod worker;


#[cfg(test)]
mod worker_tests;

pub use job::{
    ErasureJob, FailureKind, HiddenRegionEvent, JobFailure, JobOptions, JobOutcome, JobState,
    PassRecord, PassStatus, RegionAction, RestoreFailure, SampleDigest, DEFAULT_CHUNK_SIZE,
};
pub use progress::ProgressEvent;

use crate::drives::ErasureTarget;
use crate::{EngineError, EngineResult};
use futures::Stream;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use worker::Worker;

/// Messages from the caller to a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Cancel,
}

/// A job back from its worker, together with the still-leased target.
#[derive(Debug)]
pub struct ExecutedJob {
    pub job: ErasureJob,
    pub target: ErasureTarget,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ErasureExecutor;

impl ErasureExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Start `job` against `target` on a blocking worker.
    ///
    /// Must be called from within a Tokio runtime. A job that has already left
    /// the `Created` state is rejected; retrying means creating a new job.
    pub fn execute(&self, mut job: ErasureJob, target: ErasureTarget) -> EngineResult<JobHandle> {
        if target.descriptor.device_id != job.target().device_id {
            return Err(EngineError::Config(format!(
                "job {} targets {} but {} was opened",
                job.job_id(),
                job.target().device_id,
                target.descriptor.device_id
            )));
        }
        job.mark_running()?;

        let job_id = job.job_id();
        let stall_watermark = job.options().stall_watermark;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let worker = Worker::new(job, target, event_tx, control_rx);
        let join = tokio::task::spawn_blocking(move || worker.run());

        Ok(JobHandle {
            job_id,
            events: event_rx,
            control: control_tx,
            worker: join,
            stall_watermark,
        })
    }
}

/// Caller's side of a running job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: Uuid,
    events: mpsc::UnboundedReceiver<ProgressEvent>,
    control: mpsc::UnboundedSender<ControlMessage>,
    worker: JoinHandle<ExecutedJob>,
    stall_watermark: Option<Duration>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Next progress event, `None` once the worker has finished.
    ///
    /// With a stall watermark set, a quiet period longer than the watermark
    /// yields `Stalled`; the job keeps running.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        match self.stall_watermark {
            Some(watermark) => match tokio::time::timeout(watermark, self.events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    tracing::warn!(job_id = %self.job_id, ?watermark, "Erasure job stalled");
                    Some(ProgressEvent::Stalled { watermark })
                }
            },
            None => self.events.recv().await,
        }
    }

    /// The event sequence as a stream.
    pub fn events(&mut self) -> impl Stream<Item = ProgressEvent> + '_ {
        futures::stream::unfold(self, |handle| async move {
            let event = handle.next_event().await?;
            Some((event, handle))
        })
    }

    /// Ask the worker to stop at the next chunk boundary.
    pub fn cancel(&self) {
        tracing::info!(job_id = %self.job_id, "Cancelling erasure job");
        // A closed channel means the worker already finished
        let _ = self.control.send(ControlMessage::Cancel);
    }

    /// Sender for cancelling from another task (e.g. a signal handler).
    pub fn canceller(&self) -> mpsc::UnboundedSender<ControlMessage> {
        self.control.clone()
    }

    /// Wait for the worker and take back the job and its target.
    pub async fn finish(self) -> EngineResult<ExecutedJob> {
        self.worker.await.map_err(|e| {
            EngineError::Io(io::Error::other(format!("erasure worker failed: {}", e)))
        })
    }
}
