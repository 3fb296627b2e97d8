// Progress events emitted by an erasure worker
//
// The sequence is finite: it starts with `JobStarted`, ends with `JobFinished`,
// and the channel closes when the worker returns.

use super::job::JobOutcome;
use crate::HiddenRegionKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    JobStarted {
        job_id: Uuid,
        device_id: String,
        method_id: String,
        total_passes: usize,
        bytes_per_pass: u64,
    },
    PreErasureCaptured {
        samples: usize,
    },
    PassStarted {
        pass_index: usize,
        total_passes: usize,
        description: String,
    },
    HiddenRegionExposed {
        pass_index: Option<usize>,
        kind: HiddenRegionKind,
        offset: u64,
        length: u64,
    },
    HiddenRegionRestored {
        pass_index: Option<usize>,
        kind: HiddenRegionKind,
        offset: u64,
    },
    HiddenRegionRestoreFailed {
        pass_index: Option<usize>,
        kind: HiddenRegionKind,
        offset: u64,
        reason: String,
    },
    Progress {
        pass_index: usize,
        bytes_done: u64,
        bytes_total: u64,
        bytes_per_second: u64,
    },
    SectorSkipped {
        pass_index: usize,
        offset: u64,
    },
    PassCompleted {
        pass_index: usize,
        bytes_written: u64,
        elapsed: Duration,
    },
    /// No event arrived within the job's watermark; diagnostic only
    Stalled {
        watermark: Duration,
    },
    JobFinished {
        outcome: JobOutcome,
    },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::JobFinished { .. })
    }

    /// Percentage complete for `Progress` events
    pub fn percent(&self) -> Option<f64> {
        match self {
            ProgressEvent::Progress {
                bytes_done,
                bytes_total,
                ..
            } if *bytes_total > 0 => Some(*bytes_done as f64 / *bytes_total as f64 * 100.0),
            _ => None,
        }
    }
}
