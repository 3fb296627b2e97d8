// Erasure job record
//
// The job is moved into its worker for execution and handed back afterwards.
// Only the executor and `attach_verification` mutate it; once `Finalized` it
// is read-only and every terminal state can be explained from its contents.

use crate::algorithms::{
    PassAction, PassSpec, PatternGenerator, PatternSeed, SanitizationMethod,
    VerificationRequirement,
};
use crate::crypto::secure_rng::generate_seed;
use crate::error::SkippedSector;
use crate::verification::{Verdict, VerificationPolicy, VerificationResult};
use crate::{
    DeviceDescriptor, EngineError, EngineResult, HiddenRegion, OperatorIdentity, WriteFailureKind,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default write chunk: 4 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Running,
    Executed,
    Finalized,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Partial,
    Failed,
    Aborted,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Partial => "partial",
            JobOutcome::Failed => "failed",
            JobOutcome::Aborted => "aborted",
        }
    }

    /// Outcomes an attestation may be issued for
    pub fn is_attestable(&self) -> bool {
        matches!(self, JobOutcome::Success | JobOutcome::Partial)
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOptions {
    /// Leave hidden regions addressable after the job instead of restoring them
    pub leave_hidden_exposed: bool,
    /// Emit a `Stalled` event when no progress arrives within this window
    pub stall_watermark: Option<Duration>,
    pub chunk_size: usize,
    pub verification: VerificationPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            leave_hidden_exposed: false,
            stall_watermark: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            verification: VerificationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Completed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PassRecord {
    pub index: usize,
    pub description: String,
    pub seed: Option<PatternSeed>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub bytes_written: u64,
    pub status: PassStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegionAction {
    Exposed,
    ExposeFailed,
    Restored,
    RestoreFailed,
    LeftExposed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HiddenRegionEvent {
    /// Pass during which the action happened; `None` outside any pass
    pub pass_index: Option<usize>,
    pub region: HiddenRegion,
    pub action: RegionAction,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

/// A hidden region that could not be returned to its declared state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreFailure {
    pub pass_index: Option<usize>,
    pub region: HiddenRegion,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    WriteFailure,
    HiddenRegionUnlockFailed,
    HardwareCommandFailed,
    DeviceRemoved,
    Cancelled,
    VerificationFailed,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub pass_index: Option<usize>,
    pub offset: Option<u64>,
    pub message: String,
}

impl JobFailure {
    pub fn from_error(err: &EngineError, current_pass: Option<usize>) -> Self {
        let (kind, pass_index, offset) = match err {
            EngineError::WriteFailure {
                pass_index, offset, ..
            } => (FailureKind::WriteFailure, Some(*pass_index), Some(*offset)),
            EngineError::HiddenRegionUnlockFailed { offset, .. } => (
                FailureKind::HiddenRegionUnlockFailed,
                current_pass,
                Some(*offset),
            ),
            EngineError::HardwareCommandFailed(_) => {
                (FailureKind::HardwareCommandFailed, current_pass, None)
            }
            EngineError::DeviceRemoved(_) => (FailureKind::DeviceRemoved, current_pass, None),
            EngineError::Cancelled => (FailureKind::Cancelled, current_pass, None),
            EngineError::VerificationFailed(_) => {
                (FailureKind::VerificationFailed, current_pass, None)
            }
            _ => (FailureKind::Other, current_pass, None),
        };
        Self {
            kind,
            pass_index,
            offset,
            message: err.to_string(),
        }
    }

    /// Failures that end the job as aborted rather than failed
    pub fn is_abort(&self) -> bool {
        matches!(self.kind, FailureKind::Cancelled | FailureKind::DeviceRemoved)
    }
}

fn is_random_pass(pass: &PassSpec) -> bool {
    matches!(pass.action, PassAction::Overwrite(PatternGenerator::Random))
}

/// SHA-256 of a sampled sector before the first pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleDigest {
    pub offset: u64,
    pub sha256: [u8; 32],
}

#[derive(Debug, Clone)]
pub struct ErasureJob {
    pub(crate) job_id: Uuid,
    pub(crate) operator: OperatorIdentity,
    pub(crate) target: DeviceDescriptor,
    pub(crate) method: Arc<SanitizationMethod>,
    pub(crate) options: JobOptions,
    /// One entry per pass; `Some` for random passes
    pub(crate) pass_seeds: Vec<Option<PatternSeed>>,
    pub(crate) sample_seed: PatternSeed,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
    pub(crate) passes: Vec<PassRecord>,
    pub(crate) hidden_region_events: Vec<HiddenRegionEvent>,
    pub(crate) skipped_sectors: Vec<SkippedSector>,
    pub(crate) restore_failures: Vec<RestoreFailure>,
    pub(crate) failure: Option<JobFailure>,
    pub(crate) pre_erasure_digests: Vec<SampleDigest>,
    pub(crate) state: JobState,
    pub(crate) outcome: Option<JobOutcome>,
    pub(crate) verification: Option<VerificationResult>,
}

impl ErasureJob {
    /// New job with fresh seeds for every random pass and for the sample plan.
    pub fn new(
        operator: OperatorIdentity,
        target: DeviceDescriptor,
        method: Arc<SanitizationMethod>,
        options: JobOptions,
    ) -> EngineResult<Self> {
        let pass_seeds = method
            .passes
            .iter()
            .map(|pass| {
                if is_random_pass(pass) {
                    generate_seed().map(Some)
                } else {
                    Ok(None)
                }
            })
            .collect::<EngineResult<Vec<_>>>()?;
        let sample_seed = generate_seed()?;
        Self::with_seeds(operator, target, method, options, pass_seeds, sample_seed)
    }

    /// New job with caller-chosen seeds, for reproducing a recorded claim.
    pub fn with_seeds(
        operator: OperatorIdentity,
        target: DeviceDescriptor,
        method: Arc<SanitizationMethod>,
        options: JobOptions,
        pass_seeds: Vec<Option<PatternSeed>>,
        sample_seed: PatternSeed,
    ) -> EngineResult<Self> {
        if pass_seeds.len() != method.passes.len() {
            return Err(EngineError::InvalidMethod(format!(
                "{}: {} seeds supplied for {} passes",
                method.id,
                pass_seeds.len(),
                method.passes.len()
            )));
        }
        for (index, (pass, seed)) in method.passes.iter().zip(&pass_seeds).enumerate() {
            if is_random_pass(pass) && seed.is_none() {
                return Err(EngineError::InvalidMethod(format!(
                    "{}: random pass {} has no seed",
                    method.id, index
                )));
            }
        }
        if options.chunk_size == 0 {
            return Err(EngineError::Config("chunk size must be non-zero".to_string()));
        }

        let job = Self {
            job_id: Uuid::new_v4(),
            operator,
            target,
            method,
            options,
            pass_seeds,
            sample_seed,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            passes: Vec::new(),
            hidden_region_events: Vec::new(),
            skipped_sectors: Vec::new(),
            restore_failures: Vec::new(),
            failure: None,
            pre_erasure_digests: Vec::new(),
            state: JobState::Created,
            outcome: None,
            verification: None,
        };
        tracing::info!(
            job_id = %job.job_id,
            device = %job.target.device_id,
            method = %job.method.id,
            operator = %job.operator,
            "Erasure job created"
        );
        Ok(job)
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn operator(&self) -> &OperatorIdentity {
        &self.operator
    }

    pub fn target(&self) -> &DeviceDescriptor {
        &self.target
    }

    pub fn method(&self) -> &Arc<SanitizationMethod> {
        &self.method
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn pass_seeds(&self) -> &[Option<PatternSeed>] {
        &self.pass_seeds
    }

    pub fn sample_seed(&self) -> &PatternSeed {
        &self.sample_seed
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn passes(&self) -> &[PassRecord] {
        &self.passes
    }

    pub fn hidden_region_events(&self) -> &[HiddenRegionEvent] {
        &self.hidden_region_events
    }

    pub fn skipped_sectors(&self) -> &[SkippedSector] {
        &self.skipped_sectors
    }

    pub fn restore_failures(&self) -> &[RestoreFailure] {
        &self.restore_failures
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        self.failure.as_ref()
    }

    pub fn pre_erasure_digests(&self) -> &[SampleDigest] {
        &self.pre_erasure_digests
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Outcome once execution has ended
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.outcome
    }

    pub fn verification(&self) -> Option<&VerificationResult> {
        self.verification.as_ref()
    }

    /// True when the last pass asks the sampler to compare against prior content.
    pub fn needs_pre_erasure_digests(&self) -> bool {
        self.method
            .terminal_pass()
            .is_some_and(|p| p.verification == VerificationRequirement::ContentChanged)
    }

    pub(crate) fn mark_running(&mut self) -> EngineResult<()> {
        if self.state != JobState::Created {
            return Err(EngineError::JobNotRestartable(self.job_id));
        }
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn record_failure(&mut self, failure: JobFailure) {
        // The first failure explains the terminal state; later ones are consequences
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
    }

    /// Close execution and derive the provisional outcome.
    pub(crate) fn finish_execution(&mut self) {
        let outcome = match &self.failure {
            Some(failure) if failure.is_abort() => JobOutcome::Aborted,
            Some(_) => JobOutcome::Failed,
            None if !self.restore_failures.is_empty() || !self.skipped_sectors.is_empty() => {
                JobOutcome::Partial
            }
            None => JobOutcome::Success,
        };
        self.outcome = Some(outcome);
        self.state = JobState::Executed;
        self.ended_at = Some(Utc::now());
        tracing::info!(job_id = %self.job_id, %outcome, "Erasure job executed");
    }

    /// Attach the verification result and finalize. Allowed exactly once.
    pub fn attach_verification(&mut self, result: VerificationResult) -> EngineResult<()> {
        if self.verification.is_some() {
            return Err(EngineError::VerificationFailed(format!(
                "job {} already has a verification result",
                self.job_id
            )));
        }
        if self.state != JobState::Executed {
            return Err(EngineError::VerificationFailed(format!(
                "job {} is {:?}; verification attaches only after execution",
                self.job_id, self.state
            )));
        }
        if result.job_id != self.job_id {
            return Err(EngineError::VerificationFailed(format!(
                "result belongs to job {}, not {}",
                result.job_id, self.job_id
            )));
        }

        match result.verdict {
            Verdict::Failed => {
                self.record_failure(JobFailure {
                    kind: FailureKind::VerificationFailed,
                    pass_index: Some(self.method.passes.len().saturating_sub(1)),
                    offset: result.mismatched_offsets.first().copied(),
                    message: format!(
                        "{} of {} examined sectors did not match {}",
                        result.sectors_mismatched, result.sectors_examined, result.expected
                    ),
                });
                // A failed verdict overrides whatever execution reported
                self.outcome = Some(JobOutcome::Failed);
            }
            Verdict::Inconclusive => {
                if self.outcome == Some(JobOutcome::Success) {
                    self.outcome = Some(JobOutcome::Partial);
                }
            }
            Verdict::Verified => {}
        }

        // A region the read-back could not lock again is reported like one the passes left open
        for failure in &result.restore_failures {
            self.hidden_region_events.push(HiddenRegionEvent {
                pass_index: None,
                region: failure.region.clone(),
                action: RegionAction::RestoreFailed,
                at: result.verified_at,
                detail: Some(failure.reason.clone()),
            });
            self.restore_failures.push(failure.clone());
        }
        if !result.restore_failures.is_empty() && self.outcome == Some(JobOutcome::Success) {
            self.outcome = Some(JobOutcome::Partial);
        }

        tracing::info!(
            job_id = %self.job_id,
            verdict = %result.verdict,
            coverage_bp = result.coverage_basis_points,
            "Verification attached"
        );
        self.verification = Some(result);
        self.state = JobState::Finalized;
        Ok(())
    }

    /// Finalize an executed job whose read-back could not be carried out.
    pub(crate) fn fail_verification(&mut self, err: &EngineError) {
        let failure = JobFailure::from_error(err, None);
        self.outcome = Some(if failure.is_abort() {
            JobOutcome::Aborted
        } else {
            JobOutcome::Failed
        });
        tracing::error!(job_id = %self.job_id, error = %err, "Verification could not run");
        self.record_failure(failure);
        self.state = JobState::Finalized;
    }

    /// Finalize a job that ended failed or aborted; nothing is left to verify.
    pub fn finalize_unverified(&mut self) -> EngineResult<()> {
        if self.state != JobState::Executed {
            return Err(EngineError::NotAttestable(format!(
                "job {} is {:?}, not executed",
                self.job_id, self.state
            )));
        }
        match self.outcome {
            Some(JobOutcome::Failed) | Some(JobOutcome::Aborted) => {
                self.state = JobState::Finalized;
                Ok(())
            }
            _ => Err(EngineError::VerificationFailed(format!(
                "job {} must be verified before it is finalized",
                self.job_id
            ))),
        }
    }

    /// Offsets known to be unwritable, for the sampler to leave out.
    pub fn skipped_offsets(&self) -> std::collections::BTreeSet<u64> {
        self.skipped_sectors.iter().map(|s| s.offset).collect()
    }

    /// Human-readable explanation of the terminal state, derived from the record alone.
    pub fn explain(&self) -> String {
        let outcome = self.outcome.map(|o| o.as_str()).unwrap_or("pending");
        let completed = self
            .passes
            .iter()
            .filter(|p| p.status == PassStatus::Completed)
            .count();
        let mut text = format!(
            "{}: {} of {} passes completed",
            outcome,
            completed,
            self.method.passes.len()
        );
        if let Some(ref failure) = self.failure {
            text.push_str(&format!("; {}", failure.message));
        }
        if !self.skipped_sectors.is_empty() {
            text.push_str(&format!(
                "; {} sectors skipped as {}",
                self.skipped_sectors.len(),
                WriteFailureKind::ToleratedBadSector
            ));
        }
        if !self.restore_failures.is_empty() {
            text.push_str(&format!(
                "; {} hidden regions could not be restored",
                self.restore_failures.len()
            ));
        }
        if let Some(ref verification) = self.verification {
            text.push_str(&format!(
                "; verification {} at {:.2}% coverage",
                verification.verdict,
                verification.coverage_percent()
            ));
        }
        text
    }
}
