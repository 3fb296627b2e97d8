// Verification Sampler
//
// Reads the target back after the final pass and compares each examined sector
// with what the terminal pass should have left there. Hidden regions declared
// locked are exposed for the read and put back afterwards.

use super::plan::{SamplePlan, FULL_COVERAGE_BASIS_POINTS};
use super::{VerificationMode, VerificationResult};
use crate::algorithms::{PatternStream, VerificationRequirement};
use crate::crypto::secure_rng::calculate_entropy;
use crate::drives::{is_removal_error, ErasureTarget};
use crate::executor::{ErasureJob, JobOutcome, JobState, RestoreFailure, SampleDigest};
use crate::{EngineError, EngineResult, HiddenRegion};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Offsets listed individually in a result before only counts are kept
const MAX_REPORTED_OFFSETS: usize = 1024;

/// Bits per byte a sector must reach to count as scrambled
const MIN_SCRAMBLED_ENTROPY: f64 = 7.0;

/// Largest read issued in full mode
const FULL_READ_CHUNK: u64 = 4 * 1024 * 1024;

/// How a sector is judged.
enum Expectation<'a> {
    Exact(PatternStream),
    /// Pre-erasure digests, ascending by offset
    Changed(&'a [SampleDigest]),
}

impl Expectation<'_> {
    fn check(&mut self, data: &[u8], offset: u64) -> bool {
        match self {
            Expectation::Exact(stream) => stream.matches(data, offset),
            // Deallocated blocks read back uniform whatever they held before
            Expectation::Changed(_) if is_uniform(data) => true,
            Expectation::Changed(digests) => {
                let unchanged = digests
                    .binary_search_by_key(&offset, |d| d.offset)
                    .is_ok_and(|i| digests[i].sha256 == <[u8; 32]>::from(Sha256::digest(data)));
                !unchanged && calculate_entropy(data) >= MIN_SCRAMBLED_ENTROPY
            }
        }
    }
}

fn is_uniform(data: &[u8]) -> bool {
    data.first()
        .map_or(true, |first| data.iter().all(|b| b == first))
}

#[derive(Default)]
struct Tally {
    examined: u64,
    matched: u64,
    mismatched: u64,
    unreadable: u64,
    mismatched_offsets: Vec<u64>,
    unreadable_offsets: Vec<u64>,
}

impl Tally {
    fn record(&mut self, offset: u64, matched: bool) {
        self.examined += 1;
        if matched {
            self.matched += 1;
        } else {
            self.mismatched += 1;
            if self.mismatched_offsets.len() < MAX_REPORTED_OFFSETS {
                self.mismatched_offsets.push(offset);
            }
        }
    }

    fn unreadable(&mut self, offset: u64) {
        self.unreadable += 1;
        if self.unreadable_offsets.len() < MAX_REPORTED_OFFSETS {
            self.unreadable_offsets.push(offset);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct VerificationSampler;

impl VerificationSampler {
    pub fn new() -> Self {
        Self
    }

    /// Verify an executed job against its target, using the job's verification policy.
    pub fn verify(
        &self,
        job: &ErasureJob,
        target: &mut ErasureTarget,
    ) -> EngineResult<VerificationResult> {
        if job.state() != JobState::Executed {
            return Err(EngineError::VerificationFailed(format!(
                "job {} is {:?}; only executed jobs can be verified",
                job.job_id(),
                job.state()
            )));
        }
        if matches!(job.outcome(), Some(JobOutcome::Aborted) | Some(JobOutcome::Failed)) {
            return Err(EngineError::VerificationFailed(format!(
                "job {} ended {}; there is no erasure to verify",
                job.job_id(),
                job.outcome().map(|o| o.as_str()).unwrap_or("unfinished")
            )));
        }
        if target.descriptor.device_id != job.target().device_id {
            return Err(EngineError::Config(format!(
                "job {} targets {}, not {}",
                job.job_id(),
                job.target().device_id,
                target.descriptor.device_id
            )));
        }

        let terminal = job
            .method()
            .terminal_pass()
            .ok_or_else(|| EngineError::InvalidMethod("method has no passes".to_string()))?;
        let last_index = job.method().passes.len() - 1;
        let (mut expectation, expected) = match terminal.verification {
            VerificationRequirement::ContentChanged => (
                Expectation::Changed(job.pre_erasure_digests()),
                "content changed from pre-erasure state".to_string(),
            ),
            VerificationRequirement::ExactMatch | VerificationRequirement::None => {
                let pattern = terminal.expected_pattern().ok_or_else(|| {
                    EngineError::InvalidMethod(format!(
                        "{}: terminal pass has no deterministic pattern",
                        job.method().id
                    ))
                })?;
                let seed = job.pass_seeds().get(last_index).copied().flatten();
                (
                    Expectation::Exact(PatternStream::new(&pattern, seed.as_ref())?),
                    pattern.describe(),
                )
            }
        };

        let policy = job.options().verification;
        let skipped = job.skipped_offsets();
        let plan = match policy.mode {
            VerificationMode::Sampled => {
                SamplePlan::build(&target.descriptor, job.sample_seed(), &policy, &skipped)
            }
            VerificationMode::Full => SamplePlan::exhaustive(&target.descriptor, &skipped),
        };

        let span = tracing::info_span!("verification", job_id = %job.job_id(), mode = %policy.mode);
        let _enter = span.enter();

        let exposed = Self::expose_for_read(target);
        let scan = match policy.mode {
            VerificationMode::Sampled => Self::read_samples(target, &plan, &mut expectation),
            VerificationMode::Full => Self::read_all(target, &skipped, &mut expectation),
        };
        let (hidden_regions_restored, restore_failures) = if job.options().leave_hidden_exposed {
            (exposed.is_empty(), Vec::new())
        } else {
            let failures = Self::restore_after_read(target, exposed);
            (failures.is_empty(), failures)
        };
        let tally = scan?;

        let coverage_basis_points = if plan.eligible_sectors == 0 {
            0
        } else {
            (u128::from(tally.examined) * u128::from(FULL_COVERAGE_BASIS_POINTS)
                / u128::from(plan.eligible_sectors))
            .min(u128::from(FULL_COVERAGE_BASIS_POINTS)) as u32
        };
        let policy_min = policy.min_coverage_basis_points(target.descriptor.sector_count());
        let verdict = VerificationResult::decide(
            tally.mismatched,
            tally.unreadable,
            coverage_basis_points,
            policy_min,
        );

        tracing::info!(
            %verdict,
            examined = tally.examined,
            mismatched = tally.mismatched,
            unreadable = tally.unreadable,
            coverage_bp = coverage_basis_points,
            "Verification complete"
        );

        Ok(VerificationResult {
            job_id: job.job_id(),
            mode: policy.mode,
            sectors_planned: match policy.mode {
                VerificationMode::Sampled => plan.len() as u64,
                VerificationMode::Full => plan.eligible_sectors,
            },
            sample_plan_digest: plan.digest(),
            sectors_examined: tally.examined,
            sectors_matched: tally.matched,
            sectors_mismatched: tally.mismatched,
            sectors_unreadable: tally.unreadable,
            mismatched_offsets: tally.mismatched_offsets,
            unreadable_offsets: tally.unreadable_offsets,
            excluded_offsets: plan.excluded,
            eligible_sectors: plan.eligible_sectors,
            coverage_basis_points,
            policy_min_coverage_basis_points: policy_min,
            expected,
            hidden_regions_restored,
            restore_failures,
            verdict,
            verified_at: Utc::now(),
        })
    }

    fn read_samples(
        target: &mut ErasureTarget,
        plan: &SamplePlan,
        expectation: &mut Expectation,
    ) -> EngineResult<Tally> {
        let mut tally = Tally::default();
        let mut sector = vec![0u8; plan.sector_size as usize];
        for &offset in &plan.offsets {
            match target.device.read_at(&mut sector, offset) {
                Ok(()) => tally.record(offset, expectation.check(&sector, offset)),
                Err(e) if is_removal_error(&e) || !target.device.is_present() => {
                    return Err(EngineError::DeviceRemoved(target.descriptor.device_id.clone()))
                }
                Err(e) => {
                    tracing::warn!(offset, error = %e, "Sampled sector unreadable");
                    tally.unreadable(offset);
                }
            }
        }
        Ok(tally)
    }

    fn read_all(
        target: &mut ErasureTarget,
        skipped: &BTreeSet<u64>,
        expectation: &mut Expectation,
    ) -> EngineResult<Tally> {
        let capacity = target.descriptor.native_capacity;
        let sector_size = u64::from(target.descriptor.sector_size.max(1));
        let chunk = (FULL_READ_CHUNK / sector_size).max(1) * sector_size;
        let mut tally = Tally::default();
        let mut buf = vec![0u8; chunk.min(capacity.max(1)) as usize];

        let mut offset = 0u64;
        while offset + sector_size <= capacity {
            let len = (chunk.min(capacity - offset) / sector_size * sector_size) as usize;
            let data = &mut buf[..len];
            let chunk_ok = match target.device.read_at(data, offset) {
                Ok(()) => true,
                Err(e) if is_removal_error(&e) || !target.device.is_present() => {
                    return Err(EngineError::DeviceRemoved(target.descriptor.device_id.clone()))
                }
                Err(_) => false,
            };

            for (i, sector) in data.chunks_mut(sector_size as usize).enumerate() {
                let sector_offset = offset + i as u64 * sector_size;
                if skipped.contains(&sector_offset) {
                    continue;
                }
                if !chunk_ok {
                    // Narrow a failed chunk read down to the unreadable sectors
                    if let Err(e) = target.device.read_at(sector, sector_offset) {
                        if is_removal_error(&e) {
                            return Err(EngineError::DeviceRemoved(
                                target.descriptor.device_id.clone(),
                            ));
                        }
                        tally.unreadable(sector_offset);
                        continue;
                    }
                }
                tally.record(sector_offset, expectation.check(sector, sector_offset));
            }
            offset += len as u64;
        }
        Ok(tally)
    }

    fn expose_for_read(target: &mut ErasureTarget) -> Vec<HiddenRegion> {
        let mut exposed = Vec::new();
        for region in target.descriptor.hidden_regions.iter().filter(|r| r.locked) {
            match target.hidden.expose(region) {
                Ok(()) => exposed.push(region.clone()),
                // Unexposed sectors read as unreadable and the verdict says so
                Err(e) => tracing::warn!(kind = %region.kind, offset = region.offset, error = %e, "Hidden region not exposed for verification"),
            }
        }
        exposed
    }

    /// Lock every region the read-back exposed; regions that stay open are returned.
    fn restore_after_read(
        target: &mut ErasureTarget,
        exposed: Vec<HiddenRegion>,
    ) -> Vec<RestoreFailure> {
        let mut failures = Vec::new();
        for region in exposed {
            if let Err(e) = target.hidden.restore(&region) {
                tracing::error!(kind = %region.kind, offset = region.offset, error = %e, "Hidden region not restored after verification");
                failures.push(RestoreFailure {
                    pass_index: None,
                    region,
                    reason: format!("after verification read-back: {}", e),
                });
            }
        }
        failures
    }
}
