// Post-erasure verification
//
// - plan.rs: seeded, stratified sample plan over the native address space
// - sampler.rs: read-back and comparison against the terminal pass
//
// The result records its coverage and the policy it was held to, so the
// attestation states plainly whether verification was sampled or exhaustive.

pub mod plan;
pub mod sampler;

#[cfg(test)]
mod plan_tests;

#[cfg(test)]
mod sampler_tests;

pub use plan::{SamplePlan, FULL_COVERAGE_BASIS_POINTS};
pub use sampler::VerificationSampler;

use crate::executor::RestoreFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Default sampled coverage: 1% of sectors
pub const DEFAULT_COVERAGE_BASIS_POINTS: u32 = 100;
/// Default floor on the sample count for small devices
pub const DEFAULT_MIN_SAMPLES: u64 = 1_000;
/// Default ceiling on the sample count; bounds plan memory on multi-terabyte devices
pub const DEFAULT_MAX_SAMPLES: u64 = 2_000_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    Sampled,
    Full,
}

impl fmt::Display for VerificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationMode::Sampled => write!(f, "sampled"),
            VerificationMode::Full => write!(f, "full"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationPolicy {
    pub mode: VerificationMode,
    /// Sampled-mode coverage target in basis points (100 = 1%)
    pub coverage_basis_points: u32,
    pub min_samples: u64,
    /// Upper bound on sampled sectors; wins over `min_samples` and coverage
    pub max_samples: u64,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            mode: VerificationMode::Sampled,
            coverage_basis_points: DEFAULT_COVERAGE_BASIS_POINTS,
            min_samples: DEFAULT_MIN_SAMPLES,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

impl VerificationPolicy {
    pub fn full() -> Self {
        Self {
            mode: VerificationMode::Full,
            ..Self::default()
        }
    }

    pub fn sampled(coverage_basis_points: u32, min_samples: u64) -> Self {
        Self {
            mode: VerificationMode::Sampled,
            coverage_basis_points: coverage_basis_points.min(FULL_COVERAGE_BASIS_POINTS),
            min_samples,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }

    pub fn with_max_samples(mut self, max_samples: u64) -> Self {
        self.max_samples = max_samples;
        self
    }

    /// Coverage a device of `total_sectors` must reach for a `Verified` verdict.
    ///
    /// In sampled mode this is the coverage target, lowered to what `max_samples`
    /// can reach on large devices. Both numbers end up in the signed record.
    pub fn min_coverage_basis_points(&self, total_sectors: u64) -> u32 {
        match self.mode {
            VerificationMode::Full => FULL_COVERAGE_BASIS_POINTS,
            VerificationMode::Sampled => {
                let target = self.coverage_basis_points.min(FULL_COVERAGE_BASIS_POINTS);
                if total_sectors == 0 {
                    return target;
                }
                let reachable = u128::from(self.max_samples) * u128::from(FULL_COVERAGE_BASIS_POINTS)
                    / u128::from(total_sectors);
                reachable.min(u128::from(target)) as u32
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Verified,
    Inconclusive,
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Verified => write!(f, "verified"),
            Verdict::Inconclusive => write!(f, "inconclusive"),
            Verdict::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of reading a job's target back after the final pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationResult {
    pub job_id: Uuid,
    pub mode: VerificationMode,
    /// Sectors the plan asked for; every eligible sector in full mode
    pub sectors_planned: u64,
    pub sample_plan_digest: String,
    pub sectors_examined: u64,
    pub sectors_matched: u64,
    pub sectors_mismatched: u64,
    pub sectors_unreadable: u64,
    /// First mismatching offsets, capped
    pub mismatched_offsets: Vec<u64>,
    /// First unreadable offsets, capped
    pub unreadable_offsets: Vec<u64>,
    /// Known-bad sectors left out of the check
    pub excluded_offsets: Vec<u64>,
    pub eligible_sectors: u64,
    pub coverage_basis_points: u32,
    pub policy_min_coverage_basis_points: u32,
    /// What the sectors were compared against
    pub expected: String,
    /// Hidden regions were returned to their declared state after reading
    pub hidden_regions_restored: bool,
    /// Regions the read-back exposed and could not lock again
    pub restore_failures: Vec<RestoreFailure>,
    pub verdict: Verdict,
    pub verified_at: DateTime<Utc>,
}

impl VerificationResult {
    pub fn coverage_percent(&self) -> f64 {
        f64::from(self.coverage_basis_points) / 100.0
    }

    pub fn meets_policy(&self) -> bool {
        self.coverage_basis_points >= self.policy_min_coverage_basis_points
    }

    /// Verdict from the counts: any mismatch fails, thin or unreadable coverage is inconclusive.
    pub(crate) fn decide(
        sectors_mismatched: u64,
        sectors_unreadable: u64,
        coverage_basis_points: u32,
        policy_min: u32,
    ) -> Verdict {
        if sectors_mismatched > 0 {
            Verdict::Failed
        } else if sectors_unreadable > 0 || coverage_basis_points < policy_min {
            Verdict::Inconclusive
        } else {
            Verdict::Verified
        }
    }
}
