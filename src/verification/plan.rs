// Sample plan: which sectors the sampler reads back
//
// Stratified over the native address space and driven by the job's sample seed,
// so the executor (capturing pre-erasure digests) and the sampler arrive at the
// same offsets independently.

use super::VerificationPolicy;
use crate::algorithms::PatternSeed;
use crate::DeviceDescriptor;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};

/// One basis point is 0.01% coverage.
pub const FULL_COVERAGE_BASIS_POINTS: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePlan {
    /// Byte offsets of sampled sectors, ascending
    pub offsets: Vec<u64>,
    /// Known-bad sectors the plan avoided
    pub excluded: Vec<u64>,
    /// Sectors eligible for verification (all sectors minus known-bad ones)
    pub eligible_sectors: u64,
    pub sector_size: u64,
}

impl SamplePlan {
    /// Build the plan for `descriptor`, avoiding the byte offsets in `skipped`.
    pub fn build(
        descriptor: &DeviceDescriptor,
        seed: &PatternSeed,
        policy: &VerificationPolicy,
        skipped: &BTreeSet<u64>,
    ) -> Self {
        let sector_size = u64::from(descriptor.sector_size.max(1));
        let total = descriptor.sector_count();
        let target = Self::target_count(total, policy);

        let is_skipped = |sector: u64| skipped.contains(&(sector * sector_size));
        let mut rng = ChaCha20Rng::from_seed(seed.0);
        let mut chosen: Vec<u64> = Vec::with_capacity(target as usize + 2);
        let mut excluded: HashSet<u64> = HashSet::new();

        // Mandatory sectors: both ends of the device and the start of every hidden region
        let mut mandatory = vec![0, total.saturating_sub(1)];
        mandatory.extend(
            descriptor
                .hidden_regions
                .iter()
                .map(|r| r.offset / sector_size)
                .filter(|s| *s < total),
        );

        if total > 0 {
            for sector in mandatory {
                if is_skipped(sector) {
                    excluded.insert(sector);
                } else {
                    chosen.push(sector);
                }
            }

            // One pick per stratum; strata are disjoint so picks never collide
            for stratum in 0..target {
                let start = Self::stratum_bound(stratum, total, target);
                let end = Self::stratum_bound(stratum + 1, total, target).max(start + 1);
                let pick = rng.gen_range(start..end);
                match Self::first_eligible(pick, start, end, &is_skipped) {
                    Some(sector) => chosen.push(sector),
                    None => {
                        excluded.insert(pick);
                    }
                }
                if is_skipped(pick) {
                    excluded.insert(pick);
                }
            }
        }
        chosen.sort_unstable();
        chosen.dedup();

        let mut excluded: Vec<u64> = excluded.into_iter().map(|s| s * sector_size).collect();
        excluded.sort_unstable();

        Self {
            offsets: chosen.into_iter().map(|s| s * sector_size).collect(),
            excluded,
            eligible_sectors: Self::eligible(total, sector_size, skipped),
            sector_size,
        }
    }

    /// Plan for a full read-back: no offsets are listed, every eligible sector is read.
    pub fn exhaustive(descriptor: &DeviceDescriptor, skipped: &BTreeSet<u64>) -> Self {
        let sector_size = u64::from(descriptor.sector_size.max(1));
        let total = descriptor.sector_count();
        Self {
            offsets: Vec::new(),
            excluded: skipped
                .iter()
                .copied()
                .filter(|o| *o / sector_size < total)
                .collect(),
            eligible_sectors: Self::eligible(total, sector_size, skipped),
            sector_size,
        }
    }

    fn eligible(total: u64, sector_size: u64, skipped: &BTreeSet<u64>) -> u64 {
        let skipped_count = skipped.iter().filter(|o| **o / sector_size < total).count() as u64;
        total.saturating_sub(skipped_count)
    }

    /// First sector of `stratum` when `total` sectors are split into `strata` parts.
    fn stratum_bound(stratum: u64, total: u64, strata: u64) -> u64 {
        (u128::from(stratum) * u128::from(total) / u128::from(strata)) as u64
    }

    /// Number of stratified samples the policy asks for, between its floor and ceiling
    /// and never more than the sector count.
    pub fn target_count(total_sectors: u64, policy: &VerificationPolicy) -> u64 {
        if total_sectors == 0 {
            return 0;
        }
        let by_coverage = (u128::from(total_sectors) * u128::from(policy.coverage_basis_points))
            .div_ceil(u128::from(FULL_COVERAGE_BASIS_POINTS)) as u64;
        by_coverage
            .max(policy.min_samples)
            .min(policy.max_samples.max(1))
            .min(total_sectors)
    }

    /// Walk forward from `pick` (wrapping inside the stratum) to a sector not known bad.
    fn first_eligible(
        pick: u64,
        start: u64,
        end: u64,
        is_skipped: &impl Fn(u64) -> bool,
    ) -> Option<u64> {
        (pick..end).chain(start..pick).find(|s| !is_skipped(*s))
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// SHA-256 over the little-endian offsets, committing the attestation to this plan.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for offset in &self.offsets {
            hasher.update(offset.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }
}
