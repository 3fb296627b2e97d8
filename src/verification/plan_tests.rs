// Sample plan construction
use super::plan::*;
use super::VerificationPolicy;
use crate::algorithms::PatternSeed;
use crate::{DeviceDescriptor, HiddenRegion, HiddenRegionKind, TechnologyClass};
use proptest::prelude::*;
use std::collections::BTreeSet;
use test_case::test_case;

const MIB: u64 = 1024 * 1024;

fn descriptor(capacity: u64) -> DeviceDescriptor {
    DeviceDescriptor::new("sim:plan", TechnologyClass::HDD, capacity, 512)
}

#[test_case(1_000, 100, 50, 50 ; "floor dominates on small devices")]
#[test_case(2_097_152, 100, 1_000, 20_972 ; "one percent of a gigabyte")]
#[test_case(500, 100, 1_000, 500 ; "capped by sector count")]
#[test_case(0, 100, 1_000, 0 ; "empty device")]
fn test_target_count(total: u64, basis_points: u32, min_samples: u64, expected: u64) {
    let policy = VerificationPolicy::sampled(basis_points, min_samples);
    assert_eq!(SamplePlan::target_count(total, &policy), expected);
}

#[test]
fn test_plan_is_reproducible_from_seed() {
    let d = descriptor(8 * MIB);
    let policy = VerificationPolicy::default();
    let seed = PatternSeed([7; 32]);
    let a = SamplePlan::build(&d, &seed, &policy, &BTreeSet::new());
    let b = SamplePlan::build(&d, &seed, &policy, &BTreeSet::new());
    assert_eq!(a, b);
    assert_eq!(a.digest(), b.digest());

    let c = SamplePlan::build(&d, &PatternSeed([8; 32]), &policy, &BTreeSet::new());
    assert_ne!(a.digest(), c.digest());
}

#[test]
fn test_plan_includes_ends_and_hidden_region_starts() {
    let mut d = descriptor(8 * MIB);
    d.apply_hidden_regions(vec![HiddenRegion {
        offset: 8 * MIB,
        length: MIB,
        kind: HiddenRegionKind::HPA,
        locked: true,
    }]);
    let plan = SamplePlan::build(
        &d,
        &PatternSeed([1; 32]),
        &VerificationPolicy::sampled(1, 10),
        &BTreeSet::new(),
    );

    assert_eq!(plan.offsets.first(), Some(&0));
    assert_eq!(plan.offsets.last(), Some(&(9 * MIB - 512)));
    assert!(plan.offsets.contains(&(8 * MIB)));
}

#[test]
fn test_plan_avoids_skipped_sectors() {
    let d = descriptor(MIB);
    let skipped: BTreeSet<u64> = [0, 512, 1024].into_iter().collect();
    let plan = SamplePlan::build(
        &d,
        &PatternSeed([3; 32]),
        &VerificationPolicy::sampled(10_000, 0),
        &skipped,
    );

    assert_eq!(plan.eligible_sectors, 2048 - 3);
    assert!(plan.offsets.iter().all(|o| !skipped.contains(o)));
    assert_eq!(plan.excluded, vec![0, 512, 1024]);
    assert_eq!(plan.len() as u64, plan.eligible_sectors);
}

proptest! {
    #[test]
    fn prop_offsets_sorted_aligned_and_in_range(
        sectors in 1u64..20_000,
        seed in any::<[u8; 32]>(),
        basis_points in 1u32..10_000,
    ) {
        let d = descriptor(sectors * 512);
        let plan = SamplePlan::build(
            &d,
            &PatternSeed(seed),
            &VerificationPolicy::sampled(basis_points, 16),
            &BTreeSet::new(),
        );
        prop_assert!(plan.offsets.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(plan.offsets.iter().all(|o| o % 512 == 0 && *o < sectors * 512));
        prop_assert!(plan.len() as u64 >= SamplePlan::target_count(sectors, &VerificationPolicy::sampled(basis_points, 16)));
    }
}

#[test_case(2_097_152, 100, 1_000, 5_000, 5_000 ; "ceiling wins over coverage")]
#[test_case(100_000, 100, 1_000, 500, 500 ; "ceiling wins over floor")]
fn test_target_count_ceiling(total: u64, basis_points: u32, min_samples: u64, max_samples: u64, expected: u64) {
    let policy = VerificationPolicy::sampled(basis_points, min_samples).with_max_samples(max_samples);
    assert_eq!(SamplePlan::target_count(total, &policy), expected);
}

#[test]
fn test_plan_on_huge_device_stays_bounded() {
    // 2^53 sectors: stratum arithmetic exceeds u64 before division
    let d = descriptor(1 << 62);
    let policy = VerificationPolicy::sampled(10_000, 0).with_max_samples(10_000);
    let plan = SamplePlan::build(&d, &PatternSeed([5; 32]), &policy, &BTreeSet::new());

    assert!(plan.len() >= 10_000 && plan.len() <= 10_002);
    assert!(plan.offsets.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(plan.offsets.last(), Some(&((1u64 << 62) - 512)));
    assert_eq!(plan.eligible_sectors, 1 << 53);
}

#[test]
fn test_min_coverage_follows_reachable_ceiling() {
    let policy = VerificationPolicy::sampled(100, 1_000).with_max_samples(1_000);
    // 1000 of 10 million sectors is 1 basis point
    assert_eq!(policy.min_coverage_basis_points(10_000_000), 1);
    assert_eq!(policy.min_coverage_basis_points(20_000), 100);
    assert_eq!(VerificationPolicy::full().min_coverage_basis_points(10_000_000), 10_000);
}

#[test]
fn test_exhaustive_plan_lists_no_offsets() {
    let d = descriptor(MIB);
    let skipped: BTreeSet<u64> = [4096, 2 * MIB].into_iter().collect();
    let plan = SamplePlan::exhaustive(&d, &skipped);
    assert!(plan.is_empty());
    assert_eq!(plan.excluded, vec![4096]);
    assert_eq!(plan.eligible_sectors, 2047);
}
