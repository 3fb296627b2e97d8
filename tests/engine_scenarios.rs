/// End-to-end acceptance scenarios
///
/// A: a clean HDD erase that verifies fully and signs.
/// B: overwrite refused on flash media before anything is written.
/// C: a write failure that ends the job without an attestation.
mod common;

use common::*;
use obliterator_engine::algorithms::SanitizationRequest;
use obliterator_engine::crypto::{verify_record, AttestationSigner};
use obliterator_engine::drives::SimulatedDevice;
use obliterator_engine::executor::{FailureKind, JobOutcome, JobState, PassStatus, ProgressEvent};
use obliterator_engine::verification::{VerificationMode, VerificationPolicy, Verdict};
use obliterator_engine::{EngineError, FirmwareErase, TechnologyClass};

#[tokio::test]
async fn scenario_a_hdd_single_pass_zero_full_verification() {
    let device = SimulatedDevice::builder("sim:a", TechnologyClass::HDD, GIB).build();
    let signer = signer();
    let engine = engine(
        &[&device],
        signer.clone(),
        fast_options(VerificationPolicy::full()),
    );

    let request = SanitizationRequest::clear().with_method("clear/single-pass-zero");
    let (report, events) = run(&engine, "sim:a", &request).await.unwrap();

    assert_eq!(report.outcome(), Some(JobOutcome::Success));
    assert_eq!(report.job.state(), JobState::Finalized);
    assert_eq!(device.bytes_written(), GIB);

    let verification = report.job.verification().unwrap();
    assert_eq!(verification.mode, VerificationMode::Full);
    assert_eq!(verification.verdict, Verdict::Verified);
    assert_eq!(verification.coverage_basis_points, 10_000);
    assert_eq!(verification.sectors_examined, GIB / 512);
    assert_eq!(verification.sectors_mismatched, 0);

    let record = report.attestation().expect("success is attested");
    verify_record(record, Some(&signer.public_key())).unwrap();
    assert_eq!(record.payload.outcome, JobOutcome::Success);
    assert_eq!(record.payload.passes.len(), 1);
    assert_eq!(record.payload.passes[0].bytes_written, GIB);

    assert!(matches!(events.first(), Some(ProgressEvent::JobStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::JobFinished {
            outcome: JobOutcome::Success
        })
    ));
    assert!(!engine.inventory().locks().is_held("sim:a"));
}

#[tokio::test]
async fn scenario_b_flash_overwrite_needs_acknowledgment() {
    let device = SimulatedDevice::builder("sim:b", TechnologyClass::NVMe, 64 * MIB).build();
    let engine = engine(&[&device], signer(), fast_options(VerificationPolicy::default()));

    let request = SanitizationRequest::clear().with_method("clear/single-pass-zero");
    let err = run(&engine, "sim:b", &request).await.unwrap_err();

    match err {
        EngineError::UnsupportedCombination { technology, .. } => {
            assert_eq!(technology, TechnologyClass::NVMe)
        }
        other => panic!("expected UnsupportedCombination, got {:?}", other),
    }
    assert_eq!(device.bytes_written(), 0);
    assert!(device.firmware_calls().is_empty());
    assert!(!engine.inventory().locks().is_held("sim:b"));
}

#[tokio::test]
async fn scenario_b_unnamed_purge_prefers_vendor_primitive() {
    let device = SimulatedDevice::builder("sim:b2", TechnologyClass::NVMe, 64 * MIB).build();
    let engine = engine(&[&device], signer(), fast_options(VerificationPolicy::default()));

    let (report, _) = run(&engine, "sim:b2", &SanitizationRequest::purge())
        .await
        .unwrap();

    assert_eq!(report.job.method().id, "purge/crypto-erase");
    assert_eq!(device.firmware_calls(), vec![FirmwareErase::CryptoErase]);
    assert_eq!(device.bytes_written(), 0);
    assert_eq!(report.outcome(), Some(JobOutcome::Success));
    assert!(report.attestation().is_some());
}

#[tokio::test]
async fn crypto_erase_reading_zeros_verifies_over_previously_zeroed_space() {
    let device = SimulatedDevice::builder("sim:dealloc", TechnologyClass::NVMe, 16 * MIB)
        .crypto_erase_reads_zeros()
        .build();
    device.poke(0, &vec![0u8; (8 * MIB) as usize]);
    let signer = signer();
    let engine = engine(&[&device], signer.clone(), fast_options(VerificationPolicy::default()));

    let (report, _) = run(&engine, "sim:dealloc", &SanitizationRequest::purge())
        .await
        .unwrap();

    assert_eq!(report.job.method().id, "purge/crypto-erase");
    assert_eq!(report.outcome(), Some(JobOutcome::Success));
    let verification = report.job.verification().unwrap();
    assert_eq!(verification.verdict, Verdict::Verified);
    assert_eq!(verification.sectors_mismatched, 0);
    let record = report.attestation().expect("success is attested");
    verify_record(record, Some(&signer.public_key())).unwrap();
}

#[tokio::test]
async fn scenario_c_write_failure_stops_the_job() {
    let bad = 8 * MIB + 4096;
    let device = SimulatedDevice::builder("sim:c", TechnologyClass::HDD, 16 * MIB)
        .bad_sector(bad)
        .build();
    let engine = engine(&[&device], signer(), fast_options(VerificationPolicy::default()));

    let request = SanitizationRequest::purge().with_method("purge/three-pass");
    let (report, events) = run(&engine, "sim:c", &request).await.unwrap();

    assert_eq!(report.outcome(), Some(JobOutcome::Failed));
    assert_eq!(report.job.state(), JobState::Finalized);
    let failure = report.job.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::WriteFailure);
    assert_eq!(failure.pass_index, Some(0));
    assert_eq!(failure.offset, Some(bad));

    // No further passes ran
    assert_eq!(report.job.passes().len(), 1);
    assert_eq!(report.job.passes()[0].status, PassStatus::Failed);
    let passes_started = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::PassStarted { .. }))
        .count();
    assert_eq!(passes_started, 1);

    assert!(report.job.verification().is_none());
    assert!(report.attestation.is_none());
    assert!(report.job.explain().starts_with("failed: 0 of 3 passes completed"));
}

#[tokio::test]
async fn missing_device_fails_before_anything_else() {
    let device = SimulatedDevice::builder("sim:present", TechnologyClass::HDD, MIB).build();
    let engine = engine(&[&device], signer(), fast_options(VerificationPolicy::default()));
    let err = run(&engine, "sim:absent", &SanitizationRequest::clear())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DeviceNotFound(_)));
}

#[tokio::test]
async fn busy_device_is_refused() {
    let device = SimulatedDevice::builder("sim:busy", TechnologyClass::HDD, MIB)
        .busy("mounted at /mnt/data")
        .build();
    let engine = engine(&[&device], signer(), fast_options(VerificationPolicy::default()));
    let err = run(&engine, "sim:busy", &SanitizationRequest::clear())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DeviceBusy(_)));
    assert_eq!(device.bytes_written(), 0);
}
