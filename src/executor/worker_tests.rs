// Executor behaviour against simulated devices
use super::*;
use crate::algorithms::{
    BadSectorPolicy, DurationModel, MethodRegistry, PassSpec, PatternGenerator,
    SanitizationMethod, StandardReference, SanitizationTier, VerificationRequirement,
};
use crate::drives::{DeviceInventory, SimulatedBackend, SimulatedDevice};
use crate::{HiddenRegionKind, OperatorIdentity, TechnologyClass};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

fn setup(device: &SimulatedDevice) -> DeviceInventory {
    DeviceInventory::new(Arc::new(SimulatedBackend::new().with_device(device.clone())))
}

fn options() -> JobOptions {
    JobOptions {
        chunk_size: 64 * KIB as usize,
        ..JobOptions::default()
    }
}

fn builtin(id: &str) -> Arc<SanitizationMethod> {
    MethodRegistry::builtin().get(id).unwrap()
}

async fn run(
    device: &SimulatedDevice,
    method: Arc<SanitizationMethod>,
    options: JobOptions,
) -> (ExecutedJob, Vec<ProgressEvent>) {
    let inventory = setup(device);
    let target = inventory.open_exclusive(&device.device_id()).unwrap();
    let job = ErasureJob::new(
        OperatorIdentity::new("tester"),
        target.descriptor.clone(),
        method,
        options,
    )
    .unwrap();
    let mut handle = ErasureExecutor::new().execute(job, target).unwrap();
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    (handle.finish().await.unwrap(), events)
}

/// Sends `Cancel` from inside the worker once `threshold` bytes are written.
fn cancel_after(
    device: &SimulatedDevice,
    threshold: u64,
) -> std::sync::mpsc::Sender<tokio::sync::mpsc::UnboundedSender<ControlMessage>> {
    let (slot_tx, slot_rx) = std::sync::mpsc::channel();
    let slot_rx = Mutex::new(slot_rx);
    let fired = AtomicBool::new(false);
    device.on_write(Arc::new(move |written| {
        if written >= threshold && !fired.swap(true, Ordering::SeqCst) {
            let canceller: tokio::sync::mpsc::UnboundedSender<ControlMessage> =
                match slot_rx.lock().unwrap().recv() {
                    Ok(c) => c,
                    Err(_) => return,
                };
            let _ = canceller.send(ControlMessage::Cancel);
        }
    }));
    slot_tx
}

#[tokio::test]
async fn test_single_pass_zero_succeeds() {
    let device = SimulatedDevice::builder("sim:ok", TechnologyClass::HDD, 2 * MIB).build();
    let (executed, events) = run(&device, builtin("clear/single-pass-zero"), options()).await;
    let job = executed.job;

    assert_eq!(job.state(), JobState::Executed);
    assert_eq!(job.outcome(), Some(JobOutcome::Success));
    assert_eq!(job.passes().len(), 1);
    assert_eq!(job.passes()[0].status, PassStatus::Completed);
    assert_eq!(job.passes()[0].bytes_written, 2 * MIB);
    assert!(device.peek(0, 4096).iter().all(|b| *b == 0));
    assert!(device.peek(2 * MIB - 512, 512).iter().all(|b| *b == 0));

    assert!(matches!(events.first(), Some(ProgressEvent::JobStarted { .. })));
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn test_hidden_region_exposed_and_restored() {
    let device = SimulatedDevice::builder("sim:hpa", TechnologyClass::HDD, 2 * MIB)
        .hidden_region(HiddenRegionKind::HPA, MIB)
        .build();
    let (executed, events) = run(&device, builtin("clear/single-pass-zero"), options()).await;
    let job = executed.job;

    assert_eq!(job.outcome(), Some(JobOutcome::Success));
    assert_eq!(job.passes()[0].bytes_written, 3 * MIB);
    assert_eq!(device.region_lock_states(), vec![true]);
    assert_eq!(device.unlock_count(), 1);
    assert_eq!(device.relock_count(), 1);

    let actions: Vec<_> = job.hidden_region_events().iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![RegionAction::Exposed, RegionAction::Restored]);
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::HiddenRegionExposed { .. })));
}

#[tokio::test]
async fn test_leave_hidden_exposed_on_request() {
    let device = SimulatedDevice::builder("sim:leave", TechnologyClass::HDD, MIB)
        .hidden_region(HiddenRegionKind::HPA, MIB)
        .build();
    let opts = JobOptions {
        leave_hidden_exposed: true,
        ..options()
    };
    let (executed, _) = run(&device, builtin("clear/single-pass-zero"), opts).await;

    assert_eq!(device.region_lock_states(), vec![false]);
    let last = executed.job.hidden_region_events().last().unwrap();
    assert_eq!(last.action, RegionAction::LeftExposed);
}

#[tokio::test]
async fn test_cancel_aborts_and_relocks() {
    let device = SimulatedDevice::builder("sim:cancel", TechnologyClass::HDD, 4 * MIB)
        .hidden_region(HiddenRegionKind::HPA, MIB)
        .build();
    let slot = cancel_after(&device, MIB);

    let inventory = setup(&device);
    let target = inventory.open_exclusive("sim:cancel").unwrap();
    let job = ErasureJob::new(
        OperatorIdentity::new("tester"),
        target.descriptor.clone(),
        builtin("purge/three-pass"),
        options(),
    )
    .unwrap();
    let handle = ErasureExecutor::new().execute(job, target).unwrap();
    slot.send(handle.canceller()).unwrap();
    let job = handle.finish().await.unwrap().job;

    assert_eq!(job.outcome(), Some(JobOutcome::Aborted));
    assert_eq!(job.failure().unwrap().kind, FailureKind::Cancelled);
    assert_eq!(job.passes().len(), 1);
    assert_eq!(job.passes()[0].status, PassStatus::Aborted);
    assert!(job.passes()[0].bytes_written < 5 * MIB);
    assert_eq!(device.region_lock_states(), vec![true]);
}

#[tokio::test]
async fn test_strict_method_fails_on_bad_sector() {
    let bad = MIB + 4096;
    let device = SimulatedDevice::builder("sim:bad", TechnologyClass::HDD, 2 * MIB)
        .bad_sector(bad)
        .build();
    let (executed, _) = run(&device, builtin("purge/three-pass"), options()).await;
    let job = executed.job;

    assert_eq!(job.outcome(), Some(JobOutcome::Failed));
    let failure = job.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::WriteFailure);
    assert_eq!(failure.pass_index, Some(0));
    // The failing sector itself, not the chunk holding it
    assert_eq!(failure.offset, Some(bad));
    assert_eq!(job.passes().len(), 1);
    assert_eq!(job.passes()[0].status, PassStatus::Failed);
}

#[tokio::test]
async fn test_strict_failure_reports_first_bad_sector_in_chunk() {
    let device = SimulatedDevice::builder("sim:bad2", TechnologyClass::HDD, MIB)
        .bad_sector(64 * KIB + 1536)
        .bad_sector(64 * KIB + 8192)
        .build();
    let (executed, _) = run(&device, builtin("clear/single-pass-zero"), options()).await;

    let failure = executed.job.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::WriteFailure);
    assert_eq!(failure.offset, Some(64 * KIB + 1536));
    assert!(executed.job.skipped_sectors().is_empty());
}

#[tokio::test]
async fn test_skip_and_log_records_every_bad_sector() {
    let bad = [4096, MIB + 512, MIB + 1024];
    let mut builder = SimulatedDevice::builder("sim:skip", TechnologyClass::HDD, 2 * MIB);
    for offset in bad {
        builder = builder.bad_sector(offset);
    }
    let device = builder.build();
    let (executed, events) =
        run(&device, builtin("clear/single-pass-zero-skip-bad"), options()).await;
    let job = executed.job;

    assert_eq!(job.outcome(), Some(JobOutcome::Partial));
    let offsets: Vec<u64> = job.skipped_sectors().iter().map(|s| s.offset).collect();
    assert_eq!(offsets, bad.to_vec());
    let skipped_events = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::SectorSkipped { .. }))
        .count();
    assert_eq!(skipped_events, 3);
    // Neighbouring sectors were still written
    assert!(device.peek(4096 + 512, 512).iter().all(|b| *b == 0));
}

#[tokio::test]
async fn test_bad_sector_budget_is_enforced() {
    let method = SanitizationMethod {
        id: "test/skip-one".to_string(),
        name: "skip at most one".to_string(),
        standard: StandardReference {
            tier: SanitizationTier::Clear,
            reference: "test".to_string(),
        },
        technology_classes: TechnologyClass::ALL.to_vec(),
        passes: vec![PassSpec::overwrite(
            PatternGenerator::Constant(0),
            VerificationRequirement::ExactMatch,
        )],
        bad_sectors: BadSectorPolicy::SkipAndLog { max_sectors: 1 },
        duration: DurationModel::fixed(0),
        priority: 1,
    };
    let device = SimulatedDevice::builder("sim:budget", TechnologyClass::HDD, MIB)
        .bad_sector(0)
        .bad_sector(8192)
        .build();
    let (executed, _) = run(&device, Arc::new(method), options()).await;
    let job = executed.job;

    assert_eq!(job.outcome(), Some(JobOutcome::Failed));
    assert_eq!(job.skipped_sectors().len(), 2);
}

#[tokio::test]
async fn test_device_removal_aborts() {
    let device = SimulatedDevice::builder("sim:gone", TechnologyClass::HDD, 4 * MIB).build();
    device.remove_after_bytes(MIB);
    let (executed, _) = run(&device, builtin("clear/single-pass-zero"), options()).await;
    let job = executed.job;

    assert_eq!(job.outcome(), Some(JobOutcome::Aborted));
    assert_eq!(job.failure().unwrap().kind, FailureKind::DeviceRemoved);
    assert_eq!(job.passes()[0].bytes_written, MIB);
}

#[tokio::test]
async fn test_restore_failure_makes_job_partial() {
    let device = SimulatedDevice::builder("sim:relock", TechnologyClass::HDD, MIB)
        .hidden_region(HiddenRegionKind::HPA, MIB)
        .fail_relock()
        .build();
    let (executed, events) = run(&device, builtin("clear/single-pass-zero"), options()).await;
    let job = executed.job;

    assert_eq!(job.outcome(), Some(JobOutcome::Partial));
    assert_eq!(job.restore_failures().len(), 1);
    assert_eq!(job.restore_failures()[0].pass_index, Some(0));
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::HiddenRegionRestoreFailed { .. })));
}

#[tokio::test]
async fn test_unlock_failure_fails_before_writing() {
    let device = SimulatedDevice::builder("sim:locked", TechnologyClass::HDD, MIB)
        .hidden_region(HiddenRegionKind::DCO, MIB)
        .fail_unlock()
        .build();
    let (executed, _) = run(&device, builtin("clear/single-pass-zero"), options()).await;
    let job = executed.job;

    assert_eq!(job.outcome(), Some(JobOutcome::Failed));
    assert_eq!(
        job.failure().unwrap().kind,
        FailureKind::HiddenRegionUnlockFailed
    );
    assert_eq!(device.bytes_written(), 0);
    assert_eq!(
        job.hidden_region_events()[0].action,
        RegionAction::ExposeFailed
    );
}

#[tokio::test]
async fn test_crypto_erase_captures_digests_first() {
    let device = SimulatedDevice::builder("sim:nvme", TechnologyClass::NVMe, 4 * MIB).build();
    let (executed, events) = run(&device, builtin("purge/crypto-erase"), options()).await;
    let job = executed.job;

    assert_eq!(job.outcome(), Some(JobOutcome::Success));
    assert!(!job.pre_erasure_digests().is_empty());
    assert_eq!(
        device.firmware_calls(),
        vec![crate::FirmwareErase::CryptoErase]
    );
    assert!(matches!(
        events.get(1),
        Some(ProgressEvent::PreErasureCaptured { .. })
    ));
}

#[tokio::test]
async fn test_firmware_rejection_fails_job() {
    let device = SimulatedDevice::builder("sim:reject", TechnologyClass::NVMe, MIB)
        .fail_firmware()
        .build();
    let (executed, _) = run(&device, builtin("purge/block-erase"), options()).await;
    assert_eq!(executed.job.outcome(), Some(JobOutcome::Failed));
    assert_eq!(
        executed.job.failure().unwrap().kind,
        FailureKind::HardwareCommandFailed
    );
}

#[tokio::test]
async fn test_executed_job_cannot_be_restarted() {
    let device = SimulatedDevice::builder("sim:again", TechnologyClass::HDD, MIB).build();
    let (executed, _) = run(&device, builtin("clear/single-pass-zero"), options()).await;
    let ExecutedJob { job, target } = executed;
    assert!(matches!(
        ErasureExecutor::new().execute(job, target),
        Err(crate::EngineError::JobNotRestartable(_))
    ));
}

#[tokio::test]
async fn test_quiet_worker_reports_stall() {
    let device = SimulatedDevice::builder("sim:slow", TechnologyClass::HDD, 256 * KIB).build();
    device.on_write(Arc::new(|_| std::thread::sleep(Duration::from_millis(50))));
    let opts = JobOptions {
        stall_watermark: Some(Duration::from_millis(5)),
        ..options()
    };
    let (executed, events) = run(&device, builtin("clear/single-pass-zero"), opts).await;

    assert_eq!(executed.job.outcome(), Some(JobOutcome::Success));
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::Stalled { .. })));
}
