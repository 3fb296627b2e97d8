#![allow(dead_code)]
/// Shared fixtures for engine integration tests
///
/// Builds engines over simulated devices with a throwaway signing key, and
/// drives jobs to completion while collecting their progress events.
use obliterator_engine::algorithms::SanitizationRequest;
use obliterator_engine::crypto::{AttestationGenerator, AttestationSigner, Ed25519Signer};
use obliterator_engine::drives::{DeviceInventory, SimulatedBackend, SimulatedDevice};
use obliterator_engine::executor::{ControlMessage, JobOptions, ProgressEvent};
use obliterator_engine::verification::VerificationPolicy;
use obliterator_engine::{
    EngineResult, OperatorIdentity, SanitizationEngine, SanitizationReport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

pub type Canceller = tokio::sync::mpsc::UnboundedSender<ControlMessage>;

pub fn operator() -> OperatorIdentity {
    OperatorIdentity::new("integration-tests")
}

pub fn inventory(devices: &[&SimulatedDevice]) -> Arc<DeviceInventory> {
    let backend = SimulatedBackend::new();
    for device in devices {
        backend.add((*device).clone());
    }
    Arc::new(DeviceInventory::new(Arc::new(backend)))
}

pub fn signer() -> Arc<Ed25519Signer> {
    let pkcs8 = Ed25519Signer::generate_pkcs8().expect("key generation");
    Arc::new(Ed25519Signer::from_pkcs8(&pkcs8, "test-station").expect("fresh key loads"))
}

pub fn fast_options(verification: VerificationPolicy) -> JobOptions {
    JobOptions {
        chunk_size: (4 * MIB) as usize,
        verification,
        ..JobOptions::default()
    }
}

/// Engine over `devices` that signs with `signer`.
pub fn engine(
    devices: &[&SimulatedDevice],
    signer: Arc<dyn AttestationSigner>,
    options: JobOptions,
) -> SanitizationEngine {
    SanitizationEngine::new(inventory(devices))
        .with_attestation(AttestationGenerator::new(signer))
        .with_job_options(options)
}

/// Run one job through the engine, collecting every progress event.
pub async fn run(
    engine: &SanitizationEngine,
    device_id: &str,
    request: &SanitizationRequest,
) -> EngineResult<(SanitizationReport, Vec<ProgressEvent>)> {
    let mut events = Vec::new();
    let report = engine
        .run(device_id, request, operator(), |event| events.push(event.clone()))
        .await?;
    Ok((report, events))
}

/// Cancel the job from inside its worker once `threshold` bytes are written.
///
/// The returned sender must be given the job's canceller after it starts;
/// the write hook blocks until it arrives.
pub fn cancel_after(device: &SimulatedDevice, threshold: u64) -> mpsc::Sender<Canceller> {
    let (slot_tx, slot_rx) = mpsc::channel::<Canceller>();
    let slot_rx = Mutex::new(slot_rx);
    let fired = AtomicBool::new(false);
    device.on_write(Arc::new(move |written| {
        if written >= threshold && !fired.swap(true, Ordering::SeqCst) {
            let received = slot_rx.lock().map(|rx| rx.recv());
            if let Ok(Ok(canceller)) = received {
                let _ = canceller.send(ControlMessage::Cancel);
            }
        }
    }));
    slot_tx
}
