// Sanitization engine
//
// Ties the components together for one device at a time:
// inspect -> resolve -> lease -> execute -> verify -> finalize -> attest.
// Every check that can refuse a job runs before the first write.

use crate::algorithms::{MethodRegistry, SanitizationRequest};
use crate::config::EngineConfig;
use crate::crypto::attestation::CertificateContext;
use crate::crypto::{AttestationGenerator, AttestationRecord, Ed25519Signer};
use crate::drives::{DeviceInventory, ErasureTarget};
use crate::error::{JobJournal, JournalEntry, JournalState};
use crate::executor::{
    ErasureExecutor, ErasureJob, ExecutedJob, JobHandle, JobOptions, JobOutcome, JobState,
    ProgressEvent,
};
use crate::verification::VerificationSampler;
use crate::{DeviceDescriptor, EngineError, EngineResult, OperatorIdentity};
use std::io;
use std::sync::{Arc, Mutex};

/// A finalized job and, when the outcome allows one, its attestation.
#[derive(Debug)]
pub struct SanitizationReport {
    pub job: ErasureJob,
    /// `None` when the job is not attestable and no attestation was attempted
    pub attestation: Option<EngineResult<AttestationRecord>>,
}

impl SanitizationReport {
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.job.outcome()
    }

    pub fn attestation(&self) -> Option<&AttestationRecord> {
        self.attestation.as_ref().and_then(|a| a.as_ref().ok())
    }
}

pub struct SanitizationEngine {
    inventory: Arc<DeviceInventory>,
    registry: Arc<MethodRegistry>,
    executor: ErasureExecutor,
    sampler: VerificationSampler,
    attestation: AttestationGenerator,
    journal: Option<Mutex<JobJournal>>,
    options: JobOptions,
    context: Option<CertificateContext>,
}

impl SanitizationEngine {
    /// Engine over `inventory` with the built-in catalog, default options, no journal and no key.
    pub fn new(inventory: Arc<DeviceInventory>) -> Self {
        Self {
            inventory,
            registry: MethodRegistry::builtin(),
            executor: ErasureExecutor::new(),
            sampler: VerificationSampler::new(),
            attestation: AttestationGenerator::without_signer(),
            journal: None,
            options: JobOptions::default(),
            context: None,
        }
    }

    /// Engine configured from `config`. A missing key file leaves attestation unavailable.
    pub fn from_config(inventory: Arc<DeviceInventory>, config: &EngineConfig) -> EngineResult<Self> {
        let mut engine = Self::new(inventory)
            .with_registry(config.registry()?)
            .with_job_options(config.job_options()?);

        if let Some(ref path) = config.journal_path {
            engine = engine.with_journal(JobJournal::open(path)?);
        }
        match config.signing_key_path {
            Some(ref path) if path.exists() => {
                let signer = Ed25519Signer::from_pkcs8_file(path, config.signer_identity.clone())?;
                engine = engine.with_attestation(AttestationGenerator::new(Arc::new(signer)));
            }
            Some(ref path) => {
                tracing::warn!(path = %path.display(), "No signing key; attestations cannot be issued");
            }
            None => {}
        }
        Ok(engine)
    }

    pub fn with_registry(mut self, registry: Arc<MethodRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_attestation(mut self, generator: AttestationGenerator) -> Self {
        self.attestation = generator;
        self
    }

    pub fn with_journal(mut self, journal: JobJournal) -> Self {
        self.journal = Some(Mutex::new(journal));
        self
    }

    pub fn with_job_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Record-keeping fields included in every attestation this engine signs.
    pub fn with_certificate_context(mut self, context: CertificateContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn inventory(&self) -> &Arc<DeviceInventory> {
        &self.inventory
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn enumerate(&self) -> EngineResult<Vec<DeviceDescriptor>> {
        self.inventory.enumerate()
    }

    pub fn inspect(&self, device_id: &str) -> EngineResult<DeviceDescriptor> {
        self.inventory.inspect(device_id)
    }

    fn with_journal_locked<T>(
        &self,
        f: impl FnOnce(&mut JobJournal) -> EngineResult<T>,
    ) -> EngineResult<Option<T>> {
        match self.journal {
            Some(ref journal) => {
                let mut guard = journal
                    .lock()
                    .map_err(|_| EngineError::Journal("journal lock poisoned".to_string()))?;
                f(&mut guard).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Mark jobs a previous process left in progress as aborted and report them.
    pub fn recover_interrupted(&self) -> EngineResult<Vec<JournalEntry>> {
        Ok(self
            .with_journal_locked(|j| j.recover_interrupted())?
            .unwrap_or_default())
    }

    /// Journal history, most recent first; empty without a journal.
    pub fn journal_entries(&self) -> EngineResult<Vec<JournalEntry>> {
        Ok(self.with_journal_locked(|j| j.entries())?.unwrap_or_default())
    }

    /// Inspect, resolve and lease a device, producing a job ready to start.
    pub fn prepare(
        &self,
        device_id: &str,
        request: &SanitizationRequest,
        operator: OperatorIdentity,
    ) -> EngineResult<(ErasureJob, ErasureTarget)> {
        self.prepare_with_options(device_id, request, operator, self.options.clone())
    }

    pub fn prepare_with_options(
        &self,
        device_id: &str,
        request: &SanitizationRequest,
        operator: OperatorIdentity,
        options: JobOptions,
    ) -> EngineResult<(ErasureJob, ErasureTarget)> {
        let descriptor = self.inventory.inspect(device_id)?;
        let method = self.registry.resolve_for_device(&descriptor, request)?;
        let target = self.inventory.open_exclusive(device_id)?;
        let job = ErasureJob::new(operator, target.descriptor.clone(), method, options)?;
        tracing::info!(
            job_id = %job.job_id(),
            device = device_id,
            method = %job.method().id,
            estimate = %humantime::format_duration(job.method().expected_duration(job.target())),
            "Erasure job prepared"
        );
        Ok((job, target))
    }

    /// Journal the job and hand it to a worker.
    pub fn start(&self, job: ErasureJob, target: ErasureTarget) -> EngineResult<JobHandle> {
        let job_id = job.job_id();
        if job.state() != JobState::Created {
            return Err(EngineError::JobNotRestartable(job_id));
        }
        self.with_journal_locked(|j| {
            j.record_started(
                job_id,
                &job.target().device_id,
                &job.method().id,
                job.operator().as_str(),
            )
        })?;

        self.executor.execute(job, target).map_err(|err| {
            let detail = err.to_string();
            if let Err(e) = self.with_journal_locked(|j| {
                j.record_finished(job_id, JournalState::Aborted, "aborted", Some(&detail))
            }) {
                tracing::error!(job_id = %job_id, error = %e, "Failed to journal refused job");
            }
            err
        })
    }

    /// Verify (when execution allows it), finalize, release the device and attest.
    pub async fn complete(&self, executed: ExecutedJob) -> EngineResult<SanitizationReport> {
        let ExecutedJob { mut job, target } = executed;

        let target = match job.outcome() {
            Some(JobOutcome::Failed) | Some(JobOutcome::Aborted) => {
                job.finalize_unverified()?;
                target
            }
            _ => {
                let sampler = self.sampler;
                let (returned_job, target, result) = tokio::task::spawn_blocking(move || {
                    let mut target = target;
                    let result = sampler.verify(&job, &mut target);
                    (job, target, result)
                })
                .await
                .map_err(|e| {
                    EngineError::Io(io::Error::other(format!("verification worker failed: {}", e)))
                })?;
                job = returned_job;
                match result {
                    Ok(verification) => job.attach_verification(verification)?,
                    Err(err) => job.fail_verification(&err),
                }
                target
            }
        };
        // The lease ends here; the device is free for the next job
        drop(target);

        let outcome = job.outcome().unwrap_or(JobOutcome::Failed);
        let state = if outcome == JobOutcome::Aborted {
            JournalState::Aborted
        } else {
            JournalState::Completed
        };
        let detail = job.explain();
        if let Err(e) = self.with_journal_locked(|j| {
            j.record_finished(job.job_id(), state, outcome.as_str(), Some(&detail))
        }) {
            tracing::error!(job_id = %job.job_id(), error = %e, "Failed to journal job completion");
        }

        let attestation = if outcome.is_attestable() {
            Some(self.attest(&job))
        } else {
            tracing::info!(job_id = %job.job_id(), %outcome, "Job not attestable");
            None
        };
        Ok(SanitizationReport { job, attestation })
    }

    /// Signed record for a finalized success or partial job.
    pub fn attest(&self, job: &ErasureJob) -> EngineResult<AttestationRecord> {
        let verification = job.verification().ok_or_else(|| {
            EngineError::NotAttestable(format!("job {} has no verification result", job.job_id()))
        })?;
        self.attestation
            .generate_with_context(job, verification, self.context.clone())
    }

    /// Prepare, run and complete one job, passing every progress event to `on_event`.
    pub async fn run(
        &self,
        device_id: &str,
        request: &SanitizationRequest,
        operator: OperatorIdentity,
        mut on_event: impl FnMut(&ProgressEvent),
    ) -> EngineResult<SanitizationReport> {
        let (job, target) = self.prepare(device_id, request, operator)?;
        let mut handle = self.start(job, target)?;
        while let Some(event) = handle.next_event().await {
            on_event(&event);
        }
        let executed = handle.finish().await?;
        self.complete(executed).await
    }
}

impl std::fmt::Debug for SanitizationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SanitizationEngine")
            .field("methods", &self.registry.len())
            .field("attestation", &self.attestation)
            .field("journal", &self.journal.is_some())
            .field("options", &self.options)
            .finish()
    }
}
