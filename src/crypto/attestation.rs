// Attestation records
//
// A record is the signed statement of what an erasure job did: the device, the
// method and every pass, hidden-region handling, skipped sectors and the
// verification that followed. Nothing unsigned leaves the generator.

use super::canonical::{canonical_bytes, canonical_timestamp};
use super::signing::{key_fingerprint, verify_signature, AttestationSigner, ED25519_ALGORITHM};
use crate::error::SkippedSector;
use crate::executor::{ErasureJob, JobOutcome, JobState, PassStatus, RegionAction};
use crate::verification::{Verdict, VerificationMode, VerificationResult};
use crate::{
    EngineError, EngineResult, HiddenRegionKind, OperatorIdentity, SanitizationTier,
    TechnologyClass, TOOL_NAME, TOOL_VERSION,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub const SCHEMA_VERSION: u32 = 1;

/// Namespace for certificate ids; each id is a v5 UUID of the job id.
const CERTIFICATE_NAMESPACE: Uuid = Uuid::from_u128(0x6f62_6c69_7465_7261_746f_722d_6365_7274);

pub fn certificate_id_for(job_id: Uuid) -> Uuid {
    Uuid::new_v5(&CERTIFICATE_NAMESPACE, job_id.as_bytes())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

/// Who signed the record. Part of the payload, so the claimed signer is itself signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SignerInfo {
    pub identity: String,
    /// SHA-256 of the raw public key, lowercase hex
    pub key_fingerprint: String,
}

impl SignerInfo {
    pub fn for_signer(signer: &dyn AttestationSigner) -> Self {
        Self {
            identity: signer.signer_identity(),
            key_fingerprint: key_fingerprint(&signer.public_key()),
        }
    }
}

/// Record-keeping fields an operator supplies alongside the job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CertificateContext {
    pub manufacturer: Option<String>,
    pub property_number: Option<String>,
    pub media_type: Option<String>,
    pub media_source: Option<String>,
    pub pre_sanitization_confidentiality: Option<String>,
    pub post_sanitization_confidentiality: Option<String>,
    pub post_sanitization_destination: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HiddenRegionSummary {
    pub kind: HiddenRegionKind,
    pub offset: u64,
    pub length: u64,
    pub declared_locked: bool,
    pub exposed: bool,
    pub restored: bool,
    pub left_exposed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub serial: String,
    pub model: String,
    pub bus_path: String,
    pub technology: TechnologyClass,
    pub reported_capacity: u64,
    pub native_capacity: u64,
    pub sector_size: u32,
    pub hidden_regions: Vec<HiddenRegionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MethodSummary {
    pub id: String,
    pub name: String,
    pub tier: SanitizationTier,
    pub standard: String,
    pub pass_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PassSummary {
    pub index: usize,
    pub description: String,
    pub seed: Option<String>,
    pub started_at: String,
    pub ended_at: String,
    pub bytes_written: u64,
    pub status: PassStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RestoreFailureSummary {
    pub pass_index: Option<usize>,
    pub kind: HiddenRegionKind,
    pub offset: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VerificationSummary {
    /// Plain-language account of how the medium was checked
    pub verification_method: String,
    pub mode: VerificationMode,
    pub sample_seed: String,
    pub sample_plan_digest: String,
    pub sectors_examined: u64,
    pub sectors_matched: u64,
    pub sectors_mismatched: u64,
    pub sectors_unreadable: u64,
    pub excluded_offsets: Vec<u64>,
    pub eligible_sectors: u64,
    pub coverage_basis_points: u32,
    pub policy_min_coverage_basis_points: u32,
    pub expected: String,
    pub hidden_regions_restored: bool,
    pub verdict: Verdict,
    pub verified_at: String,
}

/// The signed content. Field order is the canonical order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AttestationPayload {
    pub schema_version: u32,
    pub certificate_id: Uuid,
    pub job_id: Uuid,
    pub tool: ToolInfo,
    pub signer: SignerInfo,
    pub operator: OperatorIdentity,
    pub device: DeviceIdentity,
    pub context: Option<CertificateContext>,
    pub method: MethodSummary,
    pub passes: Vec<PassSummary>,
    pub skipped_sectors: Vec<SkippedSector>,
    pub restore_failures: Vec<RestoreFailureSummary>,
    pub verification: VerificationSummary,
    pub started_at: String,
    pub ended_at: String,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SignatureBlock {
    pub algorithm: String,
    /// Raw public key, lowercase hex
    pub public_key: String,
    /// Signature over the canonical payload bytes, base64
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AttestationRecord {
    pub payload: AttestationPayload,
    pub signature: SignatureBlock,
}

impl AttestationRecord {
    pub fn canonical_payload(&self) -> EngineResult<Vec<u8>> {
        canonical_bytes(&self.payload)
    }

    pub fn to_json_pretty(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::InvalidAttestation(format!("record not encodable: {}", e)))
    }

    pub fn from_json(text: &str) -> EngineResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| EngineError::InvalidAttestation(format!("malformed record: {}", e)))
    }
}

pub struct AttestationGenerator {
    signer: Option<Arc<dyn AttestationSigner>>,
}

impl AttestationGenerator {
    pub fn new(signer: Arc<dyn AttestationSigner>) -> Self {
        Self {
            signer: Some(signer),
        }
    }

    /// Generator with no key; every `generate` call fails with `SigningUnavailable`.
    pub fn without_signer() -> Self {
        Self { signer: None }
    }

    pub fn has_signer(&self) -> bool {
        self.signer.is_some()
    }

    pub fn generate(
        &self,
        job: &ErasureJob,
        verification: &VerificationResult,
    ) -> EngineResult<AttestationRecord> {
        self.generate_with_context(job, verification, None)
    }

    pub fn generate_with_context(
        &self,
        job: &ErasureJob,
        verification: &VerificationResult,
        context: Option<CertificateContext>,
    ) -> EngineResult<AttestationRecord> {
        check_attestable(job, verification)?;
        let signer = self.signer.as_ref().ok_or_else(|| {
            EngineError::SigningUnavailable("no signing key configured".to_string())
        })?;
        let public_key = signer.public_key();
        let payload = build_payload(
            job,
            verification,
            context,
            SignerInfo::for_signer(signer.as_ref()),
        )?;

        let message = canonical_bytes(&payload)?;
        let signature = signer.sign(&message)?;
        let record = AttestationRecord {
            payload,
            signature: SignatureBlock {
                algorithm: signer.algorithm(),
                public_key: hex::encode(&public_key),
                value: BASE64.encode(signature),
            },
        };
        tracing::info!(
            job_id = %job.job_id(),
            certificate_id = %record.payload.certificate_id,
            signer = %record.payload.signer.identity,
            fingerprint = %record.payload.signer.key_fingerprint,
            "Attestation generated"
        );
        Ok(record)
    }
}

impl std::fmt::Debug for AttestationGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationGenerator")
            .field("signer", &self.signer.as_ref().map(|s| s.signer_identity()))
            .finish()
    }
}

fn verification_method_text(result: &VerificationResult) -> String {
    match result.mode {
        VerificationMode::Full => format!(
            "full read-back of {} sectors compared against {}",
            result.eligible_sectors, result.expected
        ),
        VerificationMode::Sampled => format!(
            "seeded stratified sample of {} sectors ({:.2}% coverage) compared against {}",
            result.sectors_examined,
            result.coverage_percent(),
            result.expected
        ),
    }
}

fn region_summaries(job: &ErasureJob) -> Vec<HiddenRegionSummary> {
    job.target()
        .hidden_regions
        .iter()
        .map(|region| {
            let saw = |action: RegionAction| {
                job.hidden_region_events()
                    .iter()
                    .any(|e| e.region == *region && e.action == action)
            };
            let failed_restore = job.restore_failures().iter().any(|f| f.region == *region);
            let exposed = saw(RegionAction::Exposed);
            HiddenRegionSummary {
                kind: region.kind,
                offset: region.offset,
                length: region.length,
                declared_locked: region.locked,
                exposed,
                restored: exposed && saw(RegionAction::Restored) && !failed_restore,
                left_exposed: saw(RegionAction::LeftExposed),
            }
        })
        .collect()
}

/// Refuse jobs that are not finalized, ended failed or aborted, or carry another verification.
fn check_attestable(
    job: &ErasureJob,
    verification: &VerificationResult,
) -> EngineResult<(JobOutcome, DateTime<Utc>, DateTime<Utc>)> {
    if job.state() != JobState::Finalized {
        return Err(EngineError::NotAttestable(format!(
            "job {} is {:?}, not finalized",
            job.job_id(),
            job.state()
        )));
    }
    let outcome = match job.outcome() {
        Some(outcome) if outcome.is_attestable() => outcome,
        other => {
            return Err(EngineError::NotAttestable(format!(
                "job {} ended {}",
                job.job_id(),
                other.map(|o| o.as_str()).unwrap_or("without an outcome")
            )))
        }
    };
    if job.verification() != Some(verification) {
        return Err(EngineError::NotAttestable(format!(
            "verification result is not the one attached to job {}",
            job.job_id()
        )));
    }
    match (job.started_at(), job.ended_at()) {
        (Some(started), Some(ended)) => Ok((outcome, started, ended)),
        _ => Err(EngineError::NotAttestable(format!(
            "job {} has no execution window",
            job.job_id()
        ))),
    }
}

/// Payload for a finalized, attestable job. Pure: the same job and signer yield the same payload.
pub fn build_payload(
    job: &ErasureJob,
    verification: &VerificationResult,
    context: Option<CertificateContext>,
    signer: SignerInfo,
) -> EngineResult<AttestationPayload> {
    let (outcome, started_at, ended_at) = check_attestable(job, verification)?;
    let descriptor = job.target();
    let method = job.method();
    Ok(AttestationPayload {
        schema_version: SCHEMA_VERSION,
        certificate_id: certificate_id_for(job.job_id()),
        job_id: job.job_id(),
        tool: ToolInfo {
            name: TOOL_NAME.to_string(),
            version: TOOL_VERSION.to_string(),
        },
        signer,
        operator: job.operator().clone(),
        device: DeviceIdentity {
            device_id: descriptor.device_id.clone(),
            serial: descriptor.serial.clone(),
            model: descriptor.model.clone(),
            bus_path: descriptor.bus_path.clone(),
            technology: descriptor.technology,
            reported_capacity: descriptor.reported_capacity,
            native_capacity: descriptor.native_capacity,
            sector_size: descriptor.sector_size,
            hidden_regions: region_summaries(job),
        },
        context,
        method: MethodSummary {
            id: method.id.clone(),
            name: method.name.clone(),
            tier: method.tier(),
            standard: method.standard.reference.clone(),
            pass_count: method.passes.len(),
        },
        passes: job
            .passes()
            .iter()
            .map(|p| PassSummary {
                index: p.index,
                description: p.description.clone(),
                seed: p.seed.map(|s| s.to_hex()),
                started_at: canonical_timestamp(&p.started_at),
                ended_at: canonical_timestamp(&p.ended_at),
                bytes_written: p.bytes_written,
                status: p.status,
            })
            .collect(),
        skipped_sectors: job.skipped_sectors().to_vec(),
        restore_failures: job
            .restore_failures()
            .iter()
            .map(|f| RestoreFailureSummary {
                pass_index: f.pass_index,
                kind: f.region.kind,
                offset: f.region.offset,
                reason: f.reason.clone(),
            })
            .collect(),
        verification: VerificationSummary {
            verification_method: verification_method_text(verification),
            mode: verification.mode,
            sample_seed: job.sample_seed().to_hex(),
            sample_plan_digest: verification.sample_plan_digest.clone(),
            sectors_examined: verification.sectors_examined,
            sectors_matched: verification.sectors_matched,
            sectors_mismatched: verification.sectors_mismatched,
            sectors_unreadable: verification.sectors_unreadable,
            excluded_offsets: verification.excluded_offsets.clone(),
            eligible_sectors: verification.eligible_sectors,
            coverage_basis_points: verification.coverage_basis_points,
            policy_min_coverage_basis_points: verification.policy_min_coverage_basis_points,
            expected: verification.expected.clone(),
            hidden_regions_restored: verification.hidden_regions_restored,
            verdict: verification.verdict,
            verified_at: canonical_timestamp(&verification.verified_at),
        },
        started_at: canonical_timestamp(&started_at),
        ended_at: canonical_timestamp(&ended_at),
        outcome,
    })
}

/// Check a record's signature, optionally pinning the key it must be signed with.
pub fn verify_record(
    record: &AttestationRecord,
    trusted_public_key: Option<&[u8]>,
) -> EngineResult<()> {
    let payload = &record.payload;
    let signature = &record.signature;

    if payload.schema_version != SCHEMA_VERSION {
        return Err(EngineError::InvalidAttestation(format!(
            "unsupported schema version {}",
            payload.schema_version
        )));
    }
    if signature.algorithm != ED25519_ALGORITHM {
        return Err(EngineError::InvalidAttestation(format!(
            "unsupported algorithm {}",
            signature.algorithm
        )));
    }
    if payload.certificate_id != certificate_id_for(payload.job_id) {
        return Err(EngineError::InvalidAttestation(
            "certificate id does not derive from the job id".to_string(),
        ));
    }

    let public_key = hex::decode(&signature.public_key)
        .map_err(|e| EngineError::InvalidAttestation(format!("public key encoding: {}", e)))?;
    if let Some(trusted) = trusted_public_key {
        if trusted != public_key.as_slice() {
            return Err(EngineError::InvalidAttestation(
                "signed with an untrusted key".to_string(),
            ));
        }
    }
    if key_fingerprint(&public_key) != payload.signer.key_fingerprint {
        return Err(EngineError::InvalidAttestation(
            "key fingerprint does not match public key".to_string(),
        ));
    }

    let value = BASE64
        .decode(&signature.value)
        .map_err(|e| EngineError::InvalidAttestation(format!("signature encoding: {}", e)))?;
    verify_signature(&public_key, &record.canonical_payload()?, &value)
}
