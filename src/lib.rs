// Allow uppercase acronyms for industry-standard terms like HDD, NVMe, EMMC, HPA, DCO
#![allow(clippy::upper_case_acronyms)]

pub mod algorithms;
pub mod config;
pub mod crypto;
pub mod drives;
pub mod engine;
pub mod error;
pub mod executor;
pub mod ui;
pub mod verification;

// Re-export the main entry points for convenience
pub use algorithms::{MethodRegistry, SanitizationMethod, SanitizationRequest, SanitizationTier};
pub use crypto::{AttestationGenerator, AttestationRecord};
pub use drives::{DeviceInventory, ErasureTarget};
pub use engine::{SanitizationEngine, SanitizationReport};
pub use executor::{ErasureExecutor, ErasureJob, JobHandle, JobOutcome, ProgressEvent};
pub use verification::{VerificationResult, VerificationSampler, Verdict};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Name and version recorded in every attestation.
pub const TOOL_NAME: &str = "obliterator";
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device is busy: {0}")]
    DeviceBusy(String),

    #[error("Device was removed during the operation: {0}")]
    DeviceRemoved(String),

    #[error("Unsupported combination: {technology} / {request}: {reason}")]
    UnsupportedCombination {
        technology: TechnologyClass,
        request: String,
        reason: String,
    },

    #[error("Failed to unlock {kind} region at offset {offset} on {device}: {reason}")]
    HiddenRegionUnlockFailed {
        device: String,
        kind: HiddenRegionKind,
        offset: u64,
        reason: String,
    },

    #[error("Write failure during pass {pass_index} at offset {offset} ({kind}): {reason}")]
    WriteFailure {
        pass_index: usize,
        offset: u64,
        kind: WriteFailureKind,
        reason: String,
    },

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Signing unavailable: {0}")]
    SigningUnavailable(String),

    #[error("Operation cancelled by caller")]
    Cancelled,

    #[error("Job {0} has already run and cannot be restarted")]
    JobNotRestartable(uuid::Uuid),

    #[error("Job cannot be attested: {0}")]
    NotAttestable(String),

    #[error("Attestation does not verify: {0}")]
    InvalidAttestation(String),

    #[error("Invalid sanitization method: {0}")]
    InvalidMethod(String),

    #[error("Hardware command failed: {0}")]
    HardwareCommandFailed(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Journal(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Whether a failed write ended the job or was skipped and logged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteFailureKind {
    Fatal,
    ToleratedBadSector,
}

impl fmt::Display for WriteFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteFailureKind::Fatal => write!(f, "fatal"),
            WriteFailureKind::ToleratedBadSector => write!(f, "tolerated bad sector"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TechnologyClass {
    HDD,
    SataSSD,
    NVMe,
    EMMC,
    Unknown,
}

impl TechnologyClass {
    pub const ALL: [TechnologyClass; 5] = [
        TechnologyClass::HDD,
        TechnologyClass::SataSSD,
        TechnologyClass::NVMe,
        TechnologyClass::EMMC,
        TechnologyClass::Unknown,
    ];

    /// Wear-leveled flash, where overwrite cannot reach every physical cell.
    pub fn is_flash(&self) -> bool {
        matches!(
            self,
            TechnologyClass::SataSSD | TechnologyClass::NVMe | TechnologyClass::EMMC
        )
    }

    /// Classes where an overwrite method cannot be trusted without acknowledgment.
    pub fn overwrite_needs_acknowledgment(&self) -> bool {
        self.is_flash() || *self == TechnologyClass::Unknown
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TechnologyClass::HDD => "hdd",
            TechnologyClass::SataSSD => "sata-ssd",
            TechnologyClass::NVMe => "nvme",
            TechnologyClass::EMMC => "emmc",
            TechnologyClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TechnologyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TechnologyClass {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hdd" => Ok(TechnologyClass::HDD),
            "sata-ssd" | "ssd" => Ok(TechnologyClass::SataSSD),
            "nvme" => Ok(TechnologyClass::NVMe),
            "emmc" => Ok(TechnologyClass::EMMC),
            "unknown" => Ok(TechnologyClass::Unknown),
            other => Err(EngineError::Config(format!(
                "unknown technology class '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HiddenRegionKind {
    HPA,
    DCO,
    VendorReserved,
    FirmwareArea,
}

impl fmt::Display for HiddenRegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HiddenRegionKind::HPA => "HPA",
            HiddenRegionKind::DCO => "DCO",
            HiddenRegionKind::VendorReserved => "vendor-reserved",
            HiddenRegionKind::FirmwareArea => "firmware-area",
        };
        f.write_str(name)
    }
}

/// A region of native capacity hidden from the user-visible address range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HiddenRegion {
    /// Byte offset in the native address space
    pub offset: u64,
    pub length: u64,
    pub kind: HiddenRegionKind,
    /// Original declared state; restored after each pass unless left exposed
    pub locked: bool,
}

impl HiddenRegion {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// Vendor sanitize primitives a device may expose.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareErase {
    CryptoErase,
    BlockErase,
}

impl fmt::Display for FirmwareErase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareErase::CryptoErase => write!(f, "crypto-erase"),
            FirmwareErase::BlockErase => write!(f, "block-erase"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub serial: String,
    pub model: String,
    pub bus_path: String,
    pub technology: TechnologyClass,
    /// Capacity visible to the operating system, in bytes
    pub reported_capacity: u64,
    /// Capacity including hidden regions, in bytes
    pub native_capacity: u64,
    pub sector_size: u32,
    pub hidden_regions: Vec<HiddenRegion>,
    pub has_hidden_region: bool,
    pub read_only: bool,
    pub removed: bool,
    pub firmware_erase: Vec<FirmwareErase>,
}

impl DeviceDescriptor {
    pub fn new(
        device_id: impl Into<String>,
        technology: TechnologyClass,
        reported_capacity: u64,
        sector_size: u32,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            serial: "Unknown".to_string(),
            model: "Unknown".to_string(),
            bus_path: String::new(),
            technology,
            reported_capacity,
            native_capacity: reported_capacity,
            sector_size,
            hidden_regions: Vec::new(),
            has_hidden_region: false,
            read_only: false,
            removed: false,
            firmware_erase: Vec::new(),
        }
    }

    /// Record discovered hidden regions and recompute the native extent.
    pub fn apply_hidden_regions(&mut self, regions: Vec<HiddenRegion>) {
        let region_end = regions.iter().map(HiddenRegion::end).max().unwrap_or(0);
        self.native_capacity = self.native_capacity.max(region_end);
        self.hidden_regions = regions;
        self.has_hidden_region =
            self.reported_capacity < self.native_capacity || !self.hidden_regions.is_empty();
    }

    pub fn sector_count(&self) -> u64 {
        self.native_capacity / u64::from(self.sector_size.max(1))
    }

    pub fn hidden_bytes(&self) -> u64 {
        self.hidden_regions.iter().map(|r| r.length).sum()
    }

    pub fn supports(&self, primitive: FirmwareErase) -> bool {
        self.firmware_erase.contains(&primitive)
    }
}

/// Opaque identity of the operator who authorized the job; never validated here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct OperatorIdentity(pub String);

impl OperatorIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod lib_tests;
