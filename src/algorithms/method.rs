// Sanitization method model
//
// A method is an ordered list of passes plus the policy that governs how the
// executor treats bad sectors and how long the method is expected to run.

use crate::{DeviceDescriptor, FirmwareErase, TechnologyClass};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Sanitization rigor tier. Destroy is physical and outside this engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SanitizationTier {
    Clear,
    Purge,
}

impl fmt::Display for SanitizationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanitizationTier::Clear => write!(f, "clear"),
            SanitizationTier::Purge => write!(f, "purge"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StandardReference {
    pub tier: SanitizationTier,
    /// Citation of the standard, e.g. "NIST SP 800-88 Rev. 1"
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatternGenerator {
    Constant(u8),
    Repeating(Vec<u8>),
    /// Seeded random stream; the seed is chosen per job and recorded in it
    Random,
}

impl PatternGenerator {
    pub fn is_random(&self) -> bool {
        matches!(self, PatternGenerator::Random)
    }

    pub fn describe(&self) -> String {
        match self {
            PatternGenerator::Constant(byte) => format!("constant 0x{:02x}", byte),
            PatternGenerator::Repeating(bytes) => format!("repeating {}", hex::encode(bytes)),
            PatternGenerator::Random => "random (seeded)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PassAction {
    Overwrite(PatternGenerator),
    Firmware(FirmwareErase),
}

/// What the sampler must check when this pass is the last one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationRequirement {
    None,
    ExactMatch,
    ContentChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassSpec {
    pub action: PassAction,
    pub verification: VerificationRequirement,
}

impl PassSpec {
    pub fn overwrite(pattern: PatternGenerator, verification: VerificationRequirement) -> Self {
        Self {
            action: PassAction::Overwrite(pattern),
            verification,
        }
    }

    pub fn firmware(primitive: FirmwareErase, verification: VerificationRequirement) -> Self {
        Self {
            action: PassAction::Firmware(primitive),
            verification,
        }
    }

    /// Content the device is expected to return after this pass, when it is deterministic.
    pub fn expected_pattern(&self) -> Option<PatternGenerator> {
        match &self.action {
            PassAction::Overwrite(pattern) => Some(pattern.clone()),
            PassAction::Firmware(FirmwareErase::BlockErase) => Some(PatternGenerator::Constant(0x00)),
            PassAction::Firmware(FirmwareErase::CryptoErase) => None,
        }
    }

    pub fn is_overwrite(&self) -> bool {
        matches!(self.action, PassAction::Overwrite(_))
    }

    pub fn describe(&self) -> String {
        match &self.action {
            PassAction::Overwrite(pattern) => format!("overwrite: {}", pattern.describe()),
            PassAction::Firmware(primitive) => format!("firmware: {}", primitive),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BadSectorPolicy {
    /// First write error fails the job
    FailJob,
    /// Unwritable sectors are skipped and every offset is logged in the job
    SkipAndLog { max_sectors: u64 },
}

impl BadSectorPolicy {
    pub fn tolerates_bad_sectors(&self) -> bool {
        matches!(self, BadSectorPolicy::SkipAndLog { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DurationModel {
    /// Fixed cost (firmware commands, region handling)
    pub fixed_seconds: u64,
    /// Overwrite throughput override; class nominal throughput otherwise
    pub bytes_per_second: Option<u64>,
}

impl DurationModel {
    pub fn fixed(seconds: u64) -> Self {
        Self {
            fixed_seconds: seconds,
            bytes_per_second: None,
        }
    }

    /// Typical sequential write throughput per technology class
    pub fn nominal_throughput(class: TechnologyClass) -> u64 {
        const MB: u64 = 1024 * 1024;
        match class {
            TechnologyClass::HDD => 150 * MB,
            TechnologyClass::SataSSD => 450 * MB,
            TechnologyClass::NVMe => 1500 * MB,
            TechnologyClass::EMMC => 80 * MB,
            TechnologyClass::Unknown => 100 * MB,
        }
    }

    /// Expected wall time to write `bytes` on a device of `class`, plus the fixed cost.
    pub fn estimate(&self, bytes: u64, class: TechnologyClass) -> Duration {
        let throughput = self
            .bytes_per_second
            .unwrap_or_else(|| Self::nominal_throughput(class))
            .max(1);
        Duration::from_secs(self.fixed_seconds + bytes / throughput)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SanitizationMethod {
    pub id: String,
    pub name: String,
    pub standard: StandardReference,
    pub technology_classes: Vec<TechnologyClass>,
    pub passes: Vec<PassSpec>,
    pub bad_sectors: BadSectorPolicy,
    pub duration: DurationModel,
    /// Lower is preferred when the caller does not name a method
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    50
}

impl SanitizationMethod {
    pub fn tier(&self) -> SanitizationTier {
        self.standard.tier
    }

    pub fn applies_to(&self, class: TechnologyClass) -> bool {
        self.technology_classes.contains(&class)
    }

    /// True when any pass relies on overwriting the logical address range.
    pub fn uses_overwrite(&self) -> bool {
        self.passes.iter().any(PassSpec::is_overwrite)
    }

    /// Firmware primitives this method needs from the device.
    pub fn firmware_requirements(&self) -> Vec<FirmwareErase> {
        self.passes
            .iter()
            .filter_map(|p| match p.action {
                PassAction::Firmware(primitive) => Some(primitive),
                PassAction::Overwrite(_) => None,
            })
            .collect()
    }

    pub fn terminal_pass(&self) -> Option<&PassSpec> {
        self.passes.last()
    }

    pub fn expected_duration(&self, descriptor: &DeviceDescriptor) -> Duration {
        let overwrite_passes = self.passes.iter().filter(|p| p.is_overwrite()).count() as u64;
        self.duration.estimate(
            overwrite_passes * descriptor.native_capacity,
            descriptor.technology,
        )
    }
}

impl fmt::Display for SanitizationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.name)
    }
}

/// What the caller asks for: a tier, optionally a specific method.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SanitizationRequest {
    pub tier: SanitizationTier,
    pub method_id: Option<String>,
    /// Caller accepts that overwrite cannot guarantee completeness on flash
    pub acknowledge_incomplete_overwrite: bool,
}

impl SanitizationRequest {
    pub fn new(tier: SanitizationTier) -> Self {
        Self {
            tier,
            method_id: None,
            acknowledge_incomplete_overwrite: false,
        }
    }

    pub fn clear() -> Self {
        Self::new(SanitizationTier::Clear)
    }

    pub fn purge() -> Self {
        Self::new(SanitizationTier::Purge)
    }

    pub fn with_method(mut self, method_id: impl Into<String>) -> Self {
        self.method_id = Some(method_id.into());
        self
    }

    pub fn acknowledging_incomplete_overwrite(mut self) -> Self {
        self.acknowledge_incomplete_overwrite = true;
        self
    }
}

impl fmt::Display for SanitizationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tier)?;
        if let Some(ref id) = self.method_id {
            write!(f, " via {}", id)?;
        }
        if self.acknowledge_incomplete_overwrite {
            write!(f, " (incomplete overwrite acknowledged)")?;
        }
        Ok(())
    }
}
