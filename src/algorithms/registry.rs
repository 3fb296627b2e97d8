// Sanitization Method Registry
//
// The catalog is assembled once (built-in methods plus any configured extras)
// and is read-only afterwards, so jobs share it through an Arc without locking.

use super::method::{
    BadSectorPolicy, DurationModel, PassAction, PassSpec, PatternGenerator, SanitizationMethod,
    SanitizationRequest, SanitizationTier, StandardReference, VerificationRequirement,
};
use crate::{DeviceDescriptor, EngineError, EngineResult, FirmwareErase, TechnologyClass};
use lazy_static::lazy_static;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default cap on skipped sectors before a skip-and-log method gives up
pub const DEFAULT_MAX_BAD_SECTORS: u64 = 10_000;

const NIST_800_88: &str = "NIST SP 800-88 Rev. 1";

lazy_static! {
    static ref BUILTIN_REGISTRY: Arc<MethodRegistry> = Arc::new(MethodRegistry {
        methods: builtin_methods()
            .into_iter()
            .map(|m| (m.id.clone(), Arc::new(m)))
            .collect(),
    });
}

/// The built-in catalog.
pub fn builtin_methods() -> Vec<SanitizationMethod> {
    let all_classes = TechnologyClass::ALL.to_vec();
    let flash = vec![
        TechnologyClass::SataSSD,
        TechnologyClass::NVMe,
        TechnologyClass::EMMC,
    ];

    vec![
        SanitizationMethod {
            id: "clear/single-pass-zero".to_string(),
            name: "Clear: single verified zero overwrite".to_string(),
            standard: StandardReference {
                tier: SanitizationTier::Clear,
                reference: NIST_800_88.to_string(),
            },
            technology_classes: all_classes.clone(),
            passes: vec![PassSpec::overwrite(
                PatternGenerator::Constant(0x00),
                VerificationRequirement::ExactMatch,
            )],
            bad_sectors: BadSectorPolicy::FailJob,
            duration: DurationModel::fixed(0),
            priority: 10,
        },
        SanitizationMethod {
            id: "clear/single-pass-zero-skip-bad".to_string(),
            name: "Clear: zero overwrite, skipping and logging unwritable sectors".to_string(),
            standard: StandardReference {
                tier: SanitizationTier::Clear,
                reference: NIST_800_88.to_string(),
            },
            technology_classes: all_classes.clone(),
            passes: vec![PassSpec::overwrite(
                PatternGenerator::Constant(0x00),
                VerificationRequirement::ExactMatch,
            )],
            bad_sectors: BadSectorPolicy::SkipAndLog {
                max_sectors: DEFAULT_MAX_BAD_SECTORS,
            },
            duration: DurationModel::fixed(0),
            priority: 90,
        },
        SanitizationMethod {
            id: "purge/three-pass".to_string(),
            name: "Purge: 0x00, 0xFF, seeded random with verification".to_string(),
            standard: StandardReference {
                tier: SanitizationTier::Purge,
                reference: NIST_800_88.to_string(),
            },
            technology_classes: all_classes,
            passes: vec![
                PassSpec::overwrite(
                    PatternGenerator::Constant(0x00),
                    VerificationRequirement::None,
                ),
                PassSpec::overwrite(
                    PatternGenerator::Constant(0xFF),
                    VerificationRequirement::None,
                ),
                PassSpec::overwrite(PatternGenerator::Random, VerificationRequirement::ExactMatch),
            ],
            bad_sectors: BadSectorPolicy::FailJob,
            duration: DurationModel::fixed(0),
            priority: 10,
        },
        SanitizationMethod {
            id: "purge/crypto-erase".to_string(),
            name: "Purge: vendor cryptographic erase".to_string(),
            standard: StandardReference {
                tier: SanitizationTier::Purge,
                reference: NIST_800_88.to_string(),
            },
            technology_classes: flash.clone(),
            passes: vec![PassSpec::firmware(
                FirmwareErase::CryptoErase,
                VerificationRequirement::ContentChanged,
            )],
            bad_sectors: BadSectorPolicy::FailJob,
            duration: DurationModel::fixed(30),
            priority: 10,
        },
        SanitizationMethod {
            id: "purge/block-erase".to_string(),
            name: "Purge: vendor block erase".to_string(),
            standard: StandardReference {
                tier: SanitizationTier::Purge,
                reference: NIST_800_88.to_string(),
            },
            technology_classes: flash,
            passes: vec![PassSpec::firmware(
                FirmwareErase::BlockErase,
                VerificationRequirement::ExactMatch,
            )],
            bad_sectors: BadSectorPolicy::FailJob,
            duration: DurationModel::fixed(300),
            priority: 20,
        },
    ]
}

/// Check a method against the catalog invariants.
pub fn validate_method(method: &SanitizationMethod) -> EngineResult<()> {
    if method.id.trim().is_empty() {
        return Err(EngineError::InvalidMethod("method id is empty".to_string()));
    }
    if method.passes.is_empty() {
        return Err(EngineError::InvalidMethod(format!(
            "{}: pass specification is empty",
            method.id
        )));
    }
    if method.technology_classes.is_empty() {
        return Err(EngineError::InvalidMethod(format!(
            "{}: no technology classes",
            method.id
        )));
    }
    for (index, pass) in method.passes.iter().enumerate() {
        if let PassAction::Overwrite(PatternGenerator::Repeating(bytes)) = &pass.action {
            if bytes.is_empty() {
                return Err(EngineError::InvalidMethod(format!(
                    "{}: pass {} has an empty repeating pattern",
                    method.id, index
                )));
            }
        }
        if pass.verification == VerificationRequirement::ExactMatch
            && pass.expected_pattern().is_none()
        {
            return Err(EngineError::InvalidMethod(format!(
                "{}: pass {} requires an exact match but leaves indeterminate content",
                method.id, index
            )));
        }
    }
    if let Some(terminal) = method.terminal_pass() {
        if terminal.verification == VerificationRequirement::None {
            return Err(EngineError::InvalidMethod(format!(
                "{}: final pass must declare a verification requirement",
                method.id
            )));
        }
    }
    if let BadSectorPolicy::SkipAndLog { max_sectors } = method.bad_sectors {
        if max_sectors == 0 {
            return Err(EngineError::InvalidMethod(format!(
                "{}: skip-and-log needs a non-zero sector budget",
                method.id
            )));
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct MethodRegistry {
    methods: BTreeMap<String, Arc<SanitizationMethod>>,
}

#[derive(Debug, Default)]
pub struct MethodRegistryBuilder {
    methods: Vec<SanitizationMethod>,
}

impl MethodRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin(mut self) -> Self {
        self.methods.extend(builtin_methods());
        self
    }

    pub fn register(mut self, method: SanitizationMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn extend(mut self, methods: impl IntoIterator<Item = SanitizationMethod>) -> Self {
        self.methods.extend(methods);
        self
    }

    pub fn build(self) -> EngineResult<MethodRegistry> {
        let mut methods = BTreeMap::new();
        for method in self.methods {
            validate_method(&method)?;
            if methods.contains_key(&method.id) {
                return Err(EngineError::InvalidMethod(format!(
                    "duplicate method id {}",
                    method.id
                )));
            }
            methods.insert(method.id.clone(), Arc::new(method));
        }
        Ok(MethodRegistry { methods })
    }
}

impl MethodRegistry {
    pub fn builder() -> MethodRegistryBuilder {
        MethodRegistryBuilder::new()
    }

    /// Process-wide built-in catalog
    pub fn builtin() -> Arc<MethodRegistry> {
        Arc::clone(&BUILTIN_REGISTRY)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SanitizationMethod>> {
        self.methods.get(id).cloned()
    }

    pub fn methods(&self) -> impl Iterator<Item = &Arc<SanitizationMethod>> {
        self.methods.values()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Resolve a method for a technology class, assuming the class's vendor
    /// primitives are available.
    pub fn resolve(
        &self,
        technology: TechnologyClass,
        request: &SanitizationRequest,
    ) -> EngineResult<Arc<SanitizationMethod>> {
        self.resolve_inner(technology, request, None)
    }

    /// Resolve a method for a concrete device, honouring which vendor
    /// primitives it actually supports.
    pub fn resolve_for_device(
        &self,
        descriptor: &DeviceDescriptor,
        request: &SanitizationRequest,
    ) -> EngineResult<Arc<SanitizationMethod>> {
        self.resolve_inner(
            descriptor.technology,
            request,
            Some(descriptor.firmware_erase.as_slice()),
        )
    }

    fn resolve_inner(
        &self,
        technology: TechnologyClass,
        request: &SanitizationRequest,
        supported: Option<&[FirmwareErase]>,
    ) -> EngineResult<Arc<SanitizationMethod>> {
        let unsupported = |reason: String| EngineError::UnsupportedCombination {
            technology,
            request: request.to_string(),
            reason,
        };

        if let Some(ref id) = request.method_id {
            let method = self
                .get(id)
                .ok_or_else(|| unsupported(format!("no method registered as '{}'", id)))?;
            if let Err(reason) = Self::check_applicable(&method, technology, request, supported) {
                return Err(unsupported(reason));
            }
            tracing::debug!(method = %method.id, %technology, "Resolved explicitly requested method");
            return Ok(method);
        }

        let mut rejections = Vec::new();
        let mut candidates: Vec<&Arc<SanitizationMethod>> = Vec::new();
        for method in self.methods.values() {
            match Self::check_applicable(method, technology, request, supported) {
                Ok(()) => candidates.push(method),
                Err(reason) if method.applies_to(technology) => {
                    rejections.push(format!("{}: {}", method.id, reason))
                }
                Err(_) => {}
            }
        }

        // Vendor primitives before overwrite, closest tier, then catalog priority
        candidates.sort_by_key(|m| {
            (
                m.uses_overwrite() && technology.is_flash(),
                m.tier() as u8 - request.tier as u8,
                m.priority,
                m.id.clone(),
            )
        });

        match candidates.first() {
            Some(method) => {
                tracing::debug!(method = %method.id, %technology, "Resolved method from policy");
                Ok(Arc::clone(method))
            }
            None if rejections.is_empty() => Err(unsupported(
                "no registered method covers this technology class and tier".to_string(),
            )),
            None => Err(unsupported(rejections.join("; "))),
        }
    }

    fn check_applicable(
        method: &SanitizationMethod,
        technology: TechnologyClass,
        request: &SanitizationRequest,
        supported: Option<&[FirmwareErase]>,
    ) -> Result<(), String> {
        if !method.applies_to(technology) {
            return Err(format!("method does not apply to {}", technology));
        }
        if method.tier() < request.tier {
            return Err(format!(
                "method tier {} is below the requested {}",
                method.tier(),
                request.tier
            ));
        }
        if method.uses_overwrite()
            && technology.overwrite_needs_acknowledgment()
            && !request.acknowledge_incomplete_overwrite
        {
            return Err(
                "overwrite cannot guarantee completeness on this media; explicit acknowledgment required"
                    .to_string(),
            );
        }
        if let Some(supported) = supported {
            if let Some(missing) = method
                .firmware_requirements()
                .into_iter()
                .find(|p| !supported.contains(p))
            {
                return Err(format!("device does not support {}", missing));
            }
        }
        Ok(())
    }
}
