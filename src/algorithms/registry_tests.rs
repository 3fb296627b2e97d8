// Tests for method resolution policy and catalog validation

use super::method::*;
use super::registry::*;
use crate::{DeviceDescriptor, EngineError, FirmwareErase, TechnologyClass};
use proptest::prelude::*;
use test_case::test_case;

fn flash_device(class: TechnologyClass, primitives: &[FirmwareErase]) -> DeviceDescriptor {
    let mut descriptor = DeviceDescriptor::new("sim:flash", class, 1 << 30, 512);
    descriptor.firmware_erase = primitives.to_vec();
    descriptor
}

#[test]
fn test_builtin_catalog_passes_validation() {
    let registry = MethodRegistry::builder().with_builtin().build().unwrap();
    assert_eq!(registry.len(), builtin_methods().len());
    assert_eq!(registry.len(), MethodRegistry::builtin().len());
}

#[test_case(TechnologyClass::HDD, SanitizationRequest::clear(), "clear/single-pass-zero" ; "hdd clear")]
#[test_case(TechnologyClass::HDD, SanitizationRequest::purge(), "purge/three-pass" ; "hdd purge")]
#[test_case(TechnologyClass::NVMe, SanitizationRequest::purge(), "purge/crypto-erase" ; "nvme purge")]
#[test_case(TechnologyClass::NVMe, SanitizationRequest::clear(), "purge/crypto-erase" ; "nvme clear prefers vendor primitive")]
#[test_case(TechnologyClass::SataSSD, SanitizationRequest::purge(), "purge/crypto-erase" ; "sata ssd purge")]
#[test_case(TechnologyClass::EMMC, SanitizationRequest::clear(), "purge/crypto-erase" ; "emmc clear")]
fn test_default_resolution(class: TechnologyClass, request: SanitizationRequest, expected: &str) {
    let registry = MethodRegistry::builtin();
    let method = registry.resolve(class, &request).unwrap();
    assert_eq!(method.id, expected);
}

#[test]
fn test_overwrite_on_nvme_without_acknowledgment_is_rejected() {
    let registry = MethodRegistry::builtin();
    let request = SanitizationRequest::clear().with_method("clear/single-pass-zero");

    let err = registry.resolve(TechnologyClass::NVMe, &request).unwrap_err();
    match err {
        EngineError::UnsupportedCombination {
            technology, reason, ..
        } => {
            assert_eq!(technology, TechnologyClass::NVMe);
            assert!(reason.contains("acknowledgment"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_overwrite_on_nvme_with_acknowledgment_is_allowed() {
    let registry = MethodRegistry::builtin();
    let request = SanitizationRequest::clear()
        .with_method("clear/single-pass-zero")
        .acknowledging_incomplete_overwrite();

    let method = registry.resolve(TechnologyClass::NVMe, &request).unwrap();
    assert_eq!(method.id, "clear/single-pass-zero");
}

#[test]
fn test_device_without_vendor_primitives_needs_acknowledgment() {
    let registry = MethodRegistry::builtin();
    let device = flash_device(TechnologyClass::SataSSD, &[]);

    let err = registry
        .resolve_for_device(&device, &SanitizationRequest::purge())
        .unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedCombination { .. }));

    let acknowledged = SanitizationRequest::purge().acknowledging_incomplete_overwrite();
    let method = registry.resolve_for_device(&device, &acknowledged).unwrap();
    assert_eq!(method.id, "purge/three-pass");
}

#[test]
fn test_device_with_only_block_erase_gets_block_erase() {
    let registry = MethodRegistry::builtin();
    let device = flash_device(TechnologyClass::NVMe, &[FirmwareErase::BlockErase]);

    let method = registry
        .resolve_for_device(&device, &SanitizationRequest::purge())
        .unwrap();
    assert_eq!(method.id, "purge/block-erase");
}

#[test]
fn test_acknowledged_flash_request_still_prefers_vendor_primitive() {
    let registry = MethodRegistry::builtin();
    let request = SanitizationRequest::purge().acknowledging_incomplete_overwrite();
    let method = registry.resolve(TechnologyClass::NVMe, &request).unwrap();
    assert_eq!(method.id, "purge/crypto-erase");
}

#[test]
fn test_unknown_method_id() {
    let registry = MethodRegistry::builtin();
    let request = SanitizationRequest::clear().with_method("gutmann");
    let err = registry.resolve(TechnologyClass::HDD, &request).unwrap_err();
    assert!(err.to_string().contains("no method registered"));
}

#[test]
fn test_explicit_method_below_requested_tier_is_rejected() {
    let registry = MethodRegistry::builtin();
    let request = SanitizationRequest::purge().with_method("clear/single-pass-zero");
    assert!(registry.resolve(TechnologyClass::HDD, &request).is_err());
}

#[test]
fn test_crypto_erase_not_offered_for_hdd() {
    let registry = MethodRegistry::builtin();
    let request = SanitizationRequest::purge().with_method("purge/crypto-erase");
    assert!(registry.resolve(TechnologyClass::HDD, &request).is_err());
}

#[test]
fn test_unknown_class_requires_acknowledgment() {
    let registry = MethodRegistry::builtin();
    assert!(registry
        .resolve(TechnologyClass::Unknown, &SanitizationRequest::clear())
        .is_err());
    let method = registry
        .resolve(
            TechnologyClass::Unknown,
            &SanitizationRequest::clear().acknowledging_incomplete_overwrite(),
        )
        .unwrap();
    assert_eq!(method.id, "clear/single-pass-zero");
}

#[test]
fn test_empty_pass_list_rejected_at_registration() {
    let mut method = builtin_methods().remove(0);
    method.id = "custom/empty".to_string();
    method.passes.clear();

    let err = MethodRegistry::builder().register(method).build().unwrap_err();
    assert!(err.to_string().contains("pass specification is empty"));
}

#[test]
fn test_duplicate_ids_rejected() {
    let method = builtin_methods().remove(0);
    let result = MethodRegistry::builder()
        .with_builtin()
        .register(method)
        .build();
    assert!(matches!(result, Err(EngineError::InvalidMethod(_))));
}

#[test]
fn test_terminal_pass_must_be_verifiable() {
    let mut method = builtin_methods().remove(0);
    method.id = "custom/unverified".to_string();
    method.passes[0].verification = VerificationRequirement::None;
    assert!(validate_method(&method).is_err());
}

#[test]
fn test_exact_match_on_crypto_erase_rejected() {
    let mut method = builtin_methods()
        .into_iter()
        .find(|m| m.id == "purge/crypto-erase")
        .unwrap();
    method.passes[0].verification = VerificationRequirement::ExactMatch;
    assert!(validate_method(&method).is_err());
}

#[test]
fn test_configured_method_extends_catalog() {
    let custom = SanitizationMethod {
        id: "purge/alternating".to_string(),
        name: "Purge: alternating bit pattern".to_string(),
        standard: StandardReference {
            tier: SanitizationTier::Purge,
            reference: "internal policy 7".to_string(),
        },
        technology_classes: vec![TechnologyClass::HDD],
        passes: vec![
            PassSpec::overwrite(
                PatternGenerator::Repeating(vec![0x55, 0xAA]),
                VerificationRequirement::None,
            ),
            PassSpec::overwrite(
                PatternGenerator::Constant(0x00),
                VerificationRequirement::ExactMatch,
            ),
        ],
        bad_sectors: BadSectorPolicy::FailJob,
        duration: DurationModel::fixed(0),
        priority: 5,
    };

    let registry = MethodRegistry::builder()
        .with_builtin()
        .register(custom)
        .build()
        .unwrap();

    // Lower priority number wins among same-tier HDD purge methods
    let method = registry
        .resolve(TechnologyClass::HDD, &SanitizationRequest::purge())
        .unwrap();
    assert_eq!(method.id, "purge/alternating");
}

#[test]
fn test_expected_duration_scales_with_passes() {
    let registry = MethodRegistry::builtin();
    let device = DeviceDescriptor::new("sim:hdd", TechnologyClass::HDD, 150 * 1024 * 1024 * 10, 512);

    let single = registry.get("clear/single-pass-zero").unwrap();
    let triple = registry.get("purge/three-pass").unwrap();
    assert_eq!(single.expected_duration(&device).as_secs(), 10);
    assert_eq!(triple.expected_duration(&device).as_secs(), 30);
}

fn any_class() -> impl Strategy<Value = TechnologyClass> {
    prop::sample::select(TechnologyClass::ALL.to_vec())
}

fn any_request() -> impl Strategy<Value = SanitizationRequest> {
    (any::<bool>(), any::<bool>(), prop::option::of(prop::sample::select(
        builtin_methods().into_iter().map(|m| m.id).collect::<Vec<_>>(),
    )))
        .prop_map(|(purge, ack, method_id)| SanitizationRequest {
            tier: if purge {
                SanitizationTier::Purge
            } else {
                SanitizationTier::Clear
            },
            method_id,
            acknowledge_incomplete_overwrite: ack,
        })
}

proptest! {
    #[test]
    fn prop_resolved_methods_have_passes(class in any_class(), request in any_request()) {
        let registry = MethodRegistry::builtin();
        if let Ok(method) = registry.resolve(class, &request) {
            prop_assert!(!method.passes.is_empty());
            prop_assert!(method.applies_to(class));
            prop_assert!(method.tier() >= request.tier);
        }
    }

    #[test]
    fn prop_flash_overwrite_always_acknowledged(class in any_class(), request in any_request()) {
        let registry = MethodRegistry::builtin();
        if let Ok(method) = registry.resolve(class, &request) {
            if method.uses_overwrite() && class.is_flash() {
                prop_assert!(request.acknowledge_incomplete_overwrite);
            }
        }
    }
}
