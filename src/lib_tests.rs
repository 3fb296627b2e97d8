// Tests for the core types in lib.rs
//
// Covers: error messages, technology classes, hidden regions, device descriptors
// and operator identity.

use super::*;
use test_case::test_case;

// ==================== ERROR TESTS ====================

#[test]
fn test_write_failure_message_carries_position() {
    let err = EngineError::WriteFailure {
        pass_index: 2,
        offset: 4096,
        kind: WriteFailureKind::Fatal,
        reason: "EIO".to_string(),
    };
    let text = err.to_string();
    assert!(text.contains("pass 2"));
    assert!(text.contains("offset 4096"));
    assert!(text.contains("fatal"));
}

#[test]
fn test_unsupported_combination_message() {
    let err = EngineError::UnsupportedCombination {
        technology: TechnologyClass::NVMe,
        request: "clear".to_string(),
        reason: "overwrite needs acknowledgment".to_string(),
    };
    assert!(err.to_string().contains("nvme / clear"));
}

#[test]
fn test_io_error_converts() {
    let err: EngineError = std::io::Error::from_raw_os_error(libc::EIO).into();
    assert!(matches!(err, EngineError::Io(_)));
}

#[test]
fn test_sqlite_error_becomes_journal_error() {
    let err: EngineError = rusqlite::Error::QueryReturnedNoRows.into();
    assert!(matches!(err, EngineError::Journal(_)));
}

// ==================== TECHNOLOGY CLASS TESTS ====================

#[test_case(TechnologyClass::HDD, false ; "hdd")]
#[test_case(TechnologyClass::SataSSD, true ; "sata ssd")]
#[test_case(TechnologyClass::NVMe, true ; "nvme")]
#[test_case(TechnologyClass::EMMC, true ; "emmc")]
#[test_case(TechnologyClass::Unknown, false ; "unknown")]
fn test_is_flash(class: TechnologyClass, flash: bool) {
    assert_eq!(class.is_flash(), flash);
}

#[test]
fn test_unknown_class_needs_acknowledgment() {
    assert!(TechnologyClass::Unknown.overwrite_needs_acknowledgment());
    assert!(TechnologyClass::NVMe.overwrite_needs_acknowledgment());
    assert!(!TechnologyClass::HDD.overwrite_needs_acknowledgment());
}

#[test]
fn test_technology_class_parses_its_display() {
    for class in TechnologyClass::ALL {
        assert_eq!(class.to_string().parse::<TechnologyClass>().unwrap(), class);
    }
    assert_eq!("SSD".parse::<TechnologyClass>().unwrap(), TechnologyClass::SataSSD);
    assert!("floppy".parse::<TechnologyClass>().is_err());
}

// ==================== HIDDEN REGION TESTS ====================

#[test]
fn test_hidden_region_bounds() {
    let region = HiddenRegion {
        offset: 1000,
        length: 24,
        kind: HiddenRegionKind::HPA,
        locked: true,
    };
    assert_eq!(region.end(), 1024);
    assert!(region.contains(1000));
    assert!(region.contains(1023));
    assert!(!region.contains(1024));
    assert!(!region.contains(999));
}

// ==================== DEVICE DESCRIPTOR TESTS ====================

#[test]
fn test_descriptor_without_hidden_regions() {
    let d = DeviceDescriptor::new("sim:a", TechnologyClass::HDD, 1 << 20, 512);
    assert_eq!(d.native_capacity, d.reported_capacity);
    assert_eq!(d.sector_count(), 2048);
    assert!(!d.has_hidden_region);
    assert_eq!(d.hidden_bytes(), 0);
}

#[test]
fn test_hidden_regions_extend_native_capacity() {
    let mut d = DeviceDescriptor::new("sim:a", TechnologyClass::HDD, 1 << 20, 512);
    d.apply_hidden_regions(vec![HiddenRegion {
        offset: 1 << 20,
        length: 1 << 16,
        kind: HiddenRegionKind::DCO,
        locked: true,
    }]);
    assert!(d.has_hidden_region);
    assert_eq!(d.native_capacity, (1 << 20) + (1 << 16));
    assert_eq!(d.hidden_bytes(), 1 << 16);
}

#[test]
fn test_descriptor_firmware_support() {
    let mut d = DeviceDescriptor::new("sim:n", TechnologyClass::NVMe, 1 << 20, 512);
    assert!(!d.supports(FirmwareErase::CryptoErase));
    d.firmware_erase.push(FirmwareErase::CryptoErase);
    assert!(d.supports(FirmwareErase::CryptoErase));
    assert!(!d.supports(FirmwareErase::BlockErase));
}

#[test]
fn test_descriptor_serde_round_trip() {
    let d = DeviceDescriptor::new("sim:a", TechnologyClass::EMMC, 1 << 20, 512);
    let json = serde_json::to_string(&d).unwrap();
    let back: DeviceDescriptor = serde_json::from_str(&json).unwrap();
    assert_eq!(back, d);
}

// ==================== OPERATOR IDENTITY TESTS ====================

#[test]
fn test_operator_identity_is_opaque() {
    let id = OperatorIdentity::new("  anything goes / even this  ");
    assert_eq!(id.as_str(), "  anything goes / even this  ");
    assert_eq!(
        serde_json::to_string(&id).unwrap(),
        "\"  anything goes / even this  \""
    );
}
