// Parsing and region layout tests for HPA/DCO handling
use super::hpa_dco::*;
use crate::HiddenRegionKind;

// ============================================================================
// hdparm -N parsing
// ============================================================================

#[test]
fn test_parse_max_sectors_with_hpa() {
    let output = r#"
/dev/sda:
 max sectors   = 1953523055/1953525168, HPA is enabled
"#;
    let info = HpaDcoManager::parse_max_sectors(output).unwrap();
    assert_eq!(info.current_max_sectors, 1953523055);
    assert_eq!(info.native_max_sectors, 1953525168);
    assert_eq!(info.hidden_sectors(), 2113);
}

#[test]
fn test_parse_max_sectors_without_hpa() {
    let output = " max sectors   = 1953525168/1953525168, HPA is disabled\n";
    let info = HpaDcoManager::parse_max_sectors(output).unwrap();
    assert_eq!(info.hidden_sectors(), 0);
}

#[test]
fn test_parse_max_sectors_garbage() {
    assert!(HpaDcoManager::parse_max_sectors("SG_IO: bad/missing sense data").is_none());
    assert!(HpaDcoManager::parse_max_sectors("").is_none());
}

// ============================================================================
// Number Extraction Tests
// ============================================================================

#[test]
fn test_extract_number_from_line_basic() {
    let line = "max sectors = 1234567890/2345678901";
    assert_eq!(HpaDcoManager::extract_number_from_line(line), Some(2345678901));
}

#[test]
fn test_extract_number_from_line_single_number() {
    let line = "Real max sectors: 1953525168";
    assert_eq!(HpaDcoManager::extract_number_from_line(line), Some(1953525168));
}

#[test]
fn test_extract_number_from_line_no_numbers() {
    assert_eq!(HpaDcoManager::extract_number_from_line("No numbers here"), None);
    assert_eq!(HpaDcoManager::extract_number_from_line(""), None);
}

// ============================================================================
// DCO Output Parsing Tests
// ============================================================================

#[test]
fn test_parse_dco_output_with_hidden_area() {
    let output = r#"
DCO Revision: 0x0002
Real max sectors: 1953525168
DCO max sectors: 1953525000
The following features can be selectively disabled via DCO:
    SATA NCQ
"#;
    let dco = HpaDcoManager::parse_dco_output(output).unwrap();
    assert_eq!(dco.real_max_sectors, 1953525168);
    assert_eq!(dco.dco_max_sectors, 1953525000);
    assert_eq!(dco.hidden_sectors(), 168);
}

#[test]
fn test_parse_dco_output_missing_fields() {
    let output = "DCO Revision: 0x0002\nReal max sectors: 1953525168\n";
    assert!(HpaDcoManager::parse_dco_output(output).is_none());
}

// ============================================================================
// Region layout
// ============================================================================

#[test]
fn test_regions_layout_hpa_then_dco() {
    let hpa = HpaInfo {
        current_max_sectors: 1000,
        native_max_sectors: 1200,
    };
    let dco = DcoInfo {
        real_max_sectors: 1500,
        dco_max_sectors: 1200,
    };

    let regions = HpaDcoManager::regions(Some(&hpa), Some(&dco), 512);
    assert_eq!(regions.len(), 2);

    assert_eq!(regions[0].kind, HiddenRegionKind::HPA);
    assert_eq!(regions[0].offset, 1000 * 512);
    assert_eq!(regions[0].length, 200 * 512);
    assert!(regions[0].locked);

    assert_eq!(regions[1].kind, HiddenRegionKind::DCO);
    assert_eq!(regions[1].offset, regions[0].end());
    assert_eq!(regions[1].end(), 1500 * 512);
}

#[test]
fn test_regions_empty_without_restrictions() {
    assert!(HpaDcoManager::regions(None, None, 4096).is_empty());
}
