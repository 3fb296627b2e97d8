// Low-level drive operations that shell out to vendor tools

pub mod hpa_dco; // Host Protected Area / Device Configuration Overlay
pub mod sanitize; // NVMe, ATA and eMMC sanitize primitives

pub use hpa_dco::{DcoInfo, HpaDcoManager, HpaInfo};
pub use sanitize::{SanitizeOperations, SanitizeStatus};

// Tests
#[cfg(test)]
mod hpa_dco_tests;
