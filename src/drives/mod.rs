// Drive discovery and access
//
// Organized structure:
// - inventory.rs: device enumeration, exclusive leases, erasure targets
// - hidden.rs: hidden-area capability per technology class
// - linux.rs: /sys/block backend and device-node I/O
// - simulated.rs: in-memory backend with fault injection
// - operations/: HPA/DCO and vendor sanitize commands

pub mod hidden;
pub mod inventory;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod operations;
pub mod simulated;





pub use hidden::{AtaHiddenAreas, BootPartition, EmmcBootAreas, HiddenAreaControl, NoHiddenAreas};
pub use inventory::{
    is_removal_error, BlockDevice, DeviceInventory, DeviceLease, DeviceLocks, ErasureTarget,
    StorageBackend,
};
#[cfg(target_os = "linux")]
pub use linux::{LinuxBackend, LinuxBlockDevice};
pub use simulated::{
    SimulatedBackend, SimulatedDevice, SimulatedDeviceBuilder, SimulatedHiddenAreas, WriteHook,
    SIM_BLOCK_SIZE,
};
