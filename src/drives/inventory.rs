// Device inventory
//
// Enumerates candidate devices through a storage backend, produces fresh
// descriptors on every call, and hands out exclusive erasure targets guarded by
// an engine-wide device lease.

use super::hidden::HiddenAreaControl;
use crate::{DeviceDescriptor, EngineError, EngineResult, FirmwareErase};
use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};

/// Positional block access to a device's native address space.
pub trait BlockDevice: Send {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    fn write_at(&mut self, data: &[u8], offset: u64) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;

    /// False once the device has disappeared from the bus.
    fn is_present(&self) -> bool;

    /// Run a vendor sanitize primitive to completion.
    fn firmware_erase(&mut self, primitive: FirmwareErase) -> EngineResult<()>;
}

/// Source of devices: real hardware or an in-memory simulation.
pub trait StorageBackend: Send + Sync {
    /// Identifiers of every candidate device
    fn scan(&self) -> EngineResult<Vec<String>>;

    /// Read-only identification of a device, including hidden regions.
    fn describe(&self, device_id: &str) -> EngineResult<DeviceDescriptor>;

    /// Reason the device is held outside this engine (mounted, opened elsewhere)
    fn busy_reason(&self, device_id: &str) -> EngineResult<Option<String>>;

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> EngineResult<(Box<dyn BlockDevice>, Box<dyn HiddenAreaControl>)>;
}

/// Classify I/O errors that mean the device left the bus.
pub fn is_removal_error(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::NotFound {
        return true;
    }
    matches!(err.raw_os_error(), Some(libc::ENODEV) | Some(libc::ENXIO))
}

/// Engine-wide set of devices currently owned by a job.
#[derive(Debug, Clone, Default)]
pub struct DeviceLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, device_id: &str) -> EngineResult<DeviceLease> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(device_id.to_string()) {
            return Err(EngineError::DeviceBusy(format!(
                "{} is held by another erasure job",
                device_id
            )));
        }
        tracing::debug!(device = device_id, "Device lease acquired");
        Ok(DeviceLease {
            device_id: device_id.to_string(),
            locks: self.clone(),
        })
    }

    pub fn is_held(&self, device_id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(device_id)
    }

    fn release(&self, device_id: &str) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id);
        tracing::debug!(device = device_id, "Device lease released");
    }
}

/// Exclusive hold on a device; released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    device_id: String,
    locks: DeviceLocks,
}

impl DeviceLease {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.locks.release(&self.device_id);
    }
}

/// Everything a job needs to touch one device, held for the job's lifetime.
pub struct ErasureTarget {
    pub descriptor: DeviceDescriptor,
    pub device: Box<dyn BlockDevice>,
    pub hidden: Box<dyn HiddenAreaControl>,
    lease: DeviceLease,
}

impl ErasureTarget {
    pub fn lease(&self) -> &DeviceLease {
        &self.lease
    }
}

impl std::fmt::Debug for ErasureTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasureTarget")
            .field("device_id", &self.descriptor.device_id)
            .field("technology", &self.descriptor.technology)
            .finish()
    }
}

pub struct DeviceInventory {
    backend: Arc<dyn StorageBackend>,
    locks: DeviceLocks,
}

impl DeviceInventory {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            locks: DeviceLocks::new(),
        }
    }

    /// Inventory over the host's block devices.
    #[cfg(target_os = "linux")]
    pub fn system() -> Self {
        Self::new(Arc::new(super::linux::LinuxBackend::new()))
    }

    pub fn locks(&self) -> &DeviceLocks {
        &self.locks
    }

    /// Describe every candidate device. Devices that cannot be described are logged and skipped.
    pub fn enumerate(&self) -> EngineResult<Vec<DeviceDescriptor>> {
        let mut devices = Vec::new();
        for device_id in self.backend.scan()? {
            match self.backend.describe(&device_id) {
                Ok(descriptor) => devices.push(descriptor),
                Err(e) => {
                    tracing::warn!(device = %device_id, error = %e, "Failed to describe device");
                }
            }
        }
        tracing::info!(count = devices.len(), "Device enumeration complete");
        Ok(devices)
    }

    /// Fresh descriptor for one device, failing if it is absent or held.
    pub fn inspect(&self, device_id: &str) -> EngineResult<DeviceDescriptor> {
        let descriptor = self.backend.describe(device_id)?;
        if self.locks.is_held(device_id) {
            return Err(EngineError::DeviceBusy(format!(
                "{} is held by another erasure job",
                device_id
            )));
        }
        if let Some(reason) = self.backend.busy_reason(device_id)? {
            return Err(EngineError::DeviceBusy(format!("{}: {}", device_id, reason)));
        }
        if descriptor.has_hidden_region {
            tracing::info!(
                device = device_id,
                hidden_bytes = descriptor.hidden_bytes(),
                regions = descriptor.hidden_regions.len(),
                "Hidden regions detected"
            );
        }
        Ok(descriptor)
    }

    /// Take exclusive ownership of a device for an erasure job.
    pub fn open_exclusive(&self, device_id: &str) -> EngineResult<ErasureTarget> {
        let lease = self.locks.acquire(device_id)?;
        let descriptor = self.backend.describe(device_id)?;
        if let Some(reason) = self.backend.busy_reason(device_id)? {
            return Err(EngineError::DeviceBusy(format!("{}: {}", device_id, reason)));
        }
        if descriptor.read_only {
            return Err(EngineError::DeviceBusy(format!(
                "{} is read-only",
                device_id
            )));
        }
        let (device, hidden) = self.backend.open(&descriptor)?;
        Ok(ErasureTarget {
            descriptor,
            device,
            hidden,
            lease,
        })
    }
}
