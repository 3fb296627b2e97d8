// Hidden-area capability interface
//
// One implementation per technology class. `discover` is read-only; `expose`
// and `restore` toggle a single region and are always called in pairs by the
// executor and the sampler.

use super::operations::hpa_dco::HpaDcoManager;
use crate::{DeviceDescriptor, EngineError, EngineResult, HiddenRegion, HiddenRegionKind};
use std::fs;
use std::path::{Path, PathBuf};

pub trait HiddenAreaControl: Send {
    /// Locate hidden regions without changing device state.
    fn discover(&mut self, descriptor: &DeviceDescriptor) -> EngineResult<Vec<HiddenRegion>>;

    /// Make a locked region addressable.
    fn expose(&mut self, region: &HiddenRegion) -> EngineResult<()>;

    /// Return a region to its original declared state.
    fn restore(&mut self, region: &HiddenRegion) -> EngineResult<()>;
}

/// NVMe and unknown devices: no addressable hidden areas.
#[derive(Debug, Default)]
pub struct NoHiddenAreas;

impl HiddenAreaControl for NoHiddenAreas {
    fn discover(&mut self, _descriptor: &DeviceDescriptor) -> EngineResult<Vec<HiddenRegion>> {
        Ok(Vec::new())
    }

    fn expose(&mut self, region: &HiddenRegion) -> EngineResult<()> {
        Err(EngineError::HardwareCommandFailed(format!(
            "no hidden-area control for {} region",
            region.kind
        )))
    }

    fn restore(&mut self, _region: &HiddenRegion) -> EngineResult<()> {
        Ok(())
    }
}

/// HPA and DCO on ATA devices (HDD and SATA SSD).
#[derive(Debug)]
pub struct AtaHiddenAreas {
    device_path: String,
    sector_size: u64,
}

impl AtaHiddenAreas {
    pub fn new(device_path: impl Into<String>, sector_size: u32) -> Self {
        Self {
            device_path: device_path.into(),
            sector_size: u64::from(sector_size.max(1)),
        }
    }
}

impl HiddenAreaControl for AtaHiddenAreas {
    fn discover(&mut self, _descriptor: &DeviceDescriptor) -> EngineResult<Vec<HiddenRegion>> {
        let hpa = HpaDcoManager::detect_hpa(&self.device_path)?;
        let dco = HpaDcoManager::detect_dco(&self.device_path)?;
        Ok(HpaDcoManager::regions(
            hpa.as_ref(),
            dco.as_ref(),
            self.sector_size,
        ))
    }

    fn expose(&mut self, region: &HiddenRegion) -> EngineResult<()> {
        match region.kind {
            HiddenRegionKind::HPA => {
                HpaDcoManager::set_max_sectors(&self.device_path, region.end() / self.sector_size)
            }
            // DCO restore cannot be undone, so the original state could never be put back
            kind => Err(EngineError::HardwareCommandFailed(format!(
                "{} region cannot be exposed reversibly",
                kind
            ))),
        }
    }

    fn restore(&mut self, region: &HiddenRegion) -> EngineResult<()> {
        match region.kind {
            HiddenRegionKind::HPA if region.locked => {
                HpaDcoManager::set_max_sectors(&self.device_path, region.offset / self.sector_size)
            }
            _ => Ok(()),
        }
    }
}

/// One eMMC boot partition mapped after the user area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootPartition {
    /// Block device name, e.g. `mmcblk0boot0`
    pub name: String,
    /// Start in the combined native address space
    pub start: u64,
    pub length: u64,
    pub read_only: bool,
}

impl BootPartition {
    pub fn device_path(&self) -> String {
        format!("/dev/{}", self.name)
    }
}

/// eMMC boot partitions, write-protected through sysfs `force_ro`.
#[derive(Debug)]
pub struct EmmcBootAreas {
    device_name: String,
    sysfs_root: PathBuf,
    partitions: Vec<BootPartition>,
}

impl EmmcBootAreas {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self::with_sysfs_root(device_name, "/sys/block")
    }

    pub fn with_sysfs_root(device_name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            device_name: device_name.into(),
            sysfs_root: root.into(),
            partitions: Vec::new(),
        }
    }

    /// Boot partitions present in sysfs, laid out after `user_capacity`.
    pub fn scan_partitions(&self, user_capacity: u64) -> Vec<BootPartition> {
        let mut start = user_capacity;
        let mut partitions = Vec::new();
        for suffix in ["boot0", "boot1"] {
            let name = format!("{}{}", self.device_name, suffix);
            let dir = self.sysfs_root.join(&name);
            let Some(sectors) = read_sysfs_u64(&dir.join("size")) else {
                continue;
            };
            let length = sectors * 512;
            if length == 0 {
                continue;
            }
            let read_only = read_sysfs_u64(&dir.join("force_ro")).unwrap_or(1) != 0;
            partitions.push(BootPartition {
                name,
                start,
                length,
                read_only,
            });
            start += length;
        }
        partitions
    }

    fn partition_for(&self, region: &HiddenRegion) -> EngineResult<&BootPartition> {
        self.partitions
            .iter()
            .find(|p| p.start == region.offset)
            .ok_or_else(|| {
                EngineError::HardwareCommandFailed(format!(
                    "no boot partition at offset {}",
                    region.offset
                ))
            })
    }

    fn set_force_ro(&self, partition: &BootPartition, read_only: bool) -> EngineResult<()> {
        let path = self.sysfs_root.join(&partition.name).join("force_ro");
        let value = if read_only { "1" } else { "0" };
        fs::write(&path, value).map_err(|e| {
            EngineError::HardwareCommandFailed(format!(
                "failed to write {} to {}: {}",
                value,
                path.display(),
                e
            ))
        })?;
        tracing::debug!(partition = %partition.name, read_only, "Boot partition write protection changed");
        Ok(())
    }
}

impl HiddenAreaControl for EmmcBootAreas {
    fn discover(&mut self, descriptor: &DeviceDescriptor) -> EngineResult<Vec<HiddenRegion>> {
        self.partitions = self.scan_partitions(descriptor.reported_capacity);
        Ok(self
            .partitions
            .iter()
            .map(|p| HiddenRegion {
                offset: p.start,
                length: p.length,
                kind: HiddenRegionKind::FirmwareArea,
                locked: p.read_only,
            })
            .collect())
    }

    fn expose(&mut self, region: &HiddenRegion) -> EngineResult<()> {
        let partition = self.partition_for(region)?.clone();
        self.set_force_ro(&partition, false)
    }

    fn restore(&mut self, region: &HiddenRegion) -> EngineResult<()> {
        let partition = self.partition_for(region)?.clone();
        self.set_force_ro(&partition, region.locked)
    }
}

pub(crate) fn read_sysfs_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}
