// Linux block device backend
//
// Identification comes from /sys/block; hidden regions from the per-class
// hidden-area control. The erasure handle maps the native address space onto
// one or more device nodes (the user area, then any eMMC boot partitions).

use super::hidden::{
    read_sysfs_u64, AtaHiddenAreas, BootPartition, EmmcBootAreas, HiddenAreaControl,
    NoHiddenAreas,
};
use super::inventory::{BlockDevice, StorageBackend};
use super::operations::sanitize::SanitizeOperations;
use crate::{DeviceDescriptor, EngineError, EngineResult, FirmwareErase, TechnologyClass};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

const SYS_BLOCK: &str = "/sys/block";

#[derive(Debug, Default)]
pub struct LinuxBackend;

impl LinuxBackend {
    pub fn new() -> Self {
        Self
    }

    /// Skip loop devices, ram disks, device mapper, optical drives and partitions of eMMC boot areas
    pub(crate) fn should_skip_device(device_name: &str) -> bool {
        device_name.starts_with("loop")
            || device_name.starts_with("ram")
            || device_name.starts_with("dm-")
            || device_name.starts_with("sr")
            || device_name.starts_with("zram")
            || (device_name.starts_with("mmcblk") && device_name.contains("boot"))
            || (device_name.starts_with("mmcblk") && device_name.ends_with("rpmb"))
    }

    pub(crate) fn device_name(device_id: &str) -> &str {
        device_id.strip_prefix("/dev/").unwrap_or(device_id)
    }

    pub(crate) fn classify(device_name: &str, rotational: Option<u64>) -> TechnologyClass {
        if device_name.starts_with("nvme") {
            TechnologyClass::NVMe
        } else if device_name.starts_with("mmcblk") {
            TechnologyClass::EMMC
        } else {
            match rotational {
                Some(1) => TechnologyClass::HDD,
                Some(0) => TechnologyClass::SataSSD,
                _ => TechnologyClass::Unknown,
            }
        }
    }

    fn sysfs_string(path: &Path) -> Option<String> {
        let value = fs::read_to_string(path).ok()?;
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    fn hidden_control(descriptor: &DeviceDescriptor) -> Box<dyn HiddenAreaControl> {
        let name = Self::device_name(&descriptor.device_id);
        match descriptor.technology {
            TechnologyClass::HDD | TechnologyClass::SataSSD => Box::new(AtaHiddenAreas::new(
                descriptor.device_id.clone(),
                descriptor.sector_size,
            )),
            TechnologyClass::EMMC => Box::new(EmmcBootAreas::new(name)),
            TechnologyClass::NVMe | TechnologyClass::Unknown => Box::new(NoHiddenAreas),
        }
    }
}

impl StorageBackend for LinuxBackend {
    fn scan(&self) -> EngineResult<Vec<String>> {
        let pattern = format!("{}/*", SYS_BLOCK);
        let entries = glob::glob(&pattern)
            .map_err(|e| EngineError::Config(format!("invalid glob pattern: {}", e)))?;

        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if Self::should_skip_device(name) {
                continue;
            }
            let device_path = format!("/dev/{}", name);
            if Path::new(&device_path).exists() {
                devices.push(device_path);
            }
        }
        devices.sort();
        Ok(devices)
    }

    fn describe(&self, device_id: &str) -> EngineResult<DeviceDescriptor> {
        let name = Self::device_name(device_id);
        let sys = PathBuf::from(SYS_BLOCK).join(name);
        if !sys.exists() || Self::should_skip_device(name) {
            return Err(EngineError::DeviceNotFound(device_id.to_string()));
        }

        // sysfs reports size in 512-byte units regardless of the logical block size
        let size = read_sysfs_u64(&sys.join("size")).unwrap_or(0) * 512;
        let sector_size = read_sysfs_u64(&sys.join("queue/logical_block_size"))
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(512);
        let technology = Self::classify(name, read_sysfs_u64(&sys.join("queue/rotational")));

        let device_path = format!("/dev/{}", name);
        let mut descriptor = DeviceDescriptor::new(device_path.clone(), technology, size, sector_size);
        descriptor.model = Self::sysfs_string(&sys.join("device/model"))
            .or_else(|| Self::sysfs_string(&sys.join("device/name")))
            .unwrap_or_else(|| "Unknown".to_string());
        descriptor.serial = Self::sysfs_string(&sys.join("device/serial"))
            .or_else(|| Self::sysfs_string(&sys.join("device/wwid")))
            .unwrap_or_else(|| "Unknown".to_string());
        descriptor.bus_path = fs::canonicalize(sys.join("device"))
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        descriptor.read_only = read_sysfs_u64(&sys.join("ro")) == Some(1);
        descriptor.firmware_erase = SanitizeOperations::detect_support(&device_path, technology);

        let mut hidden = Self::hidden_control(&descriptor);
        match hidden.discover(&descriptor) {
            Ok(regions) => descriptor.apply_hidden_regions(regions),
            Err(e) => {
                tracing::warn!(device = %device_path, error = %e, "Hidden region discovery failed");
            }
        }

        Ok(descriptor)
    }

    fn busy_reason(&self, device_id: &str) -> EngineResult<Option<String>> {
        let device_path = format!("/dev/{}", Self::device_name(device_id));
        let mounts = procfs::mounts()
            .map_err(|e| EngineError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;

        for mount in &mounts {
            if !mount.fs_spec.starts_with(&device_path) {
                continue;
            }
            if mount.fs_file == "/" {
                return Ok(Some("holds the root filesystem".to_string()));
            }
            return Ok(Some(format!("mounted at {}", mount.fs_file)));
        }
        Ok(None)
    }

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> EngineResult<(Box<dyn BlockDevice>, Box<dyn HiddenAreaControl>)> {
        let mut hidden = Self::hidden_control(descriptor);

        let mut segments = vec![Segment::open(
            &descriptor.device_id,
            0,
            descriptor.reported_capacity,
        )?];

        match descriptor.technology {
            TechnologyClass::EMMC => {
                let boot = EmmcBootAreas::new(Self::device_name(&descriptor.device_id));
                for BootPartition {
                    name,
                    start,
                    length,
                    ..
                } in boot.scan_partitions(descriptor.reported_capacity)
                {
                    segments.push(Segment::deferred(format!("/dev/{}", name), start, length));
                }
                // Populate the control's partition table for expose/restore
                hidden.discover(descriptor)?;
            }
            _ => {
                // HPA/DCO space lives on the same node past the reported end
                segments[0].length = descriptor.native_capacity;
            }
        }

        let device = LinuxBlockDevice {
            device_path: descriptor.device_id.clone(),
            technology: descriptor.technology,
            segments,
        };
        Ok((Box::new(device), hidden))
    }
}

/// One device node covering `[start, start + length)` of the native address space.
#[derive(Debug)]
struct Segment {
    path: String,
    start: u64,
    length: u64,
    file: Option<File>,
}

impl Segment {
    /// Open exclusively; the kernel refuses O_EXCL on a block device in use.
    fn open(path: &str, start: u64, length: u64) -> EngineResult<Self> {
        let file = Self::open_file(path).map_err(|e| match e.raw_os_error() {
            Some(libc::EBUSY) => EngineError::DeviceBusy(format!("{} is in use", path)),
            Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
                EngineError::DeviceNotFound(path.to_string())
            }
            _ => EngineError::Io(e),
        })?;
        Ok(Self {
            path: path.to_string(),
            start,
            length,
            file: Some(file),
        })
    }

    /// Boot partitions stay closed until exposed; opening them read-write fails while locked.
    fn deferred(path: String, start: u64, length: u64) -> Self {
        Self {
            path,
            start,
            length,
            file: None,
        }
    }

    fn open_file(path: &str) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_EXCL)
            .open(path)
    }

    fn file(&mut self) -> io::Result<&File> {
        if self.file.is_none() {
            self.file = Some(Self::open_file(&self.path)?);
        }
        self.file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, self.path.clone()))
    }

    fn end(&self) -> u64 {
        self.start + self.length
    }
}

pub struct LinuxBlockDevice {
    device_path: String,
    technology: TechnologyClass,
    segments: Vec<Segment>,
}

impl LinuxBlockDevice {
    /// Split `[offset, offset + len)` into per-segment `(index, local offset, range in buffer)`.
    fn spans(&self, offset: u64, len: usize) -> io::Result<Vec<(usize, u64, std::ops::Range<usize>)>> {
        let mut spans = Vec::new();
        let mut pos = offset;
        let end = offset + len as u64;
        while pos < end {
            let (index, segment) = self
                .segments
                .iter()
                .enumerate()
                .find(|(_, s)| pos >= s.start && pos < s.end())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("offset {} is beyond the native capacity", pos),
                    )
                })?;
            let take = (segment.end().min(end) - pos) as usize;
            let buf_start = (pos - offset) as usize;
            spans.push((index, pos - segment.start, buf_start..buf_start + take));
            pos += take as u64;
        }
        Ok(spans)
    }
}

impl BlockDevice for LinuxBlockDevice {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        for (index, local, range) in self.spans(offset, buf.len())? {
            self.segments[index].file()?.read_exact_at(&mut buf[range], local)?;
        }
        Ok(())
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> io::Result<()> {
        for (index, local, range) in self.spans(offset, data.len())? {
            self.segments[index].file()?.write_all_at(&data[range], local)?;
        }
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        for segment in &self.segments {
            if let Some(ref file) = segment.file {
                file.sync_all()?;
            }
        }
        Ok(())
    }

    fn is_present(&self) -> bool {
        let name = LinuxBackend::device_name(&self.device_path);
        Path::new(SYS_BLOCK).join(name).exists()
    }

    fn firmware_erase(&mut self, primitive: FirmwareErase) -> EngineResult<()> {
        self.sync()?;
        SanitizeOperations::run(&self.device_path, self.technology, primitive)
    }
}
