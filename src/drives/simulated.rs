// In-memory simulated storage
//
// Block-granular sparse media: uniform blocks cost one byte, crypto-erased blocks
// are generated on read from a keyed stream, only mixed blocks hold a buffer.
// Clones share state, so a test can keep a handle while the executor owns the
// device, and inject faults (bad sectors, unlock failures, removal) mid-job.

use super::hidden::HiddenAreaControl;
use super::inventory::{BlockDevice, StorageBackend};
use crate::algorithms::{PatternGenerator, PatternSeed, PatternStream};
use crate::{
    DeviceDescriptor, EngineError, EngineResult, FirmwareErase, HiddenRegion, HiddenRegionKind,
    TechnologyClass,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Granularity of the sparse store
pub const SIM_BLOCK_SIZE: u64 = 64 * 1024;

/// Called after every successful write with the number of bytes written so far.
pub type WriteHook = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Clone)]
enum Block {
    Fill(u8),
    Data(Box<[u8]>),
    /// Output of the keyed scramble stream for this epoch
    Scrambled(u64),
}

struct SimState {
    descriptor: DeviceDescriptor,
    blocks: Vec<Block>,
    region_locked: Vec<bool>,
    bad_sectors: BTreeSet<u64>,
    unreadable: BTreeSet<u64>,
    scramble_key: [u8; 32],
    scramble_epoch: u64,
    crypto_erase_zeroes: bool,
    fail_unlock: bool,
    fail_relock: bool,
    fail_firmware: bool,
    removed: bool,
    remove_after_bytes: Option<u64>,
    busy: Option<String>,
    bytes_written: u64,
    unlock_count: u64,
    relock_count: u64,
    firmware_calls: Vec<FirmwareErase>,
    write_hook: Option<WriteHook>,
}

impl SimState {
    fn capacity(&self) -> u64 {
        self.descriptor.native_capacity
    }

    fn sector_size(&self) -> u64 {
        u64::from(self.descriptor.sector_size.max(1))
    }

    fn check_present(&self) -> io::Result<()> {
        if self.removed {
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, len: usize) -> io::Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        if end > self.capacity() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("access {}..{} beyond capacity {}", offset, end, self.capacity()),
            ));
        }
        Ok(())
    }

    /// Locked hidden regions answer like an address outside the visible range.
    fn check_unlocked(&self, offset: u64, len: usize) -> io::Result<()> {
        let end = offset + len as u64;
        for (region, locked) in self
            .descriptor
            .hidden_regions
            .iter()
            .zip(&self.region_locked)
        {
            if *locked && offset < region.end() && end > region.offset {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
        }
        Ok(())
    }

    fn hits(set: &BTreeSet<u64>, offset: u64, len: usize) -> bool {
        set.range(offset..offset + len as u64).next().is_some()
    }

    fn scramble_seed(&self, epoch: u64) -> PatternSeed {
        let mut hasher = Sha256::new();
        hasher.update(self.scramble_key);
        hasher.update(epoch.to_le_bytes());
        PatternSeed(hasher.finalize().into())
    }

    fn fill_scrambled(&self, epoch: u64, buf: &mut [u8], offset: u64) {
        let seed = self.scramble_seed(epoch);
        if let Ok(mut stream) = PatternStream::new(&PatternGenerator::Random, Some(&seed)) {
            stream.fill(buf, offset);
        }
    }

    fn read_into(&self, buf: &mut [u8], offset: u64) {
        let mut pos = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let index = (pos / SIM_BLOCK_SIZE) as usize;
            let within = (pos % SIM_BLOCK_SIZE) as usize;
            let take = (SIM_BLOCK_SIZE as usize - within).min(buf.len() - done);
            let out = &mut buf[done..done + take];
            match &self.blocks[index] {
                Block::Fill(byte) => out.fill(*byte),
                Block::Data(data) => out.copy_from_slice(&data[within..within + take]),
                Block::Scrambled(epoch) => self.fill_scrambled(*epoch, out, pos),
            }
            pos += take as u64;
            done += take;
        }
    }

    fn materialize(&self, index: usize) -> Box<[u8]> {
        let start = index as u64 * SIM_BLOCK_SIZE;
        let len = (self.capacity() - start).min(SIM_BLOCK_SIZE) as usize;
        let mut data = vec![0u8; len].into_boxed_slice();
        self.read_into(&mut data, start);
        data
    }

    fn write_from(&mut self, data: &[u8], offset: u64) {
        let mut pos = offset;
        let mut done = 0usize;
        while done < data.len() {
            let index = (pos / SIM_BLOCK_SIZE) as usize;
            let within = (pos % SIM_BLOCK_SIZE) as usize;
            let block_len =
                (self.capacity() - index as u64 * SIM_BLOCK_SIZE).min(SIM_BLOCK_SIZE) as usize;
            let take = (block_len - within).min(data.len() - done);
            let src = &data[done..done + take];

            if within == 0 && take == block_len && src.iter().all(|b| *b == src[0]) {
                self.blocks[index] = Block::Fill(src[0]);
            } else {
                let mut block = match &self.blocks[index] {
                    Block::Data(existing) => existing.clone(),
                    _ => self.materialize(index),
                };
                block[within..within + take].copy_from_slice(src);
                self.blocks[index] = Block::Data(block);
            }

            pos += take as u64;
            done += take;
        }
    }

    fn region_index(&self, region: &HiddenRegion) -> EngineResult<usize> {
        self.descriptor
            .hidden_regions
            .iter()
            .position(|r| r.offset == region.offset && r.kind == region.kind)
            .ok_or_else(|| {
                EngineError::HardwareCommandFailed(format!(
                    "no {} region at offset {}",
                    region.kind, region.offset
                ))
            })
    }
}

/// Shared handle to a simulated device.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    pub fn builder(
        device_id: impl Into<String>,
        technology: TechnologyClass,
        reported_capacity: u64,
    ) -> SimulatedDeviceBuilder {
        SimulatedDeviceBuilder::new(device_id, technology, reported_capacity)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn device_id(&self) -> String {
        self.lock().descriptor.device_id.clone()
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        self.lock().descriptor.clone()
    }

    /// Read bytes directly from the media, ignoring locks and faults.
    pub fn peek(&self, offset: u64, len: usize) -> Vec<u8> {
        let state = self.lock();
        let len = len.min(state.capacity().saturating_sub(offset) as usize);
        let mut buf = vec![0u8; len];
        state.read_into(&mut buf, offset);
        buf
    }

    /// Write bytes directly to the media, ignoring locks and faults.
    pub fn poke(&self, offset: u64, data: &[u8]) {
        self.lock().write_from(data, offset);
    }

    /// Current lock state of every hidden region, in discovery order
    pub fn region_lock_states(&self) -> Vec<bool> {
        self.lock().region_locked.clone()
    }

    pub fn unlock_count(&self) -> u64 {
        self.lock().unlock_count
    }

    pub fn relock_count(&self) -> u64 {
        self.lock().relock_count
    }

    pub fn bytes_written(&self) -> u64 {
        self.lock().bytes_written
    }

    pub fn firmware_calls(&self) -> Vec<FirmwareErase> {
        self.lock().firmware_calls.clone()
    }

    /// Hot-unplug the device.
    pub fn remove(&self) {
        self.lock().removed = true;
    }

    /// Hot-unplug once this many bytes have been written.
    pub fn remove_after_bytes(&self, bytes: u64) {
        self.lock().remove_after_bytes = Some(bytes);
    }

    pub fn add_bad_sector(&self, offset: u64) {
        self.lock().bad_sectors.insert(offset);
    }

    pub fn set_busy(&self, reason: Option<&str>) {
        self.lock().busy = reason.map(str::to_string);
    }

    pub fn set_fail_relock(&self, fail: bool) {
        self.lock().fail_relock = fail;
    }

    pub fn on_write(&self, hook: WriteHook) {
        self.lock().write_hook = Some(hook);
    }
}

impl BlockDevice for SimulatedDevice {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let state = self.lock();
        state.check_present()?;
        state.check_range(offset, buf.len())?;
        state.check_unlocked(offset, buf.len())?;
        if SimState::hits(&state.unreadable, offset, buf.len()) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        state.read_into(buf, offset);
        Ok(())
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> io::Result<()> {
        let hook = {
            let mut state = self.lock();
            state.check_present()?;
            state.check_range(offset, data.len())?;
            state.check_unlocked(offset, data.len())?;
            if SimState::hits(&state.bad_sectors, offset, data.len()) {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            state.write_from(data, offset);
            state.bytes_written += data.len() as u64;
            if let Some(limit) = state.remove_after_bytes {
                if state.bytes_written >= limit {
                    state.removed = true;
                }
            }
            state.write_hook.clone().map(|hook| (hook, state.bytes_written))
        };
        if let Some((hook, written)) = hook {
            hook(written);
        }
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.lock().check_present()
    }

    fn is_present(&self) -> bool {
        !self.lock().removed
    }

    fn firmware_erase(&mut self, primitive: FirmwareErase) -> EngineResult<()> {
        let mut state = self.lock();
        if state.removed {
            return Err(EngineError::DeviceRemoved(state.descriptor.device_id.clone()));
        }
        state.firmware_calls.push(primitive);
        if state.fail_firmware || !state.descriptor.supports(primitive) {
            return Err(EngineError::HardwareCommandFailed(format!(
                "{} rejected by {}",
                primitive, state.descriptor.device_id
            )));
        }
        let block = match primitive {
            FirmwareErase::CryptoErase if state.crypto_erase_zeroes => Block::Fill(0x00),
            FirmwareErase::CryptoErase => {
                state.scramble_epoch += 1;
                Block::Scrambled(state.scramble_epoch)
            }
            FirmwareErase::BlockErase => Block::Fill(0x00),
        };
        state.blocks.iter_mut().for_each(|b| *b = block.clone());
        tracing::debug!(device = %state.descriptor.device_id, %primitive, "Simulated firmware erase");
        Ok(())
    }
}

/// Hidden-area control bound to a simulated device.
pub struct SimulatedHiddenAreas {
    device: SimulatedDevice,
}

impl SimulatedHiddenAreas {
    pub fn new(device: SimulatedDevice) -> Self {
        Self { device }
    }
}

impl HiddenAreaControl for SimulatedHiddenAreas {
    fn discover(&mut self, _descriptor: &DeviceDescriptor) -> EngineResult<Vec<HiddenRegion>> {
        Ok(self.device.lock().descriptor.hidden_regions.clone())
    }

    fn expose(&mut self, region: &HiddenRegion) -> EngineResult<()> {
        let mut state = self.device.lock();
        if state.removed {
            return Err(EngineError::DeviceRemoved(state.descriptor.device_id.clone()));
        }
        if state.fail_unlock {
            return Err(EngineError::HardwareCommandFailed(
                "device rejected the unlock command".to_string(),
            ));
        }
        let index = state.region_index(region)?;
        state.region_locked[index] = false;
        state.unlock_count += 1;
        Ok(())
    }

    fn restore(&mut self, region: &HiddenRegion) -> EngineResult<()> {
        let mut state = self.device.lock();
        if state.fail_relock {
            return Err(EngineError::HardwareCommandFailed(
                "device rejected the relock command".to_string(),
            ));
        }
        let index = state.region_index(region)?;
        state.region_locked[index] = region.locked;
        if region.locked {
            state.relock_count += 1;
        }
        Ok(())
    }
}

pub struct SimulatedDeviceBuilder {
    descriptor: DeviceDescriptor,
    hidden: Vec<(HiddenRegionKind, u64, bool)>,
    bad_sectors: BTreeSet<u64>,
    unreadable: BTreeSet<u64>,
    initial_fill: Option<u8>,
    scramble_key: [u8; 32],
    crypto_erase_zeroes: bool,
    fail_unlock: bool,
    fail_relock: bool,
    fail_firmware: bool,
    busy: Option<String>,
}

impl SimulatedDeviceBuilder {
    pub fn new(
        device_id: impl Into<String>,
        technology: TechnologyClass,
        reported_capacity: u64,
    ) -> Self {
        let device_id = device_id.into();
        let mut descriptor = DeviceDescriptor::new(device_id.clone(), technology, reported_capacity, 512);
        descriptor.serial = format!("SIM-{}", device_id.trim_start_matches("sim:"));
        descriptor.model = format!("Simulated {}", technology);
        descriptor.bus_path = format!("simulated/{}", device_id);
        if technology.is_flash() {
            descriptor.firmware_erase = vec![FirmwareErase::CryptoErase, FirmwareErase::BlockErase];
        }
        let scramble_key: [u8; 32] = Sha256::digest(device_id.as_bytes()).into();

        Self {
            descriptor,
            hidden: Vec::new(),
            bad_sectors: BTreeSet::new(),
            unreadable: BTreeSet::new(),
            initial_fill: None,
            scramble_key,
            crypto_erase_zeroes: false,
            fail_unlock: false,
            fail_relock: false,
            fail_firmware: false,
            busy: None,
        }
    }

    pub fn sector_size(mut self, size: u32) -> Self {
        self.descriptor.sector_size = size;
        self
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.descriptor.serial = serial.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.descriptor.model = model.into();
        self
    }

    /// Append a locked hidden region after the reported capacity.
    pub fn hidden_region(mut self, kind: HiddenRegionKind, length: u64) -> Self {
        self.hidden.push((kind, length, true));
        self
    }

    /// Append a hidden region that is already addressable.
    pub fn unlocked_hidden_region(mut self, kind: HiddenRegionKind, length: u64) -> Self {
        self.hidden.push((kind, length, false));
        self
    }

    pub fn bad_sector(mut self, offset: u64) -> Self {
        self.bad_sectors.insert(offset);
        self
    }

    pub fn unreadable_sector(mut self, offset: u64) -> Self {
        self.unreadable.insert(offset);
        self
    }

    /// Start with uniform content instead of pseudo-random prior data.
    pub fn initial_fill(mut self, byte: u8) -> Self {
        self.initial_fill = Some(byte);
        self
    }

    pub fn firmware(mut self, primitives: &[FirmwareErase]) -> Self {
        self.descriptor.firmware_erase = primitives.to_vec();
        self
    }

    /// Crypto erase deallocates every block, which then reads back as zeros.
    pub fn crypto_erase_reads_zeros(mut self) -> Self {
        self.crypto_erase_zeroes = true;
        self
    }

    pub fn fail_unlock(mut self) -> Self {
        self.fail_unlock = true;
        self
    }

    pub fn fail_relock(mut self) -> Self {
        self.fail_relock = true;
        self
    }

    pub fn fail_firmware(mut self) -> Self {
        self.fail_firmware = true;
        self
    }

    pub fn busy(mut self, reason: impl Into<String>) -> Self {
        self.busy = Some(reason.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.descriptor.read_only = true;
        self
    }

    pub fn build(self) -> SimulatedDevice {
        let mut descriptor = self.descriptor;
        let mut offset = descriptor.reported_capacity;
        let regions: Vec<HiddenRegion> = self
            .hidden
            .iter()
            .map(|&(kind, length, locked)| {
                let region = HiddenRegion {
                    offset,
                    length,
                    kind,
                    locked,
                };
                offset += length;
                region
            })
            .collect();
        let region_locked = regions.iter().map(|r| r.locked).collect();
        descriptor.apply_hidden_regions(regions);

        let block_count = descriptor.native_capacity.div_ceil(SIM_BLOCK_SIZE) as usize;
        let initial = match self.initial_fill {
            Some(byte) => Block::Fill(byte),
            None => Block::Scrambled(0),
        };

        SimulatedDevice {
            state: Arc::new(Mutex::new(SimState {
                descriptor,
                blocks: vec![initial; block_count],
                region_locked,
                bad_sectors: self.bad_sectors,
                unreadable: self.unreadable,
                scramble_key: self.scramble_key,
                scramble_epoch: 0,
                crypto_erase_zeroes: self.crypto_erase_zeroes,
                fail_unlock: self.fail_unlock,
                fail_relock: self.fail_relock,
                fail_firmware: self.fail_firmware,
                removed: false,
                remove_after_bytes: None,
                busy: self.busy,
                bytes_written: 0,
                unlock_count: 0,
                relock_count: 0,
                firmware_calls: Vec::new(),
                write_hook: None,
            })),
        }
    }
}

/// Backend hosting simulated devices, for tests and dry runs.
#[derive(Default)]
pub struct SimulatedBackend {
    devices: RwLock<BTreeMap<String, SimulatedDevice>>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, device: SimulatedDevice) -> Self {
        self.add(device);
        self
    }

    pub fn add(&self, device: SimulatedDevice) {
        let id = device.device_id();
        self.devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, device);
    }

    pub fn device(&self, device_id: &str) -> EngineResult<SimulatedDevice> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
            .ok_or_else(|| EngineError::DeviceNotFound(device_id.to_string()))
    }
}

impl StorageBackend for SimulatedBackend {
    fn scan(&self) -> EngineResult<Vec<String>> {
        Ok(self
            .devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, device)| device.is_present())
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn describe(&self, device_id: &str) -> EngineResult<DeviceDescriptor> {
        let device = self.device(device_id)?;
        if !device.is_present() {
            return Err(EngineError::DeviceNotFound(device_id.to_string()));
        }
        Ok(device.descriptor())
    }

    fn busy_reason(&self, device_id: &str) -> EngineResult<Option<String>> {
        Ok(self.device(device_id)?.lock().busy.clone())
    }

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> EngineResult<(Box<dyn BlockDevice>, Box<dyn HiddenAreaControl>)> {
        let device = self.device(&descriptor.device_id)?;
        let hidden = SimulatedHiddenAreas::new(device.clone());
        Ok((Box::new(device), Box::new(hidden)))
    }
}
