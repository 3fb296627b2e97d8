// Erasure worker: runs one job to a terminal state on a blocking thread
//
// Owns the job and the target for the whole run. Control messages are polled
// between chunks and at pass boundaries; every region exposed during the run
// is tracked so it can be restored before the worker reports back.

use super::job::{
    ErasureJob, HiddenRegionEvent, JobFailure, PassRecord, PassStatus, RegionAction,
    RestoreFailure, SampleDigest,
};
use super::progress::ProgressEvent;
use super::{ControlMessage, ExecutedJob};
use crate::algorithms::{BadSectorPolicy, PassAction, PatternGenerator, PatternStream};
use crate::drives::{is_removal_error, ErasureTarget};
use crate::error::BadSectorLog;
use crate::verification::SamplePlan;
use crate::{EngineError, EngineResult, FirmwareErase, HiddenRegion, WriteFailureKind};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io;
use std::time::Instant;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub(crate) struct Worker {
    job: ErasureJob,
    target: ErasureTarget,
    events: UnboundedSender<ProgressEvent>,
    control: UnboundedReceiver<ControlMessage>,
    bad_sectors: BadSectorLog,
    exposed: Vec<HiddenRegion>,
    current_pass: Option<usize>,
}

impl Worker {
    pub(crate) fn new(
        job: ErasureJob,
        target: ErasureTarget,
        events: UnboundedSender<ProgressEvent>,
        control: UnboundedReceiver<ControlMessage>,
    ) -> Self {
        let max_sectors = match job.method.bad_sectors {
            BadSectorPolicy::SkipAndLog { max_sectors } => max_sectors,
            BadSectorPolicy::FailJob => 0,
        };
        let bad_sectors = BadSectorLog::new(job.target.device_id.clone(), max_sectors);
        Self {
            job,
            target,
            events,
            control,
            bad_sectors,
            exposed: Vec::new(),
            current_pass: None,
        }
    }

    pub(crate) fn run(mut self) -> ExecutedJob {
        let span = tracing::info_span!(
            "erasure_job",
            job_id = %self.job.job_id,
            device = %self.job.target.device_id,
            method = %self.job.method.id
        );
        let _enter = span.enter();

        self.emit(ProgressEvent::JobStarted {
            job_id: self.job.job_id,
            device_id: self.job.target.device_id.clone(),
            method_id: self.job.method.id.clone(),
            total_passes: self.job.method.passes.len(),
            bytes_per_pass: self.target.descriptor.native_capacity,
        });

        match self.run_passes() {
            Ok(()) => {
                if self.job.options.leave_hidden_exposed {
                    self.record_left_exposed();
                } else {
                    self.restore_exposed();
                }
            }
            Err(err) => {
                tracing::error!(pass = ?self.current_pass, error = %err, "Erasure job stopped");
                // Regions go back to their declared state before the terminal state is reported
                self.restore_exposed();
                self.job
                    .record_failure(JobFailure::from_error(&err, self.current_pass));
            }
        }

        self.job.skipped_sectors = self.bad_sectors.sectors();
        self.job.finish_execution();
        if let Some(outcome) = self.job.outcome {
            self.emit(ProgressEvent::JobFinished { outcome });
        }

        ExecutedJob {
            job: self.job,
            target: self.target,
        }
    }

    fn run_passes(&mut self) -> EngineResult<()> {
        if self.job.needs_pre_erasure_digests() {
            self.capture_pre_erasure_digests()?;
        }

        let method = std::sync::Arc::clone(&self.job.method);
        let total_passes = method.passes.len();
        for (index, pass) in method.passes.iter().enumerate() {
            self.current_pass = Some(index);
            self.check_control()?;
            self.check_present()?;

            tracing::info!(pass = index, action = %pass.describe(), "Pass started");
            self.emit(ProgressEvent::PassStarted {
                pass_index: index,
                total_passes,
                description: pass.describe(),
            });

            let started_at = Utc::now();
            let clock = Instant::now();
            let mut bytes_written = 0u64;

            let result = self.expose_locked_regions(Some(index)).and_then(|()| match &pass.action {
                PassAction::Overwrite(pattern) => {
                    self.overwrite_pass(index, pattern, &mut bytes_written)
                }
                PassAction::Firmware(primitive) => self.firmware_pass(index, *primitive),
            });

            let status = match &result {
                Ok(()) => PassStatus::Completed,
                Err(EngineError::Cancelled) | Err(EngineError::DeviceRemoved(_)) => {
                    PassStatus::Aborted
                }
                Err(_) => PassStatus::Failed,
            };
            self.job.passes.push(PassRecord {
                index,
                description: pass.describe(),
                seed: self.job.pass_seeds.get(index).copied().flatten(),
                started_at,
                ended_at: Utc::now(),
                bytes_written,
                status,
            });
            result?;

            if !self.job.options.leave_hidden_exposed {
                self.restore_exposed();
            }

            tracing::info!(pass = index, bytes_written, elapsed = ?clock.elapsed(), "Pass completed");
            self.emit(ProgressEvent::PassCompleted {
                pass_index: index,
                bytes_written,
                elapsed: clock.elapsed(),
            });
        }
        self.current_pass = None;
        Ok(())
    }

    /// Fingerprint the sample plan's sectors so the sampler can prove content changed.
    fn capture_pre_erasure_digests(&mut self) -> EngineResult<()> {
        let plan = SamplePlan::build(
            &self.target.descriptor,
            &self.job.sample_seed,
            &self.job.options.verification,
            &BTreeSet::new(),
        );
        self.expose_locked_regions(None)?;

        let mut sector = vec![0u8; plan.sector_size as usize];
        let mut digests = Vec::with_capacity(plan.len());
        for &offset in &plan.offsets {
            match self.target.device.read_at(&mut sector, offset) {
                Ok(()) => digests.push(SampleDigest {
                    offset,
                    sha256: Sha256::digest(&sector).into(),
                }),
                Err(e) if self.is_removed(&e) => return Err(self.removed()),
                Err(e) => {
                    tracing::warn!(offset, error = %e, "Sector unreadable before erasure");
                }
            }
        }

        tracing::debug!(samples = digests.len(), "Pre-erasure digests captured");
        self.emit(ProgressEvent::PreErasureCaptured {
            samples: digests.len(),
        });
        self.job.pre_erasure_digests = digests;
        Ok(())
    }

    fn overwrite_pass(
        &mut self,
        index: usize,
        pattern: &PatternGenerator,
        bytes_written: &mut u64,
    ) -> EngineResult<()> {
        let seed = self.job.pass_seeds.get(index).copied().flatten();
        let mut stream = PatternStream::new(pattern, seed.as_ref())?;

        let capacity = self.target.descriptor.native_capacity;
        let sector_size = u64::from(self.target.descriptor.sector_size.max(1));
        // Whole sectors per chunk so a failed chunk can be retried sector by sector
        let chunk = (self.job.options.chunk_size as u64 / sector_size).max(1) * sector_size;
        let mut buf = vec![0u8; chunk.min(capacity.max(1)) as usize];

        let clock = Instant::now();
        let mut offset = 0u64;
        while offset < capacity {
            self.check_control()?;
            self.check_present()?;

            let len = chunk.min(capacity - offset) as usize;
            let data = &mut buf[..len];
            stream.fill(data, offset);

            if let Err(e) = self.target.device.write_at(data, offset) {
                if self.is_removed(&e) {
                    return Err(self.removed());
                }
                self.handle_write_error(index, offset, data, e)?;
            }

            offset += len as u64;
            *bytes_written = offset;
            let elapsed = clock.elapsed().as_secs_f64().max(f64::EPSILON);
            self.emit(ProgressEvent::Progress {
                pass_index: index,
                bytes_done: offset,
                bytes_total: capacity,
                bytes_per_second: (offset as f64 / elapsed) as u64,
            });
        }

        if let Err(e) = self.target.device.sync() {
            if self.is_removed(&e) {
                return Err(self.removed());
            }
            return Err(EngineError::WriteFailure {
                pass_index: index,
                offset: capacity,
                kind: WriteFailureKind::Fatal,
                reason: format!("flush failed: {}", e),
            });
        }
        Ok(())
    }

    /// Strict methods fail at the first failing sector; skip-and-log methods isolate the bad sectors.
    fn handle_write_error(
        &mut self,
        index: usize,
        offset: u64,
        data: &[u8],
        err: io::Error,
    ) -> EngineResult<()> {
        let sector_size = self.target.descriptor.sector_size.max(1) as usize;
        if !self.job.method.bad_sectors.tolerates_bad_sectors() {
            tracing::debug!(pass = index, offset, error = %err, "Chunk write failed, locating failing sector");
            for (i, sector) in data.chunks(sector_size).enumerate() {
                let sector_offset = offset + (i * sector_size) as u64;
                match self.target.device.write_at(sector, sector_offset) {
                    Ok(()) => {}
                    Err(e) if self.is_removed(&e) => return Err(self.removed()),
                    Err(e) => {
                        return Err(EngineError::WriteFailure {
                            pass_index: index,
                            offset: sector_offset,
                            kind: WriteFailureKind::Fatal,
                            reason: e.to_string(),
                        })
                    }
                }
            }
            // Every sector took the retry; the chunk error stands
            return Err(EngineError::WriteFailure {
                pass_index: index,
                offset,
                kind: WriteFailureKind::Fatal,
                reason: err.to_string(),
            });
        }

        tracing::debug!(pass = index, offset, error = %err, "Chunk write failed, isolating bad sectors");
        for (i, sector) in data.chunks(sector_size).enumerate() {
            let sector_offset = offset + (i * sector_size) as u64;
            match self.target.device.write_at(sector, sector_offset) {
                Ok(()) => {}
                Err(e) if self.is_removed(&e) => return Err(self.removed()),
                Err(e) => {
                    self.bad_sectors.record(index, sector_offset, e.to_string())?;
                    self.emit(ProgressEvent::SectorSkipped {
                        pass_index: index,
                        offset: sector_offset,
                    });
                }
            }
        }
        Ok(())
    }

    fn firmware_pass(&mut self, index: usize, primitive: FirmwareErase) -> EngineResult<()> {
        tracing::info!(pass = index, %primitive, "Invoking firmware erase");
        self.target.device.firmware_erase(primitive)?;
        let capacity = self.target.descriptor.native_capacity;
        self.emit(ProgressEvent::Progress {
            pass_index: index,
            bytes_done: capacity,
            bytes_total: capacity,
            bytes_per_second: 0,
        });
        Ok(())
    }

    /// Expose every region declared locked that is not already exposed.
    fn expose_locked_regions(&mut self, pass_index: Option<usize>) -> EngineResult<()> {
        let regions: Vec<HiddenRegion> = self
            .target
            .descriptor
            .hidden_regions
            .iter()
            .filter(|r| r.locked && !self.exposed.contains(r))
            .cloned()
            .collect();

        for region in regions {
            if let Err(e) = self.target.hidden.expose(&region) {
                if let EngineError::DeviceRemoved(_) = e {
                    return Err(e);
                }
                self.record_region(pass_index, &region, RegionAction::ExposeFailed, Some(e.to_string()));
                return Err(EngineError::HiddenRegionUnlockFailed {
                    device: self.job.target.device_id.clone(),
                    kind: region.kind,
                    offset: region.offset,
                    reason: e.to_string(),
                });
            }
            tracing::info!(kind = %region.kind, offset = region.offset, length = region.length, "Hidden region exposed");
            self.record_region(pass_index, &region, RegionAction::Exposed, None);
            self.emit(ProgressEvent::HiddenRegionExposed {
                pass_index,
                kind: region.kind,
                offset: region.offset,
                length: region.length,
            });
            self.exposed.push(region);
        }
        Ok(())
    }

    /// Return every exposed region to its declared state; failures are recorded, not raised.
    fn restore_exposed(&mut self) {
        let pass_index = self.current_pass;
        for region in std::mem::take(&mut self.exposed) {
            match self.target.hidden.restore(&region) {
                Ok(()) => {
                    tracing::info!(kind = %region.kind, offset = region.offset, "Hidden region restored");
                    self.record_region(pass_index, &region, RegionAction::Restored, None);
                    self.emit(ProgressEvent::HiddenRegionRestored {
                        pass_index,
                        kind: region.kind,
                        offset: region.offset,
                    });
                }
                Err(e) => {
                    tracing::error!(kind = %region.kind, offset = region.offset, error = %e, "Hidden region could not be restored");
                    self.record_region(
                        pass_index,
                        &region,
                        RegionAction::RestoreFailed,
                        Some(e.to_string()),
                    );
                    self.emit(ProgressEvent::HiddenRegionRestoreFailed {
                        pass_index,
                        kind: region.kind,
                        offset: region.offset,
                        reason: e.to_string(),
                    });
                    self.job.restore_failures.push(RestoreFailure {
                        pass_index,
                        region,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn record_left_exposed(&mut self) {
        for region in std::mem::take(&mut self.exposed) {
            tracing::info!(kind = %region.kind, offset = region.offset, "Hidden region left exposed on request");
            self.record_region(None, &region, RegionAction::LeftExposed, None);
        }
    }

    fn record_region(
        &mut self,
        pass_index: Option<usize>,
        region: &HiddenRegion,
        action: RegionAction,
        detail: Option<String>,
    ) {
        self.job.hidden_region_events.push(HiddenRegionEvent {
            pass_index,
            region: region.clone(),
            action,
            at: Utc::now(),
            detail,
        });
    }

    fn check_control(&mut self) -> EngineResult<()> {
        match self.control.try_recv() {
            Ok(ControlMessage::Cancel) => {
                tracing::warn!(pass = ?self.current_pass, "Cancellation requested");
                Err(EngineError::Cancelled)
            }
            // A dropped handle only means nobody is listening; the job still runs to completion
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(()),
        }
    }

    fn check_present(&self) -> EngineResult<()> {
        if self.target.device.is_present() {
            Ok(())
        } else {
            Err(self.removed())
        }
    }

    fn is_removed(&self, err: &io::Error) -> bool {
        is_removal_error(err) || !self.target.device.is_present()
    }

    fn removed(&self) -> EngineError {
        EngineError::DeviceRemoved(self.job.target.device_id.clone())
    }

    fn emit(&self, event: ProgressEvent) {
        // The receiver may be gone; the job record remains the source of truth
        let _ = self.events.send(event);
    }
}
