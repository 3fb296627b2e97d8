/// Skip-and-log ledger for unwritable sectors
///
/// Every offset handed to the ledger is kept, in ascending order, for the
/// lifetime of the job. Exceeding the method's sector budget fails the job,
/// but the offending offset is still recorded first.
use crate::{EngineError, EngineResult, WriteFailureKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One sector the executor could not write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedSector {
    /// Byte offset in the native address space
    pub offset: u64,
    /// First pass that failed to write it
    pub pass_index: usize,
    pub reason: String,
}

pub struct BadSectorLog {
    device_id: String,
    max_sectors: u64,
    sectors: BTreeMap<u64, SkippedSector>,
}

impl BadSectorLog {
    pub fn new(device_id: impl Into<String>, max_sectors: u64) -> Self {
        Self {
            device_id: device_id.into(),
            max_sectors,
            sectors: BTreeMap::new(),
        }
    }

    /// Record an unwritable sector. Errors once the budget is exceeded.
    pub fn record(
        &mut self,
        pass_index: usize,
        offset: u64,
        reason: impl Into<String>,
    ) -> EngineResult<()> {
        let reason = reason.into();
        let first_time = !self.sectors.contains_key(&offset);
        self.sectors.entry(offset).or_insert_with(|| SkippedSector {
            offset,
            pass_index,
            reason: reason.clone(),
        });

        if first_time {
            tracing::warn!(
                device = %self.device_id,
                pass = pass_index,
                offset,
                reason = %reason,
                total_bad = self.sectors.len(),
                "Bad sector skipped"
            );
        }

        if self.exceeded() {
            return Err(EngineError::WriteFailure {
                pass_index,
                offset,
                kind: WriteFailureKind::Fatal,
                reason: format!(
                    "exceeded maximum bad sectors ({} > {}); drive may be failing",
                    self.sectors.len(),
                    self.max_sectors
                ),
            });
        }
        Ok(())
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.sectors.contains_key(&offset)
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    pub fn exceeded(&self) -> bool {
        self.sectors.len() as u64 > self.max_sectors
    }

    /// Recorded sectors in ascending offset order
    pub fn sectors(&self) -> Vec<SkippedSector> {
        self.sectors.values().cloned().collect()
    }

    pub fn report(&self) -> BadSectorReport {
        BadSectorReport {
            device_id: self.device_id.clone(),
            total_bad_sectors: self.sectors.len() as u64,
            max_bad_sectors: self.max_sectors,
            bad_sector_offsets: self.sectors.keys().copied().collect(),
        }
    }
}

/// Summary of skipped sectors for logging and the CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BadSectorReport {
    pub device_id: String,
    pub total_bad_sectors: u64,
    pub max_bad_sectors: u64,
    pub bad_sector_offsets: Vec<u64>,
}

impl BadSectorReport {
    /// Share of the sector budget used, in percent
    pub fn budget_used(&self) -> f64 {
        if self.max_bad_sectors == 0 {
            return 100.0;
        }
        (self.total_bad_sectors as f64 / self.max_bad_sectors as f64) * 100.0
    }
}
