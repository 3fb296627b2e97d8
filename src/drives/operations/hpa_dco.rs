// Host Protected Area / Device Configuration Overlay handling through hdparm

use crate::{EngineError, EngineResult, HiddenRegion, HiddenRegionKind};
use anyhow::{anyhow, Context};
use lazy_static::lazy_static;
use regex::Regex;
use std::process::Command;

lazy_static! {
    // "max sectors   = 1953523055/1953525168, HPA is enabled"
    static ref MAX_SECTORS: Regex =
        Regex::new(r"max sectors\s*=\s*(\d+)\s*/\s*(\d+)").expect("static regex");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HpaInfo {
    pub current_max_sectors: u64,
    pub native_max_sectors: u64,
}

impl HpaInfo {
    pub fn hidden_sectors(&self) -> u64 {
        self.native_max_sectors.saturating_sub(self.current_max_sectors)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcoInfo {
    pub real_max_sectors: u64,
    pub dco_max_sectors: u64,
}

impl DcoInfo {
    pub fn hidden_sectors(&self) -> u64 {
        self.real_max_sectors.saturating_sub(self.dco_max_sectors)
    }
}

pub struct HpaDcoManager;

impl HpaDcoManager {
    /// Current and native max addresses; `None` when no HPA is set.
    pub fn detect_hpa(device_path: &str) -> EngineResult<Option<HpaInfo>> {
        let output = run_hdparm(&["-N", device_path]).map_err(command_failed)?;
        let info = Self::parse_max_sectors(&output).filter(|hpa| hpa.hidden_sectors() > 0);
        match &info {
            Some(hpa) => tracing::info!(
                device = device_path,
                hidden_sectors = hpa.hidden_sectors(),
                "HPA detected"
            ),
            None => tracing::debug!(device = device_path, "No HPA detected"),
        }
        Ok(info)
    }

    /// DCO restriction, if the drive reports one. Unsupported drives yield `None`.
    pub fn detect_dco(device_path: &str) -> EngineResult<Option<DcoInfo>> {
        let output = match run_hdparm(&["--dco-identify", device_path]) {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(device = device_path, error = %e, "DCO identify unavailable");
                return Ok(None);
            }
        };
        let info = Self::parse_dco_output(&output).filter(|dco| dco.hidden_sectors() > 0);
        if let Some(ref dco) = info {
            tracing::info!(
                device = device_path,
                hidden_sectors = dco.hidden_sectors(),
                "DCO detected"
            );
        }
        Ok(info)
    }

    /// Set the visible max address. Volatile: the drive reverts on power cycle.
    pub fn set_max_sectors(device_path: &str, sectors: u64) -> EngineResult<()> {
        tracing::info!(device = device_path, sectors, "Setting max address");
        run_hdparm(&[
            "--yes-i-know-what-i-am-doing",
            "-N",
            &sectors.to_string(),
            device_path,
        ])
        .map(|_| ())
        .map_err(command_failed)
    }

    /// Hidden regions in the native address space, in ascending offset order.
    pub fn regions(
        hpa: Option<&HpaInfo>,
        dco: Option<&DcoInfo>,
        sector_size: u64,
    ) -> Vec<HiddenRegion> {
        let mut regions = Vec::new();
        if let Some(hpa) = hpa {
            regions.push(HiddenRegion {
                offset: hpa.current_max_sectors * sector_size,
                length: hpa.hidden_sectors() * sector_size,
                kind: HiddenRegionKind::HPA,
                locked: true,
            });
        }
        if let Some(dco) = dco {
            regions.push(HiddenRegion {
                offset: dco.dco_max_sectors * sector_size,
                length: dco.hidden_sectors() * sector_size,
                kind: HiddenRegionKind::DCO,
                locked: true,
            });
        }
        regions
    }

    /// Parse `hdparm -N` output
    pub(crate) fn parse_max_sectors(output: &str) -> Option<HpaInfo> {
        let caps = MAX_SECTORS.captures(output)?;
        Some(HpaInfo {
            current_max_sectors: caps.get(1)?.as_str().parse().ok()?,
            native_max_sectors: caps.get(2)?.as_str().parse().ok()?,
        })
    }

    /// Parse `hdparm --dco-identify` output
    pub(crate) fn parse_dco_output(output: &str) -> Option<DcoInfo> {
        let mut real_max = None;
        let mut dco_max = None;

        for line in output.lines() {
            if line.contains("Real max sectors") {
                real_max = Self::extract_number_from_line(line);
            } else if line.contains("DCO max sectors") {
                dco_max = Self::extract_number_from_line(line);
            }
        }

        Some(DcoInfo {
            real_max_sectors: real_max?,
            dco_max_sectors: dco_max?,
        })
    }

    /// Largest decimal number on a line of text
    pub(crate) fn extract_number_from_line(line: &str) -> Option<u64> {
        line.split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse::<u64>().ok())
            .max()
    }
}

fn run_hdparm(args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new("hdparm")
        .args(args)
        .output()
        .context("failed to run hdparm")?;
    if !output.status.success() {
        return Err(anyhow!(
            "hdparm {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn command_failed(err: anyhow::Error) -> EngineError {
    EngineError::HardwareCommandFailed(format!("{:#}", err))
}
