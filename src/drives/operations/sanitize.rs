// Vendor sanitize primitives: NVMe sanitize, ATA sanitize feature set, eMMC sanitize

use crate::{EngineError, EngineResult, FirmwareErase, TechnologyClass};
use anyhow::{anyhow, Context};
use lazy_static::lazy_static;
use regex::Regex;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

lazy_static! {
    // "sanicap   : 0x60000003"
    static ref NVME_SANICAP: Regex =
        Regex::new(r"(?m)^\s*sanicap\s*:\s*(0x[0-9a-fA-F]+|\d+)").expect("static regex");
    // "Sanitize Status                        (SSTAT) :  0x101"
    static ref NVME_SSTAT: Regex =
        Regex::new(r"\(SSTAT\)\s*:\s*(0x[0-9a-fA-F]+|\d+)").expect("static regex");
}

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const SANITIZE_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// State reported by a drive's sanitize status log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeStatus {
    Idle,
    InProgress,
    Completed,
    Failed,
}

pub struct SanitizeOperations;

impl SanitizeOperations {
    /// Primitives a device advertises. Read-only query.
    pub fn detect_support(device_path: &str, class: TechnologyClass) -> Vec<FirmwareErase> {
        let result = match class {
            TechnologyClass::NVMe => run("nvme", &["id-ctrl", device_path])
                .map(|out| Self::parse_nvme_sanicap(&out)),
            TechnologyClass::SataSSD | TechnologyClass::HDD => {
                run("hdparm", &["-I", device_path]).map(|out| Self::parse_ata_sanitize(&out))
            }
            // mmc-utils exposes only the sanitize (block erase) operation
            TechnologyClass::EMMC => Ok(vec![FirmwareErase::BlockErase]),
            TechnologyClass::Unknown => Ok(Vec::new()),
        };
        result.unwrap_or_else(|e| {
            tracing::debug!(device = device_path, error = %e, "Sanitize capability query failed");
            Vec::new()
        })
    }

    /// Issue a sanitize primitive and wait for the drive to report completion.
    pub fn run(
        device_path: &str,
        class: TechnologyClass,
        primitive: FirmwareErase,
    ) -> EngineResult<()> {
        tracing::info!(device = device_path, %primitive, %class, "Starting vendor sanitize");
        match (class, primitive) {
            (TechnologyClass::NVMe, _) => {
                let action = match primitive {
                    FirmwareErase::BlockErase => "--sanact=2",
                    FirmwareErase::CryptoErase => "--sanact=4",
                };
                run("nvme", &["sanitize", device_path, action]).map_err(command_failed)?;
                Self::wait_for(device_path, || {
                    run("nvme", &["sanitize-log", device_path])
                        .map(|out| Self::parse_nvme_sstat(&out))
                })
            }
            (TechnologyClass::SataSSD | TechnologyClass::HDD, _) => {
                let action = match primitive {
                    FirmwareErase::BlockErase => "--sanitize-block-erase",
                    FirmwareErase::CryptoErase => "--sanitize-crypto-scramble",
                };
                run(
                    "hdparm",
                    &["--yes-i-know-what-i-am-doing", action, device_path],
                )
                .map_err(command_failed)?;
                Self::wait_for(device_path, || {
                    run("hdparm", &["--sanitize-status", device_path])
                        .map(|out| Self::parse_ata_sanitize_status(&out))
                })
            }
            (TechnologyClass::EMMC, FirmwareErase::BlockErase) => {
                run("mmc", &["sanitize", device_path])
                    .map(|_| ())
                    .map_err(command_failed)
            }
            _ => Err(EngineError::HardwareCommandFailed(format!(
                "{} is not available on {} devices",
                primitive, class
            ))),
        }
    }

    fn wait_for(
        device_path: &str,
        mut poll: impl FnMut() -> anyhow::Result<SanitizeStatus>,
    ) -> EngineResult<()> {
        let started = Instant::now();
        loop {
            match poll().map_err(command_failed)? {
                SanitizeStatus::Completed => {
                    tracing::info!(
                        device = device_path,
                        elapsed = ?started.elapsed(),
                        "Sanitize completed"
                    );
                    return Ok(());
                }
                SanitizeStatus::Failed => {
                    return Err(EngineError::HardwareCommandFailed(format!(
                        "sanitize reported failure on {}",
                        device_path
                    )))
                }
                SanitizeStatus::InProgress | SanitizeStatus::Idle => {}
            }
            if started.elapsed() > SANITIZE_TIMEOUT {
                return Err(EngineError::HardwareCommandFailed(format!(
                    "sanitize on {} did not complete within {:?}",
                    device_path, SANITIZE_TIMEOUT
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub(crate) fn parse_nvme_sanicap(output: &str) -> Vec<FirmwareErase> {
        let Some(value) = NVME_SANICAP
            .captures(output)
            .and_then(|caps| parse_int(caps.get(1)?.as_str()))
        else {
            return Vec::new();
        };
        let mut supported = Vec::new();
        if value & 0x1 != 0 {
            supported.push(FirmwareErase::CryptoErase);
        }
        if value & 0x2 != 0 {
            supported.push(FirmwareErase::BlockErase);
        }
        supported
    }

    pub(crate) fn parse_nvme_sstat(output: &str) -> SanitizeStatus {
        let value = NVME_SSTAT
            .captures(output)
            .and_then(|caps| parse_int(caps.get(1)?.as_str()))
            .unwrap_or(0);
        match value & 0x7 {
            1 | 4 => SanitizeStatus::Completed,
            2 => SanitizeStatus::InProgress,
            3 => SanitizeStatus::Failed,
            _ => SanitizeStatus::Idle,
        }
    }

    pub(crate) fn parse_ata_sanitize(output: &str) -> Vec<FirmwareErase> {
        let mut supported = Vec::new();
        if output.contains("CRYPTO_SCRAMBLE_EXT") {
            supported.push(FirmwareErase::CryptoErase);
        }
        if output.contains("BLOCK_ERASE_EXT") {
            supported.push(FirmwareErase::BlockErase);
        }
        supported
    }

    pub(crate) fn parse_ata_sanitize_status(output: &str) -> SanitizeStatus {
        if output.contains("Sanitize operation failed") {
            SanitizeStatus::Failed
        } else if output.contains("Sanitize in progress") {
            SanitizeStatus::InProgress
        } else if output.contains("Sanitize operation completed")
            || output.contains("SD0 Sanitize Idle")
        {
            SanitizeStatus::Completed
        } else {
            SanitizeStatus::Idle
        }
    }
}

fn parse_int(text: &str) -> Option<u64> {
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn run(program: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to run {}", program))?;
    if !output.status.success() {
        return Err(anyhow!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn command_failed(err: anyhow::Error) -> EngineError {
    EngineError::HardwareCommandFailed(format!("{:#}", err))
}
