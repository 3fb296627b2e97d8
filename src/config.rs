// Engine configuration
//
// Compiled-in defaults, overridden by an optional config file (TOML, JSON or
// YAML by extension) and then by `OBLITERATOR__*` environment variables, e.g.
// `OBLITERATOR__VERIFICATION__MODE=full` or `OBLITERATOR__CHUNK_SIZE=1048576`.

use crate::algorithms::{MethodRegistry, SanitizationMethod};
use crate::executor::{JobOptions, DEFAULT_CHUNK_SIZE};
use crate::verification::VerificationPolicy;
use crate::{EngineError, EngineResult};
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const ENV_PREFIX: &str = "OBLITERATOR";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub chunk_size: usize,
    pub verification: VerificationPolicy,
    /// Humantime duration, e.g. "30s"; unset disables stall reporting
    pub stall_watermark: Option<String>,
    pub leave_hidden_exposed: bool,
    pub journal_path: Option<PathBuf>,
    pub signing_key_path: Option<PathBuf>,
    pub signer_identity: String,
    /// Site-specific methods added to the built-in catalog
    pub methods: Vec<SanitizationMethod>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            verification: VerificationPolicy::default(),
            stall_watermark: None,
            leave_hidden_exposed: false,
            journal_path: default_data_dir().map(|d| d.join("journal.sqlite3")),
            signing_key_path: default_config_dir().map(|d| d.join("attestation.pk8")),
            signer_identity: default_signer_identity(),
            methods: Vec::new(),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "obliterator", "obliterator")
}

pub fn default_config_dir() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().to_path_buf())
}

pub fn default_data_dir() -> Option<PathBuf> {
    project_dirs().map(|d| d.data_dir().to_path_buf())
}

/// `config.toml` under the platform config directory
pub fn default_config_file() -> Option<PathBuf> {
    default_config_dir().map(|d| d.join("config.toml"))
}

fn default_signer_identity() -> String {
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("obliterator@{}", host)
}

impl EngineConfig {
    /// Load from `path` (or the default config file) plus the process environment.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        Self::load_with_env(path, None)
    }

    /// Like `load`, but with an explicit environment map instead of the process environment.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> EngineResult<Self> {
        let mut builder = Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None => {
                if let Some(default) = default_config_file() {
                    builder = builder.add_source(File::from(default).required(false));
                }
            }
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env),
        );

        let config: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        tracing::debug!(?config, "Configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.chunk_size == 0 {
            return Err(EngineError::Config("chunk_size must be non-zero".to_string()));
        }
        if self.verification.coverage_basis_points == 0 {
            return Err(EngineError::Config(
                "verification.coverage_basis_points must be at least 1".to_string(),
            ));
        }
        if self.verification.max_samples == 0 {
            return Err(EngineError::Config(
                "verification.max_samples must be at least 1".to_string(),
            ));
        }
        self.stall_watermark()?;
        Ok(())
    }

    pub fn stall_watermark(&self) -> EngineResult<Option<Duration>> {
        self.stall_watermark
            .as_deref()
            .map(|text| {
                humantime::parse_duration(text).map_err(|e| {
                    EngineError::Config(format!("stall_watermark '{}': {}", text, e))
                })
            })
            .transpose()
    }

    pub fn job_options(&self) -> EngineResult<JobOptions> {
        Ok(JobOptions {
            leave_hidden_exposed: self.leave_hidden_exposed,
            stall_watermark: self.stall_watermark()?,
            chunk_size: self.chunk_size,
            verification: self.verification,
        })
    }

    /// Built-in catalog plus configured methods.
    pub fn registry(&self) -> EngineResult<Arc<MethodRegistry>> {
        if self.methods.is_empty() {
            return Ok(MethodRegistry::builtin());
        }
        let registry = MethodRegistry::builder()
            .with_builtin()
            .extend(self.methods.iter().cloned())
            .build()?;
        tracing::info!(extra = self.methods.len(), "Custom methods registered");
        Ok(Arc::new(registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::VerificationMode;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.verification.coverage_basis_points, 100);
        assert!(config.stall_watermark().unwrap().is_none());
    }

    #[test]
    fn test_file_then_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "chunk_size = 1048576\nstall_watermark = \"45s\"\n\n[verification]\nmode = \"sampled\"\ncoverage_basis_points = 250\n"
        )
        .unwrap();

        let config = EngineConfig::load_with_env(
            Some(file.path()),
            env(&[("OBLITERATOR__VERIFICATION__MODE", "full")]),
        )
        .unwrap();

        assert_eq!(config.chunk_size, 1_048_576);
        assert_eq!(config.verification.mode, VerificationMode::Full);
        assert_eq!(config.verification.coverage_basis_points, 250);
        assert_eq!(
            config.stall_watermark().unwrap(),
            Some(Duration::from_secs(45))
        );
    }

    #[test]
    fn test_zero_sample_ceiling_rejected() {
        let result = EngineConfig::load_with_env(
            None,
            env(&[("OBLITERATOR__VERIFICATION__MAX_SAMPLES", "0")]),
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_bad_watermark_rejected() {
        let result = EngineConfig::load_with_env(
            None,
            env(&[("OBLITERATOR__STALL_WATERMARK", "soon")]),
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result =
            EngineConfig::load_with_env(Some(Path::new("/nonexistent/obliterator.toml")), env(&[]));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_job_options_follow_config() {
        let config = EngineConfig {
            chunk_size: 8192,
            stall_watermark: Some("2m".to_string()),
            leave_hidden_exposed: true,
            ..EngineConfig::default()
        };
        let options = config.job_options().unwrap();
        assert_eq!(options.chunk_size, 8192);
        assert_eq!(options.stall_watermark, Some(Duration::from_secs(120)));
        assert!(options.leave_hidden_exposed);
    }

    #[test]
    fn test_duplicate_custom_method_rejected() {
        let builtin = MethodRegistry::builtin()
            .get("clear/single-pass-zero")
            .unwrap();
        let config = EngineConfig {
            methods: vec![(*builtin).clone()],
            ..EngineConfig::default()
        };
        assert!(matches!(config.registry(), Err(EngineError::InvalidMethod(_))));
    }
}
