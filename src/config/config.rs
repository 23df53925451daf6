use config::{Config as ConfigRs, Environment, File};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use super::api_key::ApiKey;
use super::defaults::{
    default_cache_dir, default_health_check_max_backoff_ms, default_health_check_timeout_secs,
    default_log_dir, default_model_catalog_path, default_project_name,
    default_start_lock_backoff_ms, default_subagent_catalog_path,
};

/// Root configuration for the orchestration core (`spec.md` §7).
///
/// Loaded the way the host project loads its own config: a base file, an
/// optional local override file, then environment variables, in that
/// order of increasing precedence.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_project_name")]
    pub project_name: String,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_subagent_catalog_path")]
    pub subagent_catalog_path: PathBuf,

    #[serde(default = "default_model_catalog_path")]
    pub model_catalog_path: PathBuf,

    /// Overrides automatic memory-architecture detection (`spec.md` §4.3).
    #[serde(default)]
    pub architecture_override: Option<ArchitectureKind>,

    /// Opts into treating the host as `remote-gpu` even when no catalog
    /// entry requires it yet (`spec.md` §4.3, "environment hint").
    #[serde(default)]
    pub force_remote_gpu: bool,

    #[serde(default)]
    pub memory_caps: MemoryCapOverrides,

    /// Cooperative backoff between start-lock retries (`spec.md` §4.2).
    #[serde(default = "default_start_lock_backoff_ms")]
    pub start_lock_backoff_ms: u64,

    /// Per-attempt cap on the health-check exponential backoff (`spec.md`
    /// §4.1, `checkHealth`).
    #[serde(default = "default_health_check_max_backoff_ms")]
    pub health_check_max_backoff_ms: u64,

    /// Overall deadline for a backend to become healthy before the launch
    /// is considered failed (`spec.md` §4.1).
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,

    /// Required for hosted OpenAI-compatible endpoints that omit their own
    /// key in the catalog.
    #[serde(default)]
    pub openai_api_key: Option<ApiKey>,

    /// Required for hosted Anthropic endpoints that omit their own key.
    #[serde(default)]
    pub anthropic_api_key: Option<ApiKey>,

    /// `OpenTelemetry` tracing feature toggle.
    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,
}

fn default_otel_enabled() -> bool {
    false
}

/// The three memory architectures the accountant distinguishes between
/// (`spec.md` §4.3). `Custom` pairs with [`MemoryCapOverrides`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchitectureKind {
    LocalGpu,
    UnifiedMemory,
    RemoteGpu,
}

/// Custom cap/reserve overrides, clamped at use (`spec.md` §4.3: max
/// clamps to `[0.10, 1.00]`, reserve to `[0, 0.50]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryCapOverrides {
    #[serde(default)]
    pub max_utilization: Option<f64>,
    #[serde(default)]
    pub system_reserve: Option<f64>,
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("failed to parse configuration")
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let builder = ConfigRs::builder()
            .add_source(File::from(path))
            .add_source(File::with_name("modelpool.local").required(false))
            .add_source(
                Environment::with_prefix("MODELPOOL")
                    .separator("_")
                    .convert_case(config::Case::Lower),
            );

        let config = builder.build()?;
        config.try_deserialize().map_err(Into::into)
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        self.cache_dir.as_path()
    }

    #[must_use]
    pub fn log_dir(&self) -> &Path {
        self.log_dir.as_path()
    }

    /// Effective `(max_utilization, system_reserve)` for the detected or
    /// overridden architecture, with custom overrides clamped per
    /// `spec.md` §4.3.
    #[must_use]
    pub fn caps_for(&self, architecture: ArchitectureKind) -> (f64, f64) {
        let (default_max, default_reserve) = match architecture {
            ArchitectureKind::LocalGpu => (0.85, 0.05),
            ArchitectureKind::UnifiedMemory => (0.70, 0.20),
            ArchitectureKind::RemoteGpu => (0.80, 0.10),
        };

        let max = self
            .memory_caps
            .max_utilization
            .unwrap_or(default_max)
            .clamp(0.10, 1.00);
        let reserve = self
            .memory_caps
            .system_reserve
            .unwrap_or(default_reserve)
            .clamp(0.0, 0.50);

        (max, reserve)
    }
}
