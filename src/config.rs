use anyhow::{ensure, Context, Result};
use chrono::Duration;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::store::Backend;

/// Longest staleness timeout accepted from flags or configuration (one year).
pub const MAX_TIMEOUT_MINUTES: u64 = 525_600;

/// Longest archive retention accepted from flags or configuration.
pub const MAX_RETENTION_DAYS: u64 = 36_500;

/// Main configuration structure for the conductor
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub store: StoreConfig,
    pub github: GitHubConfig,
    pub liveness: LivenessConfig,
    pub archive: ArchiveConfig,
    pub health: HealthConfig,
    pub claim: ClaimConfig,
    pub retry: RetryConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    /// State document for the local backend
    pub state_file: PathBuf,
    /// How long to wait for the state file lock before giving up
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Local,
            state_file: PathBuf::from(".conductor/workflow-state.json"),
            lock_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// GitHub API token (falls back to GITHUB_TOKEN)
    pub token: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
    /// Login claimed issues are assigned to; defaults to the token's user
    pub assignee: Option<String>,
    /// How many trailing comments are read when rebuilding a claim
    pub comment_scan_depth: usize,
    pub requests_per_second: u32,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            owner: None,
            repo: None,
            assignee: None,
            comment_scan_depth: 20,
            requests_per_second: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub stale_timeout_minutes: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            stale_timeout_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub retention_days: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub stale_ratio_threshold: f64,
    pub activity_window_hours: u64,
    pub blocked_threshold_hours: u64,
    pub queue_warning_threshold: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_ratio_threshold: 0.3,
            activity_window_hours: 24,
            blocked_threshold_hours: 4,
            queue_warning_threshold: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// Candidates tried per claim invocation before reporting idle
    pub max_attempts: u32,
    /// Role that preferentially absorbs tasks without required skills
    pub generalist_role: String,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            generalist_role: "dev".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON log lines instead of the human formatter
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
        }
    }
}

impl ConductorConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. `path`, or `conductor.toml` in the working directory if present
    /// 3. Environment variables (`CONDUCTOR__SECTION__KEY`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env is normal
        let _ = dotenvy::dotenv();

        let defaults = Config::try_from(&ConductorConfig::default())
            .context("failed to serialize default configuration")?;
        let mut builder = Config::builder().add_source(defaults);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None if Path::new("conductor.toml").exists() => {
                builder = builder.add_source(File::with_name("conductor"));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("CONDUCTOR")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: ConductorConfig = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        config.github.token = config.github.token.take().or_else(|| env_value("GITHUB_TOKEN"));
        config.github.owner = config.github.owner.take().or_else(|| env_value("GITHUB_OWNER"));
        config.github.repo = config.github.repo.take().or_else(|| env_value("GITHUB_REPO"));

        Ok(config)
    }

    pub fn stale_timeout(&self) -> Result<Duration> {
        minutes(self.liveness.stale_timeout_minutes)
            .context("invalid liveness.stale_timeout_minutes")
    }

    pub fn retention(&self) -> Result<Duration> {
        days(self.archive.retention_days).context("invalid archive.retention_days")
    }
}

pub fn minutes(value: u64) -> Result<Duration> {
    ensure!(
        (1..=MAX_TIMEOUT_MINUTES).contains(&value),
        "{value} minutes is outside 1..={MAX_TIMEOUT_MINUTES}"
    );
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_minutes)
        .with_context(|| format!("{value} minutes is out of range"))
}

pub fn days(value: u64) -> Result<Duration> {
    ensure!(
        (1..=MAX_RETENTION_DAYS).contains(&value),
        "{value} days is outside 1..={MAX_RETENTION_DAYS}"
    );
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_days)
        .with_context(|| format!("{value} days is out of range"))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
