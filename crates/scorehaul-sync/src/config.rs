//! Harvest file (`harvest.yaml`) and environment configuration.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use scorehaul_adapters::{DelayRange, PagerSettings};
use scorehaul_core::HarvestTarget;
use scorehaul_storage::competition_slug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::HarvestSettings;
use crate::retry::BackoffPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("harvest file lists no targets")]
    NoTargets,
    #[error("no enabled targets remain after filtering")]
    NothingEnabled,
    #[error("competition id {0:?} is declared more than once")]
    DuplicateTarget(String),
    #[error("competition ids {first:?} and {second:?} share the artifact name {slug:?}")]
    SlugCollision {
        first: String,
        second: String,
        slug: String,
    },
    #[error("target {0:?} has an empty competition id or url")]
    BlankTarget(String),
    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("workers must be at least 1")]
    ZeroWorkers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub competition_id: String,
    pub competition_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl TargetConfig {
    pub fn to_target(&self) -> HarvestTarget {
        HarvestTarget::new(self.competition_id.trim(), self.competition_url.trim())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 10_000,
            max_delay_ms: 60_000,
            jitter_ms: 2_000,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PagerConfig {
    pub max_expansions: u32,
    pub settle_min_ms: u64,
    pub settle_max_ms: u64,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            max_expansions: 200,
            settle_min_ms: 1_000,
            settle_max_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    pub inter_target_min_ms: u64,
    pub inter_target_max_ms: u64,
    pub inter_unit_min_ms: u64,
    pub inter_unit_max_ms: u64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            inter_target_min_ms: 3_000,
            inter_target_max_ms: 5_000,
            inter_unit_min_ms: 1_000,
            inter_unit_max_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub page_ready_ms: u64,
    pub content_ms: u64,
    pub consent_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            page_ready_ms: 30_000,
            content_ms: 10_000,
            consent_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestFile {
    #[serde(default = "default_site")]
    pub site: String,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub pager: PagerConfig,
    #[serde(default)]
    pub delays: DelayConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub fetch_details: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl HarvestFile {
    pub fn from_yaml_str(data: &str) -> Result<Self> {
        serde_yaml::from_str(data).context("parsing harvest file")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        let mut seen = HashSet::new();
        let mut slugs: HashMap<String, &str> = HashMap::new();
        for target in &self.targets {
            let id = target.competition_id.trim();
            if id.is_empty() || target.competition_url.trim().is_empty() {
                return Err(ConfigError::BlankTarget(target.competition_id.clone()));
            }
            if !seen.insert(id.to_string()) {
                return Err(ConfigError::DuplicateTarget(id.to_string()));
            }
            let slug = competition_slug(id);
            if let Some(first) = slugs.insert(slug.clone(), id) {
                return Err(ConfigError::SlugCollision {
                    first: first.to_string(),
                    second: id.to_string(),
                    slug,
                });
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(())
    }

    /// Enabled targets in declaration order, narrowed to `only` when it is non-empty.
    pub fn enabled_targets(&self, only: &[String]) -> Result<Vec<HarvestTarget>, ConfigError> {
        let targets: Vec<_> = self
            .targets
            .iter()
            .filter(|t| t.enabled)
            .filter(|t| only.is_empty() || only.iter().any(|o| o == t.competition_id.trim()))
            .map(TargetConfig::to_target)
            .collect();
        if targets.is_empty() {
            return Err(ConfigError::NothingEnabled);
        }
        Ok(targets)
    }

    pub fn settings(&self) -> HarvestSettings {
        HarvestSettings {
            backoff: self.retry.policy(),
            pager: PagerSettings {
                max_expansions: self.pager.max_expansions,
                settle: DelayRange::from_millis(self.pager.settle_min_ms, self.pager.settle_max_ms),
            },
            inter_target_delay: DelayRange::from_millis(
                self.delays.inter_target_min_ms,
                self.delays.inter_target_max_ms,
            ),
            inter_unit_delay: DelayRange::from_millis(
                self.delays.inter_unit_min_ms,
                self.delays.inter_unit_max_ms,
            ),
            page_ready_timeout: Duration::from_millis(self.timeouts.page_ready_ms),
            content_timeout: Duration::from_millis(self.timeouts.content_ms),
            consent_timeout: Duration::from_millis(self.timeouts.consent_ms),
            fetch_details: self.fetch_details,
        }
    }
}

/// Reads and validates a harvest file.
pub fn load_harvest_file(path: impl AsRef<Path>) -> Result<HarvestFile> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: HarvestFile =
        serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    file.validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(file)
}

/// Deployment paths and browser settings taken from the environment.
#[derive(Debug, Clone)]
pub struct HarvestEnv {
    pub config_path: PathBuf,
    pub output_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub webdriver_url: String,
    pub headless: bool,
    pub user_agent: Option<String>,
}

impl HarvestEnv {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("SCOREHAUL_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./harvest.yaml")),
            output_dir: std::env::var("SCOREHAUL_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/competitions")),
            reports_dir: std::env::var("SCOREHAUL_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            webdriver_url: std::env::var("SCOREHAUL_WEBDRIVER_URL")
                .unwrap_or_else(|_| "http://localhost:9515".to_string()),
            headless: std::env::var("SCOREHAUL_HEADLESS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            user_agent: std::env::var("SCOREHAUL_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_site() -> String {
    "flashscore".to_string()
}

fn default_workers() -> usize {
    1
}
