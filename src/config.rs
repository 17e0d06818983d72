//! Configuration loading with fallback chain.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{MillrunError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub admission: AdmissionConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for stores, artifacts, inbox, and outbox
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("millrun"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded automatic retries per run() invocation
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts
    pub backoff_base_ms: u64,
    /// Backoff cap
    pub backoff_cap_ms: u64,
    /// A Running record older than this is presumed crashed
    pub staleness_timeout_secs: u64,
    /// Per-call timeout on external collaborator invocations
    pub collaborator_timeout_ms: u64,
    /// How many days of admitted items SELECT looks back over
    pub select_window_days: u32,
    /// Days before a written topic may be selected again
    pub topic_cooldown_days: u32,
    /// Written-topic retention for the cooldown table
    pub topic_retention_days: u32,
    /// Daily cap on free-track publishes
    pub max_free_per_day: u32,
    /// Daily cap on paid-track publishes
    pub max_paid_per_day: u32,
    /// Keep at most this many items per ingest batch
    pub max_items_per_batch: usize,
    /// Score prior used by the offline scorer
    pub offline_score_prior: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 64_000,
            staleness_timeout_secs: 3600,
            collaborator_timeout_ms: 300_000,
            select_window_days: 1,
            topic_cooldown_days: 7,
            topic_retention_days: 30,
            max_free_per_day: 24,
            max_paid_per_day: 1,
            max_items_per_batch: 8,
            offline_score_prior: 7.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Minimum average across required metrics
    pub score_threshold: f64,
    /// Minimum value for any single required metric
    pub metric_floor: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            score_threshold: 6.5,
            metric_floor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Sampled artifacts scoring below this raise score-drift findings
    pub quality_threshold: f64,
    /// How many artifacts per date the quality sampler looks at
    pub sample_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 6.0,
            sample_size: 3,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            admission: AdmissionConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config: Self =
            serde_yaml::from_str(&content).map_err(|e| MillrunError::Storage(format!("bad config file: {}", e)))?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn staleness_timeout_ms(&self) -> i64 {
        (self.pipeline.staleness_timeout_secs * 1000) as i64
    }
}
