//! Configuration management for chatfolders.
//!
//! Engine policy parameters and log settings, stored as JSON next to the
//! store file. Every field has a default, so a missing or partial file is
//! fine.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::groups::PresetGroup;
use crate::logging::LogConfig;
use crate::reconcile::{ReconcilePolicy, WatchdogPolicy};
use crate::store::{QuotaPolicy, WritePolicy};

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from disk, or return default if not found
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.engine.validate();

        Ok(config)
    }

    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not find config directory")?;

        Ok(config_dir.join("chatfolders").join("config.json"))
    }
}

/// Timing and threshold parameters for the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Write delay when the store has been quiet (ms)
    #[serde(default = "default_short_delay_ms")]
    pub write_short_delay_ms: u64,

    /// Write delay right after another write (ms)
    #[serde(default = "default_long_delay_ms")]
    pub write_long_delay_ms: u64,

    #[serde(default = "default_long_delay_ms")]
    pub write_min_interval_ms: u64,

    /// Rate-limit backoff floor, never below 60s
    #[serde(default = "default_backoff_floor_secs")]
    pub backoff_floor_secs: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_max_other_retries")]
    pub max_other_retries: u32,

    #[serde(default)]
    pub quota: QuotaPolicy,

    /// Title sync debounce window (ms)
    #[serde(default = "default_sweep_debounce_ms")]
    pub sweep_debounce_ms: u64,

    #[serde(default = "default_deep_cleanup_secs")]
    pub deep_cleanup_interval_secs: u64,

    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,

    #[serde(default = "default_drift_threshold_ms")]
    pub drift_threshold_ms: u64,

    #[serde(default = "default_divergence_ratio")]
    pub divergence_ratio: f64,

    #[serde(default = "default_hard_divergence_ratio")]
    pub hard_divergence_ratio: f64,

    #[serde(default = "default_divergence_slack")]
    pub divergence_slack: usize,

    /// How long a new-chat handshake waits for the host (ms)
    #[serde(default = "default_creation_timeout_ms")]
    pub creation_timeout_ms: u64,

    /// Index size above which pruning drops unlisted paths in bulk
    #[serde(default = "default_aggressive_prune_threshold")]
    pub aggressive_prune_threshold: usize,

    /// Entries rendered per slice regardless of frame budget
    #[serde(default = "default_min_slice_items")]
    pub min_slice_items: usize,

    /// Groups created the first time a store is seen
    #[serde(default = "default_presets")]
    pub presets: Vec<PresetGroup>,
}

fn default_short_delay_ms() -> u64 {
    300
}

fn default_long_delay_ms() -> u64 {
    2000
}

fn default_backoff_floor_secs() -> u64 {
    60
}

fn default_max_backoff_secs() -> u64 {
    15 * 60
}

fn default_max_other_retries() -> u32 {
    3
}

fn default_sweep_debounce_ms() -> u64 {
    250
}

fn default_deep_cleanup_secs() -> u64 {
    5 * 60
}

fn default_watchdog_interval_ms() -> u64 {
    10_000
}

fn default_drift_threshold_ms() -> u64 {
    2000
}

fn default_divergence_ratio() -> f64 {
    2.0
}

fn default_hard_divergence_ratio() -> f64 {
    4.0
}

fn default_divergence_slack() -> usize {
    50
}

fn default_creation_timeout_ms() -> u64 {
    10_000
}

fn default_aggressive_prune_threshold() -> usize {
    500
}

fn default_min_slice_items() -> usize {
    8
}

fn default_presets() -> Vec<PresetGroup> {
    vec![
        PresetGroup::new("Work"),
        PresetGroup::new("Study"),
        PresetGroup::new("Ideas"),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_short_delay_ms: default_short_delay_ms(),
            write_long_delay_ms: default_long_delay_ms(),
            write_min_interval_ms: default_long_delay_ms(),
            backoff_floor_secs: default_backoff_floor_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            max_other_retries: default_max_other_retries(),
            quota: QuotaPolicy::default(),
            sweep_debounce_ms: default_sweep_debounce_ms(),
            deep_cleanup_interval_secs: default_deep_cleanup_secs(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            drift_threshold_ms: default_drift_threshold_ms(),
            divergence_ratio: default_divergence_ratio(),
            hard_divergence_ratio: default_hard_divergence_ratio(),
            divergence_slack: default_divergence_slack(),
            creation_timeout_ms: default_creation_timeout_ms(),
            aggressive_prune_threshold: default_aggressive_prune_threshold(),
            min_slice_items: default_min_slice_items(),
            presets: default_presets(),
        }
    }
}

impl EngineConfig {
    /// Clamp values into ranges the engine can work with
    pub fn validate(&mut self) {
        self.write_short_delay_ms = self.write_short_delay_ms.clamp(50, 10_000);
        self.write_long_delay_ms = self.write_long_delay_ms.max(self.write_short_delay_ms);
        self.backoff_floor_secs = self.backoff_floor_secs.max(60);
        self.max_backoff_secs = self.max_backoff_secs.max(self.backoff_floor_secs);
        self.max_other_retries = self.max_other_retries.max(1);
        self.sweep_debounce_ms = self.sweep_debounce_ms.clamp(50, 2000);
        self.deep_cleanup_interval_secs = self.deep_cleanup_interval_secs.max(30);
        self.watchdog_interval_ms = self.watchdog_interval_ms.max(1000);
        if !self.divergence_ratio.is_finite() || self.divergence_ratio < 1.0 {
            self.divergence_ratio = default_divergence_ratio();
        }
        if !self.hard_divergence_ratio.is_finite()
            || self.hard_divergence_ratio < self.divergence_ratio
        {
            self.hard_divergence_ratio = self.divergence_ratio * 2.0;
        }
        self.creation_timeout_ms = self.creation_timeout_ms.clamp(1000, 60_000);
        self.min_slice_items = self.min_slice_items.max(1);
        self.presets.retain(|p| !p.name.trim().is_empty());
    }

    pub fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            short_delay: Duration::from_millis(self.write_short_delay_ms),
            long_delay: Duration::from_millis(self.write_long_delay_ms),
            min_interval: Duration::from_millis(self.write_min_interval_ms),
            backoff_floor: Duration::from_secs(self.backoff_floor_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            max_other_retries: self.max_other_retries,
            quota: self.quota.clone(),
        }
    }

    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            sweep_debounce: Duration::from_millis(self.sweep_debounce_ms),
            deep_cleanup_interval: Duration::from_secs(self.deep_cleanup_interval_secs),
            watchdog: WatchdogPolicy {
                interval: Duration::from_millis(self.watchdog_interval_ms),
                drift_threshold: Duration::from_millis(self.drift_threshold_ms),
                divergence_ratio: self.divergence_ratio,
                hard_divergence_ratio: self.hard_divergence_ratio,
                divergence_slack: self.divergence_slack,
            },
        }
    }

    pub fn creation_timeout(&self) -> Duration {
        Duration::from_millis(self.creation_timeout_ms)
    }
}
