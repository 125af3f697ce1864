//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/ctxpack/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/ctxpack/` (~/.config/ctxpack/)
//! - Data: `$XDG_DATA_HOME/ctxpack/` (~/.local/share/ctxpack/)
//! - State/Logs: `$XDG_STATE_HOME/ctxpack/` (~/.local/state/ctxpack/)
//!
//! Every scoring weight and packing threshold lives here rather than in the
//! engine, so the heuristics (level-1 cutoff, fallback size, learning deltas)
//! can be retuned without touching code.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Signal weights and progressive-disclosure thresholds
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Token packing policy
    #[serde(default)]
    pub assembly: AssemblyConfig,

    /// Outcome deltas applied by the feedback loop
    #[serde(default)]
    pub learning: LearningConfig,

    /// Store queue and snapshot settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Result cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Weights for each relevance signal.
///
/// All contributions are additive on top of `base_score`, except the
/// already-viewed discount which multiplies the running score.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScoringConfig {
    pub base_score: f64,
    pub base_confidence: f64,
    /// Multiplier for files already viewed in the conversation (levels 2-3)
    pub viewed_discount: f64,
    pub similarity_weight: f64,
    pub similarity_confidence_boost: f64,
    /// Learned scores at or below this are ignored
    pub history_threshold: f64,
    pub history_weight: f64,
    pub debug_recent_boost: f64,
    pub debug_error_path_boost: f64,
    pub feature_concept_boost: f64,
    pub refactor_import_boost: f64,
    pub import_weight: f64,
    pub cochange_weight: f64,
    /// Co-change count that maps to a full-strength signal
    pub cochange_saturation: f64,
    pub path_similarity_threshold: f64,
    pub path_similarity_weight: f64,
    /// Minimum running score to survive progressive level 1
    pub level_one_cutoff: f64,
    pub recency_window_hours: u32,
    /// Per-call timeout for external signal sources
    pub signal_timeout_ms: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_score: 0.1,
            base_confidence: 0.5,
            viewed_discount: 0.5,
            similarity_weight: 0.25,
            similarity_confidence_boost: 0.1,
            history_threshold: 0.5,
            history_weight: 0.2,
            debug_recent_boost: 0.3,
            debug_error_path_boost: 0.2,
            feature_concept_boost: 0.3,
            refactor_import_boost: 0.4,
            import_weight: 0.25,
            cochange_weight: 0.15,
            cochange_saturation: 10.0,
            path_similarity_threshold: 0.5,
            path_similarity_weight: 0.1,
            level_one_cutoff: 0.6,
            recency_window_hours: 48,
            signal_timeout_ms: 2000,
        }
    }
}

impl ScoringConfig {
    pub fn signal_timeout(&self) -> Duration {
        Duration::from_millis(self.signal_timeout_ms)
    }
}

/// Token packing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AssemblyConfig {
    /// Budget used when a request does not specify one
    #[serde(default = "default_token_budget")]
    pub default_token_budget: usize,

    /// Files must score strictly above this to be packed
    #[serde(default = "default_min_relevance_score")]
    pub min_relevance_score: f64,

    /// How many top files the empty-result fallback may force in
    #[serde(default = "default_fallback_max_files")]
    pub fallback_max_files: usize,

    #[serde(default = "default_essential_threshold")]
    pub essential_threshold: f64,

    #[serde(default = "default_recommended_threshold")]
    pub recommended_threshold: f64,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            default_token_budget: default_token_budget(),
            min_relevance_score: default_min_relevance_score(),
            fallback_max_files: default_fallback_max_files(),
            essential_threshold: default_essential_threshold(),
            recommended_threshold: default_recommended_threshold(),
        }
    }
}

fn default_token_budget() -> usize {
    6000
}

fn default_min_relevance_score() -> f64 {
    0.15
}

fn default_fallback_max_files() -> usize {
    5
}

fn default_essential_threshold() -> f64 {
    0.8
}

fn default_recommended_threshold() -> f64 {
    0.5
}

/// Score deltas applied per included file when an outcome is reported
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LearningConfig {
    pub success_used_delta: f64,
    pub success_unused_delta: f64,
    pub failure_used_delta: f64,
    pub failure_unused_delta: f64,
    pub confidence_step: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            success_used_delta: 0.15,
            success_unused_delta: -0.05,
            failure_used_delta: 0.05,
            failure_unused_delta: -0.10,
            confidence_step: 0.05,
        }
    }
}

/// Store queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Operations allowed in flight at once
    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: usize,

    /// Deadline for a single store operation
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Seconds between snapshots of the in-memory store to disk
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: default_max_concurrent_operations(),
            operation_timeout_ms: default_operation_timeout(),
            snapshot_interval_secs: default_snapshot_interval(),
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

fn default_max_concurrent_operations() -> usize {
    3
}

fn default_operation_timeout() -> u64 {
    5000
}

fn default_snapshot_interval() -> u64 {
    30
}

/// Result cache configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Maximum cached responses
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Seconds a cached response stays valid
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_capacity() -> usize {
    100
}

fn default_cache_ttl() -> u64 {
    300
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::Config(format!(
            "{name} must be between 0 and 1, got {value}"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate ranges, returning the first offending setting
    pub fn validate(&self) -> Result<()> {
        check_unit("scoring.base_score", self.scoring.base_score)?;
        check_unit("scoring.base_confidence", self.scoring.base_confidence)?;
        check_unit("scoring.viewed_discount", self.scoring.viewed_discount)?;
        check_unit("scoring.level_one_cutoff", self.scoring.level_one_cutoff)?;
        check_unit(
            "assembly.min_relevance_score",
            self.assembly.min_relevance_score,
        )?;
        check_unit("learning.confidence_step", self.learning.confidence_step)?;

        if self.scoring.cochange_saturation <= 0.0 {
            return Err(Error::Config(
                "scoring.cochange_saturation must be positive".to_string(),
            ));
        }
        if self.assembly.recommended_threshold > self.assembly.essential_threshold {
            return Err(Error::Config(
                "assembly.recommended_threshold must not exceed essential_threshold".to_string(),
            ));
        }
        if self.store.max_concurrent_operations == 0 {
            return Err(Error::Config(
                "store.max_concurrent_operations must be at least 1".to_string(),
            ));
        }
        if self.store.operation_timeout_ms == 0 || self.scoring.signal_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".to_string()));
        }
        if self.cache.capacity == 0 {
            return Err(Error::Config(
                "cache.capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/ctxpack/config.toml` (~/.config/ctxpack/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("ctxpack").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite snapshot)
    ///
    /// `$XDG_DATA_HOME/ctxpack/` (~/.local/share/ctxpack/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("ctxpack")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/ctxpack/` (~/.local/state/ctxpack/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("ctxpack")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/ctxpack/context.db` (~/.local/share/ctxpack/context.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("context.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/ctxpack/ctxpack.log` (~/.local/state/ctxpack/ctxpack.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("ctxpack.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scoring.base_score, 0.1);
        assert_eq!(config.scoring.level_one_cutoff, 0.6);
        assert_eq!(config.assembly.min_relevance_score, 0.15);
        assert_eq!(config.assembly.fallback_max_files, 5);
        assert_eq!(config.store.max_concurrent_operations, 3);
        assert_eq!(config.store.snapshot_interval_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[scoring]
level_one_cutoff = 0.7
recency_window_hours = 24

[assembly]
fallback_max_files = 3

[store]
max_concurrent_operations = 1

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.scoring.level_one_cutoff, 0.7);
        assert_eq!(config.scoring.recency_window_hours, 24);
        // untouched fields keep their defaults
        assert_eq!(config.scoring.import_weight, 0.25);
        assert_eq!(config.assembly.fallback_max_files, 3);
        assert_eq!(config.assembly.min_relevance_score, 0.15);
        assert_eq!(config.store.max_concurrent_operations, 1);
        assert_eq!(config.store.operation_timeout_ms, 5000);
        assert_eq!(config.learning.success_used_delta, 0.15);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_bad_ranges() {
        let mut config = Config::default();
        config.scoring.level_one_cutoff = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.store.max_concurrent_operations = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.assembly.recommended_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\nttl_secs = 10\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.cache.ttl_secs, 10);
        assert_eq!(config.cache.capacity, 100);
    }
}
