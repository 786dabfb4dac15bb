//! Run configuration: saving and loading the settings of a pipeline run.
//!
//! Every closed value is a typed enum, so a typo in a config file fails at
//! load time instead of silently selecting a default.

use crate::discovery::{DiscoveryOptions, DiscoveryRoots};
use crate::engine::executor::{DEFAULT_RETRY_DELAY_MS, ExecutorConfig};
use crate::engine::policy::ModePolicy;
use crate::error::{IdResetError, Result};
use crate::patterns::PatternConfig;
use crate::types::{Mode, RiskLevel, ScanMode};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const STATE_DIR_NAME: &str = ".idreset";

fn default_retention() -> usize {
    5
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_query_timeout_secs() -> u64 {
    30
}

fn default_include_registry() -> bool {
    cfg!(windows)
}

/// `~/.idreset`, or a directory under the system temp dir without a home
pub fn default_state_dir() -> PathBuf {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(STATE_DIR_NAME))
        .unwrap_or_else(|| env::temp_dir().join("idreset"))
}

/// Settings of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    // Discovery
    #[serde(default)]
    pub scan_mode: ScanMode,
    #[serde(default = "default_include_registry")]
    pub include_registry: bool,
    #[serde(default)]
    pub include_volatile_temp: bool,
    /// Explicit discovery roots; the platform defaults when absent
    #[serde(default)]
    pub roots: Option<DiscoveryRoots>,
    /// Replacement pattern file
    #[serde(default)]
    pub patterns: Option<PathBuf>,

    // Strategy
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub risk_tolerance: RiskLevel,
    /// Required when `mode` is `custom`
    #[serde(default)]
    pub custom_policy: Option<ModePolicy>,

    // Execution
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_retries")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Overrides the mode's batch size
    #[serde(default)]
    pub max_parallel: Option<usize>,

    // Backups and state
    /// Dedicated backup directory; sibling `<file>.backup_<ts>` copies when absent
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    /// Maintenance only, never enforced during a run
    #[serde(default = "default_retention")]
    pub backup_retention_count: usize,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scan_mode: ScanMode::default(),
            include_registry: default_include_registry(),
            include_volatile_temp: false,
            roots: None,
            patterns: None,
            mode: Mode::default(),
            risk_tolerance: RiskLevel::default(),
            custom_policy: None,
            dry_run: false,
            max_retry_attempts: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            query_timeout_secs: default_query_timeout_secs(),
            max_parallel: None,
            backup_dir: None,
            backup_retention_count: default_retention(),
            state_dir: default_state_dir(),
            report_path: None,
        }
    }
}

impl RunConfig {
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|e| {
            IdResetError::configuration(format!(
                "cannot write configuration to {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            IdResetError::configuration(format!(
                "cannot read configuration from {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| IdResetError::configuration(format!("invalid configuration: {}", e)))
    }

    /// Reject settings that would make a run unsafe or meaningless
    pub fn validate(&self) -> Result<()> {
        if self.max_retry_attempts == 0 {
            return Err(IdResetError::configuration("max_retry_attempts must be at least 1"));
        }
        if self.query_timeout_secs == 0 {
            return Err(IdResetError::configuration("query_timeout_secs must be positive"));
        }
        if self.backup_retention_count == 0 {
            return Err(IdResetError::configuration("backup_retention_count must be at least 1"));
        }
        if let Some(n) = self.max_parallel {
            if n == 0 || n > 64 {
                return Err(IdResetError::configuration("max_parallel must be between 1 and 64"));
            }
        }
        match (&self.mode, &self.custom_policy) {
            (Mode::Custom, None) => {
                return Err(IdResetError::configuration("mode 'custom' requires a custom_policy"));
            }
            (_, Some(policy)) => policy.validate()?,
            _ => {}
        }
        if let Some(backup_dir) = &self.backup_dir {
            if backup_dir.as_os_str().is_empty() {
                return Err(IdResetError::configuration("backup_dir must not be empty"));
            }
        }
        self.load_patterns()?;
        Ok(())
    }

    /// Pattern data for this run: the replacement file, or the built-in set
    pub fn load_patterns(&self) -> Result<PatternConfig> {
        match &self.patterns {
            Some(path) => PatternConfig::load_from_file(path),
            None => PatternConfig::builtin(),
        }
    }

    pub fn discovery_roots(&self) -> DiscoveryRoots {
        self.roots.clone().unwrap_or_else(DiscoveryRoots::from_env)
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            scan_mode: self.scan_mode,
            include_registry: self.include_registry,
            include_volatile_temp: self.include_volatile_temp,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Executor settings under the resolved mode policy
    pub fn executor_config(&self, policy: &ModePolicy) -> ExecutorConfig {
        ExecutorConfig {
            max_retry_attempts: self.max_retry_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            query_timeout: self.query_timeout(),
            dry_run: self.dry_run,
            failure_policy: policy.failure_policy,
            max_parallel: self.max_parallel.unwrap_or(policy.max_parallel),
        }
    }

    /// Where the report goes when no explicit path is configured
    pub fn report_path_or_default(&self, stamp: &str) -> PathBuf {
        self.report_path.clone().unwrap_or_else(|| {
            self.state_dir
                .join("reports")
                .join(format!("run-{}.json", stamp))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FailurePolicy, PriorityTier};
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = RunConfig::default();
        assert_eq!(config.mode, Mode::Standard);
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.backup_retention_count, 5);
        assert_eq!(config.risk_tolerance, RiskLevel::Medium);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: RunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.query_timeout_secs, 30);
        assert_eq!(config.retry_delay_ms, 500);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.json");
        let config = RunConfig {
            mode: Mode::Forensic,
            scan_mode: ScanMode::Comprehensive,
            dry_run: true,
            backup_dir: Some(dir.path().join("backups")),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(RunConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_unknown_fields_and_values_are_rejected() {
        assert!(serde_json::from_str::<RunConfig>(r#"{"mdoe": "standard"}"#).is_err());
        assert!(serde_json::from_str::<RunConfig>(r#"{"mode": "reckless"}"#).is_err());

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"scan_mode": "deep"}"#).unwrap();
        assert!(matches!(
            RunConfig::load_from_file(&path),
            Err(IdResetError::Configuration(_))
        ));
    }

    #[test]
    fn test_validation_rejects_unsafe_settings() {
        let zero_retries = RunConfig {
            max_retry_attempts: 0,
            ..Default::default()
        };
        assert!(zero_retries.validate().is_err());

        let zero_timeout = RunConfig {
            query_timeout_secs: 0,
            ..Default::default()
        };
        assert!(zero_timeout.validate().is_err());

        let custom_without_policy = RunConfig {
            mode: Mode::Custom,
            ..Default::default()
        };
        assert!(custom_without_policy.validate().is_err());

        let missing_patterns = RunConfig {
            patterns: Some(PathBuf::from("/nonexistent/patterns.json")),
            ..Default::default()
        };
        assert!(missing_patterns.validate().is_err());
    }

    #[test]
    fn test_executor_config_follows_policy() {
        let policy = ModePolicy {
            eligible_tiers: vec![PriorityTier::Critical],
            include_sensitive: false,
            failure_policy: FailurePolicy::Continue,
            backup_all: false,
            escalate_sensitive: false,
            max_parallel: 4,
        };
        let config = RunConfig::default();
        let exec = config.executor_config(&policy);
        assert_eq!(exec.max_parallel, 4);
        assert_eq!(exec.failure_policy, FailurePolicy::Continue);
        assert_eq!(exec.retry_delay, Duration::from_millis(500));
        assert_eq!(exec.retry_delay, ExecutorConfig::default().retry_delay);

        let pinned = RunConfig {
            max_parallel: Some(1),
            ..Default::default()
        };
        assert_eq!(pinned.executor_config(&policy).max_parallel, 1);
    }
}
