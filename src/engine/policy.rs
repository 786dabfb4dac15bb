//! Mode policies
//!
//! Mode presets and risk thresholds are versioned data (`data/policy.v1.json`),
//! not engine logic. `adaptive` is derived from the risk tolerance and
//! `custom` comes from the run configuration; every other mode is a preset.

use crate::error::{IdResetError, Result};
use crate::types::{FailurePolicy, Mode, PriorityTier, RiskLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

pub const SUPPORTED_POLICY_VERSION: u32 = 1;

const BUILTIN_POLICY: &str = include_str!("../../data/policy.v1.json");

fn default_parallel() -> usize {
    1
}

/// Effective policy of one mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModePolicy {
    /// Tiers whose artifacts may be mutated
    pub eligible_tiers: Vec<PriorityTier>,
    /// Sensitive artifacts are only mutated when this is set
    pub include_sensitive: bool,
    pub failure_policy: FailurePolicy,
    /// Back up every mutated artifact, not only Critical/Important ones
    #[serde(default)]
    pub backup_all: bool,
    /// Treat Sensitive operations as Important (backed up, counted as Important)
    #[serde(default)]
    pub escalate_sensitive: bool,
    #[serde(default = "default_parallel")]
    pub max_parallel: usize,
}

impl ModePolicy {
    pub fn is_eligible(&self, tier: PriorityTier) -> bool {
        let listed = self.eligible_tiers.contains(&tier);
        match tier {
            PriorityTier::Sensitive => listed && self.include_sensitive,
            _ => listed,
        }
    }

    /// Tier used for backup and failure handling
    pub fn risk_tier(&self, tier: PriorityTier) -> PriorityTier {
        if tier == PriorityTier::Sensitive && self.escalate_sensitive {
            PriorityTier::Important
        } else {
            tier
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.eligible_tiers.is_empty() {
            return Err(IdResetError::configuration("a mode policy needs at least one eligible tier"));
        }
        if self.max_parallel == 0 || self.max_parallel > 64 {
            return Err(IdResetError::configuration("max_parallel must be between 1 and 64"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskThresholds {
    /// More Medium findings than this escalate the overall risk to High
    pub medium_escalation_count: usize,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium_escalation_count: 2,
        }
    }
}

/// Versioned preset table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyTable {
    pub version: u32,
    pub thresholds: RiskThresholds,
    /// Keyed by mode name
    pub presets: BTreeMap<String, ModePolicy>,
}

impl PolicyTable {
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_POLICY)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let table: Self = serde_json::from_str(json)
            .map_err(|e| IdResetError::configuration(format!("invalid policy data: {}", e)))?;
        table.validate()?;
        Ok(table)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            IdResetError::configuration(format!(
                "cannot read policy file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != SUPPORTED_POLICY_VERSION {
            return Err(IdResetError::configuration(format!(
                "unsupported policy version {} (expected {})",
                self.version, SUPPORTED_POLICY_VERSION
            )));
        }
        for (name, policy) in &self.presets {
            let mode = Mode::from_str(name).map_err(|_| {
                IdResetError::configuration(format!("unknown mode '{}' in policy data", name))
            })?;
            if matches!(mode, Mode::Adaptive | Mode::Custom) {
                return Err(IdResetError::configuration(format!(
                    "mode '{}' is derived at runtime and cannot be a preset",
                    name
                )));
            }
            policy.validate()?;
        }
        for mode in [Mode::Minimal, Mode::Conservative, Mode::Standard, Mode::Aggressive, Mode::Forensic] {
            if !self.presets.contains_key(&mode.to_string()) {
                return Err(IdResetError::configuration(format!(
                    "policy data is missing preset '{}'",
                    mode
                )));
            }
        }
        Ok(())
    }

    fn preset(&self, mode: Mode) -> Result<&ModePolicy> {
        self.presets.get(&mode.to_string()).ok_or_else(|| {
            IdResetError::configuration(format!("no preset for mode '{}'", mode))
        })
    }

    /// Effective policy for `mode`
    pub fn resolve(
        &self,
        mode: Mode,
        tolerance: RiskLevel,
        custom: Option<&ModePolicy>,
    ) -> Result<ModePolicy> {
        match mode {
            Mode::Adaptive => {
                let base = match tolerance {
                    RiskLevel::Low => Mode::Conservative,
                    RiskLevel::Medium => Mode::Standard,
                    RiskLevel::High | RiskLevel::Critical => Mode::Aggressive,
                };
                let mut policy = self.preset(base)?.clone();
                policy.failure_policy = if tolerance >= RiskLevel::High {
                    FailurePolicy::Continue
                } else {
                    FailurePolicy::AbortOnCriticalFailure
                };
                policy.backup_all = false;
                policy.max_parallel = 1;
                Ok(policy)
            }
            Mode::Custom => {
                let policy = custom.cloned().ok_or_else(|| {
                    IdResetError::configuration("mode 'custom' requires a custom_policy")
                })?;
                policy.validate()?;
                Ok(policy)
            }
            preset => Ok(self.preset(preset)?.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PolicyTable {
        PolicyTable::builtin().expect("built-in policy must load")
    }

    #[test]
    fn test_presets_follow_the_table() {
        let t = table();
        let minimal = t.resolve(Mode::Minimal, RiskLevel::Medium, None).unwrap();
        assert!(minimal.is_eligible(PriorityTier::Critical));
        assert!(!minimal.is_eligible(PriorityTier::Important));

        let standard = t.resolve(Mode::Standard, RiskLevel::Medium, None).unwrap();
        assert!(standard.is_eligible(PriorityTier::Optional));
        assert!(!standard.is_eligible(PriorityTier::Sensitive));
        assert_eq!(standard.failure_policy, FailurePolicy::AbortOnCriticalFailure);

        let aggressive = t.resolve(Mode::Aggressive, RiskLevel::Medium, None).unwrap();
        assert!(aggressive.is_eligible(PriorityTier::Sensitive));
        assert_eq!(aggressive.failure_policy, FailurePolicy::Continue);
        assert_eq!(aggressive.max_parallel, 4);
        assert_eq!(aggressive.risk_tier(PriorityTier::Sensitive), PriorityTier::Important);

        let forensic = t.resolve(Mode::Forensic, RiskLevel::Medium, None).unwrap();
        assert!(forensic.backup_all);
    }

    #[test]
    fn test_adaptive_follows_tolerance() {
        let t = table();
        let low = t.resolve(Mode::Adaptive, RiskLevel::Low, None).unwrap();
        assert!(!low.is_eligible(PriorityTier::Optional));
        assert_eq!(low.failure_policy, FailurePolicy::AbortOnCriticalFailure);

        let high = t.resolve(Mode::Adaptive, RiskLevel::High, None).unwrap();
        assert!(high.is_eligible(PriorityTier::Sensitive));
        assert_eq!(high.failure_policy, FailurePolicy::Continue);
        assert_eq!(high.max_parallel, 1);
    }

    #[test]
    fn test_custom_requires_policy() {
        let t = table();
        assert!(t.resolve(Mode::Custom, RiskLevel::Medium, None).is_err());
        let custom = ModePolicy {
            eligible_tiers: vec![PriorityTier::Optional],
            include_sensitive: false,
            failure_policy: FailurePolicy::Continue,
            backup_all: true,
            escalate_sensitive: false,
            max_parallel: 2,
        };
        assert_eq!(t.resolve(Mode::Custom, RiskLevel::Low, Some(&custom)).unwrap(), custom);
    }

    #[test]
    fn test_sensitive_needs_both_flags() {
        let policy = ModePolicy {
            eligible_tiers: vec![PriorityTier::Sensitive],
            include_sensitive: false,
            failure_policy: FailurePolicy::Continue,
            backup_all: false,
            escalate_sensitive: false,
            max_parallel: 1,
        };
        assert!(!policy.is_eligible(PriorityTier::Sensitive));
    }

    #[test]
    fn test_invalid_policy_data_is_rejected() {
        let json = BUILTIN_POLICY.replacen("\"version\": 1", "\"version\": 9", 1);
        assert!(PolicyTable::from_json(&json).is_err());

        let mut t = table();
        t.presets.remove("forensic");
        assert!(t.validate().is_err());

        let mut t = table();
        let standard = t.presets["standard"].clone();
        t.presets.insert("adaptive".into(), standard);
        assert!(t.validate().is_err());
    }
}
