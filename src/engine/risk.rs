//! Risk assessment
//!
//! Worst case dominates: the overall level is the worst single finding, raised
//! to at least High by any Critical finding or by more Medium findings than
//! the configured threshold.

use crate::engine::policy::RiskThresholds;
use crate::types::{PriorityTier, RiskLevel};
use serde::{Deserialize, Serialize};

/// One risk-relevant observation made while planning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub target: String,
    pub level: RiskLevel,
    pub reason: String,
}

impl Finding {
    pub fn new(target: impl Into<String>, level: RiskLevel, reason: impl Into<String>) -> Self {
        Self {
            operation_id: None,
            target: target.into(),
            level,
            reason: reason.into(),
        }
    }
}

/// Finding level for an executable operation in a given risk tier
pub fn level_for_tier(tier: PriorityTier) -> RiskLevel {
    match tier {
        PriorityTier::Critical => RiskLevel::Critical,
        PriorityTier::Important | PriorityTier::Sensitive => RiskLevel::Medium,
        PriorityTier::Optional => RiskLevel::Low,
    }
}

/// Aggregated risk of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub overall: RiskLevel,
    pub tolerance: RiskLevel,
    pub within_tolerance: bool,
    pub medium_count: usize,
    pub critical_count: usize,
    pub findings: Vec<Finding>,
}

pub fn assess(findings: Vec<Finding>, thresholds: &RiskThresholds, tolerance: RiskLevel) -> RiskAssessment {
    let medium_count = findings.iter().filter(|f| f.level == RiskLevel::Medium).count();
    let critical_count = findings.iter().filter(|f| f.level == RiskLevel::Critical).count();

    let mut overall = findings
        .iter()
        .map(|f| f.level)
        .max()
        .unwrap_or(RiskLevel::Low);
    if critical_count > 0 || medium_count > thresholds.medium_escalation_count {
        overall = overall.max(RiskLevel::High);
    }

    RiskAssessment {
        overall,
        tolerance,
        within_tolerance: overall <= tolerance,
        medium_count,
        critical_count,
        findings,
    }
}
