//! Machine-readable run report
//!
//! One JSON document per run: inventory counts, the risk assessment, every
//! operation with its final status, the identifier values of the run and the
//! verifier's remaining issues.

use crate::artifact::{DiscoveryWarning, Inventory, InventorySummary};
use crate::engine::executor::{ExecutionOutcome, Preview};
use crate::engine::operation::Disposition;
use crate::engine::risk::RiskAssessment;
use crate::engine::strategy::Plan;
use crate::error::{IdResetError, Result};
use crate::identifiers::IdentifierSet;
use crate::types::{ActionType, ExecutionStatus, Mode, PriorityTier, ScanMode};
use crate::verify::VerificationReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use strum::Display;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Some operations failed or verification found issues
    CompletedWithIssues,
    /// A Critical operation failed under abort-on-critical-failure
    Aborted,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub fixed: usize,
    pub failed: usize,
    pub rolled_back: usize,
    pub skipped: usize,
    pub noop: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub id: String,
    pub action: ActionType,
    pub target: String,
    pub installation: String,
    pub priority: PriorityTier,
    pub risk_tier: PriorityTier,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backups: Vec<PathBuf>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<Preview>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: Mode,
    pub scan_mode: ScanMode,
    pub dry_run: bool,
    pub status: RunStatus,
    pub inventory: InventorySummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<DiscoveryWarning>,
    pub risk: RiskAssessment,
    pub estimated_duration_ms: u64,
    pub identifiers: IdentifierSet,
    pub operations: Vec<OperationReport>,
    pub summary: RunSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl RunReport {
    pub fn build(
        started_at: DateTime<Utc>,
        inventory: &Inventory,
        plan: &Plan,
        outcome: &ExecutionOutcome,
        verification: Option<VerificationReport>,
        dry_run: bool,
    ) -> Self {
        let mut summary = RunSummary::default();
        let operations: Vec<OperationReport> = plan
            .operations
            .iter()
            .map(|op| {
                let result = outcome.get(&op.id);
                let status = result.map_or(ExecutionStatus::Skipped, |r| r.status);
                let reason = match &op.disposition {
                    Disposition::NoOp { reason } | Disposition::Skipped { reason } => Some(reason.clone()),
                    Disposition::Execute => None,
                };
                match (status, &op.disposition) {
                    (ExecutionStatus::Success, _) => summary.fixed += 1,
                    (ExecutionStatus::Failed, _) => summary.failed += 1,
                    (ExecutionStatus::RolledBack, _) => summary.rolled_back += 1,
                    (ExecutionStatus::Skipped, Disposition::NoOp { .. }) => summary.noop += 1,
                    (ExecutionStatus::Skipped, _) => summary.skipped += 1,
                }
                OperationReport {
                    id: op.id.clone(),
                    action: op.action,
                    target: op.target(),
                    installation: op.installation.clone(),
                    priority: op.priority,
                    risk_tier: op.risk_tier,
                    status,
                    reason,
                    error: result
                        .and_then(|r| r.error.clone())
                        .filter(|_| op.is_executable()),
                    rollback_error: result.and_then(|r| r.rollback_error.clone()),
                    backups: result.map(|r| r.backup_locations.clone()).unwrap_or_default(),
                    attempts: result.map_or(0, |r| r.attempts),
                    preview: result.and_then(|r| r.preview.clone()),
                }
            })
            .collect();

        let issues = verification.as_ref().is_some_and(|v| !v.is_success());
        let status = if outcome.aborted.is_some() {
            RunStatus::Aborted
        } else if outcome.cancelled {
            RunStatus::Cancelled
        } else if summary.failed + summary.rolled_back > 0 || issues {
            RunStatus::CompletedWithIssues
        } else {
            RunStatus::Completed
        };

        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            mode: plan.mode,
            scan_mode: inventory.scan_mode,
            dry_run,
            status,
            inventory: inventory.summary(),
            warnings: inventory.warnings.clone(),
            risk: plan.risk.clone(),
            estimated_duration_ms: plan.estimated_duration_ms,
            identifiers: plan.identifiers.clone(),
            operations,
            summary,
            verification,
            aborted: outcome.aborted.clone(),
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// One-line human summary
    pub fn summary_line(&self) -> String {
        format!(
            "{}: {} fixed, {} failed, {} rolled back, {} skipped, {} no-op",
            self.status,
            self.summary.fixed,
            self.summary.failed,
            self.summary.rolled_back,
            self.summary.skipped,
            self.summary.noop
        )
    }

    /// Err when the run aborted on a Critical failure or was cancelled
    pub fn ensure_success(&self) -> Result<()> {
        match self.status {
            RunStatus::Aborted => {
                let failed = self.operations.iter().find(|op| {
                    op.risk_tier == PriorityTier::Critical
                        && matches!(op.status, ExecutionStatus::Failed | ExecutionStatus::RolledBack)
                });
                Err(IdResetError::CriticalAbort {
                    operation: failed.map(|op| op.id.clone()).unwrap_or_default(),
                    reason: failed
                        .and_then(|op| op.error.clone())
                        .or_else(|| self.aborted.clone())
                        .unwrap_or_default(),
                })
            }
            RunStatus::Cancelled => Err(IdResetError::Cancelled),
            RunStatus::Completed | RunStatus::CompletedWithIssues => Ok(()),
        }
    }
}
