//! Per-operation state machine
//!
//! Every operation moves through the same stages, whatever it targets. The
//! lifecycle owns the current stage and refuses transitions that would skip
//! the backup, mutate twice, or leave a terminal state.
//!
//! # Stage Flow
//!
//! ```text
//! Pending   -> BackingUp | Mutating | Skipped
//! BackingUp -> Mutating | Failed
//! Mutating  -> Verifying | Failed | Skipped (dry run)
//! Verifying -> Succeeded | Failed
//! Failed    -> RolledBack
//! ```

use crate::error::IdResetError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Stages of one operation.
///
/// An operation starts in `Pending` and ends in one of the terminal stages
/// (`Succeeded`, `RolledBack`, `Skipped`) or stays `Failed` when nothing can
/// be restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStage {
    /// Planned, nothing touched yet
    Pending,

    /// Copying the target (and its sidecars) to the backup location
    BackingUp,

    /// Applying the mutation; retried up to the configured attempts
    Mutating,

    /// Reading the target back and comparing it with what was written
    Verifying,

    /// Written and verified
    Succeeded,

    /// Backup, mutation or verification failed
    Failed,

    /// Restored from backup after a failure
    RolledBack,

    /// Not executed: no-op, excluded by the mode, aborted, cancelled or dry run
    Skipped,
}

impl OpStage {
    /// No further transitions. `Failed` is not terminal: it may still roll back.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::RolledBack | Self::Skipped)
    }

    /// Whether `self -> to` is a legal edge
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::BackingUp)
                | (Self::Pending, Self::Mutating)
                | (Self::Pending, Self::Skipped)
                | (Self::BackingUp, Self::Mutating)
                | (Self::BackingUp, Self::Failed)
                | (Self::Mutating, Self::Verifying)
                | (Self::Mutating, Self::Failed)
                | (Self::Mutating, Self::Skipped)
                | (Self::Verifying, Self::Succeeded)
                | (Self::Verifying, Self::Failed)
                | (Self::Failed, Self::RolledBack)
        )
    }

    /// Human-readable stage name used in logs
    pub const fn description(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::BackingUp => "backing up",
            Self::Mutating => "mutating",
            Self::Verifying => "verifying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled back",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for OpStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors from driving the state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// The edge is not part of the stage flow
    #[error("cannot move from {from} to {to}")]
    Invalid { from: OpStage, to: OpStage },

    /// Target equals the current stage
    #[error("already {stage}")]
    AlreadyAt { stage: OpStage },

    /// The current stage accepts no further transitions
    #[error("{from} is terminal")]
    FromTerminal { from: OpStage },
}

impl From<TransitionError> for IdResetError {
    fn from(err: TransitionError) -> Self {
        IdResetError::Transition(err.to_string())
    }
}

/// One entry of the stage history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: OpStage,
    /// When the stage was entered
    pub at: DateTime<Utc>,
}

/// Owned state of a single operation's execution
#[derive(Debug, Clone)]
pub struct OpLifecycle {
    operation_id: String,
    current: OpStage,
    history: Vec<StageRecord>,
}

impl OpLifecycle {
    /// Start a lifecycle in `Pending`
    pub fn new(operation_id: impl Into<String>) -> Self {
        let mut lifecycle = Self {
            operation_id: operation_id.into(),
            current: OpStage::Pending,
            history: Vec::with_capacity(5),
        };
        lifecycle.record(OpStage::Pending);
        lifecycle
    }

    /// Stage the operation is in now
    #[inline]
    pub fn current(&self) -> OpStage {
        self.current
    }

    /// Every stage entered so far, oldest first
    pub fn history(&self) -> &[StageRecord] {
        &self.history
    }

    /// Whether the operation ever entered `stage`
    pub fn visited(&self, stage: OpStage) -> bool {
        self.history.iter().any(|r| r.stage == stage)
    }

    /// Consume the lifecycle, keeping its stage history
    pub fn into_history(self) -> Vec<StageRecord> {
        self.history
    }

    /// Move to `target`, validating the edge
    pub fn transition_to(&mut self, target: OpStage) -> Result<OpStage, TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::FromTerminal { from: self.current });
        }
        if target == self.current {
            return Err(TransitionError::AlreadyAt { stage: target });
        }
        if !self.current.can_transition_to(target) {
            return Err(TransitionError::Invalid {
                from: self.current,
                to: target,
            });
        }
        debug!("{}: {} -> {}", self.operation_id, self.current, target);
        self.current = target;
        self.record(target);
        Ok(target)
    }

    /// Append `stage` to the history with the current time
    fn record(&mut self, stage: OpStage) {
        self.history.push(StageRecord {
            stage,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut lc = OpLifecycle::new("op-0001");
        for stage in [
            OpStage::BackingUp,
            OpStage::Mutating,
            OpStage::Verifying,
            OpStage::Succeeded,
        ] {
            lc.transition_to(stage).unwrap();
        }
        assert_eq!(lc.current(), OpStage::Succeeded);
        assert_eq!(lc.history().len(), 5);
        assert!(lc.visited(OpStage::BackingUp));
    }

    #[test]
    fn test_cannot_skip_verification() {
        let mut lc = OpLifecycle::new("op-0001");
        lc.transition_to(OpStage::Mutating).unwrap();
        assert_eq!(
            lc.transition_to(OpStage::Succeeded),
            Err(TransitionError::Invalid {
                from: OpStage::Mutating,
                to: OpStage::Succeeded
            })
        );
    }

    #[test]
    fn test_backup_failure_cannot_roll_forward() {
        let mut lc = OpLifecycle::new("op-0001");
        lc.transition_to(OpStage::BackingUp).unwrap();
        lc.transition_to(OpStage::Failed).unwrap();
        assert!(lc.transition_to(OpStage::Mutating).is_err());
        // Rolling back is still allowed from Failed
        lc.transition_to(OpStage::RolledBack).unwrap();
        assert_eq!(
            lc.transition_to(OpStage::Pending),
            Err(TransitionError::FromTerminal {
                from: OpStage::RolledBack
            })
        );
    }

    #[test]
    fn test_same_stage_is_rejected() {
        let mut lc = OpLifecycle::new("op-0001");
        assert_eq!(
            lc.transition_to(OpStage::Pending),
            Err(TransitionError::AlreadyAt {
                stage: OpStage::Pending
            })
        );
    }

    #[test]
    fn test_dry_run_short_circuits_at_mutating() {
        let mut lc = OpLifecycle::new("op-0001");
        lc.transition_to(OpStage::Mutating).unwrap();
        lc.transition_to(OpStage::Skipped).unwrap();
        assert!(lc.current().is_terminal());
    }

    #[test]
    fn test_only_documented_stages_are_terminal() {
        let all = [
            OpStage::Pending,
            OpStage::BackingUp,
            OpStage::Mutating,
            OpStage::Verifying,
            OpStage::Succeeded,
            OpStage::Failed,
            OpStage::RolledBack,
            OpStage::Skipped,
        ];
        let terminal: Vec<OpStage> = all.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![OpStage::Succeeded, OpStage::RolledBack, OpStage::Skipped]
        );
        for stage in all {
            assert_eq!(stage.to_string(), stage.description());
            if stage.is_terminal() {
                assert!(all.iter().all(|to| !stage.can_transition_to(*to)));
            }
        }
    }

    #[test]
    fn test_error_converts_to_crate_error() {
        let err: IdResetError = TransitionError::AlreadyAt {
            stage: OpStage::Failed,
        }
        .into();
        assert_eq!(err.to_string(), "Invalid operation transition: already failed");
    }
}
