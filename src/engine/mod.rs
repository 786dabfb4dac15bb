//! Engine modules: planning and execution.
//!
//! The Strategy Engine turns an inventory into an ordered, validated plan; the
//! Execution Engine drives each planned operation through its lifecycle.

pub mod executor;
pub mod lifecycle;
pub mod operation;
pub mod policy;
pub mod risk;
pub mod strategy;

pub use executor::{ExecutionHooks, ExecutionOutcome, ExecutionResult, Executor, ExecutorConfig, NoHooks};
pub use lifecycle::{OpLifecycle, OpStage};
pub use operation::{BackupPlan, Disposition, Mutation, Operation, RollbackPlan};
pub use policy::{ModePolicy, PolicyTable};
pub use risk::{Finding, RiskAssessment};
pub use strategy::{Plan, Strategy};
