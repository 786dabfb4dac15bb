//! idreset library
//!
//! Discovers locally persisted telemetry identifiers of editor installations,
//! plans their reset under a risk policy, executes the plan with verified
//! backups and rollback, and verifies that every installation ends up with
//! one consistent set of fresh identifiers.

pub mod artifact;
pub mod backup;
pub mod cancel;
pub mod cli;
pub mod command;
pub mod config_file;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod identifiers;
pub mod lock;
pub mod patterns;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod sql;
pub mod stores;
pub mod types;
pub mod verify;

// Re-export main types for convenience
pub use artifact::{Artifact, ArtifactLocation, Inventory, InventorySummary};
pub use backup::{BackupStore, PruneReport};
pub use cancel::CancelToken;
pub use config_file::RunConfig;
pub use discovery::{Discovery, DiscoveryOptions, DiscoveryRoots};
pub use engine::{
    ExecutionHooks, ExecutionOutcome, ExecutionResult, Executor, ExecutorConfig, ModePolicy,
    Operation, Plan, PolicyTable, RiskAssessment, Strategy,
};
pub use error::{IdResetError, Result};
pub use identifiers::IdentifierSet;
pub use patterns::PatternConfig;
pub use pipeline::Pipeline;
pub use registry::{MemoryRegistry, NoRegistry, RegistryAccess};
pub use report::{RunReport, RunStatus, RunSummary};
pub use types::{
    ActionType, ArtifactKind, ExecutionStatus, FailurePolicy, Mode, PriorityTier, RiskLevel,
    ScanMode,
};
pub use verify::{IssueCode, VerificationReport, Verifier};
