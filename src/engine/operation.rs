//! Planned operations
//!
//! An [`Operation`] is pure data: what to change, how to back it up and how to
//! undo it. The Strategy Engine builds them; the Execution Engine interprets
//! them. Operations never carry identifier values, only identifier names, so
//! every write resolves through the run's single [`IdentifierSet`].

use crate::artifact::ArtifactLocation;
use crate::error::{IdResetError, Result};
use crate::identifiers::IdentifierSet;
use crate::types::{ActionType, ArtifactKind, PriorityTier};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

// ============================================================================
// Mutations
// ============================================================================

/// One field to write: the store-side key and the identifier whose value goes there
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldWrite {
    pub key: String,
    pub identifier: String,
}

/// The concrete change an operation applies to its target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mutation {
    /// Delete rows matching `delete_patterns`, then upsert `writes`, in one transaction
    Database {
        path: PathBuf,
        delete_patterns: Vec<String>,
        writes: Vec<FieldWrite>,
    },
    /// Read-modify-write of flat keys in a JSON object
    JsonFields { path: PathBuf, writes: Vec<FieldWrite> },
    /// Replace the whole content of a text config
    TextValue { path: PathBuf, identifier: String },
    /// Create a JSON config that does not exist yet
    CreateJson { path: PathBuf, writes: Vec<FieldWrite> },
    RegistryValue {
        key: String,
        value: String,
        identifier: String,
    },
    RegistryDelete { key: String, value: String },
    DeleteFile { path: PathBuf, is_dir: bool },
    None,
}

impl Mutation {
    /// Filesystem path this mutation touches, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Database { path, .. }
            | Self::JsonFields { path, .. }
            | Self::TextValue { path, .. }
            | Self::CreateJson { path, .. }
            | Self::DeleteFile { path, .. } => Some(path),
            Self::RegistryValue { .. } | Self::RegistryDelete { .. } | Self::None => None,
        }
    }

    /// Identifier names written by this mutation
    pub fn identifier_names(&self) -> Vec<&str> {
        match self {
            Self::Database { writes, .. }
            | Self::JsonFields { writes, .. }
            | Self::CreateJson { writes, .. } => {
                writes.iter().map(|w| w.identifier.as_str()).collect()
            }
            Self::TextValue { identifier, .. } | Self::RegistryValue { identifier, .. } => {
                vec![identifier.as_str()]
            }
            Self::RegistryDelete { .. } | Self::DeleteFile { .. } | Self::None => Vec::new(),
        }
    }

    /// Resolve `(key, value)` pairs against the run's identifier set
    pub fn resolve_writes(&self, ids: &IdentifierSet) -> Result<Vec<(String, String)>> {
        let resolve = |key: &str, identifier: &str| -> Result<(String, String)> {
            let value = ids.get(identifier).ok_or_else(|| {
                IdResetError::configuration(format!(
                    "identifier '{}' has no generated value",
                    identifier
                ))
            })?;
            Ok((key.to_string(), value.to_string()))
        };
        match self {
            Self::Database { writes, .. }
            | Self::JsonFields { writes, .. }
            | Self::CreateJson { writes, .. } => writes
                .iter()
                .map(|w| resolve(&w.key, &w.identifier))
                .collect(),
            Self::TextValue { identifier, .. } | Self::RegistryValue { identifier, .. } => {
                Ok(vec![resolve(identifier, identifier)?])
            }
            Self::RegistryDelete { .. } | Self::DeleteFile { .. } | Self::None => Ok(Vec::new()),
        }
    }
}

// ============================================================================
// Backup / rollback descriptors
// ============================================================================

/// One file copied before mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCopy {
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// What is saved before mutating
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackupPlan {
    /// Nothing is saved
    None,
    /// Target (and SQLite sidecars) copied to timestamped paths
    Copy { files: Vec<BackupCopy> },
    /// Registry value saved as JSON
    Registry { destination: PathBuf },
    /// Nothing pre-exists to save (created files)
    NotApplicable,
}

impl BackupPlan {
    /// Whether a backup requirement is satisfied by this plan
    pub fn satisfies_requirement(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Destinations written by this plan
    pub fn destinations(&self) -> Vec<PathBuf> {
        match self {
            Self::Copy { files } => files.iter().map(|f| f.destination.clone()).collect(),
            Self::Registry { destination } => vec![destination.clone()],
            Self::None | Self::NotApplicable => Vec::new(),
        }
    }
}

/// How a failed mutation is undone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RollbackPlan {
    /// Copy every backup back over its source
    RestoreFromBackup,
    /// Delete the file the operation created
    RemoveCreated { path: PathBuf },
    /// Write the saved registry data back (or delete the value if it did not exist)
    RestoreRegistryValue,
    /// No backup was taken; a failed mutation leaves whatever state it reached
    Irreversible,
    /// Nothing to undo
    Nothing,
}

/// Whether the executor runs an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Disposition {
    Execute,
    /// No applicable action under the active mode; recorded, never executed
    NoOp { reason: String },
    /// Downgraded during dry validation; recorded, never executed
    Skipped { reason: String },
}

// ============================================================================
// Operation
// ============================================================================

/// A planned mutation against one artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// `op-0001`, `op-0002`, ... in execution order
    pub id: String,
    pub targets: Vec<ArtifactLocation>,
    pub kind: ArtifactKind,
    pub installation: String,
    pub action: ActionType,
    /// Tier of the target artifact; drives ordering
    pub priority: PriorityTier,
    /// Tier used for backup and failure policy; may be escalated by the mode
    pub risk_tier: PriorityTier,
    pub mutation: Mutation,
    pub backup: BackupPlan,
    pub rollback: RollbackPlan,
    pub disposition: Disposition,
    pub estimated_duration_ms: u64,
    /// Discovery index (missing configs sort after all discovered artifacts)
    pub order_index: usize,
}

impl Operation {
    pub fn is_executable(&self) -> bool {
        matches!(self.disposition, Disposition::Execute)
    }

    /// Ordering key: priority tier, then kind, then discovery order
    pub fn sort_key(&self) -> (u8, u8, usize) {
        (self.priority.order(), self.kind.order(), self.order_index)
    }

    /// Stable identity of the target for batch conflict checks
    pub fn target_key(&self) -> String {
        self.targets
            .first()
            .map(ArtifactLocation::dedup_key)
            .unwrap_or_default()
    }

    /// Display name of the primary target
    pub fn target(&self) -> String {
        self.targets
            .first()
            .map(ToString::to_string)
            .unwrap_or_default()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}({}) [{}]",
            self.id,
            self.action,
            self.target(),
            self.risk_tier
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> IdentifierSet {
        IdentifierSet::from_values([("machineId", "m"), ("devDeviceId", "d")])
    }

    #[test]
    fn test_resolve_writes_uses_shared_values() {
        let mutation = Mutation::Database {
            path: PathBuf::from("/x/state.vscdb"),
            delete_patterns: vec!["telemetry.%".into()],
            writes: vec![
                FieldWrite {
                    key: "telemetry.machineId".into(),
                    identifier: "machineId".into(),
                },
                FieldWrite {
                    key: "telemetry.devDeviceId".into(),
                    identifier: "devDeviceId".into(),
                },
            ],
        };
        let writes = mutation.resolve_writes(&ids()).unwrap();
        assert_eq!(
            writes,
            vec![
                ("telemetry.machineId".to_string(), "m".to_string()),
                ("telemetry.devDeviceId".to_string(), "d".to_string()),
            ]
        );
        assert_eq!(mutation.identifier_names(), vec!["machineId", "devDeviceId"]);
    }

    #[test]
    fn test_unknown_identifier_fails_to_resolve() {
        let mutation = Mutation::TextValue {
            path: PathBuf::from("/x/machineid"),
            identifier: "sqmId".into(),
        };
        assert!(mutation.resolve_writes(&ids()).is_err());
    }

    #[test]
    fn test_backup_plan_requirement() {
        assert!(!BackupPlan::None.satisfies_requirement());
        assert!(BackupPlan::NotApplicable.satisfies_requirement());
        let plan = BackupPlan::Copy {
            files: vec![BackupCopy {
                source: "/a".into(),
                destination: "/a.backup_1".into(),
            }],
        };
        assert_eq!(plan.destinations(), vec![PathBuf::from("/a.backup_1")]);
    }
}
