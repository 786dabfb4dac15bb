//! Strategy Engine
//!
//! Turns an [`Inventory`] and a mode into an ordered [`Plan`]:
//!
//! | Artifact kind | Action |
//! |---------------|--------|
//! | Database      | `RegenerateIdentifier` (identifier keys present) or `DeleteMatchingRows` |
//! | ConfigFile    | `RewriteField` |
//! | missing config| `CreateDefaultConfig` |
//! | CacheFile / TempFile | `DeleteFile` |
//! | RegistryEntry | `RewriteField` (identifier value) or `DeleteFile` (anything else) |
//! | ExtensionDir  | `NoOp` (inventory only) |
//!
//! Planning is pure apart from the dry backup validation, which only inspects
//! the filesystem. Exactly one operation is produced per artifact.

use crate::artifact::{Artifact, ArtifactLocation, ConfigProbe, DbProbe, ExpectedArtifact, Inventory, StoreProbe};
use crate::backup::BackupStore;
use crate::engine::operation::{
    BackupCopy, BackupPlan, Disposition, FieldWrite, Mutation, Operation, RollbackPlan,
};
use crate::engine::policy::{ModePolicy, PolicyTable};
use crate::engine::risk::{Finding, RiskAssessment, assess, level_for_tier};
use crate::error::Result;
use crate::identifiers::IdentifierSet;
use crate::patterns::PatternConfig;
use crate::types::{ActionType, ArtifactKind, ConfigFormat, Mode, PriorityTier, RiskLevel};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// Duration estimates (milliseconds)
// ============================================================================

const DB_BASE_MS: u64 = 200;
const DB_PER_MB_MS: u64 = 50;
const CONFIG_MS: u64 = 20;
const DELETE_MS: u64 = 5;
const REGISTRY_MS: u64 = 100;

/// SQLite files that travel with a database
const SIDECAR_SUFFIXES: &[&str] = &["-wal", "-journal"];

// ============================================================================
// Plan
// ============================================================================

/// Output of the Strategy Engine; immutable input to execution
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub mode: Mode,
    pub policy: ModePolicy,
    pub operations: Vec<Operation>,
    pub identifiers: IdentifierSet,
    pub risk: RiskAssessment,
    pub estimated_duration_ms: u64,
}

impl Plan {
    pub fn executable(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter().filter(|op| op.is_executable())
    }

    /// Backup plan of every executable operation
    pub fn backup_plan(&self) -> Vec<(&str, &BackupPlan)> {
        self.executable()
            .map(|op| (op.id.as_str(), &op.backup))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    pub fn summary(&self) -> String {
        let executable = self.executable().count();
        let skipped = self
            .operations
            .iter()
            .filter(|op| matches!(op.disposition, Disposition::Skipped { .. }))
            .count();
        format!(
            "{} operation(s): {} executable, {} skipped, {} no-op; risk {} (~{} ms)",
            self.operations.len(),
            executable,
            skipped,
            self.operations.len() - executable - skipped,
            self.risk.overall,
            self.estimated_duration_ms
        )
    }
}

/// What one artifact turns into before mode and backup rules apply
struct Draft {
    targets: Vec<ArtifactLocation>,
    kind: ArtifactKind,
    priority: PriorityTier,
    installation: String,
    order_index: usize,
    size: u64,
    is_dir: bool,
    action: ActionType,
    mutation: Mutation,
    /// Why there is nothing to do
    note: Option<String>,
    /// Pre-existing problem worth reporting
    problem: Option<String>,
}

impl Draft {
    fn from_artifact(artifact: &Artifact) -> Self {
        Self {
            targets: vec![artifact.location.clone()],
            kind: artifact.kind,
            priority: artifact.priority,
            installation: artifact.installation.clone(),
            order_index: artifact.index,
            size: artifact.size,
            is_dir: artifact.is_dir,
            action: ActionType::NoOp,
            mutation: Mutation::None,
            note: None,
            problem: None,
        }
    }

    fn act(mut self, action: ActionType, mutation: Mutation) -> Self {
        self.action = action;
        self.mutation = mutation;
        self
    }

    fn nothing(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    fn problem(mut self, problem: impl Into<String>) -> Self {
        let problem = problem.into();
        self.note = Some(problem.clone());
        self.problem = Some(problem);
        self
    }
}

// ============================================================================
// Strategy Engine
// ============================================================================

pub struct Strategy<'a> {
    patterns: &'a PatternConfig,
    policies: &'a PolicyTable,
    backups: &'a BackupStore,
}

impl<'a> Strategy<'a> {
    pub fn new(patterns: &'a PatternConfig, policies: &'a PolicyTable, backups: &'a BackupStore) -> Self {
        Self {
            patterns,
            policies,
            backups,
        }
    }

    /// Build the ordered plan for `inventory` under `mode`
    pub fn plan(
        &self,
        inventory: &Inventory,
        mode: Mode,
        tolerance: RiskLevel,
        custom: Option<&ModePolicy>,
    ) -> Result<Plan> {
        let policy = self.policies.resolve(mode, tolerance, custom)?;
        let identifiers = IdentifierSet::generate(&self.patterns.identifiers);

        let mut drafts: Vec<Draft> = inventory
            .artifacts
            .iter()
            .map(|a| self.draft(a))
            .collect();
        let offset = inventory.artifacts.len();
        drafts.extend(
            inventory
                .missing
                .iter()
                .enumerate()
                .map(|(i, expected)| self.draft_missing(expected, offset + i)),
        );

        let mut planned: Vec<(Operation, Vec<Finding>)> = drafts
            .into_iter()
            .map(|d| self.finalize(d, mode, &policy))
            .collect();
        planned.sort_by_key(|(op, _)| op.sort_key());

        let mut operations = Vec::with_capacity(planned.len());
        let mut findings = Vec::new();
        for (i, (mut op, op_findings)) in planned.into_iter().enumerate() {
            op.id = format!("op-{:04}", i + 1);
            findings.extend(op_findings.into_iter().map(|mut f| {
                f.operation_id = Some(op.id.clone());
                f
            }));
            operations.push(op);
        }

        let risk = assess(findings, &self.policies.thresholds, tolerance);
        let estimated_duration_ms = operations
            .iter()
            .filter(|op| op.is_executable())
            .map(|op| op.estimated_duration_ms)
            .sum();

        let plan = Plan {
            mode,
            policy,
            operations,
            identifiers,
            risk,
            estimated_duration_ms,
        };
        info!("plan ({}): {}", mode, plan.summary());
        Ok(plan)
    }

    fn draft(&self, artifact: &Artifact) -> Draft {
        let draft = Draft::from_artifact(artifact);
        match (&artifact.kind, &artifact.probe) {
            (ArtifactKind::Database, StoreProbe::Database(probe)) => {
                self.draft_database(draft, artifact, probe)
            }
            (ArtifactKind::Database, StoreProbe::Unreadable { reason }) => {
                draft.problem(format!("database unreadable: {}", reason))
            }
            (ArtifactKind::ConfigFile, StoreProbe::Config(probe)) => {
                self.draft_config(draft, artifact, probe)
            }
            (ArtifactKind::CacheFile | ArtifactKind::TempFile, _) => match artifact.location.path() {
                Some(path) => {
                    let mutation = Mutation::DeleteFile {
                        path: path.to_path_buf(),
                        is_dir: artifact.is_dir,
                    };
                    draft.act(ActionType::DeleteFile, mutation)
                }
                None => draft.nothing("no filesystem path"),
            },
            (ArtifactKind::RegistryEntry, StoreProbe::Registry { identifier }) => {
                let ArtifactLocation::Registry { key, value } = &artifact.location else {
                    return draft.nothing("registry entry without a registry location");
                };
                match identifier {
                    Some(identifier) => draft.act(
                        ActionType::RewriteField,
                        Mutation::RegistryValue {
                            key: key.clone(),
                            value: value.clone(),
                            identifier: identifier.clone(),
                        },
                    ),
                    None => draft.act(
                        ActionType::DeleteFile,
                        Mutation::RegistryDelete {
                            key: key.clone(),
                            value: value.clone(),
                        },
                    ),
                }
            }
            (ArtifactKind::ExtensionDir, _) => draft.nothing("extension directories are inventoried only"),
            (kind, probe) => draft.nothing(format!("no action for {} with {:?}", kind, probe)),
        }
    }

    fn draft_database(&self, draft: Draft, artifact: &Artifact, probe: &DbProbe) -> Draft {
        let Some(path) = artifact.location.path() else {
            return draft.nothing("no filesystem path");
        };
        if !probe.integrity_ok {
            return draft.problem(format!(
                "pre-existing corruption: {}",
                probe.integrity_detail.as_deref().unwrap_or("integrity check failed")
            ));
        }
        if !probe.table_present {
            return draft.nothing(format!("no {} table", self.patterns.database.table));
        }

        let delete_patterns: Vec<String> = probe
            .pattern_matches
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(pattern, _)| pattern.clone())
            .collect();
        let writes: Vec<FieldWrite> = self
            .patterns
            .identifiers
            .iter()
            .filter(|d| probe.identifier_keys.contains(&d.key))
            .map(|d| FieldWrite {
                key: d.key.clone(),
                identifier: d.name.clone(),
            })
            .collect();

        let action = if !writes.is_empty() {
            ActionType::RegenerateIdentifier
        } else if !delete_patterns.is_empty() {
            ActionType::DeleteMatchingRows
        } else {
            return draft.nothing("no identifier rows");
        };
        draft.act(
            action,
            Mutation::Database {
                path: path.to_path_buf(),
                delete_patterns,
                writes,
            },
        )
    }

    fn draft_config(&self, draft: Draft, artifact: &Artifact, probe: &ConfigProbe) -> Draft {
        let Some(path) = artifact.location.path() else {
            return draft.nothing("no filesystem path");
        };
        if !probe.valid {
            return draft.problem(format!(
                "pre-existing corruption: {}",
                probe.error.as_deref().unwrap_or("unparseable config")
            ));
        }

        match probe.format {
            ConfigFormat::Json => {
                let critical = artifact.priority == PriorityTier::Critical;
                let writes: Vec<FieldWrite> = self
                    .patterns
                    .identifiers
                    .iter()
                    .filter(|d| probe.identifier_keys.contains(&d.key) || (critical && d.required))
                    .map(|d| FieldWrite {
                        key: d.key.clone(),
                        identifier: d.name.clone(),
                    })
                    .collect();
                if writes.is_empty() {
                    return draft.nothing("no identifier fields");
                }
                draft.act(
                    ActionType::RewriteField,
                    Mutation::JsonFields {
                        path: path.to_path_buf(),
                        writes,
                    },
                )
            }
            ConfigFormat::Text => match self.text_identifier(path, probe) {
                Some(identifier) => draft.act(
                    ActionType::RewriteField,
                    Mutation::TextValue {
                        path: path.to_path_buf(),
                        identifier,
                    },
                ),
                None => draft.nothing("text config holds no known identifier"),
            },
        }
    }

    fn text_identifier(&self, path: &Path, probe: &ConfigProbe) -> Option<String> {
        probe.identifier_keys.first().cloned().or_else(|| {
            let name = path.file_name()?.to_str()?;
            self.patterns.config_spec(name)?.identifier.clone()
        })
    }

    fn draft_missing(&self, expected: &ExpectedArtifact, order_index: usize) -> Draft {
        let draft = Draft {
            targets: vec![ArtifactLocation::file(&expected.path)],
            kind: ArtifactKind::ConfigFile,
            priority: expected.priority,
            installation: expected.installation.clone(),
            order_index,
            size: 0,
            is_dir: false,
            action: ActionType::NoOp,
            mutation: Mutation::None,
            note: None,
            problem: None,
        };
        match expected.format {
            ConfigFormat::Json => {
                let writes = self
                    .patterns
                    .required_identifiers()
                    .map(|d| FieldWrite {
                        key: d.key.clone(),
                        identifier: d.name.clone(),
                    })
                    .collect();
                draft.act(
                    ActionType::CreateDefaultConfig,
                    Mutation::CreateJson {
                        path: expected.path.clone(),
                        writes,
                    },
                )
            }
            ConfigFormat::Text => {
                let identifier = expected
                    .path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| self.patterns.config_spec(n))
                    .and_then(|s| s.identifier.clone());
                match identifier {
                    Some(identifier) => draft.act(
                        ActionType::CreateDefaultConfig,
                        Mutation::TextValue {
                            path: expected.path.clone(),
                            identifier,
                        },
                    ),
                    None => draft.nothing("missing text config names no identifier"),
                }
            }
        }
    }

    /// Apply mode eligibility, backup rules and dry validation
    fn finalize(&self, draft: Draft, mode: Mode, policy: &ModePolicy) -> (Operation, Vec<Finding>) {
        let target = draft
            .targets
            .first()
            .map(ToString::to_string)
            .unwrap_or_default();
        let mut findings = Vec::new();
        if let Some(problem) = &draft.problem {
            findings.push(Finding::new(&target, RiskLevel::High, problem.clone()));
        }

        let risk_tier = policy.risk_tier(draft.priority);
        let mut op = Operation {
            id: String::new(),
            targets: draft.targets,
            kind: draft.kind,
            installation: draft.installation,
            action: draft.action,
            priority: draft.priority,
            risk_tier,
            mutation: draft.mutation,
            backup: BackupPlan::None,
            rollback: RollbackPlan::Nothing,
            disposition: Disposition::Execute,
            estimated_duration_ms: 0,
            order_index: draft.order_index,
        };

        if let Some(note) = draft.note {
            op.action = ActionType::NoOp;
            op.mutation = Mutation::None;
            op.disposition = Disposition::NoOp { reason: note };
            return (op, findings);
        }
        if !policy.is_eligible(draft.priority) {
            op.action = ActionType::NoOp;
            op.mutation = Mutation::None;
            op.disposition = Disposition::NoOp {
                reason: format!("{} tier is not eligible in {} mode", draft.priority, mode),
            };
            return (op, findings);
        }

        let needs_backup = risk_tier.requires_backup() || policy.backup_all;
        let (backup, rollback) = self.backup_for(&op, needs_backup);
        op.backup = backup;
        op.rollback = rollback;

        if let Err(reason) = self.validate_backup(&op.backup) {
            warn!("downgrading {} to skipped: {}", target, reason);
            findings.push(Finding::new(
                &target,
                RiskLevel::Medium,
                format!("downgraded: {}", reason),
            ));
            op.disposition = Disposition::Skipped { reason };
            return (op, findings);
        }

        op.estimated_duration_ms = estimate(&op.mutation, draft.size, draft.is_dir);
        findings.push(Finding::new(
            &target,
            level_for_tier(risk_tier),
            format!("{} on {} artifact", op.action, risk_tier),
        ));
        debug!("planned {} on {}", op.action, target);
        (op, findings)
    }

    fn backup_for(&self, op: &Operation, needed: bool) -> (BackupPlan, RollbackPlan) {
        if op.action == ActionType::CreateDefaultConfig {
            if let Some(path) = op.mutation.path() {
                return (
                    BackupPlan::NotApplicable,
                    RollbackPlan::RemoveCreated {
                        path: path.to_path_buf(),
                    },
                );
            }
        }
        if !needed {
            return (BackupPlan::None, RollbackPlan::Irreversible);
        }
        match &op.mutation {
            Mutation::RegistryValue { value, .. } | Mutation::RegistryDelete { value, .. } => (
                BackupPlan::Registry {
                    destination: self.backups.registry_destination(value),
                },
                RollbackPlan::RestoreRegistryValue,
            ),
            mutation => match mutation.path() {
                Some(path) => {
                    let mut files = vec![BackupCopy {
                        source: path.to_path_buf(),
                        destination: self.backups.file_destination(path),
                    }];
                    if matches!(mutation, Mutation::Database { .. }) {
                        files.extend(sidecars(path).into_iter().map(|source| BackupCopy {
                            destination: self.backups.file_destination(&source),
                            source,
                        }));
                    }
                    (BackupPlan::Copy { files }, RollbackPlan::RestoreFromBackup)
                }
                None => (BackupPlan::None, RollbackPlan::Irreversible),
            },
        }
    }

    /// Every destination must be writable, or the operation is downgraded
    fn validate_backup(&self, plan: &BackupPlan) -> std::result::Result<(), String> {
        for dest in plan.destinations() {
            self.backups
                .check_destination(&dest)
                .map_err(|e| format!("no writable backup destination: {}", e))?;
        }
        Ok(())
    }
}

fn sidecars(db: &Path) -> Vec<PathBuf> {
    SIDECAR_SUFFIXES
        .iter()
        .map(|suffix| {
            let mut name = db.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        })
        .filter(|p| p.exists())
        .collect()
}

fn estimate(mutation: &Mutation, size: u64, is_dir: bool) -> u64 {
    match mutation {
        Mutation::Database { .. } => DB_BASE_MS + DB_PER_MB_MS * size.div_ceil(1024 * 1024),
        Mutation::JsonFields { .. } | Mutation::TextValue { .. } | Mutation::CreateJson { .. } => {
            CONFIG_MS
        }
        Mutation::RegistryValue { .. } | Mutation::RegistryDelete { .. } => REGISTRY_MS,
        Mutation::DeleteFile { .. } if is_dir => DELETE_MS * 10,
        Mutation::DeleteFile { .. } => DELETE_MS,
        Mutation::None => 0,
    }
}
