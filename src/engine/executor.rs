//! Execution Engine
//!
//! Runs a [`Plan`] one operation at a time (or in small parallel batches),
//! driving each through its [`OpLifecycle`]:
//!
//! 1. back up (verified copy, or registry snapshot)
//! 2. mutate, retrying transient failures
//! 3. verify by reading the store back
//! 4. on failure after mutation, roll back from the backup
//!
//! A Critical operation that fails under `abort-on-critical-failure` skips
//! everything after it. Cancellation is honoured between operations only.

use crate::artifact::ArtifactLocation;
use crate::backup::{BackupStore, RegistrySnapshot};
use crate::cancel::CancelToken;
use crate::engine::lifecycle::{OpLifecycle, OpStage, StageRecord};
use crate::engine::operation::{BackupPlan, Disposition, Mutation, Operation, RollbackPlan};
use crate::engine::strategy::Plan;
use crate::error::{IdResetError, Result};
use crate::identifiers::IdentifierSet;
use crate::patterns::PatternConfig;
use crate::registry::RegistryAccess;
use crate::stores::config::{read_text_value, write_text_value};
use crate::stores::{SqliteStore, create_json_config, read_json_object, rewrite_json_fields};
use crate::types::{ActionType, ExecutionStatus, FailurePolicy, PriorityTier};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ============================================================================
// Configuration and hooks
// ============================================================================

/// Pause between mutation attempts unless configured otherwise
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Attempts per mutation, including the first
    pub max_retry_attempts: u32,
    /// Fixed pause between attempts
    pub retry_delay: Duration,
    pub query_timeout: Duration,
    pub dry_run: bool,
    pub failure_policy: FailurePolicy,
    pub max_parallel: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            query_timeout: Duration::from_secs(30),
            dry_run: false,
            failure_policy: FailurePolicy::AbortOnCriticalFailure,
            max_parallel: 1,
        }
    }
}

/// Injection points around each operation.
///
/// Production runs use [`NoHooks`]; tests use these to simulate I/O faults.
pub trait ExecutionHooks: Send + Sync {
    fn before_backup(&self, _op: &Operation) -> io::Result<()> {
        Ok(())
    }

    fn before_mutate(&self, _op: &Operation, _attempt: u32) -> io::Result<()> {
        Ok(())
    }

    /// Runs after a successful mutation, before verification
    fn after_mutate(&self, _op: &Operation) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl ExecutionHooks for NoHooks {}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldPreview {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowPreview {
    pub pattern: String,
    /// `None` when the rows could not be counted
    pub rows: Option<u64>,
}

/// What a dry run would have done
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Preview {
    pub writes: Vec<FieldPreview>,
    pub deletes: Vec<RowPreview>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removes: Option<String>,
}

/// Outcome of one operation
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub operation_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub backup_locations: Vec<PathBuf>,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<Preview>,
    pub stages: Vec<StageRecord>,
}

impl ExecutionResult {
    fn new(operation_id: &str) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            status: ExecutionStatus::Skipped,
            error: None,
            backup_locations: Vec::new(),
            timestamp: Utc::now(),
            attempts: 0,
            rollback_error: None,
            preview: None,
            stages: Vec::new(),
        }
    }

    /// Record the final stage and map it to a status
    fn finish(mut self, lifecycle: OpLifecycle) -> Self {
        self.status = match lifecycle.current() {
            OpStage::Succeeded => ExecutionStatus::Success,
            OpStage::RolledBack => ExecutionStatus::RolledBack,
            OpStage::Failed => ExecutionStatus::Failed,
            _ => ExecutionStatus::Skipped,
        };
        self.timestamp = Utc::now();
        self.stages = lifecycle.into_history();
        self
    }
}

/// Results of a whole plan, in plan order
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionOutcome {
    pub results: Vec<ExecutionResult>,
    /// Reason the run was aborted after a Critical failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub cancelled: bool,
}

impl ExecutionOutcome {
    pub fn get(&self, operation_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.operation_id == operation_id)
    }

    pub fn count(&self, status: ExecutionStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

// ============================================================================
// Executor
// ============================================================================

pub struct Executor<'a> {
    patterns: &'a PatternConfig,
    backups: &'a BackupStore,
    registry: &'a dyn RegistryAccess,
    hooks: &'a dyn ExecutionHooks,
    cancel: CancelToken,
    config: ExecutorConfig,
}

impl<'a> Executor<'a> {
    pub fn new(
        patterns: &'a PatternConfig,
        backups: &'a BackupStore,
        registry: &'a dyn RegistryAccess,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            patterns,
            backups,
            registry,
            hooks: &NoHooks,
            cancel: CancelToken::new(),
            config,
        }
    }

    pub fn with_hooks(mut self, hooks: &'a dyn ExecutionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Execute every operation of `plan` in order
    pub fn execute(&self, plan: &Plan) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::default();
        let pool = if self.config.max_parallel > 1 && !self.config.dry_run {
            rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.max_parallel)
                .build()
                .map_err(|e| warn!("falling back to sequential execution: {}", e))
                .ok()
        } else {
            None
        };

        for range in batches(&plan.operations, self.config.max_parallel) {
            let ops = &plan.operations[range];

            if let Some(reason) = &outcome.aborted {
                let reason = format!("aborted: {}", reason);
                outcome.results.extend(ops.iter().map(|op| self.skip(op, &reason)));
                continue;
            }
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                outcome.results.extend(ops.iter().map(|op| self.skip(op, "cancelled")));
                continue;
            }

            let results: Vec<ExecutionResult> = match &pool {
                Some(pool) if ops.len() > 1 => {
                    debug!("running {} operation(s) in parallel", ops.len());
                    pool.install(|| {
                        ops.par_iter()
                            .map(|op| self.run_one(op, &plan.identifiers))
                            .collect()
                    })
                }
                _ => ops.iter().map(|op| self.run_one(op, &plan.identifiers)).collect(),
            };

            for (op, result) in ops.iter().zip(&results) {
                let failed = matches!(
                    result.status,
                    ExecutionStatus::Failed | ExecutionStatus::RolledBack
                );
                if failed
                    && op.risk_tier == PriorityTier::Critical
                    && self.config.failure_policy == FailurePolicy::AbortOnCriticalFailure
                    && outcome.aborted.is_none()
                {
                    let reason = format!(
                        "critical operation {} failed: {}",
                        op.id,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                    error!("{}", reason);
                    outcome.aborted = Some(reason);
                }
            }
            outcome.results.extend(results);
        }

        if self.cancel.is_cancelled() {
            outcome.cancelled = true;
        }
        info!(
            "execution finished: {} succeeded, {} failed, {} rolled back, {} skipped",
            outcome.count(ExecutionStatus::Success),
            outcome.count(ExecutionStatus::Failed),
            outcome.count(ExecutionStatus::RolledBack),
            outcome.count(ExecutionStatus::Skipped)
        );
        outcome
    }

    fn skip(&self, op: &Operation, reason: &str) -> ExecutionResult {
        let mut lifecycle = OpLifecycle::new(&op.id);
        if let Err(e) = lifecycle.transition_to(OpStage::Skipped) {
            warn!("{}: {}", op.id, e);
        }
        let mut result = ExecutionResult::new(&op.id);
        result.error = Some(reason.to_string());
        result.finish(lifecycle)
    }

    /// Drive one operation to a terminal stage
    fn run_one(&self, op: &Operation, ids: &IdentifierSet) -> ExecutionResult {
        match &op.disposition {
            Disposition::NoOp { reason } | Disposition::Skipped { reason } => {
                return self.skip(op, reason);
            }
            Disposition::Execute => {}
        }
        if self.cancel.is_cancelled() {
            return self.skip(op, "cancelled");
        }

        let mut lifecycle = OpLifecycle::new(&op.id);
        let mut result = ExecutionResult::new(&op.id);
        match self.drive(op, ids, &mut lifecycle, &mut result) {
            Ok(()) => info!("{} succeeded", op),
            Err(e) => warn!("{} ended {}: {}", op, lifecycle.current(), e),
        }
        result.finish(lifecycle)
    }

    fn drive(
        &self,
        op: &Operation,
        ids: &IdentifierSet,
        lifecycle: &mut OpLifecycle,
        result: &mut ExecutionResult,
    ) -> Result<()> {
        let writes = match op.mutation.resolve_writes(ids) {
            Ok(writes) => writes,
            Err(e) => {
                lifecycle.transition_to(OpStage::Skipped)?;
                result.error = Some(e.to_string());
                return Err(e);
            }
        };

        if self.config.dry_run {
            lifecycle.transition_to(OpStage::Mutating)?;
            result.preview = Some(self.preview(op, &writes));
            lifecycle.transition_to(OpStage::Skipped)?;
            return Ok(());
        }

        if !op.backup.destinations().is_empty() {
            lifecycle.transition_to(OpStage::BackingUp)?;
            if let Err(e) = self.back_up(op, result) {
                lifecycle.transition_to(OpStage::Failed)?;
                result.error = Some(e.to_string());
                return Err(e);
            }
        }

        lifecycle.transition_to(OpStage::Mutating)?;
        if op.action == ActionType::CreateDefaultConfig {
            if let Some(path) = op.mutation.path().filter(|p| p.exists()) {
                let e = IdResetError::mutation(
                    op.target(),
                    format!("{} appeared after discovery", path.display()),
                );
                lifecycle.transition_to(OpStage::Failed)?;
                result.error = Some(e.to_string());
                return Err(e);
            }
        }

        if let Err(e) = self.mutate_with_retry(op, &writes, result) {
            return self.fail(op, lifecycle, result, e);
        }
        self.hooks.after_mutate(op);

        lifecycle.transition_to(OpStage::Verifying)?;
        if let Err(e) = self.verify(op, &writes) {
            return self.fail(op, lifecycle, result, e);
        }
        lifecycle.transition_to(OpStage::Succeeded)?;
        Ok(())
    }

    /// Mark Failed after a mutation started, then roll back
    fn fail(
        &self,
        op: &Operation,
        lifecycle: &mut OpLifecycle,
        result: &mut ExecutionResult,
        err: IdResetError,
    ) -> Result<()> {
        lifecycle.transition_to(OpStage::Failed)?;
        result.error = Some(err.to_string());
        match self.roll_back(op) {
            Ok(true) => {
                lifecycle.transition_to(OpStage::RolledBack)?;
                info!("{}: rolled back", op.id);
            }
            Ok(false) => warn!("{}: no rollback available ({:?})", op.id, op.rollback),
            Err(e) => {
                error!("{}: rollback failed: {}", op.id, e);
                result.rollback_error = Some(e.to_string());
            }
        }
        Err(err)
    }

    // ------------------------------------------------------------------------
    // Backup
    // ------------------------------------------------------------------------

    fn back_up(&self, op: &Operation, result: &mut ExecutionResult) -> Result<()> {
        self.hooks
            .before_backup(op)
            .map_err(|e| IdResetError::backup(PathBuf::from(op.target()), e))?;

        match &op.backup {
            BackupPlan::Copy { files } => {
                for copy in files {
                    self.backups.copy_verified(&copy.source, &copy.destination)?;
                    result.backup_locations.push(copy.destination.clone());
                }
            }
            BackupPlan::Registry { destination } => {
                let (key, value) = registry_slot(op)?;
                let data = self
                    .registry
                    .read_value(key, value)
                    .map_err(|e| IdResetError::backup(destination, e))?;
                let snapshot = RegistrySnapshot {
                    key: key.to_string(),
                    value: value.to_string(),
                    data,
                };
                self.backups
                    .save_registry(destination, &snapshot)
                    .map_err(|e| IdResetError::backup(destination, e))?;
                result.backup_locations.push(destination.clone());
            }
            BackupPlan::None | BackupPlan::NotApplicable => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    fn mutate_with_retry(
        &self,
        op: &Operation,
        writes: &[(String, String)],
        result: &mut ExecutionResult,
    ) -> Result<()> {
        let attempts = self.config.max_retry_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            result.attempts = attempt;
            let outcome = self
                .hooks
                .before_mutate(op, attempt)
                .map_err(IdResetError::from)
                .and_then(|()| self.apply(op, writes));
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("{}: attempt {}/{} failed: {}", op.id, attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        thread::sleep(self.config.retry_delay);
                    }
                }
            }
        }
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(IdResetError::mutation(op.target(), reason))
    }

    fn apply(&self, op: &Operation, writes: &[(String, String)]) -> Result<()> {
        match &op.mutation {
            Mutation::Database {
                path,
                delete_patterns,
                ..
            } => {
                let store =
                    SqliteStore::open_read_write(path, &self.patterns.database, self.config.query_timeout)?;
                store.delete_and_upsert(delete_patterns, writes)?;
            }
            Mutation::JsonFields { path, .. } => rewrite_json_fields(path, writes)?,
            Mutation::CreateJson { path, .. } => create_json_config(path, writes)?,
            Mutation::TextValue { path, .. } => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                write_text_value(path, single_value(writes)?)?;
            }
            Mutation::RegistryValue { key, value, .. } => {
                self.registry.write_value(key, value, single_value(writes)?)?;
            }
            Mutation::RegistryDelete { key, value } => self.registry.delete_value(key, value)?,
            Mutation::DeleteFile { path, is_dir } => remove_path(path, *is_dir)?,
            Mutation::None => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------------

    /// Read the target back and compare against what was written
    fn verify(&self, op: &Operation, writes: &[(String, String)]) -> Result<()> {
        let target = op.target();
        match &op.mutation {
            Mutation::Database {
                path,
                delete_patterns,
                ..
            } => {
                let store =
                    SqliteStore::open_read_only(path, &self.patterns.database, self.config.query_timeout)?;
                let integrity = store.integrity_check()?;
                if !integrity.ok {
                    return Err(IdResetError::integrity(
                        target,
                        integrity.detail.unwrap_or_default(),
                    ));
                }
                for (key, expected) in writes {
                    let actual = store.read_value(key)?;
                    if actual.as_deref() != Some(expected.as_str()) {
                        return Err(IdResetError::mismatch(
                            target,
                            format!("{} reads back as {:?}", key, actual),
                        ));
                    }
                }
                let written: HashSet<&str> = writes.iter().map(|(k, _)| k.as_str()).collect();
                for pattern in delete_patterns {
                    let leftover: Vec<String> = store
                        .keys_like(pattern)?
                        .into_iter()
                        .filter(|k| !written.contains(k.as_str()))
                        .collect();
                    if !leftover.is_empty() {
                        return Err(IdResetError::mismatch(
                            target,
                            format!("{} row(s) still match {}", leftover.len(), pattern),
                        ));
                    }
                }
            }
            Mutation::JsonFields { path, .. } | Mutation::CreateJson { path, .. } => {
                let map = read_json_object(path)?;
                for (key, expected) in writes {
                    if map.get(key) != Some(&Value::String(expected.clone())) {
                        return Err(IdResetError::mismatch(
                            target,
                            format!("{} reads back as {:?}", key, map.get(key)),
                        ));
                    }
                }
            }
            Mutation::TextValue { path, .. } => {
                let actual = read_text_value(path)?;
                if actual != single_value(writes)? {
                    return Err(IdResetError::mismatch(target, "text value differs"));
                }
            }
            Mutation::RegistryValue { key, value, .. } => {
                let actual = self.registry.read_value(key, value)?;
                if actual.as_deref() != Some(single_value(writes)?) {
                    return Err(IdResetError::mismatch(
                        target,
                        format!("value reads back as {:?}", actual),
                    ));
                }
            }
            Mutation::RegistryDelete { key, value } => {
                if self.registry.read_value(key, value)?.is_some() {
                    return Err(IdResetError::mismatch(target, "value still present"));
                }
            }
            Mutation::DeleteFile { path, .. } => {
                if fs::symlink_metadata(path).is_ok() {
                    return Err(IdResetError::mismatch(target, "path still exists"));
                }
            }
            Mutation::None => {}
        }
        debug!("{}: verified", op.id);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------------

    /// `Ok(true)` when the target was restored
    fn roll_back(&self, op: &Operation) -> Result<bool> {
        match &op.rollback {
            RollbackPlan::RestoreFromBackup => {
                let BackupPlan::Copy { files } = &op.backup else {
                    return Ok(false);
                };
                for copy in files {
                    self.backups.restore(&copy.destination, &copy.source)?;
                }
                Ok(true)
            }
            RollbackPlan::RemoveCreated { path } => {
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(true)
            }
            RollbackPlan::RestoreRegistryValue => {
                let BackupPlan::Registry { destination } = &op.backup else {
                    return Ok(false);
                };
                let snapshot = self.backups.load_registry(destination)?;
                match &snapshot.data {
                    Some(data) => self.registry.write_value(&snapshot.key, &snapshot.value, data)?,
                    None => self.registry.delete_value(&snapshot.key, &snapshot.value)?,
                }
                Ok(true)
            }
            RollbackPlan::Irreversible | RollbackPlan::Nothing => Ok(false),
        }
    }

    // ------------------------------------------------------------------------
    // Dry run
    // ------------------------------------------------------------------------

    fn preview(&self, op: &Operation, writes: &[(String, String)]) -> Preview {
        let mut preview = Preview {
            writes: writes
                .iter()
                .map(|(key, value)| FieldPreview {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            ..Default::default()
        };
        match &op.mutation {
            Mutation::Database {
                path,
                delete_patterns,
                ..
            } => {
                match SqliteStore::open_read_only(path, &self.patterns.database, self.config.query_timeout) {
                    Ok(store) => {
                        for pattern in delete_patterns {
                            let rows = match store.count_like(pattern) {
                                Ok(rows) => Some(rows),
                                Err(e) => {
                                    warn!("{}: cannot count rows matching {}: {}", op.id, pattern, e);
                                    None
                                }
                            };
                            preview.deletes.push(RowPreview {
                                pattern: pattern.clone(),
                                rows,
                            });
                        }
                    }
                    Err(e) => warn!("{}: preview unavailable: {}", op.id, e),
                }
            }
            Mutation::DeleteFile { path, .. } => preview.removes = Some(path.display().to_string()),
            Mutation::RegistryDelete { key, value } => {
                preview.removes = Some(format!("{}\\{}", key, value));
            }
            _ => {}
        }
        info!("[dry run] {}: {} write(s), {} delete pattern(s)", op, preview.writes.len(), preview.deletes.len());
        preview
    }
}

fn registry_slot(op: &Operation) -> Result<(&str, &str)> {
    match op.targets.first() {
        Some(ArtifactLocation::Registry { key, value }) => Ok((key.as_str(), value.as_str())),
        _ => Err(IdResetError::registry(format!("{} has no registry target", op.id))),
    }
}

fn single_value(writes: &[(String, String)]) -> Result<&str> {
    writes
        .first()
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| IdResetError::configuration("mutation has no value to write"))
}

fn remove_path(path: &Path, is_dir: bool) -> io::Result<()> {
    let result = if is_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Split the ordered operations into execution batches.
///
/// A batch holds more than one operation only when every member is
/// non-Critical, shares a priority tier, and touches a distinct target with
/// distinct identifiers. Critical operations always run alone.
pub fn batches(operations: &[Operation], max_parallel: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut targets: HashSet<String> = HashSet::new();
    let mut identifiers: HashSet<String> = HashSet::new();

    for (i, op) in operations.iter().enumerate() {
        let joins = i > start && {
            let head = &operations[start];
            max_parallel > 1
                && i - start < max_parallel
                && op.risk_tier != PriorityTier::Critical
                && head.risk_tier != PriorityTier::Critical
                && op.priority == head.priority
                && !targets.contains(&op.target_key())
                && op
                    .mutation
                    .identifier_names()
                    .iter()
                    .all(|n| !identifiers.contains(*n))
        };
        if !joins && i > start {
            ranges.push(start..i);
            start = i;
            targets.clear();
            identifiers.clear();
        }
        targets.insert(op.target_key());
        identifiers.extend(op.mutation.identifier_names().into_iter().map(String::from));
    }
    if start < operations.len() {
        ranges.push(start..operations.len());
    }
    ranges
}
