//! Discovery -> Strategy -> Execution -> Verification
//!
//! [`Pipeline`] wires the four stages together for one run. The inventory and
//! the plan are values handed from stage to stage; nothing is shared through
//! globals. A run holds the state directory's lock from discovery until the
//! report is written.

use crate::artifact::Inventory;
use crate::backup::{BackupStore, PruneReport};
use crate::cancel::CancelToken;
use crate::config_file::RunConfig;
use crate::discovery::{Discovery, DiscoveryRoots};
use crate::engine::executor::{ExecutionHooks, Executor, NoHooks};
use crate::engine::policy::PolicyTable;
use crate::engine::strategy::{Plan, Strategy};
use crate::error::Result;
use crate::lock::RunLock;
use crate::patterns::PatternConfig;
use crate::registry::{RegistryAccess, default_registry};
use crate::report::RunReport;
use crate::verify::{VerificationReport, Verifier, installations};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Pipeline {
    config: RunConfig,
    patterns: PatternConfig,
    policies: PolicyTable,
    roots: DiscoveryRoots,
    registry: Arc<dyn RegistryAccess>,
    hooks: Arc<dyn ExecutionHooks>,
    cancel: CancelToken,
}

impl Pipeline {
    /// Validate `config` and load pattern and policy data. Fails only on
    /// configuration errors.
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let patterns = config.load_patterns()?;
        let policies = PolicyTable::builtin()?;
        // Resolve once up front so a bad mode/policy combination fails here
        policies.resolve(config.mode, config.risk_tolerance, config.custom_policy.as_ref())?;

        Ok(Self {
            roots: config.discovery_roots(),
            registry: default_registry(config.query_timeout()),
            hooks: Arc::new(NoHooks),
            cancel: CancelToken::new(),
            config,
            patterns,
            policies,
        })
    }

    pub fn with_registry(mut self, registry: Arc<dyn RegistryAccess>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ExecutionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_roots(mut self, roots: DiscoveryRoots) -> Self {
        self.roots = roots;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn patterns(&self) -> &PatternConfig {
        &self.patterns
    }

    fn backup_store(&self) -> BackupStore {
        BackupStore::new(self.config.backup_dir.clone(), self.config.state_dir.clone())
    }

    pub fn discover(&self) -> Inventory {
        Discovery::new(
            &self.patterns,
            &self.roots,
            self.registry.as_ref(),
            self.config.query_timeout(),
        )
        .discover(self.config.discovery_options())
    }

    pub fn plan(&self, inventory: &Inventory, backups: &BackupStore) -> Result<Plan> {
        Strategy::new(&self.patterns, &self.policies, backups).plan(
            inventory,
            self.config.mode,
            self.config.risk_tolerance,
            self.config.custom_policy.as_ref(),
        )
    }

    /// Discover and plan without executing anything
    pub fn dry_plan(&self) -> Result<(Inventory, Plan)> {
        let inventory = self.discover();
        let plan = self.plan(&inventory, &self.backup_store())?;
        Ok((inventory, plan))
    }

    /// Check the stores `plan` targets for consistency
    pub fn verify(&self, inventory: &Inventory, plan: &Plan) -> VerificationReport {
        Verifier::new(
            &self.patterns,
            self.registry.as_ref(),
            self.config.query_timeout(),
        )
        .verify(&installations(inventory, &self.patterns, plan))
    }

    /// Run the whole pipeline and write the report
    pub fn run(&self) -> Result<RunReport> {
        let started_at = Utc::now();
        let _lock = RunLock::acquire(&self.config.state_dir)?;

        let inventory = self.discover();
        info!("inventory: {:?}", inventory.summary());

        let backups = self.backup_store();
        let plan = self.plan(&inventory, &backups)?;
        if !plan.risk.within_tolerance {
            warn!(
                "plan risk {} exceeds tolerance {}",
                plan.risk.overall, plan.risk.tolerance
            );
        }

        let outcome = Executor::new(
            &self.patterns,
            &backups,
            self.registry.as_ref(),
            self.config.executor_config(&plan.policy),
        )
        .with_hooks(self.hooks.as_ref())
        .with_cancel(self.cancel.clone())
        .execute(&plan);

        let verification = if self.config.dry_run {
            None
        } else {
            Some(self.verify(&inventory, &plan))
        };

        let report = RunReport::build(
            started_at,
            &inventory,
            &plan,
            &outcome,
            verification,
            self.config.dry_run,
        );
        let path = self.report_path(&backups);
        report.save_to_file(&path)?;
        info!("{} (report: {})", report.summary_line(), path.display());
        Ok(report)
    }

    fn report_path(&self, backups: &BackupStore) -> PathBuf {
        self.config.report_path_or_default(backups.stamp())
    }

    /// Remove all but the newest `backup_retention_count` backups
    pub fn prune(&self) -> Result<PruneReport> {
        let _lock = RunLock::acquire(&self.config.state_dir)?;
        let roots = self.roots.backup_search_roots(&self.patterns.app_dirs);
        self.backup_store()
            .prune(&roots, self.config.backup_retention_count)
    }
}
