//! Command-line interface for idreset
//!
//! Flags on `run` override the matching fields of the configuration file; an
//! absent flag leaves the file's value (or the default) in place.

use crate::config_file::RunConfig;
use crate::types::{Mode, RiskLevel, ScanMode};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "idreset")]
#[command(about = "Reset locally persisted telemetry identifiers of editor installations")]
#[command(version)]
pub struct Cli {
    /// Run configuration file (JSON)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Discover, plan, back up, reset and verify
    Run(RunArgs),

    /// Print the discovered inventory as JSON
    Discover {
        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Print the planned operations as JSON without executing them
    Plan {
        #[command(flatten)]
        scan: ScanArgs,

        /// Execution mode
        #[arg(short, long)]
        mode: Option<Mode>,

        /// Highest acceptable overall risk
        #[arg(long)]
        risk_tolerance: Option<RiskLevel>,
    },

    /// Check identifier consistency of the stores a mode targets
    Verify {
        #[command(flatten)]
        scan: ScanArgs,

        /// Mode whose targets are compared
        #[arg(short, long)]
        mode: Option<Mode>,
    },

    /// Delete old backups, keeping the newest N per file
    Prune {
        /// Number of backups to keep
        #[arg(short, long)]
        keep: Option<usize>,
    },

    /// Validate a run configuration file
    ValidateConfig {
        /// Path to the configuration file
        file: PathBuf,
    },
}

/// Discovery flags shared by every command that scans
#[derive(clap::Args, Debug, Default, Clone)]
pub struct ScanArgs {
    /// Scan depth (standard, comprehensive)
    #[arg(long)]
    pub scan_mode: Option<ScanMode>,

    /// Query the Windows registry
    #[arg(long)]
    pub include_registry: bool,

    /// Include volatile temporary files
    #[arg(long)]
    pub include_temp: bool,
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub scan: ScanArgs,

    /// Execution mode (minimal, conservative, standard, aggressive, adaptive, forensic, custom)
    #[arg(short, long)]
    pub mode: Option<Mode>,

    /// Preview every change without touching anything
    #[arg(long)]
    pub dry_run: bool,

    /// Highest acceptable overall risk
    #[arg(long)]
    pub risk_tolerance: Option<RiskLevel>,

    /// Dedicated backup directory
    #[arg(long, value_name = "DIR")]
    pub backup_dir: Option<PathBuf>,

    /// State directory (lock file, default report location)
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Write the run report here
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Upper bound on operations run concurrently
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Mutation attempts per operation
    #[arg(long)]
    pub retries: Option<u32>,
}

impl ScanArgs {
    pub fn apply(&self, config: &mut RunConfig) {
        if let Some(scan_mode) = self.scan_mode {
            config.scan_mode = scan_mode;
        }
        if self.include_registry {
            config.include_registry = true;
        }
        if self.include_temp {
            config.include_volatile_temp = true;
        }
    }
}

impl RunArgs {
    pub fn apply(&self, config: &mut RunConfig) {
        self.scan.apply(config);
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if let Some(tolerance) = self.risk_tolerance {
            config.risk_tolerance = tolerance;
        }
        if let Some(dir) = &self.backup_dir {
            config.backup_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(report) = &self.report {
            config.report_path = Some(report.clone());
        }
        if self.max_parallel.is_some() {
            config.max_parallel = self.max_parallel;
        }
        if let Some(retries) = self.retries {
            config.max_retry_attempts = retries;
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
