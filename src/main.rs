//! idreset - main entry point
//!
//! Parses the command line, loads the run configuration and hands off to the
//! pipeline. All behavior lives in the library.

use anyhow::{Context, Result};
use idreset::cancel::install_ctrlc_handler;
use idreset::cli::{Cli, Commands};
use idreset::config_file::RunConfig;
use idreset::pipeline::Pipeline;
use serde::Serialize;
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize the logger with appropriate settings
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    // RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .without_time()
        .init();
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    match path {
        Some(path) => RunConfig::load_from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(RunConfig::default()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    debug!("CLI arguments parsed");

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => {
            args.apply(&mut config);
            let cancel = match install_ctrlc_handler() {
                Ok(token) => token,
                Err(e) => {
                    warn!("Failed to install interrupt handler: {}", e);
                    Default::default()
                }
            };
            info!("idreset starting in {} mode", config.mode);
            let pipeline = Pipeline::new(config)
                .context("invalid run configuration")?
                .with_cancel(cancel);
            let report = pipeline.run().context("run failed")?;
            println!("{}", report.summary_line());
            if let Err(e) = report.ensure_success() {
                error!("{}", e);
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Discover { scan } => {
            scan.apply(&mut config);
            let pipeline = Pipeline::new(config).context("invalid run configuration")?;
            print_json(&pipeline.discover())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan {
            scan,
            mode,
            risk_tolerance,
        } => {
            scan.apply(&mut config);
            if let Some(mode) = mode {
                config.mode = mode;
            }
            if let Some(tolerance) = risk_tolerance {
                config.risk_tolerance = tolerance;
            }
            let pipeline = Pipeline::new(config).context("invalid run configuration")?;
            let (_, plan) = pipeline.dry_plan().context("planning failed")?;
            print_json(&plan)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify { scan, mode } => {
            scan.apply(&mut config);
            if let Some(mode) = mode {
                config.mode = mode;
            }
            let pipeline = Pipeline::new(config).context("invalid run configuration")?;
            let (inventory, plan) = pipeline.dry_plan().context("planning failed")?;
            let report = pipeline.verify(&inventory, &plan);
            print_json(&report)?;
            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Prune { keep } => {
            if let Some(keep) = keep {
                config.backup_retention_count = keep;
            }
            let pipeline = Pipeline::new(config).context("invalid run configuration")?;
            let pruned = pipeline.prune().context("pruning backups failed")?;
            info!("Removed {} backups, kept {}", pruned.removed.len(), pruned.kept);
            print_json(&pruned)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::ValidateConfig { file } => {
            info!("Validating configuration file: {}", file.display());
            let validated = RunConfig::load_from_file(&file).and_then(|config| config.validate());
            match validated {
                Ok(()) => {
                    println!("✓ Configuration file is valid: {}", file.display());
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    println!("✗ Configuration validation failed: {}", e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}
