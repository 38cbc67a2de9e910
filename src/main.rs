//! teamcache-deploy - main entry point
//!
//! Parses the command line, sets up logging and signal handling, and hands
//! off to the library. The process exit code comes from `DeployError::exit_code`.

use std::fs::File;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;

use teamcache::activation::ActivationController;
use teamcache::cli::{Cli, Commands};
use teamcache::command_runner::SystemRunner;
use teamcache::config_file::{DeployConfig, HostLayout};
use teamcache::deploy::Deployer;
use teamcache::engine::unit::SERVICE_UNIT;
use teamcache::error::{DeployError, Result};
use teamcache::health;
use teamcache::inventory::{self, DiscoveryReport};
use teamcache::process_guard::{self, CancelToken, ProcessGuard};
use teamcache::types::{DeviceMode, StorageMode};
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// `RUST_LOG` overrides the default `info` level. `--log-file` adds a plain-text copy.
fn init_logger(log_file: Option<&Path>) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    if let Err(e) = init_logger(cli.log_file.as_deref()) {
        eprintln!("Cannot open log file: {}", e);
        return ExitCode::FAILURE;
    }
    info!("teamcache-deploy {} starting", env!("CARGO_PKG_VERSION"));

    let cancel = CancelToken::global();
    if let Err(e) = process_guard::init_signal_handlers(cancel.clone()) {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("Signal handlers initialized");
    let _guard = ProcessGuard::new();

    match dispatch(&cli, cancel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

fn dispatch(cli: &Cli, cancel: CancelToken) -> Result<()> {
    let runner = SystemRunner::new(cli.dry_run, cancel.clone());

    match &cli.command {
        Commands::Deploy { env_file } => {
            let config = load_config(env_file, cli.unmount_foreign)?;
            let report = Deployer::new(config, HostLayout::default(), &runner)
                .with_cancel(cancel)
                .run()?;
            println!("{}", report.summary());
        }
        Commands::Validate { env_file } => {
            let config = load_config(env_file, cli.unmount_foreign)?;
            let preflight = Deployer::new(config, HostLayout::default(), &runner)
                .with_cancel(cancel)
                .preflight()?;
            println!("✓ Configuration is valid: {}", env_file.display());
            for desc in &preflight.descriptors {
                println!("  {}", desc);
            }
            for (device, mounted_at) in &preflight.foreign {
                println!("  {} will be unmounted from {}", device, mounted_at.display());
            }
            for warning in &preflight.warnings {
                println!("  warning: {}", warning);
            }
        }
        Commands::Discover {
            storage_mode,
            paths,
            json,
        } => {
            let report = match storage_mode {
                StorageMode::RawDevice => {
                    inventory::discover_raw(&runner, &HostLayout::default().mount_root, DeviceMode::default())?
                }
                StorageMode::FilePath => {
                    if paths.is_empty() {
                        return Err(DeployError::validation("--paths is required with --storage-mode filepath"));
                    }
                    inventory::resolve_paths(paths)
                }
            };
            print_discovery(&report, *json)?;
        }
        Commands::Plan { env_file } => {
            let config = load_config(env_file, cli.unmount_foreign)?;
            let preview = Deployer::new(config, HostLayout::default(), &runner)
                .with_cancel(cancel)
                .plan()?;

            println!("Storage layout:\n{}", preview.plan.summary());
            println!("\nFiles:");
            for dir in &preview.artifacts.directories {
                println!("  {}/", dir.display());
            }
            for artifact in &preview.artifacts.files {
                println!("  {} (mode {:o})", artifact.path.display(), artifact.mode);
            }
            for artifact in &preview.artifacts.files {
                let is_unit = artifact.path.extension().is_some_and(|e| e == "service");
                let is_layout = artifact.path.file_name().is_some_and(|n| n == "mse4.conf");
                if (is_unit || is_layout) && !artifact.is_secret() {
                    println!("\n--- {} ---\n{}", artifact.path.display(), artifact.contents);
                }
            }
            for warning in &preview.warnings {
                println!("warning: {}", warning);
            }
        }
        Commands::Status { port, attempts } => {
            let report = ActivationController::new(&runner, SERVICE_UNIT)
                .with_attempts(*attempts)
                .with_cancel(cancel)
                .with_health_probe(*port, health::DEFAULT_PROBE_TIMEOUT)
                .verify()?;
            println!("{} is active after {} check(s)", report.unit, report.attempts);
            if let Some(health) = report.health {
                println!("Endpoint on port {}: {}", port, health);
            }
        }
    }
    Ok(())
}

fn load_config(env_file: &Path, unmount_foreign: bool) -> Result<DeployConfig> {
    info!("Loading configuration from {}", env_file.display());
    let mut config = DeployConfig::load_from_file(env_file)?;
    config.unmount_foreign |= unmount_foreign;
    Ok(config)
}

fn print_discovery(report: &DiscoveryReport, json: bool) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(report).map_err(anyhow::Error::from)?;
        println!("{}", text);
        return Ok(());
    }

    if report.candidates.is_empty() {
        println!("No suitable storage found");
    } else {
        println!("Candidates:");
        for desc in &report.candidates {
            println!("  {}", desc);
        }
    }
    if !report.excluded.is_empty() {
        println!("Excluded:");
        for exclusion in &report.excluded {
            println!("  {}", exclusion);
        }
    }
    Ok(())
}

fn report_error(e: &DeployError) {
    match e {
        DeployError::Validation(errors) => {
            error!("{} validation error(s)", errors.len());
            eprintln!("✗ Validation failed:");
            for msg in errors.messages() {
                eprintln!("  - {}", msg);
            }
        }
        other => {
            error!("{}", other);
            eprintln!("✗ {}", other);
        }
    }
}
