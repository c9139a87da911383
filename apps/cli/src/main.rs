use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use driverpilot_core::{InventorySnapshot, UpdateCandidate};
use driverpilot_host_windows::process::SystemCommandRunner;
use driverpilot_host_windows::system::pending_reboot;
use driverpilot_report::{create_install_report, create_scan_report};
use driverpilot_safety::{require_confirmation_token, SafetyContext};
use driverpilot_workflow_engine::{
    category_counts, Engine, EngineConfig, Progress, Services, StrategyTable, UpdateCatalog,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "driverpilot", version, about = "Driver inventory, update check and install")]
struct Cli {
    /// TOML engine configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a fresh confirmation token for `install`.
    Token,
    /// Inventory installed drivers.
    Scan {
        #[arg(long)]
        pretty: bool,
        #[arg(long)]
        report_base: Option<PathBuf>,
    },
    /// Scan and list available updates.
    Check {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        pretty: bool,
    },
    /// Scan, resolve and install the selected updates.
    Install {
        #[arg(long)]
        catalog: PathBuf,
        /// Device id to update; repeat to select several, in order.
        #[arg(long = "device")]
        devices: Vec<String>,
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        token: Option<String>,
        /// Restore the backup of every item that failed after being backed up.
        #[arg(long)]
        rollback_failed: bool,
        #[arg(long)]
        report_base: Option<PathBuf>,
    },
    /// Report whether the OS is waiting for a reboot.
    RebootStatus,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Token => {
            println!("{}", require_confirmation_token());
            Ok(())
        }
        Command::Scan {
            pretty,
            report_base,
        } => {
            let engine = Engine::new(Services::system(config, StrategyTable::new())?);
            let records = engine.start_scan(print_progress)?.join()?;
            let counts = category_counts(&records);
            for (category, count) in &counts {
                info!(category = category.as_str(), count, "drivers by category");
            }
            let snapshot = InventorySnapshot::new(driverpilot_host_windows::host_info(), records);
            if let Some(base) = report_base {
                let paths = create_scan_report(base, &snapshot, &counts, None)?;
                info!(path = %paths.root.display(), "scan report written");
            }
            print_json(&snapshot, pretty)
        }
        Command::Check { catalog, pretty } => {
            let engine = engine_with_catalog(config, &catalog)?;
            let candidates = check_updates(&engine)?;
            print_json(&candidates, pretty)
        }
        Command::Install {
            catalog,
            devices,
            yes,
            token,
            rollback_failed,
            report_base,
        } => {
            let engine = engine_with_catalog(config, &catalog)?;
            let candidates = check_updates(&engine)?;
            let selected = select(candidates, &devices);
            let safety = SafetyContext {
                confirmed: yes,
                confirmation_token: token,
            };
            let mut session = engine.start_install(selected, &safety, print_progress)?.join()?;
            if rollback_failed {
                let failed: Vec<String> = session
                    .summary()
                    .outcomes
                    .iter()
                    .filter(|o| o.rollback_available())
                    .map(|o| o.candidate.device_id.clone())
                    .collect();
                for device in failed {
                    let restored = session.rollback(&device);
                    info!(%device, restored, "rollback attempted");
                }
            }
            let summary = session.close();
            if let Some(base) = report_base {
                let paths = create_install_report(base, &summary, None)?;
                info!(path = %paths.root.display(), "install report written");
            }
            if summary.reboot_required() {
                warn!("a reboot is required to finish installing updates");
            }
            print_json(&summary, true)
        }
        Command::RebootStatus => {
            let status = pending_reboot(&SystemCommandRunner, config.query_timeout())?;
            print_json(
                &serde_json::json!({ "reboot_pending": status.any(), "markers": status }),
                true,
            )
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "driverpilot=debug" } else { "driverpilot=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn engine_with_catalog(config: EngineConfig, catalog: &Path) -> Result<Engine> {
    let strategies = UpdateCatalog::load(catalog)?.into_strategies();
    Ok(Engine::new(Services::system(config, strategies)?))
}

fn check_updates(engine: &Engine) -> Result<Vec<UpdateCandidate>> {
    let records = engine.start_scan(print_progress)?.join()?;
    let candidates = engine.start_resolve(records, print_progress)?.join()?;
    info!(updates = candidates.len(), "update check complete");
    Ok(candidates)
}

/// Candidates for `devices` in the order given; every candidate when empty.
fn select(candidates: Vec<UpdateCandidate>, devices: &[String]) -> Vec<UpdateCandidate> {
    if devices.is_empty() {
        return candidates;
    }
    devices
        .iter()
        .filter_map(|id| {
            let found = candidates.iter().find(|c| &c.device_id == id).cloned();
            if found.is_none() {
                warn!(device = %id, "no update available for device");
            }
            found
        })
        .collect()
}

fn print_progress(progress: Progress) {
    eprintln!(
        "[{}] {}/{} {}",
        progress.stage, progress.index, progress.total, progress.label
    );
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    if pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}
