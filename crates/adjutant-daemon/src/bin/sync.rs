//! adjutant-sync - git-based vault synchronisation daemon.
//!
//! Keeps the vault in sync between the cloud VM and the local machine via
//! the shared git remote: pull, resolve conflicts per directory policy,
//! push, write the rolling `SYNC_STATUS` signal.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use adjutant_core::config::AdjutantConfig;
use adjutant_core::error::FailureKind;
use adjutant_core::ledger::EventLog;
use adjutant_core::retry::{Clock, SystemClock};
use adjutant_core::vault::{Stage, Vault};
use adjutant_daemon::shutdown::Shutdown;
use adjutant_daemon::sync::SyncBridge;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// adjutant-sync - vault sync bridge
#[derive(Parser, Debug)]
#[command(name = "adjutant-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Vault root directory
    #[arg(long, env = "VAULT_PATH")]
    vault: Option<PathBuf>,

    /// Configuration file
    #[arg(long, default_value = "adjutant.toml")]
    config: PathBuf,

    /// Seconds between sync cycles
    #[arg(long)]
    interval: Option<u64>,

    /// Single pull+push cycle then exit
    #[arg(long)]
    once: bool,

    /// Pull only, then exit
    #[arg(long)]
    pull_only: bool,

    /// Push with a custom commit message, then exit
    #[arg(long, value_name = "MSG")]
    push: Option<String>,

    /// Log git activity without mutating anything
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match AdjutantConfig::load(Some(&cli.config)) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(2);
        },
    };
    if cli.dry_run {
        config.dry_run = true;
    }
    if let Some(secs) = cli.interval {
        config.sync.interval = Duration::from_secs(secs);
    }
    let vault_path = match config.resolve_vault(cli.vault.clone()) {
        Ok(path) => path.to_path_buf(),
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(2);
        },
    };
    let vault = match Vault::open(&vault_path) {
        Ok(vault) => vault,
        Err(err) => {
            error!(error = %err, "vault unavailable");
            return ExitCode::from(2);
        },
    };
    if let Err(err) = vault.ensure_layout() {
        error!(error = %err, "failed to prepare vault layout");
        return ExitCode::from(2);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = EventLog::new(vault.stage_path(Stage::Logs), Arc::clone(&clock))
        .with_actor("vault_sync");
    let bridge = SyncBridge::new(vault, ledger, config.sync.clone(), clock, config.dry_run);

    if cli.pull_only {
        return match bridge.pull().await {
            Ok(outcome) => {
                info!(
                    performed = outcome.performed,
                    files = outcome.files_updated,
                    "pull complete"
                );
                ExitCode::SUCCESS
            },
            Err(failure) => {
                error!(error = %failure, "pull failed");
                exit_for(failure.kind)
            },
        };
    }
    if let Some(message) = cli.push {
        return match bridge.push(Some(&message)).await {
            Ok(outcome) => {
                info!(files = outcome.files_pushed, "push complete");
                ExitCode::SUCCESS
            },
            Err(failure) => {
                error!(error = %failure, "push failed");
                exit_for(failure.kind)
            },
        };
    }
    if cli.once {
        return match bridge.sync_once().await {
            Ok(report) => {
                info!(
                    pulled = report.pull.files_updated,
                    pushed = report.push.files_pushed,
                    "sync complete"
                );
                ExitCode::SUCCESS
            },
            Err(failure) => {
                error!(error = %failure, "sync failed");
                exit_for(failure.kind)
            },
        };
    }

    let shutdown = Shutdown::listening();
    match bridge.run(shutdown.token()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            error!(error = %failure, "sync daemon stopped with error");
            exit_for(failure.kind)
        },
    }
}

fn exit_for(kind: FailureKind) -> ExitCode {
    ExitCode::from(u8::try_from(kind.exit_code()).unwrap_or(1))
}
