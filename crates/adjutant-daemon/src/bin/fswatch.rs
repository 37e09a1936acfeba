//! adjutant-fswatch - standalone inbox filesystem watcher.
//!
//! Monitors the vault's `Inbox/` drop folder and turns every dropped file
//! into a `FILE_*` action note in `Needs_Action/`. No external API keys
//! required.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use adjutant_core::config::AdjutantConfig;
use adjutant_core::error::FailureKind;
use adjutant_core::ledger::EventLog;
use adjutant_core::retry::{Clock, SystemClock};
use adjutant_core::vault::{Stage, Vault};
use adjutant_daemon::shutdown::Shutdown;
use adjutant_daemon::watch::fs::InboxWatcher;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// adjutant-fswatch - inbox drop-folder watcher
#[derive(Parser, Debug)]
#[command(name = "adjutant-fswatch")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Vault root directory
    #[arg(long, env = "VAULT_PATH")]
    vault: Option<PathBuf>,

    /// Configuration file
    #[arg(long, default_value = "adjutant.toml")]
    config: PathBuf,

    /// One inbox scan then exit
    #[arg(long)]
    once: bool,

    /// Log actions without writing files
    #[arg(long)]
    dry_run: bool,

    /// Prepare the vault layout and exit
    #[arg(long)]
    setup: bool,

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

    if cli.setup {
        return match vault.ensure_layout() {
            Ok(()) => {
                info!(vault = %vault_path.display(), "vault layout ready");
                ExitCode::SUCCESS
            },
            Err(err) => {
                error!(error = %err, "setup failed");
                ExitCode::from(2)
            },
        };
    }
    if let Err(err) = vault.ensure_layout() {
        error!(error = %err, "failed to prepare vault layout");
        return ExitCode::from(2);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = EventLog::new(vault.stage_path(Stage::Logs), Arc::clone(&clock))
        .with_actor("fs_watcher");
    let mut watcher = InboxWatcher::new(vault, ledger, &config, clock);

    if cli.once {
        return match watcher.scan_once() {
            Ok(emitted) => {
                info!(emitted, "single scan complete");
                ExitCode::SUCCESS
            },
            Err(failure) => {
                error!(error = %failure, "scan failed");
                exit_for(failure.kind)
            },
        };
    }

    let shutdown = Shutdown::listening();
    match watcher.run(shutdown.token()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            error!(error = %failure, "watcher stopped with error");
            exit_for(failure.kind)
        },
    }
}

fn exit_for(kind: FailureKind) -> ExitCode {
    ExitCode::from(u8::try_from(kind.exit_code()).unwrap_or(1))
}
