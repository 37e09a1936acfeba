//! adjutant-cloud - the cloud peer agent.
//!
//! Claims tasks from `Needs_Action/` by atomic move into
//! `In_Progress/cloud/`, drafts email and social replies into
//! `Pending_Approval/` as `CLOUD_DRAFT_*` files, and publishes status
//! signals to `Signals/`. Never executes approved sends.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use adjutant_core::config::{AdjutantConfig, AgentMode};
use adjutant_core::error::FailureKind;
use adjutant_core::ledger::EventLog;
use adjutant_core::retry::{Clock, SystemClock};
use adjutant_core::vault::{Stage, Vault};
use adjutant_daemon::cloud::CloudAgent;
use adjutant_daemon::shutdown::Shutdown;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// adjutant-cloud - cloud peer orchestrator
#[derive(Parser, Debug)]
#[command(name = "adjutant-cloud")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Vault root directory
    #[arg(long, env = "VAULT_PATH")]
    vault: Option<PathBuf>,

    /// Configuration file
    #[arg(long, default_value = "adjutant.toml")]
    config: PathBuf,

    /// Seconds between Needs_Action/ polls
    #[arg(long)]
    interval: Option<u64>,

    /// Single claim pass then exit
    #[arg(long)]
    once: bool,

    /// Log actions without writing files
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
        config.cloud.poll_interval = Duration::from_secs(secs);
    }
    if config.mode != AgentMode::Cloud {
        warn!("AGENT_MODE is not \"cloud\"; work-zone restrictions still apply");
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
        .with_actor("cloud_agent");
    let mut agent = CloudAgent::new(vault, ledger, config, clock);

    if cli.once {
        return match agent.run_once() {
            Ok(processed) => {
                info!(processed, "single pass complete");
                ExitCode::SUCCESS
            },
            Err(failure) => {
                error!(error = %failure, "pass failed");
                exit_for(failure.kind)
            },
        };
    }

    let shutdown = Shutdown::listening();
    match agent.run(shutdown.token()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            error!(error = %failure, "cloud agent stopped with error");
            exit_for(failure.kind)
        },
    }
}

fn exit_for(kind: FailureKind) -> ExitCode {
    ExitCode::from(u8::try_from(kind.exit_code()).unwrap_or(1))
}
