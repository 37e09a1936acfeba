//! adjutant - the orchestrator binary.
//!
//! Watches `Approved/` for human-approved action files, routes each to the
//! matching adapter behind the policy gate, and runs the embedded
//! time-driven scheduler (inbox processing, briefings, dashboard refresh,
//! signal merge, stale-claim sweep).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use adjutant_core::config::{AdjutantConfig, AgentMode};
use adjutant_core::error::FailureKind;
use adjutant_core::ledger::EventLog;
use adjutant_core::retry::{Clock, SystemClock};
use adjutant_core::vault::{Peer, Stage, Vault};
use adjutant_daemon::adapters::AdapterSet;
use adjutant_daemon::reasoner::Reasoner;
use adjutant_daemon::router::Router;
use adjutant_daemon::scheduler::{Cadence, Scheduler};
use adjutant_daemon::shutdown::Shutdown;
use adjutant_daemon::signals::SignalMerger;
use adjutant_daemon::sync::SyncBridge;
use adjutant_daemon::{claims, watch};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// adjutant - personal autonomous-work orchestrator
#[derive(Parser, Debug)]
#[command(name = "adjutant")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Vault root directory
    #[arg(long, env = "VAULT_PATH")]
    vault: Option<PathBuf>,

    /// Configuration file
    #[arg(long, default_value = "adjutant.toml")]
    config: PathBuf,

    /// Log actions without performing external side-effects
    #[arg(long)]
    dry_run: bool,

    /// One scan over Approved/ then exit
    #[arg(long)]
    once: bool,

    /// Disable the embedded scheduler
    #[arg(long)]
    no_schedule: bool,

    /// Dispatch one approved file immediately and exit
    #[arg(long, value_name = "FILE")]
    send_now: Option<PathBuf>,

    /// Polling fallback interval in seconds
    #[arg(long)]
    interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

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
        config.orchestrator.poll_interval = Duration::from_secs(secs);
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
        .with_actor("orchestrator");
    let adapters = AdapterSet::from_config(&config);
    let router = Router::new(
        vault.clone(),
        ledger.clone(),
        adapters,
        config.clone(),
        Arc::clone(&clock),
    );

    if let Some(file) = cli.send_now {
        return match router.send_now(&file).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(failure) => {
                error!(error = %failure, "send-now failed");
                exit_for(failure.kind)
            },
        };
    }

    if cli.once {
        return match router.scan_approved().await {
            Ok(terminal) => {
                info!(terminal, "single scan complete");
                ExitCode::SUCCESS
            },
            Err(failure) => {
                error!(error = %failure, "scan failed");
                exit_for(failure.kind)
            },
        };
    }

    info!(
        vault = %vault_path.display(),
        mode = %config.mode,
        dry_run = config.dry_run,
        "orchestrator starting"
    );

    let shutdown = Shutdown::listening();
    let merger = SignalMerger::new(
        vault.clone(),
        ledger.clone(),
        Arc::clone(&clock),
        config.dry_run,
    );

    // Local mode merges cloud signals at startup before the loops begin.
    if config.mode == AgentMode::Local {
        if let Err(err) = merger.merge() {
            warn!(error = %err, "startup signal merge failed");
        }
    }

    let mut tasks = tokio::task::JoinSet::new();

    if !cli.no_schedule {
        let mut scheduler = Scheduler::new(Arc::clone(&clock));
        let reasoner = Reasoner::new(
            config.reasoner.clone(),
            ledger.clone(),
            vault.clone(),
            config.dry_run,
        );

        for (name, cadence, command) in [
            ("process-inbox", "every 30m", "process-inbox"),
            ("update-dashboard", "every 1h", "update-dashboard"),
            ("morning-briefing", "daily 08:00", "morning-briefing"),
            ("weekly-audit", "weekly mon 07:00", "weekly-audit"),
        ] {
            let cadence: Cadence = cadence.parse().expect("built-in cadence");
            let reasoner = reasoner.clone();
            scheduler.register(name, cadence, move || {
                let reasoner = reasoner.clone();
                async move {
                    if let Err(err) = reasoner.invoke(command).await {
                        error!(job = command, error = %err, "reasoner job failed");
                    }
                }
            });
        }

        if config.mode == AgentMode::Local {
            let merger = SignalMerger::new(
                vault.clone(),
                ledger.clone(),
                Arc::clone(&clock),
                config.dry_run,
            );
            let merger = Arc::new(merger);
            scheduler.register(
                "merge-signals",
                "every 30m".parse().expect("built-in cadence"),
                move || {
                    let merger = Arc::clone(&merger);
                    async move {
                        if let Err(err) = merger.merge() {
                            warn!(error = %err, "signal merge failed");
                        }
                    }
                },
            );

            // The local peer sweeps the cloud peer's stale claims.
            let sweep_vault = vault.clone();
            let sweep_ledger = ledger.clone();
            let ttl = config.cloud.claim_ttl;
            scheduler.register(
                "claim-sweep",
                "every 10m".parse().expect("built-in cadence"),
                move || {
                    let vault = sweep_vault.clone();
                    let ledger = sweep_ledger.clone();
                    async move {
                        match claims::sweep_stale_claims(&vault, &ledger, Peer::Cloud, ttl) {
                            Ok(0) => {},
                            Ok(swept) => info!(swept, "stale cloud claims returned"),
                            Err(err) => warn!(error = %err, "claim sweep failed"),
                        }
                    }
                },
            );
        }

        if config.sync.peered {
            let bridge = Arc::new(SyncBridge::new(
                vault.clone(),
                ledger.clone(),
                config.sync.clone(),
                Arc::clone(&clock),
                config.dry_run,
            ));
            scheduler.register(
                "vault-sync",
                "every 5m".parse().expect("built-in cadence"),
                move || {
                    let bridge = Arc::clone(&bridge);
                    async move {
                        if let Err(err) = bridge.sync_once().await {
                            warn!(error = %err, "vault sync failed");
                        }
                    }
                },
            );
        }

        tasks.spawn(scheduler.run(shutdown.token()));
    }

    let router_token = shutdown.token();
    let router_task = tokio::spawn(async move { router.run(router_token).await });

    // The inbox watcher runs in the same process for single-machine
    // installs; the standalone `adjutant-fswatch` binary covers the rest.
    let mut inbox = watch::fs::InboxWatcher::new(
        vault.clone(),
        ledger.clone(),
        &config,
        Arc::clone(&clock),
    );
    let inbox_token = shutdown.token();
    tasks.spawn(async move {
        if let Err(err) = inbox.run(inbox_token).await {
            error!(error = %err, "inbox watcher stopped with error");
        }
    });

    let code = match router_task.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(failure)) => {
            error!(error = %failure, "router stopped with error");
            exit_for(failure.kind)
        },
        Err(err) => {
            error!(error = %err, "router task panicked");
            ExitCode::from(1)
        },
    };
    shutdown.trigger();
    while tasks.join_next().await.is_some() {}
    code
}

fn exit_for(kind: FailureKind) -> ExitCode {
    ExitCode::from(u8::try_from(kind.exit_code()).unwrap_or(1))
}
