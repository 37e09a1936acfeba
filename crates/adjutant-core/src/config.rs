//! Configuration for every adjutant component.
//!
//! Configuration merges three layers, later layers winning: built-in
//! defaults, an optional `adjutant.toml` file, and environment variables
//! (`VAULT_PATH`, `DRY_RUN`, `AGENT_MODE`, `GIT_VAULT_BRANCH`, `CLAUDE_CMD`,
//! `VAULT_SYNC_INTERVAL`, `CLOUD_POLL_INTERVAL`). CLI flags are applied on
//! top by each binary. Credentials (SMTP, ERP, session paths) stay in the
//! environment and are never persisted into the vault.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which peer this process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// The local peer: executes approved sends, owns the dashboard.
    #[default]
    Local,
    /// The cloud peer: drafts only, publishes state via `Signals/`.
    Cloud,
}

impl AgentMode {
    /// Lowercase label, matching the `AGENT_MODE` environment values.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }

    /// Parse an `AGENT_MODE` value.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidMode` for anything but `local`/`cloud`.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "cloud" => Ok(Self::Cloud),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate limit for one named channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelLimit {
    /// Channel name (`email`, `social_post`, `payment`, ...).
    pub name: String,
    /// Maximum actions per interval.
    pub capacity: u32,
    /// Refill interval.
    #[serde(with = "humantime_serde")]
    pub per: Duration,
}

fn default_channels() -> Vec<ChannelLimit> {
    vec![
        ChannelLimit {
            name: "email".to_string(),
            capacity: 10,
            per: Duration::from_secs(3600),
        },
        ChannelLimit {
            name: "social_post".to_string(),
            capacity: 3,
            per: Duration::from_secs(3600),
        },
        ChannelLimit {
            name: "payment".to_string(),
            capacity: 3,
            per: Duration::from_secs(86_400),
        },
    ]
}

/// Orchestrator router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Polling fallback interval for the `Approved/` watch.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Per-call adapter deadline.
    #[serde(default = "default_dispatch_deadline")]
    #[serde(with = "humantime_serde")]
    pub dispatch_deadline: Duration,

    /// Grace window for in-flight dispatches on shutdown.
    #[serde(default = "default_shutdown_grace")]
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Cooldown before a deferred file is revisited.
    #[serde(default = "default_defer_cooldown")]
    #[serde(with = "humantime_serde")]
    pub defer_cooldown: Duration,

    /// Maximum concurrent dispatches per adapter.
    #[serde(default = "default_adapter_concurrency")]
    pub adapter_concurrency: usize,

    /// Amounts above this require prior-approval evidence in the ledger.
    #[serde(default = "default_amount_limit")]
    pub approval_amount_limit: f64,

    /// How many days of ledger files the approval gate searches.
    #[serde(default = "default_approval_lookback_days")]
    pub approval_lookback_days: u32,
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_dispatch_deadline() -> Duration {
    Duration::from_secs(30)
}

const fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

const fn default_defer_cooldown() -> Duration {
    Duration::from_secs(60)
}

const fn default_adapter_concurrency() -> usize {
    2
}

const fn default_amount_limit() -> f64 {
    100.0
}

const fn default_approval_lookback_days() -> u32 {
    30
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            dispatch_deadline: default_dispatch_deadline(),
            shutdown_grace: default_shutdown_grace(),
            defer_cooldown: default_defer_cooldown(),
            adapter_concurrency: default_adapter_concurrency(),
            approval_amount_limit: default_amount_limit(),
            approval_lookback_days: default_approval_lookback_days(),
        }
    }
}

/// Watcher framework settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Poll cadence for network sources (the filesystem watcher uses
    /// native notifications with this as the fallback).
    #[serde(default = "default_watch_interval")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Maximum seen-set entries kept in the dedup sidecar.
    #[serde(default = "default_seen_cap")]
    pub seen_cap: usize,

    /// Cap on action notes emitted per hour per watcher. Items beyond the
    /// cap stay unmarked and are picked up by a later poll.
    #[serde(default = "default_emit_cap")]
    pub emit_cap: u32,
}

const fn default_watch_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_seen_cap() -> usize {
    1000
}

const fn default_emit_cap() -> u32 {
    60
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_watch_interval(),
            seen_cap: default_seen_cap(),
            emit_cap: default_emit_cap(),
        }
    }
}

/// Sync bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between pull/push cycles.
    #[serde(default = "default_sync_interval")]
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Git remote name.
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Git branch carrying the vault.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Peered mode: the orchestrator's scheduler also runs a sync cycle
    /// every 5 minutes, for installs without the dedicated sync daemon.
    #[serde(default)]
    pub peered: bool,
}

const fn default_sync_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: default_sync_interval(),
            remote: default_remote(),
            branch: default_branch(),
            peered: false,
        }
    }
}

/// Cloud peer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Seconds between `Needs_Action/` polls.
    #[serde(default = "default_cloud_poll")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Cadence for `CLOUD_STATUS_*` signals.
    #[serde(default = "default_signal_interval")]
    #[serde(with = "humantime_serde")]
    pub signal_interval: Duration,

    /// Claims older than this are swept back by the opposite peer.
    #[serde(default = "default_claim_ttl")]
    #[serde(with = "humantime_serde")]
    pub claim_ttl: Duration,
}

const fn default_cloud_poll() -> Duration {
    Duration::from_secs(30)
}

const fn default_signal_interval() -> Duration {
    Duration::from_secs(900)
}

const fn default_claim_ttl() -> Duration {
    Duration::from_secs(1800)
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_cloud_poll(),
            signal_interval: default_signal_interval(),
            claim_ttl: default_claim_ttl(),
        }
    }
}

/// Reasoning-layer subprocess settings.
///
/// The LLM is never called in-process; it observes the same vault and
/// writes back into it. This configures how the scheduler shells out to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonerConfig {
    /// Command to invoke (`claude` by default; `CLAUDE_CMD` overrides).
    #[serde(default = "default_reasoner_command")]
    pub command: String,

    /// Hard timeout for one invocation.
    #[serde(default = "default_reasoner_timeout")]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_reasoner_command() -> String {
    "claude".to_string()
}

const fn default_reasoner_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            command: default_reasoner_command(),
            timeout: default_reasoner_timeout(),
        }
    }
}

/// External transport commands, one per adapter.
///
/// Each entry is an argv template; the adapter spawns it and writes the
/// delivery payload as JSON to stdin. Unset transports fall back to the
/// logging transport, so a bare checkout performs no external side-effects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportsConfig {
    /// Command for the email adapter (e.g. an SMTP submission helper).
    #[serde(default)]
    pub email: Option<Vec<String>>,

    /// Command for the social-post adapter.
    #[serde(default)]
    pub social: Option<Vec<String>>,

    /// Command for the accounting adapter (ERP JSON-RPC helper).
    #[serde(default)]
    pub accounting: Option<Vec<String>>,
}

/// Top-level configuration shared by all binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjutantConfig {
    /// Vault root directory.
    #[serde(default)]
    pub vault: PathBuf,

    /// Which peer this process runs as.
    #[serde(default)]
    pub mode: AgentMode,

    /// Log actions without performing external side-effects.
    #[serde(default)]
    pub dry_run: bool,

    /// Orchestrator router settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Watcher framework settings.
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Sync bridge settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Cloud peer settings.
    #[serde(default)]
    pub cloud: CloudConfig,

    /// Reasoning-layer subprocess settings.
    #[serde(default)]
    pub reasoner: ReasonerConfig,

    /// External transport commands.
    #[serde(default)]
    pub transports: TransportsConfig,

    /// Per-channel rate limits.
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelLimit>,
}

impl Default for AdjutantConfig {
    fn default() -> Self {
        Self {
            vault: PathBuf::new(),
            mode: AgentMode::default(),
            dry_run: false,
            orchestrator: OrchestratorConfig::default(),
            watcher: WatcherConfig::default(),
            sync: SyncConfig::default(),
            cloud: CloudConfig::default(),
            reasoner: ReasonerConfig::default(),
            transports: TransportsConfig::default(),
            channels: default_channels(),
        }
    }
}

impl AdjutantConfig {
    /// Load configuration: defaults, then the TOML file (if present), then
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if an environment value is malformed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    }
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            },
            _ => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed values (`AGENT_MODE`, intervals).
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(vault) = std::env::var("VAULT_PATH") {
            if !vault.is_empty() {
                self.vault = PathBuf::from(vault);
            }
        }
        if let Ok(dry_run) = std::env::var("DRY_RUN") {
            self.dry_run = dry_run.eq_ignore_ascii_case("true") || dry_run == "1";
        }
        if let Ok(mode) = std::env::var("AGENT_MODE") {
            self.mode = AgentMode::parse(&mode)?;
        }
        if let Ok(branch) = std::env::var("GIT_VAULT_BRANCH") {
            if !branch.is_empty() {
                self.sync.branch = branch;
            }
        }
        if let Ok(command) = std::env::var("CLAUDE_CMD") {
            if !command.is_empty() {
                self.reasoner.command = command;
            }
        }
        if let Ok(secs) = std::env::var("VAULT_SYNC_INTERVAL") {
            self.sync.interval = Duration::from_secs(parse_seconds("VAULT_SYNC_INTERVAL", &secs)?);
        }
        if let Ok(secs) = std::env::var("CLOUD_POLL_INTERVAL") {
            self.cloud.poll_interval =
                Duration::from_secs(parse_seconds("CLOUD_POLL_INTERVAL", &secs)?);
        }
        Ok(())
    }

    /// Resolve the vault path from the CLI flag (highest precedence).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingVault` when neither the flag, the
    /// environment, nor the file supplied a path.
    pub fn resolve_vault(&mut self, flag: Option<PathBuf>) -> Result<&Path, ConfigError> {
        if let Some(vault) = flag {
            self.vault = vault;
        }
        if self.vault.as_os_str().is_empty() {
            return Err(ConfigError::MissingVault);
        }
        Ok(&self.vault)
    }

    /// The configured limit for a channel, if any.
    #[must_use]
    pub fn channel_limit(&self, name: &str) -> Option<&ChannelLimit> {
        self.channels.iter().find(|limit| limit.name == name)
    }
}

fn parse_seconds(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}

/// Configuration errors. All of them exit with code 2.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Config file could not be parsed.
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },

    /// No vault path from flag, environment, or file.
    #[error("no vault path configured (pass --vault or set VAULT_PATH)")]
    MissingVault,

    /// `AGENT_MODE` was neither `local` nor `cloud`.
    #[error("invalid agent mode: {0:?} (expected \"local\" or \"cloud\")")]
    InvalidMode(String),

    /// A numeric environment value was malformed.
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AdjutantConfig::default();
        assert_eq!(config.mode, AgentMode::Local);
        assert!(!config.dry_run);
        assert_eq!(config.orchestrator.adapter_concurrency, 2);
        assert_eq!(config.channels.len(), 3);
        assert_eq!(config.channel_limit("email").unwrap().capacity, 10);
        assert_eq!(
            config.channel_limit("payment").unwrap().per,
            Duration::from_secs(86_400)
        );
    }

    #[test]
    fn test_parse_toml() {
        let raw = r#"
            vault = "/srv/vault"
            mode = "cloud"
            dry_run = true

            [orchestrator]
            dispatch_deadline = "45s"
            approval_amount_limit = 250.0

            [[channels]]
            name = "email"
            capacity = 2
            per = "1h"
        "#;
        let config: AdjutantConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.vault, PathBuf::from("/srv/vault"));
        assert_eq!(config.mode, AgentMode::Cloud);
        assert!(config.dry_run);
        assert_eq!(
            config.orchestrator.dispatch_deadline,
            Duration::from_secs(45)
        );
        assert_eq!(config.channels.len(), 1);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(AgentMode::parse("LOCAL").unwrap(), AgentMode::Local);
        assert_eq!(AgentMode::parse("cloud").unwrap(), AgentMode::Cloud);
        assert!(AgentMode::parse("hybrid").is_err());
    }

    #[test]
    fn test_resolve_vault_precedence() {
        let mut config = AdjutantConfig {
            vault: PathBuf::from("/from/file"),
            ..Default::default()
        };
        let resolved = config
            .resolve_vault(Some(PathBuf::from("/from/flag")))
            .unwrap();
        assert_eq!(resolved, Path::new("/from/flag"));

        let mut empty = AdjutantConfig::default();
        assert!(matches!(
            empty.resolve_vault(None),
            Err(ConfigError::MissingVault)
        ));
    }
}
