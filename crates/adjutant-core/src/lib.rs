//! # adjutant-core
//!
//! Core library for adjutant - a personal autonomous-work orchestrator built
//! around a shared directory tree (the "vault") that doubles as message bus,
//! state store, and audit ledger.
//!
//! Everything interesting in the system - queueing, claiming, approval,
//! execution, logging - happens by moving files between vault stage
//! directories and writing small structured records. This crate provides the
//! building blocks that the daemon binaries compose:
//!
//! - **Vault state machine**: stage layout, action-note frontmatter, and the
//!   claim-by-move primitives where the filesystem rename is the commit point
//! - **Event ledger**: append-only daily JSON-lines audit record
//! - **Retry primitives**: exponential backoff with full jitter, circuit
//!   breaker, and token-bucket rate limiter sharing one clock abstraction
//! - **Policy engine**: handbook rules re-checked at dispatch time (expiry,
//!   amount thresholds, prior-approval evidence)
//! - **Configuration**: TOML file + environment merge for every component
//!
//! ## Example
//!
//! ```rust,no_run
//! use adjutant_core::ledger::EventLog;
//! use adjutant_core::retry::SystemClock;
//! use adjutant_core::vault::{Peer, Stage, Vault};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let vault = Vault::open("/path/to/vault")?;
//! vault.ensure_layout()?;
//!
//! let ledger = EventLog::new(vault.stage_path(Stage::Logs), Arc::new(SystemClock));
//! for entry in vault.list(Stage::NeedsAction)? {
//!     match vault.claim(&ledger, &entry.stem, Peer::Local)? {
//!         Some(claimed) => println!("claimed {}", claimed.display()),
//!         None => println!("lost the race for {}", entry.stem),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod ledger;
pub mod policy;
pub mod retry;
pub mod vault;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{AdjutantConfig, AgentMode};
    pub use crate::error::{Failure, FailureKind};
    pub use crate::ledger::{EventLog, EventRecord};
    pub use crate::retry::{Clock, SystemClock};
    pub use crate::vault::{ActionNote, Peer, Stage, Stem, Vault};
}

pub use config::AdjutantConfig;
pub use error::{Failure, FailureKind};
pub use ledger::{EventLog, EventRecord};
pub use vault::{Stage, Stem, Vault};
