//! Opaque delivery transports.
//!
//! The core never speaks SMTP, drives a browser, or calls an ERP directly.
//! Each concrete adapter hands a [`Delivery`] to a [`Transport`]; the
//! production transport spawns a configured helper command and writes the
//! payload as JSON to its stdin, and the fallback transport only logs.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use adjutant_core::error::Failure;
use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

/// One outbound side-effect, fully assembled by an adapter.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Rate-limit channel (`email`, `social_post`, `payment`).
    pub channel: &'static str,
    /// Stem of the approved file - the idempotency key.
    pub stem: String,
    /// Dispatch verb.
    pub action: String,
    /// Structured fields (recipient, subject, platform, amount, ...).
    pub fields: BTreeMap<String, String>,
    /// Free-form content.
    pub body: String,
}

impl Delivery {
    /// Serialise the payload handed to a helper command.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "channel": self.channel,
            "stem": self.stem,
            "action": self.action,
            "fields": self.fields,
            "body": self.body,
        })
    }
}

/// A delivery transport. The side-effect happens inside `deliver`; it is
/// the commit point for the adapter contract.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the side-effect.
    ///
    /// # Errors
    ///
    /// Transient failures are retried by the router; permanent failures
    /// reject the file.
    async fn deliver(&self, delivery: &Delivery) -> Result<(), Failure>;
}

/// Transport that spawns a helper command and writes the payload to stdin.
///
/// Exit code `0` is success. Exit code `3` is treated as a permanent
/// delivery failure (bad recipient, rejected payload); anything else is
/// transient, matching the component exit-code convention.
#[derive(Debug, Clone)]
pub struct CommandTransport {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandTransport {
    /// Create a transport for the given argv template.
    #[must_use]
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }
}

#[async_trait]
impl Transport for CommandTransport {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), Failure> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(Failure::permanent("empty transport command"));
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Failure::permanent(format!("failed to spawn transport {program}"))
                    .with_source(err)
            })?;

        let payload = delivery.to_json().to_string();
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await.map_err(|err| {
                Failure::transient("failed to write transport payload").with_source(err)
            })?;
            drop(stdin);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Failure::transient(format!(
                    "transport {program} timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|err| Failure::transient("transport wait failed").with_source(err))?;

        match output.status.code() {
            Some(0) => Ok(()),
            Some(3) => Err(Failure::permanent(format!(
                "transport {program} rejected the delivery: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            code => Err(Failure::transient(format!(
                "transport {program} exited {code:?}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

/// Transport that records the delivery in the process log and does nothing.
///
/// Used in dry-run mode and whenever no helper command is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTransport;

#[async_trait]
impl Transport for LoggingTransport {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), Failure> {
        info!(
            channel = delivery.channel,
            stem = %delivery.stem,
            action = %delivery.action,
            "dry-run: delivery logged, no side-effect performed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_transport_always_succeeds() {
        let delivery = Delivery {
            channel: "email",
            stem: "EMAIL_x_20260101000000".to_string(),
            action: "send_email".to_string(),
            fields: BTreeMap::new(),
            body: String::new(),
        };
        assert!(LoggingTransport.deliver(&delivery).await.is_ok());
    }

    #[tokio::test]
    async fn test_command_transport_success_and_failure() {
        let delivery = Delivery {
            channel: "email",
            stem: "EMAIL_x_20260101000000".to_string(),
            action: "send_email".to_string(),
            fields: BTreeMap::new(),
            body: "hello".to_string(),
        };

        let ok = CommandTransport::new(
            vec!["sh".to_string(), "-c".to_string(), "cat > /dev/null".to_string()],
            Duration::from_secs(5),
        );
        assert!(ok.deliver(&delivery).await.is_ok());

        let transient = CommandTransport::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat > /dev/null; exit 1".to_string(),
            ],
            Duration::from_secs(5),
        );
        let err = transient.deliver(&delivery).await.unwrap_err();
        assert!(err.is_retryable());

        let permanent = CommandTransport::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat > /dev/null; exit 3".to_string(),
            ],
            Duration::from_secs(5),
        );
        let err = permanent.deliver(&delivery).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
