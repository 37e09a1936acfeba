//! Failure taxonomy shared by every component.
//!
//! The system distinguishes five kinds of failure, and every recovery policy
//! keys off the kind rather than the concrete error:
//!
//! | Kind | Policy |
//! |---|---|
//! | `Transient` | backoff + retry; on exhaustion defer in place |
//! | `Permanent` | emit an `URGENT_` note, stop the source, open the breaker |
//! | `Policy` | move to `Rejected/` with an error sibling; no retry |
//! | `Integrity` | quarantine to `Rejected/`; log; continue |
//! | `Fatal` | exit non-zero; the external supervisor restarts |

use std::fmt;

/// Classification of a failure, driving the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Temporary, retryable failure (network timeout, 5xx, rate-limited).
    Transient,
    /// Permanent source failure (auth, schema mismatch, parse error).
    Permanent,
    /// Handbook rule violation (expired approval, over threshold).
    Policy,
    /// Vault inconsistency (stem collision, unreadable preamble).
    Integrity,
    /// Unrecoverable process-level failure (vault root missing).
    Fatal,
}

impl FailureKind {
    /// Whether a failure of this kind may be retried.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Process exit code for a failure of this kind.
    ///
    /// `0` success, `1` transient failure, `2` configuration error,
    /// `3` permanent source error.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Transient => 1,
            Self::Permanent => 3,
            Self::Policy | Self::Integrity | Self::Fatal => 2,
        }
    }

    /// Short lowercase label used in log records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Policy => "policy",
            Self::Integrity => "integrity",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure with optional underlying cause.
///
/// Components that cross a recovery boundary (watcher source calls, adapter
/// dispatches) wrap their errors in `Failure` so the caller can select the
/// right policy without downcasting.
#[derive(Debug, thiserror::Error)]
#[error("{kind} failure: {message}")]
pub struct Failure {
    /// Classification driving the recovery policy.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
    /// Underlying cause, if any.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Failure {
    /// Create a failure with the given kind and message.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient (retryable) failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// Create a permanent source failure.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    /// Create a policy violation failure.
    #[must_use]
    pub fn policy(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Policy, message)
    }

    /// Create an integrity failure.
    #[must_use]
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Integrity, message)
    }

    /// Create a fatal failure.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Whether this failure may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_retryability() {
        assert!(FailureKind::Transient.is_retryable());
        assert!(!FailureKind::Permanent.is_retryable());
        assert!(!FailureKind::Policy.is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(FailureKind::Transient.exit_code(), 1);
        assert_eq!(FailureKind::Fatal.exit_code(), 2);
        assert_eq!(FailureKind::Permanent.exit_code(), 3);
    }

    #[test]
    fn test_failure_display_includes_kind() {
        let failure = Failure::transient("connection reset");
        let rendered = failure.to_string();
        assert!(rendered.contains("transient"));
        assert!(rendered.contains("connection reset"));
    }

    #[test]
    fn test_failure_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let failure = Failure::transient("poll failed").with_source(io);
        assert!(std::error::Error::source(&failure).is_some());
    }
}
