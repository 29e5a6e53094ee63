use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the tickvault workspace.
///
/// This wraps argument validation errors, provider-tagged failures, timeouts,
/// persistence problems, and cooperative-cancellation signals. Variants carry
/// only owned strings so errors can be cloned, compared, and persisted into
/// execution history.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VaultError {
    /// The requested operation is not implemented by the target provider.
    #[error("unsupported operation: {operation}")]
    Unsupported {
        /// Operation label describing what was requested (e.g. "depth/option").
        operation: String,
    },

    /// Invalid input argument (bad config value, malformed cron, unknown zone).
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Issues with received or expected data (missing fields, bad payload).
    #[error("data issue: {0}")]
    Data(String),

    /// An individual provider returned an error.
    #[error("{provider} failed: {msg}")]
    Provider {
        /// Provider name that failed.
        provider: String,
        /// Human-readable error message.
        msg: String,
    },

    /// A resource, symbol, schedule, or execution could not be found.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing resource, e.g. "schedule daily-maintenance".
        what: String,
    },

    /// A provider call exceeded the configured per-call timeout.
    #[error("provider timed out: {operation} via {provider}")]
    ProviderTimeout {
        /// Provider name that timed out.
        provider: String,
        /// Operation label (e.g. "subscribe-trades").
        operation: String,
    },

    /// A transient condition (network, busy provider) worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Persistence failure (archive write, state file, claim file).
    #[error("storage failure: {0}")]
    Storage(String),

    /// The operation was cancelled cooperatively.
    #[error("cancelled")]
    Cancelled,

    /// Unknown/opaque error.
    #[error("unknown error: {0}")]
    Other(String),
}

impl VaultError {
    /// Helper: build an `Unsupported` error for an operation label.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Helper: build an `InvalidArg` error.
    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::InvalidArg(msg.into())
    }

    /// Helper: build a `Provider` error with the provider name and message.
    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            msg: msg.into(),
        }
    }

    /// Helper: build a `NotFound` error for a description of the missing resource.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Helper: build a `ProviderTimeout` error.
    pub fn provider_timeout(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::ProviderTimeout {
            provider: provider.into(),
            operation: operation.into(),
        }
    }

    /// Helper: build a `Transient` error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Helper: build a `Storage` error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether the job engine should retry an execution that failed with this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::ProviderTimeout { .. })
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
