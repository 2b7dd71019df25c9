//! Error types for IdeaForge.
//!
//! Library crates use [`IdeaForgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all IdeaForge operations.
#[derive(Debug, thiserror::Error)]
pub enum IdeaForgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Retryable provider failure (transport error, timeout, 429, 5xx).
    #[error("transient error from {provider}: {message}")]
    TransientProvider { provider: String, message: String },

    /// Non-retryable provider failure, surfaced to the caller as-is.
    #[error("permanent error from {provider}: {message}")]
    PermanentProvider { provider: String, message: String },

    /// A single generated object failed the idea schema.
    #[error("schema validation error: {message}")]
    SchemaValidation { message: String },

    /// A reservation would push the ledger past its cap.
    #[error("budget exceeded for {provider}: requested {requested:.4}, remaining {remaining:.4}")]
    BudgetExceeded {
        provider: String,
        requested: f64,
        remaining: f64,
    },

    /// Generator output could not be parsed, even after repair.
    #[error("malformed output: {message}")]
    MalformedOutput { message: String },

    /// Synthesis for a batch exhausted its attempts.
    #[error("synthesis failed for batch {batch_id}: {reason}")]
    SynthesisFailed { batch_id: String, reason: String },

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad input, unknown id, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, IdeaForgeError>;

impl IdeaForgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a malformed-output error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedOutput {
            message: msg.into(),
        }
    }

    /// Create a transient provider error.
    pub fn transient(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TransientProvider {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a permanent provider error.
    pub fn permanent(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PermanentProvider {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientProvider { .. })
    }
}
