//! Error types for lamplighter-core operations.

use std::path::PathBuf;

/// All errors that can surface from the presence core.
///
/// Only `ConfigMissing`/`ConfigInvalid` are fatal, and only at startup.
/// Everything else is retried or logged by the caller.
#[derive(Debug, thiserror::Error)]
pub enum LamplighterError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file not found: {0}")]
    ConfigMissing(PathBuf),

    #[error("Configuration invalid: {path}: {details}")]
    ConfigInvalid { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Runtime Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Presence scan unavailable: {0}")]
    ScanUnavailable(String),

    #[error("State store unavailable: {context}: {details}")]
    StoreUnavailable { context: String, details: String },

    #[error("Callback {slot} failed: {details}")]
    Callback { slot: String, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl LamplighterError {
    pub fn store(context: impl Into<String>, details: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            context: context.into(),
            details: details.into(),
        }
    }

    /// Errors the runner recovers from by retrying on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ScanUnavailable(_) | Self::StoreUnavailable { .. } | Self::Callback { .. }
        )
    }
}

/// Convenience type alias for Results using LamplighterError.
pub type Result<T> = std::result::Result<T, LamplighterError>;

impl From<LamplighterError> for String {
    fn from(err: LamplighterError) -> String {
        err.to_string()
    }
}
