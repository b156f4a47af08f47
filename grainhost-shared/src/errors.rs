//! Error types for grainhost.
//!
//! Every variant carries owned strings so errors are `Clone`. A failed start is
//! delivered to the caller that issued it and to every caller waiting on it, so
//! the same error value must be handed out more than once.

use thiserror::Error;

/// Result alias used across grainhost crates.
pub type GrainhostResult<T> = Result<T, GrainhostError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrainhostError {
    /// The external start operation failed for a grain.
    #[error("failed to start container for grain {grain_id}: {reason}")]
    StartFailed { grain_id: String, reason: String },

    /// The caller's own context was cancelled.
    #[error("operation canceled: {0}")]
    Canceled(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Spawning or signalling a container process failed.
    #[error("engine error: {0}")]
    Engine(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GrainhostError {
    /// Build a `StartFailed` from anything displayable.
    pub fn start_failed(grain_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::StartFailed {
            grain_id: grain_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }
}
