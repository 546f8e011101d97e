//! Error types for backplane-core

use crate::types::Capability;
use std::time::Duration;
use thiserror::Error;

/// The closed error taxonomy every public operation resolves to.
///
/// Adapter-level failures are normalized to [`BackplaneError::Adapter`] at
/// the registry/facade boundary; the core never branches on provider-specific
/// error content.
#[derive(Error, Debug, Clone)]
pub enum BackplaneError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider '{0}' is unhealthy")]
    Unhealthy(String),

    #[error("a migration is already in progress for capability '{0}'")]
    MigrationInProgress(Capability),

    #[error("migration target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("circuit open for provider '{0}'")]
    CircuitOpen(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BackplaneError {
    /// Stable lower-case label for this error kind, used in operation events
    /// and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unhealthy(_) => "unhealthy",
            Self::MigrationInProgress(_) => "migration_in_progress",
            Self::TargetUnavailable(_) => "target_unavailable",
            Self::VerificationFailed(_) => "verification_failed",
            Self::Cancelled => "cancelled",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Timeout(_) => "timeout",
            Self::Adapter(_) => "adapter_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Whether the facade may transparently retry an attempt that failed
    /// with this error. Only transient outcomes qualify; everything else
    /// surfaces to the caller on first occurrence.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Adapter(_))
    }
}

pub type BackplaneResult<T> = Result<T, BackplaneError>;
