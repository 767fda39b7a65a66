//! Error taxonomy for the marker core.
//!
//! Ambiguous position matches are not errors: the matcher resolves them by
//! distance and id and logs the decision.

use crate::types::TerritoryId;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MarkerError {
    /// Persisted store read/write failed.
    #[error("storage unavailable for territory {territory}: {message}")]
    StorageUnavailable {
        territory: TerritoryId,
        message: String,
    },
    /// Remote server rejected the operation by policy. Not retried.
    #[error("permission denied: {operation}")]
    PermissionDenied { operation: String },
    #[error("remote error: {message}")]
    Remote { message: String },
    #[error("timed out: {operation}")]
    Timeout { operation: String },
    /// A territory was found in a state no code path should leave it in.
    #[error("invalid state for territory {territory}: {message}")]
    InvalidState {
        territory: TerritoryId,
        message: String,
    },
    /// Rejected before touching the territory, e.g. a non-finite position.
    #[error("invalid input for territory {territory}: {message}")]
    InvalidInput {
        territory: TerritoryId,
        message: String,
    },
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl MarkerError {
    pub fn storage(territory: TerritoryId, message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            territory,
            message: message.into(),
        }
    }

    pub fn permission_denied(operation: impl Into<String>) -> Self {
        Self::PermissionDenied {
            operation: operation.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn invalid_state(territory: TerritoryId, message: impl Into<String>) -> Self {
        Self::InvalidState {
            territory,
            message: message.into(),
        }
    }

    pub fn invalid_input(territory: TerritoryId, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            territory,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}

pub type MarkerResult<T> = Result<T, MarkerError>;

impl From<config::ConfigError> for MarkerError {
    fn from(value: config::ConfigError) -> Self {
        MarkerError::config(value.to_string())
    }
}
