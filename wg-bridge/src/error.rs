// Error taxonomy for the control surface

//! Structured errors returned by the control facade
//!
//! Every failure reaching a caller is one of the [`BridgeError`] variants,
//! carrying a stable kind/code and a human-readable message. Backend and
//! plumbing code uses `anyhow` internally; the facade renders those chains
//! into the `reason` fields here.

use crate::wg_config::ConfigParseError;
use thiserror::Error;

/// Result alias for facade operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Coarse classification of a [`BridgeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No usable backend; fatal for the lifetime of the controller
    Initialization,
    /// The platform permission grant is missing
    PermissionDenied,
    /// The backend rejected a transition to UP
    StartFailure,
    /// The backend rejected a transition to DOWN
    StopFailure,
    /// Statistics or state could not be read
    QueryFailure,
    /// Malformed tunnel configuration text
    ParseError,
    /// Malformed request argument (e.g. tunnel name)
    InvalidArgument,
}

/// Errors surfaced by [`TunnelController`](crate::controller::TunnelController)
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Backend initialization failed; no operation can run
    #[error("backend initialization failed: {0}")]
    Initialization(String),

    /// Caller lacks the platform VPN permission
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Starting the tunnel failed
    #[error("failed to start tunnel {name}: {reason}")]
    StartFailure {
        /// Tunnel name
        name: String,
        /// Underlying backend message
        reason: String,
    },

    /// Stopping the tunnel failed
    #[error("failed to stop tunnel {name}: {reason}")]
    StopFailure {
        /// Tunnel name
        name: String,
        /// Underlying backend message
        reason: String,
    },

    /// Querying the tunnel failed
    #[error("failed to query tunnel {name}: {reason}")]
    QueryFailure {
        /// Tunnel name
        name: String,
        /// Underlying backend message
        reason: String,
    },

    /// Configuration text could not be parsed
    #[error("invalid tunnel configuration: {0}")]
    Parse(#[from] ConfigParseError),

    /// A request argument was rejected before reaching the backend
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BridgeError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Initialization(_) => ErrorKind::Initialization,
            BridgeError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            BridgeError::StartFailure { .. } => ErrorKind::StartFailure,
            BridgeError::StopFailure { .. } => ErrorKind::StopFailure,
            BridgeError::QueryFailure { .. } => ErrorKind::QueryFailure,
            BridgeError::Parse(_) => ErrorKind::ParseError,
            BridgeError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Stable error code for channel consumers
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Initialization => "INIT_ERROR",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::StartFailure => "START_ERROR",
            ErrorKind::StopFailure => "STOP_ERROR",
            ErrorKind::QueryFailure => "STATUS_ERROR",
            ErrorKind::ParseError => "CONFIG_ERROR",
            ErrorKind::InvalidArgument => "INVALID_ARGS",
        }
    }

    /// Whether a caller may reasonably retry after fixing the environment
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Initialization)
    }

    pub(crate) fn start(name: &str, err: &anyhow::Error) -> Self {
        BridgeError::StartFailure {
            name: name.to_string(),
            reason: format!("{:#}", err),
        }
    }

    pub(crate) fn stop(name: &str, err: &anyhow::Error) -> Self {
        BridgeError::StopFailure {
            name: name.to_string(),
            reason: format!("{:#}", err),
        }
    }

    pub(crate) fn query(name: &str, err: &anyhow::Error) -> Self {
        BridgeError::QueryFailure {
            name: name.to_string(),
            reason: format!("{:#}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_codes_are_distinct() {
        let errors = vec![
            BridgeError::Initialization("x".into()),
            BridgeError::PermissionDenied("x".into()),
            BridgeError::StartFailure { name: "a".into(), reason: "x".into() },
            BridgeError::StopFailure { name: "a".into(), reason: "x".into() },
            BridgeError::QueryFailure { name: "a".into(), reason: "x".into() },
            BridgeError::InvalidArgument("x".into()),
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_reason_keeps_context_chain() {
        let err = Err::<(), _>(std::io::Error::other("device busy"))
            .context("wg-quick up failed")
            .unwrap_err();
        let bridge = BridgeError::start("home", &err);

        assert_eq!(bridge.kind(), ErrorKind::StartFailure);
        let msg = bridge.to_string();
        assert!(msg.contains("home"));
        assert!(msg.contains("wg-quick up failed"));
        assert!(msg.contains("device busy"));
    }

    #[test]
    fn test_only_initialization_is_fatal() {
        assert!(!BridgeError::Initialization("none".into()).is_recoverable());
        assert!(BridgeError::PermissionDenied("no".into()).is_recoverable());
    }
}
