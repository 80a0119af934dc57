//! Error taxonomy for the placement engine.
//!
//! A rate-limited placement is not an error; it is a successful
//! [`PlacementOutcome`](crate::engine::PlacementOutcome) without `placed_at`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::store::StoreError;

/// Machine-readable classification of a [`PlacementError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Transient,
    Unavailable,
}

impl ErrorKind {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a public engine operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("identity not found: {0}")]
    NotFound(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl PlacementError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlacementError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PlacementError::NotFound(_) => ErrorKind::NotFound,
            PlacementError::Transient(_) => ErrorKind::Transient,
            PlacementError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            PlacementError::InvalidArgument(m)
            | PlacementError::NotFound(m)
            | PlacementError::Transient(m)
            | PlacementError::Unavailable(m) => m,
        }
    }

    /// Rebuild an error from its wire form.
    pub fn from_parts(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::InvalidArgument => PlacementError::InvalidArgument(message),
            ErrorKind::NotFound => PlacementError::NotFound(message),
            ErrorKind::Transient => PlacementError::Transient(message),
            ErrorKind::Unavailable => PlacementError::Unavailable(message),
        }
    }

    pub(crate) fn lock_timeout(what: impl fmt::Display) -> Self {
        PlacementError::Transient(format!("timed out waiting for {what}"))
    }
}

impl From<StoreError> for PlacementError {
    fn from(e: StoreError) -> Self {
        PlacementError::Unavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = PlacementError::InvalidArgument("out of bounds".into());
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.message(), "out of bounds");
        assert_eq!(err.to_string(), "invalid argument: out of bounds");
    }

    #[test]
    fn test_from_parts_roundtrip() {
        for kind in [
            ErrorKind::InvalidArgument,
            ErrorKind::NotFound,
            ErrorKind::Transient,
            ErrorKind::Unavailable,
        ] {
            let err = PlacementError::from_parts(kind, "msg");
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Unavailable.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InvalidArgument).unwrap();
        assert_eq!(json, "\"invalid_argument\"");
    }
}
