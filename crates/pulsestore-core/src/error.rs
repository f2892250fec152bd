//! Error types for PulseStore operations
//!
//! Store adapters report [`StoreError`]. The engine wraps those in
//! [`PulseError`], which separates the recoverable cases (a relation write
//! the caller may retry) from the alert-worthy ones (a compensation that
//! could not be completed) and from startup failures (bad configuration).

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{RelationKind, UserId};

/// Which side of the engine a store error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Fast,
    Durable,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Fast => f.write_str("fast store"),
            StoreKind::Durable => f.write_str("durable store"),
        }
    }
}

/// Failure reported by a fast-store or durable-store adapter.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the command
    #[error("{store} unavailable: {message}")]
    Unavailable {
        store: StoreKind,
        message: String,
    },

    /// The call did not complete within the configured timeout
    #[error("{store} timed out during {op}")]
    Timeout {
        store: StoreKind,
        op: &'static str,
    },

    /// A uniqueness constraint rejected the write
    #[error("duplicate {what}")]
    Duplicate { what: String },

    /// Stored data could not be decoded
    #[error("{store} returned corrupt data: {message}")]
    Corrupt {
        store: StoreKind,
        message: String,
    },
}

impl StoreError {
    pub fn unavailable(store: StoreKind, message: impl Into<String>) -> Self {
        StoreError::Unavailable { store, message: message.into() }
    }

    /// Transient failures are expected to succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. } | StoreError::Timeout { .. })
    }
}

/// Configuration rejected at startup.
#[derive(Debug, Clone, Error)]
#[error("invalid configuration: {field} {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self { field, reason: reason.into() }
    }
}

/// Repair journal I/O and decoding failures.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error in {}: {message}", path.display())]
    Io {
        path: PathBuf,
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("journal record at offset {offset} failed checksum: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("journal record at offset {offset} is malformed: {reason}")]
    Malformed { offset: u64, reason: String },
}

impl JournalError {
    pub(crate) fn io(path: &std::path::Path, err: std::io::Error, what: &str) -> Self {
        JournalError::Io {
            path: path.to_path_buf(),
            kind: err.kind(),
            message: format!("{what}: {err}"),
        }
    }
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum PulseError {
    /// A store call failed; recoverable from the caller's point of view
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A rollback after a partial dual write could not be completed.
    /// The fast-store mirror for this pair may be wrong until the next sweep.
    #[error("compensation failed for {kind} {actor}->{target} after {attempts} attempts: {source}")]
    Compensation {
        kind: RelationKind,
        actor: UserId,
        target: i64,
        attempts: u32,
        source: StoreError,
    },

    #[error("invalid relation: {0}")]
    InvalidRelation(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    /// A background job thread could not be started
    #[error("failed to spawn job {name}: {message}")]
    JobSpawn { name: String, message: String },
}

impl PulseError {
    /// True for the failure class that warrants an alert.
    pub fn is_compensation_failure(&self) -> bool {
        matches!(self, PulseError::Compensation { .. })
    }
}

/// Result type alias for engine operations
pub type PulseResult<T> = Result<T, PulseError>;

/// Result type alias for adapter operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Timeout { store: StoreKind::Fast, op: "hash_increment" };
        let display = err.to_string();
        assert!(display.contains("fast store"));
        assert!(display.contains("hash_increment"));
        assert!(err.is_transient());
        assert!(!StoreError::Duplicate { what: "edge".into() }.is_transient());
    }

    #[test]
    fn test_store_error_converts_into_pulse_error() {
        let err: PulseError = StoreError::unavailable(StoreKind::Durable, "down").into();
        match err {
            PulseError::Store(StoreError::Unavailable { store, .. }) => {
                assert_eq!(store, StoreKind::Durable)
            }
            other => panic!("Expected store error, got {other:?}"),
        }
    }

    #[test]
    fn test_compensation_is_flagged() {
        let err = PulseError::Compensation {
            kind: RelationKind::FollowsUser,
            actor: 1,
            target: 2,
            attempts: 3,
            source: StoreError::unavailable(StoreKind::Fast, "gone"),
        };
        assert!(err.is_compensation_failure());
        assert!(err.to_string().contains("after 3 attempts"));
    }
}
