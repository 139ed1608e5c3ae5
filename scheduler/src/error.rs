//! Error taxonomy for the scheduler.
//!
//! Recoverable conditions (`NotFound`, `Unavailable`, `NoDownloadSource`,
//! `Timeout`) leave persisted state untouched so the caller can retry.
//! `IntegrityViolation` is attributable to one node and is never retried as
//! a success. `Corrupt` is fatal for one archive only.

use common::NodeRole;
use thiserror::Error;

/// Result type alias using SchedulerError
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },

    /// No eligible node for a tier, with the reason each node was excluded
    #[error(
        "no eligible {role} node: needed {needed}, considered {total}, \
         already cached {already_cached}, disk full {disk_full}"
    )]
    Unavailable {
        role: NodeRole,
        total: usize,
        already_cached: usize,
        disk_full: usize,
        needed: usize,
    },

    #[error("archive {0} has no candidate download source yet")]
    NoDownloadSource(String),

    #[error("dispatch of archive {archive} failed on every node: {message}")]
    DispatchFailed { archive: String, message: String },

    /// Reported block differs from the referee's derivation
    #[error("block {index} mismatch: reported {reported}, expected {expected}")]
    IntegrityViolation {
        index: usize,
        reported: String,
        expected: String,
    },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("archive {archive} corrupt: {reason}")]
    Corrupt { archive: String, reason: String },

    #[error("round {reported} is not the current round")]
    StaleRound { reported: String },

    /// Cache task already in a terminal state
    #[error("cache task {archive}/{node} already finished")]
    TaskFinished { archive: String, node: String },

    /// Validation result already concluded
    #[error("validation result {round}/{node} already finalized")]
    AlreadyFinalized { round: String, node: String },

    #[error("invalid identifier: {0}")]
    InvalidCid(#[from] common::CidError),

    #[error("rpc to {node_id} failed: {message}")]
    Rpc { node_id: String, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl SchedulerError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        SchedulerError::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn rpc(node_id: &str, message: impl std::fmt::Display) -> Self {
        SchedulerError::Rpc {
            node_id: node_id.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether a retry later could succeed without operator action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SchedulerError::NotFound { .. }
                | SchedulerError::Unavailable { .. }
                | SchedulerError::NoDownloadSource(_)
                | SchedulerError::DispatchFailed { .. }
                | SchedulerError::Timeout(_)
                | SchedulerError::Rpc { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_message_has_breakdown() {
        let err = SchedulerError::Unavailable {
            role: NodeRole::Edge,
            total: 10,
            already_cached: 6,
            disk_full: 4,
            needed: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("considered 10"));
        assert!(msg.contains("already cached 6"));
        assert!(msg.contains("disk full 4"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_integrity_violation_not_recoverable() {
        let err = SchedulerError::IntegrityViolation {
            index: 2,
            reported: "a".into(),
            expected: "b".into(),
        };
        assert!(!err.is_recoverable());
    }
}
