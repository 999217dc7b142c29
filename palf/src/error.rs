//! Error type of the log engine.
//!
//! Callers classify failures into three buckets:
//!
//! | Bucket | Variants | What to do |
//! |---|---|---|
//! | retryable | `NotLeader`, `NotMaster`, `Timeout`, `Backpressure`, `ConfigChangeInProgress` | retry, possibly elsewhere |
//! | programming | `InvalidArgument`, `AccessModeMismatch`, `OutOfLowerBound`, `EntryNotExist` | fix the call |
//! | fatal | `Io`, `StorageFull`, `Codec`, `StaleIterator` | surface to the operator or reopen |

use crate::types::{AccessMode, GroupId, Lsn};

/// Errors returned by every engine operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PalfError {
    /// An argument violates a precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// This replica is not the reconfirmed leader of the current epoch.
    #[error("not leader")]
    NotLeader,

    /// Leadership transfer refused: not the leader or a transfer is running.
    #[error("not master")]
    NotMaster,

    /// The operation did not complete in the allotted time.
    #[error("operation timed out")]
    Timeout,

    /// Too many uncommitted bytes for a non-blocking append.
    #[error("backpressure: {inflight} bytes in flight, limit {limit}")]
    Backpressure {
        /// Uncommitted bytes at the time of the call.
        inflight: u64,
        /// Configured limit.
        limit: u64,
    },

    /// Another membership or access mode change has not committed yet.
    #[error("config change in progress")]
    ConfigChangeInProgress,

    /// The log storage has no room for the write.
    #[error("storage full: need {needed} bytes, {available} available")]
    StorageFull {
        /// Bytes the write required.
        needed: u64,
        /// Bytes left.
        available: u64,
    },

    /// The storage layer failed.
    #[error("io error: {0}")]
    Io(String),

    /// The iterator position was recycled.
    #[error("stale iterator at {position}, log begins at {begin}")]
    StaleIterator {
        /// Where the iterator stood.
        position: Lsn,
        /// Current begin of the log.
        begin: Lsn,
    },

    /// The requested position lies below everything the log retains.
    #[error("out of lower bound")]
    OutOfLowerBound,

    /// The log has nothing to answer with.
    #[error("entry not exist")]
    EntryNotExist,

    /// The operation is not allowed in the current access mode.
    #[error("access mode mismatch: group is in {current} mode")]
    AccessModeMismatch {
        /// Mode the group is in.
        current: AccessMode,
    },

    /// A peer could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// An engine record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// No replica of this group lives in the env.
    #[error("{0} does not exist")]
    GroupNotExist(GroupId),

    /// The group was already created in the env.
    #[error("{0} already exists")]
    GroupExists(GroupId),
}

impl PalfError {
    /// Whether the same call may succeed later without changing arguments.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PalfError::NotLeader
                | PalfError::NotMaster
                | PalfError::Timeout
                | PalfError::Backpressure { .. }
                | PalfError::ConfigChangeInProgress
                | PalfError::Transport(_)
        )
    }
}

impl From<serde_json::Error> for PalfError {
    fn from(e: serde_json::Error) -> Self {
        PalfError::Codec(e.to_string())
    }
}
