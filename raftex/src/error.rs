//! Error types for the raftex service
//!
//! Protocol-level rejections (stale term, log mismatch) are carried inside
//! the RPC responses; this enum covers everything that is an actual failure
//! of the local node or of a peer connection.

use crate::raft::PartitionKey;

pub type Result<T> = std::result::Result<T, RaftError>;

#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionKey),

    #[error("partition {0} already registered")]
    AlreadyExists(PartitionKey),

    #[error("stale term: request {request} < current {current}")]
    StaleTerm { request: u64, current: u64 },

    #[error("log mismatch, last matched index {last_match}")]
    LogMismatch { last_match: u64 },

    #[error("not leader, known leader is {leader}")]
    NotLeader { leader: u64 },

    #[error("wal persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("peer {0} unreachable")]
    PeerUnreachable(u64),

    #[error("worker queue full")]
    Busy,

    #[error("service setup failed: {0}")]
    SetupFailed(String),

    #[error("part is stopped")]
    Stopped,
}

impl RaftError {
    /// True when the condition self-heals through the protocol's own
    /// term/index negotiation or a later retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RaftError::StaleTerm { .. }
                | RaftError::LogMismatch { .. }
                | RaftError::PeerUnreachable(_)
                | RaftError::Busy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RaftError::PeerUnreachable(3).is_transient());
        assert!(RaftError::Busy.is_transient());
        assert!(RaftError::StaleTerm {
            request: 2,
            current: 5
        }
        .is_transient());
        assert!(RaftError::LogMismatch { last_match: 7 }.is_transient());

        assert!(!RaftError::UnknownPartition(PartitionKey::new(1, 1)).is_transient());
        assert!(!RaftError::Stopped.is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        assert!(!RaftError::from(io).is_transient());
    }

    #[test]
    fn test_display_carries_context() {
        let err = RaftError::StaleTerm {
            request: 3,
            current: 8,
        };
        assert_eq!(err.to_string(), "stale term: request 3 < current 8");
        let err = RaftError::UnknownPartition(PartitionKey::new(2, 9));
        assert_eq!(err.to_string(), "unknown partition [2,9]");
    }
}
