//! Multi-raft engine: one independent consensus group per partition.
//!
//! The in-memory message types here are the engine's own view of the RPC
//! surface; `service.rs` and `client.rs` convert them to and from the
//! generated protobuf types at the wire boundary.

use serde_derive::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

pub mod part;
pub mod proposal;
pub mod registry;
mod segment;
pub mod wal;

pub type TermId = u64;
pub type LogIndex = u64;
pub type HostId = u64;

/// Identity of one consensus group: (space, partition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub space_id: i32,
    pub part_id: i32,
}

impl PartitionKey {
    pub fn new(space_id: i32, part_id: i32) -> Self {
        PartitionKey { space_id, part_id }
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.space_id, self.part_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Normal,
    Config,
    NoOp,
}

/// One replicated log record. Index is 1-based and strictly increasing
/// within a group; the payload is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: TermId,
    pub entry_type: EntryType,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    /// Replicates the log but never votes or starts elections.
    Learner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Follower => "FOLLOWER",
            Role::Candidate => "CANDIDATE",
            Role::Leader => "LEADER",
            Role::Learner => "LEARNER",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub candidate_id: HostId,
    pub term: TermId,
    pub last_log_index: LogIndex,
    pub last_log_term: TermId,
}

#[derive(Debug, Clone)]
pub struct VoteResponse {
    pub term: TermId,
    pub granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub leader_id: HostId,
    pub term: TermId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: TermId,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone)]
pub struct AppendResponse {
    pub term: TermId,
    pub success: bool,
    /// Highest index the follower knows matches the leader's log; on
    /// rejection the leader retries from here instead of walking back one
    /// index at a time.
    pub last_match_index: LogIndex,
}

#[derive(Debug, Clone)]
pub struct HeartbeatPing {
    pub leader_id: HostId,
    pub term: TermId,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone)]
pub struct HeartbeatPong {
    pub term: TermId,
    pub last_log_index: LogIndex,
}

#[derive(Debug, Clone)]
pub struct SnapshotChunk {
    pub leader_id: HostId,
    pub term: TermId,
    pub snapshot_index: LogIndex,
    pub snapshot_term: TermId,
    pub offset: u64,
    pub chunk: Vec<u8>,
    pub is_last: bool,
}

#[derive(Debug, Clone)]
pub struct SnapshotAck {
    pub term: TermId,
    pub success: bool,
}

/// Read-only diagnostic view of a part, see `Part::get_state`.
#[derive(Debug, Clone)]
pub struct PartState {
    pub role: Role,
    pub term: TermId,
    pub last_log_index: LogIndex,
    pub commit_index: LogIndex,
    pub leader_id: HostId,
}

/// Callback applied by a part to every committed `Normal` entry, plus the
/// snapshot hooks used for log compaction and catch-up transfer.
pub trait StateMachine: Send {
    fn apply(&mut self, index: u64, data: &[u8]);
    fn snapshot(&self) -> Vec<u8>;
    fn on_snapshot(&mut self, last_index: u64, last_term: u64, data: &[u8]);
}

/// Point-to-point client used by a part to reach its peer replicas. The
/// production implementation is `client::RaftClient`; tests wire parts
/// together with an in-memory implementation.
#[tonic::async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn ask_for_vote(
        &self,
        peer: HostId,
        key: PartitionKey,
        req: VoteRequest,
    ) -> Result<VoteResponse>;

    async fn append_log(
        &self,
        peer: HostId,
        key: PartitionKey,
        req: AppendRequest,
    ) -> Result<AppendResponse>;

    async fn heartbeat(
        &self,
        peer: HostId,
        key: PartitionKey,
        req: HeartbeatPing,
    ) -> Result<HeartbeatPong>;

    async fn send_snapshot(
        &self,
        peer: HostId,
        key: PartitionKey,
        req: SnapshotChunk,
    ) -> Result<SnapshotAck>;
}

pub use part::{Part, PartOptions, Peer};
pub use registry::PartManager;

pub(crate) fn codec_err<E: std::fmt::Display>(e: E) -> RaftError {
    RaftError::Codec(e.to_string())
}
