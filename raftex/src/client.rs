//! Peer transport implementation
//!
//! This module sends raft RPCs to peer hosts over gRPC. Connections are
//! established lazily per peer and dropped on failure so the next attempt
//! reconnects; the engine's retry/backoff pacing lives in the parts, not
//! here.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tonic::transport::Channel;

use crate::config;
use crate::error::{RaftError, Result};
use crate::raft::{
    AppendRequest, AppendResponse, HeartbeatPing, HeartbeatPong, HostId, PartitionKey,
    PeerTransport, SnapshotAck, SnapshotChunk, VoteRequest, VoteResponse,
};
use pb::raftex_service_client::RaftexServiceClient;

/// Protocol buffer definitions for the raftex service
#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raftex");
}

pub struct RaftClient {
    peers: Mutex<HashMap<HostId, RaftexServiceClient<Channel>>>,
}

impl RaftClient {
    pub fn new() -> RaftClient {
        RaftClient {
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a cached channel to the peer, connecting on first use.
    async fn client_for(&self, peer: HostId) -> Result<RaftexServiceClient<Channel>> {
        let mut peers = self.peers.lock().await;
        if let Some(client) = peers.get(&peer) {
            return Ok(client.clone());
        }

        let addr = config::instance()
            .lock()
            .unwrap()
            .addr_of(peer)
            .ok_or(RaftError::PeerUnreachable(peer))?;
        match RaftexServiceClient::connect(addr).await {
            Ok(client) => {
                peers.insert(peer, client.clone());
                Ok(client)
            }
            Err(e) => {
                log::debug!("failed to connect to peer {}: {}", peer, e);
                Err(RaftError::PeerUnreachable(peer))
            }
        }
    }

    /// Drops the cached channel so the next call reconnects.
    async fn invalidate(&self, peer: HostId) {
        self.peers.lock().await.remove(&peer);
    }
}

impl Default for RaftClient {
    fn default() -> Self {
        RaftClient::new()
    }
}

fn entry_to_pb(e: &crate::raft::LogEntry) -> pb::LogEntry {
    pb::LogEntry {
        index: e.index,
        term: e.term,
        entry_type: match e.entry_type {
            crate::raft::EntryType::Normal => pb::EntryType::Normal as i32,
            crate::raft::EntryType::Config => pb::EntryType::Config as i32,
            crate::raft::EntryType::NoOp => pb::EntryType::NoOp as i32,
        },
        payload: e.payload.clone(),
    }
}

#[tonic::async_trait]
impl PeerTransport for RaftClient {
    async fn ask_for_vote(
        &self,
        peer: HostId,
        key: PartitionKey,
        req: VoteRequest,
    ) -> Result<VoteResponse> {
        let mut client = self.client_for(peer).await?;
        let request = pb::AskForVoteRequest {
            space_id: key.space_id,
            part_id: key.part_id,
            candidate_id: req.candidate_id,
            term: req.term,
            last_log_index: req.last_log_index,
            last_log_term: req.last_log_term,
        };
        match client.ask_for_vote(request).await {
            Ok(resp) => {
                let resp = resp.into_inner();
                Ok(VoteResponse {
                    term: resp.term,
                    granted: resp.vote_granted,
                })
            }
            Err(e) => {
                log::debug!("ask_for_vote to peer {} failed: {}", peer, e);
                self.invalidate(peer).await;
                Err(RaftError::PeerUnreachable(peer))
            }
        }
    }

    async fn append_log(
        &self,
        peer: HostId,
        key: PartitionKey,
        req: AppendRequest,
    ) -> Result<AppendResponse> {
        let mut client = self.client_for(peer).await?;
        let request = pb::AppendLogRequest {
            space_id: key.space_id,
            part_id: key.part_id,
            leader_id: req.leader_id,
            term: req.term,
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries: req.entries.iter().map(entry_to_pb).collect(),
            leader_commit: req.leader_commit,
        };
        match client.append_log(request).await {
            Ok(resp) => {
                let resp = resp.into_inner();
                Ok(AppendResponse {
                    term: resp.term,
                    success: resp.success,
                    last_match_index: resp.last_match_index,
                })
            }
            Err(e) => {
                log::debug!("append_log to peer {} failed: {}", peer, e);
                self.invalidate(peer).await;
                Err(RaftError::PeerUnreachable(peer))
            }
        }
    }

    async fn heartbeat(
        &self,
        peer: HostId,
        key: PartitionKey,
        req: HeartbeatPing,
    ) -> Result<HeartbeatPong> {
        let mut client = self.client_for(peer).await?;
        let request = pb::HeartbeatRequest {
            space_id: key.space_id,
            part_id: key.part_id,
            leader_id: req.leader_id,
            term: req.term,
            leader_commit: req.leader_commit,
        };
        match client.heartbeat(request).await {
            Ok(resp) => {
                let resp = resp.into_inner();
                Ok(HeartbeatPong {
                    term: resp.term,
                    last_log_index: resp.last_log_index,
                })
            }
            Err(e) => {
                log::debug!("heartbeat to peer {} failed: {}", peer, e);
                self.invalidate(peer).await;
                Err(RaftError::PeerUnreachable(peer))
            }
        }
    }

    async fn send_snapshot(
        &self,
        peer: HostId,
        key: PartitionKey,
        req: SnapshotChunk,
    ) -> Result<SnapshotAck> {
        let mut client = self.client_for(peer).await?;
        let request = pb::SendSnapshotRequest {
            space_id: key.space_id,
            part_id: key.part_id,
            leader_id: req.leader_id,
            term: req.term,
            snapshot_index: req.snapshot_index,
            snapshot_term: req.snapshot_term,
            offset: req.offset,
            chunk: req.chunk,
            is_last: req.is_last,
        };
        match client.send_snapshot(request).await {
            Ok(resp) => {
                let resp = resp.into_inner();
                Ok(SnapshotAck {
                    term: resp.term,
                    success: resp.success,
                })
            }
            Err(e) => {
                log::debug!("send_snapshot to peer {} failed: {}", peer, e);
                self.invalidate(peer).await;
                Err(RaftError::PeerUnreachable(peer))
            }
        }
    }
}
