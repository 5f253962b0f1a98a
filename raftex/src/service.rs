//! gRPC dispatch front for the multi-raft engine.
//!
//! Routes each request to its part by (space, partition). Heartbeats are
//! handled inline on the receiving task so queuing delay can never fake an
//! election timeout; vote, append and snapshot requests may hit WAL I/O and
//! go through the bounded slow-lane pool instead.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::RaftError;
use crate::metrics;
use crate::raft::{
    AppendRequest, EntryType, HeartbeatPing, LogEntry, PartManager, PartitionKey, SnapshotChunk,
    VoteRequest,
};
use crate::worker::WorkerPool;
use pb::raftex_service_server::RaftexService;

/// Protocol buffer definitions for the raftex service
#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raftex");
}

pub struct RaftexServiceSVC {
    parts: Arc<PartManager>,
    workers: Arc<WorkerPool>,
}

impl RaftexServiceSVC {
    pub fn new(parts: Arc<PartManager>, workers: Arc<WorkerPool>) -> Self {
        RaftexServiceSVC { parts, workers }
    }
}

fn error_code(err: &RaftError) -> pb::ErrorCode {
    match err {
        RaftError::UnknownPartition(_) => pb::ErrorCode::EUnknownPart,
        RaftError::StaleTerm { .. } => pb::ErrorCode::EStaleTerm,
        RaftError::LogMismatch { .. } => pb::ErrorCode::ELogGap,
        RaftError::NotLeader { .. } => pb::ErrorCode::ENotLeader,
        RaftError::Persistence(_) | RaftError::Codec(_) => pb::ErrorCode::EPersistFailed,
        RaftError::Busy => pb::ErrorCode::EBusy,
        _ => pb::ErrorCode::EBadRequest,
    }
}

fn entry_from_pb(e: pb::LogEntry) -> LogEntry {
    LogEntry {
        index: e.index,
        term: e.term,
        entry_type: match pb::EntryType::from_i32(e.entry_type) {
            Some(pb::EntryType::Config) => EntryType::Config,
            Some(pb::EntryType::NoOp) => EntryType::NoOp,
            _ => EntryType::Normal,
        },
        payload: e.payload,
    }
}

#[tonic::async_trait]
impl RaftexService for RaftexServiceSVC {
    /// Handled on the worker pool: granting a vote persists it first.
    async fn ask_for_vote(
        &self,
        request: tonic::Request<pb::AskForVoteRequest>,
    ) -> Result<tonic::Response<pb::AskForVoteResponse>, tonic::Status> {
        let parts = Arc::clone(&self.parts);
        let workers = Arc::clone(&self.workers);
        metrics::record_metrics("ask_for_vote", move || async move {
            let req = request.into_inner();
            let key = PartitionKey::new(req.space_id, req.part_id);

            let part = match parts.find_part(key) {
                Some(part) => part,
                None => {
                    return Ok(tonic::Response::new(pb::AskForVoteResponse {
                        error_code: pb::ErrorCode::EUnknownPart as i32,
                        term: 0,
                        vote_granted: false,
                    }));
                }
            };

            let vote_req = VoteRequest {
                candidate_id: req.candidate_id,
                term: req.term,
                last_log_index: req.last_log_index,
                last_log_term: req.last_log_term,
            };

            let (tx, rx) = oneshot::channel();
            let queued = workers.try_execute(async move {
                let _ = tx.send(part.ask_for_vote(vote_req).await);
            });
            if queued.is_err() {
                return Err(tonic::Status::resource_exhausted("worker queue full"));
            }

            let response = match rx.await {
                Ok(Ok(resp)) => pb::AskForVoteResponse {
                    error_code: pb::ErrorCode::Succeeded as i32,
                    term: resp.term,
                    vote_granted: resp.granted,
                },
                Ok(Err(e)) => pb::AskForVoteResponse {
                    error_code: error_code(&e) as i32,
                    term: 0,
                    vote_granted: false,
                },
                Err(_) => return Err(tonic::Status::internal("worker dropped request")),
            };
            Ok(tonic::Response::new(response))
        })
        .await
    }

    /// Handled on the worker pool: appends block on WAL writes.
    async fn append_log(
        &self,
        request: tonic::Request<pb::AppendLogRequest>,
    ) -> Result<tonic::Response<pb::AppendLogResponse>, tonic::Status> {
        let parts = Arc::clone(&self.parts);
        let workers = Arc::clone(&self.workers);
        metrics::record_metrics("append_log", move || async move {
            let req = request.into_inner();
            let key = PartitionKey::new(req.space_id, req.part_id);

            let part = match parts.find_part(key) {
                Some(part) => part,
                None => {
                    return Ok(tonic::Response::new(pb::AppendLogResponse {
                        error_code: pb::ErrorCode::EUnknownPart as i32,
                        term: 0,
                        success: false,
                        last_match_index: 0,
                    }));
                }
            };

            let append_req = AppendRequest {
                leader_id: req.leader_id,
                term: req.term,
                prev_log_index: req.prev_log_index,
                prev_log_term: req.prev_log_term,
                entries: req.entries.into_iter().map(entry_from_pb).collect(),
                leader_commit: req.leader_commit,
            };

            let (tx, rx) = oneshot::channel();
            let queued = workers.try_execute(async move {
                let _ = tx.send(part.append_log(append_req).await);
            });
            if queued.is_err() {
                return Err(tonic::Status::resource_exhausted("worker queue full"));
            }

            let response = match rx.await {
                Ok(Ok(resp)) => pb::AppendLogResponse {
                    error_code: pb::ErrorCode::Succeeded as i32,
                    term: resp.term,
                    success: resp.success,
                    last_match_index: resp.last_match_index,
                },
                Ok(Err(e)) => pb::AppendLogResponse {
                    error_code: error_code(&e) as i32,
                    term: 0,
                    success: false,
                    last_match_index: 0,
                },
                Err(_) => return Err(tonic::Status::internal("worker dropped request")),
            };
            Ok(tonic::Response::new(response))
        })
        .await
    }

    /// Handled inline, never queued: heartbeats must not accumulate
    /// queuing delay behind storage-bound work.
    async fn heartbeat(
        &self,
        request: tonic::Request<pb::HeartbeatRequest>,
    ) -> Result<tonic::Response<pb::HeartbeatResponse>, tonic::Status> {
        let parts = Arc::clone(&self.parts);
        metrics::record_metrics("heartbeat", move || async move {
            let req = request.into_inner();
            let key = PartitionKey::new(req.space_id, req.part_id);

            let part = match parts.find_part(key) {
                Some(part) => part,
                None => {
                    return Ok(tonic::Response::new(pb::HeartbeatResponse {
                        error_code: pb::ErrorCode::EUnknownPart as i32,
                        term: 0,
                        last_log_index: 0,
                    }));
                }
            };

            let ping = HeartbeatPing {
                leader_id: req.leader_id,
                term: req.term,
                leader_commit: req.leader_commit,
            };
            let response = match part.heartbeat(ping).await {
                Ok(pong) => pb::HeartbeatResponse {
                    error_code: pb::ErrorCode::Succeeded as i32,
                    term: pong.term,
                    last_log_index: pong.last_log_index,
                },
                Err(e) => pb::HeartbeatResponse {
                    error_code: error_code(&e) as i32,
                    term: 0,
                    last_log_index: 0,
                },
            };
            Ok(tonic::Response::new(response))
        })
        .await
    }

    /// Handled on the worker pool: installs write the snapshot file.
    async fn send_snapshot(
        &self,
        request: tonic::Request<pb::SendSnapshotRequest>,
    ) -> Result<tonic::Response<pb::SendSnapshotResponse>, tonic::Status> {
        let parts = Arc::clone(&self.parts);
        let workers = Arc::clone(&self.workers);
        metrics::record_metrics("send_snapshot", move || async move {
            let req = request.into_inner();
            let key = PartitionKey::new(req.space_id, req.part_id);

            let part = match parts.find_part(key) {
                Some(part) => part,
                None => {
                    return Ok(tonic::Response::new(pb::SendSnapshotResponse {
                        error_code: pb::ErrorCode::EUnknownPart as i32,
                        term: 0,
                        success: false,
                    }));
                }
            };

            let chunk = SnapshotChunk {
                leader_id: req.leader_id,
                term: req.term,
                snapshot_index: req.snapshot_index,
                snapshot_term: req.snapshot_term,
                offset: req.offset,
                chunk: req.chunk,
                is_last: req.is_last,
            };

            let (tx, rx) = oneshot::channel();
            let queued = workers.try_execute(async move {
                let _ = tx.send(part.install_snapshot(chunk).await);
            });
            if queued.is_err() {
                return Err(tonic::Status::resource_exhausted("worker queue full"));
            }

            let response = match rx.await {
                Ok(Ok(ack)) => pb::SendSnapshotResponse {
                    error_code: pb::ErrorCode::Succeeded as i32,
                    term: ack.term,
                    success: ack.success,
                },
                Ok(Err(e)) => pb::SendSnapshotResponse {
                    error_code: error_code(&e) as i32,
                    term: 0,
                    success: false,
                },
                Err(_) => return Err(tonic::Status::internal("worker dropped request")),
            };
            Ok(tonic::Response::new(response))
        })
        .await
    }

    /// Read-only diagnostic, handled inline.
    async fn get_state(
        &self,
        request: tonic::Request<pb::GetStateRequest>,
    ) -> Result<tonic::Response<pb::GetStateResponse>, tonic::Status> {
        let parts = Arc::clone(&self.parts);
        metrics::record_metrics("get_state", move || async move {
            let req = request.into_inner();
            let key = PartitionKey::new(req.space_id, req.part_id);

            let response = match parts.find_part(key) {
                Some(part) => {
                    let state = part.get_state().await;
                    pb::GetStateResponse {
                        error_code: pb::ErrorCode::Succeeded as i32,
                        role: state.role.as_str().to_string(),
                        term: state.term,
                        last_log_index: state.last_log_index,
                        commit_index: state.commit_index,
                        leader_id: state.leader_id,
                    }
                }
                None => pb::GetStateResponse {
                    error_code: pb::ErrorCode::EUnknownPart as i32,
                    role: String::new(),
                    term: 0,
                    last_log_index: 0,
                    commit_index: 0,
                    leader_id: 0,
                },
            };
            Ok(tonic::Response::new(response))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let key = PartitionKey::new(1, 1);
        assert_eq!(
            error_code(&RaftError::UnknownPartition(key)),
            pb::ErrorCode::EUnknownPart
        );
        assert_eq!(
            error_code(&RaftError::StaleTerm {
                request: 1,
                current: 2
            }),
            pb::ErrorCode::EStaleTerm
        );
        assert_eq!(
            error_code(&RaftError::LogMismatch { last_match: 4 }),
            pb::ErrorCode::ELogGap
        );
        assert_eq!(
            error_code(&RaftError::NotLeader { leader: 2 }),
            pb::ErrorCode::ENotLeader
        );
        assert_eq!(error_code(&RaftError::Busy), pb::ErrorCode::EBusy);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "bad disk");
        assert_eq!(
            error_code(&RaftError::Persistence(io)),
            pb::ErrorCode::EPersistFailed
        );
    }

    #[test]
    fn test_entry_from_pb_defaults_to_normal() {
        let entry = entry_from_pb(pb::LogEntry {
            index: 4,
            term: 2,
            entry_type: 42,
            payload: b"data".to_vec(),
        });
        assert_eq!(entry.entry_type, EntryType::Normal);
        assert_eq!(entry.index, 4);

        let entry = entry_from_pb(pb::LogEntry {
            index: 5,
            term: 2,
            entry_type: pb::EntryType::NoOp as i32,
            payload: Vec::new(),
        });
        assert_eq!(entry.entry_type, EntryType::NoOp);
    }
}
