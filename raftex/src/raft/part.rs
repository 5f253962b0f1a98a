//! Per-partition Raft state machine.
//!
//! One `Part` per (space, partition): it owns that partition's WAL, runs
//! leader election and log replication against its peer set, and applies
//! committed entries to the pluggable state machine. Parts are fully
//! independent of each other; all mutable state sits behind one per-part
//! lock and a single tick task drives timers for election, heartbeats and
//! periodic snapshots.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::oneshot;
use tokio::sync::{watch, Mutex};
use tokio::time::{self, Duration, Instant};

use crate::error::{RaftError, Result};
use crate::raft::proposal::Proposal;
use crate::raft::wal::Wal;
use crate::raft::{
    AppendRequest, AppendResponse, EntryType, HeartbeatPing, HeartbeatPong, HostId, LogEntry,
    LogIndex, PartState, PartitionKey, PeerTransport, Role, SnapshotAck, SnapshotChunk,
    StateMachine, TermId, VoteRequest, VoteResponse,
};

const MAX_APPEND_BATCH: usize = 64; // entries per AppendLog
const SNAPSHOT_CHUNK_SIZE: usize = 64 * 1024;
const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_CAP: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
pub struct Peer {
    pub id: HostId,
    pub learner: bool,
}

#[derive(Debug, Clone)]
pub struct PartOptions {
    pub tick_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub snapshot_interval: Duration,
}

impl Default for PartOptions {
    fn default() -> Self {
        PartOptions {
            tick_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(400),
            election_timeout_max: Duration::from_millis(800),
            heartbeat_interval: Duration::from_millis(100),
            snapshot_interval: Duration::from_secs(60),
        }
    }
}

/// Replication bookkeeping for one peer.
struct PeerView {
    learner: bool,
    match_index: LogIndex,
    next_index: LogIndex,
    // At most one append or snapshot transfer in flight per peer
    inflight: bool,
    backoff: Duration,
    next_contact: Instant,
}

impl PeerView {
    fn new(learner: bool, next_index: LogIndex) -> Self {
        PeerView {
            learner,
            match_index: 0,
            next_index,
            inflight: false,
            backoff: Duration::ZERO,
            next_contact: Instant::now(),
        }
    }

    fn bump_backoff(&mut self) {
        self.backoff = if self.backoff.is_zero() {
            BACKOFF_BASE
        } else {
            (self.backoff * 2).min(BACKOFF_CAP)
        };
        self.next_contact = Instant::now() + self.backoff;
    }

    fn reset_backoff(&mut self) {
        self.backoff = Duration::ZERO;
        self.next_contact = Instant::now();
    }
}

struct SnapshotBuffer {
    index: LogIndex,
    term: TermId,
    data: Vec<u8>,
    next_offset: u64,
}

struct Inner {
    role: Role,
    term: TermId,
    voted_for: Option<HostId>,
    leader_id: HostId, // 0 = unknown
    votes_received: HashSet<HostId>,
    wal: Wal,
    commit_index: LogIndex,
    applied_index: LogIndex,
    peers: HashMap<HostId, PeerView>,
    state_machine: Box<dyn StateMachine>,
    election_deadline: Instant,
    last_broadcast: Instant,
    last_snapshot_saved: Instant,
    pending: VecDeque<Proposal>,
    snapshot_buf: Option<SnapshotBuffer>,
}

enum Plan {
    Append {
        peer: HostId,
        req: AppendRequest,
    },
    Ping {
        peer: HostId,
        req: HeartbeatPing,
    },
    Snapshot {
        peer: HostId,
        index: LogIndex,
        term: TermId,
        data: Vec<u8>,
    },
}

pub struct Part {
    key: PartitionKey,
    host_id: HostId,
    opts: PartOptions,
    inner: Mutex<Inner>,
    transport: Arc<dyn PeerTransport>,
    stop_tx: watch::Sender<bool>,
    unhealthy: AtomicBool,
}

impl Part {
    /// Opens (or creates) the part's WAL under `wal_dir` and restores term,
    /// vote and snapshot state. `peers` lists the remote replicas only;
    /// `as_learner` makes this replica non-voting until promoted.
    pub fn new(
        key: PartitionKey,
        host_id: HostId,
        peers: &[Peer],
        as_learner: bool,
        wal_dir: PathBuf,
        transport: Arc<dyn PeerTransport>,
        mut state_machine: Box<dyn StateMachine>,
        opts: PartOptions,
    ) -> Result<Arc<Self>> {
        let wal = Wal::open(wal_dir)?;

        let (snapshot_index, snapshot_term) = wal.snapshot_point();
        if snapshot_index > 0 {
            if let Some((index, term, data)) = wal.read_snapshot()? {
                state_machine.on_snapshot(index, term, &data);
            }
        }

        let next = wal.last_index() + 1;
        let peer_views = peers
            .iter()
            .map(|p| (p.id, PeerView::new(p.learner, next)))
            .collect();

        let now = Instant::now();
        let term = wal.current_term();
        let last_index = wal.last_index();
        let inner = Inner {
            role: if as_learner {
                Role::Learner
            } else {
                Role::Follower
            },
            term,
            voted_for: wal.voted_for(),
            leader_id: 0,
            votes_received: HashSet::new(),
            commit_index: snapshot_index,
            applied_index: snapshot_index,
            wal,
            peers: peer_views,
            state_machine,
            election_deadline: now,
            last_broadcast: now,
            last_snapshot_saved: now,
            pending: VecDeque::new(),
            snapshot_buf: None,
        };
        let (stop_tx, _) = watch::channel(false);
        let part = Arc::new(Part {
            key,
            host_id,
            opts,
            inner: Mutex::new(inner),
            transport,
            stop_tx,
            unhealthy: AtomicBool::new(false),
        });

        log::info!(
            "part {} opened on host {}, term {}, last index {}, snapshot at ({}, {})",
            key,
            host_id,
            term,
            last_index,
            snapshot_index,
            snapshot_term
        );
        Ok(part)
    }

    pub fn key(&self) -> PartitionKey {
        self.key
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::SeqCst)
    }

    /// Spawns the tick task driving election timeouts, leader heartbeats
    /// and periodic snapshot saves. Cancelled by `stop()`.
    pub fn start(self: &Arc<Self>) {
        let part = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            // Start with a randomized election deadline so replicas booted
            // together do not all campaign at once
            {
                let mut inner = part.inner.lock().await;
                part.reset_election_timer(&mut inner);
            }
            let mut ticker = time::interval(part.opts.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => part.on_tick().await,
                    _ = stop_rx.changed() => break,
                }
            }
            log::debug!("part {} tick task stopped", part.key);
        });
    }

    /// Cancels the tick task. In-flight RPCs already holding this part
    /// finish with their original result; no timer fires afterwards.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    // ---- inbound RPC handlers ----

    pub async fn ask_for_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.check_healthy()?;
        let mut inner = self.inner.lock().await;

        if req.term < inner.term {
            return Ok(VoteResponse {
                term: inner.term,
                granted: false,
            });
        }
        if req.term > inner.term {
            self.adopt_term(&mut inner, req.term)?;
        }

        // Learners never vote
        if inner.role == Role::Learner {
            return Ok(VoteResponse {
                term: inner.term,
                granted: false,
            });
        }

        // Log completeness check: never elect a leader missing committed
        // entries
        let log_ok = req.last_log_term > inner.wal.last_term()
            || (req.last_log_term == inner.wal.last_term()
                && req.last_log_index >= inner.wal.last_index());
        let can_vote = inner.voted_for.is_none() || inner.voted_for == Some(req.candidate_id);

        if !(log_ok && can_vote) {
            log::debug!(
                "part {} denied vote to {} at term {}, log_ok {}, voted_for {:?}",
                self.key,
                req.candidate_id,
                req.term,
                log_ok,
                inner.voted_for
            );
            return Ok(VoteResponse {
                term: inner.term,
                granted: false,
            });
        }

        // Persist the vote before responding
        if inner.voted_for != Some(req.candidate_id) {
            inner.voted_for = Some(req.candidate_id);
            let term = inner.term;
            self.persist_hard_state(&mut inner, term, Some(req.candidate_id))?;
        }
        self.reset_election_timer(&mut inner);
        log::info!(
            "part {} granted vote to {} at term {}",
            self.key,
            req.candidate_id,
            inner.term
        );
        Ok(VoteResponse {
            term: inner.term,
            granted: true,
        })
    }

    pub async fn append_log(&self, req: AppendRequest) -> Result<AppendResponse> {
        self.check_healthy()?;
        let mut inner = self.inner.lock().await;

        if req.term < inner.term {
            return Ok(AppendResponse {
                term: inner.term,
                success: false,
                last_match_index: inner.commit_index,
            });
        }
        self.accept_leader(&mut inner, req.term, req.leader_id)?;

        // Log-matching check at the previous index
        if req.prev_log_index > inner.wal.last_index() {
            // Gap: tell the leader where our log actually ends
            return Ok(AppendResponse {
                term: inner.term,
                success: false,
                last_match_index: inner.wal.last_index(),
            });
        }
        match inner.wal.term_of(req.prev_log_index) {
            Some(term) if term == req.prev_log_term => {}
            Some(_) => {
                // Conflicting prefix; everything up to the commit index is
                // known to match
                let last_match = inner.commit_index.min(req.prev_log_index.saturating_sub(1));
                return Ok(AppendResponse {
                    term: inner.term,
                    success: false,
                    last_match_index: last_match,
                });
            }
            None => {
                // prev is below our snapshot point, so it is committed and
                // matched; the entries that still apply are handled below
            }
        }

        let last_new = req
            .entries
            .last()
            .map(|e| e.index)
            .unwrap_or(req.prev_log_index);

        let (snapshot_index, _) = inner.wal.snapshot_point();
        let mut to_append = Vec::new();
        let mut truncated = false;
        for entry in req.entries {
            if entry.index <= snapshot_index {
                continue;
            }
            if truncated {
                to_append.push(entry);
                continue;
            }
            match inner.wal.term_of(entry.index) {
                Some(term) if term == entry.term => {} // already have it
                Some(_) => {
                    // Conflicting uncommitted tail: overwrite from here
                    inner.wal.truncate_from(entry.index)?;
                    truncated = true;
                    to_append.push(entry);
                }
                None => {
                    truncated = true;
                    to_append.push(entry);
                }
            }
        }
        inner.wal.append(&to_append)?;

        if req.leader_commit > inner.commit_index {
            inner.commit_index = req.leader_commit.min(last_new).max(inner.commit_index);
            self.apply_committed(&mut inner);
        }

        Ok(AppendResponse {
            term: inner.term,
            success: true,
            last_match_index: inner.wal.last_index(),
        })
    }

    /// Empty AppendLog variant: asserts leadership and propagates the commit
    /// index. No WAL write unless the term advances.
    pub async fn heartbeat(&self, req: HeartbeatPing) -> Result<HeartbeatPong> {
        self.check_healthy()?;
        let mut inner = self.inner.lock().await;

        if req.term < inner.term {
            return Ok(HeartbeatPong {
                term: inner.term,
                last_log_index: inner.wal.last_index(),
            });
        }
        self.accept_leader(&mut inner, req.term, req.leader_id)?;

        let last = inner.wal.last_index();
        if req.leader_commit > inner.commit_index {
            // Never past what is actually in the local log
            let target = req.leader_commit.min(last);
            if target > inner.commit_index && inner.wal.term_of(target).is_some() {
                inner.commit_index = target;
                self.apply_committed(&mut inner);
            }
        }

        Ok(HeartbeatPong {
            term: inner.term,
            last_log_index: last,
        })
    }

    /// One chunk of a leader-driven snapshot transfer. Chunks are buffered
    /// and only installed atomically on the final one, so a failed transfer
    /// leaves the previous state untouched.
    pub async fn install_snapshot(&self, req: SnapshotChunk) -> Result<SnapshotAck> {
        self.check_healthy()?;
        let mut inner = self.inner.lock().await;

        if req.term < inner.term {
            return Ok(SnapshotAck {
                term: inner.term,
                success: false,
            });
        }
        self.accept_leader(&mut inner, req.term, req.leader_id)?;

        if req.offset == 0 {
            inner.snapshot_buf = Some(SnapshotBuffer {
                index: req.snapshot_index,
                term: req.snapshot_term,
                data: req.chunk,
                next_offset: 0,
            });
            if let Some(buf) = inner.snapshot_buf.as_mut() {
                buf.next_offset = buf.data.len() as u64;
            }
        } else {
            let matches = inner.snapshot_buf.as_ref().map(|b| {
                b.index == req.snapshot_index
                    && b.term == req.snapshot_term
                    && b.next_offset == req.offset
            });
            if matches != Some(true) {
                // Out-of-order or interleaved stream: drop the buffer and
                // make the leader restart the transfer
                inner.snapshot_buf = None;
                return Ok(SnapshotAck {
                    term: inner.term,
                    success: false,
                });
            }
            let buf = inner.snapshot_buf.as_mut().unwrap();
            buf.data.extend_from_slice(&req.chunk);
            buf.next_offset = buf.data.len() as u64;
        }

        if req.is_last {
            let buf = inner.snapshot_buf.take().unwrap();
            inner.wal.install_snapshot(buf.data.clone(), buf.index, buf.term)?;
            inner
                .state_machine
                .on_snapshot(buf.index, buf.term, &buf.data);
            inner.commit_index = inner.commit_index.max(buf.index);
            inner.applied_index = inner.applied_index.max(buf.index);
            log::info!(
                "part {} installed snapshot at index {}, term {}",
                self.key,
                buf.index,
                buf.term
            );
        }

        Ok(SnapshotAck {
            term: inner.term,
            success: true,
        })
    }

    /// Read-only diagnostic; never mutates state.
    pub async fn get_state(&self) -> PartState {
        let inner = self.inner.lock().await;
        PartState {
            role: inner.role,
            term: inner.term,
            last_log_index: inner.wal.last_index(),
            commit_index: inner.commit_index,
            leader_id: inner.leader_id,
        }
    }

    /// Local write path: appends a Normal entry on the leader and resolves
    /// the returned channel once the entry is committed and applied.
    pub async fn propose(
        &self,
        payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<std::result::Result<LogIndex, RaftError>>> {
        self.check_healthy()?;
        if self.is_stopped() {
            return Err(RaftError::Stopped);
        }
        let mut inner = self.inner.lock().await;
        if inner.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: inner.leader_id,
            });
        }

        let index = inner.wal.last_index() + 1;
        let entry = LogEntry {
            index,
            term: inner.term,
            entry_type: EntryType::Normal,
            payload,
        };
        inner.wal.append(&[entry])?;

        let (proposal, rx) = Proposal::new(index);
        inner.pending.push_back(proposal);

        // A single-replica group commits immediately
        self.advance_commit(&mut inner);
        Ok(rx)
    }

    /// Promotes a learner to full voting member. Driven by the external
    /// placement system; there is no internal lag threshold.
    pub async fn promote_learner(&self, peer: HostId) {
        let mut inner = self.inner.lock().await;
        if peer == self.host_id {
            if inner.role == Role::Learner {
                inner.role = Role::Follower;
                self.reset_election_timer(&mut inner);
                log::info!("part {} promoted self to voter", self.key);
            }
            return;
        }
        if let Some(view) = inner.peers.get_mut(&peer) {
            if view.learner {
                view.learner = false;
                log::info!("part {} promoted peer {} to voter", self.key, peer);
            }
        }
    }

    // ---- timers ----

    async fn on_tick(self: &Arc<Self>) {
        if self.is_unhealthy() {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        self.maybe_save_snapshot(&mut inner, now);

        match inner.role {
            Role::Leader => {
                if now >= inner.last_broadcast + self.opts.heartbeat_interval {
                    inner.last_broadcast = now;
                    let plans = self.build_replication_plans(&mut inner, now);
                    drop(inner);
                    self.launch_replication(plans);
                }
            }
            Role::Follower | Role::Candidate => {
                if now >= inner.election_deadline {
                    if let Some((req, voters)) = self.start_election(&mut inner) {
                        // A group with no remote voters wins on its own vote
                        let won = self.maybe_become_leader(&mut inner);
                        let plans = if won {
                            self.build_replication_plans(&mut inner, now)
                        } else {
                            Vec::new()
                        };
                        drop(inner);
                        self.launch_replication(plans);
                        self.launch_vote_requests(req, voters);
                    }
                }
            }
            Role::Learner => {}
        }
    }

    fn reset_election_timer(&self, inner: &mut Inner) {
        let min = self.opts.election_timeout_min.as_millis() as u64;
        let max = self.opts.election_timeout_max.as_millis() as u64;
        let timeout = rand::thread_rng().gen_range(min..=max.max(min));
        inner.election_deadline = Instant::now() + Duration::from_millis(timeout);
    }

    fn maybe_save_snapshot(&self, inner: &mut Inner, now: Instant) {
        if now < inner.last_snapshot_saved + self.opts.snapshot_interval {
            return;
        }
        let (snapshot_index, _) = inner.wal.snapshot_point();
        if inner.applied_index <= snapshot_index {
            return;
        }
        let applied = inner.applied_index;
        let term = inner.wal.term_of(applied).unwrap_or(inner.term);
        let data = inner.state_machine.snapshot();
        match inner.wal.save_snapshot(data, applied, term) {
            Ok(()) => {
                inner.last_snapshot_saved = now;
                log::info!("part {} saved snapshot at index {}", self.key, applied);
            }
            Err(e) => self.on_persist_error(&e),
        }
    }

    // ---- election ----

    fn start_election(&self, inner: &mut Inner) -> Option<(VoteRequest, Vec<HostId>)> {
        inner.term += 1;
        inner.role = Role::Candidate;
        inner.voted_for = Some(self.host_id);
        inner.leader_id = 0;
        inner.votes_received.clear();
        inner.votes_received.insert(self.host_id);

        let term = inner.term;
        if self
            .persist_hard_state(inner, term, Some(self.host_id))
            .is_err()
        {
            return None;
        }
        self.reset_election_timer(inner);

        log::info!("part {} starting election at term {}", self.key, inner.term);

        let req = VoteRequest {
            candidate_id: self.host_id,
            term: inner.term,
            last_log_index: inner.wal.last_index(),
            last_log_term: inner.wal.last_term(),
        };
        let voters = inner
            .peers
            .iter()
            .filter(|(_, v)| !v.learner)
            .map(|(id, _)| *id)
            .collect();
        Some((req, voters))
    }

    fn launch_vote_requests(self: &Arc<Self>, req: VoteRequest, voters: Vec<HostId>) {
        for peer in voters {
            let part = Arc::clone(self);
            let req = req.clone();
            tokio::spawn(async move {
                let term_at_send = req.term;
                match part.transport.ask_for_vote(peer, part.key, req).await {
                    Ok(resp) => part.on_vote_response(term_at_send, peer, resp).await,
                    Err(e) => log::debug!("part {} vote rpc to {} failed: {}", part.key, peer, e),
                }
            });
        }
    }

    async fn on_vote_response(self: &Arc<Self>, term_at_send: TermId, peer: HostId, resp: VoteResponse) {
        let mut inner = self.inner.lock().await;
        if resp.term > inner.term {
            if let Err(e) = self.adopt_term(&mut inner, resp.term) {
                self.on_persist_error(&e);
            }
            return;
        }
        if inner.role != Role::Candidate || inner.term != term_at_send || !resp.granted {
            return;
        }
        inner.votes_received.insert(peer);
        if self.maybe_become_leader(&mut inner) {
            // Assert leadership before any other candidate's timer fires
            let now = Instant::now();
            inner.last_broadcast = now;
            let plans = self.build_replication_plans(&mut inner, now);
            drop(inner);
            self.launch_replication(plans);
        }
    }

    /// Becomes leader once a majority of voting members (self included)
    /// granted their vote in the current term.
    fn maybe_become_leader(&self, inner: &mut Inner) -> bool {
        if inner.role != Role::Candidate {
            return false;
        }
        let voter_total = 1 + inner.peers.values().filter(|v| !v.learner).count();
        if inner.votes_received.len() * 2 <= voter_total {
            return false;
        }

        inner.role = Role::Leader;
        inner.leader_id = self.host_id;
        let next = inner.wal.last_index() + 1;
        for view in inner.peers.values_mut() {
            view.match_index = 0;
            view.next_index = next;
            view.inflight = false;
            view.reset_backoff();
        }

        // No-op entry: entries from prior terms are only committed
        // transitively through an entry of the current term
        let noop = LogEntry {
            index: next,
            term: inner.term,
            entry_type: EntryType::NoOp,
            payload: Vec::new(),
        };
        if let Err(e) = inner.wal.append(&[noop]) {
            self.on_persist_error(&e);
        }

        log::info!("part {} became leader at term {}", self.key, inner.term);
        self.advance_commit(inner);
        true
    }

    // ---- leader-side replication ----

    fn build_replication_plans(&self, inner: &mut Inner, now: Instant) -> Vec<Plan> {
        let term = inner.term;
        let leader_commit = inner.commit_index;
        let last_index = inner.wal.last_index();
        let first_index = inner.wal.first_index();

        let mut snapshot_peers = Vec::new();
        let mut append_peers = Vec::new();
        let mut ping_peers = Vec::new();

        for (&peer, view) in inner.peers.iter_mut() {
            if view.inflight || now < view.next_contact {
                continue;
            }
            if view.next_index < first_index {
                view.inflight = true;
                snapshot_peers.push(peer);
            } else if view.next_index <= last_index {
                view.inflight = true;
                append_peers.push((peer, view.next_index));
            } else {
                ping_peers.push(peer);
            }
        }

        let mut plans = Vec::new();

        if !snapshot_peers.is_empty() {
            match inner.wal.read_snapshot() {
                Ok(Some((index, snap_term, data))) => {
                    for peer in snapshot_peers {
                        plans.push(Plan::Snapshot {
                            peer,
                            index,
                            term: snap_term,
                            data: data.clone(),
                        });
                    }
                }
                Ok(None) => {
                    // Compacted log without a snapshot file should not
                    // happen; release the slots and wait
                    for peer in snapshot_peers {
                        if let Some(view) = inner.peers.get_mut(&peer) {
                            view.inflight = false;
                        }
                    }
                    log::error!("part {} has compacted log but no snapshot", self.key);
                }
                Err(e) => {
                    for peer in snapshot_peers {
                        if let Some(view) = inner.peers.get_mut(&peer) {
                            view.inflight = false;
                        }
                    }
                    self.on_persist_error(&e);
                }
            }
        }

        for (peer, next) in append_peers {
            let prev = next - 1;
            let prev_term = inner.wal.term_of(prev).unwrap_or(0);
            let entries = inner.wal.read_entries(next, last_index, MAX_APPEND_BATCH);
            plans.push(Plan::Append {
                peer,
                req: AppendRequest {
                    leader_id: self.host_id,
                    term,
                    prev_log_index: prev,
                    prev_log_term: prev_term,
                    entries,
                    leader_commit,
                },
            });
        }

        for peer in ping_peers {
            plans.push(Plan::Ping {
                peer,
                req: HeartbeatPing {
                    leader_id: self.host_id,
                    term,
                    leader_commit,
                },
            });
        }

        plans
    }

    fn launch_replication(self: &Arc<Self>, plans: Vec<Plan>) {
        for plan in plans {
            let part = Arc::clone(self);
            tokio::spawn(async move {
                match plan {
                    Plan::Append { peer, req } => {
                        let term_at_send = req.term;
                        let sent_last = req
                            .entries
                            .last()
                            .map(|e| e.index)
                            .unwrap_or(req.prev_log_index);
                        match part.transport.append_log(peer, part.key, req).await {
                            Ok(resp) => {
                                part.on_append_response(peer, term_at_send, sent_last, resp)
                                    .await
                            }
                            Err(e) => part.on_peer_failure(peer, &e).await,
                        }
                    }
                    Plan::Ping { peer, req } => {
                        let term_at_send = req.term;
                        match part.transport.heartbeat(peer, part.key, req).await {
                            Ok(pong) => part.on_heartbeat_pong(peer, term_at_send, pong).await,
                            Err(e) => {
                                log::debug!(
                                    "part {} heartbeat to {} failed: {}",
                                    part.key,
                                    peer,
                                    e
                                );
                            }
                        }
                    }
                    Plan::Snapshot {
                        peer,
                        index,
                        term,
                        data,
                    } => {
                        part.run_snapshot_transfer(peer, index, term, data).await;
                    }
                }
            });
        }
    }

    async fn on_append_response(
        self: &Arc<Self>,
        peer: HostId,
        term_at_send: TermId,
        sent_last: LogIndex,
        resp: AppendResponse,
    ) {
        let mut inner = self.inner.lock().await;

        if resp.term > inner.term {
            if let Some(view) = inner.peers.get_mut(&peer) {
                view.inflight = false;
            }
            if let Err(e) = self.adopt_term(&mut inner, resp.term) {
                self.on_persist_error(&e);
            }
            return;
        }
        if inner.role != Role::Leader || inner.term != term_at_send {
            if let Some(view) = inner.peers.get_mut(&peer) {
                view.inflight = false;
            }
            return;
        }

        let advanced = {
            let view = match inner.peers.get_mut(&peer) {
                Some(v) => v,
                None => return,
            };
            view.inflight = false;
            if resp.success {
                view.reset_backoff();
                view.match_index = view.match_index.max(sent_last);
                view.next_index = view.match_index + 1;
                true
            } else {
                // Log-matching backoff: jump to the follower's reported
                // match point rather than walking back one index at a time
                let fallback = view.next_index.saturating_sub(1).max(1);
                view.next_index = (resp.last_match_index + 1).min(fallback);
                view.bump_backoff();
                false
            }
        };

        if advanced {
            self.advance_commit(&mut inner);
        }
    }

    async fn on_heartbeat_pong(self: &Arc<Self>, peer: HostId, term_at_send: TermId, pong: HeartbeatPong) {
        let mut inner = self.inner.lock().await;
        if pong.term > inner.term {
            if let Err(e) = self.adopt_term(&mut inner, pong.term) {
                self.on_persist_error(&e);
            }
            return;
        }
        if inner.role != Role::Leader || inner.term != term_at_send {
            return;
        }
        // A lagging follower shows up here before any append is rejected
        if let Some(view) = inner.peers.get_mut(&peer) {
            if !view.inflight && pong.last_log_index + 1 < view.next_index {
                view.next_index = pong.last_log_index + 1;
            }
        }
    }

    async fn on_peer_failure(self: &Arc<Self>, peer: HostId, err: &RaftError) {
        if err.is_transient() {
            log::debug!("part {} rpc to peer {} failed: {}", self.key, peer, err);
        } else {
            log::warn!("part {} rpc to peer {} failed: {}", self.key, peer, err);
        }
        let mut inner = self.inner.lock().await;
        if let Some(view) = inner.peers.get_mut(&peer) {
            view.inflight = false;
            view.bump_backoff();
        }
    }

    /// Streams the current snapshot to a peer whose required log prefix has
    /// been compacted away. Runs chunk by chunk; any failure aborts the
    /// transfer and backoff applies, the peer's state is untouched until
    /// the final chunk lands.
    async fn run_snapshot_transfer(
        self: &Arc<Self>,
        peer: HostId,
        index: LogIndex,
        snap_term: TermId,
        data: Vec<u8>,
    ) {
        let term_at_send = {
            let inner = self.inner.lock().await;
            if inner.role != Role::Leader {
                drop(inner);
                self.on_peer_failure(peer, &RaftError::Stopped).await;
                return;
            }
            inner.term
        };

        log::info!(
            "part {} sending snapshot at index {} to peer {}",
            self.key,
            index,
            peer
        );

        let total = data.len();
        let mut offset = 0usize;
        loop {
            let end = (offset + SNAPSHOT_CHUNK_SIZE).min(total);
            let is_last = end == total;
            let req = SnapshotChunk {
                leader_id: self.host_id,
                term: term_at_send,
                snapshot_index: index,
                snapshot_term: snap_term,
                offset: offset as u64,
                chunk: data[offset..end].to_vec(),
                is_last,
            };
            match self.transport.send_snapshot(peer, self.key, req).await {
                Ok(ack) if ack.term > term_at_send => {
                    let mut inner = self.inner.lock().await;
                    if let Some(view) = inner.peers.get_mut(&peer) {
                        view.inflight = false;
                    }
                    if let Err(e) = self.adopt_term(&mut inner, ack.term) {
                        self.on_persist_error(&e);
                    }
                    return;
                }
                Ok(ack) if !ack.success => {
                    self.on_peer_failure(peer, &RaftError::PeerUnreachable(peer))
                        .await;
                    return;
                }
                Ok(_) => {
                    if is_last {
                        break;
                    }
                    offset = end;
                }
                Err(e) => {
                    self.on_peer_failure(peer, &e).await;
                    return;
                }
            }
        }

        let mut inner = self.inner.lock().await;
        if let Some(view) = inner.peers.get_mut(&peer) {
            view.inflight = false;
            view.reset_backoff();
            view.match_index = view.match_index.max(index);
            view.next_index = view.match_index + 1;
        }
        self.advance_commit(&mut inner);
    }

    /// Advances the commit index to the highest index replicated on a
    /// majority of voting members, counting only entries of the leader's
    /// own current term.
    fn advance_commit(&self, inner: &mut Inner) {
        if inner.role != Role::Leader {
            return;
        }
        let mut matches: Vec<LogIndex> = inner
            .peers
            .values()
            .filter(|v| !v.learner)
            .map(|v| v.match_index)
            .collect();
        matches.push(inner.wal.last_index()); // self
        matches.sort_unstable_by(|a, b| b.cmp(a));

        let quorum = matches.len() / 2 + 1;
        let candidate = matches[quorum - 1];
        if candidate > inner.commit_index && inner.wal.term_of(candidate) == Some(inner.term) {
            inner.commit_index = candidate;
            self.apply_committed(inner);
        }
    }

    /// Applies newly committed entries to the state machine, in order, and
    /// resolves any proposals they complete.
    fn apply_committed(&self, inner: &mut Inner) {
        while inner.applied_index < inner.commit_index {
            let index = inner.applied_index + 1;
            let entry = match inner.wal.entry(index) {
                Some(e) => e,
                None => break,
            };
            if entry.entry_type == EntryType::Normal {
                let payload = entry.payload.clone();
                inner.state_machine.apply(index, &payload);
            }
            inner.applied_index = index;
        }

        let applied = inner.applied_index;
        let mut i = 0;
        while i < inner.pending.len() {
            if inner.pending[i].index <= applied {
                if let Some(mut proposal) = inner.pending.remove(i) {
                    if let Some(tx) = proposal.done.take() {
                        let _ = tx.send(Ok(proposal.index));
                    }
                }
            } else {
                i += 1;
            }
        }
    }

    // ---- term & role bookkeeping ----

    /// Adopts a strictly higher term: clears the vote, persists, and steps
    /// down to follower (learners stay learners).
    fn adopt_term(&self, inner: &mut Inner, term: TermId) -> Result<()> {
        debug_assert!(term > inner.term);
        let was_leader = inner.role == Role::Leader;
        inner.term = term;
        inner.voted_for = None;
        inner.votes_received.clear();
        if inner.role != Role::Learner {
            inner.role = Role::Follower;
        }
        if was_leader {
            log::info!("part {} stepping down, new term {}", self.key, term);
            self.fail_pending(inner);
        }
        self.persist_hard_state(inner, term, None)?;
        self.reset_election_timer(inner);
        Ok(())
    }

    /// Common follower-side acceptance of a message from a recognized
    /// leader at `term >= current`.
    fn accept_leader(&self, inner: &mut Inner, term: TermId, leader_id: HostId) -> Result<()> {
        if term > inner.term {
            self.adopt_term(inner, term)?;
        } else if inner.role == Role::Candidate {
            // Same term, an established leader exists: lost this election
            inner.role = Role::Follower;
            inner.votes_received.clear();
        }
        inner.leader_id = leader_id;
        self.reset_election_timer(inner);
        Ok(())
    }

    fn fail_pending(&self, inner: &mut Inner) {
        let leader = inner.leader_id;
        while let Some(mut proposal) = inner.pending.pop_front() {
            if let Some(tx) = proposal.done.take() {
                let _ = tx.send(Err(RaftError::NotLeader { leader }));
            }
        }
    }

    fn persist_hard_state(
        &self,
        inner: &mut Inner,
        term: TermId,
        voted_for: Option<HostId>,
    ) -> Result<()> {
        inner.wal.save_hard_state(term, voted_for).map_err(|e| {
            self.on_persist_error(&e);
            e
        })
    }

    fn check_healthy(&self) -> Result<()> {
        if self.is_unhealthy() {
            return Err(RaftError::Persistence(std::io::Error::new(
                std::io::ErrorKind::Other,
                "part wal is unhealthy",
            )));
        }
        Ok(())
    }

    /// A failed WAL write means this part can no longer acknowledge
    /// anything without risking divergence; it reports itself unhealthy
    /// and stops participating until the operator intervenes.
    fn on_persist_error(&self, err: &RaftError) {
        log::error!("part {} persistence failure: {}", self.key, err);
        if !self.unhealthy.swap(true, Ordering::SeqCst) {
            crate::metrics::UNHEALTHY_PARTS_GAUGE.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Transport for single-part tests: every peer is unreachable.
    struct NullTransport;

    #[tonic::async_trait]
    impl PeerTransport for NullTransport {
        async fn ask_for_vote(
            &self,
            peer: HostId,
            _key: PartitionKey,
            _req: VoteRequest,
        ) -> Result<VoteResponse> {
            Err(RaftError::PeerUnreachable(peer))
        }
        async fn append_log(
            &self,
            peer: HostId,
            _key: PartitionKey,
            _req: AppendRequest,
        ) -> Result<AppendResponse> {
            Err(RaftError::PeerUnreachable(peer))
        }
        async fn heartbeat(
            &self,
            peer: HostId,
            _key: PartitionKey,
            _req: HeartbeatPing,
        ) -> Result<HeartbeatPong> {
            Err(RaftError::PeerUnreachable(peer))
        }
        async fn send_snapshot(
            &self,
            peer: HostId,
            _key: PartitionKey,
            _req: SnapshotChunk,
        ) -> Result<SnapshotAck> {
            Err(RaftError::PeerUnreachable(peer))
        }
    }

    /// Routes RPCs between in-process parts, keyed by host id.
    #[derive(Default)]
    struct LocalTransport {
        parts: StdMutex<HashMap<HostId, Arc<Part>>>,
    }

    impl LocalTransport {
        fn register(&self, host: HostId, part: Arc<Part>) {
            self.parts.lock().unwrap().insert(host, part);
        }

        fn unregister(&self, host: HostId) {
            self.parts.lock().unwrap().remove(&host);
        }

        fn lookup(&self, host: HostId) -> Result<Arc<Part>> {
            self.parts
                .lock()
                .unwrap()
                .get(&host)
                .cloned()
                .ok_or(RaftError::PeerUnreachable(host))
        }
    }

    #[tonic::async_trait]
    impl PeerTransport for LocalTransport {
        async fn ask_for_vote(
            &self,
            peer: HostId,
            _key: PartitionKey,
            req: VoteRequest,
        ) -> Result<VoteResponse> {
            self.lookup(peer)?.ask_for_vote(req).await
        }
        async fn append_log(
            &self,
            peer: HostId,
            _key: PartitionKey,
            req: AppendRequest,
        ) -> Result<AppendResponse> {
            self.lookup(peer)?.append_log(req).await
        }
        async fn heartbeat(
            &self,
            peer: HostId,
            _key: PartitionKey,
            req: HeartbeatPing,
        ) -> Result<HeartbeatPong> {
            self.lookup(peer)?.heartbeat(req).await
        }
        async fn send_snapshot(
            &self,
            peer: HostId,
            _key: PartitionKey,
            req: SnapshotChunk,
        ) -> Result<SnapshotAck> {
            self.lookup(peer)?.install_snapshot(req).await
        }
    }

    /// Records applied entries; snapshots are the bincoded applied list.
    #[derive(Clone, Default)]
    struct TestSm {
        applied: Arc<StdMutex<Vec<(u64, Vec<u8>)>>>,
    }

    impl StateMachine for TestSm {
        fn apply(&mut self, index: u64, data: &[u8]) {
            self.applied.lock().unwrap().push((index, data.to_vec()));
        }
        fn snapshot(&self) -> Vec<u8> {
            bincode::serialize(&*self.applied.lock().unwrap()).unwrap()
        }
        fn on_snapshot(&mut self, _last_index: u64, _last_term: u64, data: &[u8]) {
            if !data.is_empty() {
                *self.applied.lock().unwrap() = bincode::deserialize(data).unwrap();
            }
        }
    }

    fn test_key() -> PartitionKey {
        PartitionKey::new(1, 1)
    }

    fn solo_part(dir: &TempDir, peers: &[Peer]) -> (Arc<Part>, TestSm) {
        let sm = TestSm::default();
        let part = Part::new(
            test_key(),
            1,
            peers,
            false,
            dir.path().to_path_buf(),
            Arc::new(NullTransport),
            Box::new(sm.clone()),
            PartOptions::default(),
        )
        .unwrap();
        (part, sm)
    }

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<LogEntry> {
        range
            .map(|i| LogEntry {
                index: i,
                term,
                entry_type: EntryType::Normal,
                payload: format!("e{}", i).into_bytes(),
            })
            .collect()
    }

    fn append_req(
        leader: u64,
        term: u64,
        prev: (u64, u64),
        entries: Vec<LogEntry>,
        commit: u64,
    ) -> AppendRequest {
        AppendRequest {
            leader_id: leader,
            term,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit: commit,
        }
    }

    #[tokio::test]
    async fn test_vote_granted_once_per_term() {
        let dir = TempDir::new().unwrap();
        let (part, _) = solo_part(&dir, &[Peer { id: 2, learner: false }]);

        let resp = part
            .ask_for_vote(VoteRequest {
                candidate_id: 2,
                term: 1,
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(resp.granted);
        assert_eq!(resp.term, 1);

        // Same term, different candidate: denied
        let resp = part
            .ask_for_vote(VoteRequest {
                candidate_id: 3,
                term: 1,
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(!resp.granted);

        // Re-vote for the same candidate is idempotent
        let resp = part
            .ask_for_vote(VoteRequest {
                candidate_id: 2,
                term: 1,
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(resp.granted);
    }

    #[tokio::test]
    async fn test_vote_denied_for_incomplete_log() {
        let dir = TempDir::new().unwrap();
        let (part, _) = solo_part(&dir, &[Peer { id: 2, learner: false }]);

        // Local log ends at (index 6, term 2)
        let resp = part
            .append_log(append_req(9, 2, (0, 0), entries(1..=6, 2), 0))
            .await
            .unwrap();
        assert!(resp.success);

        // Candidate at (5, 2) is behind: deny
        let resp = part
            .ask_for_vote(VoteRequest {
                candidate_id: 2,
                term: 3,
                last_log_index: 5,
                last_log_term: 2,
            })
            .await
            .unwrap();
        assert!(!resp.granted);

        // Candidate at (6, 2) is complete: grant
        let resp = part
            .ask_for_vote(VoteRequest {
                candidate_id: 3,
                term: 4,
                last_log_index: 6,
                last_log_term: 2,
            })
            .await
            .unwrap();
        assert!(resp.granted);
    }

    #[tokio::test]
    async fn test_stale_term_rejected() {
        let dir = TempDir::new().unwrap();
        let (part, _) = solo_part(&dir, &[Peer { id: 2, learner: false }]);

        let resp = part
            .append_log(append_req(9, 5, (0, 0), entries(1..=1, 5), 0))
            .await
            .unwrap();
        assert!(resp.success);

        let resp = part
            .append_log(append_req(8, 4, (0, 0), entries(1..=1, 4), 0))
            .await
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.term, 5);

        let resp = part
            .ask_for_vote(VoteRequest {
                candidate_id: 7,
                term: 4,
                last_log_index: 10,
                last_log_term: 4,
            })
            .await
            .unwrap();
        assert!(!resp.granted);
        assert_eq!(resp.term, 5);
    }

    #[tokio::test]
    async fn test_conflicting_tail_truncated() {
        let dir = TempDir::new().unwrap();
        let (part, sm) = solo_part(&dir, &[Peer { id: 2, learner: false }]);

        let resp = part
            .append_log(append_req(9, 1, (0, 0), entries(1..=3, 1), 1))
            .await
            .unwrap();
        assert!(resp.success);

        // Higher-term leader overwrites the uncommitted tail at 2..3
        let resp = part
            .append_log(append_req(8, 2, (1, 1), entries(2..=4, 2), 4))
            .await
            .unwrap();
        assert!(resp.success);

        let state = part.get_state().await;
        assert_eq!(state.last_log_index, 4);
        assert_eq!(state.commit_index, 4);

        let applied = sm.applied.lock().unwrap();
        let indexes: Vec<u64> = applied.iter().map(|(i, _)| *i).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_heartbeat_and_append_backoff_scenario() {
        // Follower log ends at index 8, term 3; leader has commit 10
        let dir = TempDir::new().unwrap();
        let (part, _) = solo_part(&dir, &[Peer { id: 2, learner: false }]);

        let resp = part
            .append_log(append_req(9, 3, (0, 0), entries(1..=8, 3), 8))
            .await
            .unwrap();
        assert!(resp.success);

        // Heartbeat cannot advance commit past the local log
        let pong = part
            .heartbeat(HeartbeatPing {
                leader_id: 9,
                term: 3,
                leader_commit: 10,
            })
            .await
            .unwrap();
        assert_eq!(pong.last_log_index, 8);
        assert_eq!(part.get_state().await.commit_index, 8);

        // Append with prev 9 has a gap: rejected, reporting last match 8
        let resp = part
            .append_log(append_req(9, 3, (9, 3), entries(10..=10, 3), 10))
            .await
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.last_match_index, 8);

        // Leader retries from index 9: accepted, commit advances to 10
        let resp = part
            .append_log(append_req(9, 3, (8, 3), entries(9..=10, 3), 10))
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(part.get_state().await.commit_index, 10);
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let (part, _) = solo_part(&dir, &[Peer { id: 2, learner: false }]);

        let resp = part
            .append_log(append_req(9, 1, (0, 0), entries(1..=5, 1), 5))
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(part.get_state().await.commit_index, 5);

        // A lagging leader_commit never lowers the commit index
        let pong = part
            .heartbeat(HeartbeatPing {
                leader_id: 9,
                term: 1,
                leader_commit: 3,
            })
            .await
            .unwrap();
        assert_eq!(pong.term, 1);
        assert_eq!(part.get_state().await.commit_index, 5);
    }

    #[tokio::test]
    async fn test_vote_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let (part, _) = solo_part(&dir, &[Peer { id: 2, learner: false }]);
            let resp = part
                .ask_for_vote(VoteRequest {
                    candidate_id: 2,
                    term: 7,
                    last_log_index: 0,
                    last_log_term: 0,
                })
                .await
                .unwrap();
            assert!(resp.granted);
        }

        // After a crash and reopen the vote must hold
        let (part, _) = solo_part(&dir, &[Peer { id: 2, learner: false }]);
        let resp = part
            .ask_for_vote(VoteRequest {
                candidate_id: 3,
                term: 7,
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(!resp.granted);
    }

    #[tokio::test]
    async fn test_learner_never_votes() {
        let dir = TempDir::new().unwrap();
        let sm = TestSm::default();
        let part = Part::new(
            test_key(),
            1,
            &[Peer { id: 2, learner: false }],
            true,
            dir.path().to_path_buf(),
            Arc::new(NullTransport),
            Box::new(sm),
            PartOptions::default(),
        )
        .unwrap();

        let resp = part
            .ask_for_vote(VoteRequest {
                candidate_id: 2,
                term: 1,
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(!resp.granted);
        assert_eq!(part.get_state().await.role, Role::Learner);

        // Replication still reaches the learner
        let resp = part
            .append_log(append_req(2, 1, (0, 0), entries(1..=2, 1), 2))
            .await
            .unwrap();
        assert!(resp.success);

        part.promote_learner(1).await;
        assert_eq!(part.get_state().await.role, Role::Follower);
    }

    #[tokio::test]
    async fn test_snapshot_install_roundtrip() {
        // Part A applies 1..=6 directly
        let dir_a = TempDir::new().unwrap();
        let (part_a, sm_a) = solo_part(&dir_a, &[Peer { id: 2, learner: false }]);
        let resp = part_a
            .append_log(append_req(9, 1, (0, 0), entries(1..=6, 1), 6))
            .await
            .unwrap();
        assert!(resp.success);

        // Part B gets a snapshot at (4, 1), then replays 5..=6
        let snapshot_state: Vec<(u64, Vec<u8>)> = sm_a
            .applied
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| *i <= 4)
            .cloned()
            .collect();
        let image = bincode::serialize(&snapshot_state).unwrap();

        let dir_b = TempDir::new().unwrap();
        let (part_b, sm_b) = solo_part(&dir_b, &[Peer { id: 2, learner: false }]);

        // Chunked transfer, two pieces
        let mid = image.len() / 2;
        let ack = part_b
            .install_snapshot(SnapshotChunk {
                leader_id: 9,
                term: 1,
                snapshot_index: 4,
                snapshot_term: 1,
                offset: 0,
                chunk: image[..mid].to_vec(),
                is_last: false,
            })
            .await
            .unwrap();
        assert!(ack.success);
        let ack = part_b
            .install_snapshot(SnapshotChunk {
                leader_id: 9,
                term: 1,
                snapshot_index: 4,
                snapshot_term: 1,
                offset: mid as u64,
                chunk: image[mid..].to_vec(),
                is_last: true,
            })
            .await
            .unwrap();
        assert!(ack.success);

        let state = part_b.get_state().await;
        assert_eq!(state.commit_index, 4);
        assert_eq!(state.last_log_index, 4);

        // Resume replication from index 5
        let resp = part_b
            .append_log(append_req(9, 1, (4, 1), entries(5..=6, 1), 6))
            .await
            .unwrap();
        assert!(resp.success);

        assert_eq!(&*sm_a.applied.lock().unwrap(), &*sm_b.applied.lock().unwrap());
    }

    #[tokio::test]
    async fn test_out_of_order_snapshot_chunk_restarts_transfer() {
        let dir = TempDir::new().unwrap();
        let (part, _) = solo_part(&dir, &[Peer { id: 2, learner: false }]);

        let ack = part
            .install_snapshot(SnapshotChunk {
                leader_id: 9,
                term: 1,
                snapshot_index: 4,
                snapshot_term: 1,
                offset: 100, // never started at 0
                chunk: vec![1, 2, 3],
                is_last: false,
            })
            .await
            .unwrap();
        assert!(!ack.success);
        // Prior state untouched
        assert_eq!(part.get_state().await.last_log_index, 0);
    }

    fn cluster_opts() -> PartOptions {
        PartOptions {
            tick_interval: Duration::from_millis(10),
            election_timeout_min: Duration::from_millis(100),
            election_timeout_max: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(30),
            snapshot_interval: Duration::from_secs(3600),
        }
    }

    async fn spawn_cluster(
        transport: &Arc<LocalTransport>,
        dirs: &[TempDir; 3],
    ) -> Vec<(Arc<Part>, TestSm)> {
        let hosts: Vec<HostId> = vec![1, 2, 3];
        let mut parts = Vec::new();
        for (i, &host) in hosts.iter().enumerate() {
            let peers: Vec<Peer> = hosts
                .iter()
                .filter(|&&h| h != host)
                .map(|&h| Peer {
                    id: h,
                    learner: false,
                })
                .collect();
            let sm = TestSm::default();
            let part = Part::new(
                test_key(),
                host,
                &peers,
                false,
                dirs[i].path().to_path_buf(),
                Arc::clone(transport) as Arc<dyn PeerTransport>,
                Box::new(sm.clone()),
                cluster_opts(),
            )
            .unwrap();
            transport.register(host, Arc::clone(&part));
            part.start();
            parts.push((part, sm));
        }
        parts
    }

    async fn wait_for_leader(parts: &[(Arc<Part>, TestSm)]) -> usize {
        for _ in 0..200 {
            time::sleep(Duration::from_millis(20)).await;
            for (i, (part, _)) in parts.iter().enumerate() {
                if part.get_state().await.role == Role::Leader {
                    return i;
                }
            }
        }
        panic!("no leader elected");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_node_election_single_leader() {
        let transport = Arc::new(LocalTransport::default());
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let parts = spawn_cluster(&transport, &dirs).await;

        wait_for_leader(&parts).await;
        time::sleep(Duration::from_millis(200)).await;

        // Election safety: at most one leader per term
        let mut leaders_by_term: HashMap<TermId, usize> = HashMap::new();
        for (part, _) in &parts {
            let state = part.get_state().await;
            if state.role == Role::Leader {
                *leaders_by_term.entry(state.term).or_default() += 1;
            }
        }
        assert!(leaders_by_term.values().all(|&n| n == 1));
        assert_eq!(leaders_by_term.values().sum::<usize>(), 1);

        for (part, _) in &parts {
            part.stop();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_node_replication_and_failover() {
        let transport = Arc::new(LocalTransport::default());
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let parts = spawn_cluster(&transport, &dirs).await;

        let leader_idx = wait_for_leader(&parts).await;
        let (leader, _) = &parts[leader_idx];

        let rx = leader.propose(b"hello".to_vec()).await.unwrap();
        let index = rx.await.unwrap().unwrap();

        // Wait until every replica applied the entry
        for _ in 0..100 {
            time::sleep(Duration::from_millis(20)).await;
            let mut done = true;
            for (_, sm) in &parts {
                if !sm
                    .applied
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|(i, d)| *i == index && d == b"hello")
                {
                    done = false;
                }
            }
            if done {
                break;
            }
        }
        for (_, sm) in &parts {
            assert!(sm
                .applied
                .lock()
                .unwrap()
                .iter()
                .any(|(i, d)| *i == index && d == b"hello"));
        }

        // Kill the leader; leader completeness: the next leader must hold
        // the committed entry
        let leader_host = leader.get_state().await.leader_id;
        leader.stop();
        transport.unregister(leader_host);

        let survivors: Vec<(Arc<Part>, TestSm)> = parts
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != leader_idx)
            .map(|(_, p)| p.clone())
            .collect();
        let new_leader_idx = wait_for_leader(&survivors).await;
        let (new_leader, new_sm) = &survivors[new_leader_idx];

        let state = new_leader.get_state().await;
        assert!(state.last_log_index >= index);
        assert!(new_sm
            .applied
            .lock()
            .unwrap()
            .iter()
            .any(|(i, d)| *i == index && d == b"hello"));

        for (part, _) in &parts {
            part.stop();
        }
    }

    #[tokio::test]
    async fn test_propose_rejected_on_follower() {
        let dir = TempDir::new().unwrap();
        let (part, _) = solo_part(&dir, &[Peer { id: 2, learner: false }]);

        match part.propose(b"x".to_vec()).await {
            Err(RaftError::NotLeader { .. }) => {}
            other => panic!("expected NotLeader, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_log_matching_after_random_overwrites() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        // Two followers fed the same final leader history through different
        // randomized divergence histories must end byte-identical
        let mut rng = StdRng::seed_from_u64(0x7af7);
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let (part_a, _) = solo_part(&dir_a, &[Peer { id: 2, learner: false }]);
        let (part_b, _) = solo_part(&dir_b, &[Peer { id: 2, learner: false }]);

        // B accumulates stale tails of random length at increasing terms,
        // each one truncating and overwriting the previous
        for term in 1..=4u64 {
            let len: u64 = rng.gen_range(1..=8);
            let resp = part_b
                .append_log(append_req(7, term, (0, 0), entries(1..=len, term), 0))
                .await
                .unwrap();
            assert!(resp.success);
        }

        // The term-9 leader history lands on both
        for part in [&part_a, &part_b] {
            let resp = part
                .append_log(append_req(9, 9, (0, 0), entries(1..=8, 9), 0))
                .await
                .unwrap();
            assert!(resp.success);
        }

        let a = part_a.get_state().await;
        let b = part_b.get_state().await;
        assert_eq!(a.last_log_index, b.last_log_index);

        let inner_a = part_a.inner.lock().await;
        let inner_b = part_b.inner.lock().await;
        for i in 1..=8u64 {
            assert_eq!(inner_a.wal.entry(i), inner_b.wal.entry(i));
        }
    }

    /// Forces the atomic hard-state write to fail by squatting a directory
    /// on its temp path.
    fn break_hard_state_writes(dir: &TempDir) {
        std::fs::create_dir(dir.path().join("hardstate.tmp")).unwrap();
    }

    #[tokio::test]
    async fn test_persistence_failure_marks_part_unhealthy() {
        let dir = TempDir::new().unwrap();
        let (part, _) = solo_part(&dir, &[Peer { id: 2, learner: false }]);

        let resp = part
            .append_log(append_req(9, 1, (0, 0), entries(1..=5, 1), 3))
            .await
            .unwrap();
        assert!(resp.success);
        assert!(!part.is_unhealthy());

        break_hard_state_writes(&dir);

        // A higher-term vote request needs a hard-state write, which fails
        let result = part
            .ask_for_vote(VoteRequest {
                candidate_id: 2,
                term: 9,
                last_log_index: 5,
                last_log_term: 1,
            })
            .await;
        assert!(result.is_err());
        assert!(part.is_unhealthy());

        // Nothing is acknowledged afterwards
        assert!(part
            .append_log(append_req(9, 9, (5, 1), entries(6..=6, 9), 5))
            .await
            .is_err());
        assert!(part
            .ask_for_vote(VoteRequest {
                candidate_id: 2,
                term: 10,
                last_log_index: 5,
                last_log_term: 1,
            })
            .await
            .is_err());
        assert!(part.propose(b"x".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_unhealthy_part_does_not_advance_commit_on_heartbeat() {
        let dir = TempDir::new().unwrap();
        let (part, sm) = solo_part(&dir, &[Peer { id: 2, learner: false }]);

        let resp = part
            .append_log(append_req(9, 1, (0, 0), entries(1..=5, 1), 3))
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(part.get_state().await.commit_index, 3);

        break_hard_state_writes(&dir);
        let _ = part
            .ask_for_vote(VoteRequest {
                candidate_id: 2,
                term: 9,
                last_log_index: 5,
                last_log_term: 1,
            })
            .await;
        assert!(part.is_unhealthy());

        // Heartbeats are refused too; commit and applied state stay put
        assert!(part
            .heartbeat(HeartbeatPing {
                leader_id: 9,
                term: 9,
                leader_commit: 5,
            })
            .await
            .is_err());
        assert_eq!(part.get_state().await.commit_index, 3);
        assert_eq!(sm.applied.lock().unwrap().len(), 3);
    }
}
