use crate::config::RaftSettings;
use crate::error::{RaftError, RaftResult};
use crate::replicator::log_store::{LogChange, LogStore};
use crate::replicator::merge::MergePolicy;
use crate::replicator::message::*;
use crate::replicator::state_machine::{SharedState, TouchedKeys};
use crate::replicator::storage::{HardState, RaftStorage};
use crate::types::*;
use chrono::Utc;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerProgress {
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    pub in_flight: bool,
}

#[derive(Debug)]
enum RoleState {
    Follower,
    Candidate { votes: BTreeSet<NodeId> },
    Leader { progress: BTreeMap<NodeId, PeerProgress> },
}

#[derive(Debug, Clone)]
pub enum Outbound {
    Vote {
        to: NodeId,
        request: VoteRequest,
    },
    Heartbeat {
        to: NodeId,
        request: HeartbeatRequest,
    },
    Replicate {
        to: NodeId,
        request: ReplicateCommandRequest,
    },
    Sync {
        to: NodeId,
        request: SyncStateRequest,
    },
}

impl Outbound {
    pub fn to(&self) -> &NodeId {
        match self {
            Outbound::Vote { to, .. }
            | Outbound::Heartbeat { to, .. }
            | Outbound::Replicate { to, .. }
            | Outbound::Sync { to, .. } => to,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppliedEntry {
    pub index: LogIndex,
    pub term: Term,
    pub result: CommandResult,
}

/// Work produced by a core step: messages to send and entries just applied.
#[derive(Debug, Default)]
pub struct Ready {
    pub messages: Vec<Outbound>,
    pub applied: Vec<AppliedEntry>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.applied.is_empty()
    }

    pub fn extend(&mut self, other: Ready) {
        self.messages.extend(other.messages);
        self.applied.extend(other.applied);
    }
}

/// One replica's consensus state. Every method is a single serialized step;
/// the caller owns the clock and the network.
pub struct RaftCore {
    id: NodeId,
    peers: Vec<NodeId>,
    settings: RaftSettings,
    policy: MergePolicy,
    storage: Box<dyn RaftStorage>,
    state: SharedState,

    role: RoleState,
    term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    log: LogStore,
    commit_index: LogIndex,
    unsaved: TouchedKeys,

    election_deadline: Instant,
    heartbeat_due: Instant,
    sync_in_flight: Option<LogIndex>,
}

impl RaftCore {
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        settings: RaftSettings,
        policy: MergePolicy,
        storage: Box<dyn RaftStorage>,
        state: SharedState,
        now: Instant,
    ) -> RaftResult<Self> {
        let hard_state = storage.load_hard_state()?;
        let log = LogStore::from_entries(storage.load_log()?);
        let saved = storage.load_state()?.unwrap_or_default();
        if saved.last_applied > log.last_index() {
            return Err(RaftError::Storage(format!(
                "state snapshot applied through {} but log ends at {}",
                saved.last_applied,
                log.last_index()
            )));
        }
        let commit_index = saved.last_applied;
        state.restore(saved);

        info!(
            "Raft core {} starting at term {} with {} log entries (applied through {})",
            id,
            hard_state.current_term,
            log.len(),
            commit_index
        );

        let mut core = Self {
            id,
            peers,
            settings,
            policy,
            storage,
            state,
            role: RoleState::Follower,
            term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            leader_id: None,
            log,
            commit_index,
            unsaved: TouchedKeys::default(),
            election_deadline: now,
            heartbeat_due: now,
            sync_in_flight: None,
        };
        core.reset_election_deadline(now);
        Ok(core)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn role(&self) -> Role {
        match self.role {
            RoleState::Follower => Role::Follower,
            RoleState::Candidate { .. } => Role::Candidate,
            RoleState::Leader { .. } => Role::Leader,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, RoleState::Leader { .. })
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state.last_applied()
    }

    pub fn log(&self) -> &LogStore {
        &self.log
    }

    pub fn peer_progress(&self, peer: &str) -> Option<PeerProgress> {
        match &self.role {
            RoleState::Leader { progress } => progress.get(peer).copied(),
            _ => None,
        }
    }

    pub fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            node_id: self.id.clone(),
            role: self.role(),
            term: self.term,
            leader_id: self.leader_id.clone(),
            voted_for: self.voted_for.clone(),
            commit_index: self.commit_index,
            last_applied: self.state.last_applied(),
            log_length: self.log.last_index(),
        }
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn reset_election_deadline(&mut self, now: Instant) {
        let min = self.settings.election_timeout_min_ms;
        let max = self.settings.election_timeout_max_ms.max(min);
        let timeout = rand::thread_rng().gen_range(min..=max);
        self.election_deadline = now + Duration::from_millis(timeout);
    }

    fn persist_hard_state(&mut self) -> RaftResult<()> {
        self.storage.save_hard_state(&HardState {
            current_term: self.term,
            voted_for: self.voted_for.clone(),
        })
    }

    /// Moves to a newer term as a follower with no vote cast and no known leader.
    fn adopt_term(&mut self, term: Term, now: Instant) -> RaftResult<()> {
        debug_assert!(term > self.term);
        let was_leader = self.is_leader();
        info!(
            "{} observed term {} (was {} in term {}), stepping down",
            self.id,
            term,
            self.role(),
            self.term
        );
        self.term = term;
        self.voted_for = None;
        self.leader_id = None;
        self.role = RoleState::Follower;
        self.persist_hard_state()?;
        if was_leader {
            self.reset_election_deadline(now);
        }
        Ok(())
    }

    pub fn tick(&mut self, now: Instant) -> RaftResult<Ready> {
        let mut ready = Ready::default();
        if self.is_leader() {
            if now >= self.heartbeat_due {
                self.heartbeat_due = now + self.settings.heartbeat_interval();
                self.broadcast(&mut ready);
            }
        } else if now >= self.election_deadline {
            ready = self.start_election(now)?;
        }
        Ok(ready)
    }

    pub fn start_election(&mut self, now: Instant) -> RaftResult<Ready> {
        self.term += 1;
        self.voted_for = Some(self.id.clone());
        self.leader_id = None;
        let mut votes = BTreeSet::new();
        votes.insert(self.id.clone());
        self.role = RoleState::Candidate { votes };
        self.persist_hard_state()?;
        self.reset_election_deadline(now);

        info!("{} starting election for term {}", self.id, self.term);

        let mut ready = Ready::default();
        if self.quorum() == 1 {
            self.become_leader(now, &mut ready)?;
            return Ok(ready);
        }

        let request = VoteRequest {
            candidate_id: self.id.clone(),
            term: self.term,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in &self.peers {
            ready.messages.push(Outbound::Vote {
                to: peer.clone(),
                request: request.clone(),
            });
        }
        Ok(ready)
    }

    pub fn handle_request_vote(&mut self, req: VoteRequest, now: Instant) -> RaftResult<VoteResponse> {
        if req.term < self.term {
            return Ok(VoteResponse {
                term: self.term,
                vote_granted: false,
            });
        }
        if req.term > self.term {
            self.adopt_term(req.term, now)?;
        }

        let up_to_date =
            (req.last_log_term, req.last_log_index) >= (self.log.last_term(), self.log.last_index());
        let free_to_vote = match &self.voted_for {
            None => true,
            Some(candidate) => *candidate == req.candidate_id,
        };

        let vote_granted = free_to_vote && up_to_date;
        if vote_granted {
            self.voted_for = Some(req.candidate_id.clone());
            self.persist_hard_state()?;
            self.reset_election_deadline(now);
            debug!("{} granted vote to {} for term {}", self.id, req.candidate_id, self.term);
        } else {
            debug!(
                "{} refused vote to {} for term {} (voted_for={:?}, up_to_date={})",
                self.id, req.candidate_id, self.term, self.voted_for, up_to_date
            );
        }

        Ok(VoteResponse {
            term: self.term,
            vote_granted,
        })
    }

    pub fn handle_vote_response(
        &mut self,
        from: &NodeId,
        resp: VoteResponse,
        now: Instant,
    ) -> RaftResult<Ready> {
        let mut ready = Ready::default();
        if resp.term > self.term {
            self.adopt_term(resp.term, now)?;
            return Ok(ready);
        }
        if resp.term != self.term || !resp.vote_granted {
            return Ok(ready);
        }

        let quorum = self.quorum();
        let won = match &mut self.role {
            RoleState::Candidate { votes } => {
                votes.insert(from.clone());
                votes.len() >= quorum
            }
            _ => false,
        };
        if won {
            self.become_leader(now, &mut ready)?;
        }
        Ok(ready)
    }

    fn become_leader(&mut self, now: Instant, ready: &mut Ready) -> RaftResult<()> {
        let next_index = self.log.last_index() + 1;
        let progress = self
            .peers
            .iter()
            .map(|peer| {
                (
                    peer.clone(),
                    PeerProgress {
                        next_index,
                        match_index: 0,
                        in_flight: false,
                    },
                )
            })
            .collect();
        self.role = RoleState::Leader { progress };
        self.leader_id = Some(self.id.clone());
        self.sync_in_flight = None;

        info!("{} became leader for term {}", self.id, self.term);

        let noop = LogEntry::new(self.term, next_index, Command::Noop, Utc::now());
        if let Err(e) = self.append_local(noop) {
            self.role = RoleState::Follower;
            self.leader_id = None;
            return Err(e);
        }

        self.heartbeat_due = now + self.settings.heartbeat_interval();
        self.broadcast(ready);
        self.advance_commit(ready)
    }

    fn append_local(&mut self, entry: LogEntry) -> RaftResult<()> {
        self.storage.apply_log_change(&LogChange {
            truncated_from: None,
            appended: vec![entry.clone()],
        })?;
        self.log.append(entry);
        Ok(())
    }

    /// Appends `command` to the leader's log and starts replicating it.
    /// Returns the index and term the entry must commit at.
    pub fn propose(&mut self, command: Command, now: Instant) -> RaftResult<(LogIndex, Term, Ready)> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_id: self.leader_id.clone(),
                leader_addr: None,
            });
        }

        let index = self.log.last_index() + 1;
        let term = self.term;
        debug!("{} proposing {} at index {} term {}", self.id, command.name(), index, term);
        self.append_local(LogEntry::new(term, index, command, Utc::now()))?;

        let mut ready = Ready::default();
        for peer in self.peers.clone() {
            self.replicate_to(&peer, true, &mut ready);
        }
        self.heartbeat_due = now + self.settings.heartbeat_interval();
        self.advance_commit(&mut ready)?;
        Ok((index, term, ready))
    }

    fn broadcast(&mut self, ready: &mut Ready) {
        for peer in self.peers.clone() {
            self.replicate_to(&peer, false, ready);
        }
    }

    fn replicate_to(&mut self, peer: &NodeId, fast_path: bool, ready: &mut Ready) {
        let RoleState::Leader { progress } = &mut self.role else {
            return;
        };
        let Some(p) = progress.get_mut(peer) else {
            return;
        };
        if p.in_flight {
            return;
        }
        p.in_flight = true;

        let prev_log_index = p.next_index - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self
            .log
            .entries_from(p.next_index, self.settings.max_entries_per_message);

        let message = if fast_path && entries.len() == 1 {
            Outbound::Replicate {
                to: peer.clone(),
                request: ReplicateCommandRequest {
                    leader_id: self.id.clone(),
                    term: self.term,
                    prev_log_index,
                    prev_log_term,
                    entry: entries[0].clone(),
                    commit_index: self.commit_index,
                },
            }
        } else {
            Outbound::Heartbeat {
                to: peer.clone(),
                request: HeartbeatRequest {
                    leader_id: self.id.clone(),
                    term: self.term,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    commit_index: self.commit_index,
                },
            }
        };
        ready.messages.push(message);
    }

    pub fn handle_heartbeat_response(
        &mut self,
        peer: &NodeId,
        sent_term: Term,
        resp: HeartbeatResponse,
        now: Instant,
    ) -> RaftResult<Ready> {
        let mut ready = Ready::default();
        if resp.term > self.term {
            self.adopt_term(resp.term, now)?;
            return Ok(ready);
        }
        if sent_term != self.term {
            return Ok(ready);
        }

        let last_index = self.log.last_index();
        let RoleState::Leader { progress } = &mut self.role else {
            return Ok(ready);
        };
        let Some(p) = progress.get_mut(peer) else {
            return Ok(ready);
        };
        p.in_flight = false;

        if resp.success {
            p.match_index = p.match_index.max(resp.match_index);
            p.next_index = p.match_index + 1;
            let behind = p.next_index <= last_index;
            self.advance_commit(&mut ready)?;
            if behind {
                self.replicate_to(peer, false, &mut ready);
            }
        } else {
            p.next_index = p
                .next_index
                .saturating_sub(1)
                .min(resp.last_log_index + 1)
                .max(1);
            debug!(
                "{} log mismatch on {}, backing off to next_index {}",
                self.id, peer, p.next_index
            );
            self.replicate_to(peer, false, &mut ready);
        }
        Ok(ready)
    }

    /// An RPC to `peer` failed or timed out. The peer is simply behind; the
    /// next heartbeat round retries.
    pub fn handle_peer_failure(&mut self, peer: &NodeId, sent_term: Term) {
        if sent_term != self.term {
            return;
        }
        if let RoleState::Leader { progress } = &mut self.role {
            if let Some(p) = progress.get_mut(peer) {
                p.in_flight = false;
            }
        }
    }

    fn advance_commit(&mut self, ready: &mut Ready) -> RaftResult<()> {
        let RoleState::Leader { progress } = &self.role else {
            return Ok(());
        };
        let mut matched: Vec<LogIndex> = progress.values().map(|p| p.match_index).collect();
        matched.push(self.log.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[self.quorum() - 1];
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.term) {
            debug!("{} advancing commit index {} -> {}", self.id, self.commit_index, candidate);
            self.commit_index = candidate;
            self.apply_committed(ready)?;
        }
        Ok(())
    }

    fn apply_committed(&mut self, ready: &mut Ready) -> RaftResult<()> {
        let mut last_applied = self.state.last_applied();
        if last_applied >= self.commit_index {
            return Ok(());
        }

        while last_applied < self.commit_index {
            let entry = self.log.get_entry(last_applied + 1).cloned().ok_or_else(|| {
                RaftError::Storage(format!("committed entry {} missing from log", last_applied + 1))
            })?;
            let result = self.state.apply(&entry, self.policy);
            self.unsaved.record(&entry);
            debug!(
                "{} applied {} at index {}: {}",
                self.id,
                entry.command.name(),
                entry.index,
                result.message
            );
            ready.applied.push(AppliedEntry {
                index: entry.index,
                term: entry.term,
                result,
            });
            last_applied = entry.index;
        }

        let change = self.state.read(|state| state.change_for(&self.unsaved));
        self.storage.apply_state_change(&change)?;
        self.unsaved = TouchedKeys::default();
        Ok(())
    }

    pub fn handle_heartbeat(
        &mut self,
        req: HeartbeatRequest,
        now: Instant,
    ) -> RaftResult<(HeartbeatResponse, Ready)> {
        let mut ready = Ready::default();
        if req.term < self.term {
            return Ok((self.heartbeat_reply(false, 0), ready));
        }
        if req.term > self.term {
            self.adopt_term(req.term, now)?;
        }
        if !matches!(self.role, RoleState::Follower) {
            info!("{} stepping down to follower of {} in term {}", self.id, req.leader_id, self.term);
            self.role = RoleState::Follower;
        }
        if self.leader_id.as_ref() != Some(&req.leader_id) {
            info!("{} following leader {} in term {}", self.id, req.leader_id, self.term);
            self.leader_id = Some(req.leader_id.clone());
        }
        self.reset_election_deadline(now);

        if self.log.term_at(req.prev_log_index) != Some(req.prev_log_term) {
            debug!(
                "{} rejecting entries after {} (term {}): log ends at {}",
                self.id,
                req.prev_log_index,
                req.prev_log_term,
                self.log.last_index()
            );
            self.maybe_request_sync(req.commit_index, &mut ready);
            return Ok((self.heartbeat_reply(false, 0), ready));
        }

        let change = self.log.plan_append(req.prev_log_index + 1, &req.entries);
        self.storage.apply_log_change(&change)?;
        if let Some(from) = change.truncated_from {
            info!("{} truncated conflicting log suffix from index {}", self.id, from);
        }
        self.log.apply_change(&change);

        let confirmed = req.prev_log_index + req.entries.len() as LogIndex;
        let new_commit = req.commit_index.min(confirmed);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.apply_committed(&mut ready)?;
        }

        self.maybe_request_sync(req.commit_index, &mut ready);
        Ok((self.heartbeat_reply(true, confirmed), ready))
    }

    fn heartbeat_reply(&self, success: bool, match_index: LogIndex) -> HeartbeatResponse {
        HeartbeatResponse {
            term: self.term,
            success,
            match_index,
            last_log_index: self.log.last_index(),
            last_applied: self.state.last_applied(),
        }
    }

    fn maybe_request_sync(&mut self, leader_commit: LogIndex, ready: &mut Ready) {
        if self.sync_in_flight.is_some() {
            return;
        }
        let last_index = self.log.last_index();
        if leader_commit <= last_index + self.settings.sync_lag_threshold {
            return;
        }
        let Some(leader) = self.leader_id.clone() else {
            return;
        };

        info!(
            "{} is {} entries behind leader {}, requesting state sync",
            self.id,
            leader_commit - last_index,
            leader
        );
        self.sync_in_flight = Some(last_index);
        ready.messages.push(Outbound::Sync {
            to: leader,
            request: SyncStateRequest {
                requester_id: self.id.clone(),
                term: self.term,
                last_index,
            },
        });
    }

    pub fn handle_sync_request(
        &mut self,
        req: SyncStateRequest,
        now: Instant,
    ) -> RaftResult<SyncStateResponse> {
        if req.term > self.term {
            self.adopt_term(req.term, now)?;
        }

        let success =
            self.is_leader() && req.term == self.term && req.last_index <= self.log.last_index();
        let (prev_log_term, entries) = if success {
            (
                self.log.term_at(req.last_index).unwrap_or(0),
                self.log.entries_from(req.last_index + 1, usize::MAX),
            )
        } else {
            (0, Vec::new())
        };

        if success {
            debug!(
                "{} serving state sync to {}: {} entries after {}",
                self.id,
                req.requester_id,
                entries.len(),
                req.last_index
            );
        }

        Ok(SyncStateResponse {
            leader_id: self.id.clone(),
            term: self.term,
            success,
            prev_log_term,
            entries,
            commit_index: self.commit_index,
            last_applied: self.state.last_applied(),
        })
    }

    /// Bulk catch-up reply. Validated exactly like a heartbeat anchored at the
    /// index the request was made from.
    pub fn handle_sync_response(&mut self, resp: SyncStateResponse, now: Instant) -> RaftResult<Ready> {
        let requested = self.sync_in_flight.take();
        if resp.term > self.term {
            self.adopt_term(resp.term, now)?;
            return Ok(Ready::default());
        }
        let Some(last_index) = requested else {
            return Ok(Ready::default());
        };
        if !resp.success || resp.term < self.term {
            return Ok(Ready::default());
        }

        let req = HeartbeatRequest {
            leader_id: resp.leader_id,
            term: resp.term,
            prev_log_index: last_index,
            prev_log_term: resp.prev_log_term,
            entries: resp.entries,
            commit_index: resp.commit_index,
        };
        let (_, ready) = self.handle_heartbeat(req, now)?;
        Ok(ready)
    }

    pub fn handle_sync_failure(&mut self) {
        self.sync_in_flight = None;
    }
}
