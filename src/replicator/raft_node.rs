use crate::config::RaftSettings;
use crate::error::{RaftError, RaftResult, TransportError};
use crate::replicator::merge::MergePolicy;
use crate::replicator::message::*;
use crate::replicator::network::RaftTransport;
use crate::replicator::raft_core::{AppliedEntry, Outbound, RaftCore, Ready};
use crate::replicator::state_machine::{DocState, SharedState};
use crate::replicator::storage::RaftStorage;
use crate::replicator::Replicator;
use crate::types::*;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

struct Waiter {
    term: Term,
    tx: oneshot::Sender<RaftResult<ProposeOutcome>>,
}

struct Inner {
    core: RaftCore,
    waiters: HashMap<LogIndex, Waiter>,
}

pub struct RaftReplicator {
    node_id: NodeId,
    this: Weak<RaftReplicator>,
    inner: Mutex<Inner>,
    state: SharedState,
    transport: Arc<dyn RaftTransport>,
    peers: Vec<PeerInfo>,
    self_addr: String,
    settings: RaftSettings,
    down_peers: Mutex<HashSet<NodeId>>,
}

impl RaftReplicator {
    pub fn new(
        node_id: NodeId,
        self_addr: String,
        peers: Vec<PeerInfo>,
        settings: RaftSettings,
        policy: MergePolicy,
        storage: Box<dyn RaftStorage>,
        transport: Arc<dyn RaftTransport>,
    ) -> RaftResult<Arc<Self>> {
        let state = SharedState::new();
        let core = RaftCore::new(
            node_id.clone(),
            peers.iter().map(|p| p.node_id.clone()).collect(),
            settings.clone(),
            policy,
            storage,
            state.clone(),
            Instant::now(),
        )?;

        info!(
            "Raft replicator {} at {} with {} peers",
            node_id,
            self_addr,
            peers.len()
        );

        Ok(Arc::new_cyclic(|this| Self {
            node_id,
            this: this.clone(),
            inner: Mutex::new(Inner {
                core,
                waiters: HashMap::new(),
            }),
            state,
            transport,
            peers,
            self_addr,
            settings,
            down_peers: Mutex::new(HashSet::new()),
        }))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn shared_state(&self) -> &SharedState {
        &self.state
    }

    pub fn self_addr(&self) -> &str {
        &self.self_addr
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn addr_of(&self, node_id: &str) -> Option<String> {
        if node_id == self.node_id {
            return Some(self.self_addr.clone());
        }
        self.peers
            .iter()
            .find(|p| p.node_id == node_id)
            .map(|p| p.addr.clone())
    }

    fn not_leader(&self, leader_id: Option<NodeId>) -> ProposeOutcome {
        let leader_addr = leader_id.as_deref().and_then(|id| self.addr_of(id));
        ProposeOutcome::NotLeader {
            leader_id,
            leader_addr,
        }
    }

    /// Drives elections and heartbeats until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Raft driver for {} started", self.node_id);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.step(|core, now| Ok(((), core.tick(now)?))) {
                        error!("Raft tick on {} failed: {}", self.node_id, e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let mut inner = self.lock();
        for (_, waiter) in inner.waiters.drain() {
            let _ = waiter.tx.send(Err(RaftError::Shutdown));
        }
        info!("Raft driver for {} stopped", self.node_id);
    }

    /// Runs one serialized core step, settles waiting proposals, then sends
    /// whatever the step produced.
    fn step<R>(&self, f: impl FnOnce(&mut RaftCore, Instant) -> RaftResult<(R, Ready)>) -> RaftResult<R> {
        let (out, messages) = {
            let mut inner = self.lock();
            let (out, ready) = f(&mut inner.core, Instant::now())?;
            Self::settle(&mut inner, ready.applied, |id| self.not_leader(id));
            (out, ready.messages)
        };
        self.send_all(messages);
        Ok(out)
    }

    fn settle(
        inner: &mut Inner,
        applied: Vec<AppliedEntry>,
        not_leader: impl Fn(Option<NodeId>) -> ProposeOutcome,
    ) {
        for entry in applied {
            if let Some(waiter) = inner.waiters.remove(&entry.index) {
                let outcome = if waiter.term == entry.term {
                    Ok(ProposeOutcome::from_result(entry.result))
                } else {
                    Err(RaftError::LeadershipLost)
                };
                let _ = waiter.tx.send(outcome);
            }
        }

        if !inner.core.is_leader() && !inner.waiters.is_empty() {
            let leader_id = inner.core.leader_id().cloned();
            warn!(
                "Lost leadership with {} proposals pending; callers must retry",
                inner.waiters.len()
            );
            for (_, waiter) in inner.waiters.drain() {
                let outcome = match &leader_id {
                    Some(_) => Ok(not_leader(leader_id.clone())),
                    None => Err(RaftError::LeadershipLost),
                };
                let _ = waiter.tx.send(outcome);
            }
        }
    }

    fn send_all(&self, messages: Vec<Outbound>) {
        if messages.is_empty() {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        for message in messages {
            let this = this.clone();
            tokio::spawn(async move {
                this.deliver(message).await;
            });
        }
    }

    async fn deliver(&self, message: Outbound) {
        let result = match message {
            Outbound::Vote { to, request } => {
                match self.call(&to, self.transport.request_vote(&to, request)).await {
                    Ok(resp) => self.step(|core, now| Ok(((), core.handle_vote_response(&to, resp, now)?))),
                    Err(_) => Ok(()),
                }
            }
            Outbound::Heartbeat { to, request } => {
                let sent_term = request.term;
                let result = self.call(&to, self.transport.send_heartbeat(&to, request)).await;
                self.on_replication_result(&to, sent_term, result)
            }
            Outbound::Replicate { to, request } => {
                let sent_term = request.term;
                let result = self.call(&to, self.transport.replicate_command(&to, request)).await;
                self.on_replication_result(&to, sent_term, result)
            }
            Outbound::Sync { to, request } => {
                match self.call(&to, self.transport.sync_state(&to, request)).await {
                    Ok(resp) => self.step(|core, now| Ok(((), core.handle_sync_response(resp, now)?))),
                    Err(_) => self.step(|core, _| {
                        core.handle_sync_failure();
                        Ok(((), Ready::default()))
                    }),
                }
            }
        };

        if let Err(e) = result {
            error!("Raft step on {} failed: {}", self.node_id, e);
        }
    }

    fn on_replication_result(
        &self,
        to: &NodeId,
        sent_term: Term,
        result: Result<HeartbeatResponse, TransportError>,
    ) -> RaftResult<()> {
        match result {
            Ok(resp) => self.step(|core, now| {
                Ok(((), core.handle_heartbeat_response(to, sent_term, resp, now)?))
            }),
            Err(_) => self.step(|core, _| {
                core.handle_peer_failure(to, sent_term);
                Ok(((), Ready::default()))
            }),
        }
    }

    async fn call<T>(
        &self,
        to: &NodeId,
        rpc: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        let result = match tokio::time::timeout(self.settings.rpc_timeout(), rpc).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        let mut down = self
            .down_peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &result {
            Ok(_) => {
                if down.remove(to) {
                    info!("Peer {} is reachable again", to);
                }
            }
            Err(e) => {
                if down.insert(to.clone()) {
                    warn!("Peer {} unreachable: {}", to, e);
                } else {
                    debug!("Peer {} still unreachable: {}", to, e);
                }
            }
        }
        result
    }

    pub fn handle_request_vote(&self, req: VoteRequest) -> RaftResult<VoteResponse> {
        self.step(|core, now| Ok((core.handle_request_vote(req, now)?, Ready::default())))
    }

    pub fn handle_heartbeat(&self, req: HeartbeatRequest) -> RaftResult<HeartbeatResponse> {
        self.step(|core, now| core.handle_heartbeat(req, now))
    }

    pub fn handle_replicate_command(
        &self,
        req: ReplicateCommandRequest,
    ) -> RaftResult<ReplicateCommandResponse> {
        self.handle_heartbeat(req.into())
    }

    pub fn handle_sync_state(&self, req: SyncStateRequest) -> RaftResult<SyncStateResponse> {
        self.step(|core, now| Ok((core.handle_sync_request(req, now)?, Ready::default())))
    }

    /// Forces an election now instead of waiting for the timeout.
    pub fn campaign(&self) -> RaftResult<()> {
        self.step(|core, now| Ok(((), core.start_election(now)?)))
    }

    pub fn term(&self) -> Term {
        self.lock().core.term()
    }

    pub fn role(&self) -> Role {
        self.lock().core.role()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.lock().core.commit_index()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.lock().core.log().entries().to_vec()
    }
}

#[async_trait]
impl Replicator for RaftReplicator {
    async fn propose(&self, command: Command) -> RaftResult<ProposeOutcome> {
        let (tx, rx) = oneshot::channel();
        let (index, messages) = {
            let mut inner = self.lock();
            match inner.core.propose(command, Instant::now()) {
                Err(RaftError::NotLeader { leader_id, .. }) => {
                    return Ok(self.not_leader(leader_id));
                }
                Err(e) => return Err(e),
                Ok((index, term, ready)) => {
                    inner.waiters.insert(index, Waiter { term, tx });
                    Self::settle(&mut inner, ready.applied, |id| self.not_leader(id));
                    (index, ready.messages)
                }
            }
        };
        self.send_all(messages);

        match tokio::time::timeout(self.settings.propose_timeout(), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => {
                self.lock().waiters.remove(&index);
                warn!("Proposal at index {} timed out; outcome unknown", index);
                Err(RaftError::ProposalTimeout)
            }
        }
    }

    fn snapshot(&self) -> DocState {
        self.state.snapshot()
    }

    fn is_leader(&self) -> bool {
        self.lock().core.is_leader()
    }

    fn leader_id(&self) -> Option<NodeId> {
        self.lock().core.leader_id().cloned()
    }

    fn leader_addr(&self) -> Option<String> {
        self.leader_id().and_then(|id| self.addr_of(&id))
    }

    fn status(&self) -> ReplicaStatus {
        self.lock().core.status()
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.peers.clone()
    }
}
