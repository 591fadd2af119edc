use crate::error::{RaftError, TransportError};
use crate::replicator::message::*;
use crate::replicator::raft_node::RaftReplicator;
use crate::types::NodeId;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

/// Outbound half of the inter-replica RPCs. One attempt per call; retries are
/// the consensus core's business.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, to: &NodeId, req: VoteRequest) -> Result<VoteResponse, TransportError>;

    async fn send_heartbeat(
        &self,
        to: &NodeId,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, TransportError>;

    async fn replicate_command(
        &self,
        to: &NodeId,
        req: ReplicateCommandRequest,
    ) -> Result<ReplicateCommandResponse, TransportError>;

    async fn sync_state(
        &self,
        to: &NodeId,
        req: SyncStateRequest,
    ) -> Result<SyncStateResponse, TransportError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    peers: Arc<RwLock<HashMap<NodeId, String>>>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(rpc_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            client,
        }
    }

    pub fn register_peer(&self, node_id: NodeId, addr: String) {
        self.peers.write().unwrap().insert(node_id, addr);
    }

    pub fn peer_addr(&self, node_id: &str) -> Option<String> {
        self.peers.read().unwrap().get(node_id).cloned()
    }

    async fn send_rpc<Req, Resp>(&self, to: &NodeId, path: &str, req: &Req) -> Result<Resp, TransportError>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let addr = self
            .peer_addr(to)
            .ok_or_else(|| TransportError::Unreachable(format!("unknown peer {}", to)))?;
        let url = format!("http://{}/raft/{}", addr, path);

        let response = self.client.post(&url).json(req).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Unreachable(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RaftTransport for HttpTransport {
    async fn request_vote(&self, to: &NodeId, req: VoteRequest) -> Result<VoteResponse, TransportError> {
        self.send_rpc(to, "vote", &req).await
    }

    async fn send_heartbeat(
        &self,
        to: &NodeId,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, TransportError> {
        self.send_rpc(to, "heartbeat", &req).await
    }

    async fn replicate_command(
        &self,
        to: &NodeId,
        req: ReplicateCommandRequest,
    ) -> Result<ReplicateCommandResponse, TransportError> {
        self.send_rpc(to, "replicate", &req).await
    }

    async fn sync_state(
        &self,
        to: &NodeId,
        req: SyncStateRequest,
    ) -> Result<SyncStateResponse, TransportError> {
        self.send_rpc(to, "sync", &req).await
    }
}

#[derive(Default)]
struct LocalNetworkInner {
    nodes: HashMap<NodeId, Weak<RaftReplicator>>,
    isolated: HashSet<NodeId>,
}

/// In-process network for running several replicas in one runtime. Any node
/// can be cut off from all others and later reconnected.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<RwLock<LocalNetworkInner>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport_for(&self, node_id: &str) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from: node_id.to_string(),
            network: self.clone(),
        })
    }

    pub fn register(&self, replicator: &Arc<RaftReplicator>) {
        self.inner
            .write()
            .unwrap()
            .nodes
            .insert(replicator.node_id().clone(), Arc::downgrade(replicator));
    }

    pub fn remove(&self, node_id: &str) {
        self.inner.write().unwrap().nodes.remove(node_id);
    }

    pub fn isolate(&self, node_id: &str) {
        self.inner.write().unwrap().isolated.insert(node_id.to_string());
    }

    pub fn reconnect(&self, node_id: &str) {
        self.inner.write().unwrap().isolated.remove(node_id);
    }

    pub fn heal(&self) {
        self.inner.write().unwrap().isolated.clear();
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<RaftReplicator>, TransportError> {
        let inner = self.inner.read().unwrap();
        if inner.isolated.contains(from) || inner.isolated.contains(to) {
            return Err(TransportError::Unreachable(format!("{} -> {} partitioned", from, to)));
        }
        inner
            .nodes
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable(format!("{} is not running", to)))
    }

    /// The reply travels back over the same link, so a partition that appears
    /// mid-call loses it.
    fn reply<T>(&self, from: &str, to: &str, result: Result<T, RaftError>) -> Result<T, TransportError> {
        self.route(from, to)?;
        result.map_err(|_| TransportError::Status(500))
    }
}

pub struct LocalTransport {
    from: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl RaftTransport for LocalTransport {
    async fn request_vote(&self, to: &NodeId, req: VoteRequest) -> Result<VoteResponse, TransportError> {
        let target = self.network.route(&self.from, to)?;
        let result = target.handle_request_vote(req);
        self.network.reply(&self.from, to, result)
    }

    async fn send_heartbeat(
        &self,
        to: &NodeId,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, TransportError> {
        let target = self.network.route(&self.from, to)?;
        let result = target.handle_heartbeat(req);
        self.network.reply(&self.from, to, result)
    }

    async fn replicate_command(
        &self,
        to: &NodeId,
        req: ReplicateCommandRequest,
    ) -> Result<ReplicateCommandResponse, TransportError> {
        let target = self.network.route(&self.from, to)?;
        let result = target.handle_replicate_command(req);
        self.network.reply(&self.from, to, result)
    }

    async fn sync_state(
        &self,
        to: &NodeId,
        req: SyncStateRequest,
    ) -> Result<SyncStateResponse, TransportError> {
        let target = self.network.route(&self.from, to)?;
        let result = target.handle_sync_state(req);
        self.network.reply(&self.from, to, result)
    }
}
