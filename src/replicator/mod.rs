pub mod log_store;
pub mod merge;
pub mod message;
pub mod network;
pub mod raft_core;
pub mod raft_node;
pub mod state_machine;
pub mod storage;

pub use log_store::*;
pub use merge::*;
pub use message::*;
pub use network::*;
pub use raft_core::*;
pub use raft_node::*;
pub use state_machine::*;
pub use storage::*;

use crate::error::RaftResult;
use crate::types::*;
use async_trait::async_trait;

#[async_trait]
pub trait Replicator: Send + Sync {
    /// Blocks until the command is committed and applied, or the replica
    /// learns it cannot be. A timeout means the outcome is unknown.
    async fn propose(&self, command: Command) -> RaftResult<ProposeOutcome>;
    fn snapshot(&self) -> DocState;
    fn is_leader(&self) -> bool;
    fn leader_id(&self) -> Option<NodeId>;
    fn leader_addr(&self) -> Option<String>;
    fn status(&self) -> ReplicaStatus;
    fn peers(&self) -> Vec<PeerInfo>;
}
