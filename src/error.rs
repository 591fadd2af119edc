use crate::types::NodeId;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RaftError {
    #[error("not the leader (leader: {leader_id:?})")]
    NotLeader {
        leader_id: Option<NodeId>,
        leader_addr: Option<String>,
    },

    #[error("leadership lost before the entry committed; retry against the new leader")]
    LeadershipLost,

    #[error("proposal timed out; outcome unknown")]
    ProposalTimeout,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("replica is shutting down")]
    Shutdown,
}

impl From<sled::Error> for RaftError {
    fn from(e: sled::Error) -> Self {
        RaftError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(e: serde_json::Error) -> Self {
        RaftError::Codec(e.to_string())
    }
}

impl From<bincode::Error> for RaftError {
    fn from(e: bincode::Error) -> Self {
        RaftError::Codec(e.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("rpc timed out")]
    Timeout,

    #[error("peer answered with HTTP {0}")]
    Status(u16),

    #[error("malformed reply: {0}")]
    Decode(String),
}

pub type RaftResult<T> = std::result::Result<T, RaftError>;
