use crate::types::{LogEntry, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteRequest {
    pub candidate_id: NodeId,
    pub term: Term,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Log push from the leader; an empty `entries` is a pure heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub leader_id: NodeId,
    pub term: Term,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub commit_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub term: Term,
    pub success: bool,
    /// Highest index known to match the leader's log after this message.
    pub match_index: LogIndex,
    pub last_log_index: LogIndex,
    pub last_applied: LogIndex,
}

/// Single-entry fast path, handled exactly like a one-entry heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicateCommandRequest {
    pub leader_id: NodeId,
    pub term: Term,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entry: LogEntry,
    pub commit_index: LogIndex,
}

pub type ReplicateCommandResponse = HeartbeatResponse;

impl From<ReplicateCommandRequest> for HeartbeatRequest {
    fn from(req: ReplicateCommandRequest) -> Self {
        HeartbeatRequest {
            leader_id: req.leader_id,
            term: req.term,
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries: vec![req.entry],
            commit_index: req.commit_index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncStateRequest {
    pub requester_id: NodeId,
    pub term: Term,
    pub last_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncStateResponse {
    pub leader_id: NodeId,
    pub term: Term,
    pub success: bool,
    /// Term of the entry at the requester's `last_index`, for the continuity check.
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
}
