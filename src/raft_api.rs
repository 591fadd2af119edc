use crate::error::RaftResult;
use crate::replicator::{
    HeartbeatRequest, RaftReplicator, ReplicateCommandRequest, SyncStateRequest, VoteRequest,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

pub fn create_raft_router(replicator: Arc<RaftReplicator>) -> Router {
    Router::new()
        .route("/raft/vote", post(handle_vote))
        .route("/raft/heartbeat", post(handle_heartbeat))
        .route("/raft/replicate", post(handle_replicate))
        .route("/raft/sync", post(handle_sync))
        .with_state(replicator)
}

fn into_reply<T: Serialize>(result: RaftResult<T>) -> Response {
    match result {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn handle_vote(
    State(replicator): State<Arc<RaftReplicator>>,
    Json(req): Json<VoteRequest>,
) -> impl IntoResponse {
    into_reply(replicator.handle_request_vote(req))
}

async fn handle_heartbeat(
    State(replicator): State<Arc<RaftReplicator>>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    into_reply(replicator.handle_heartbeat(req))
}

async fn handle_replicate(
    State(replicator): State<Arc<RaftReplicator>>,
    Json(req): Json<ReplicateCommandRequest>,
) -> impl IntoResponse {
    into_reply(replicator.handle_replicate_command(req))
}

async fn handle_sync(
    State(replicator): State<Arc<RaftReplicator>>,
    Json(req): Json<SyncStateRequest>,
) -> impl IntoResponse {
    into_reply(replicator.handle_sync_state(req))
}
