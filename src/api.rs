use crate::error::{RaftError, RaftResult};
use crate::replicator::Replicator;
use crate::types::*;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ApiState {
    replicator: Arc<dyn Replicator>,
    client: reqwest::Client,
}

pub fn create_router(replicator: Arc<dyn Replicator>) -> Router {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/api/server/status", get(get_server_status))
        .route("/api/cluster/status", get(get_cluster_status))
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/users", get(list_users))
        .route("/api/user", get(get_user))
        .route("/api/documents", get(list_documents).post(create_document))
        .route("/api/documents/:id", get(get_document).delete(delete_document))
        .route("/api/documents/:id/content", put(update_content))
        .route("/api/documents/:id/title", put(update_title))
        .route("/api/documents/:id/users", post(add_user))
        .route("/api/documents/:id/users/:username", delete(remove_user))
        .with_state(ApiState { replicator, client })
}

pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "success": false, "message": message.into() })),
    )
        .into_response()
}

/// Maps a proposal outcome onto HTTP. `NotLeader` becomes a redirect to the
/// same path on the leader when its address is known.
fn proposal_response(
    outcome: RaftResult<ProposeOutcome>,
    uri: &Uri,
    ok: StatusCode,
    rejected: StatusCode,
) -> Response {
    match outcome {
        Ok(ProposeOutcome::Applied(result)) => {
            let mut body = serde_json::json!({
                "success": true,
                "message": result.message,
            });
            match result.payload {
                CommandPayload::DocumentId { document_id } => {
                    body["document_id"] = serde_json::json!(document_id);
                }
                CommandPayload::Content { content } => {
                    body["content"] = serde_json::json!(content);
                }
                CommandPayload::None => {}
            }
            (ok, Json(body)).into_response()
        }
        Ok(ProposeOutcome::Rejected(result)) => failure(rejected, result.message),
        Ok(ProposeOutcome::NotLeader {
            leader_id,
            leader_addr,
        }) => {
            let body = Json(serde_json::json!({
                "success": false,
                "message": "Not the leader.",
                "leader_id": leader_id,
                "leader_addr": leader_addr,
            }));
            match leader_addr {
                Some(addr) => {
                    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
                    let location = format!("http://{}{}", addr, path);
                    debug!("Redirecting write to leader at {}", location);
                    (
                        StatusCode::TEMPORARY_REDIRECT,
                        [(header::LOCATION, location)],
                        body,
                    )
                        .into_response()
                }
                None => (StatusCode::SERVICE_UNAVAILABLE, body).into_response(),
            }
        }
        Err(e @ RaftError::ProposalTimeout) => failure(StatusCode::GATEWAY_TIMEOUT, e.to_string()),
        Err(e @ (RaftError::LeadershipLost | RaftError::Shutdown)) => {
            failure(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e) => {
            warn!("Proposal failed: {}", e);
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_status(State(api): State<ApiState>) -> impl IntoResponse {
    Json(api.replicator.status())
}

async fn get_server_status(State(api): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "success": true,
        "status": api.replicator.status(),
    }))
}

#[derive(Serialize)]
struct ServerEntry {
    node_id: NodeId,
    addr: Option<String>,
    reachable: bool,
    status: Option<ReplicaStatus>,
}

async fn get_cluster_status(State(api): State<ApiState>) -> impl IntoResponse {
    let local = api.replicator.status();
    let mut servers = vec![ServerEntry {
        node_id: local.node_id.clone(),
        addr: None,
        reachable: true,
        status: Some(local.clone()),
    }];

    for peer in api.replicator.peers() {
        let url = format!("http://{}/status", peer.addr);
        let status = match api.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp.json::<ReplicaStatus>().await.ok(),
            Ok(resp) => {
                debug!("Peer {} answered status with HTTP {}", peer.node_id, resp.status());
                None
            }
            Err(e) => {
                debug!("Peer {} status unavailable: {}", peer.node_id, e);
                None
            }
        };
        servers.push(ServerEntry {
            node_id: peer.node_id,
            addr: Some(peer.addr),
            reachable: status.is_some(),
            status,
        });
    }

    Json(serde_json::json!({
        "success": true,
        "status": {
            "leader_id": local.leader_id,
            "servers": servers,
        },
    }))
}

#[derive(Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

async fn register(
    State(api): State<ApiState>,
    uri: Uri,
    Json(req): Json<Credentials>,
) -> Response {
    if req.username.is_empty() || req.password.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "Username and password are required.");
    }
    info!("Registering user {}", req.username);
    let outcome = api
        .replicator
        .propose(Command::CreateUser {
            username: req.username,
            password_hash: hash_password(&req.password),
        })
        .await;
    proposal_response(outcome, &uri, StatusCode::CREATED, StatusCode::BAD_REQUEST)
}

async fn login(
    State(api): State<ApiState>,
    uri: Uri,
    Json(req): Json<Credentials>,
) -> Response {
    let outcome = api
        .replicator
        .propose(Command::AuthenticateUser {
            username: req.username,
            password_hash: hash_password(&req.password),
        })
        .await;
    proposal_response(outcome, &uri, StatusCode::OK, StatusCode::UNAUTHORIZED)
}

#[derive(Deserialize)]
struct UserQuery {
    username: Option<String>,
}

impl UserQuery {
    fn require(self) -> Result<String, Response> {
        match self.username {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(failure(
                StatusCode::UNAUTHORIZED,
                "Not logged in or username not provided.",
            )),
        }
    }
}

async fn list_users(State(api): State<ApiState>, Query(query): Query<UserQuery>) -> Response {
    let username = match query.require() {
        Ok(name) => name,
        Err(resp) => return resp,
    };
    let users: Vec<_> = api
        .replicator
        .snapshot()
        .list_users(Some(&username))
        .into_iter()
        .map(|name| serde_json::json!({ "username": name }))
        .collect();
    Json(serde_json::json!({ "success": true, "users": users })).into_response()
}

async fn get_user(State(api): State<ApiState>, Query(query): Query<UserQuery>) -> Response {
    let username = match query.require() {
        Ok(name) => name,
        Err(resp) => return resp,
    };
    match api.replicator.snapshot().get_user(&username) {
        Some(user) => Json(serde_json::json!({
            "success": true,
            "user": { "username": user.username, "created_at": user.created_at },
        }))
        .into_response(),
        None => failure(StatusCode::NOT_FOUND, "User not found."),
    }
}

async fn list_documents(State(api): State<ApiState>, Query(query): Query<UserQuery>) -> Response {
    let username = match query.require() {
        Ok(name) => name,
        Err(resp) => return resp,
    };
    match api.replicator.snapshot().list_user_documents(&username) {
        Ok(documents) => {
            Json(serde_json::json!({ "success": true, "documents": documents })).into_response()
        }
        Err(message) => failure(StatusCode::NOT_FOUND, message),
    }
}

#[derive(Deserialize)]
struct CreateDocumentRequest {
    username: String,
    title: String,
}

async fn create_document(
    State(api): State<ApiState>,
    uri: Uri,
    Json(req): Json<CreateDocumentRequest>,
) -> Response {
    let outcome = api
        .replicator
        .propose(Command::CreateDocument {
            title: req.title,
            username: req.username,
        })
        .await;
    proposal_response(outcome, &uri, StatusCode::CREATED, StatusCode::BAD_REQUEST)
}

async fn get_document(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Response {
    let username = match query.require() {
        Ok(name) => name,
        Err(resp) => return resp,
    };
    match api.replicator.snapshot().get_document(&id, &username) {
        Ok(document) => {
            Json(serde_json::json!({ "success": true, "document": document })).into_response()
        }
        Err(message) => failure(StatusCode::NOT_FOUND, message),
    }
}

async fn delete_document(
    State(api): State<ApiState>,
    uri: Uri,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Response {
    let username = match query.require() {
        Ok(name) => name,
        Err(resp) => return resp,
    };
    let outcome = api
        .replicator
        .propose(Command::DeleteDocument {
            document_id: id,
            username,
        })
        .await;
    proposal_response(outcome, &uri, StatusCode::OK, StatusCode::BAD_REQUEST)
}

#[derive(Deserialize)]
struct UpdateContentRequest {
    username: String,
    content: String,
    base_content: Option<String>,
}

async fn update_content(
    State(api): State<ApiState>,
    uri: Uri,
    Path(id): Path<String>,
    Json(req): Json<UpdateContentRequest>,
) -> Response {
    let outcome = api
        .replicator
        .propose(Command::UpdateDocumentContent {
            document_id: id,
            content: req.content,
            base_content: req.base_content,
            username: req.username,
        })
        .await;
    proposal_response(outcome, &uri, StatusCode::OK, StatusCode::BAD_REQUEST)
}

#[derive(Deserialize)]
struct UpdateTitleRequest {
    username: String,
    title: String,
}

async fn update_title(
    State(api): State<ApiState>,
    uri: Uri,
    Path(id): Path<String>,
    Json(req): Json<UpdateTitleRequest>,
) -> Response {
    let outcome = api
        .replicator
        .propose(Command::UpdateDocumentTitle {
            document_id: id,
            title: req.title,
            username: req.username,
        })
        .await;
    proposal_response(outcome, &uri, StatusCode::OK, StatusCode::BAD_REQUEST)
}

#[derive(Deserialize)]
struct ShareRequest {
    owner_username: String,
    username: String,
}

async fn add_user(
    State(api): State<ApiState>,
    uri: Uri,
    Path(id): Path<String>,
    Json(req): Json<ShareRequest>,
) -> Response {
    if req.username.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "No user specified to add to document.");
    }
    let outcome = api
        .replicator
        .propose(Command::AddUserToDocument {
            document_id: id,
            username: req.username,
            added_by: req.owner_username,
        })
        .await;
    proposal_response(outcome, &uri, StatusCode::OK, StatusCode::BAD_REQUEST)
}

#[derive(Deserialize)]
struct OwnerQuery {
    owner_username: Option<String>,
}

async fn remove_user(
    State(api): State<ApiState>,
    uri: Uri,
    Path((id, username)): Path<(String, String)>,
    Query(query): Query<OwnerQuery>,
) -> Response {
    let Some(owner) = query.owner_username.filter(|o| !o.is_empty()) else {
        return failure(
            StatusCode::UNAUTHORIZED,
            "Owner username must be explicitly provided in the request.",
        );
    };
    let outcome = api
        .replicator
        .propose(Command::RemoveUserFromDocument {
            document_id: id,
            username,
            removed_by: owner,
        })
        .await;
    proposal_response(outcome, &uri, StatusCode::OK, StatusCode::BAD_REQUEST)
}
