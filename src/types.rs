use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type NodeId = String;
pub type DocumentId = String;
pub type Username = String;
pub type Term = u64;
pub type LogIndex = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub username: Username,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub content: String,
    pub owner: Username,
    pub users: BTreeSet<Username>,
    pub last_edited: DateTime<Utc>,
}

impl Document {
    pub fn has_access(&self, username: &str) -> bool {
        self.users.contains(username)
    }
}

/// A replicated write. Every field needed to apply the command is carried
/// here, so applying it never consults the local clock or environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "operation", content = "args", rename_all = "snake_case")]
pub enum Command {
    /// Appended by a new leader at the start of its term.
    Noop,
    CreateUser {
        username: Username,
        password_hash: String,
    },
    AuthenticateUser {
        username: Username,
        password_hash: String,
    },
    CreateDocument {
        title: String,
        username: Username,
    },
    UpdateDocumentContent {
        document_id: DocumentId,
        content: String,
        base_content: Option<String>,
        username: Username,
    },
    UpdateDocumentTitle {
        document_id: DocumentId,
        title: String,
        username: Username,
    },
    DeleteDocument {
        document_id: DocumentId,
        username: Username,
    },
    AddUserToDocument {
        document_id: DocumentId,
        username: Username,
        added_by: Username,
    },
    RemoveUserFromDocument {
        document_id: DocumentId,
        username: Username,
        removed_by: Username,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Noop => "noop",
            Command::CreateUser { .. } => "create_user",
            Command::AuthenticateUser { .. } => "authenticate_user",
            Command::CreateDocument { .. } => "create_document",
            Command::UpdateDocumentContent { .. } => "update_document_content",
            Command::UpdateDocumentTitle { .. } => "update_document_title",
            Command::DeleteDocument { .. } => "delete_document",
            Command::AddUserToDocument { .. } => "add_user_to_document",
            Command::RemoveUserFromDocument { .. } => "remove_user_from_document",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandPayload {
    None,
    DocumentId { document_id: DocumentId },
    Content { content: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    pub payload: CommandPayload,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload: CommandPayload::None,
        }
    }

    pub fn ok_with(message: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            payload: CommandPayload::None,
        }
    }

    pub fn document_id(&self) -> Option<&str> {
        match &self.payload {
            CommandPayload::DocumentId { document_id } => Some(document_id),
            _ => None,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match &self.payload {
            CommandPayload::Content { content } => Some(content),
            _ => None,
        }
    }
}

/// What a caller of `propose` gets back once the replica has decided.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProposeOutcome {
    Applied(CommandResult),
    Rejected(CommandResult),
    NotLeader {
        leader_id: Option<NodeId>,
        leader_addr: Option<String>,
    },
}

impl ProposeOutcome {
    pub fn from_result(result: CommandResult) -> Self {
        if result.success {
            ProposeOutcome::Applied(result)
        } else {
            ProposeOutcome::Rejected(result)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Command,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Command, timestamp: DateTime<Utc>) -> Self {
        Self {
            term,
            index,
            command,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub log_length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub addr: String,
}

/// Document metadata without its body, as returned by listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub title: String,
    pub owner: Username,
    pub users: BTreeSet<Username>,
    pub last_edited: DateTime<Utc>,
}

impl From<&Document> for DocumentSummary {
    fn from(doc: &Document) -> Self {
        Self {
            id: doc.id.clone(),
            title: doc.title.clone(),
            owner: doc.owner.clone(),
            users: doc.users.clone(),
            last_edited: doc.last_edited,
        }
    }
}
