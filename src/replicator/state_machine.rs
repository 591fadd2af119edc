use crate::replicator::merge::{three_way_merge, MergePolicy};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DocState {
    pub users: BTreeMap<Username, User>,
    pub documents: BTreeMap<DocumentId, Document>,
    pub last_applied: LogIndex,
}

impl DocState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed entry. Entries must arrive in index order with
    /// no gaps; the entry's own term, index and timestamp are the only inputs
    /// besides the prior state.
    pub fn apply(&mut self, entry: &LogEntry, policy: MergePolicy) -> CommandResult {
        debug_assert_eq!(entry.index, self.last_applied + 1);
        self.last_applied = entry.index;

        match &entry.command {
            Command::Noop => CommandResult::ok("No-op applied."),
            Command::CreateUser {
                username,
                password_hash,
            } => self.create_user(username, password_hash, entry),
            Command::AuthenticateUser {
                username,
                password_hash,
            } => self.authenticate_user(username, password_hash),
            Command::CreateDocument { title, username } => {
                self.create_document(title, username, entry)
            }
            Command::UpdateDocumentContent {
                document_id,
                content,
                base_content,
                username,
            } => self.update_content(
                document_id,
                content,
                base_content.as_deref(),
                username,
                entry,
                policy,
            ),
            Command::UpdateDocumentTitle {
                document_id,
                title,
                username,
            } => match self.accessible_mut(document_id, username) {
                Ok(doc) => {
                    doc.title = title.clone();
                    doc.last_edited = entry.timestamp;
                    CommandResult::ok("Document title updated successfully.")
                }
                Err(rejection) => rejection,
            },
            Command::DeleteDocument {
                document_id,
                username,
            } => {
                if let Err(rejection) = self.accessible_mut(document_id, username) {
                    return rejection;
                }
                self.documents.remove(document_id);
                CommandResult::ok("Document deleted successfully.")
            }
            Command::AddUserToDocument {
                document_id,
                username,
                added_by,
            } => self.add_user(document_id, username, added_by, entry),
            Command::RemoveUserFromDocument {
                document_id,
                username,
                removed_by,
            } => self.remove_user(document_id, username, removed_by, entry),
        }
    }

    fn create_user(&mut self, username: &str, password_hash: &str, entry: &LogEntry) -> CommandResult {
        if username.is_empty() || password_hash.is_empty() {
            return CommandResult::rejected("Username and password are required.");
        }
        if self.users.contains_key(username) {
            return CommandResult::rejected("Username already exists.");
        }
        self.users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password_hash: password_hash.to_string(),
                created_at: entry.timestamp,
            },
        );
        CommandResult::ok("User registered successfully.")
    }

    fn authenticate_user(&self, username: &str, password_hash: &str) -> CommandResult {
        match self.users.get(username) {
            None => CommandResult::rejected("User not found."),
            Some(user) if user.password_hash != password_hash => {
                CommandResult::rejected("Invalid password.")
            }
            Some(_) => CommandResult::ok("Authentication successful."),
        }
    }

    fn create_document(&mut self, title: &str, username: &str, entry: &LogEntry) -> CommandResult {
        if !self.users.contains_key(username) {
            return CommandResult::rejected("User not found.");
        }

        let id = new_document_id(entry);
        let mut users = BTreeSet::new();
        users.insert(username.to_string());

        self.documents.insert(
            id.clone(),
            Document {
                id: id.clone(),
                title: title.to_string(),
                content: String::new(),
                owner: username.to_string(),
                users,
                last_edited: entry.timestamp,
            },
        );

        CommandResult::ok_with(
            "Document created successfully.",
            CommandPayload::DocumentId { document_id: id },
        )
    }

    fn update_content(
        &mut self,
        document_id: &str,
        content: &str,
        base_content: Option<&str>,
        username: &str,
        entry: &LogEntry,
        policy: MergePolicy,
    ) -> CommandResult {
        let doc = match self.accessible_mut(document_id, username) {
            Ok(doc) => doc,
            Err(rejection) => return rejection,
        };

        let (merged, message) = match base_content {
            None => (
                content.to_string(),
                "Document content updated successfully.",
            ),
            Some(base) => {
                let outcome = three_way_merge(base, &doc.content, content, policy);
                let message = if outcome.content == content {
                    "Document content updated successfully."
                } else if outcome.conflicted {
                    "Document content merged with conflicts."
                } else {
                    "Document content merged successfully."
                };
                (outcome.content, message)
            }
        };

        doc.content = merged.clone();
        doc.last_edited = entry.timestamp;
        CommandResult::ok_with(message, CommandPayload::Content { content: merged })
    }

    fn add_user(
        &mut self,
        document_id: &str,
        username: &str,
        added_by: &str,
        entry: &LogEntry,
    ) -> CommandResult {
        let user_exists = self.users.contains_key(username);
        let doc = match self.accessible_mut(document_id, added_by) {
            Ok(doc) => doc,
            Err(rejection) => return rejection,
        };
        if !user_exists {
            return CommandResult::rejected("User to add not found.");
        }
        if doc.has_access(username) {
            return CommandResult::rejected("User already has access to this document.");
        }
        doc.users.insert(username.to_string());
        doc.last_edited = entry.timestamp;
        CommandResult::ok("User added to document successfully.")
    }

    fn remove_user(
        &mut self,
        document_id: &str,
        username: &str,
        removed_by: &str,
        entry: &LogEntry,
    ) -> CommandResult {
        let doc = match self.accessible_mut(document_id, removed_by) {
            Ok(doc) => doc,
            Err(rejection) => return rejection,
        };
        if doc.owner == username {
            return CommandResult::rejected("Cannot remove the document owner.");
        }
        if !doc.users.remove(username) {
            return CommandResult::rejected("User does not have access to this document.");
        }
        doc.last_edited = entry.timestamp;
        CommandResult::ok("User removed from document successfully.")
    }

    fn accessible_mut(
        &mut self,
        document_id: &str,
        username: &str,
    ) -> Result<&mut Document, CommandResult> {
        match self.documents.get_mut(document_id) {
            None => Err(CommandResult::rejected("Document not found.")),
            Some(doc) if !doc.has_access(username) => Err(CommandResult::rejected(
                "User does not have access to this document.",
            )),
            Some(doc) => Ok(doc),
        }
    }

    pub fn get_document(&self, document_id: &str, username: &str) -> Result<Document, String> {
        match self.documents.get(document_id) {
            None => Err("Document not found.".to_string()),
            Some(doc) if !doc.has_access(username) => {
                Err("User does not have access to this document.".to_string())
            }
            Some(doc) => Ok(doc.clone()),
        }
    }

    pub fn list_user_documents(&self, username: &str) -> Result<Vec<DocumentSummary>, String> {
        if !self.users.contains_key(username) {
            return Err("User not found.".to_string());
        }
        let mut docs: Vec<DocumentSummary> = self
            .documents
            .values()
            .filter(|d| d.has_access(username))
            .map(DocumentSummary::from)
            .collect();
        docs.sort_by(|a, b| b.last_edited.cmp(&a.last_edited).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    pub fn list_users(&self, excluding: Option<&str>) -> Vec<Username> {
        self.users
            .keys()
            .filter(|name| Some(name.as_str()) != excluding)
            .cloned()
            .collect()
    }

    pub fn get_user(&self, username: &str) -> Option<User> {
        self.users.get(username).cloned()
    }

    /// Current values of `touched`, stamped with `last_applied`.
    pub fn change_for(&self, touched: &TouchedKeys) -> StateChange {
        StateChange {
            last_applied: self.last_applied,
            users: touched
                .users
                .iter()
                .filter_map(|name| self.users.get(name).map(|u| (name.clone(), u.clone())))
                .collect(),
            documents: touched
                .documents
                .iter()
                .map(|id| (id.clone(), self.documents.get(id).cloned()))
                .collect(),
        }
    }
}

/// Ids derive from the creating entry's term and index.
fn new_document_id(entry: &LogEntry) -> DocumentId {
    Uuid::from_u64_pair(entry.term, entry.index).to_string()
}

/// Records written by applied entries, with their values after the writes.
/// A `None` document was deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateChange {
    pub last_applied: LogIndex,
    pub users: BTreeMap<Username, User>,
    pub documents: BTreeMap<DocumentId, Option<Document>>,
}

impl StateChange {
    pub fn apply_to(&self, state: &mut DocState) {
        state.last_applied = self.last_applied;
        for (name, user) in &self.users {
            state.users.insert(name.clone(), user.clone());
        }
        for (id, doc) in &self.documents {
            match doc {
                Some(doc) => {
                    state.documents.insert(id.clone(), doc.clone());
                }
                None => {
                    state.documents.remove(id);
                }
            }
        }
    }
}

/// Keys an entry may have written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TouchedKeys {
    pub users: BTreeSet<Username>,
    pub documents: BTreeSet<DocumentId>,
}

impl TouchedKeys {
    pub fn record(&mut self, entry: &LogEntry) {
        match &entry.command {
            Command::Noop | Command::AuthenticateUser { .. } => {}
            Command::CreateUser { username, .. } => {
                self.users.insert(username.clone());
            }
            Command::CreateDocument { .. } => {
                self.documents.insert(new_document_id(entry));
            }
            Command::UpdateDocumentContent { document_id, .. }
            | Command::UpdateDocumentTitle { document_id, .. }
            | Command::DeleteDocument { document_id, .. }
            | Command::AddUserToDocument { document_id, .. }
            | Command::RemoveUserFromDocument { document_id, .. } => {
                self.documents.insert(document_id.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.documents.is_empty()
    }
}

#[derive(Clone)]
pub struct SharedState {
    inner: Arc<RwLock<DocState>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::from_state(DocState::new())
    }

    pub fn from_state(state: DocState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn apply(&self, entry: &LogEntry, policy: MergePolicy) -> CommandResult {
        let mut state = self.inner.write().unwrap();
        state.apply(entry, policy)
    }

    pub fn snapshot(&self) -> DocState {
        self.inner.read().unwrap().clone()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.inner.read().unwrap().last_applied
    }

    pub fn restore(&self, state: DocState) {
        *self.inner.write().unwrap() = state;
    }

    pub fn read<R>(&self, f: impl FnOnce(&DocState) -> R) -> R {
        f(&self.inner.read().unwrap())
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
