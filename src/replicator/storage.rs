use crate::error::{RaftError, RaftResult};
use crate::replicator::log_store::LogChange;
use crate::replicator::state_machine::{DocState, StateChange};
use crate::types::{Document, LogEntry, LogIndex, NodeId, Term, User};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Durable Raft state: term and vote, the log, and the materialised document
/// store. Every write must be durable when the call returns, and a
/// `StateChange` lands atomically with its applied index.
pub trait RaftStorage: Send {
    fn load_hard_state(&self) -> RaftResult<HardState>;
    fn save_hard_state(&mut self, state: &HardState) -> RaftResult<()>;
    fn load_log(&self) -> RaftResult<Vec<LogEntry>>;
    fn apply_log_change(&mut self, change: &LogChange) -> RaftResult<()>;
    fn load_state(&self) -> RaftResult<Option<DocState>>;
    fn apply_state_change(&mut self, change: &StateChange) -> RaftResult<()>;
}

const KEY_HARD_STATE: &[u8] = b"hard_state";
const KEY_APPLIED_INDEX: &[u8] = b"applied_index";
const USER_PREFIX: &str = "user/";
const DOCUMENT_PREFIX: &str = "doc/";

pub struct SledStorage {
    db: sled::Db,
    log_tree: sled::Tree,
    meta_tree: sled::Tree,
    state_tree: sled::Tree,
}

impl SledStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> RaftResult<Self> {
        let db = sled::open(path)?;
        let log_tree = db.open_tree("raft_log")?;
        let meta_tree = db.open_tree("raft_meta")?;
        let state_tree = db.open_tree("doc_state")?;

        Ok(Self {
            db,
            log_tree,
            meta_tree,
            state_tree,
        })
    }

    fn log_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    pub fn size_on_disk(&self) -> RaftResult<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

impl RaftStorage for SledStorage {
    fn load_hard_state(&self) -> RaftResult<HardState> {
        match self.meta_tree.get(KEY_HARD_STATE)? {
            Some(data) => Ok(bincode::deserialize(&data)?),
            None => Ok(HardState::default()),
        }
    }

    fn save_hard_state(&mut self, state: &HardState) -> RaftResult<()> {
        let data = bincode::serialize(state)?;
        self.meta_tree.insert(KEY_HARD_STATE, data)?;
        self.meta_tree.flush()?;
        Ok(())
    }

    fn load_log(&self) -> RaftResult<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for item in self.log_tree.iter() {
            let (key, value) = item?;
            let key: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| RaftError::Storage("malformed log key".to_string()))?;
            let index = u64::from_be_bytes(key);
            let entry: LogEntry = serde_json::from_slice(&value)?;

            if entry.index != index || index != entries.len() as u64 + 1 {
                return Err(RaftError::Storage(format!(
                    "log is not contiguous at index {}",
                    index
                )));
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    fn apply_log_change(&mut self, change: &LogChange) -> RaftResult<()> {
        if change.is_empty() {
            return Ok(());
        }

        let mut batch = sled::Batch::default();
        if let Some(from) = change.truncated_from {
            for item in self.log_tree.range(Self::log_key(from)..) {
                let (key, _) = item?;
                batch.remove(key);
            }
        }
        for entry in &change.appended {
            batch.insert(Self::log_key(entry.index).to_vec(), serde_json::to_vec(entry)?);
        }

        self.log_tree.apply_batch(batch)?;
        self.log_tree.flush()?;
        Ok(())
    }

    fn load_state(&self) -> RaftResult<Option<DocState>> {
        let applied: LogIndex = match self.state_tree.get(KEY_APPLIED_INDEX)? {
            Some(data) => bincode::deserialize(&data)?,
            None => return Ok(None),
        };

        let mut state = DocState::new();
        state.last_applied = applied;
        for item in self.state_tree.scan_prefix(USER_PREFIX) {
            let (_, value) = item?;
            let user: User = serde_json::from_slice(&value)?;
            state.users.insert(user.username.clone(), user);
        }
        for item in self.state_tree.scan_prefix(DOCUMENT_PREFIX) {
            let (_, value) = item?;
            let doc: Document = serde_json::from_slice(&value)?;
            state.documents.insert(doc.id.clone(), doc);
        }
        Ok(Some(state))
    }

    fn apply_state_change(&mut self, change: &StateChange) -> RaftResult<()> {
        let mut batch = sled::Batch::default();
        for (name, user) in &change.users {
            batch.insert(format!("{}{}", USER_PREFIX, name).into_bytes(), serde_json::to_vec(user)?);
        }
        for (id, doc) in &change.documents {
            let key = format!("{}{}", DOCUMENT_PREFIX, id).into_bytes();
            match doc {
                Some(doc) => batch.insert(key, serde_json::to_vec(doc)?),
                None => batch.remove(key),
            }
        }
        batch.insert(KEY_APPLIED_INDEX, bincode::serialize(&change.last_applied)?);

        self.state_tree.apply_batch(batch)?;
        self.state_tree.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemInner {
    hard_state: HardState,
    log: Vec<LogEntry>,
    state: Option<DocState>,
    state_writes: usize,
    fail_writes: bool,
}

/// Volatile storage. Clones share the same contents, which lets a test drop a
/// replica and start a new one over the same "disk".
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    inner: Arc<Mutex<MemInner>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> RaftResult<std::sync::MutexGuard<'_, MemInner>> {
        self.inner
            .lock()
            .map_err(|_| RaftError::Storage("memory storage poisoned".to_string()))
    }

    /// While set, log and state writes fail as a full disk would.
    pub fn fail_writes(&self, fail: bool) -> RaftResult<()> {
        self.lock()?.fail_writes = fail;
        Ok(())
    }

    /// Number of state changes written so far.
    pub fn state_writes(&self) -> RaftResult<usize> {
        Ok(self.lock()?.state_writes)
    }

    fn writable(&self) -> RaftResult<std::sync::MutexGuard<'_, MemInner>> {
        let inner = self.lock()?;
        if inner.fail_writes {
            return Err(RaftError::Storage("memory storage rejected write".to_string()));
        }
        Ok(inner)
    }
}

impl RaftStorage for MemStorage {
    fn load_hard_state(&self) -> RaftResult<HardState> {
        Ok(self.lock()?.hard_state.clone())
    }

    fn save_hard_state(&mut self, state: &HardState) -> RaftResult<()> {
        self.lock()?.hard_state = state.clone();
        Ok(())
    }

    fn load_log(&self) -> RaftResult<Vec<LogEntry>> {
        Ok(self.lock()?.log.clone())
    }

    fn apply_log_change(&mut self, change: &LogChange) -> RaftResult<()> {
        if change.is_empty() {
            return Ok(());
        }
        let mut inner = self.writable()?;
        if let Some(from) = change.truncated_from {
            inner.log.retain(|e| e.index < from);
        }
        for entry in &change.appended {
            inner.log.retain(|e| e.index != entry.index);
            inner.log.push(entry.clone());
        }
        Ok(())
    }

    fn load_state(&self) -> RaftResult<Option<DocState>> {
        Ok(self.lock()?.state.clone())
    }

    fn apply_state_change(&mut self, change: &StateChange) -> RaftResult<()> {
        let mut inner = self.writable()?;
        change.apply_to(inner.state.get_or_insert_with(DocState::new));
        inner.state_writes += 1;
        Ok(())
    }
}
