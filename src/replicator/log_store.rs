use crate::types::{LogEntry, LogIndex, Term};

#[derive(Debug, Clone, Default)]
pub struct LogStore {
    entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogChange {
    pub truncated_from: Option<LogIndex>,
    pub appended: Vec<LogEntry>,
}

impl LogChange {
    pub fn is_empty(&self) -> bool {
        self.truncated_from.is_none() && self.appended.is_empty()
    }
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        debug_assert!(entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.index == i as u64 + 1));
        Self { entries }
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term at `index`; index 0 is the empty prefix and has term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get_entry(index).map(|e| e.term)
    }

    pub fn entries_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = from.max(1);
        if start > self.last_index() {
            return Vec::new();
        }
        self.entries[(start - 1) as usize..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Follower-side append starting at `start_index`. Entries already present
    /// with the same term are kept; the first conflicting entry truncates the
    /// log from that point and everything after it is appended.
    pub fn append_entries(&mut self, start_index: LogIndex, entries: &[LogEntry]) -> LogChange {
        let change = self.plan_append(start_index, entries);
        self.apply_change(&change);
        change
    }

    /// The change `append_entries` would make, without touching the log.
    pub fn plan_append(&self, start_index: LogIndex, entries: &[LogEntry]) -> LogChange {
        let mut change = LogChange::default();
        debug_assert!(start_index >= 1 && start_index <= self.last_index() + 1);

        for (offset, entry) in entries.iter().enumerate() {
            let index = start_index + offset as u64;
            if change.truncated_from.is_none() && index <= self.last_index() {
                if self.term_at(index) == Some(entry.term) {
                    continue;
                }
                change.truncated_from = Some(index);
            }
            let mut entry = entry.clone();
            entry.index = index;
            change.appended.push(entry);
        }

        change
    }

    pub fn apply_change(&mut self, change: &LogChange) {
        if let Some(from) = change.truncated_from {
            self.truncate_from(from);
        }
        for entry in &change.appended {
            debug_assert_eq!(entry.index, self.last_index() + 1);
            self.entries.push(entry.clone());
        }
    }

    fn truncate_from(&mut self, index: LogIndex) {
        self.entries.truncate((index - 1) as usize);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}
