use crate::raft::{Command, Entry, Index, State};

use std::collections::HashMap;

/// An in-memory key/value store, used as the replicated state machine. All
/// data is volatile and lost on process exit.
pub struct KvStore {
    /// The index of the last applied log entry.
    applied_index: Index,
    /// The key/value pairs.
    data: HashMap<String, String>,
}

impl KvStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self { applied_index: 0, data: HashMap::new() }
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl State for KvStore {
    fn applied_index(&self) -> Index {
        self.applied_index
    }

    fn apply(&mut self, entry: &Entry) {
        assert_eq!(entry.index, self.applied_index + 1, "entry applied out of order");
        match &entry.command {
            Command::Put { key, value } => {
                self.data.insert(key.clone(), value.clone());
            }
            // Reads are never replicated, but the wire format admits them.
            Command::Get { .. } => {}
        }
        self.applied_index = entry.index;
    }

    fn read(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }
}
