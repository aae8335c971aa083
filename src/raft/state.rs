use super::{Entry, Index};

/// A state machine driven by the replicated log. Raft doesn't care what the
/// commands do, as long as application is deterministic: replicas that have
/// applied the same log prefix must be in identical states.
pub trait State: Send {
    /// Returns the index of the last applied entry, or 0 if none.
    fn applied_index(&self) -> Index;

    /// Applies a committed log entry. Entries must be applied in index order,
    /// exactly once. Application can't fail; non-deterministic failures would
    /// diverge the replicas.
    fn apply(&mut self, entry: &Entry);

    /// Reads the value of a key, or None if it is unset.
    fn read(&self, key: &str) -> Option<String>;
}
