use super::{Command, Term};
use crate::encoding;

/// A log index. Starts at 1, with 0 indicating no entry.
pub type Index = u64;

/// A log entry: a client command at the index and term where a leader
/// accepted it.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was appended.
    pub term: Term,
    /// The state machine command.
    pub command: Command,
}

/// Entries cross the wire as [index, term, command] triples.
impl serde::Serialize for Entry {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&(self.index, self.term, &self.command), serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Entry {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (index, term, command): (Index, Term, Command) =
            serde::Deserialize::deserialize(deserializer)?;
        Ok(Self { index, term, command })
    }
}

impl encoding::Value for Entry {}

/// The replicated log: an ordered sequence of client commands, replicated
/// across replicas and applied sequentially to the local state machine.
///
/// In the steady state the log is append-only: the leader appends client
/// commands via [`Log::append`] and followers append them via
/// [`Log::splice`]. Once an index is replicated to a majority it becomes
/// committed, making the log immutable up to that index. Uncommitted entries
/// can still be replaced: a deposed leader's unreplicated tail is truncated
/// when a newer leader's conflicting entries arrive.
///
/// Invariants:
///
/// * Entry indexes are contiguous starting at 1 (no gaps).
/// * Entry terms never decrease from the previous entry.
/// * Committed entries are never changed or removed.
/// * Entries with the same index and term contain the same command, and all
///   preceding entries are identical (the Raft log matching property).
///
/// All state is volatile; nothing survives process exit.
pub struct Log {
    /// The log entries. The entry at index i is stored at position i - 1.
    entries: Vec<Entry>,
    /// The index of the last committed entry, or 0 if none.
    commit_index: Index,
}

impl Log {
    /// Creates a new, empty log.
    pub fn new() -> Self {
        Self { entries: Vec::new(), commit_index: 0 }
    }

    /// Returns the index of the last entry, or 0 if the log is empty.
    pub fn last_index(&self) -> Index {
        self.entries.len() as Index
    }

    /// Returns the term of the last entry, or 0 if the log is empty.
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Returns the commit index, or 0 if no entry is committed.
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Appends a command to the log at the given term, returning its index.
    pub fn append(&mut self, term: Term, command: Command) -> Index {
        assert!(term > 0, "can't append entry in term 0");
        assert!(term >= self.last_term(), "term regression {} → {}", self.last_term(), term);
        self.entries.push(Entry { index: self.last_index() + 1, term, command });
        self.last_index()
    }

    /// Fetches the entry at an index, or None if it does not exist.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        index.checked_sub(1).and_then(|i| self.entries.get(i as usize))
    }

    /// Checks if the log contains an entry with the given index and term.
    pub fn has(&self, index: Index, term: Term) -> bool {
        self.get(index).map(|e| e.term == term).unwrap_or(false)
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and can't regress.
    pub fn commit(&mut self, index: Index) -> Index {
        if index == self.commit_index {
            return index;
        }
        assert!(index > self.commit_index, "commit regression {} → {}", self.commit_index, index);
        assert!(self.get(index).is_some(), "commit index {index} does not exist");
        self.commit_index = index;
        index
    }

    /// Returns an iterator over entries in the given index range.
    pub fn scan(&self, range: impl std::ops::RangeBounds<Index>) -> impl Iterator<Item = &Entry> {
        use std::ops::Bound;
        let start = match range.start_bound() {
            Bound::Included(&index) => index.saturating_sub(1) as usize,
            Bound::Excluded(&index) => index as usize,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&index) => index as usize,
            Bound::Excluded(&index) => (index as usize).saturating_sub(1),
            Bound::Unbounded => usize::MAX,
        };
        let end = end.min(self.entries.len());
        self.entries[start.min(end)..end].iter()
    }

    /// Returns an iterator over committed entries after the given applied
    /// index, ready for state machine application.
    pub fn scan_apply(&self, applied_index: Index) -> impl Iterator<Item = &Entry> {
        self.scan(applied_index + 1..=self.commit_index)
    }

    /// Splices entries into the log. Entries already present (same index and
    /// term) are skipped; a term conflict truncates the log at the first
    /// conflicting index before the new tail is appended. Never mutates
    /// committed entries. Returns the new last index.
    ///
    /// The entries must be contiguous with non-decreasing terms, and must
    /// connect to the existing log; callers validate wire input first.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Index {
        let Some(first) = entries.first() else {
            return self.last_index();
        };
        assert!(first.index > 0 && first.term > 0, "spliced entry has index or term 0");
        assert!(first.index <= self.last_index() + 1, "spliced entries must touch the log");
        assert!(
            entries.windows(2).all(|w| w[0].index + 1 == w[1].index),
            "spliced entries are not contiguous"
        );
        assert!(
            entries.windows(2).all(|w| w[0].term <= w[1].term),
            "spliced entries have term regression"
        );

        // Skip entries that are already in the log.
        let mut skip = 0;
        for entry in &entries {
            match self.get(entry.index) {
                Some(have) if have.term == entry.term => {
                    assert_eq!(have.command, entry.command, "command mismatch at {}", entry.index);
                    skip += 1;
                }
                _ => break,
            }
        }
        let mut entries = entries;
        let entries = entries.split_off(skip);
        let Some(first) = entries.first() else {
            return self.last_index();
        };

        // Truncate the conflicting tail (if any) and append the new entries.
        // Committed entries are immutable, so we can't write below them.
        assert!(first.index > self.commit_index, "spliced entries below commit index");
        self.entries.truncate(first.index as usize - 1);
        self.entries.extend(entries);
        self.last_index()
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}
