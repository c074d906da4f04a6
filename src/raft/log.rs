//! Replicated log for the consensus engine.

use crate::error::{FabricError, Result};
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Cluster membership change, applied to the node registry on commit.
    ConfigChange,
    /// Opaque application payload.
    AppData,
    /// Empty entry a new leader appends to establish authority in its term.
    NoOp,
}

/// A single entry in the replicated log.
///
/// Uses Arc<Vec<u8>> for the payload to make cloning during replication
/// fan-out O(1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when the entry was created.
    pub term: Term,
    /// The index of this entry in the log.
    pub index: LogIndex,
    pub kind: EntryKind,
    /// The payload (Arc-wrapped for cheap cloning during replication).
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
    /// Truncated SHA-256 of the payload, verified before apply.
    pub checksum: u32,
}

impl LogEntry {
    /// Create a new log entry, computing the payload checksum.
    pub fn new(term: Term, index: LogIndex, kind: EntryKind, data: Vec<u8>) -> Self {
        let checksum = payload_checksum(&data);
        Self {
            term,
            index,
            kind,
            data: Arc::new(data),
            checksum,
        }
    }

    /// A no-op entry for a freshly elected leader.
    pub fn noop(term: Term, index: LogIndex) -> Self {
        Self::new(term, index, EntryKind::NoOp, Vec::new())
    }

    #[inline]
    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Verify the stored checksum against the payload.
    pub fn verify_checksum(&self) -> bool {
        payload_checksum(&self.data) == self.checksum
    }
}

/// First 4 bytes of the SHA-256 of the payload, little-endian.
fn payload_checksum(data: &[u8]) -> u32 {
    let digest = Sha256::digest(data);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Serde helper for Arc<Vec<u8>>: raw bytes on the wire, Arc in memory.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// The in-memory replicated log.
#[derive(Debug)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    /// Index of the first retained entry (after compaction).
    first_index: LogIndex,
    /// Term of the entry at first_index - 1, for the continuity check.
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            snapshot_term: 0,
        }
    }

    /// Index of the last log entry.
    pub fn last_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            self.first_index.saturating_sub(1)
        } else {
            self.first_index + self.entries.len() as u64 - 1
        }
    }

    /// Term of the last log entry.
    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry. Indices are strictly sequential; a gap or
    /// regression is a caller bug surfaced as a log error.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected_index = self.last_index() + 1;
        if entry.index != expected_index {
            return Err(FabricError::Log(format!(
                "Expected index {}, got {}",
                expected_index, entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Get an entry by index.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        let offset = (index - self.first_index) as usize;
        self.entries.get(offset)
    }

    /// Term at a specific index, if known.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.first_index - 1 {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Entries starting from the given index.
    pub fn entries_from(&self, start_index: LogIndex) -> Vec<LogEntry> {
        if start_index > self.last_index() {
            return Vec::new();
        }
        let start = start_index.max(self.first_index);
        let offset = (start - self.first_index) as usize;
        self.entries.iter().skip(offset).cloned().collect()
    }

    /// Entries starting from the given index, capped at `limit`.
    pub fn entries_from_limit(&self, start_index: LogIndex, limit: usize) -> Vec<LogEntry> {
        if start_index > self.last_index() {
            return Vec::new();
        }
        let start = start_index.max(self.first_index);
        let offset = (start - self.first_index) as usize;
        self.entries.iter().skip(offset).take(limit).cloned().collect()
    }

    /// Entries in the inclusive range [start, end].
    pub fn entries_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        self.entries_from(start)
            .into_iter()
            .take_while(|e| e.index <= end)
            .collect()
    }

    /// Truncate the log from the given index (inclusive). Used when a
    /// follower discovers conflicting uncommitted entries.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index < self.first_index {
            self.entries.clear();
            return;
        }
        let keep = (index - self.first_index) as usize;
        self.entries.truncate(keep);
    }

    /// Continuity check: does our log contain the leader's preceding entry?
    pub fn matches(&self, prev_log_index: LogIndex, prev_log_term: Term) -> bool {
        if prev_log_index == 0 {
            return true;
        }
        match self.term_at(prev_log_index) {
            Some(term) => term == prev_log_term,
            None => false,
        }
    }

    /// Compact the log up to the given index, recording the snapshot term.
    pub fn compact(&mut self, up_to_index: LogIndex, snapshot_term: Term) {
        if up_to_index < self.first_index {
            return;
        }

        let entries_to_remove = (up_to_index - self.first_index + 1) as usize;
        for _ in 0..entries_to_remove.min(self.entries.len()) {
            self.entries.pop_front();
        }

        self.first_index = up_to_index + 1;
        self.snapshot_term = snapshot_term;
    }

    /// Election rule: a candidate's log is at least as up-to-date as ours
    /// if its last term is higher, or terms match and its index is >= ours.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_last_term = self.last_term();
        let our_last_index = self.last_index();

        if last_log_term != our_last_term {
            last_log_term > our_last_term
        } else {
            last_log_index >= our_last_index
        }
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}
