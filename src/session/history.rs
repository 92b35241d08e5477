//! Session-command history.
//!
//! Commands that affect session state are recorded so a replacement
//! backend connection can be brought up to date by replaying them as one
//! pipeline. Every element generates exactly one reply and none depends
//! on another's reply, so the batch executes without interleaving logic.

use std::collections::HashMap;

use bytes::Bytes;

use crate::backend::ReplyShape;

/// History ids live in `1 ..= u32::MAX - 2`; 0 and `u32::MAX` are
/// reserved.
const FIRST_ID: u32 = 1;
const LAST_ID: u32 = u32::MAX - 2;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: u32,
    pub payload: Bytes,
    pub shape: ReplyShape,
    /// Whether the authoritative reply was an OK; replays compare
    /// against this.
    pub expected_ok: bool,
}

/// Outcome digest of a completed reply: (ok, error code, affected rows).
pub type ResponseDigest = (bool, u16, u64);

#[derive(Debug, Default)]
pub struct SessionHistory {
    entries: Vec<HistoryEntry>,
    next_id: u32,
    /// Command routed but whose authoritative reply is still pending.
    pending: Option<HistoryEntry>,
    /// First-seen outcome per id, for comparing late replies from other
    /// backends against the accepted one.
    responses: HashMap<u32, ResponseDigest>,
}

impl SessionHistory {
    pub fn new() -> Self {
        Self {
            next_id: FIRST_ID,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocate the next id, wrapping back to 1 before `u32::MAX - 1`.
    pub fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = if self.next_id >= LAST_ID {
            FIRST_ID
        } else {
            self.next_id + 1
        };
        id
    }

    /// Record a command whose reply is not yet complete. Replaces any
    /// previously pending entry (one command is in flight at a time).
    pub fn record_pending(&mut self, id: u32, payload: Bytes, shape: ReplyShape) {
        self.pending = Some(HistoryEntry {
            id,
            payload,
            shape,
            expected_ok: false,
        });
    }

    /// Append frames of a large command still being streamed.
    pub fn append_pending(&mut self, data: &[u8]) {
        if let Some(pending) = &mut self.pending {
            let mut payload = Vec::with_capacity(pending.payload.len() + data.len());
            payload.extend_from_slice(&pending.payload);
            payload.extend_from_slice(data);
            pending.payload = Bytes::from(payload);
        }
    }

    /// The authoritative reply completed: commit the pending command.
    pub fn commit_pending(&mut self, digest: ResponseDigest) {
        if let Some(mut entry) = self.pending.take() {
            entry.expected_ok = digest.0;
            self.responses.insert(entry.id, digest);
            self.entries.push(entry);
        }
    }

    /// The command failed before any reply; nothing to remember.
    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// COM_STMT_CLOSE removes the COM_STMT_PREPARE with the same id, so
    /// replays skip the pair entirely.
    pub fn remove_prepare(&mut self, id: u32) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.responses.remove(&id);
        before != self.entries.len()
    }

    /// COM_CHANGE_USER starts a clean slate.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.responses.clear();
        self.pending = None;
    }

    /// The replay pipeline for a fresh backend connection.
    pub fn replay_list(&self) -> Vec<(u32, Bytes, ReplyShape)> {
        self.entries
            .iter()
            .map(|e| (e.id, e.payload.clone(), e.shape))
            .collect()
    }

    pub fn entry(&self, id: u32) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Compare a late reply against the authoritative outcome. The first
    /// recorded outcome wins; divergence is reported as `false`.
    pub fn check_response(&mut self, id: u32, digest: ResponseDigest) -> bool {
        match self.responses.get(&id) {
            Some(expected) => *expected == digest,
            None => {
                self.responses.insert(id, digest);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(byte: u8) -> Bytes {
        Bytes::from(vec![byte])
    }

    #[test]
    fn ids_start_at_one_and_wrap() {
        let mut history = SessionHistory::new();
        assert_eq!(history.allocate_id(), 1);
        assert_eq!(history.allocate_id(), 2);

        history.next_id = LAST_ID;
        assert_eq!(history.allocate_id(), LAST_ID);
        // Wrapped before reaching the reserved ceiling.
        assert_eq!(history.allocate_id(), 1);
    }

    #[test]
    fn id_never_reserved_values() {
        let mut history = SessionHistory::new();
        history.next_id = LAST_ID - 1;
        for _ in 0..5 {
            let id = history.allocate_id();
            assert_ne!(id, 0);
            assert_ne!(id, u32::MAX);
            assert_ne!(id, u32::MAX - 1);
        }
    }

    #[test]
    fn pending_commits_into_entries() {
        let mut history = SessionHistory::new();
        let id = history.allocate_id();
        history.record_pending(id, payload(0x03), ReplyShape::Generic);
        assert!(history.is_empty());

        history.commit_pending((true, 0, 0));
        assert_eq!(history.len(), 1);
        assert!(history.entry(id).unwrap().expected_ok);
    }

    #[test]
    fn large_command_appends() {
        let mut history = SessionHistory::new();
        let id = history.allocate_id();
        history.record_pending(id, payload(0x03), ReplyShape::Generic);
        history.append_pending(&[1, 2, 3]);
        history.commit_pending((true, 0, 0));
        assert_eq!(&history.entry(id).unwrap().payload[..], &[0x03, 1, 2, 3]);
    }

    #[test]
    fn stmt_close_removes_prepare() {
        let mut history = SessionHistory::new();
        let id = history.allocate_id();
        history.record_pending(
            id,
            payload(0x16),
            ReplyShape::Prepare {
                proxy_statement_id: id,
            },
        );
        history.commit_pending((true, 0, 0));
        assert_eq!(history.len(), 1);

        assert!(history.remove_prepare(id));
        assert!(history.is_empty());
        assert!(history.replay_list().is_empty());
    }

    #[test]
    fn change_user_clears_everything() {
        let mut history = SessionHistory::new();
        for _ in 0..3 {
            let id = history.allocate_id();
            history.record_pending(id, payload(0x03), ReplyShape::Generic);
            history.commit_pending((true, 0, 0));
        }
        assert_eq!(history.len(), 3);
        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn late_replies_compared_to_first() {
        let mut history = SessionHistory::new();
        let id = history.allocate_id();
        history.record_pending(id, payload(0x03), ReplyShape::Generic);
        history.commit_pending((true, 0, 1));

        assert!(history.check_response(id, (true, 0, 1)));
        assert!(!history.check_response(id, (false, 1064, 0)));
    }
}
