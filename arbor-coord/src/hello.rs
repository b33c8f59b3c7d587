//! State messages and the hello responder.

use std::sync::Arc;

use serde_json::json;

use arbor_overlay::Payload;
use arbor_rankset::RankSet;

use crate::wire::{JobId, StateEntry};

/// A typed state message fanned out along the tree.
///
/// One message may sit in several peer pending queues at once, so it is
/// shared by reference count (`Arc<StateMessage>`).
#[derive(Debug)]
pub(crate) struct StateMessage {
    /// Message type, e.g. `state-update` or `kill`.
    pub kind: String,
    /// The set of ranks the message is addressed to.
    pub idset: RankSet,
    /// The `data` arm of the payload, shaped per `kind`.
    pub data: Payload,
}

impl StateMessage {
    pub fn new(kind: &str, idset: RankSet, data: Payload) -> StateMessage {
        StateMessage {
            kind: kind.to_string(),
            idset,
            data,
        }
    }
}

/// Accumulates state-update entries between flushes.
///
/// Rapid successive job starts batch into a single downward message: each
/// push appends an entry and widens the receiver set; `pop` produces one
/// `state-update` message covering everything accumulated and resets the
/// responder, so no batch ever spans a pop.
#[derive(Debug, Default)]
pub(crate) struct HelloResponder {
    entries: Vec<StateEntry>,
    ranks: RankSet,
}

impl HelloResponder {
    pub fn new() -> HelloResponder {
        HelloResponder::default()
    }

    /// The number of pending entries.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Append an entry, returning the new pending count.
    ///
    /// A return of 1 marks the transition from empty: the caller arms the
    /// coalescing flush timer exactly then.
    pub fn push(&mut self, kind: &str, id: JobId, userid: u32, ranks: &RankSet) -> usize {
        self.entries.push(StateEntry {
            id,
            userid,
            kind: kind.to_string(),
            ranks: ranks.clone(),
        });
        self.ranks.union_with(ranks);
        self.entries.len()
    }

    /// Produce one `state-update` message from the pending entries and
    /// reset, or `None` when nothing is pending.
    pub fn pop(&mut self) -> Option<Arc<StateMessage>> {
        if self.entries.is_empty() {
            return None;
        }
        let entries = std::mem::take(&mut self.entries);
        let ranks = std::mem::take(&mut self.ranks);
        let data = json!({ "jobs": entries });
        Some(Arc::new(StateMessage::new("state-update", ranks, data)))
    }
}
