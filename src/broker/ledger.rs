//! Call deduplication.
//!
//! Clients may attach a `call_id` to an operation and retry it freely; only
//! the first arrival of an id is executed. Ids are stored as blake3 digests so
//! each entry has a fixed size regardless of what the client sent.
//!
//! Entries are never expired. A long running process grows this set for as
//! long as clients keep sending fresh ids.

use blake3::hash;
use hashbrown::HashSet;
use parking_lot::Mutex;
use tracing::{debug, debug_span, Span};

use super::{hex::HexDisplayExt, identity::Operation};

pub type CallDigest = [u8; 32];

pub fn call_digest(call_id: &str) -> CallDigest {
    *hash(call_id.as_bytes()).as_bytes()
}

/// Span wrapping one broker operation, tagged with the call digest when the
/// client sent an id.
pub fn call_span(op: Operation, call_id: Option<&str>) -> Span {
    match call_id.filter(|id| !id.is_empty()) {
        Some(id) => debug_span!("call", op = %op, call = %call_digest(id).short_hex()),
        None => debug_span!("call", op = %op),
    }
}

#[derive(Default)]
pub struct CallLedger {
    seen: Mutex<HashSet<CallDigest>>,
}

impl CallLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `call_id` and reports whether it had been seen before.
    ///
    /// An absent or empty id is never recorded and always reads as new.
    pub fn already_handled(&self, call_id: Option<&str>) -> bool {
        let call_id = match call_id {
            Some(id) if !id.is_empty() => id,
            _ => return false,
        };
        let digest = call_digest(call_id);
        let replay = !self.seen.lock().insert(digest);
        if replay {
            debug!(call = %digest.short_hex(), "call id replayed");
        }
        replay
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
