use std::collections::HashMap;

use crate::registry::SessionId;
use crate::signaling::IceCandidate;

/// Candidates held per session. A browser gathers a handful per media
/// line; anything past this is dropped.
pub const MAX_PENDING_PER_SESSION: usize = 64;

/// Candidates received from a browser before its WebRTC endpoint exists.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: HashMap<SessionId, Vec<IceCandidate>>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a candidate. Returns `false` when the session's queue is full
    /// and the candidate was dropped.
    pub fn enqueue(&mut self, id: SessionId, candidate: IceCandidate) -> bool {
        let queued = self.pending.entry(id).or_default();
        if queued.len() >= MAX_PENDING_PER_SESSION {
            return false;
        }
        queued.push(candidate);
        true
    }

    /// Hand every buffered candidate for `id` to `sink` in arrival order and
    /// forget the queue. Returns how many were delivered.
    pub fn drain_into<F>(&mut self, id: SessionId, mut sink: F) -> usize
    where
        F: FnMut(IceCandidate),
    {
        let Some(queued) = self.pending.remove(&id) else {
            return 0;
        };
        let count = queued.len();
        for candidate in queued {
            sink(candidate);
        }
        count
    }

    pub fn clear(&mut self, id: SessionId) {
        self.pending.remove(&id);
    }

    #[cfg(test)]
    pub fn pending(&self, id: SessionId) -> usize {
        self.pending.get(&id).map_or(0, Vec::len)
    }
}
