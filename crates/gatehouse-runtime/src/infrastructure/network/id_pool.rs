//! Cycling connection-id pool.
//!
//! Connection ids are unique only among currently open connections: the pool
//! hands out fresh ids monotonically and recycles released ids in FIFO
//! order, so an id is not handed out again until every id released before it
//! has cycled through first.  The pool, not a counter, is the source of
//! uniqueness.

use gatehouse_core::ConnectionId;
use std::collections::VecDeque;

/// Allocator for connection ids with release-then-reuse discipline.
#[derive(Debug, Default)]
pub struct IdPool {
    next_fresh: ConnectionId,
    released: VecDeque<ConnectionId>,
}

impl IdPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next available id: the oldest released id if any,
    /// otherwise a fresh one.
    pub fn next(&mut self) -> ConnectionId {
        if let Some(id) = self.released.pop_front() {
            return id;
        }
        self.next_fresh += 1;
        self.next_fresh
    }

    /// Returns `id` to the pool for eventual reuse.
    ///
    /// Must only be called after the connection owning `id` has been removed
    /// from the active table and its close event has been emitted.
    pub fn release(&mut self, id: ConnectionId) {
        self.released.push_back(id);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
