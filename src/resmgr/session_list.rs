// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Process-wide session registry plus the bounded abandonment queue.
//!
//! Abandoned sessions (saved by a client whose connection closed) leave
//! the main list and wait in a FIFO of at most [`MAX_ABANDONED`] entries
//! for another connection to claim them; pushing past the bound evicts
//! the oldest, which the caller must flush from the device.

use std::collections::VecDeque;

use tracing::debug;

use crate::resmgr::{
    connection::ConnectionId,
    session::{SessionEntry, SessionState},
};

/// Upper bound on sessions parked in the abandonment queue.
pub const MAX_ABANDONED: usize = 4;

/// Verdict a visitor returns for each entry during a mutating walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Keep,
    /// Drop from the list; the entry comes back in [`SessionSweep::removed`].
    Remove,
    /// Move into the abandonment queue (entry becomes `SavedClientClosed`).
    Transfer,
}

/// Outcome of [`SessionList::retain_visit`]: everything the caller still
/// has to flush from the device.
#[derive(Debug, Default)]
pub struct SessionSweep {
    pub removed: Vec<SessionEntry>,
    /// Oldest abandoned entries evicted past the FIFO bound.
    pub evicted: Vec<SessionEntry>,
}

#[derive(Debug)]
pub struct SessionList {
    entries: Vec<SessionEntry>,
    abandoned: VecDeque<SessionEntry>,
    per_conn_limit: usize,
}

impl SessionList {
    pub fn new(per_conn_limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            abandoned: VecDeque::new(),
            per_conn_limit,
        }
    }

    pub fn insert(&mut self, entry: SessionEntry) {
        debug!(handle = format_args!("0x{:08x}", entry.handle()), owner = %entry.owner(), "tracking session");
        self.entries.push(entry);
    }

    /// Untrack by handle, searching the abandonment queue too.
    pub fn remove_by_handle(&mut self, handle: u32) -> Option<SessionEntry> {
        if let Some(pos) = self.entries.iter().position(|e| e.handle() == handle) {
            return Some(self.entries.remove(pos));
        }
        self.abandoned
            .iter()
            .position(|e| e.handle() == handle)
            .and_then(|pos| self.abandoned.remove(pos))
    }

    pub fn lookup_by_handle(&self, handle: u32) -> Option<&SessionEntry> {
        self.entries.iter().find(|e| e.handle() == handle)
    }

    pub fn lookup_by_handle_mut(&mut self, handle: u32) -> Option<&mut SessionEntry> {
        self.entries.iter_mut().find(|e| e.handle() == handle)
    }

    /// Find a managed (non-abandoned) entry by its saved context bytes.
    pub fn lookup_by_context(&self, body: &[u8]) -> Option<&SessionEntry> {
        self.entries.iter().find(|e| e.matches_context(body))
    }

    /// Is the matching context parked in the abandonment queue?
    pub fn abandoned_by_context(&self, body: &[u8]) -> bool {
        self.abandoned.iter().any(|e| e.matches_context(body))
    }

    /// Transfer ownership of an abandoned session to `new_owner`;
    /// succeeds only for entries currently in the queue.
    pub fn claim(&mut self, body: &[u8], new_owner: ConnectionId) -> Option<u32> {
        let pos = self.abandoned.iter().position(|e| e.matches_context(body))?;
        let mut entry = self.abandoned.remove(pos)?;
        entry.reclaimed(new_owner);
        let handle = entry.handle();
        debug!(handle = format_args!("0x{handle:08x}"), owner = %new_owner, "abandoned session claimed");
        self.entries.push(entry);
        Some(handle)
    }

    /// Park an entry in the abandonment queue. Returns the evicted oldest
    /// entry when the queue overflows; the caller flushes it.
    pub fn abandon(&mut self, mut entry: SessionEntry) -> Option<SessionEntry> {
        entry.abandoned();
        self.abandoned.push_back(entry);
        if self.abandoned.len() > MAX_ABANDONED {
            self.abandoned.pop_front()
        } else {
            None
        }
    }

    /// Per-connection session quota test (abandoned entries are
    /// ownerless and do not count).
    pub fn is_full(&self, conn: ConnectionId) -> bool {
        self.entries.iter().filter(|e| e.owner() == conn).count() >= self.per_conn_limit
    }

    /// Handles of all entries currently in the loaded state.
    pub fn loaded_handles(&self) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|e| e.state() == SessionState::Loaded)
            .map(|e| e.handle())
            .collect()
    }

    /// Mutating walk: the visitor's verdicts are applied after the walk,
    /// so it may decide based on (and change) entry state without
    /// invalidating the iteration.
    pub fn retain_visit<F>(&mut self, mut visit: F) -> SessionSweep
    where F: FnMut(&mut SessionEntry) -> SessionAction {
        let actions: Vec<SessionAction> =
            self.entries.iter_mut().map(|e| visit(e)).collect();

        let mut sweep = SessionSweep::default();
        let entries = std::mem::take(&mut self.entries);
        for (entry, action) in entries.into_iter().zip(actions) {
            match action {
                SessionAction::Keep => self.entries.push(entry),
                SessionAction::Remove => sweep.removed.push(entry),
                SessionAction::Transfer => {
                    if let Some(old) = self.abandon(entry) {
                        sweep.evicted.push(old);
                    }
                },
            }
        }
        sweep
    }

    #[inline]
    pub fn abandoned_len(&self) -> usize {
        self.abandoned.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
