// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One TPM session tracked across save/load cycles and owner changes.
//!
//! Unlike transient objects, a session keeps the same handle for its
//! whole life; what moves is its context. The state machine:
//!
//! ```text
//! (StartAuthSession ok) ──► Loaded ──save──► SavedRm ──load──► Loaded
//!                                   Loaded ──client ContextSave──► SavedClient
//!        SavedClient ──matching ContextLoad──► SavedRm
//!        SavedClient ──owner closed──► SavedClientClosed (abandoned)
//!        SavedClientClosed ──claimed by ContextLoad──► SavedRm
//! ```
//!
//! Invariant: the context bytes are non-empty exactly in the three saved
//! states.

use bytes::Bytes;

use crate::resmgr::connection::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Resident in the device; only ever observed mid-command.
    Loaded,
    /// Saved by the resource manager between commands.
    SavedRm,
    /// Saved on explicit client request; context handed to the client.
    SavedClient,
    /// Saved by client whose connection closed; waiting in the
    /// abandonment queue for another connection to claim it.
    SavedClientClosed,
}

#[derive(Debug, Clone)]
pub struct SessionEntry {
    conn: ConnectionId,
    handle: u32,
    context: Bytes,
    state: SessionState,
}

impl SessionEntry {
    /// A session the device just created; it is loaded until the
    /// pipeline's post-processing saves it.
    pub fn new_loaded(conn: ConnectionId, handle: u32) -> Self {
        Self {
            conn,
            handle,
            context: Bytes::new(),
            state: SessionState::Loaded,
        }
    }

    #[inline]
    pub fn owner(&self) -> ConnectionId {
        self.conn
    }

    #[inline]
    pub fn handle(&self) -> u32 {
        self.handle
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub fn context(&self) -> &Bytes {
        &self.context
    }

    /// Byte-level match against a client-provided context body.
    #[inline]
    pub fn matches_context(&self, body: &[u8]) -> bool {
        !self.context.is_empty() && self.context == body
    }

    /// Loaded → SavedRm with the context the device just produced.
    pub fn saved_by_rm(&mut self, context: Bytes) {
        debug_assert_eq!(self.state, SessionState::Loaded);
        self.context = context;
        self.state = SessionState::SavedRm;
    }

    /// SavedRm → Loaded; the context has been replayed into the device.
    pub fn loaded(&mut self) {
        debug_assert_eq!(self.state, SessionState::SavedRm);
        self.context = Bytes::new();
        self.state = SessionState::Loaded;
    }

    /// SavedRm → SavedClient; the stored context is being handed to the
    /// client in a synthesized ContextSave reply.
    pub fn saved_by_client(&mut self) {
        debug_assert_eq!(self.state, SessionState::SavedRm);
        self.state = SessionState::SavedClient;
    }

    /// SavedClient → SavedClientClosed on owner teardown.
    pub fn abandoned(&mut self) {
        debug_assert_eq!(self.state, SessionState::SavedClient);
        self.state = SessionState::SavedClientClosed;
    }

    /// Back under management after a successful ContextLoad, possibly on
    /// behalf of a new owner.
    pub fn reclaimed(&mut self, new_owner: ConnectionId) {
        self.conn = new_owner;
        self.state = SessionState::SavedRm;
    }
}
