// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-command engine.
//!
//! Every inbound command runs the same sequence: quota check, special
//! virtualization, handle/auth loads, device round-trip, response handle
//! mapping, emission, then save/flush of everything the command pulled
//! into the device. The response reaches the sink before the post-pass
//! runs, so a client never waits on cleanup.
//!
//! A failed load does not abort the command: the buffer is forwarded
//! as-is and the device produces the canonical error for the dangling
//! handle.

use anyhow::{Result, anyhow};
use bytes::BytesMut;
use tracing::{debug, warn};

use crate::{
    broker::{AccessBroker, ResponseSink, SinkItem},
    models::{
        command::TpmCommand,
        handle::HandleKind,
        rc::{RESMGR_RC_FAILURE, RESMGR_RC_OBJECT_MEMORY, RESMGR_RC_SESSION_MEMORY},
        response::TpmResponse,
    },
    resmgr::{
        connection::Connection,
        handle_map::HandleMapEntry,
        session::{SessionEntry, SessionState},
        session_list::SessionList,
        special::{SpecialCtx, dispatch_special},
    },
};

pub struct Pipeline<'a, B, S> {
    pub broker: &'a mut B,
    pub sink: &'a S,
    pub sessions: &'a mut SessionList,
    pub conn: &'a mut Connection,
}

impl<'a, B: AccessBroker, S: ResponseSink> Pipeline<'a, B, S> {
    /// Run one command through all nine stages.
    pub async fn run(mut self, buf: BytesMut) -> Result<()> {
        let mut cmd = TpmCommand::parse(buf)?;
        let conn_id = self.conn.id();
        debug!(conn = %conn_id, cc = format_args!("0x{:08x}", cmd.code_raw()), "command");

        // (1) quotas
        if let Some(code) = cmd.code() {
            if code.allocates_transient() && self.conn.transients.is_full() {
                debug!(conn = %conn_id, "transient quota exhausted");
                return self.emit(TpmResponse::error(RESMGR_RC_OBJECT_MEMORY));
            }
            if code.allocates_session() && self.sessions.is_full(conn_id) {
                debug!(conn = %conn_id, "session quota exhausted");
                return self.emit(TpmResponse::error(RESMGR_RC_SESSION_MEMORY));
            }
        }

        // (2) commands virtualized without the device
        let mut ctx = SpecialCtx {
            conn: &mut *self.conn,
            sessions: &mut *self.sessions,
        };
        if let Some(resp) = dispatch_special(&mut ctx, &cmd)? {
            return self.emit(resp);
        }

        // (3) + (4) make every referenced context resident
        let mut loaded_transients = self.load_handle_area(&mut cmd).await;
        self.load_auth_area(&cmd).await;

        // (5) device round-trip
        let mut resp = match self.broker.send_command(cmd.as_bytes()).await {
            Ok(raw) => TpmResponse::parse(raw).unwrap_or_else(|e| {
                warn!(conn = %conn_id, error = %e, "malformed device response");
                TpmResponse::error(RESMGR_RC_FAILURE)
            }),
            Err(e) => {
                warn!(conn = %conn_id, error = %e, "device transport failed");
                TpmResponse::error(RESMGR_RC_FAILURE)
            },
        };

        // (6) virtualize the response handle
        if resp.is_success() && cmd.attrs().response_has_handle() {
            resp = self
                .map_response_handle(resp, &mut loaded_transients)
                .await?;
        }

        // (7) answer first, clean up after
        self.sink.enqueue(SinkItem::Response {
            conn: conn_id,
            buf: resp.into_bytes(),
        })?;

        // (8) park every session the command pulled in
        self.save_loaded_sessions().await;

        // (9) save out (or drop) the transients
        self.post_process_transients(&cmd, &loaded_transients).await;

        Ok(())
    }

    fn emit(&mut self, resp: TpmResponse) -> Result<()> {
        self.sink.enqueue(SinkItem::Response {
            conn: self.conn.id(),
            buf: resp.into_bytes(),
        })
    }

    /// Stage 3: load transient contexts referenced by the handle area and
    /// rewrite virtual handles to the physical ones the device assigned.
    /// Returns the virtual handles that are now resident.
    async fn load_handle_area(&mut self, cmd: &mut TpmCommand) -> Vec<u32> {
        let mut loaded = Vec::new();
        for idx in 0..cmd.handle_count() {
            let handle = cmd.handle(idx);
            match HandleKind::of(handle) {
                HandleKind::Transient => {
                    let Some(entry) = self.conn.transients.lookup(handle) else {
                        warn!(conn = %self.conn.id(), vhandle = format_args!("0x{handle:08x}"), "unknown virtual handle in command");
                        continue;
                    };
                    if entry.is_loaded() {
                        // Second reference within one command; reuse the
                        // physical handle from the first load.
                        cmd.set_handle(idx, entry.phandle);
                        continue;
                    }
                    let context = entry.context.clone();
                    match self.broker.context_load(&context).await {
                        Ok(phandle) => {
                            if let Some(entry) = self.conn.transients.lookup_mut(handle)
                            {
                                entry.phandle = phandle;
                            }
                            cmd.set_handle(idx, phandle);
                            loaded.push(handle);
                        },
                        Err(e) => {
                            warn!(vhandle = format_args!("0x{handle:08x}"), error = %e, "transient context load failed");
                        },
                    }
                },
                HandleKind::HmacSession | HandleKind::PolicySession => {
                    if let Err(e) = self.load_session(handle, false).await {
                        warn!(handle = format_args!("0x{handle:08x}"), error = %e, "session load failed");
                    }
                },
                HandleKind::Other(_) => {},
            }
        }
        loaded
    }

    /// Stage 4: load the sessions the auth area references. A session
    /// whose CONTINUESESSION bit is clear is making its last trip; the
    /// device flushes it with the command, so tracking ends here.
    async fn load_auth_area(&mut self, cmd: &TpmCommand) {
        let auths = match cmd.auth_sessions() {
            Ok(a) => a,
            Err(e) => {
                warn!(conn = %self.conn.id(), error = %e, "malformed auth area");
                return;
            },
        };
        for auth in auths {
            if !HandleKind::of(auth.handle).is_session() {
                continue;
            }
            if let Err(e) = self.load_session(auth.handle, auth.attrs.will_flush()).await
            {
                warn!(handle = format_args!("0x{:08x}", auth.handle), error = %e, "auth session load failed");
            }
        }
    }

    /// The session-load helper: silently skips handles the list does not
    /// track, sessions of other connections, and sessions not saved by
    /// the manager — in each case the device renders the verdict.
    async fn load_session(&mut self, handle: u32, will_flush: bool) -> Result<()> {
        let conn_id = self.conn.id();
        let Some(entry) = self.sessions.lookup_by_handle(handle) else {
            return Ok(());
        };
        if entry.owner() != conn_id {
            warn!(handle = format_args!("0x{handle:08x}"), owner = %entry.owner(), conn = %conn_id, "session owned by another connection");
            return Ok(());
        }
        if entry.state() != SessionState::SavedRm {
            warn!(handle = format_args!("0x{handle:08x}"), state = ?entry.state(), "session not loadable");
            return Ok(());
        }

        let context = entry.context().clone();
        match self.broker.context_load(&context).await {
            Err(e) => {
                self.sessions.remove_by_handle(handle);
                Err(e)
            },
            Ok(_phandle) => {
                if will_flush {
                    // Last use: the command consumes the session.
                    self.sessions.remove_by_handle(handle);
                } else if let Some(entry) = self.sessions.lookup_by_handle_mut(handle) {
                    entry.loaded();
                }
                Ok(())
            },
        }
    }

    /// Stage 6: a successful response carrying a handle either creates a
    /// new virtual transient mapping or registers a fresh session.
    async fn map_response_handle(
        &mut self,
        mut resp: TpmResponse,
        loaded_transients: &mut Vec<u32>,
    ) -> Result<TpmResponse> {
        let phandle = resp.handle()?;
        let conn_id = self.conn.id();
        match HandleKind::of(phandle) {
            HandleKind::Transient => {
                let Some(vhandle) = self.conn.transients.next_vhandle() else {
                    // Virtual range exhausted; give the slot back to the
                    // device and report memory pressure.
                    warn!(conn = %conn_id, "virtual handle range exhausted");
                    if let Err(e) = self.broker.context_flush(phandle).await {
                        warn!(error = %e, "flush of unmapped object failed");
                    }
                    return Ok(TpmResponse::error(RESMGR_RC_OBJECT_MEMORY));
                };
                self.conn
                    .transients
                    .insert(HandleMapEntry::new(vhandle, phandle));
                loaded_transients.push(vhandle);
                resp.set_handle(vhandle)?;
                debug!(conn = %conn_id, vhandle = format_args!("0x{vhandle:08x}"), phandle = format_args!("0x{phandle:08x}"), "transient mapped");
            },
            HandleKind::HmacSession | HandleKind::PolicySession => {
                let owner = self.sessions.lookup_by_handle(phandle).map(|e| e.owner());
                match owner {
                    None => {
                        self.sessions
                            .insert(SessionEntry::new_loaded(conn_id, phandle));
                    },
                    Some(owner) if owner != conn_id => {
                        return Err(anyhow!(
                            "device returned session 0x{phandle:08x} owned by {owner}"
                        ));
                    },
                    Some(_) => {},
                }
            },
            HandleKind::Other(_) => {},
        }
        Ok(resp)
    }

    /// Stage 8: every session still loaded is saved back out; a save
    /// failure costs the session its tracking (and its device slot).
    async fn save_loaded_sessions(&mut self) {
        for handle in self.sessions.loaded_handles() {
            match self.broker.context_save(handle).await {
                Ok(context) => {
                    if let Some(entry) = self.sessions.lookup_by_handle_mut(handle) {
                        entry.saved_by_rm(context);
                    }
                },
                Err(e) => {
                    warn!(handle = format_args!("0x{handle:08x}"), error = %e, "session context save failed");
                    if let Err(e) = self.broker.context_flush(handle).await {
                        warn!(handle = format_args!("0x{handle:08x}"), error = %e, "session flush failed");
                    }
                    self.sessions.remove_by_handle(handle);
                },
            }
        }
    }

    /// Stage 9: transients the command loaded are saved out and flushed,
    /// unless the command's FLUSHED attribute says the device already
    /// dropped them.
    async fn post_process_transients(&mut self, cmd: &TpmCommand, loaded: &[u32]) {
        let flushed_by_device = cmd.attrs().flushed();
        for &vhandle in loaded {
            if flushed_by_device {
                self.conn.transients.remove(vhandle);
                continue;
            }
            let Some(entry) = self.conn.transients.lookup(vhandle) else {
                continue;
            };
            let phandle = entry.phandle;
            match self.broker.context_saveflush(phandle).await {
                Ok(context) => {
                    if let Some(entry) = self.conn.transients.lookup_mut(vhandle) {
                        entry.context = context;
                        entry.phandle = 0;
                    }
                },
                Err(e) => {
                    warn!(vhandle = format_args!("0x{vhandle:08x}"), error = %e, "transient context save failed");
                    if let Some(entry) = self.conn.transients.lookup_mut(vhandle) {
                        entry.phandle = 0;
                    }
                },
            }
        }
    }
}
