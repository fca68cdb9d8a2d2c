// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Commands the manager answers (fully or partly) on the device's
//! behalf: FlushContext, ContextSave, ContextLoad, and the handle
//! enumeration of GetCapability.
//!
//! A handler returns `Ok(Some(response))` to short-circuit the pipeline,
//! `Ok(None)` to let the command fall through to the device, and `Err`
//! to refuse the command without any reply (client protocol violation).

use anyhow::{Result, bail};
use enum_dispatch::enum_dispatch;
use tracing::{debug, warn};

use crate::{
    models::{
        code::{CommandCode, TPM2_CAP_HANDLES},
        command::TpmCommand,
        context::TpmsContext,
        handle::HandleKind,
        rc::RC_FLUSH_UNKNOWN_HANDLE,
        response::TpmResponse,
    },
    resmgr::{
        connection::Connection, session::SessionState, session_list::SessionList,
    },
};

/// Mutable state a special handler may touch.
pub struct SpecialCtx<'a> {
    pub conn: &'a mut Connection,
    pub sessions: &'a mut SessionList,
}

#[enum_dispatch]
pub trait SpecialCommand {
    fn try_handle(
        &self,
        ctx: &mut SpecialCtx<'_>,
        cmd: &TpmCommand,
    ) -> Result<Option<TpmResponse>>;
}

#[enum_dispatch(SpecialCommand)]
pub enum SpecialHandler {
    Flush(FlushContextHandler),
    Save(ContextSaveHandler),
    Load(ContextLoadHandler),
    Caps(GetCapabilityHandler),
}

/// Offer the command to the matching handler, if any.
pub fn dispatch_special(
    ctx: &mut SpecialCtx<'_>,
    cmd: &TpmCommand,
) -> Result<Option<TpmResponse>> {
    let handler: SpecialHandler = match cmd.code() {
        Some(CommandCode::FlushContext) => FlushContextHandler.into(),
        Some(CommandCode::ContextSave) => ContextSaveHandler.into(),
        Some(CommandCode::ContextLoad) => ContextLoadHandler.into(),
        Some(CommandCode::GetCapability) => GetCapabilityHandler.into(),
        _ => return Ok(None),
    };
    handler.try_handle(ctx, cmd)
}

pub struct FlushContextHandler;

impl SpecialCommand for FlushContextHandler {
    fn try_handle(
        &self,
        ctx: &mut SpecialCtx<'_>,
        cmd: &TpmCommand,
    ) -> Result<Option<TpmResponse>> {
        let handle = cmd.flush_handle()?;
        match HandleKind::of(handle) {
            HandleKind::Transient => {
                // The handle the client names is virtual; the object was
                // never left loaded, so dropping the entry is the flush.
                if ctx.conn.transients.remove(handle).is_some() {
                    debug!(conn = %ctx.conn.id(), vhandle = format_args!("0x{handle:08x}"), "virtual flush");
                    Ok(Some(TpmResponse::success()))
                } else {
                    warn!(conn = %ctx.conn.id(), vhandle = format_args!("0x{handle:08x}"), "flush of unknown virtual handle");
                    Ok(Some(TpmResponse::error(RC_FLUSH_UNKNOWN_HANDLE)))
                }
            },
            HandleKind::HmacSession | HandleKind::PolicySession => {
                // Untrack and let the device act on the flush itself.
                if ctx.sessions.remove_by_handle(handle).is_some() {
                    debug!(handle = format_args!("0x{handle:08x}"), "session untracked on flush");
                }
                Ok(None)
            },
            HandleKind::Other(_) => Ok(None),
        }
    }
}

pub struct ContextSaveHandler;

impl SpecialCommand for ContextSaveHandler {
    fn try_handle(
        &self,
        ctx: &mut SpecialCtx<'_>,
        cmd: &TpmCommand,
    ) -> Result<Option<TpmResponse>> {
        let handle = cmd.handle(0);
        if !HandleKind::of(handle).is_session() {
            return Ok(None);
        }

        let conn_id = ctx.conn.id();
        let Some(entry) = ctx.sessions.lookup_by_handle_mut(handle) else {
            // Unknown session; the device will produce the verdict.
            return Ok(None);
        };
        if entry.owner() != conn_id {
            bail!(
                "ContextSave of session 0x{handle:08x} owned by {} refused for {conn_id}",
                entry.owner()
            );
        }
        if entry.state() != SessionState::SavedRm {
            bail!(
                "ContextSave of session 0x{handle:08x} in state {:?}",
                entry.state()
            );
        }

        entry.saved_by_client();
        debug!(conn = %conn_id, handle = format_args!("0x{handle:08x}"), "session saved by client");
        Ok(Some(TpmResponse::context_save_reply(entry.context())))
    }
}

pub struct ContextLoadHandler;

impl SpecialCommand for ContextLoadHandler {
    fn try_handle(
        &self,
        ctx: &mut SpecialCtx<'_>,
        cmd: &TpmCommand,
    ) -> Result<Option<TpmResponse>> {
        let body = cmd.params()?;
        let parsed = TpmsContext::parse(body)?;
        if !parsed.saved_kind().is_session() {
            return Ok(None);
        }

        let conn_id = ctx.conn.id();
        if let Some((handle, owner)) = ctx
            .sessions
            .lookup_by_context(body)
            .map(|e| (e.handle(), e.owner()))
        {
            if owner != conn_id {
                bail!(
                    "ContextLoad of session 0x{handle:08x} owned by {owner} refused \
                     for {conn_id}"
                );
            }
            if let Some(entry) = ctx.sessions.lookup_by_handle_mut(handle) {
                entry.reclaimed(conn_id);
            }
            debug!(conn = %conn_id, handle = format_args!("0x{handle:08x}"), "client context reloaded");
            return Ok(Some(TpmResponse::context_load_reply(handle)));
        }

        if let Some(handle) = ctx.sessions.claim(body, conn_id) {
            return Ok(Some(TpmResponse::context_load_reply(handle)));
        }

        // Unknown context: the device either accepts it (the response
        // handle shows up in post-processing) or rejects it.
        Ok(None)
    }
}

pub struct GetCapabilityHandler;

impl SpecialCommand for GetCapabilityHandler {
    fn try_handle(
        &self,
        ctx: &mut SpecialCtx<'_>,
        cmd: &TpmCommand,
    ) -> Result<Option<TpmResponse>> {
        let (cap, prop, count) = cmd.capability_args()?;
        if cap != TPM2_CAP_HANDLES || !HandleKind::of(prop).is_transient() {
            return Ok(None);
        }

        let eligible: Vec<u32> = ctx
            .conn
            .transients
            .keys_sorted()
            .into_iter()
            .filter(|k| *k >= prop)
            .collect();
        let take = eligible.len().min(count as usize);
        let more_data = eligible.len() > take;
        debug!(conn = %ctx.conn.id(), total = eligible.len(), take, more_data, "virtual handle enumeration");
        Ok(Some(TpmResponse::capability_handles_reply(
            more_data,
            &eligible[..take],
        )))
    }
}
