// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Mutable view over a TPM 2.0 command buffer.
//!
//! The manager never rebuilds a command; it parses just enough structure
//! to find the handle area and the auth area, rewrites handles in place,
//! and forwards the same buffer. Layout:
//!
//! ```text
//! header (10) | handle area (4 × N) | [auth area] | parameters
//! ```
//!
//! The auth area is present iff the header tag is `TPM2_ST_SESSIONS`:
//! a u32 `authorizationSize` followed by that many bytes of
//! `TPMS_AUTH_COMMAND` structures.

use anyhow::{Context, Result, bail, ensure};
use bytes::{Buf, BytesMut};

use crate::models::{
    code::{CcAttrs, CommandCode, TPMA_SESSION_CONTINUESESSION},
    header::{HEADER_LEN, RawTpmHeader, StructureTag},
};

/// Wire view for the session-attributes octet of a `TPMS_AUTH_COMMAND`.
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawSessionAttrs(u8);

impl RawSessionAttrs {
    #[inline]
    pub const fn new_raw(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn continue_session(&self) -> bool {
        self.0 & TPMA_SESSION_CONTINUESESSION != 0
    }

    /// The device discards the session after the command unless the
    /// client asked to continue it.
    #[inline]
    pub fn will_flush(&self) -> bool {
        !self.continue_session()
    }
}

/// One entry of the command auth area, reduced to what the pipeline
/// inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthSession {
    pub handle: u32,
    pub attrs: RawSessionAttrs,
}

/// A parsed TPM 2.0 command owned by the worker for the duration of one
/// pipeline pass.
#[derive(Debug)]
pub struct TpmCommand {
    buf: BytesMut,
    tag: StructureTag,
    code_raw: u32,
    code: Option<CommandCode>,
    attrs: CcAttrs,
}

impl TpmCommand {
    pub fn parse(buf: BytesMut) -> Result<Self> {
        let hdr = RawTpmHeader::read_from(&buf)?;
        hdr.validate_size(buf.len())?;
        let tag = hdr.structure_tag().context("bad command tag")?;
        let code_raw = hdr.code.get();
        let code = CommandCode::from_u32(code_raw);
        let attrs = code.map(|c| c.attrs()).unwrap_or_default();

        ensure!(
            buf.len() >= HEADER_LEN + 4 * attrs.handles as usize,
            "command 0x{code_raw:08x} too short for its handle area"
        );

        Ok(Self {
            buf,
            tag,
            code_raw,
            code,
            attrs,
        })
    }

    #[inline]
    pub fn tag(&self) -> StructureTag {
        self.tag
    }

    #[inline]
    pub fn code(&self) -> Option<CommandCode> {
        self.code
    }

    #[inline]
    pub fn code_raw(&self) -> u32 {
        self.code_raw
    }

    #[inline]
    pub fn attrs(&self) -> CcAttrs {
        self.attrs
    }

    #[inline]
    pub fn handle_count(&self) -> usize {
        self.attrs.handles as usize
    }

    pub fn handle(&self, idx: usize) -> u32 {
        let off = HEADER_LEN + 4 * idx;
        u32::from_be_bytes([
            self.buf[off],
            self.buf[off + 1],
            self.buf[off + 2],
            self.buf[off + 3],
        ])
    }

    pub fn handles(&self) -> Vec<u32> {
        (0..self.handle_count()).map(|i| self.handle(i)).collect()
    }

    /// Rewrite the handle at `idx` in place (big-endian).
    pub fn set_handle(&mut self, idx: usize, handle: u32) {
        let off = HEADER_LEN + 4 * idx;
        self.buf[off..off + 4].copy_from_slice(&handle.to_be_bytes());
    }

    /// Offset of the first byte after the handle area.
    #[inline]
    fn after_handles(&self) -> usize {
        HEADER_LEN + 4 * self.handle_count()
    }

    /// Walk the auth area. Empty for `NO_SESSIONS` commands.
    pub fn auth_sessions(&self) -> Result<Vec<AuthSession>> {
        if self.tag != StructureTag::Sessions {
            return Ok(Vec::new());
        }

        let off = self.after_handles();
        let mut rest = &self.buf[off..];
        ensure!(rest.len() >= 4, "auth area truncated (no authorizationSize)");
        let auth_len = rest.get_u32() as usize;
        ensure!(
            rest.len() >= auth_len,
            "authorizationSize {auth_len} exceeds buffer"
        );

        let mut area = &rest[..auth_len];
        let mut out = Vec::new();
        while !area.is_empty() {
            ensure!(area.len() >= 4 + 2, "auth entry truncated");
            let handle = area.get_u32();
            let nonce_len = area.get_u16() as usize;
            ensure!(area.len() >= nonce_len + 1 + 2, "auth nonce truncated");
            area.advance(nonce_len);
            let attrs = RawSessionAttrs::new_raw(area.get_u8());
            let hmac_len = area.get_u16() as usize;
            ensure!(area.len() >= hmac_len, "auth hmac truncated");
            area.advance(hmac_len);
            out.push(AuthSession { handle, attrs });
        }
        Ok(out)
    }

    /// Parameter bytes after the handle and auth areas.
    pub fn params(&self) -> Result<&[u8]> {
        let off = self.after_handles();
        match self.tag {
            StructureTag::NoSessions => Ok(&self.buf[off..]),
            StructureTag::Sessions => {
                let mut rest = &self.buf[off..];
                ensure!(rest.len() >= 4, "auth area truncated");
                let auth_len = rest.get_u32() as usize;
                ensure!(rest.len() >= auth_len, "auth area exceeds buffer");
                Ok(&rest[auth_len..])
            },
        }
    }

    /// `FlushContext` carries its victim handle as the first parameter.
    pub fn flush_handle(&self) -> Result<u32> {
        if self.code != Some(CommandCode::FlushContext) {
            bail!("flush_handle() on command 0x{:08x}", self.code_raw);
        }
        let mut params = self.params()?;
        ensure!(params.len() >= 4, "FlushContext missing handle parameter");
        Ok(params.get_u32())
    }

    /// `GetCapability` parameters: (capability, property, propertyCount).
    pub fn capability_args(&self) -> Result<(u32, u32, u32)> {
        if self.code != Some(CommandCode::GetCapability) {
            bail!("capability_args() on command 0x{:08x}", self.code_raw);
        }
        let mut params = self.params()?;
        ensure!(params.len() >= 12, "GetCapability parameters truncated");
        Ok((params.get_u32(), params.get_u32(), params.get_u32()))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}
