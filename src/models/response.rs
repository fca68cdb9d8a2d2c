// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TPM 2.0 response buffers: parsing device replies and synthesizing the
//! replies the manager answers on the device's behalf.

use anyhow::{Context, Result, ensure};
use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::IntoBytes;

use crate::models::{
    code::TPM2_CAP_HANDLES,
    header::{HEADER_LEN, RawTpmHeader, StructureTag},
    rc::TPM2_RC_SUCCESS,
};

#[derive(Debug)]
pub struct TpmResponse {
    buf: BytesMut,
    tag: StructureTag,
    rc: u32,
}

impl TpmResponse {
    pub fn parse(buf: BytesMut) -> Result<Self> {
        let hdr = RawTpmHeader::read_from(&buf)?;
        hdr.validate_size(buf.len())?;
        let tag = hdr.structure_tag().context("bad response tag")?;
        let rc = hdr.code.get();
        Ok(Self { buf, tag, rc })
    }

    #[inline]
    pub fn tag(&self) -> StructureTag {
        self.tag
    }

    #[inline]
    pub fn rc(&self) -> u32 {
        self.rc
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.rc == TPM2_RC_SUCCESS
    }

    /// The handle right after the header, for responses to commands whose
    /// attributes declare one.
    pub fn handle(&self) -> Result<u32> {
        ensure!(
            self.buf.len() >= HEADER_LEN + 4,
            "response too short for a handle"
        );
        Ok(u32::from_be_bytes([
            self.buf[HEADER_LEN],
            self.buf[HEADER_LEN + 1],
            self.buf[HEADER_LEN + 2],
            self.buf[HEADER_LEN + 3],
        ]))
    }

    /// Rewrite the response handle in place (physical → virtual).
    pub fn set_handle(&mut self, handle: u32) -> Result<()> {
        ensure!(
            self.buf.len() >= HEADER_LEN + 4,
            "response too short for a handle"
        );
        self.buf[HEADER_LEN..HEADER_LEN + 4].copy_from_slice(&handle.to_be_bytes());
        Ok(())
    }

    /// Body bytes after the header.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.buf[HEADER_LEN..]
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    // ── synthesized replies ──────────────────────────────────────────────

    fn synthesize(rc: u32, body: &[u8]) -> Self {
        let size = (HEADER_LEN + body.len()) as u32;
        let hdr = RawTpmHeader::new(StructureTag::NoSessions, size, rc);
        let mut buf = BytesMut::with_capacity(size as usize);
        buf.put_slice(hdr.as_bytes());
        buf.put_slice(body);
        Self {
            buf,
            tag: StructureTag::NoSessions,
            rc,
        }
    }

    /// Bare header carrying an error code.
    pub fn error(rc: u32) -> Self {
        Self::synthesize(rc, &[])
    }

    /// Bare success header, e.g. for a virtualized `FlushContext`.
    pub fn success() -> Self {
        Self::synthesize(TPM2_RC_SUCCESS, &[])
    }

    /// `ContextSave` reply: the stored device-format context as the body.
    pub fn context_save_reply(context: &[u8]) -> Self {
        Self::synthesize(TPM2_RC_SUCCESS, context)
    }

    /// `ContextLoad` reply: the stable session handle.
    pub fn context_load_reply(handle: u32) -> Self {
        Self::synthesize(TPM2_RC_SUCCESS, &handle.to_be_bytes())
    }

    /// `GetCapability(TPM2_CAP_HANDLES)` reply over the given handles.
    pub fn capability_handles_reply(more_data: bool, handles: &[u32]) -> Self {
        let mut body = BytesMut::with_capacity(1 + 4 + 4 + 4 * handles.len());
        body.put_u8(more_data as u8);
        body.put_u32(TPM2_CAP_HANDLES);
        body.put_u32(handles.len() as u32);
        for h in handles {
            body.put_u32(*h);
        }
        Self::synthesize(TPM2_RC_SUCCESS, &body)
    }
}
