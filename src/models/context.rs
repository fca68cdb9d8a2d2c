// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `TPMS_CONTEXT` — the structure `ContextSave` emits and `ContextLoad`
//! consumes (TPM 2.0 Structures, § 14.1):
//!
//! ```text
//! u64  sequence
//! u32  savedHandle
//! u32  hierarchy
//! u16  contextBlob.size
//! [u8] contextBlob.buffer
//! ```
//!
//! The blob itself is opaque to the manager; the marshalled form as a
//! whole is the unit that gets stored, compared, and replayed to the
//! device.

use anyhow::{Result, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::models::handle::HandleKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsContext {
    pub sequence: u64,
    pub saved_handle: u32,
    pub hierarchy: u32,
    pub context_blob: Bytes,
}

impl TpmsContext {
    /// Fixed part of the marshalled form, before the blob bytes.
    pub const FIXED_LEN: usize = 8 + 4 + 4 + 2;

    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::FIXED_LEN {
            bail!("TPMS_CONTEXT truncated: {} bytes", buf.len());
        }
        let sequence = buf.get_u64();
        let saved_handle = buf.get_u32();
        let hierarchy = buf.get_u32();
        let blob_len = buf.get_u16() as usize;
        if buf.len() != blob_len {
            bail!(
                "TPMS_CONTEXT blob size mismatch: declared {blob_len}, got {}",
                buf.len()
            );
        }
        Ok(Self {
            sequence,
            saved_handle,
            hierarchy,
            context_blob: Bytes::copy_from_slice(buf),
        })
    }

    pub fn encoded_len(&self) -> usize {
        Self::FIXED_LEN + self.context_blob.len()
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        out.put_u64(self.sequence);
        out.put_u32(self.saved_handle);
        out.put_u32(self.hierarchy);
        out.put_u16(self.context_blob.len() as u16);
        out.put_slice(&self.context_blob);
        out.freeze()
    }

    /// Kind of the suspended entity this context describes.
    #[inline]
    pub fn saved_kind(&self) -> HandleKind {
        HandleKind::of(self.saved_handle)
    }
}
