// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The 10-byte header shared by every TPM 2.0 command and response
//! buffer: a structure tag, the total buffer size, and the command code
//! (commands) or response code (responses), all big-endian.

use anyhow::{Result, anyhow, bail};
use thiserror::Error;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
};

pub const HEADER_LEN: usize = 10;

pub const TPM2_ST_NO_SESSIONS: u16 = 0x8001;
pub const TPM2_ST_SESSIONS: u16 = 0x8002;

/// Returned when the first two header bytes are not a known tag.
#[derive(Debug, Error)]
#[error("invalid structure tag: 0x{0:04x}")]
pub struct UnknownStructureTag(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureTag {
    NoSessions,
    Sessions,
}

impl StructureTag {
    #[inline]
    pub fn raw(&self) -> u16 {
        match self {
            StructureTag::NoSessions => TPM2_ST_NO_SESSIONS,
            StructureTag::Sessions => TPM2_ST_SESSIONS,
        }
    }
}

impl TryFrom<u16> for StructureTag {
    type Error = UnknownStructureTag;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            TPM2_ST_NO_SESSIONS => Ok(StructureTag::NoSessions),
            TPM2_ST_SESSIONS => Ok(StructureTag::Sessions),
            other => Err(UnknownStructureTag(other)),
        }
    }
}

/// Wire view of the command/response header.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawTpmHeader {
    pub tag: U16<BigEndian>,
    pub size: U32<BigEndian>,
    /// `TPM_CC` in a command, `TPM_RC` in a response.
    pub code: U32<BigEndian>,
}

impl RawTpmHeader {
    pub fn new(tag: StructureTag, size: u32, code: u32) -> Self {
        Self {
            tag: U16::new(tag.raw()),
            size: U32::new(size),
            code: U32::new(code),
        }
    }

    pub fn read_from(buf: &[u8]) -> Result<&Self> {
        if buf.len() < HEADER_LEN {
            bail!("buffer too short for TPM header: {} bytes", buf.len());
        }
        Self::ref_from_bytes(&buf[..HEADER_LEN])
            .map_err(|e| anyhow!("failed to read TPM header: {e}"))
    }

    pub fn structure_tag(&self) -> Result<StructureTag, UnknownStructureTag> {
        StructureTag::try_from(self.tag.get())
    }

    /// The declared total size must cover at least the header itself and
    /// must match the buffer handed to us.
    pub fn validate_size(&self, actual: usize) -> Result<()> {
        let declared = self.size.get() as usize;
        if declared < HEADER_LEN {
            bail!("declared size {declared} smaller than header");
        }
        if declared != actual {
            bail!("declared size {declared} does not match buffer size {actual}");
        }
        Ok(())
    }
}
