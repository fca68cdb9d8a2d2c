// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `TPM_CC` command codes and the per-command attributes the pipeline
//! needs: how many handles sit in the handle area, whether the response
//! carries a handle, and whether the device flushes the handle-area
//! objects itself when the command completes.
//!
//! Values follow the TPM 2.0 Structures specification § 6.5.2. The
//! attribute table is the subset of `TPMA_CC` the resource manager acts
//! on; command codes outside the table are forwarded without any handle
//! rewriting.

use std::collections::HashMap;

use bitflags::bitflags;
use once_cell::sync::Lazy;
use thiserror::Error;

/// `TPM2_CAP_HANDLES` — the capability group the manager virtualizes.
pub const TPM2_CAP_HANDLES: u32 = 0x0000_0001;

/// `TPMA_SESSION_CONTINUESESSION` bit of the auth-area attributes octet.
pub const TPMA_SESSION_CONTINUESESSION: u8 = 0x01;

/// Returned when a 32-bit value is not a known `TPM_CC`.
#[derive(Debug, Error)]
#[error("unknown command code: 0x{0:08x}")]
pub struct UnknownCommandCode(pub u32);

/// All `TPM_CC` values the manager can classify.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    NvUndefineSpaceSpecial = 0x0000_011F,
    EvictControl = 0x0000_0120,
    HierarchyControl = 0x0000_0121,
    NvUndefineSpace = 0x0000_0122,
    Clear = 0x0000_0126,
    ClearControl = 0x0000_0127,
    HierarchyChangeAuth = 0x0000_0129,
    NvDefineSpace = 0x0000_0130,
    CreatePrimary = 0x0000_0131,
    NvWrite = 0x0000_0137,
    DictionaryAttackLockReset = 0x0000_0139,
    PcrEvent = 0x0000_013C,
    PcrReset = 0x0000_013D,
    SequenceComplete = 0x0000_013E,
    Startup = 0x0000_0144,
    Shutdown = 0x0000_0145,
    StirRandom = 0x0000_0146,
    ActivateCredential = 0x0000_0147,
    Certify = 0x0000_0148,
    CertifyCreation = 0x0000_014A,
    Duplicate = 0x0000_014B,
    NvRead = 0x0000_014E,
    ObjectChangeAuth = 0x0000_0150,
    PolicySecret = 0x0000_0151,
    Create = 0x0000_0153,
    EcdhZGen = 0x0000_0154,
    Hmac = 0x0000_0155,
    Import = 0x0000_0156,
    Load = 0x0000_0157,
    Quote = 0x0000_0158,
    RsaDecrypt = 0x0000_0159,
    HmacStart = 0x0000_015B,
    SequenceUpdate = 0x0000_015C,
    Sign = 0x0000_015D,
    Unseal = 0x0000_015E,
    PolicySigned = 0x0000_0160,
    ContextLoad = 0x0000_0161,
    ContextSave = 0x0000_0162,
    EcdhKeygen = 0x0000_0163,
    EncryptDecrypt = 0x0000_0164,
    FlushContext = 0x0000_0165,
    LoadExternal = 0x0000_0167,
    MakeCredential = 0x0000_0168,
    NvReadPublic = 0x0000_0169,
    PolicyAuthValue = 0x0000_016B,
    PolicyCommandCode = 0x0000_016C,
    PolicyOR = 0x0000_0171,
    ReadPublic = 0x0000_0173,
    RsaEncrypt = 0x0000_0174,
    StartAuthSession = 0x0000_0176,
    VerifySignature = 0x0000_0177,
    GetCapability = 0x0000_017A,
    GetRandom = 0x0000_017B,
    Hash = 0x0000_017D,
    PcrRead = 0x0000_017E,
    PolicyPcr = 0x0000_017F,
    PolicyRestart = 0x0000_0180,
    PcrExtend = 0x0000_0182,
    EventSequenceComplete = 0x0000_0185,
    HashSequenceStart = 0x0000_0186,
    PolicyGetDigest = 0x0000_0189,
}

impl CommandCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0x0000_011F => Self::NvUndefineSpaceSpecial,
            0x0000_0120 => Self::EvictControl,
            0x0000_0121 => Self::HierarchyControl,
            0x0000_0122 => Self::NvUndefineSpace,
            0x0000_0126 => Self::Clear,
            0x0000_0127 => Self::ClearControl,
            0x0000_0129 => Self::HierarchyChangeAuth,
            0x0000_0130 => Self::NvDefineSpace,
            0x0000_0131 => Self::CreatePrimary,
            0x0000_0137 => Self::NvWrite,
            0x0000_0139 => Self::DictionaryAttackLockReset,
            0x0000_013C => Self::PcrEvent,
            0x0000_013D => Self::PcrReset,
            0x0000_013E => Self::SequenceComplete,
            0x0000_0144 => Self::Startup,
            0x0000_0145 => Self::Shutdown,
            0x0000_0146 => Self::StirRandom,
            0x0000_0147 => Self::ActivateCredential,
            0x0000_0148 => Self::Certify,
            0x0000_014A => Self::CertifyCreation,
            0x0000_014B => Self::Duplicate,
            0x0000_014E => Self::NvRead,
            0x0000_0150 => Self::ObjectChangeAuth,
            0x0000_0151 => Self::PolicySecret,
            0x0000_0153 => Self::Create,
            0x0000_0154 => Self::EcdhZGen,
            0x0000_0155 => Self::Hmac,
            0x0000_0156 => Self::Import,
            0x0000_0157 => Self::Load,
            0x0000_0158 => Self::Quote,
            0x0000_0159 => Self::RsaDecrypt,
            0x0000_015B => Self::HmacStart,
            0x0000_015C => Self::SequenceUpdate,
            0x0000_015D => Self::Sign,
            0x0000_015E => Self::Unseal,
            0x0000_0160 => Self::PolicySigned,
            0x0000_0161 => Self::ContextLoad,
            0x0000_0162 => Self::ContextSave,
            0x0000_0163 => Self::EcdhKeygen,
            0x0000_0164 => Self::EncryptDecrypt,
            0x0000_0165 => Self::FlushContext,
            0x0000_0167 => Self::LoadExternal,
            0x0000_0168 => Self::MakeCredential,
            0x0000_0169 => Self::NvReadPublic,
            0x0000_016B => Self::PolicyAuthValue,
            0x0000_016C => Self::PolicyCommandCode,
            0x0000_0171 => Self::PolicyOR,
            0x0000_0173 => Self::ReadPublic,
            0x0000_0174 => Self::RsaEncrypt,
            0x0000_0176 => Self::StartAuthSession,
            0x0000_0177 => Self::VerifySignature,
            0x0000_017A => Self::GetCapability,
            0x0000_017B => Self::GetRandom,
            0x0000_017D => Self::Hash,
            0x0000_017E => Self::PcrRead,
            0x0000_017F => Self::PolicyPcr,
            0x0000_0180 => Self::PolicyRestart,
            0x0000_0182 => Self::PcrExtend,
            0x0000_0185 => Self::EventSequenceComplete,
            0x0000_0186 => Self::HashSequenceStart,
            0x0000_0189 => Self::PolicyGetDigest,
            _ => return None,
        })
    }

    /// Pipeline attributes for this command, or the empty set when the
    /// table has no entry.
    pub fn attrs(&self) -> CcAttrs {
        CC_ATTRS.get(self).copied().unwrap_or_default()
    }

    /// Commands that consume a transient-object slot on success.
    #[inline]
    pub fn allocates_transient(&self) -> bool {
        matches!(self, Self::CreatePrimary | Self::Load | Self::LoadExternal)
    }

    /// Commands that consume a session slot on success.
    #[inline]
    pub fn allocates_session(&self) -> bool {
        matches!(self, Self::StartAuthSession)
    }
}

bitflags! {
    /// The `TPMA_CC` bits the manager acts on.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct CcFlags: u8 {
        /// The response carries a handle right after the header.
        const RHANDLE = 0x01;
        /// The device flushes the handle-area objects on completion.
        const FLUSHED = 0x02;
    }
}

/// Per-command pipeline attributes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CcAttrs {
    /// Number of handles in the command handle area (0..=3).
    pub handles: u8,
    pub flags: CcFlags,
}

impl CcAttrs {
    const fn new(handles: u8, flags: CcFlags) -> Self {
        Self { handles, flags }
    }

    #[inline]
    pub fn response_has_handle(&self) -> bool {
        self.flags.contains(CcFlags::RHANDLE)
    }

    #[inline]
    pub fn flushed(&self) -> bool {
        self.flags.contains(CcFlags::FLUSHED)
    }
}

static CC_ATTRS: Lazy<HashMap<CommandCode, CcAttrs>> = Lazy::new(|| {
    use CommandCode::*;

    const N: CcFlags = CcFlags::empty();
    const R: CcFlags = CcFlags::RHANDLE;
    const F: CcFlags = CcFlags::FLUSHED;

    let table: &[(CommandCode, CcAttrs)] = &[
        (NvUndefineSpaceSpecial, CcAttrs::new(2, N)),
        (EvictControl, CcAttrs::new(2, N)),
        (HierarchyControl, CcAttrs::new(1, N)),
        (NvUndefineSpace, CcAttrs::new(2, N)),
        (Clear, CcAttrs::new(1, N)),
        (ClearControl, CcAttrs::new(1, N)),
        (HierarchyChangeAuth, CcAttrs::new(1, N)),
        (NvDefineSpace, CcAttrs::new(1, N)),
        (CreatePrimary, CcAttrs::new(1, R)),
        (NvWrite, CcAttrs::new(2, N)),
        (DictionaryAttackLockReset, CcAttrs::new(1, N)),
        (PcrEvent, CcAttrs::new(1, N)),
        (PcrReset, CcAttrs::new(1, N)),
        (SequenceComplete, CcAttrs::new(1, F)),
        (Startup, CcAttrs::new(0, N)),
        (Shutdown, CcAttrs::new(0, N)),
        (StirRandom, CcAttrs::new(0, N)),
        (ActivateCredential, CcAttrs::new(2, N)),
        (Certify, CcAttrs::new(2, N)),
        (CertifyCreation, CcAttrs::new(2, N)),
        (Duplicate, CcAttrs::new(2, N)),
        (NvRead, CcAttrs::new(2, N)),
        (ObjectChangeAuth, CcAttrs::new(2, N)),
        (PolicySecret, CcAttrs::new(2, N)),
        (Create, CcAttrs::new(1, N)),
        (EcdhZGen, CcAttrs::new(1, N)),
        (Hmac, CcAttrs::new(1, N)),
        (Import, CcAttrs::new(1, N)),
        (Load, CcAttrs::new(1, R)),
        (Quote, CcAttrs::new(1, N)),
        (RsaDecrypt, CcAttrs::new(1, N)),
        (HmacStart, CcAttrs::new(1, R)),
        (SequenceUpdate, CcAttrs::new(1, N)),
        (Sign, CcAttrs::new(1, N)),
        (Unseal, CcAttrs::new(1, N)),
        (PolicySigned, CcAttrs::new(2, N)),
        (ContextLoad, CcAttrs::new(0, R)),
        (ContextSave, CcAttrs::new(1, N)),
        (EcdhKeygen, CcAttrs::new(1, N)),
        (EncryptDecrypt, CcAttrs::new(1, N)),
        // FlushContext names its victim in the parameter area, not the
        // handle area.
        (FlushContext, CcAttrs::new(0, N)),
        (LoadExternal, CcAttrs::new(0, R)),
        (MakeCredential, CcAttrs::new(1, N)),
        (NvReadPublic, CcAttrs::new(1, N)),
        (PolicyAuthValue, CcAttrs::new(1, N)),
        (PolicyCommandCode, CcAttrs::new(1, N)),
        (PolicyOR, CcAttrs::new(1, N)),
        (ReadPublic, CcAttrs::new(1, N)),
        (RsaEncrypt, CcAttrs::new(1, N)),
        (StartAuthSession, CcAttrs::new(2, R)),
        (VerifySignature, CcAttrs::new(1, N)),
        (GetCapability, CcAttrs::new(0, N)),
        (GetRandom, CcAttrs::new(0, N)),
        (Hash, CcAttrs::new(0, N)),
        (PcrRead, CcAttrs::new(0, N)),
        (PolicyPcr, CcAttrs::new(1, N)),
        (PolicyRestart, CcAttrs::new(1, N)),
        (PcrExtend, CcAttrs::new(1, N)),
        (EventSequenceComplete, CcAttrs::new(2, F)),
        (HashSequenceStart, CcAttrs::new(0, R)),
        (PolicyGetDigest, CcAttrs::new(1, N)),
    ];

    table.iter().copied().collect()
});
