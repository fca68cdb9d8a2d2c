// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::BytesMut;
use hex_literal::hex;
use tpm2_resmgr_rs::models::{
    rc::{RC_FLUSH_UNKNOWN_HANDLE, RESMGR_RC_OBJECT_MEMORY},
    response::TpmResponse,
};

#[test]
fn test_error_reply_layout() {
    let resp = TpmResponse::error(RESMGR_RC_OBJECT_MEMORY);
    assert_eq!(
        &resp.into_bytes()[..],
        hex!("8001 0000000a 000b0102")
    );

    let resp = TpmResponse::error(RC_FLUSH_UNKNOWN_HANDLE);
    assert_eq!(&resp.into_bytes()[..], hex!("8001 0000000a 000001cb"));
}

#[test]
fn test_success_reply_layout() {
    assert_eq!(
        &TpmResponse::success().into_bytes()[..],
        hex!("8001 0000000a 00000000")
    );
}

#[test]
fn test_capability_handles_reply_layout() {
    // Two handles, more remaining: size = 10 + 1 + 4 + 4 + 8 = 27.
    let resp =
        TpmResponse::capability_handles_reply(true, &[0x8000_0000, 0x8000_0001]);
    assert_eq!(
        &resp.into_bytes()[..],
        hex!(
            "8001 0000001b 00000000"
            "01"
            "00000001"
            "00000002"
            "80000000 80000001"
        )
    );

    // Empty enumeration still carries the capability header.
    let resp = TpmResponse::capability_handles_reply(false, &[]);
    assert_eq!(
        &resp.into_bytes()[..],
        hex!("8001 00000013 00000000 00 00000001 00000000")
    );
}

#[test]
fn test_context_load_reply_carries_handle() -> Result<()> {
    let resp = TpmResponse::context_load_reply(0x0200_00aa);
    assert!(resp.is_success());
    assert_eq!(resp.handle()?, 0x0200_00aa);
    assert_eq!(&resp.into_bytes()[..], hex!("8001 0000000e 00000000 020000aa"));
    Ok(())
}

#[test]
fn test_context_save_reply_embeds_context() -> Result<()> {
    let ctx = hex!("0000000000000001 02000001 40000001 0002 beef");
    let resp = TpmResponse::context_save_reply(&ctx);
    assert!(resp.is_success());
    assert_eq!(resp.body(), &ctx[..]);
    Ok(())
}

#[test]
fn test_parse_device_response() -> Result<()> {
    let bytes = hex!("8001 0000000e 00000000 80000002");
    let mut resp = TpmResponse::parse(BytesMut::from(&bytes[..]))?;
    assert!(resp.is_success());
    assert_eq!(resp.handle()?, 0x8000_0002);

    // Physical → virtual rewrite in place.
    resp.set_handle(0x8000_0000)?;
    assert_eq!(&resp.into_bytes()[..], hex!("8001 0000000e 00000000 80000000"));
    Ok(())
}
