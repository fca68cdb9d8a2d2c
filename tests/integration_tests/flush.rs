// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tpm2_resmgr_rs::models::rc::RC_FLUSH_UNKNOWN_HANDLE;

use crate::integration_tests::common::*;

/// Flushing an unknown virtual handle yields the composed handle error
/// and never reaches the device.
#[tokio::test]
async fn test_flush_unknown_virtual_handle() {
    let mut h = Harness::spawn(27, 4);

    let resp = h
        .roundtrip(1, cmd(CC_FLUSH_CONTEXT, &[], &0x80ff_ffffu32.to_be_bytes()))
        .await;
    assert_eq!(rc_of(&resp), RC_FLUSH_UNKNOWN_HANDLE);
    assert_eq!(h.device_commands_seen(), 0);
    assert!(h.tpm.lock().expect("state").flushes.is_empty());
}

/// Flushing an owned virtual handle is answered locally; the object was
/// never resident, so no device call is needed at all.
#[tokio::test]
async fn test_flush_owned_virtual_handle() {
    let mut h = Harness::spawn(27, 4);

    h.push_response(resp_with_handle(0x8000_0001));
    let resp = h.roundtrip(1, cmd(CC_CREATE_PRIMARY, &[0x4000_0001], b"t")).await;
    let vhandle = handle_of(&resp);
    let seen_before = h.device_commands_seen();

    let resp = h
        .roundtrip(1, cmd(CC_FLUSH_CONTEXT, &[], &vhandle.to_be_bytes()))
        .await;
    assert_eq!(rc_of(&resp), 0);
    assert_eq!(h.device_commands_seen(), seen_before);
    assert!(h.tpm.lock().expect("state").flushes.is_empty());

    // The handle no longer resolves.
    let resp = h
        .roundtrip(1, cmd(CC_FLUSH_CONTEXT, &[], &vhandle.to_be_bytes()))
        .await;
    assert_eq!(rc_of(&resp), RC_FLUSH_UNKNOWN_HANDLE);
}

/// Another connection cannot flush an object it does not own.
#[tokio::test]
async fn test_flush_is_per_connection() {
    let mut h = Harness::spawn(27, 4);

    h.push_response(resp_with_handle(0x8000_0001));
    let resp = h.roundtrip(1, cmd(CC_CREATE_PRIMARY, &[0x4000_0001], b"t")).await;
    let vhandle = handle_of(&resp);

    let resp = h
        .roundtrip(2, cmd(CC_FLUSH_CONTEXT, &[], &vhandle.to_be_bytes()))
        .await;
    assert_eq!(rc_of(&resp), RC_FLUSH_UNKNOWN_HANDLE);
}

/// Flushing a session handle untracks the session but lets the device
/// have the final word.
#[tokio::test]
async fn test_flush_session_falls_through() {
    let mut h = Harness::spawn(27, 4);

    h.push_response(resp_with_handle(0x0200_0001));
    let resp = h
        .roundtrip(1, cmd(CC_START_AUTH_SESSION, &[0x4000_0007, 0x4000_0007], b"hmac"))
        .await;
    let session = handle_of(&resp);
    assert_eq!(session, 0x0200_0001, "session handles are not virtualized");

    h.push_response(resp_success());
    let resp = h
        .roundtrip(1, cmd(CC_FLUSH_CONTEXT, &[], &session.to_be_bytes()))
        .await;
    assert_eq!(rc_of(&resp), 0);

    let st = h.tpm.lock().expect("state");
    // The command itself went to the device...
    let forwarded = st.sent.last().expect("forwarded flush");
    assert_eq!(forwarded[6..10], CC_FLUSH_CONTEXT.to_be_bytes());
    // ...not the broker's side-channel flush.
    assert!(st.flushes.is_empty());
    drop(st);

    // Untracked: a later use of the session loads nothing.
    let loads_before = h.tpm.lock().expect("state").loads.len();
    h.push_response(resp_success());
    let resp = h
        .roundtrip(
            1,
            cmd_with_auth(CC_PCR_EXTEND, &[0x0000_0010], &[(session, 0x01)], b"pcr"),
        )
        .await;
    assert_eq!(rc_of(&resp), 0);
    assert_eq!(h.tpm.lock().expect("state").loads.len(), loads_before);
}
