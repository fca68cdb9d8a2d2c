// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::integration_tests::common::*;

/// Client-saved session survives its connection and can be claimed by
/// another one via the exact context bytes.
#[tokio::test]
async fn test_abandon_and_claim() {
    let mut h = Harness::spawn(27, 4);

    h.push_response(resp_with_handle(0x0200_0001));
    let resp = h
        .roundtrip(1, cmd(CC_START_AUTH_SESSION, &[0x4000_0007, 0x4000_0007], b"hmac"))
        .await;
    let session = handle_of(&resp);
    let seen_before = h.device_commands_seen();

    // ContextSave is answered from the stored context, no device call.
    let resp = h.roundtrip(1, cmd(CC_CONTEXT_SAVE, &[session], &[])).await;
    assert_eq!(rc_of(&resp), 0);
    assert_eq!(h.device_commands_seen(), seen_before);
    let context = resp[10..].to_vec();
    assert!(!context.is_empty());

    // Owner disappears; the session is parked, not flushed.
    h.remove_connection(1).await;
    assert!(h.tpm.lock().expect("state").flushes.is_empty());

    // Another connection claims it with the saved bytes.
    let resp = h.roundtrip(2, cmd(CC_CONTEXT_LOAD, &[], &context)).await;
    assert_eq!(rc_of(&resp), 0);
    assert_eq!(handle_of(&resp), session);
    assert_eq!(h.device_commands_seen(), seen_before);

    // The new owner can actually use it.
    h.push_response(resp_success());
    let resp = h
        .roundtrip(
            2,
            cmd_with_auth(CC_PCR_EXTEND, &[0x0000_0010], &[(session, 0x01)], b"d"),
        )
        .await;
    assert_eq!(rc_of(&resp), 0);
    assert_eq!(h.tpm.lock().expect("state").loads.len(), 1);
}

/// Only four abandoned sessions are retained; the oldest is flushed from
/// the device and its context stops matching.
#[tokio::test]
async fn test_abandonment_prune() {
    let mut h = Harness::spawn(27, 4);

    let mut contexts = Vec::new();
    for i in 0..5u64 {
        let session = 0x0200_0001 + i as u32;
        h.push_response(resp_with_handle(session));
        let resp = h
            .roundtrip(
                i + 1,
                cmd(CC_START_AUTH_SESSION, &[0x4000_0007, 0x4000_0007], b"hmac"),
            )
            .await;
        assert_eq!(handle_of(&resp), session);

        let resp = h.roundtrip(i + 1, cmd(CC_CONTEXT_SAVE, &[session], &[])).await;
        contexts.push(resp[10..].to_vec());

        h.remove_connection(i + 1).await;
    }

    // The first abandoned session fell off the queue and got flushed.
    assert_eq!(h.tpm.lock().expect("state").flushes, vec![0x0200_0001]);

    // Its context no longer matches anything the manager tracks; the
    // load is forwarded and the device rejects it.
    h.push_response(resp_error(0x0000_01df));
    let resp = h.roundtrip(9, cmd(CC_CONTEXT_LOAD, &[], &contexts[0])).await;
    assert_eq!(rc_of(&resp), 0x0000_01df);

    // A surviving one is still claimable without device help.
    let seen_before = h.device_commands_seen();
    let resp = h.roundtrip(9, cmd(CC_CONTEXT_LOAD, &[], &contexts[1])).await;
    assert_eq!(rc_of(&resp), 0);
    assert_eq!(handle_of(&resp), 0x0200_0002);
    assert_eq!(h.device_commands_seen(), seen_before);
}

/// A context saved by a live connection cannot be stolen: the foreign
/// ContextLoad is refused without any reply.
#[tokio::test]
async fn test_claim_refused_while_owner_alive() {
    let mut h = Harness::spawn(27, 4);

    h.push_response(resp_with_handle(0x0200_0001));
    let resp = h
        .roundtrip(1, cmd(CC_START_AUTH_SESSION, &[0x4000_0007, 0x4000_0007], b"hmac"))
        .await;
    let session = handle_of(&resp);

    let resp = h.roundtrip(1, cmd(CC_CONTEXT_SAVE, &[session], &[])).await;
    let context = resp[10..].to_vec();

    // The refusal produces no response at all; prove the worker moved on
    // by following up with a command that does respond.
    h.rm
        .submit(
            tpm2_resmgr_rs::resmgr::connection::ConnectionId(2),
            bytes::BytesMut::from(&cmd(CC_CONTEXT_LOAD, &[], &context)[..]),
        )
        .expect("submit");
    h.push_response(resp_success());
    let resp = h.roundtrip(2, cmd(CC_READ_PUBLIC, &[0x0100_0001], &[])).await;
    assert_eq!(rc_of(&resp), 0);

    // The rightful owner can still reload it.
    let resp = h.roundtrip(1, cmd(CC_CONTEXT_LOAD, &[], &context)).await;
    assert_eq!(rc_of(&resp), 0);
    assert_eq!(handle_of(&resp), session);
}
