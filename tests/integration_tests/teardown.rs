// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tpm2_resmgr_rs::broker::{ControlMessage, SinkItem};

use crate::integration_tests::common::*;

/// A manager-saved session dies with its connection: flushed from the
/// device and forgotten.
#[tokio::test]
async fn test_saved_rm_session_flushed_on_close() {
    let mut h = Harness::spawn(27, 4);

    h.push_response(resp_with_handle(0x0200_0001));
    let resp = h
        .roundtrip(1, cmd(CC_START_AUTH_SESSION, &[0x4000_0007, 0x4000_0007], b"hmac"))
        .await;
    let session = handle_of(&resp);

    h.remove_connection(1).await;
    assert_eq!(h.tpm.lock().expect("state").flushes, vec![session]);

    // Nothing is loaded for the dead session afterwards.
    let loads_before = h.tpm.lock().expect("state").loads.len();
    h.push_response(resp_success());
    let _ = h
        .roundtrip(
            2,
            cmd_with_auth(CC_PCR_EXTEND, &[0x0000_0010], &[(session, 0x01)], b"d"),
        )
        .await;
    assert_eq!(h.tpm.lock().expect("state").loads.len(), loads_before);
}

/// Transient bookkeeping is embedded in the connection and vanishes with
/// it, even for the same client identity reconnecting.
#[tokio::test]
async fn test_transients_dropped_with_connection() {
    let mut h = Harness::spawn(27, 4);

    h.push_response(resp_with_handle(0x8000_0001));
    let resp = h.roundtrip(1, cmd(CC_CREATE_PRIMARY, &[0x4000_0001], b"t")).await;
    let vhandle = handle_of(&resp);

    h.remove_connection(1).await;

    let mut params = Vec::new();
    params.extend_from_slice(&1u32.to_be_bytes());
    params.extend_from_slice(&0x8000_0000u32.to_be_bytes());
    params.extend_from_slice(&10u32.to_be_bytes());
    let resp = h.roundtrip(1, cmd(CC_GET_CAPABILITY, &[], &params)).await;
    let count = u32::from_be_bytes([resp[15], resp[16], resp[17], resp[18]]);
    assert_eq!(count, 0, "reconnect must start with an empty map");

    // The old virtual handle is dead.
    use tpm2_resmgr_rs::models::rc::RC_FLUSH_UNKNOWN_HANDLE;
    let resp = h
        .roundtrip(1, cmd(CC_FLUSH_CONTEXT, &[], &vhandle.to_be_bytes()))
        .await;
    assert_eq!(rc_of(&resp), RC_FLUSH_UNKNOWN_HANDLE);
}

/// CheckCancel drains through the queue, reaches the sink, and stops the
/// worker.
#[tokio::test]
async fn test_check_cancel_stops_worker() {
    let mut h = Harness::spawn(27, 4);

    h.push_response(resp_success());
    let resp = h.roundtrip(1, cmd(CC_READ_PUBLIC, &[0x0100_0001], &[])).await;
    assert_eq!(rc_of(&resp), 0);

    h.rm.unblock().expect("unblock");
    match h.sink_rx.recv().await {
        Some(SinkItem::Control(ControlMessage::CheckCancel)) => {},
        other => panic!("expected forwarded CheckCancel, got {other:?}"),
    }

    let joined = h.worker.await.expect("worker task panicked");
    assert!(joined.is_ok(), "worker must stop cleanly: {joined:?}");
}

/// The hard-cancel token aborts the loop even with nothing queued.
#[tokio::test]
async fn test_hard_cancel() {
    let h = Harness::spawn(27, 4);

    h.rm.cancel_now();
    let joined = h.worker.await.expect("worker task panicked");
    assert!(joined.is_err(), "hard cancel reports an error exit");
}

/// A closed queue is the dequeue sentinel: the worker stops cleanly.
#[tokio::test]
async fn test_closed_queue_stops_worker() {
    let h = Harness::spawn(27, 4);

    drop(h.rm);
    let joined = h.worker.await.expect("worker task panicked");
    assert!(joined.is_ok());
}
