// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use tpm2_resmgr_rs::resmgr::{
    connection::ConnectionId,
    session::{SessionEntry, SessionState},
    session_list::{MAX_ABANDONED, SessionAction, SessionList},
};

fn saved_entry(conn: u64, handle: u32, blob: &'static [u8]) -> SessionEntry {
    let mut e = SessionEntry::new_loaded(ConnectionId(conn), handle);
    e.saved_by_rm(Bytes::from_static(blob));
    e
}

#[test]
fn test_insert_lookup_remove() {
    let mut list = SessionList::new(4);
    list.insert(saved_entry(1, 0x0200_0001, b"ctx-1"));
    list.insert(saved_entry(1, 0x0300_0001, b"ctx-2"));

    assert_eq!(list.len(), 2);
    assert_eq!(
        list.lookup_by_handle(0x0200_0001).map(|e| e.owner()),
        Some(ConnectionId(1))
    );
    assert!(list.lookup_by_context(b"ctx-2").is_some());
    assert!(list.lookup_by_context(b"ctx-3").is_none());

    assert!(list.remove_by_handle(0x0200_0001).is_some());
    assert!(list.remove_by_handle(0x0200_0001).is_none());
    assert_eq!(list.len(), 1);
}

#[test]
fn test_per_connection_quota() {
    let mut list = SessionList::new(2);
    list.insert(saved_entry(1, 0x0200_0001, b"a"));
    list.insert(saved_entry(1, 0x0200_0002, b"b"));
    list.insert(saved_entry(2, 0x0200_0003, b"c"));

    assert!(list.is_full(ConnectionId(1)));
    assert!(!list.is_full(ConnectionId(2)));
}

#[test]
fn test_abandon_bound_and_claim() {
    let mut list = SessionList::new(8);

    // Five abandonments: the first one is evicted past the bound.
    let mut evicted = Vec::new();
    for i in 0..5u32 {
        let mut entry =
            SessionEntry::new_loaded(ConnectionId(u64::from(i)), 0x0200_0010 + i);
        entry.saved_by_rm(Bytes::from(format!("ctx-{i}").into_bytes()));
        entry.saved_by_client();
        if let Some(old) = list.abandon(entry) {
            evicted.push(old.handle());
        }
    }

    assert_eq!(list.abandoned_len(), MAX_ABANDONED);
    assert_eq!(evicted, vec![0x0200_0010]);

    // The evicted context can no longer be claimed; a surviving one can.
    assert_eq!(list.claim(b"ctx-0", ConnectionId(9)), None);
    let claimed = list.claim(b"ctx-3", ConnectionId(9));
    assert_eq!(claimed, Some(0x0200_0013));
    assert_eq!(list.abandoned_len(), MAX_ABANDONED - 1);

    let entry = list.lookup_by_handle(0x0200_0013).expect("claimed entry");
    assert_eq!(entry.owner(), ConnectionId(9));
    assert_eq!(entry.state(), SessionState::SavedRm);
}

#[test]
fn test_retain_visit_applies_actions_after_walk() {
    let mut list = SessionList::new(8);
    list.insert(saved_entry(1, 0x0200_0001, b"keep"));
    list.insert(saved_entry(2, 0x0200_0002, b"remove"));
    let mut transfer = saved_entry(2, 0x0200_0003, b"transfer");
    transfer.saved_by_client();
    list.insert(transfer);

    let sweep = list.retain_visit(|e| match e.state() {
        SessionState::SavedClient => SessionAction::Transfer,
        _ if e.owner() == ConnectionId(2) => SessionAction::Remove,
        _ => SessionAction::Keep,
    });

    assert_eq!(sweep.removed.len(), 1);
    assert_eq!(sweep.removed[0].handle(), 0x0200_0002);
    assert!(sweep.evicted.is_empty());
    assert_eq!(list.len(), 1);
    assert_eq!(list.abandoned_len(), 1);
    assert!(list.abandoned_by_context(b"transfer"));
}

#[test]
fn test_flush_untracks_abandoned_entries_too() {
    let mut list = SessionList::new(8);
    let mut entry = saved_entry(1, 0x0200_0001, b"ctx");
    entry.saved_by_client();
    assert!(list.abandon(entry).is_none());

    assert!(list.remove_by_handle(0x0200_0001).is_some());
    assert_eq!(list.abandoned_len(), 0);
}
