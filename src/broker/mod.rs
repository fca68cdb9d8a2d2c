// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Seams to the world outside the worker: the device access broker, the
//! inbound command queue, and the outbound response sink.
//!
//! The broker serializes all device traffic behind `&mut self` — the
//! worker task is its only caller, which is what makes the resource
//! manager race-free without locks.

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::resmgr::connection::ConnectionId;

/// Blocking device operations the pipeline depends on.
///
/// `context_save` and `context_saveflush` are distinct on purpose: the
/// device evicts a *session* context as a side effect of saving it, while
/// a saved *object* stays resident until flushed.
pub trait AccessBroker: Send {
    /// Forward a complete command buffer; returns the full response
    /// buffer. `Err` means the transport itself failed and the caller
    /// must synthesize a response.
    fn send_command(
        &mut self,
        cmd: &[u8],
    ) -> impl Future<Output = Result<BytesMut>> + Send;

    /// Load a saved context; returns the physical handle it came up at.
    fn context_load(&mut self, ctx: &[u8]) -> impl Future<Output = Result<u32>> + Send;

    /// Save a loaded session context (the device evicts it).
    fn context_save(&mut self, handle: u32)
    -> impl Future<Output = Result<Bytes>> + Send;

    /// Save a loaded object context, then flush the object.
    fn context_saveflush(
        &mut self,
        handle: u32,
    ) -> impl Future<Output = Result<Bytes>> + Send;

    /// Flush a loaded or saved entity by handle.
    fn context_flush(&mut self, handle: u32) -> impl Future<Output = Result<()>> + Send;
}

/// In-band control traffic sharing the command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Stop the worker; forwarded downstream so readers unblock too.
    CheckCancel,
    /// A client connection went away; tear down everything it owned.
    ConnectionRemoved(ConnectionId),
    /// Reserved code, logged and ignored.
    Other(u32),
}

/// One inbound command buffer, tagged with the connection it came from.
#[derive(Debug)]
pub struct CommandBuffer {
    pub conn: ConnectionId,
    pub buf: BytesMut,
}

/// What the worker dequeues.
#[derive(Debug)]
pub enum QueueItem {
    Command(CommandBuffer),
    Control(ControlMessage),
}

/// What the worker pushes downstream.
#[derive(Debug)]
pub enum SinkItem {
    Response { conn: ConnectionId, buf: Bytes },
    Control(ControlMessage),
}

/// Outbound delivery endpoint. Enqueue must not block the worker.
pub trait ResponseSink: Send {
    fn enqueue(&self, item: SinkItem) -> Result<()>;
}

/// Sink over an unbounded tokio channel, for daemons and tests alike.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkItem>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ResponseSink for ChannelSink {
    fn enqueue(&self, item: SinkItem) -> Result<()> {
        self.tx
            .send(item)
            .map_err(|_| anyhow::anyhow!("sink receiver dropped"))
    }
}
