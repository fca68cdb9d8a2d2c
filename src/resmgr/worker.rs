// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The single worker task that owns every piece of mutable resource
//! state. Commands and control messages arrive on one queue and are
//! processed strictly in order; the only other way to stop the loop is
//! the hard-cancel token.

use std::collections::HashMap;

use anyhow::{Result, bail};
use bytes::BytesMut;
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    broker::{AccessBroker, CommandBuffer, ControlMessage, QueueItem, ResponseSink, SinkItem},
    cfg::config::RuntimeConfig,
    resmgr::{
        connection::{Connection, ConnectionId},
        pipeline::Pipeline,
        session::SessionState,
        session_list::{SessionAction, SessionList},
    },
};

/// Producer-side handle to a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<QueueItem>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    /// Enqueue one command buffer on behalf of a connection.
    pub fn submit(&self, conn: ConnectionId, buf: BytesMut) -> Result<()> {
        self.tx
            .send(QueueItem::Command(CommandBuffer { conn, buf }))
            .map_err(|_| anyhow::anyhow!("worker queue closed"))
    }

    /// Signal that a connection went away; its resources get torn down
    /// in queue order, after any commands it already submitted.
    pub fn remove_connection(&self, conn: ConnectionId) -> Result<()> {
        self.tx
            .send(QueueItem::Control(ControlMessage::ConnectionRemoved(conn)))
            .map_err(|_| anyhow::anyhow!("worker queue closed"))
    }

    /// Cooperative stop: wakes the worker via the queue.
    pub fn unblock(&self) -> Result<()> {
        self.tx
            .send(QueueItem::Control(ControlMessage::CheckCancel))
            .map_err(|_| anyhow::anyhow!("worker queue closed"))
    }

    /// Hard stop: abort the loop even mid-dequeue.
    pub fn cancel_now(&self) {
        self.cancel.cancel();
    }
}

pub struct Worker<B, S> {
    source: mpsc::UnboundedReceiver<QueueItem>,
    sink: S,
    broker: B,
    sessions: SessionList,
    connections: HashMap<ConnectionId, Connection>,
    transient_quota: usize,
    cancel: CancellationToken,
}

impl<B: AccessBroker, S: ResponseSink> Worker<B, S> {
    pub fn new(cfg: &RuntimeConfig, sink: S, broker: B) -> (Self, WorkerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = Self {
            source: rx,
            sink,
            broker,
            sessions: SessionList::new(cfg.max_sessions as usize),
            connections: HashMap::new(),
            transient_quota: cfg.max_transient_objects as usize,
            cancel: cancel.clone(),
        };
        (worker, WorkerHandle { tx, cancel })
    }

    /// Dequeue until a `CheckCancel`, a closed queue, or a hard cancel.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let item = select! {
                _ = self.cancel.cancelled() => bail!("cancelled"),
                item = self.source.recv() => item,
            };
            let Some(item) = item else {
                debug!("inbound queue closed; worker stopping");
                return Ok(());
            };
            match item {
                QueueItem::Command(cb) => self.handle_command(cb).await,
                QueueItem::Control(msg) => {
                    if self.handle_control(msg).await? {
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn handle_command(&mut self, cb: CommandBuffer) {
        let conn = self
            .connections
            .entry(cb.conn)
            .or_insert_with(|| Connection::new(cb.conn, self.transient_quota));
        let pipeline = Pipeline {
            broker: &mut self.broker,
            sink: &self.sink,
            sessions: &mut self.sessions,
            conn,
        };
        if let Err(e) = pipeline.run(cb.buf).await {
            warn!(conn = %cb.conn, error = %e, "command dropped");
        }
    }

    /// Returns true when the worker should stop.
    async fn handle_control(&mut self, msg: ControlMessage) -> Result<bool> {
        match msg {
            ControlMessage::CheckCancel => {
                debug!("check-cancel; forwarding and stopping");
                self.sink.enqueue(SinkItem::Control(msg))?;
                Ok(true)
            },
            ControlMessage::ConnectionRemoved(id) => {
                self.teardown_connection(id).await;
                self.sink.enqueue(SinkItem::Control(msg))?;
                Ok(false)
            },
            ControlMessage::Other(code) => {
                warn!(code, "unknown control message ignored");
                Ok(false)
            },
        }
    }

    /// Flush or abandon every session the closing connection owned; the
    /// transient map goes away with the `Connection` itself.
    async fn teardown_connection(&mut self, id: ConnectionId) {
        debug!(conn = %id, "connection teardown");
        let sweep = self.sessions.retain_visit(|e| {
            if e.owner() != id {
                return SessionAction::Keep;
            }
            match e.state() {
                SessionState::SavedClient => SessionAction::Transfer,
                SessionState::SavedRm => SessionAction::Remove,
                state => panic!(
                    "session 0x{:08x} in state {state:?} at connection teardown",
                    e.handle()
                ),
            }
        });

        for entry in sweep.removed.iter().chain(sweep.evicted.iter()) {
            if let Err(e) = self.broker.context_flush(entry.handle()).await {
                warn!(handle = format_args!("0x{:08x}", entry.handle()), error = %e, "session flush at teardown failed");
            }
        }
        self.connections.remove(&id);
    }
}
