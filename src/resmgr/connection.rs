// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::resmgr::handle_map::HandleMap;

/// Stable identity of one client connection, assigned by the connection
/// manager that feeds the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Per-connection state the worker owns: the identity plus the transient
/// handle map. Dropping the connection drops its transient bookkeeping,
/// which is exactly the teardown the map needs.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    pub transients: HandleMap,
}

impl Connection {
    pub fn new(id: ConnectionId, transient_quota: usize) -> Self {
        Self {
            id,
            transients: HandleMap::new(transient_quota),
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}
