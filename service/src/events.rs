//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Engine event notifications
//!
//! Accept and receive loops never talk to a presentation layer directly.
//! They publish [`EngineEvent`]s on a broadcast channel and any number of
//! subscribers (a UI bridge, the console, tests) consume them at their own
//! pace. Slow subscribers lag and lose the oldest events; the engine never
//! blocks on them.

use crate::types::{ClientId, Message, ServerClient, ServerId, ServerKind};
use serde::Serialize;
use tokio::sync::broadcast;

/// Why a client left its server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The peer closed the TCP connection
    PeerClosed,
    /// Reading from the connection failed
    ReadError,
    /// `disconnect_client` was called
    Requested,
    /// The parent server stopped or failed
    ServerStopped,
    /// A UDP peer was silent past the idle timeout
    IdleTimeout,
    /// The status poller found the record without a live transport
    Stale,
}

/// Notification published by the engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    ServerStarted {
        kind: ServerKind,
        server_id: ServerId,
        local_addr: String,
    },
    ServerStopped {
        kind: ServerKind,
        server_id: ServerId,
    },
    ServerError {
        kind: ServerKind,
        server_id: ServerId,
        message: String,
    },
    ClientConnected {
        kind: ServerKind,
        server_id: ServerId,
        client: ServerClient,
    },
    ClientDisconnected {
        kind: ServerKind,
        server_id: ServerId,
        client_id: ClientId,
        reason: DisconnectReason,
    },
    DataReceived {
        kind: ServerKind,
        server_id: ServerId,
        message: Message,
    },
    DataSent {
        kind: ServerKind,
        server_id: ServerId,
        message: Message,
    },
    SendFailed {
        kind: ServerKind,
        server_id: ServerId,
        client_id: ClientId,
        message: String,
    },
}

impl EngineEvent {
    /// Server the event belongs to
    pub fn server(&self) -> (ServerKind, ServerId) {
        match self {
            Self::ServerStarted { kind, server_id, .. }
            | Self::ServerStopped { kind, server_id }
            | Self::ServerError { kind, server_id, .. }
            | Self::ClientConnected { kind, server_id, .. }
            | Self::ClientDisconnected { kind, server_id, .. }
            | Self::DataReceived { kind, server_id, .. }
            | Self::DataSent { kind, server_id, .. }
            | Self::SendFailed { kind, server_id, .. } => (*kind, *server_id),
        }
    }
}

/// Cloneable publisher side of the event channel
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus holding up to `capacity` undelivered events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event
    ///
    /// Having no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        tracing::trace!(?event, "engine event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
