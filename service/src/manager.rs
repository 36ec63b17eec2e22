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

//! Protocol manager seam
//!
//! A [`ProtocolManager`] owns the live transport of every server of one
//! [`ServerKind`]: listening sockets, per-client tasks and their cancellation
//! tokens. Records live in the shared [`Registry`]; managers only hold what
//! cannot be shared (sockets and task handles).

use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{DisconnectReason, EngineEvent, EventBus};
use crate::metrics::EngineMetrics;
use crate::registry::Registry;
use crate::scheduler::RepeatScheduler;
use crate::types::{
    ClientId, Direction, Message, Server, ServerClient, ServerId, ServerKey, ServerKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// State shared by the engine and every manager
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub registry: Arc<Registry>,
    pub scheduler: Arc<RepeatScheduler>,
    pub events: EventBus,
    pub metrics: Arc<EngineMetrics>,
    pub config: Arc<EngineConfig>,
}

impl EngineContext {
    /// Build a fresh context from a validated configuration
    pub fn new(config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let metrics = Arc::new(EngineMetrics::new());
        Self {
            registry: Arc::new(Registry::new(config.max_log_entries)),
            scheduler: Arc::new(RepeatScheduler::new(events.clone(), metrics.clone())),
            events,
            metrics,
            config: Arc::new(config),
        }
    }
}

/// Outcome of one reconciliation pass over a single server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The server claimed to be running but its socket was gone
    pub failed: bool,
    /// Client records without a live transport that were removed
    pub pruned: usize,
    /// UDP peers evicted for inactivity
    pub evicted: usize,
}

/// Transport owner for all servers of one kind
#[async_trait]
pub trait ProtocolManager: Send + Sync + std::fmt::Debug {
    /// Kind of server this manager drives
    fn kind(&self) -> ServerKind;

    /// Bind the server's socket and start its accept or receive loop
    ///
    /// Starting a running server succeeds without doing anything.
    async fn start(&self, id: ServerId) -> Result<Server>;

    /// Close the socket, drop every client and mark the server stopped
    ///
    /// Stopping a stopped server succeeds without doing anything.
    async fn stop(&self, id: ServerId) -> Result<()>;

    /// Remove a stopped server from the registry and forget its lifecycle lock
    async fn remove(&self, id: ServerId) -> Result<Server>;

    /// Send one payload to one client
    async fn send_message(&self, id: ServerId, client: ClientId, payload: Bytes)
        -> Result<Message>;

    /// Drop one client
    async fn disconnect_client(&self, id: ServerId, client: ClientId) -> Result<()>;

    /// (Re)schedule or cancel the client's repeat-send job after its settings changed
    fn apply_client_settings(&self, id: ServerId, client: ClientId) -> Result<ServerClient>;

    /// Address the server's socket is bound to while running
    fn local_addr(&self, id: ServerId) -> Option<SocketAddr>;

    /// Bring live transport state and registry state back in line
    async fn reconcile(&self, id: ServerId) -> Result<ReconcileReport>;

    /// Cancel every task this manager owns without waiting for them
    fn close(&self);
}

/// Per-server async locks serializing start and stop
#[derive(Debug, Default)]
pub(crate) struct LifecycleLocks {
    locks: DashMap<ServerId, Arc<Mutex<()>>>,
}

impl LifecycleLocks {
    pub(crate) async fn acquire(&self, id: ServerId) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(id).or_default().clone();
        lock.lock_owned().await
    }

    /// Drop the lock of a deleted server
    pub(crate) fn forget(&self, id: ServerId) {
        self.locks.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Start or cancel the repeat job of `client` according to its settings
///
/// The job token is a child of `parent`, the client's own token, so the job
/// dies with the client.
pub(crate) fn apply_repeat(
    ctx: &EngineContext,
    sender: Arc<dyn ProtocolManager>,
    key: ServerKey,
    client: &ServerClient,
    parent: &CancellationToken,
) {
    if client.repeat_send && !client.send_content.is_empty() {
        ctx.scheduler.schedule(
            sender,
            key,
            client.id,
            Bytes::from(client.send_content.clone()),
            client.settings().interval(),
            parent,
        );
    } else {
        ctx.scheduler.cancel(key, client.id);
    }
}

/// Move the run `epoch` of `key` to `error` and announce it
///
/// Returns the clients dropped with the run, or `None` when the run had
/// already ended.
pub(crate) fn report_failure(
    ctx: &EngineContext,
    key: ServerKey,
    epoch: u64,
    reason: String,
) -> Option<Vec<ClientId>> {
    let removed = ctx.registry.mark_failed(key, epoch, reason.clone())?;
    ctx.scheduler.cancel_server(key);
    announce_disconnects(ctx, key, &removed, DisconnectReason::ServerStopped);
    ctx.metrics.server_failed();
    tracing::error!(server = %key, reason = %reason, "server failed");
    ctx.events.emit(EngineEvent::ServerError {
        kind: key.kind,
        server_id: key.id,
        message: reason,
    });
    Some(removed)
}

/// Complete a stop in the registry and announce it
pub(crate) fn report_stopped(ctx: &EngineContext, key: ServerKey) -> Result<()> {
    ctx.scheduler.cancel_server(key);
    let removed = ctx.registry.finish_stop(key)?;
    announce_disconnects(ctx, key, &removed, DisconnectReason::ServerStopped);
    tracing::info!(server = %key, clients = removed.len(), "server stopped");
    ctx.events.emit(EngineEvent::ServerStopped {
        kind: key.kind,
        server_id: key.id,
    });
    Ok(())
}

/// Remove one client record and announce it
///
/// Returns `false` if the record was already gone.
pub(crate) fn release_client(
    ctx: &EngineContext,
    key: ServerKey,
    client: ClientId,
    reason: DisconnectReason,
) -> bool {
    ctx.scheduler.cancel(key, client);
    if ctx.registry.remove_client(key, client).is_none() {
        return false;
    }
    announce_disconnects(ctx, key, &[client], reason);
    true
}

fn announce_disconnects(
    ctx: &EngineContext,
    key: ServerKey,
    clients: &[ClientId],
    reason: DisconnectReason,
) {
    for &client in clients {
        ctx.metrics.client_disconnected();
        if reason == DisconnectReason::IdleTimeout {
            ctx.metrics.client_evicted();
        }
        tracing::debug!(server = %key, client = %client, ?reason, "client disconnected");
        ctx.events.emit(EngineEvent::ClientDisconnected {
            kind: key.kind,
            server_id: key.id,
            client_id: client,
            reason,
        });
    }
}

/// Announce a newly registered client
pub(crate) fn announce_connect(ctx: &EngineContext, key: ServerKey, client: &ServerClient) {
    ctx.metrics.client_connected();
    tracing::info!(
        server = %key,
        client = %client.id,
        host = %client.host,
        port = client.port,
        "client connected"
    );
    ctx.events.emit(EngineEvent::ClientConnected {
        kind: key.kind,
        server_id: key.id,
        client: client.clone(),
    });
}

/// Log a payload in the registry and announce it
pub(crate) fn record_traffic(
    ctx: &EngineContext,
    key: ServerKey,
    client: ClientId,
    direction: Direction,
    payload: &[u8],
) -> Result<Message> {
    let message = ctx.registry.record_message(key, client, direction, payload)?;
    let event = match direction {
        Direction::Incoming => {
            ctx.metrics.message_received(payload.len());
            EngineEvent::DataReceived {
                kind: key.kind,
                server_id: key.id,
                message: message.clone(),
            }
        }
        Direction::Outgoing => {
            ctx.metrics.message_sent(payload.len());
            EngineEvent::DataSent {
                kind: key.kind,
                server_id: key.id,
                message: message.clone(),
            }
        }
    };
    tracing::trace!(server = %key, client = %client, ?direction, bytes = payload.len(), "traffic");
    ctx.events.emit(event);
    Ok(message)
}
