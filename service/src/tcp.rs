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

//! TCP server manager
//!
//! Every running TCP server owns one accept task. Each accepted connection
//! is split: the read half moves into a per-client read task tracked by the
//! server's [`TaskTracker`], the write half stays here behind an async mutex
//! so concurrent sends to one client never interleave.
//!
//! Cancellation flows down a token tree: server → client → repeat job.

use crate::error::{EngineError, Result};
use crate::events::{DisconnectReason, EngineEvent};
use crate::manager::{
    announce_connect, apply_repeat, record_traffic, release_client, report_failure,
    report_stopped, EngineContext, LifecycleLocks, ProtocolManager, ReconcileReport,
};
use crate::registry::StartPermit;
use crate::types::{
    ClientId, ClientStatus, Direction, Message, Server, ServerClient, ServerId, ServerKey,
    ServerKind, ServerStatus,
};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Live state of one running listener
#[derive(Debug)]
struct ListenerHandle {
    epoch: u64,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

/// Live state of one accepted connection
#[derive(Debug)]
struct TcpClientHandle {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

/// Transport owner for every TCP server
#[derive(Debug)]
pub struct TcpServerManager {
    me: Weak<TcpServerManager>,
    ctx: EngineContext,
    listeners: DashMap<ServerId, ListenerHandle>,
    clients: DashMap<(ServerId, ClientId), TcpClientHandle>,
    lifecycle: LifecycleLocks,
}

impl TcpServerManager {
    pub fn new(ctx: EngineContext) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ctx,
            listeners: DashMap::new(),
            clients: DashMap::new(),
            lifecycle: LifecycleLocks::default(),
        })
    }

    fn key(id: ServerId) -> ServerKey {
        ServerKey::tcp(id)
    }

    /// Number of live connection handles across all servers
    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Cancel and await everything a previous run of `id` left behind
    async fn teardown(&self, id: ServerId) {
        if let Some((_, handle)) = self.listeners.remove(&id) {
            let grace = self.ctx.config.shutdown_timeout;
            handle.cancel.cancel();
            handle.tracker.close();

            let mut accept_task = handle.accept_task;
            if timeout(grace, &mut accept_task).await.is_err() {
                tracing::warn!(server = %Self::key(id), "accept task did not stop in time");
                accept_task.abort();
            }
            if timeout(grace, handle.tracker.wait()).await.is_err() {
                tracing::warn!(server = %Self::key(id), "client tasks did not stop in time");
            }
        }
        self.clients.retain(|(server, _), handle| {
            if *server == id {
                handle.cancel.cancel();
                false
            } else {
                true
            }
        });
    }

    fn fail_start(&self, key: ServerKey, epoch: u64, error: EngineError) -> EngineError {
        report_failure(&self.ctx, key, epoch, error.to_string());
        error
    }

    async fn accept_loop(
        self: Arc<Self>,
        key: ServerKey,
        epoch: u64,
        listener: TcpListener,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        let mut backoff = self.ctx.config.retry_backoff();
        let mut failing = false;

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    failing = false;
                    self.register(key, epoch, stream, peer, &cancel, &tracker);
                }
                Err(err) => {
                    if !failing {
                        backoff.reset();
                        failing = true;
                    }
                    self.ctx.metrics.transient_error();
                    match backoff.next_backoff() {
                        Some(delay) => {
                            tracing::warn!(server = %key, error = %err, retry_in = ?delay, "accept failed");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => {
                            if let Some(removed) =
                                report_failure(&self.ctx, key, epoch, format!("accept failed: {err}"))
                            {
                                self.drop_handles(key.id, &removed);
                            }
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!(server = %key, "accept loop terminated");
    }

    /// Register an accepted connection and spawn its read task
    fn register(
        &self,
        key: ServerKey,
        epoch: u64,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) {
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(server = %key, %peer, error = %err, "failed to set TCP_NODELAY");
        }
        let client = match self.ctx.registry.add_client(key, epoch, peer) {
            Ok(client) => client,
            Err(err) => {
                tracing::debug!(server = %key, %peer, error = %err, "connection rejected");
                return;
            }
        };

        let (reader, writer) = stream.into_split();
        let token = cancel.child_token();
        self.clients.insert(
            (key.id, client.id),
            TcpClientHandle {
                writer: Arc::new(Mutex::new(writer)),
                cancel: token.clone(),
            },
        );
        if !self.ctx.registry.attach_client(key, client.id) {
            // Stopped or failed in between; the record went with the run
            if let Some((_, handle)) = self.clients.remove(&(key.id, client.id)) {
                handle.cancel.cancel();
            }
            return;
        }
        announce_connect(&self.ctx, key, &client);

        let Some(this) = self.me.upgrade() else {
            return;
        };
        if client.repeat_send {
            apply_repeat(&self.ctx, this.clone(), key, &client, &token);
        }
        tracker.spawn(this.read_loop(key, client.id, reader, token));
    }

    async fn read_loop(
        self: Arc<Self>,
        key: ServerKey,
        client: ClientId,
        reader: OwnedReadHalf,
        cancel: CancellationToken,
    ) {
        let mut frames = FramedRead::new(reader, BytesCodec::new());
        let reason = loop {
            let frame = tokio::select! {
                // Whoever cancelled does the bookkeeping
                _ = cancel.cancelled() => break None,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(bytes)) => {
                    if let Err(err) = record_traffic(&self.ctx, key, client, Direction::Incoming, &bytes) {
                        tracing::debug!(server = %key, client = %client, error = %err, "dropping inbound data");
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!(server = %key, client = %client, error = %err, "read failed");
                    break Some(DisconnectReason::ReadError);
                }
                None => break Some(DisconnectReason::PeerClosed),
            }
        };

        if let Some(reason) = reason {
            if let Some((_, handle)) = self.clients.remove(&(key.id, client)) {
                handle.cancel.cancel();
            }
            release_client(&self.ctx, key, client, reason);
        }
    }

    fn drop_handles(&self, id: ServerId, clients: &[ClientId]) {
        for &client in clients {
            if let Some((_, handle)) = self.clients.remove(&(id, client)) {
                handle.cancel.cancel();
            }
        }
        if let Some(listener) = self.listeners.get(&id) {
            listener.cancel.cancel();
        }
    }
}

#[async_trait]
impl ProtocolManager for TcpServerManager {
    fn kind(&self) -> ServerKind {
        ServerKind::Tcp
    }

    #[tracing::instrument(level = "debug", skip(self), fields(kind = "tcp"))]
    async fn start(&self, id: ServerId) -> Result<Server> {
        let key = Self::key(id);
        let _guard = self.lifecycle.acquire(id).await;

        let (server, epoch) = match self.ctx.registry.begin_start(key)? {
            StartPermit::AlreadyRunning => return self.ctx.registry.get(key),
            StartPermit::Proceed { server, epoch } => (server, epoch),
        };
        self.teardown(id).await;

        let address = server.address();
        let listener = match TcpListener::bind(&address).await {
            Ok(listener) => listener,
            Err(err) => return Err(self.fail_start(key, epoch, EngineError::bind(address, &err))),
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => return Err(self.fail_start(key, epoch, EngineError::bind(address, &err))),
        };
        let Some(this) = self.me.upgrade() else {
            return Err(self.fail_start(key, epoch, EngineError::ServerNotRunning(key)));
        };

        let server = self.ctx.registry.mark_running(key, epoch)?;
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept_task = tokio::spawn(this.accept_loop(
            key,
            epoch,
            listener,
            cancel.clone(),
            tracker.clone(),
        ));
        self.listeners.insert(
            id,
            ListenerHandle {
                epoch,
                local_addr,
                cancel,
                tracker,
                accept_task,
            },
        );

        self.ctx.metrics.server_started();
        tracing::info!(server = %key, %local_addr, "tcp server listening");
        self.ctx.events.emit(EngineEvent::ServerStarted {
            kind: ServerKind::Tcp,
            server_id: id,
            local_addr: local_addr.to_string(),
        });
        Ok(server)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(kind = "tcp"))]
    async fn stop(&self, id: ServerId) -> Result<()> {
        let key = Self::key(id);
        let _guard = self.lifecycle.acquire(id).await;

        if !self.ctx.registry.begin_stop(key)? {
            return Ok(());
        }
        self.teardown(id).await;
        report_stopped(&self.ctx, key)
    }

    async fn remove(&self, id: ServerId) -> Result<Server> {
        let key = Self::key(id);
        let _guard = self.lifecycle.acquire(id).await;
        let server = self.ctx.registry.remove(key)?;
        self.lifecycle.forget(id);
        Ok(server)
    }

    async fn send_message(&self, id: ServerId, client: ClientId, payload: Bytes) -> Result<Message> {
        let key = Self::key(id);
        if self.ctx.registry.status(key)? != ServerStatus::Running {
            return Err(EngineError::ServerNotRunning(key));
        }
        let record = self.ctx.registry.get_client(key, client)?;
        let not_connected = EngineError::NotConnected { server: key, client };
        if record.status != ClientStatus::Connected {
            return Err(not_connected);
        }
        let writer = self
            .clients
            .get(&(id, client))
            .map(|handle| handle.writer.clone())
            .ok_or(not_connected)?;

        let write = async {
            let mut writer = writer.lock().await;
            writer.write_all(&payload).await?;
            writer.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        match timeout(self.ctx.config.write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.ctx.metrics.send_error();
                return Err(EngineError::WriteError {
                    server: key,
                    client,
                    reason: err.to_string(),
                });
            }
            Err(_) => {
                self.ctx.metrics.send_error();
                return Err(EngineError::Timeout);
            }
        }

        record_traffic(&self.ctx, key, client, Direction::Outgoing, &payload)
    }

    async fn disconnect_client(&self, id: ServerId, client: ClientId) -> Result<()> {
        let key = Self::key(id);
        self.ctx.registry.get_client(key, client)?;
        self.ctx.registry.mark_client_disconnected(key, client);

        if let Some((_, handle)) = self.clients.remove(&(id, client)) {
            handle.cancel.cancel();
            let mut writer = handle.writer.lock().await;
            if let Ok(Err(err)) = timeout(self.ctx.config.write_timeout, writer.shutdown()).await {
                tracing::debug!(server = %key, client = %client, error = %err, "shutdown failed");
            }
        }
        release_client(&self.ctx, key, client, DisconnectReason::Requested);
        Ok(())
    }

    fn apply_client_settings(&self, id: ServerId, client: ClientId) -> Result<ServerClient> {
        let key = Self::key(id);
        let record = self.ctx.registry.get_client(key, client)?;
        let token = self
            .clients
            .get(&(id, client))
            .map(|handle| handle.cancel.clone())
            .ok_or(EngineError::NotConnected { server: key, client })?;
        if let Some(this) = self.me.upgrade() {
            apply_repeat(&self.ctx, this, key, &record, &token);
        }
        Ok(record)
    }

    fn local_addr(&self, id: ServerId) -> Option<SocketAddr> {
        self.listeners.get(&id).map(|handle| handle.local_addr)
    }

    async fn reconcile(&self, id: ServerId) -> Result<ReconcileReport> {
        let key = Self::key(id);
        let mut report = ReconcileReport::default();
        let Some(epoch) = self.ctx.registry.running_epoch(key) else {
            return Ok(report);
        };

        let listening = self
            .listeners
            .get(&id)
            .is_some_and(|handle| handle.epoch == epoch && !handle.accept_task.is_finished());
        if !listening {
            if let Some(removed) =
                report_failure(&self.ctx, key, epoch, "listener is no longer accepting".to_string())
            {
                self.drop_handles(id, &removed);
                report.failed = true;
            }
            return Ok(report);
        }

        for client in self.ctx.registry.attached_clients(key) {
            if !self.clients.contains_key(&(id, client))
                && release_client(&self.ctx, key, client, DisconnectReason::Stale)
            {
                report.pruned += 1;
            }
        }
        Ok(report)
    }

    fn close(&self) {
        for handle in self.listeners.iter() {
            handle.cancel.cancel();
        }
    }
}
