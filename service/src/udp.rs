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

//! UDP server manager
//!
//! A running UDP server is one bound socket and one receive task. Peers are
//! virtual clients keyed by source address: the first datagram from an
//! address creates a client, later ones refresh its last-seen time. Dropping
//! a virtual client does not stop the peer from sending; its next datagram
//! simply creates a new client.

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
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Live state of one bound socket
#[derive(Debug)]
struct SocketHandle {
    epoch: u64,
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Transport owner for every UDP server
#[derive(Debug)]
pub struct UdpServerManager {
    me: Weak<UdpServerManager>,
    ctx: EngineContext,
    sockets: DashMap<ServerId, SocketHandle>,
    /// Cancellation token of every virtual client
    peers: DashMap<(ServerId, ClientId), CancellationToken>,
    lifecycle: LifecycleLocks,
}

impl UdpServerManager {
    pub fn new(ctx: EngineContext) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ctx,
            sockets: DashMap::new(),
            peers: DashMap::new(),
            lifecycle: LifecycleLocks::default(),
        })
    }

    fn key(id: ServerId) -> ServerKey {
        ServerKey::udp(id)
    }

    /// Number of tracked peers across all servers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    async fn teardown(&self, id: ServerId) {
        if let Some((_, handle)) = self.sockets.remove(&id) {
            handle.cancel.cancel();
            let mut task = handle.task;
            if timeout(self.ctx.config.shutdown_timeout, &mut task).await.is_err() {
                tracing::warn!(server = %Self::key(id), "receive task did not stop in time");
                task.abort();
            }
        }
        self.peers.retain(|(server, _), cancel| {
            if *server == id {
                cancel.cancel();
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

    fn drop_peers(&self, id: ServerId, clients: &[ClientId]) {
        for &client in clients {
            if let Some((_, cancel)) = self.peers.remove(&(id, client)) {
                cancel.cancel();
            }
        }
    }

    async fn receive_loop(
        self: Arc<Self>,
        key: ServerKey,
        epoch: u64,
        socket: Arc<UdpSocket>,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; self.ctx.config.udp_buffer_size];
        let mut backoff = self.ctx.config.retry_backoff();
        let mut failing = false;

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, peer)) => {
                    failing = false;
                    self.on_datagram(key, epoch, peer, &buf[..len], &cancel);
                }
                Err(err) => {
                    if !failing {
                        backoff.reset();
                        failing = true;
                    }
                    self.ctx.metrics.transient_error();
                    match backoff.next_backoff() {
                        Some(delay) => {
                            tracing::warn!(server = %key, error = %err, retry_in = ?delay, "receive failed");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => {
                            if let Some(removed) =
                                report_failure(&self.ctx, key, epoch, format!("receive failed: {err}"))
                            {
                                self.drop_peers(key.id, &removed);
                            }
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!(server = %key, "receive loop terminated");
    }

    fn on_datagram(
        &self,
        key: ServerKey,
        epoch: u64,
        peer: SocketAddr,
        payload: &[u8],
        cancel: &CancellationToken,
    ) {
        let (client, created) = match self.ctx.registry.touch_peer(key, epoch, peer) {
            Ok(found) => found,
            Err(err) => {
                tracing::debug!(server = %key, %peer, error = %err, "datagram dropped");
                return;
            }
        };

        if created {
            let token = cancel.child_token();
            self.peers.insert((key.id, client.id), token.clone());
            if !self.ctx.registry.attach_client(key, client.id) {
                if let Some((_, cancel)) = self.peers.remove(&(key.id, client.id)) {
                    cancel.cancel();
                }
                return;
            }
            announce_connect(&self.ctx, key, &client);
            if client.repeat_send {
                if let Some(this) = self.me.upgrade() {
                    apply_repeat(&self.ctx, this, key, &client, &token);
                }
            }
        }

        if let Err(err) = record_traffic(&self.ctx, key, client.id, Direction::Incoming, payload) {
            tracing::debug!(server = %key, client = %client.id, error = %err, "dropping inbound data");
        }
    }

    fn evict(&self, key: ServerKey, client: ClientId, reason: DisconnectReason) -> bool {
        if let Some((_, cancel)) = self.peers.remove(&(key.id, client)) {
            cancel.cancel();
        }
        release_client(&self.ctx, key, client, reason)
    }
}

#[async_trait]
impl ProtocolManager for UdpServerManager {
    fn kind(&self) -> ServerKind {
        ServerKind::Udp
    }

    #[tracing::instrument(level = "debug", skip(self), fields(kind = "udp"))]
    async fn start(&self, id: ServerId) -> Result<Server> {
        let key = Self::key(id);
        let _guard = self.lifecycle.acquire(id).await;

        let (server, epoch) = match self.ctx.registry.begin_start(key)? {
            StartPermit::AlreadyRunning => return self.ctx.registry.get(key),
            StartPermit::Proceed { server, epoch } => (server, epoch),
        };
        self.teardown(id).await;

        let address = server.address();
        let socket = match UdpSocket::bind(&address).await {
            Ok(socket) => Arc::new(socket),
            Err(err) => return Err(self.fail_start(key, epoch, EngineError::bind(address, &err))),
        };
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => return Err(self.fail_start(key, epoch, EngineError::bind(address, &err))),
        };
        let Some(this) = self.me.upgrade() else {
            return Err(self.fail_start(key, epoch, EngineError::ServerNotRunning(key)));
        };

        let server = self.ctx.registry.mark_running(key, epoch)?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(this.receive_loop(key, epoch, socket.clone(), cancel.clone()));
        self.sockets.insert(
            id,
            SocketHandle {
                epoch,
                local_addr,
                socket,
                cancel,
                task,
            },
        );

        self.ctx.metrics.server_started();
        tracing::info!(server = %key, %local_addr, "udp server bound");
        self.ctx.events.emit(EngineEvent::ServerStarted {
            kind: ServerKind::Udp,
            server_id: id,
            local_addr: local_addr.to_string(),
        });
        Ok(server)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(kind = "udp"))]
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
        if record.status != ClientStatus::Connected {
            return Err(EngineError::NotConnected { server: key, client });
        }
        let addr = self.ctx.registry.client_addr(key, client)?;
        let socket = self
            .sockets
            .get(&id)
            .map(|handle| handle.socket.clone())
            .ok_or(EngineError::ServerNotRunning(key))?;

        match timeout(self.ctx.config.write_timeout, socket.send_to(&payload, addr)).await {
            Ok(Ok(_)) => {}
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
        self.evict(key, client, DisconnectReason::Requested);
        Ok(())
    }

    fn apply_client_settings(&self, id: ServerId, client: ClientId) -> Result<ServerClient> {
        let key = Self::key(id);
        let record = self.ctx.registry.get_client(key, client)?;
        let token = self
            .peers
            .get(&(id, client))
            .map(|cancel| cancel.clone())
            .ok_or(EngineError::NotConnected { server: key, client })?;
        if let Some(this) = self.me.upgrade() {
            apply_repeat(&self.ctx, this, key, &record, &token);
        }
        Ok(record)
    }

    fn local_addr(&self, id: ServerId) -> Option<SocketAddr> {
        self.sockets.get(&id).map(|handle| handle.local_addr)
    }

    async fn reconcile(&self, id: ServerId) -> Result<ReconcileReport> {
        let key = Self::key(id);
        let mut report = ReconcileReport::default();
        let Some(epoch) = self.ctx.registry.running_epoch(key) else {
            return Ok(report);
        };

        let bound = self
            .sockets
            .get(&id)
            .is_some_and(|handle| handle.epoch == epoch && !handle.task.is_finished());
        if !bound {
            if let Some(removed) =
                report_failure(&self.ctx, key, epoch, "socket is no longer receiving".to_string())
            {
                self.drop_peers(id, &removed);
                report.failed = true;
            }
            return Ok(report);
        }

        for client in self.ctx.registry.idle_clients(key, self.ctx.config.idle_timeout) {
            if self.evict(key, client, DisconnectReason::IdleTimeout) {
                report.evicted += 1;
            }
        }
        for client in self.ctx.registry.attached_clients(key) {
            if !self.peers.contains_key(&(id, client))
                && release_client(&self.ctx, key, client, DisconnectReason::Stale)
            {
                report.pruned += 1;
            }
        }
        if report.evicted > 0 {
            tracing::debug!(server = %key, evicted = report.evicted, "idle peers evicted");
        }
        Ok(report)
    }

    fn close(&self) {
        for handle in self.sockets.iter() {
            handle.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::types::{ClientSettings, ServerSpec};
    use std::time::Duration;

    fn manager_with(config: EngineConfig) -> Arc<UdpServerManager> {
        UdpServerManager::new(EngineContext::new(config))
    }

    async fn running(manager: &UdpServerManager) -> (ServerId, SocketAddr) {
        let id = manager
            .ctx
            .registry
            .add(ServerKind::Udp, ServerSpec::new("127.0.0.1", 0))
            .unwrap()
            .id;
        manager.start(id).await.unwrap();
        (id, manager.local_addr(id).unwrap())
    }

    async fn wait_for_messages(manager: &UdpServerManager, id: ServerId, count: usize) -> Vec<ServerClient> {
        let key = ServerKey::udp(id);
        for _ in 0..200 {
            let clients = manager.ctx.registry.list_clients(key).unwrap();
            let total: usize = clients
                .iter()
                .map(|c| manager.ctx.registry.messages(key, c.id).map(|m| m.len()).unwrap_or(0))
                .sum();
            if total >= count {
                return clients;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server {id} never logged {count} messages");
    }

    #[tokio::test]
    async fn test_same_peer_is_one_client() {
        let manager = manager_with(EngineConfig::default());
        let (id, addr) = running(&manager).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"one", addr).await.unwrap();
        peer.send_to(b"two", addr).await.unwrap();

        let clients = wait_for_messages(&manager, id, 2).await;
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].port, peer.local_addr().unwrap().port());

        manager.stop(id).await.unwrap();
        assert_eq!(manager.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_reaches_peer() {
        let manager = manager_with(EngineConfig::default());
        let (id, addr) = running(&manager).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"ping", addr).await.unwrap();
        let clients = wait_for_messages(&manager, id, 1).await;

        manager
            .send_message(id, clients[0].id, Bytes::from_static(b"pong"))
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"pong");
        assert_eq!(from, addr);

        manager.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnected_peer_returns_with_new_id() {
        let manager = manager_with(EngineConfig::default());
        let (id, addr) = running(&manager).await;
        let key = ServerKey::udp(id);

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"hello", addr).await.unwrap();
        let first = wait_for_messages(&manager, id, 1).await[0].clone();
        manager
            .ctx
            .registry
            .update_client(key, first.id, ClientSettings {
                remark: "sensor".to_string(),
                ..ClientSettings::default()
            })
            .unwrap();

        manager.disconnect_client(id, first.id).await.unwrap();
        assert_eq!(manager.ctx.registry.client_count(key), 0);

        peer.send_to(b"again", addr).await.unwrap();
        let second = wait_for_messages(&manager, id, 1).await[0].clone();
        assert_ne!(second.id, first.id);
        assert_eq!(second.remark, "sensor");

        manager.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_peers_evicted() {
        let manager = manager_with(EngineConfig::default().with_idle_timeout(Duration::from_millis(50)));
        let (id, addr) = running(&manager).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"hi", addr).await.unwrap();
        wait_for_messages(&manager, id, 1).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        let report = manager.reconcile(id).await.unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(manager.ctx.registry.client_count(ServerKey::udp(id)), 0);
        assert_eq!(manager.ctx.metrics.snapshot().clients_evicted, 1);

        manager.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_unknown_client() {
        let manager = manager_with(EngineConfig::default());
        let (id, _) = running(&manager).await;

        let err = manager
            .send_message(id, ClientId::new(99), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientNotFound);

        manager.stop(id).await.unwrap();
        let err = manager
            .send_message(id, ClientId::new(99), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerNotRunning);
    }
}
