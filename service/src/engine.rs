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

//! Engine facade
//!
//! [`ConnectivityEngine`] is the only type a calling layer needs. Every
//! control operation takes the server kind explicitly and answers with an
//! [`OperationResult`]; no error escapes as a panic or a bare `Err`.

use crate::config::EngineConfig;
use crate::envelope::{OperationResult, ServerDetail, StatusReport};
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::manager::{EngineContext, ProtocolManager};
use crate::metrics::MetricsSnapshot;
use crate::poller::{PollReport, StatusPoller};
use crate::tcp::TcpServerManager;
use crate::types::{
    ClientId, ClientSettings, Server, ServerId, ServerKey, ServerKind, ServerSpec, ServerStatus,
};
use crate::udp::UdpServerManager;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// TCP/UDP test server engine
#[derive(Debug)]
pub struct ConnectivityEngine {
    ctx: EngineContext,
    tcp: Arc<TcpServerManager>,
    udp: Arc<UdpServerManager>,
    poller: Arc<StatusPoller>,
    poller_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Default for ConnectivityEngine {
    fn default() -> Self {
        Self::build(EngineConfig::default())
    }
}

impl ConnectivityEngine {
    /// Create an engine from a configuration
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate().map_err(EngineError::InvalidConfig)?;
        Ok(Self::build(config))
    }

    fn build(config: EngineConfig) -> Self {
        let ctx = EngineContext::new(config);
        let tcp = TcpServerManager::new(ctx.clone());
        let udp = UdpServerManager::new(ctx.clone());
        let poller = Arc::new(StatusPoller::new(
            ctx.registry.clone(),
            vec![
                tcp.clone() as Arc<dyn ProtocolManager>,
                udp.clone() as Arc<dyn ProtocolManager>,
            ],
        ));
        Self {
            ctx,
            tcp,
            udp,
            poller,
            poller_task: Mutex::new(None),
        }
    }

    fn manager(&self, kind: ServerKind) -> Arc<dyn ProtocolManager> {
        match kind {
            ServerKind::Tcp => self.tcp.clone(),
            ServerKind::Udp => self.udp.clone(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    // Servers

    /// Add a server; it starts out stopped
    pub fn add_server(&self, kind: ServerKind, spec: ServerSpec) -> OperationResult {
        let result = self.ctx.registry.add(kind, spec);
        if let Ok(server) = &result {
            tracing::info!(server = %server.key(), address = %server.address(), "server added");
        }
        OperationResult::respond(result, "Server added")
    }

    /// Update remark, host and port of a server
    pub fn update_server(&self, kind: ServerKind, server: Server) -> OperationResult {
        OperationResult::respond(self.ctx.registry.update(kind, server), "Server updated")
    }

    /// Delete a stopped server
    pub async fn delete_server(&self, kind: ServerKind, id: ServerId) -> OperationResult {
        OperationResult::respond(self.delete(kind, id, false).await, "Server deleted")
    }

    /// Stop a server if needed, then delete it
    pub async fn delete_server_forced(&self, kind: ServerKind, id: ServerId) -> OperationResult {
        OperationResult::respond(self.delete(kind, id, true).await, "Server deleted")
    }

    async fn delete(&self, kind: ServerKind, id: ServerId, force: bool) -> Result<()> {
        let key = ServerKey::new(kind, id);
        let status = self.ctx.registry.status(key)?;
        // A failed server may still hold handles from its last run
        if force || status == ServerStatus::Error {
            self.manager(kind).stop(id).await?;
        }
        let server = self.manager(kind).remove(id).await?;
        tracing::info!(server = %key, address = %server.address(), "server deleted");
        Ok(())
    }

    /// All servers of one kind, ordered by id
    pub fn get_all_servers(&self, kind: ServerKind) -> OperationResult {
        OperationResult::ok("Servers retrieved", self.ctx.registry.list(kind))
    }

    /// A server with its bound address, clients and their message logs
    pub fn get_server_data(&self, kind: ServerKind, id: ServerId) -> OperationResult {
        OperationResult::respond(self.detail(kind, id), "Server data retrieved")
    }

    fn detail(&self, kind: ServerKind, id: ServerId) -> Result<ServerDetail> {
        let key = ServerKey::new(kind, id);
        let server = self.ctx.registry.get(key)?;
        let (clients, logs): (Vec<_>, Vec<_>) =
            self.ctx.registry.client_logs(key)?.into_iter().unzip();
        Ok(ServerDetail {
            server,
            local_addr: self.manager(kind).local_addr(id).map(|addr| addr.to_string()),
            clients,
            messages: logs.into_iter().flatten().collect(),
        })
    }

    /// Status, client count and last failure of a server
    pub fn get_server_status(&self, kind: ServerKind, id: ServerId) -> OperationResult {
        OperationResult::respond(self.status(kind, id), "Server status retrieved")
    }

    fn status(&self, kind: ServerKind, id: ServerId) -> Result<StatusReport> {
        let key = ServerKey::new(kind, id);
        Ok(StatusReport {
            id,
            kind,
            status: self.ctx.registry.status(key)?,
            client_count: self.ctx.registry.client_count(key),
            local_addr: self.manager(kind).local_addr(id).map(|addr| addr.to_string()),
            last_error: self.ctx.registry.last_error(key),
        })
    }

    /// Bind and start a server; a running server is left as it is
    pub async fn start_server(&self, kind: ServerKind, id: ServerId) -> OperationResult {
        OperationResult::respond(self.manager(kind).start(id).await, "Server started")
    }

    /// Stop a server; a stopped server is left as it is
    pub async fn stop_server(&self, kind: ServerKind, id: ServerId) -> OperationResult {
        let result = match self.manager(kind).stop(id).await {
            Ok(()) => self.ctx.registry.get(ServerKey::new(kind, id)),
            Err(err) => Err(err),
        };
        OperationResult::respond(result, "Server stopped")
    }

    // Clients

    /// Send `content` to one client
    pub async fn send_message(
        &self,
        kind: ServerKind,
        id: ServerId,
        client: ClientId,
        content: &str,
    ) -> OperationResult {
        let payload = Bytes::copy_from_slice(content.as_bytes());
        let result = self
            .manager(kind)
            .send_message(id, client, payload)
            .await
            .map(|_| ());
        OperationResult::respond(result, "Message sent")
    }

    /// Drop one client
    pub async fn disconnect_client(
        &self,
        kind: ServerKind,
        id: ServerId,
        client: ClientId,
    ) -> OperationResult {
        OperationResult::respond(
            self.manager(kind).disconnect_client(id, client).await,
            "Client disconnected",
        )
    }

    /// All clients of a server
    pub fn get_clients(&self, kind: ServerKind, id: ServerId) -> OperationResult {
        OperationResult::respond(
            self.ctx.registry.list_clients(ServerKey::new(kind, id)),
            "Clients retrieved",
        )
    }

    /// One client of a server
    pub fn get_client(&self, kind: ServerKind, id: ServerId, client: ClientId) -> OperationResult {
        OperationResult::respond(
            self.ctx.registry.get_client(ServerKey::new(kind, id), client),
            "Client retrieved",
        )
    }

    /// Change a client's remark and repeat-send settings
    ///
    /// Enabling repeat-send schedules the job immediately; disabling it
    /// cancels the running job. For UDP the settings stick to the peer
    /// address and come back if the peer reappears.
    pub fn update_client(
        &self,
        kind: ServerKind,
        id: ServerId,
        client: ClientId,
        settings: ClientSettings,
    ) -> OperationResult {
        let key = ServerKey::new(kind, id);
        let result = self
            .ctx
            .registry
            .update_client(key, client, settings)
            .and_then(|_| self.manager(kind).apply_client_settings(id, client));
        OperationResult::respond(result, "Client updated")
    }

    /// A client's message log, oldest first
    pub fn get_client_messages(
        &self,
        kind: ServerKind,
        id: ServerId,
        client: ClientId,
    ) -> OperationResult {
        OperationResult::respond(
            self.ctx.registry.messages(ServerKey::new(kind, id), client),
            "Messages retrieved",
        )
    }

    /// Empty a client's message log
    pub fn clear_client_messages(
        &self,
        kind: ServerKind,
        id: ServerId,
        client: ClientId,
    ) -> OperationResult {
        let result = self
            .ctx
            .registry
            .clear_messages(ServerKey::new(kind, id), client)
            .map(|cleared| {
                tracing::debug!(server = %ServerKey::new(kind, id), client = %client, cleared, "message log cleared");
            });
        OperationResult::respond(result, "Messages cleared")
    }

    /// Empty the message log of every client of a server
    pub fn clear_server_messages(&self, kind: ServerKind, id: ServerId) -> OperationResult {
        let key = ServerKey::new(kind, id);
        let result = self.ctx.registry.clear_server_messages(key).map(|cleared| {
            tracing::debug!(server = %key, cleared, "message logs cleared");
        });
        OperationResult::respond(result, "Messages cleared")
    }

    // Engine

    /// Run one reconciliation sweep over every running server
    pub async fn check_connection_status(&self) -> OperationResult {
        let report = self.poll().await;
        OperationResult::ok(
            format!(
                "Checked {} servers: {} failed, {} clients pruned, {} evicted",
                report.servers_checked,
                report.servers_failed,
                report.clients_pruned,
                report.clients_evicted
            ),
            (),
        )
    }

    /// Run one reconciliation sweep and return its totals
    pub async fn poll(&self) -> PollReport {
        self.poller.check_connection_status().await
    }

    /// Sweep every configured poll interval in the background
    ///
    /// Returns `false` if the poller is already running.
    pub fn start_poller(&self) -> bool {
        let mut task = self.poller_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return false;
        }
        let cancel = CancellationToken::new();
        let handle = self
            .poller
            .clone()
            .spawn(self.ctx.config.poll_interval, cancel.clone());
        *task = Some((cancel, handle));
        true
    }

    /// Stop the background poller
    pub async fn stop_poller(&self) {
        let task = self
            .poller_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "status poller task failed");
            }
        }
    }

    /// Stop the poller and every server of both kinds
    pub async fn shutdown(&self) {
        self.stop_poller().await;
        for kind in ServerKind::ALL {
            let manager = self.manager(kind);
            for server in self.ctx.registry.list(kind) {
                if server.status == ServerStatus::Stopped {
                    continue;
                }
                if let Err(err) = manager.stop(server.id).await {
                    tracing::warn!(server = %server.key(), error = %err, "stop during shutdown failed");
                }
            }
        }
        tracing::info!("engine shut down");
    }

    /// Subscribe to engine events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    /// Current counter values
    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }
}

impl Drop for ConnectivityEngine {
    fn drop(&mut self) {
        if let Ok(mut task) = self.poller_task.lock() {
            if let Some((cancel, _)) = task.take() {
                cancel.cancel();
            }
        }
        self.tcp.close();
        self.udp.close();
    }
}
