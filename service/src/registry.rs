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

//! Server registry
//!
//! The registry is the single owner of every [`Server`] and [`ServerClient`]
//! record. Managers keep only live sockets and task handles; every state
//! change goes through the methods here.
//!
//! Each server lives in one [`DashMap`] entry together with its clients, so
//! any read of a server or its client table observes a whole update or none
//! of it. Entry locks are only ever held for the duration of a map
//! operation, never across network I/O.
//!
//! A new client is created detached. The manager inserts its transport handle
//! and then calls [`Registry::attach_client`]; sweeps only look at attached
//! clients, so a client is never pruned for lacking a handle it is about to
//! get.
//!
//! A server's `epoch` increases on every start. Loops spawned for one run
//! pass their epoch back on every call, so a loop that outlives its run (a
//! late accept racing a stop) can never register clients into the next one.

use crate::error::{EngineError, Result};
use crate::types::{
    unix_millis, ClientId, ClientSettings, ClientStatus, Direction, Message, Server, ServerClient,
    ServerId, ServerKey, ServerKind, ServerSpec, ServerStatus,
};
use crate::config::MIN_REPEAT_INTERVAL;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of [`Registry::begin_start`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPermit {
    /// The server is already running; starting again is a no-op
    AlreadyRunning,
    /// The server moved to `starting`; the caller must bind and then call
    /// [`Registry::mark_running`] or [`Registry::mark_failed`]
    Proceed { server: Server, epoch: u64 },
}

/// Client bookkeeping owned by the registry
#[derive(Debug)]
struct ClientRecord {
    client: ServerClient,
    addr: SocketAddr,
    last_seen: Instant,
    attached: bool,
    log: VecDeque<Message>,
    next_message_id: u64,
}

/// One server and everything that hangs off it
#[derive(Debug)]
struct ServerEntry {
    server: Server,
    epoch: u64,
    next_client_id: u64,
    clients: BTreeMap<ClientId, ClientRecord>,
    by_addr: HashMap<SocketAddr, ClientId>,
    /// Settings last applied to a peer address, re-applied when it reappears
    profiles: HashMap<SocketAddr, ClientSettings>,
    last_error: Option<String>,
}

impl ServerEntry {
    fn new(server: Server) -> Self {
        Self {
            server,
            epoch: 0,
            next_client_id: 1,
            clients: BTreeMap::new(),
            by_addr: HashMap::new(),
            profiles: HashMap::new(),
            last_error: None,
        }
    }

    fn accepts_clients(&self, epoch: u64) -> bool {
        self.server.status == ServerStatus::Running && self.epoch == epoch
    }

    fn insert_client(&mut self, addr: SocketAddr) -> ServerClient {
        let id = ClientId::new(self.next_client_id);
        self.next_client_id += 1;

        let settings = self.profiles.get(&addr).cloned().unwrap_or_default();
        let client = ServerClient {
            id,
            remark: settings.remark,
            host: addr.ip().to_string(),
            port: addr.port(),
            status: ClientStatus::Connected,
            kind: self.server.kind,
            repeat_send: settings.repeat_send,
            repeat_interval: settings.repeat_interval,
            send_content: settings.send_content,
        };

        self.clients.insert(
            id,
            ClientRecord {
                client: client.clone(),
                addr,
                last_seen: Instant::now(),
                attached: false,
                log: VecDeque::new(),
                next_message_id: 1,
            },
        );
        self.by_addr.insert(addr, id);
        client
    }

    fn remove_client(&mut self, id: ClientId) -> Option<ServerClient> {
        let record = self.clients.remove(&id)?;
        if self.by_addr.get(&record.addr) == Some(&id) {
            self.by_addr.remove(&record.addr);
        }
        let mut client = record.client;
        client.status = ClientStatus::Disconnected;
        Some(client)
    }

    fn clear_clients(&mut self) -> Vec<ClientId> {
        self.by_addr.clear();
        std::mem::take(&mut self.clients).into_keys().collect()
    }
}

/// Thread-safe registry of servers and their clients
#[derive(Debug)]
pub struct Registry {
    servers: DashMap<ServerKey, ServerEntry>,
    next_tcp_id: AtomicU64,
    next_udp_id: AtomicU64,
    /// Serializes the duplicate-address check with the insert or update it guards
    admission: Mutex<()>,
    max_log_entries: usize,
}

impl Registry {
    /// Create an empty registry keeping `max_log_entries` messages per client
    pub fn new(max_log_entries: usize) -> Self {
        Self {
            servers: DashMap::new(),
            next_tcp_id: AtomicU64::new(1),
            next_udp_id: AtomicU64::new(1),
            admission: Mutex::new(()),
            max_log_entries: max_log_entries.max(1),
        }
    }

    fn next_server_id(&self, kind: ServerKind) -> ServerId {
        let counter = match kind {
            ServerKind::Tcp => &self.next_tcp_id,
            ServerKind::Udp => &self.next_udp_id,
        };
        ServerId::new(counter.fetch_add(1, Ordering::SeqCst))
    }

    fn check_duplicate(
        &self,
        kind: ServerKind,
        host: &str,
        port: u16,
        exclude: Option<ServerId>,
    ) -> Result<()> {
        // Port 0 asks the OS for a fresh port on every bind and never collides
        if port == 0 {
            return Ok(());
        }
        let clash = self.servers.iter().any(|entry| {
            let server = &entry.server;
            server.kind == kind
                && Some(server.id) != exclude
                && server.port == port
                && server.host.eq_ignore_ascii_case(host)
        });
        if clash {
            return Err(EngineError::DuplicateConfig(kind, format!("{host}:{port}")));
        }
        Ok(())
    }

    // Servers

    /// Add a server; it starts out `stopped`
    pub fn add(&self, kind: ServerKind, spec: ServerSpec) -> Result<Server> {
        validate_spec(&spec)?;
        let _admission = self.admission.lock().unwrap_or_else(|e| e.into_inner());
        self.check_duplicate(kind, &spec.host, spec.port, None)?;

        let server = Server {
            id: self.next_server_id(kind),
            remark: spec.remark,
            host: spec.host,
            port: spec.port,
            status: ServerStatus::Stopped,
            kind,
        };
        self.servers
            .insert(server.key(), ServerEntry::new(server.clone()));
        Ok(server)
    }

    /// Update remark, host and port of an existing server
    ///
    /// Re-addressing a server that is not stopped fails with `InUse`; the
    /// remark may change in any state. The status and kind of `update` are
    /// ignored.
    pub fn update(&self, kind: ServerKind, update: Server) -> Result<Server> {
        let key = ServerKey::new(kind, update.id);
        validate_spec(&ServerSpec {
            remark: update.remark.clone(),
            host: update.host.clone(),
            port: update.port,
        })?;
        let _admission = self.admission.lock().unwrap_or_else(|e| e.into_inner());
        self.check_duplicate(kind, &update.host, update.port, Some(update.id))?;

        let mut entry = self
            .servers
            .get_mut(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        let readdress = entry.server.host != update.host || entry.server.port != update.port;
        if readdress && !entry.server.status.is_idle() {
            return Err(EngineError::InUse(key));
        }
        entry.server.remark = update.remark;
        entry.server.host = update.host;
        entry.server.port = update.port;
        Ok(entry.server.clone())
    }

    /// Remove a stopped server
    pub fn remove(&self, key: ServerKey) -> Result<Server> {
        match self
            .servers
            .remove_if(&key, |_, entry| entry.server.status.is_idle())
        {
            Some((_, entry)) => Ok(entry.server),
            None if self.servers.contains_key(&key) => Err(EngineError::InUse(key)),
            None => Err(EngineError::ServerNotFound(key)),
        }
    }

    /// Get a copy of a server record
    pub fn get(&self, key: ServerKey) -> Result<Server> {
        self.servers
            .get(&key)
            .map(|entry| entry.server.clone())
            .ok_or(EngineError::ServerNotFound(key))
    }

    /// All servers of one kind, ordered by id
    pub fn list(&self, kind: ServerKind) -> Vec<Server> {
        let mut servers: Vec<Server> = self
            .servers
            .iter()
            .filter(|entry| entry.key().kind == kind)
            .map(|entry| entry.server.clone())
            .collect();
        servers.sort_by_key(|server| server.id);
        servers
    }

    /// Current status of a server
    pub fn status(&self, key: ServerKey) -> Result<ServerStatus> {
        self.servers
            .get(&key)
            .map(|entry| entry.server.status)
            .ok_or(EngineError::ServerNotFound(key))
    }

    /// Reason of the latest failure, if the server ever failed
    pub fn last_error(&self, key: ServerKey) -> Option<String> {
        self.servers
            .get(&key)
            .and_then(|entry| entry.last_error.clone())
    }

    /// Epoch of the current run, `None` unless running
    pub fn running_epoch(&self, key: ServerKey) -> Option<u64> {
        self.servers
            .get(&key)
            .filter(|entry| entry.server.status == ServerStatus::Running)
            .map(|entry| entry.epoch)
    }

    /// Ids and epochs of every running server of `kind`
    pub fn running(&self, kind: ServerKind) -> Vec<(ServerId, u64)> {
        let mut running: Vec<(ServerId, u64)> = self
            .servers
            .iter()
            .filter(|entry| {
                entry.key().kind == kind && entry.server.status == ServerStatus::Running
            })
            .map(|entry| (entry.server.id, entry.epoch))
            .collect();
        running.sort();
        running
    }

    // Lifecycle transitions

    /// Move a server to `starting` and open a new epoch
    pub fn begin_start(&self, key: ServerKey) -> Result<StartPermit> {
        let mut entry = self
            .servers
            .get_mut(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        match entry.server.status {
            ServerStatus::Running => Ok(StartPermit::AlreadyRunning),
            ServerStatus::Starting | ServerStatus::Stopping => Err(EngineError::InUse(key)),
            ServerStatus::Stopped | ServerStatus::Error => {
                entry.epoch += 1;
                entry.server.status = ServerStatus::Starting;
                entry.clear_clients();
                Ok(StartPermit::Proceed {
                    server: entry.server.clone(),
                    epoch: entry.epoch,
                })
            }
        }
    }

    /// Complete a start: `starting` → `running`
    pub fn mark_running(&self, key: ServerKey, epoch: u64) -> Result<Server> {
        let mut entry = self
            .servers
            .get_mut(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        if entry.epoch != epoch || entry.server.status != ServerStatus::Starting {
            return Err(EngineError::ServerNotRunning(key));
        }
        entry.server.status = ServerStatus::Running;
        entry.last_error = None;
        Ok(entry.server.clone())
    }

    /// Move the run identified by `epoch` to `error`, dropping its clients
    ///
    /// Returns the removed client ids, or `None` if that run is already over.
    pub fn mark_failed(
        &self,
        key: ServerKey,
        epoch: u64,
        reason: impl Into<String>,
    ) -> Option<Vec<ClientId>> {
        let mut entry = self.servers.get_mut(&key)?;
        if entry.epoch != epoch || !entry.server.status.is_active() {
            return None;
        }
        entry.server.status = ServerStatus::Error;
        entry.last_error = Some(reason.into());
        Some(entry.clear_clients())
    }

    /// Move a server to `stopping`
    ///
    /// Returns `false` when the server is already stopped. From this point on
    /// no client can be registered for the old epoch.
    pub fn begin_stop(&self, key: ServerKey) -> Result<bool> {
        let mut entry = self
            .servers
            .get_mut(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        if entry.server.status == ServerStatus::Stopped {
            return Ok(false);
        }
        entry.server.status = ServerStatus::Stopping;
        Ok(true)
    }

    /// Complete a stop: clear every client and peer profile and mark `stopped`
    pub fn finish_stop(&self, key: ServerKey) -> Result<Vec<ClientId>> {
        let mut entry = self
            .servers
            .get_mut(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        entry.server.status = ServerStatus::Stopped;
        entry.profiles.clear();
        Ok(entry.clear_clients())
    }

    // Clients

    /// Register a newly accepted client for the run `epoch`
    ///
    /// Settings previously applied to the same peer address are re-applied.
    pub fn add_client(&self, key: ServerKey, epoch: u64, addr: SocketAddr) -> Result<ServerClient> {
        let mut entry = self
            .servers
            .get_mut(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        if !entry.accepts_clients(epoch) {
            return Err(EngineError::ServerNotRunning(key));
        }
        Ok(entry.insert_client(addr))
    }

    /// Look up the client for a datagram source, creating it if unseen
    ///
    /// Returns the client and whether it was created by this call.
    pub fn touch_peer(
        &self,
        key: ServerKey,
        epoch: u64,
        addr: SocketAddr,
    ) -> Result<(ServerClient, bool)> {
        let mut entry = self
            .servers
            .get_mut(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        if !entry.accepts_clients(epoch) {
            return Err(EngineError::ServerNotRunning(key));
        }
        if let Some(id) = entry.by_addr.get(&addr).copied() {
            if let Some(record) = entry.clients.get_mut(&id) {
                record.last_seen = Instant::now();
                return Ok((record.client.clone(), false));
            }
        }
        Ok((entry.insert_client(addr), true))
    }

    /// Mark a client's transport handle as installed
    ///
    /// Returns `false` if the client is already gone.
    pub fn attach_client(&self, key: ServerKey, id: ClientId) -> bool {
        self.servers
            .get_mut(&key)
            .and_then(|mut entry| {
                entry.clients.get_mut(&id).map(|record| {
                    record.attached = true;
                })
            })
            .is_some()
    }

    /// Remove a client, returning its last state marked `disconnected`
    pub fn remove_client(&self, key: ServerKey, id: ClientId) -> Option<ServerClient> {
        self.servers.get_mut(&key)?.remove_client(id)
    }

    /// Flag a client as disconnected while its transport is torn down
    pub fn mark_client_disconnected(&self, key: ServerKey, id: ClientId) -> bool {
        self.servers
            .get_mut(&key)
            .and_then(|mut entry| {
                entry.clients.get_mut(&id).map(|record| {
                    record.client.status = ClientStatus::Disconnected;
                })
            })
            .is_some()
    }

    /// Get a copy of a client record
    pub fn get_client(&self, key: ServerKey, id: ClientId) -> Result<ServerClient> {
        let entry = self
            .servers
            .get(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        entry
            .clients
            .get(&id)
            .map(|record| record.client.clone())
            .ok_or(EngineError::ClientNotFound {
                server: key,
                client: id,
            })
    }

    /// Remote address of a client
    pub fn client_addr(&self, key: ServerKey, id: ClientId) -> Result<SocketAddr> {
        let entry = self
            .servers
            .get(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        entry
            .clients
            .get(&id)
            .map(|record| record.addr)
            .ok_or(EngineError::ClientNotFound {
                server: key,
                client: id,
            })
    }

    /// All clients of a server, ordered by id
    pub fn list_clients(&self, key: ServerKey) -> Result<Vec<ServerClient>> {
        let entry = self
            .servers
            .get(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        Ok(entry
            .clients
            .values()
            .map(|record| record.client.clone())
            .collect())
    }

    /// Ids of the clients of a server whose transport handle is installed
    pub fn attached_clients(&self, key: ServerKey) -> Vec<ClientId> {
        self.servers
            .get(&key)
            .map(|entry| {
                entry
                    .clients
                    .iter()
                    .filter(|(_, record)| record.attached)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of clients of a server
    pub fn client_count(&self, key: ServerKey) -> usize {
        self.servers
            .get(&key)
            .map(|entry| entry.clients.len())
            .unwrap_or(0)
    }

    /// Apply settings to a client and remember them for its peer address
    pub fn update_client(
        &self,
        key: ServerKey,
        id: ClientId,
        settings: ClientSettings,
    ) -> Result<ServerClient> {
        validate_settings(&settings)?;
        let mut entry = self
            .servers
            .get_mut(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        let record = entry
            .clients
            .get_mut(&id)
            .ok_or(EngineError::ClientNotFound {
                server: key,
                client: id,
            })?;
        record.client.remark = settings.remark.clone();
        record.client.repeat_send = settings.repeat_send;
        record.client.repeat_interval = settings.repeat_interval;
        record.client.send_content = settings.send_content.clone();
        let client = record.client.clone();
        let addr = record.addr;
        entry.profiles.insert(addr, settings);
        Ok(client)
    }

    /// Append a payload to a client's message log
    ///
    /// Incoming payloads also refresh the client's last-seen time.
    pub fn record_message(
        &self,
        key: ServerKey,
        id: ClientId,
        direction: Direction,
        payload: &[u8],
    ) -> Result<Message> {
        let max_entries = self.max_log_entries;
        let mut entry = self
            .servers
            .get_mut(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        let record = entry
            .clients
            .get_mut(&id)
            .ok_or(EngineError::ClientNotFound {
                server: key,
                client: id,
            })?;

        let message = Message {
            id: record.next_message_id,
            server_id: key.id,
            client_id: id,
            content: String::from_utf8_lossy(payload).into_owned(),
            direction,
            bytes: payload.len(),
            timestamp: unix_millis(),
        };
        record.next_message_id += 1;
        if direction == Direction::Incoming {
            record.last_seen = Instant::now();
        }
        while record.log.len() >= max_entries {
            record.log.pop_front();
        }
        record.log.push_back(message.clone());
        Ok(message)
    }

    /// Empty a client's message log, returning how many entries were dropped
    ///
    /// Message ids keep counting from where they were.
    pub fn clear_messages(&self, key: ServerKey, id: ClientId) -> Result<usize> {
        let mut entry = self
            .servers
            .get_mut(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        let record = entry
            .clients
            .get_mut(&id)
            .ok_or(EngineError::ClientNotFound {
                server: key,
                client: id,
            })?;
        let cleared = record.log.len();
        record.log.clear();
        Ok(cleared)
    }

    /// Empty the message log of every client of a server
    pub fn clear_server_messages(&self, key: ServerKey) -> Result<usize> {
        let mut entry = self
            .servers
            .get_mut(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        Ok(entry
            .clients
            .values_mut()
            .map(|record| {
                let cleared = record.log.len();
                record.log.clear();
                cleared
            })
            .sum())
    }

    /// Every client of a server with its message log, ordered by client id
    pub fn client_logs(&self, key: ServerKey) -> Result<Vec<(ServerClient, Vec<Message>)>> {
        let entry = self
            .servers
            .get(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        Ok(entry
            .clients
            .values()
            .map(|record| (record.client.clone(), record.log.iter().cloned().collect()))
            .collect())
    }

    /// A client's message log, oldest first
    pub fn messages(&self, key: ServerKey, id: ClientId) -> Result<Vec<Message>> {
        let entry = self
            .servers
            .get(&key)
            .ok_or(EngineError::ServerNotFound(key))?;
        entry
            .clients
            .get(&id)
            .map(|record| record.log.iter().cloned().collect())
            .ok_or(EngineError::ClientNotFound {
                server: key,
                client: id,
            })
    }

    /// Attached clients whose last inbound traffic is older than `timeout`
    pub fn idle_clients(&self, key: ServerKey, timeout: Duration) -> Vec<ClientId> {
        self.servers
            .get(&key)
            .map(|entry| {
                entry
                    .clients
                    .iter()
                    .filter(|(_, record)| record.attached && record.last_seen.elapsed() > timeout)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Validate a server address
pub fn validate_spec(spec: &ServerSpec) -> Result<()> {
    let host = spec.host.trim();
    if host.is_empty() {
        return Err(EngineError::InvalidConfig("host must not be empty".to_string()));
    }
    if host.len() != spec.host.len() {
        return Err(EngineError::InvalidConfig(
            "host must not contain surrounding whitespace".to_string(),
        ));
    }
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let hostname = host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if !hostname {
        return Err(EngineError::InvalidConfig(format!(
            "'{}' is neither an IP address nor a host name",
            spec.host
        )));
    }
    Ok(())
}

/// Validate client repeat-send settings
pub fn validate_settings(settings: &ClientSettings) -> Result<()> {
    if !settings.repeat_send {
        return Ok(());
    }
    if settings.interval() < MIN_REPEAT_INTERVAL {
        return Err(EngineError::InvalidConfig(format!(
            "repeat interval must be at least {} ms",
            MIN_REPEAT_INTERVAL.as_millis()
        )));
    }
    if settings.send_content.is_empty() {
        return Err(EngineError::InvalidConfig(
            "repeat-send needs non-empty content".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    fn registry() -> Registry {
        Registry::new(4)
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn running(registry: &Registry, kind: ServerKind, port: u16) -> (ServerKey, u64) {
        let server = registry.add(kind, ServerSpec::new("127.0.0.1", port)).unwrap();
        let key = server.key();
        let StartPermit::Proceed { epoch, .. } = registry.begin_start(key).unwrap() else {
            panic!("expected a start permit");
        };
        registry.mark_running(key, epoch).unwrap();
        (key, epoch)
    }

    #[test]
    fn test_add_defaults_to_stopped() {
        let registry = registry();
        let server = registry
            .add(ServerKind::Tcp, ServerSpec::new("localhost", 9000).with_remark("api"))
            .unwrap();
        assert_eq!(server.status, ServerStatus::Stopped);
        assert_eq!(registry.get(server.key()).unwrap(), server);
    }

    #[test]
    fn test_independent_id_namespaces() {
        let registry = registry();
        let tcp = registry.add(ServerKind::Tcp, ServerSpec::new("127.0.0.1", 1)).unwrap();
        let udp = registry.add(ServerKind::Udp, ServerSpec::new("127.0.0.1", 1)).unwrap();
        assert_eq!(tcp.id, ServerId::new(1));
        assert_eq!(udp.id, ServerId::new(1));
        assert_eq!(registry.list(ServerKind::Tcp).len(), 1);
        assert_eq!(registry.list(ServerKind::Udp).len(), 1);
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let registry = registry();
        registry.add(ServerKind::Udp, ServerSpec::new("127.0.0.1", 5000)).unwrap();
        let err = registry
            .add(ServerKind::Udp, ServerSpec::new("127.0.0.1", 5000))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateConfig);

        // Ephemeral ports never clash
        registry.add(ServerKind::Udp, ServerSpec::new("127.0.0.1", 0)).unwrap();
        registry.add(ServerKind::Udp, ServerSpec::new("127.0.0.1", 0)).unwrap();
    }

    #[test]
    fn test_invalid_host_rejected() {
        let registry = registry();
        for host in ["", " 127.0.0.1", "bad host", "-lead.example", "a..b"] {
            let err = registry
                .add(ServerKind::Tcp, ServerSpec::new(host, 80))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfig, "host {host:?}");
        }
        registry.add(ServerKind::Tcp, ServerSpec::new("::1", 80)).unwrap();
    }

    #[test]
    fn test_update_running_server() {
        let registry = registry();
        let (key, _) = running(&registry, ServerKind::Tcp, 7000);
        let mut server = registry.get(key).unwrap();

        server.remark = "renamed".to_string();
        let updated = registry.update(ServerKind::Tcp, server.clone()).unwrap();
        assert_eq!(updated.remark, "renamed");
        assert_eq!(updated.status, ServerStatus::Running);

        server.port = 7001;
        let err = registry.update(ServerKind::Tcp, server).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InUse);
    }

    #[test]
    fn test_remove_requires_stop() {
        let registry = registry();
        let (key, _) = running(&registry, ServerKind::Udp, 7000);
        assert_eq!(registry.remove(key).unwrap_err().kind(), ErrorKind::InUse);

        assert!(registry.begin_stop(key).unwrap());
        registry.finish_stop(key).unwrap();
        registry.remove(key).unwrap();
        assert_eq!(registry.get(key).unwrap_err().kind(), ErrorKind::ServerNotFound);
    }

    #[test]
    fn test_begin_start_is_idempotent() {
        let registry = registry();
        let (key, _) = running(&registry, ServerKind::Tcp, 0);
        assert_eq!(registry.begin_start(key).unwrap(), StartPermit::AlreadyRunning);
    }

    #[test]
    fn test_clients_rejected_after_stop() {
        let registry = registry();
        let (key, epoch) = running(&registry, ServerKind::Tcp, 0);
        registry.add_client(key, epoch, peer(4000)).unwrap();

        assert!(registry.begin_stop(key).unwrap());
        let err = registry.add_client(key, epoch, peer(4001)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerNotRunning);

        let removed = registry.finish_stop(key).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(registry.list_clients(key).unwrap().is_empty());
        assert!(!registry.begin_stop(key).unwrap());
    }

    #[test]
    fn test_stale_epoch_rejected() {
        let registry = registry();
        let (key, epoch) = running(&registry, ServerKind::Tcp, 0);
        registry.begin_stop(key).unwrap();
        registry.finish_stop(key).unwrap();
        let StartPermit::Proceed { epoch: next, .. } = registry.begin_start(key).unwrap() else {
            panic!("expected a start permit");
        };
        registry.mark_running(key, next).unwrap();

        assert!(registry.add_client(key, epoch, peer(4000)).is_err());
        assert!(registry.add_client(key, next, peer(4000)).is_ok());
    }

    #[test]
    fn test_touch_peer_creates_once() {
        let registry = registry();
        let (key, epoch) = running(&registry, ServerKind::Udp, 0);

        let (first, created) = registry.touch_peer(key, epoch, peer(6000)).unwrap();
        assert!(created);
        let (second, created) = registry.touch_peer(key, epoch, peer(6000)).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(registry.client_count(key), 1);

        let (other, created) = registry.touch_peer(key, epoch, peer(6001)).unwrap();
        assert!(created);
        assert_ne!(other.id, first.id);
    }

    #[test]
    fn test_profile_reapplied_to_returning_peer() {
        let registry = registry();
        let (key, epoch) = running(&registry, ServerKind::Udp, 0);
        let (client, _) = registry.touch_peer(key, epoch, peer(6000)).unwrap();

        let settings = ClientSettings::repeating("tick", Duration::from_millis(100));
        registry.update_client(key, client.id, settings).unwrap();
        registry.remove_client(key, client.id).unwrap();

        let (again, created) = registry.touch_peer(key, epoch, peer(6000)).unwrap();
        assert!(created);
        assert_ne!(again.id, client.id);
        assert!(again.repeat_send);
        assert_eq!(again.send_content, "tick");
    }

    #[test]
    fn test_update_client_validates_interval() {
        let registry = registry();
        let (key, epoch) = running(&registry, ServerKind::Tcp, 0);
        let client = registry.add_client(key, epoch, peer(4000)).unwrap();

        let settings = ClientSettings::repeating("x", Duration::from_millis(1));
        let err = registry.update_client(key, client.id, settings).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_message_log_is_bounded() {
        let registry = registry();
        let (key, epoch) = running(&registry, ServerKind::Tcp, 0);
        let client = registry.add_client(key, epoch, peer(4000)).unwrap();

        for i in 0..6 {
            registry
                .record_message(key, client.id, Direction::Incoming, format!("m{i}").as_bytes())
                .unwrap();
        }
        let log = registry.messages(key, client.id).unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0].content, "m2");
        assert_eq!(log[3].content, "m5");
        assert_eq!(log[3].id, 6);
    }

    #[test]
    fn test_idle_clients() {
        let registry = registry();
        let (key, epoch) = running(&registry, ServerKind::Udp, 0);
        let (client, _) = registry.touch_peer(key, epoch, peer(6000)).unwrap();
        registry.attach_client(key, client.id);

        assert!(registry.idle_clients(key, Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            registry.idle_clients(key, Duration::from_millis(5)),
            vec![client.id]
        );
    }

    #[test]
    fn test_detached_clients_hidden_from_sweeps() {
        let registry = registry();
        let (key, epoch) = running(&registry, ServerKind::Udp, 0);
        let (client, _) = registry.touch_peer(key, epoch, peer(6000)).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        // Visible to queries, invisible to sweeps
        assert_eq!(registry.client_count(key), 1);
        assert!(registry.attached_clients(key).is_empty());
        assert!(registry.idle_clients(key, Duration::from_millis(1)).is_empty());

        assert!(registry.attach_client(key, client.id));
        assert_eq!(registry.attached_clients(key), vec![client.id]);

        registry.remove_client(key, client.id).unwrap();
        assert!(!registry.attach_client(key, client.id));
    }

    #[test]
    fn test_running_requires_start() {
        let registry = registry();
        let server = registry.add(ServerKind::Tcp, ServerSpec::new("127.0.0.1", 0)).unwrap();
        let key = server.key();

        let err = registry.mark_running(key, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerNotRunning);
        assert_eq!(registry.status(key).unwrap(), ServerStatus::Stopped);
        assert!(registry.running_epoch(key).is_none());
        assert!(registry.mark_failed(key, 1, "nothing to fail").is_none());
        assert_eq!(registry.status(key).unwrap(), ServerStatus::Stopped);
    }

    #[test]
    fn test_clear_messages() {
        let registry = registry();
        let (key, epoch) = running(&registry, ServerKind::Tcp, 0);
        let first = registry.add_client(key, epoch, peer(4000)).unwrap();
        let second = registry.add_client(key, epoch, peer(4001)).unwrap();
        for client in [first.id, second.id] {
            registry.record_message(key, client, Direction::Incoming, b"a").unwrap();
            registry.record_message(key, client, Direction::Outgoing, b"b").unwrap();
        }

        assert_eq!(registry.clear_messages(key, first.id).unwrap(), 2);
        assert!(registry.messages(key, first.id).unwrap().is_empty());
        assert_eq!(registry.messages(key, second.id).unwrap().len(), 2);

        let next = registry
            .record_message(key, first.id, Direction::Incoming, b"c")
            .unwrap();
        assert_eq!(next.id, 3);

        assert_eq!(registry.clear_server_messages(key).unwrap(), 3);
        let logs = registry.client_logs(key).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|(_, log)| log.is_empty()));
    }

    #[test]
    fn test_repeat_needs_content() {
        let registry = registry();
        let (key, epoch) = running(&registry, ServerKind::Tcp, 0);
        let client = registry.add_client(key, epoch, peer(4000)).unwrap();

        let settings = ClientSettings::repeating("", Duration::from_millis(100));
        let err = registry.update_client(key, client.id, settings).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_stop_forgets_profiles() {
        let registry = registry();
        let (key, epoch) = running(&registry, ServerKind::Udp, 0);
        let (client, _) = registry.touch_peer(key, epoch, peer(6000)).unwrap();
        let settings = ClientSettings::repeating("tick", Duration::from_millis(100));
        registry.update_client(key, client.id, settings).unwrap();

        registry.begin_stop(key).unwrap();
        registry.finish_stop(key).unwrap();
        let StartPermit::Proceed { epoch, .. } = registry.begin_start(key).unwrap() else {
            panic!("expected a start permit");
        };
        registry.mark_running(key, epoch).unwrap();

        let (again, _) = registry.touch_peer(key, epoch, peer(6000)).unwrap();
        assert!(!again.repeat_send);
        assert!(again.send_content.is_empty());
    }

    #[test]
    fn test_mark_failed_clears_clients() {
        let registry = registry();
        let (key, epoch) = running(&registry, ServerKind::Tcp, 0);
        registry.add_client(key, epoch, peer(4000)).unwrap();

        let removed = registry.mark_failed(key, epoch, "listener closed").unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(registry.status(key).unwrap(), ServerStatus::Error);
        assert_eq!(registry.last_error(key).as_deref(), Some("listener closed"));

        // A second report for the same run is ignored
        assert!(registry.mark_failed(key, epoch, "again").is_none());
    }

    proptest! {
        #[test]
        fn prop_add_then_get_roundtrip(
            remark in ".{0,24}",
            host in "[a-z][a-z0-9]{0,8}(\\.[a-z][a-z0-9]{0,8}){0,2}",
            port in 1u16..,
            udp in any::<bool>(),
        ) {
            let registry = registry();
            let kind = if udp { ServerKind::Udp } else { ServerKind::Tcp };
            let spec = ServerSpec::new(host.clone(), port).with_remark(remark.clone());
            let added = registry.add(kind, spec).unwrap();
            let fetched = registry.get(added.key()).unwrap();

            prop_assert_eq!(fetched.remark, remark);
            prop_assert_eq!(fetched.host, host);
            prop_assert_eq!(fetched.port, port);
            prop_assert_eq!(fetched.kind, kind);
            prop_assert_eq!(fetched.status, ServerStatus::Stopped);
        }

        #[test]
        fn prop_server_ids_unique(count in 1usize..40) {
            let registry = registry();
            let mut ids = std::collections::HashSet::new();
            for _ in 0..count {
                let server = registry.add(ServerKind::Tcp, ServerSpec::new("127.0.0.1", 0)).unwrap();
                prop_assert!(ids.insert(server.id));
            }
        }
    }
}
