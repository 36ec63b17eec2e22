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

//! Core types for the connectivity engine
//!
//! Every record that crosses the engine boundary serializes with camelCase
//! field names so the calling layer sees the same shape it always has.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identifier of a configured server (unique within its [`ServerKind`])
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(u64);

impl ServerId {
    /// Create a new server ID
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a client (unique within its parent server, never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    /// Create a new client ID
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport protocol of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// Stream listener, one task per accepted connection
    Tcp,
    /// Datagram socket, peers tracked as virtual clients
    Udp,
}

impl ServerKind {
    /// Both kinds, in a stable order
    pub const ALL: [ServerKind; 2] = [ServerKind::Tcp, ServerKind::Udp];

    /// Lowercase wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully qualified server address inside the registry
///
/// TCP and UDP ids live in independent namespaces, so the kind is part of
/// the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKey {
    pub kind: ServerKind,
    pub id: ServerId,
}

impl ServerKey {
    pub const fn new(kind: ServerKind, id: ServerId) -> Self {
        Self { kind, id }
    }

    pub const fn tcp(id: ServerId) -> Self {
        Self::new(ServerKind::Tcp, id)
    }

    pub const fn udp(id: ServerId) -> Self {
        Self::new(ServerKind::Udp, id)
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Server lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServerStatus {
    /// Check if the server may be deleted or re-addressed
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Check if the server owns live sockets
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Connection state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Caller-supplied configuration for a new server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    #[serde(default)]
    pub remark: String,
    pub host: String,
    pub port: u16,
}

impl ServerSpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            remark: String::new(),
            host: host.into(),
            port,
        }
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }
}

/// A configured server as exchanged with the calling layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: ServerId,
    pub remark: String,
    pub host: String,
    pub port: u16,
    pub status: ServerStatus,
    #[serde(rename = "type")]
    pub kind: ServerKind,
}

impl Server {
    pub fn key(&self) -> ServerKey {
        ServerKey::new(self.kind, self.id)
    }

    /// `host:port` as configured
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A connected peer of a running server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerClient {
    pub id: ClientId,
    pub remark: String,
    pub host: String,
    pub port: u16,
    pub status: ClientStatus,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    pub repeat_send: bool,
    /// Milliseconds between repeated sends
    pub repeat_interval: u64,
    pub send_content: String,
}

impl ServerClient {
    /// Remote address of the peer
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.host, self.port).parse().ok().or_else(|| {
            // IPv6 literals need brackets to parse as a socket address
            format!("[{}]:{}", self.host, self.port).parse().ok()
        })
    }

    /// The repeat-send portion of this client's configuration
    pub fn settings(&self) -> ClientSettings {
        ClientSettings {
            remark: self.remark.clone(),
            repeat_send: self.repeat_send,
            repeat_interval: self.repeat_interval,
            send_content: self.send_content.clone(),
        }
    }
}

/// Per-client settings applied through `update_client`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub repeat_send: bool,
    /// Milliseconds between repeated sends
    #[serde(default)]
    pub repeat_interval: u64,
    #[serde(default)]
    pub send_content: String,
}

impl ClientSettings {
    /// Settings that enable repeat-send of `content` every `interval`
    pub fn repeating(content: impl Into<String>, interval: Duration) -> Self {
        Self {
            remark: String::new(),
            repeat_send: true,
            repeat_interval: interval.as_millis() as u64,
            send_content: content.into(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.repeat_interval)
    }
}

/// Direction of a logged message relative to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// One entry in a client's bounded message log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: u64,
    pub server_id: ServerId,
    pub client_id: ClientId,
    /// Payload decoded as UTF-8 (lossy)
    pub content: String,
    pub direction: Direction,
    /// Raw payload length
    pub bytes: usize,
    /// Milliseconds since the UNIX epoch
    pub timestamp: u64,
}

/// Milliseconds since the UNIX epoch
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_wire_shape() {
        let server = Server {
            id: ServerId::new(3),
            remark: "bench".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            status: ServerStatus::Running,
            kind: ServerKind::Tcp,
        };
        let json = serde_json::to_value(&server).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 3,
                "remark": "bench",
                "host": "127.0.0.1",
                "port": 9000,
                "status": "running",
                "type": "tcp",
            })
        );
    }

    #[test]
    fn test_client_wire_shape() {
        let client = ServerClient {
            id: ClientId::new(7),
            remark: String::new(),
            host: "10.0.0.2".to_string(),
            port: 50123,
            status: ClientStatus::Connected,
            kind: ServerKind::Udp,
            repeat_send: true,
            repeat_interval: 250,
            send_content: "ping".to_string(),
        };
        let json = serde_json::to_value(&client).unwrap();
        assert_eq!(json["repeatSend"], true);
        assert_eq!(json["repeatInterval"], 250);
        assert_eq!(json["sendContent"], "ping");
        assert_eq!(json["type"], "udp");
        assert_eq!(json["status"], "connected");
    }

    #[test]
    fn test_peer_addr_parsing() {
        let mut client = ServerClient {
            id: ClientId::new(1),
            remark: String::new(),
            host: "127.0.0.1".to_string(),
            port: 4000,
            status: ClientStatus::Connected,
            kind: ServerKind::Tcp,
            repeat_send: false,
            repeat_interval: 0,
            send_content: String::new(),
        };
        assert_eq!(client.peer_addr(), Some("127.0.0.1:4000".parse().unwrap()));

        client.host = "::1".to_string();
        assert_eq!(client.peer_addr(), Some("[::1]:4000".parse().unwrap()));
    }

    #[test]
    fn test_server_status_predicates() {
        assert!(ServerStatus::Stopped.is_idle());
        assert!(ServerStatus::Error.is_idle());
        assert!(!ServerStatus::Running.is_idle());
        assert!(ServerStatus::Starting.is_active());
        assert!(ServerStatus::Stopping.is_active());
        assert!(!ServerStatus::Error.is_active());
    }

    #[test]
    fn test_server_key_display() {
        assert_eq!(ServerKey::tcp(ServerId::new(4)).to_string(), "tcp:4");
        assert_eq!(ServerKey::udp(ServerId::new(9)).to_string(), "udp:9");
    }
}
