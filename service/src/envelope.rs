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

//! Uniform result envelope returned by every control operation
//!
//! On the wire the envelope is always `{success, message, data}`. Internally
//! `data` is a [`ResponseData`] variant per operation instead of an untyped
//! value; it serializes untagged, so callers see the bare payload (or `null`).

use crate::error::{EngineError, ErrorKind, Result};
use crate::types::{Message, Server, ServerClient, ServerId, ServerKind, ServerStatus};
use serde::Serialize;

/// Server record plus its live state and received data
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDetail {
    #[serde(flatten)]
    pub server: Server,
    /// Address actually bound while running (resolves port 0)
    pub local_addr: Option<String>,
    pub clients: Vec<ServerClient>,
    /// Message logs of every current client, grouped by client id
    pub messages: Vec<Message>,
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub id: ServerId,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    pub status: ServerStatus,
    pub client_count: usize,
    pub local_addr: Option<String>,
    /// Reason of the most recent transition to `error`
    pub last_error: Option<String>,
}

/// Operation-specific payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseData {
    Empty,
    Server(Server),
    ServerList(Vec<Server>),
    ServerDetail(ServerDetail),
    Status(StatusReport),
    Client(ServerClient),
    ClientList(Vec<ServerClient>),
    MessageLog(Vec<Message>),
}

impl ResponseData {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn as_server(&self) -> Option<&Server> {
        match self {
            Self::Server(server) => Some(server),
            Self::ServerDetail(detail) => Some(&detail.server),
            _ => None,
        }
    }

    pub fn as_servers(&self) -> Option<&[Server]> {
        match self {
            Self::ServerList(servers) => Some(servers),
            _ => None,
        }
    }

    pub fn as_detail(&self) -> Option<&ServerDetail> {
        match self {
            Self::ServerDetail(detail) => Some(detail),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<&StatusReport> {
        match self {
            Self::Status(report) => Some(report),
            _ => None,
        }
    }

    pub fn as_client(&self) -> Option<&ServerClient> {
        match self {
            Self::Client(client) => Some(client),
            _ => None,
        }
    }

    pub fn as_clients(&self) -> Option<&[ServerClient]> {
        match self {
            Self::ClientList(clients) => Some(clients),
            Self::ServerDetail(detail) => Some(&detail.clients),
            _ => None,
        }
    }

    pub fn as_messages(&self) -> Option<&[Message]> {
        match self {
            Self::MessageLog(messages) => Some(messages),
            Self::ServerDetail(detail) => Some(&detail.messages),
            _ => None,
        }
    }
}

impl From<()> for ResponseData {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}

impl From<Server> for ResponseData {
    fn from(server: Server) -> Self {
        Self::Server(server)
    }
}

impl From<Vec<Server>> for ResponseData {
    fn from(servers: Vec<Server>) -> Self {
        Self::ServerList(servers)
    }
}

impl From<ServerDetail> for ResponseData {
    fn from(detail: ServerDetail) -> Self {
        Self::ServerDetail(detail)
    }
}

impl From<StatusReport> for ResponseData {
    fn from(report: StatusReport) -> Self {
        Self::Status(report)
    }
}

impl From<ServerClient> for ResponseData {
    fn from(client: ServerClient) -> Self {
        Self::Client(client)
    }
}

impl From<Vec<ServerClient>> for ResponseData {
    fn from(clients: Vec<ServerClient>) -> Self {
        Self::ClientList(clients)
    }
}

impl From<Vec<Message>> for ResponseData {
    fn from(messages: Vec<Message>) -> Self {
        Self::MessageLog(messages)
    }
}

/// `{success, message, data}` envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    pub data: ResponseData,
    /// Failure class, for in-process callers; not part of the wire shape
    #[serde(skip)]
    error_kind: Option<ErrorKind>,
}

impl OperationResult {
    /// Successful result carrying `data`
    pub fn ok(message: impl Into<String>, data: impl Into<ResponseData>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: data.into(),
            error_kind: None,
        }
    }

    /// Failed result describing `error`
    pub fn failure(error: &EngineError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            data: ResponseData::Empty,
            error_kind: Some(error.kind()),
        }
    }

    /// Wrap an internal result, using `message` on success
    pub fn respond<T: Into<ResponseData>>(result: Result<T>, message: &str) -> Self {
        match result {
            Ok(data) => Self::ok(message, data),
            Err(error) => {
                tracing::debug!(error = %error, "operation failed");
                Self::failure(&error)
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    pub fn data(&self) -> &ResponseData {
        &self.data
    }

    pub fn into_data(self) -> ResponseData {
        self.data
    }
}
