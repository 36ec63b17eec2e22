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

//! Error types for the connectivity engine

use crate::types::{ClientId, ServerKey};
use enum_kinds::EnumKind;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Connectivity engine error types
///
/// [`ErrorKind`] is the fieldless mirror of this enum, handy for matching on
/// the failure class without caring about its payload.
#[derive(Debug, Error, EnumKind)]
#[enum_kind(ErrorKind)]
pub enum EngineError {
    /// Unknown server id
    #[error("Server {0} not found")]
    ServerNotFound(ServerKey),

    /// Unknown client id within a known server
    #[error("Client {client} not found on server {server}")]
    ClientNotFound { server: ServerKey, client: ClientId },

    /// Malformed host, port or interval
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Another server of the same kind already uses this address
    #[error("A {0} server is already configured for {1}")]
    DuplicateConfig(crate::types::ServerKind, String),

    /// Operation requires the server to be stopped first
    #[error("Server {0} is in use")]
    InUse(ServerKey),

    /// Listen or bind failed
    #[error("Failed to bind {address}: {reason}")]
    BindError { address: String, reason: String },

    /// The client exists but its transport is gone
    #[error("Client {client} on server {server} is not connected")]
    NotConnected { server: ServerKey, client: ClientId },

    /// The server is not running
    #[error("Server {0} is not running")]
    ServerNotRunning(ServerKey),

    /// Transport failure during send
    #[error("Write to client {client} on server {server} failed: {reason}")]
    WriteError {
        server: ServerKey,
        client: ClientId,
        reason: String,
    },

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// I/O error from an underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Get the fieldless kind of this error
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from(self)
    }

    /// Check if the error is recoverable
    ///
    /// Recoverable errors are transport hiccups where retrying the same
    /// operation later might succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout | EngineError::WriteError { .. } | EngineError::Io(_)
        )
    }

    /// Check if a repeat-send job should stop after this error
    ///
    /// Only errors meaning the target is gone end the schedule; transport
    /// failures are recorded and the job keeps running.
    pub fn cancels_repeat(&self) -> bool {
        matches!(
            self,
            EngineError::ClientNotFound { .. }
                | EngineError::NotConnected { .. }
                | EngineError::ServerNotFound(_)
                | EngineError::ServerNotRunning(_)
        )
    }

    /// Classify a bind failure into a readable reason
    pub(crate) fn bind(address: impl Into<String>, error: &std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let reason = match error.kind() {
            IoKind::AddrInUse => "address already in use".to_string(),
            IoKind::PermissionDenied => "permission denied".to_string(),
            IoKind::AddrNotAvailable => "cannot assign requested address".to_string(),
            _ => error.to_string(),
        };
        EngineError::BindError {
            address: address.into(),
            reason,
        }
    }
}
