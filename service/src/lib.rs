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

//! Concurrent TCP and UDP test server engine
//!
//! The engine manages any number of TCP listeners and UDP sockets side by
//! side. Each server can be started and stopped on its own, tracks the peers
//! that talk to it, logs their traffic and can push scheduled messages back
//! to them.
//!
//! # Architecture
//!
//! ```text
//! ConnectivityEngine ──► OperationResult { success, message, data }
//!     │
//!     ├── TcpServerManager ─┐
//!     ├── UdpServerManager ─┼──► Registry (servers, clients, message logs)
//!     ├── RepeatScheduler ──┤
//!     └── StatusPoller ─────┘
//!                 │
//!                 └──► EventBus ──► subscribers
//! ```
//!
//! All shared records live in the [`Registry`]. Managers own sockets and
//! tasks and report every state change back to the registry and the
//! [`EventBus`].
//!
//! # Example
//!
//! ```no_run
//! use connectivity_service::{ConnectivityEngine, EngineConfig, ServerKind, ServerSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = ConnectivityEngine::new(EngineConfig::default())?;
//!
//!     let added = engine.add_server(ServerKind::Tcp, ServerSpec::new("127.0.0.1", 9000));
//!     let id = added.data().as_server().ok_or("add failed")?.id;
//!
//!     let started = engine.start_server(ServerKind::Tcp, id).await;
//!     println!("{}", started.message);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

mod config;
mod engine;
mod envelope;
mod error;
mod events;
mod manager;
mod metrics;
mod poller;
mod registry;
mod scheduler;
mod tcp;
mod types;
mod udp;

pub use config::{EngineConfig, MIN_REPEAT_INTERVAL};
pub use engine::ConnectivityEngine;
pub use envelope::{OperationResult, ResponseData, ServerDetail, StatusReport};
pub use error::{EngineError, ErrorKind, Result};
pub use events::{DisconnectReason, EngineEvent, EventBus};
pub use manager::{EngineContext, ProtocolManager, ReconcileReport};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use poller::{PollReport, StatusPoller};
pub use registry::{validate_settings, validate_spec, Registry, StartPermit};
pub use scheduler::RepeatScheduler;
pub use tcp::TcpServerManager;
pub use types::{
    ClientId, ClientSettings, ClientStatus, Direction, Message, Server, ServerClient, ServerId,
    ServerKey, ServerKind, ServerSpec, ServerStatus,
};
pub use udp::UdpServerManager;
