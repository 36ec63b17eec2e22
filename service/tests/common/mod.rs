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

//! Helpers shared by the integration tests

#![allow(dead_code)]

use connectivity_service::{
    ClientId, ConnectivityEngine, EngineConfig, ServerClient, ServerId, ServerKind, ServerSpec,
};
use std::net::SocketAddr;
use std::time::Duration;

pub fn engine() -> ConnectivityEngine {
    ConnectivityEngine::new(EngineConfig::default().with_write_timeout(Duration::from_secs(1)))
        .unwrap()
}

/// Add a loopback server on an ephemeral port and return its id
pub fn add(engine: &ConnectivityEngine, kind: ServerKind) -> ServerId {
    let result = engine.add_server(kind, ServerSpec::new("127.0.0.1", 0));
    assert!(result.success, "{}", result.message);
    result.data.as_server().unwrap().id
}

/// Add and start a loopback server, returning its id and bound address
pub async fn running(engine: &ConnectivityEngine, kind: ServerKind) -> (ServerId, SocketAddr) {
    let id = add(engine, kind);
    let started = engine.start_server(kind, id).await;
    assert!(started.success, "{}", started.message);
    let detail = engine.get_server_data(kind, id);
    let addr = detail
        .data
        .as_detail()
        .and_then(|detail| detail.local_addr.as_deref())
        .unwrap()
        .parse()
        .unwrap();
    (id, addr)
}

pub fn clients(engine: &ConnectivityEngine, kind: ServerKind, id: ServerId) -> Vec<ServerClient> {
    engine
        .get_clients(kind, id)
        .data
        .as_clients()
        .map(<[ServerClient]>::to_vec)
        .unwrap_or_default()
}

/// Poll until the server has exactly `count` clients
pub async fn wait_for_clients(
    engine: &ConnectivityEngine,
    kind: ServerKind,
    id: ServerId,
    count: usize,
) -> Vec<ServerClient> {
    for _ in 0..300 {
        let current = clients(engine, kind, id);
        if current.len() == count {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{kind} server {id} never reached {count} clients");
}

/// Poll until a client has logged at least `count` messages
pub async fn wait_for_messages(
    engine: &ConnectivityEngine,
    kind: ServerKind,
    id: ServerId,
    client: ClientId,
    count: usize,
) {
    for _ in 0..300 {
        let logged = engine
            .get_client_messages(kind, id, client)
            .data
            .as_messages()
            .map_or(0, <[_]>::len);
        if logged >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client {client} never logged {count} messages");
}
