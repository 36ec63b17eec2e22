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

//! Serialized shape of engine answers and events as seen by a calling layer

mod common;

use common::{engine, running, wait_for_clients};
use connectivity_service::{ClientSettings, EngineEvent, ServerId, ServerKind, ServerSpec};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;

#[tokio::test]
async fn test_server_list_shape() {
    let engine = engine();
    engine.add_server(ServerKind::Udp, ServerSpec::new("0.0.0.0", 5353).with_remark("dns"));

    let json = serde_json::to_value(engine.get_all_servers(ServerKind::Udp)).unwrap();
    assert_eq!(
        json,
        json!({
            "success": true,
            "message": "Servers retrieved",
            "data": [{
                "id": 1,
                "remark": "dns",
                "host": "0.0.0.0",
                "port": 5353,
                "status": "stopped",
                "type": "udp"
            }]
        })
    );
}

#[tokio::test]
async fn test_client_shape() {
    let engine = engine();
    let (id, addr) = running(&engine, ServerKind::Tcp).await;
    let peer = TcpStream::connect(addr).await.unwrap();
    let client = wait_for_clients(&engine, ServerKind::Tcp, id, 1).await[0].id;

    let settings = ClientSettings {
        remark: "probe".to_string(),
        ..ClientSettings::repeating("ping", Duration::from_millis(250))
    };
    let json = serde_json::to_value(engine.update_client(ServerKind::Tcp, id, client, settings)).unwrap();
    let data = &json["data"];
    assert_eq!(data["id"], 1);
    assert_eq!(data["remark"], "probe");
    assert_eq!(data["host"], "127.0.0.1");
    assert_eq!(data["port"], peer.local_addr().unwrap().port());
    assert_eq!(data["status"], "connected");
    assert_eq!(data["type"], "tcp");
    assert_eq!(data["repeatSend"], true);
    assert_eq!(data["repeatInterval"], 250);
    assert_eq!(data["sendContent"], "ping");
    engine.shutdown().await;
}

#[tokio::test]
async fn test_failure_shape() {
    let engine = engine();
    let json = serde_json::to_value(engine.stop_server(ServerKind::Tcp, ServerId::new(3)).await).unwrap();
    assert_eq!(json["success"], false);
    assert_eq!(json["message"], "Server tcp:3 not found");
    assert_eq!(json["data"], Value::Null);
}

#[tokio::test]
async fn test_event_shape() {
    let engine = engine();
    let mut events = engine.subscribe();
    let (id, _) = running(&engine, ServerKind::Udp).await;

    let event = events.recv().await.unwrap();
    assert!(matches!(event, EngineEvent::ServerStarted { .. }));
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "server_started");
    assert_eq!(json["kind"], "udp");
    assert_eq!(json["serverId"], id.as_u64());
    assert!(json["localAddr"].as_str().unwrap().starts_with("127.0.0.1:"));
    engine.shutdown().await;
}
