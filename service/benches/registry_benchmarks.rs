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

//! Benchmarks for registry operations and server lifecycle

use connectivity_service::{
    ConnectivityEngine, Direction, Registry, ServerKey, ServerKind, ServerSpec, StartPermit,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::net::SocketAddr;
use tokio::runtime::Runtime;

fn running_server(registry: &Registry, kind: ServerKind) -> (ServerKey, u64) {
    let key = registry
        .add(kind, ServerSpec::new("127.0.0.1", 0))
        .unwrap()
        .key();
    let StartPermit::Proceed { epoch, .. } = registry.begin_start(key).unwrap() else {
        unreachable!("fresh server is stopped");
    };
    registry.mark_running(key, epoch).unwrap();
    (key, epoch)
}

fn bench_servers(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_servers");

    group.bench_function("add", |b| {
        let registry = Registry::new(256);
        b.iter(|| black_box(registry.add(ServerKind::Tcp, ServerSpec::new("127.0.0.1", 0))))
    });

    for count in [10usize, 100, 1000] {
        let registry = Registry::new(256);
        for port in 0..count {
            registry
                .add(ServerKind::Tcp, ServerSpec::new("127.0.0.1", 10_000 + port as u16))
                .unwrap();
        }
        group.bench_with_input(BenchmarkId::new("list", count), &registry, |b, registry| {
            b.iter(|| black_box(registry.list(ServerKind::Tcp)))
        });
        group.bench_with_input(
            BenchmarkId::new("add_with_duplicate_check", count),
            &registry,
            |b, registry| {
                b.iter(|| black_box(registry.add(ServerKind::Tcp, ServerSpec::new("127.0.0.1", 9))))
            },
        );
    }

    group.finish();
}

fn bench_clients(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_clients");

    group.bench_function("touch_known_peer", |b| {
        let registry = Registry::new(256);
        let (key, epoch) = running_server(&registry, ServerKind::Udp);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        registry.touch_peer(key, epoch, peer).unwrap();
        b.iter(|| black_box(registry.touch_peer(key, epoch, peer)))
    });

    let payload = vec![b'x'; 512];
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("record_message_full_log", |b| {
        let registry = Registry::new(256);
        let (key, epoch) = running_server(&registry, ServerKind::Tcp);
        let client = registry
            .add_client(key, epoch, "127.0.0.1:40000".parse().unwrap())
            .unwrap()
            .id;
        for _ in 0..256 {
            registry
                .record_message(key, client, Direction::Incoming, &payload)
                .unwrap();
        }
        b.iter(|| black_box(registry.record_message(key, client, Direction::Incoming, &payload)))
    });

    group.finish();
}

fn bench_lifecycle(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let engine = ConnectivityEngine::default();
    let id = engine
        .add_server(ServerKind::Tcp, ServerSpec::new("127.0.0.1", 0))
        .data
        .as_server()
        .unwrap()
        .id;

    c.bench_function("tcp_start_stop", |b| {
        b.to_async(&runtime).iter(|| async {
            engine.start_server(ServerKind::Tcp, id).await;
            engine.stop_server(ServerKind::Tcp, id).await;
        })
    });
}

criterion_group!(benches, bench_servers, bench_clients, bench_lifecycle);
criterion_main!(benches);
