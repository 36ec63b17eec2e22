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

//! Run a set of TCP and UDP test servers from the command line
//!
//! Every engine event is printed to stdout as one JSON object per line;
//! logs go to stderr and follow `RUST_LOG`.
//!
//! ```text
//! connectivity-console --tcp 127.0.0.1:9000 --udp 0.0.0.0:9001 --repeat ping
//! ```

use clap::Parser;
use connectivity_service::{
    ClientSettings, ConnectivityEngine, EngineConfig, EngineEvent, ServerKind, ServerSpec,
};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "connectivity-console", version, about)]
struct Args {
    /// TCP listener to start, as HOST:PORT (repeatable)
    #[arg(long = "tcp", value_name = "HOST:PORT", value_parser = parse_endpoint)]
    tcp: Vec<ServerSpec>,

    /// UDP socket to start, as HOST:PORT (repeatable)
    #[arg(long = "udp", value_name = "HOST:PORT", value_parser = parse_endpoint)]
    udp: Vec<ServerSpec>,

    /// Evict UDP peers silent for this long
    #[arg(long, default_value_t = 60_000)]
    idle_timeout_ms: u64,

    /// Interval between status sweeps
    #[arg(long, default_value_t = 5_000)]
    poll_interval_ms: u64,

    /// Messages kept per client
    #[arg(long, default_value_t = 256)]
    max_log_entries: usize,

    /// Send this payload to every client that connects, repeatedly
    #[arg(long, value_name = "CONTENT")]
    repeat: Option<String>,

    /// Interval of --repeat
    #[arg(long, default_value_t = 1_000)]
    repeat_interval_ms: u64,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_idle_timeout(Duration::from_millis(self.idle_timeout_ms))
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_max_log_entries(self.max_log_entries)
    }

    fn repeat_settings(&self) -> Option<ClientSettings> {
        self.repeat.as_ref().map(|content| {
            ClientSettings::repeating(content.clone(), Duration::from_millis(self.repeat_interval_ms))
        })
    }
}

/// Parse `HOST:PORT`, accepting bracketed IPv6 hosts
fn parse_endpoint(value: &str) -> Result<ServerSpec, String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("'{value}' is not HOST:PORT"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port
        .parse::<u16>()
        .map_err(|err| format!("invalid port in '{value}': {err}"))?;
    Ok(ServerSpec::new(host, port).with_remark(value))
}

/// Log filter from `RUST_LOG` directives, `info` when unset or unparsable
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(log_filter(directives.as_deref()))
        .init();

    let args = Args::parse();
    if args.tcp.is_empty() && args.udp.is_empty() {
        return Err("nothing to run: pass at least one --tcp or --udp endpoint".into());
    }

    let engine = ConnectivityEngine::new(args.engine_config())?;
    let repeat = args.repeat_settings();
    let mut events = engine.subscribe();

    let servers = args
        .tcp
        .iter()
        .map(|spec| (ServerKind::Tcp, spec))
        .chain(args.udp.iter().map(|spec| (ServerKind::Udp, spec)));
    for (kind, spec) in servers {
        let added = engine.add_server(kind, spec.clone());
        let Some(server) = added.data.as_server() else {
            tracing::error!(%kind, address = %spec.remark, reason = %added.message, "cannot add server");
            continue;
        };
        let started = engine.start_server(kind, server.id).await;
        if !started.success {
            tracing::error!(%kind, address = %spec.remark, reason = %started.message, "cannot start server");
        }
    }
    engine.start_poller();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if let (EngineEvent::ClientConnected { kind, server_id, client }, Some(settings)) =
                        (&event, &repeat)
                    {
                        let updated = engine.update_client(*kind, *server_id, client.id, settings.clone());
                        if !updated.success {
                            tracing::warn!(client = %client.id, reason = %updated.message, "cannot enable repeat-send");
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event output fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    engine.shutdown().await;
    let metrics = engine.metrics();
    tracing::info!(
        clients = metrics.clients_connected,
        received = metrics.bytes_received,
        sent = metrics.bytes_sent,
        "done"
    );
    Ok(())
}
