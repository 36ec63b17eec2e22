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

//! Lock-free metrics for the connectivity engine
//!
//! Every update is mirrored to the `metrics` facade so an installed exporter
//! sees the same numbers the local [`MetricsSnapshot`] reports.

use ::metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free engine metrics
#[derive(Debug)]
pub struct EngineMetrics {
    // Lifecycle
    servers_started: AtomicU64,
    server_failures: AtomicU64,

    // Clients
    clients_connected: AtomicU64,
    clients_active: AtomicU64,
    clients_evicted: AtomicU64,

    // Throughput
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,

    // Repeat-send
    repeat_sends: AtomicU64,

    // Errors
    send_errors: AtomicU64,
    transient_errors: AtomicU64,

    started_at: Instant,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            servers_started: AtomicU64::new(0),
            server_failures: AtomicU64::new(0),
            clients_connected: AtomicU64::new(0),
            clients_active: AtomicU64::new(0),
            clients_evicted: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            repeat_sends: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            transient_errors: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Record a server reaching `running`
    pub fn server_started(&self) {
        self.servers_started.fetch_add(1, Ordering::Relaxed);
        counter!("connectivity.servers.started").increment(1);
    }

    /// Record a server moving to `error`
    pub fn server_failed(&self) {
        self.server_failures.fetch_add(1, Ordering::Relaxed);
        counter!("connectivity.servers.failed").increment(1);
    }

    /// Record a client appearing
    pub fn client_connected(&self) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
        self.clients_active.fetch_add(1, Ordering::Relaxed);
        counter!("connectivity.clients.total").increment(1);
        gauge!("connectivity.clients.active").increment(1.0);
    }

    /// Record a client going away
    pub fn client_disconnected(&self) {
        // Saturate instead of wrapping if bookkeeping ever races
        let _ = self
            .clients_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        gauge!("connectivity.clients.active").decrement(1.0);
    }

    /// Record a UDP peer evicted for inactivity
    pub fn client_evicted(&self) {
        self.clients_evicted.fetch_add(1, Ordering::Relaxed);
        counter!("connectivity.clients.evicted").increment(1);
    }

    /// Record an outgoing payload
    pub fn message_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        counter!("connectivity.messages.sent").increment(1);
        counter!("connectivity.bytes.sent").increment(bytes as u64);
    }

    /// Record an incoming payload
    pub fn message_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        counter!("connectivity.messages.received").increment(1);
        counter!("connectivity.bytes.received").increment(bytes as u64);
    }

    /// Record a send issued by the repeat scheduler
    pub fn repeat_send(&self) {
        self.repeat_sends.fetch_add(1, Ordering::Relaxed);
        counter!("connectivity.repeat.sends").increment(1);
    }

    /// Record a failed send
    pub fn send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
        counter!("connectivity.errors.send").increment(1);
    }

    /// Record a retried accept/receive error
    pub fn transient_error(&self) {
        self.transient_errors.fetch_add(1, Ordering::Relaxed);
        counter!("connectivity.errors.transient").increment(1);
    }

    /// Get the current number of clients across all servers
    pub fn active_clients(&self) -> u64 {
        self.clients_active.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics
    ///
    /// Individual counters are read independently, so the snapshot is only
    /// approximately consistent while traffic is flowing.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            servers_started: self.servers_started.load(Ordering::Relaxed),
            server_failures: self.server_failures.load(Ordering::Relaxed),
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
            clients_active: self.clients_active.load(Ordering::Relaxed),
            clients_evicted: self.clients_evicted.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            repeat_sends: self.repeat_sends.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

/// A snapshot of engine metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub servers_started: u64,
    pub server_failures: u64,
    pub clients_connected: u64,
    pub clients_active: u64,
    pub clients_evicted: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub repeat_sends: u64,
    pub send_errors: u64,
    pub transient_errors: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Calculate bytes per second (received)
    pub fn bytes_received_per_sec(&self) -> f64 {
        if self.uptime.is_zero() {
            return 0.0;
        }
        self.bytes_received as f64 / self.uptime.as_secs_f64()
    }

    /// Calculate bytes per second (sent)
    pub fn bytes_sent_per_sec(&self) -> f64 {
        if self.uptime.is_zero() {
            return 0.0;
        }
        self.bytes_sent as f64 / self.uptime.as_secs_f64()
    }

    /// Calculate total error count
    pub fn total_errors(&self) -> u64 {
        self.send_errors + self.transient_errors + self.server_failures
    }
}
