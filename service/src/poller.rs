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

//! Status poller
//!
//! A reconciliation sweep over every running server: dead sockets move the
//! server to `error`, silent UDP peers are evicted and client records with no
//! transport behind them are pruned. The accept and receive loops stay the
//! primary source of state changes; the poller only repairs drift.

use crate::manager::ProtocolManager;
use crate::registry::Registry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Totals of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollReport {
    pub servers_checked: usize,
    pub servers_failed: usize,
    pub clients_pruned: usize,
    pub clients_evicted: usize,
}

impl PollReport {
    /// Check if the sweep changed any state
    pub fn changed(&self) -> bool {
        self.servers_failed > 0 || self.clients_pruned > 0 || self.clients_evicted > 0
    }
}

#[derive(Debug)]
pub struct StatusPoller {
    registry: Arc<Registry>,
    managers: Vec<Arc<dyn ProtocolManager>>,
}

impl StatusPoller {
    pub fn new(registry: Arc<Registry>, managers: Vec<Arc<dyn ProtocolManager>>) -> Self {
        Self { registry, managers }
    }

    /// Run one sweep over every running server
    pub async fn check_connection_status(&self) -> PollReport {
        let mut report = PollReport::default();
        for manager in &self.managers {
            for (id, _) in self.registry.running(manager.kind()) {
                report.servers_checked += 1;
                match manager.reconcile(id).await {
                    Ok(server) => {
                        report.servers_failed += usize::from(server.failed);
                        report.clients_pruned += server.pruned;
                        report.clients_evicted += server.evicted;
                    }
                    Err(err) => {
                        // Deleted or stopped between listing and reconciling
                        tracing::debug!(kind = %manager.kind(), server = %id, error = %err, "reconcile skipped");
                    }
                }
            }
        }
        if report.changed() {
            tracing::info!(
                checked = report.servers_checked,
                failed = report.servers_failed,
                pruned = report.clients_pruned,
                evicted = report.clients_evicted,
                "status sweep repaired state"
            );
        }
        report
    }

    /// Sweep every `interval` until `cancel` fires
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(interval_ms = interval.as_millis() as u64, "status poller started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check_connection_status().await;
                    }
                }
            }
            tracing::debug!("status poller stopped");
        })
    }
}
