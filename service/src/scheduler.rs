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

//! Repeat-send scheduler
//!
//! One job per `(server, client)` pair. Each job owns an interval timer and
//! awaits every send before waiting for the next tick, so a client never has
//! more than one repeated send in flight; ticks missed while a send is slow
//! are skipped rather than bunched up.

use crate::config::MIN_REPEAT_INTERVAL;
use crate::events::{EngineEvent, EventBus};
use crate::manager::ProtocolManager;
use crate::metrics::EngineMetrics;
use crate::types::{ClientId, ServerKey};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

type JobKey = (ServerKey, ClientId);

#[derive(Debug)]
struct RepeatJob {
    job_id: u64,
    cancel: CancellationToken,
}

/// Owner of every repeat-send job
#[derive(Debug)]
pub struct RepeatScheduler {
    jobs: Arc<DashMap<JobKey, RepeatJob>>,
    next_job_id: AtomicU64,
    events: EventBus,
    metrics: Arc<EngineMetrics>,
}

impl RepeatScheduler {
    pub fn new(events: EventBus, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            next_job_id: AtomicU64::new(1),
            events,
            metrics,
        }
    }

    /// Send `payload` to the client every `period`, replacing any existing job
    ///
    /// The first send happens one full period after scheduling. The job stops
    /// when `parent` is cancelled, when [`cancel`](Self::cancel) is called, or
    /// when a send reports that the client or server is gone. Other send
    /// failures are reported and the schedule continues.
    pub fn schedule(
        &self,
        sender: Arc<dyn ProtocolManager>,
        key: ServerKey,
        client: ClientId,
        payload: Bytes,
        period: Duration,
        parent: &CancellationToken,
    ) {
        let period = period.max(MIN_REPEAT_INTERVAL);
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();
        if let Some(previous) = self.jobs.insert(
            (key, client),
            RepeatJob {
                job_id,
                cancel: cancel.clone(),
            },
        ) {
            previous.cancel.cancel();
        }
        tracing::debug!(server = %key, client = %client, period_ms = period.as_millis() as u64, "repeat-send scheduled");

        let jobs = self.jobs.clone();
        let events = self.events.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match sender.send_message(key.id, client, payload.clone()).await {
                    Ok(_) => metrics.repeat_send(),
                    Err(err) if err.cancels_repeat() => {
                        tracing::debug!(server = %key, client = %client, error = %err, "repeat-send ended");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(server = %key, client = %client, error = %err, "repeat-send failed");
                        events.emit(EngineEvent::SendFailed {
                            kind: key.kind,
                            server_id: key.id,
                            client_id: client,
                            message: err.to_string(),
                        });
                    }
                }
            }
            jobs.remove_if(&(key, client), |_, job| job.job_id == job_id);
        });
    }

    /// Cancel the client's job, if any
    pub fn cancel(&self, key: ServerKey, client: ClientId) -> bool {
        match self.jobs.remove(&(key, client)) {
            Some((_, job)) => {
                job.cancel.cancel();
                tracing::debug!(server = %key, client = %client, "repeat-send cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every job of one server
    pub fn cancel_server(&self, key: ServerKey) -> usize {
        let mut cancelled = 0;
        self.jobs.retain(|(server, _), job| {
            if *server == key {
                job.cancel.cancel();
                cancelled += 1;
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Check if the client has a live job
    pub fn is_scheduled(&self, key: ServerKey, client: ClientId) -> bool {
        self.jobs.contains_key(&(key, client))
    }

    /// Number of live jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
