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

//! Engine configuration
//!
//! # Example
//!
//! ```
//! use connectivity_service::EngineConfig;
//! use std::time::Duration;
//!
//! let config = EngineConfig::default()
//!     .with_idle_timeout(Duration::from_secs(30))
//!     .with_poll_interval(Duration::from_secs(2))
//!     .with_max_log_entries(512);
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

/// Smallest accepted repeat-send interval
pub const MIN_REPEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Engine configuration
///
/// All timeouts apply per operation; no setting here is global to every
/// server at once.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// UDP peers silent for longer than this are evicted by the status poller
    pub idle_timeout: Duration,

    /// Interval of the background status poller
    pub poll_interval: Duration,

    /// Upper bound on a single send, including waiting for the client's write lock
    pub write_timeout: Duration,

    /// How long `stop` waits for accept/receive loops and client tasks to finish
    pub shutdown_timeout: Duration,

    /// Message log entries kept per client before the oldest is evicted
    pub max_log_entries: usize,

    /// Receive buffer for one UDP datagram
    pub udp_buffer_size: usize,

    /// First delay after a transient accept/receive error
    pub retry_initial_interval: Duration,

    /// Largest delay between accept/receive retries
    pub retry_max_interval: Duration,

    /// Total time a loop keeps retrying consecutive failures before the
    /// server is moved to `error`
    pub retry_max_elapsed: Duration,

    /// Capacity of the engine event channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            max_log_entries: 256,
            udp_buffer_size: 65_535,
            retry_initial_interval: Duration::from_millis(50),
            retry_max_interval: Duration::from_secs(2),
            retry_max_elapsed: Duration::from_secs(10),
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the UDP idle eviction timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the status poller interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-send write timeout
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the stop/shutdown wait timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the per-client message log capacity
    pub fn with_max_log_entries(mut self, entries: usize) -> Self {
        self.max_log_entries = entries;
        self
    }

    /// Set the UDP receive buffer size
    pub fn with_udp_buffer_size(mut self, size: usize) -> Self {
        self.udp_buffer_size = size;
        self
    }

    /// Set the retry backoff for accept/receive loops
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration, elapsed: Duration) -> Self {
        self.retry_initial_interval = initial;
        self.retry_max_interval = max;
        self.retry_max_elapsed = elapsed;
        self
    }

    /// Set the event channel capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate the configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.idle_timeout.is_zero() {
            return Err("idle_timeout must be greater than 0".to_string());
        }

        if self.poll_interval.is_zero() {
            return Err("poll_interval must be greater than 0".to_string());
        }

        if self.write_timeout.is_zero() {
            return Err("write_timeout must be greater than 0".to_string());
        }

        if self.shutdown_timeout.is_zero() {
            return Err("shutdown_timeout must be greater than 0".to_string());
        }

        if self.max_log_entries == 0 {
            return Err("max_log_entries must be greater than 0".to_string());
        }

        if self.udp_buffer_size == 0 || self.udp_buffer_size > 65_535 {
            return Err("udp_buffer_size must be between 1 and 65535".to_string());
        }

        if self.retry_initial_interval.is_zero()
            || self.retry_max_interval < self.retry_initial_interval
        {
            return Err("retry intervals must be non-zero and max >= initial".to_string());
        }

        if self.event_capacity == 0 {
            return Err("event_capacity must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Build the exponential backoff used by accept and receive loops
    pub(crate) fn retry_backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            initial_interval: self.retry_initial_interval,
            current_interval: self.retry_initial_interval,
            max_interval: self.retry_max_interval,
            max_elapsed_time: Some(self.retry_max_elapsed),
            ..Default::default()
        }
    }
}
