// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Stream and buffer configuration

use crate::state::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Delay before each reconnect attempt
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Reconnect attempts before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// TCP connect timeout for registration and stream requests
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    6
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            max_retries: default_max_retries(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl StreamConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(self.retry_delay_ms), self.max_retries)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Burst protection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Burst window length
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Events per window written individually before batching starts
    #[serde(default = "default_threshold")]
    pub threshold: usize,
}

fn default_window_ms() -> u64 {
    50
}

fn default_threshold() -> usize {
    50
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            threshold: default_threshold(),
        }
    }
}

impl BufferConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}
