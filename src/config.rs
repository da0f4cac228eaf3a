/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::time::Duration;

/// Runtime configuration shared by every reconciler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Upper bound of concurrent reconciles per controller.
    pub max_concurrent_reconciles: u16,
    /// How long a game server waits for its network to reach the desired
    /// state before giving up and reporting a timeout.
    pub network_total_wait_time: Duration,
    /// How often a game server waiting on its network is re-checked.
    pub network_probe_interval: Duration,
}

impl Config {
    pub const DEFAULT_MAX_CONCURRENT_RECONCILES: u16 = 10;
    pub const DEFAULT_NETWORK_TOTAL_WAIT_TIME: Duration = Duration::from_secs(60);
    pub const DEFAULT_NETWORK_PROBE_INTERVAL: Duration = Duration::from_secs(5);
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: Self::DEFAULT_MAX_CONCURRENT_RECONCILES,
            network_total_wait_time: Self::DEFAULT_NETWORK_TOTAL_WAIT_TIME,
            network_probe_interval: Self::DEFAULT_NETWORK_PROBE_INTERVAL,
        }
    }
}
