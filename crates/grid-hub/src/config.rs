// Copyright 2025 Grid Hub Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hub and node configuration.
//!
//! The hub reads a [`HubConfig`] once at startup. Every registered node gets
//! an effective [`NodeConfig`]: the hub configuration overlaid with the
//! `configuration` object the node sent when registering, node values
//! winning. Durations keep the units used on the wire (milliseconds for
//! polling knobs, seconds for session knobs) and are exposed as
//! [`Duration`] through accessor methods.

use grid_common::{GridError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Hub-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubConfig {
    /// Address the HTTP server binds to
    pub host: String,
    /// Port the HTTP server binds to
    pub port: u16,
    /// Interval between node status probes (ms)
    pub node_polling: u64,
    /// Timeout of a single status probe (ms)
    pub node_status_check_timeout: u64,
    /// Consecutive missed probes before a node is flagged down
    pub down_polling_limit: u32,
    /// Time a node may stay down before it is unregistered (ms)
    pub unregister_if_still_down_after: u64,
    /// Interval of the session timeout monitor (ms)
    #[serde(rename = "cleanUpCycle")]
    pub clean_up_cycle: u64,
    /// Session idle timeout (s)
    pub timeout: u64,
    /// Grace added to the idle timeout so nodes expire sessions first (s)
    pub timeout_add: u64,
    /// Maximum session lifetime (s)
    pub max_duration: u64,
    /// Bound on a single proxied command, 0 for none (s)
    pub browser_timeout: u64,
    /// Maximum queue wait of a new session request, negative for unbounded (ms)
    pub new_session_wait_timeout: i64,
    /// Session queue retry cadence (ms)
    pub new_session_polling: u64,
    /// Reject requests no registered node could ever satisfy instead of queueing them
    pub throw_on_capability_not_present: bool,
    /// Path probed on each node to check liveness
    pub status_path: String,
    /// Cap on concurrent sessions per node, defaults to the node's slot count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_session: Option<usize>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4444,
            node_polling: 10_000,
            node_status_check_timeout: 2_000,
            down_polling_limit: 2,
            unregister_if_still_down_after: 60_000,
            clean_up_cycle: 2_000,
            timeout: 120,
            timeout_add: 10,
            max_duration: 1_800,
            browser_timeout: 0,
            new_session_wait_timeout: -1,
            new_session_polling: 100,
            throw_on_capability_not_present: true,
            status_path: "/wd/hub/status".to_string(),
            max_session: None,
        }
    }
}

impl HubConfig {
    /// Loads a JSON configuration file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GridError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| GridError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Queue wait bound, `None` when requests may wait forever.
    pub fn new_session_wait_timeout(&self) -> Option<Duration> {
        u64::try_from(self.new_session_wait_timeout)
            .ok()
            .map(Duration::from_millis)
    }

    pub fn new_session_polling(&self) -> Duration {
        Duration::from_millis(self.new_session_polling.max(1))
    }

    /// Builds a node's effective configuration.
    ///
    /// # Arguments
    /// * `overrides` - The node's `configuration` object; non-object values are ignored
    ///
    /// # Returns
    /// The hub configuration with every key present in `overrides` replaced
    pub fn node_config(&self, overrides: Option<&Value>) -> Result<NodeConfig> {
        let mut merged = serde_json::to_value(self)?;

        if let (Some(base), Some(Value::Object(node))) = (merged.as_object_mut(), overrides) {
            for (key, value) in node {
                if !value.is_null() {
                    base.insert(key.clone(), value.clone());
                }
            }
        }

        serde_json::from_value(merged)
            .map_err(|e| GridError::InvalidRegistration(format!("Invalid node configuration: {}", e)))
    }
}

/// Effective per-node configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    pub node_polling: u64,
    pub node_status_check_timeout: u64,
    pub down_polling_limit: u32,
    pub unregister_if_still_down_after: u64,
    #[serde(rename = "cleanUpCycle")]
    pub clean_up_cycle: u64,
    pub timeout: u64,
    pub timeout_add: u64,
    pub max_duration: u64,
    pub browser_timeout: u64,
    pub status_path: String,
    pub max_session: Option<usize>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let hub = HubConfig::default();
        Self {
            node_polling: hub.node_polling,
            node_status_check_timeout: hub.node_status_check_timeout,
            down_polling_limit: hub.down_polling_limit,
            unregister_if_still_down_after: hub.unregister_if_still_down_after,
            clean_up_cycle: hub.clean_up_cycle,
            timeout: hub.timeout,
            timeout_add: hub.timeout_add,
            max_duration: hub.max_duration,
            browser_timeout: hub.browser_timeout,
            status_path: hub.status_path,
            max_session: hub.max_session,
        }
    }
}

impl NodeConfig {
    pub fn node_polling(&self) -> Duration {
        Duration::from_millis(self.node_polling.max(1))
    }

    pub fn node_status_check_timeout(&self) -> Duration {
        Duration::from_millis(self.node_status_check_timeout)
    }

    pub fn unregister_if_still_down_after(&self) -> Duration {
        Duration::from_millis(self.unregister_if_still_down_after)
    }

    pub fn clean_up_cycle(&self) -> Duration {
        Duration::from_millis(self.clean_up_cycle.max(1))
    }

    /// Bound for proxied commands, `None` when unbounded.
    pub fn browser_timeout(&self) -> Option<Duration> {
        (self.browser_timeout > 0).then(|| Duration::from_secs(self.browser_timeout))
    }
}
