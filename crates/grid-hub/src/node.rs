//! Registered nodes.
//!
//! A [`Node`] is a worker machine that registered itself with the hub. It
//! owns one [`NodeSlot`] per instance of each capability profile it
//! declared, and carries the health state driven by its
//! [`HealthMonitor`](crate::health_checker::HealthMonitor).
//!
//! # Health state machine
//!
//! ```text
//! alive --miss x downPollingLimit--> down --still down after unregisterIfStillDownAfter--> broken
//!   ^                                  |
//!   +------------- successful probe ---+
//! ```
//!
//! Transitions are returned from [`Node::record_probe`] as [`HealthEvent`]s;
//! the node itself never acts on them.

use grid_common::protocol::capabilities::MAX_INSTANCES;
use grid_common::{normalize_capabilities, Capabilities, GridError, NodeProxy, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{HubConfig, NodeConfig};
use crate::driver::NewSessionRequest;
use crate::session::Session;
use crate::slot::NodeSlot;

/// Node identity, `host:port` unless the node registered an explicit id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    /// Normalizes `http://host:port/`, `host:port/wd/hub` and `host:port` to `host:port`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let without_scheme = trimmed
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(trimmed);
        let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
        NodeId(authority.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a health probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckStatus {
    Healthy,
    Unhealthy(String),
}

/// Health transition reported to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    /// `downPollingLimit` consecutive probes missed
    Down,
    /// Still down after `unregisterIfStillDownAfter`; reported once
    Broken,
    /// A down node answered again
    Up,
}

#[derive(Debug, Default)]
struct HealthState {
    down_polling_counter: u32,
    down_since: Option<Instant>,
    down: bool,
    broken_reported: bool,
    last_check: Option<Instant>,
    last_status: Option<HealthCheckStatus>,
}

pub struct Node {
    id: NodeId,
    url: Url,
    registration: Value,
    config: Arc<NodeConfig>,
    capabilities: Vec<Capabilities>,
    slots: Vec<Arc<NodeSlot>>,
    max_session: usize,
    health: Mutex<HealthState>,
    monitor: CancellationToken,
}

impl Node {
    /// Builds a node from a registration payload.
    ///
    /// # Arguments
    /// * `registration` - `{capabilities: [...], configuration: {...}}`
    /// * `hub` - Hub configuration the node's own configuration is overlaid on
    ///
    /// # Returns
    /// The node, or [`GridError::InvalidRegistration`] when the payload has
    /// no capabilities or no resolvable host and port
    pub fn from_registration(registration: &Value, hub: &HubConfig) -> Result<Self> {
        let declared = registration
            .get("capabilities")
            .and_then(Value::as_array)
            .filter(|caps| !caps.is_empty())
            .ok_or_else(|| {
                GridError::InvalidRegistration("capabilities must be a non-empty array".to_string())
            })?;

        let capabilities = declared
            .iter()
            .map(|raw| {
                raw.is_object().then(|| normalize_capabilities(raw)).ok_or_else(|| {
                    GridError::InvalidRegistration(format!("capability {} is not an object", raw))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let configuration = registration.get("configuration");
        let config = Arc::new(hub.node_config(configuration)?);
        let url = resolve_url(configuration)?;

        let id = configuration
            .and_then(|c| c.get("id"))
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .map(NodeId::parse)
            .unwrap_or_else(|| NodeId::parse(url.as_str()));

        let mut slots = Vec::new();
        for profile in &capabilities {
            for _ in 0..instances(profile) {
                slots.push(Arc::new(NodeSlot::new(
                    id.clone(),
                    url.clone(),
                    profile.clone(),
                    slots.len(),
                    config.clone(),
                )));
            }
        }

        let max_session = config.max_session.unwrap_or(slots.len());

        Ok(Self {
            id,
            url,
            registration: registration.clone(),
            config,
            capabilities,
            slots,
            max_session,
            health: Mutex::new(HealthState::default()),
            monitor: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn registration(&self) -> &Value {
        &self.registration
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &[Capabilities] {
        &self.capabilities
    }

    pub fn slots(&self) -> &[Arc<NodeSlot>] {
        &self.slots
    }

    pub fn max_session(&self) -> usize {
        self.max_session
    }

    pub fn total_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn used_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_locked()).count()
    }

    pub fn free_slots(&self) -> usize {
        self.total_slots() - self.used_slots()
    }

    /// Sessions currently running on this node.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.slots.iter().filter_map(|slot| slot.session()).collect()
    }

    pub fn is_down(&self) -> bool {
        self.health.lock().down
    }

    pub fn last_health_status(&self) -> Option<HealthCheckStatus> {
        self.health.lock().last_status.clone()
    }

    /// Token stopping this node's health monitor.
    pub fn monitor_token(&self) -> CancellationToken {
        self.monitor.clone()
    }

    pub fn stop_monitor(&self) {
        self.monitor.cancel();
    }

    /// Tries each slot in order and returns the first session created.
    ///
    /// Returns `Ok(None)` without trying any slot when the node is down or
    /// already runs `maxSession` sessions.
    pub async fn get_new_session(
        &self,
        request: &NewSessionRequest,
        proxy: &Arc<dyn NodeProxy>,
    ) -> Result<Option<Arc<Session>>> {
        if self.is_down() || self.used_slots() >= self.max_session {
            return Ok(None);
        }

        for slot in &self.slots {
            if let Some(session) = slot.get_new_session(request, proxy).await? {
                return Ok(Some(session));
            }
        }

        Ok(None)
    }

    /// Feeds one probe result into the health state machine.
    ///
    /// # Arguments
    /// * `status` - Outcome of the probe
    /// * `now` - When the probe completed
    ///
    /// # Returns
    /// The transition the probe caused, if any
    pub fn record_probe(&self, status: HealthCheckStatus, now: Instant) -> Option<HealthEvent> {
        let mut health = self.health.lock();
        health.last_check = Some(now);

        match status {
            HealthCheckStatus::Healthy => {
                let was_down = health.down;
                health.down_polling_counter = 0;
                health.down = false;
                health.down_since = None;
                health.broken_reported = false;
                health.last_status = Some(HealthCheckStatus::Healthy);
                was_down.then_some(HealthEvent::Up)
            }
            HealthCheckStatus::Unhealthy(reason) => {
                health.down_polling_counter = health.down_polling_counter.saturating_add(1);
                health.last_status = Some(HealthCheckStatus::Unhealthy(reason));

                if !health.down {
                    if health.down_polling_counter >= self.config.down_polling_limit {
                        health.down = true;
                        health.down_since = Some(now);
                        return Some(HealthEvent::Down);
                    }
                    return None;
                }

                let down_for = health
                    .down_since
                    .map(|since| now.saturating_duration_since(since))
                    .unwrap_or_default();
                if !health.broken_reported && down_for >= self.config.unregister_if_still_down_after() {
                    health.broken_reported = true;
                    return Some(HealthEvent::Broken);
                }
                None
            }
        }
    }

    pub fn to_json(&self) -> Value {
        let health = self.health.lock();
        let last_status = match &health.last_status {
            Some(HealthCheckStatus::Healthy) => json!("healthy"),
            Some(HealthCheckStatus::Unhealthy(reason)) => json!(reason),
            None => Value::Null,
        };

        json!({
            "id": self.id.as_str(),
            "url": self.url.as_str(),
            "down": health.down,
            "downPollingCounter": health.down_polling_counter,
            "lastHealthCheck": last_status,
            "maxSession": self.max_session,
            "slotCounts": {
                "free": self.free_slots(),
                "total": self.total_slots(),
            },
            "slots": self.slots.iter().map(|slot| slot.to_json()).collect::<Vec<_>>(),
        })
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("slots", &self.slots.len())
            .field("down", &self.is_down())
            .finish()
    }
}

fn instances(profile: &Capabilities) -> usize {
    match profile.get(MAX_INSTANCES) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|n| *n > 0)
    .map(|n| n as usize)
    .unwrap_or(1)
}

/// Node base URL from `host`+`port`, `remoteHost` or `url`, in that order.
fn resolve_url(configuration: Option<&Value>) -> Result<Url> {
    let field = |key: &str| configuration.and_then(|c| c.get(key)).filter(|v| !v.is_null());

    if let (Some(host), Some(port)) = (field("host"), field("port")) {
        let host = host
            .as_str()
            .ok_or_else(|| GridError::InvalidRegistration("host must be a string".to_string()))?;
        let port = match port {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| GridError::InvalidRegistration(format!("invalid port {}", port)))?;
        return base_url(&Url::parse(&format!("http://{}:{}", host, port))?);
    }

    let remote = field("remoteHost")
        .or_else(|| field("url"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            GridError::InvalidRegistration(
                "configuration needs host and port, remoteHost or url".to_string(),
            )
        })?;
    base_url(&Url::parse(remote)?)
}

fn base_url(url: &Url) -> Result<Url> {
    let host = url
        .host_str()
        .ok_or_else(|| GridError::InvalidRegistration(format!("{} has no host", url)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| GridError::InvalidRegistration(format!("{} has no port", url)))?;
    Ok(Url::parse(&format!("{}://{}:{}", url.scheme(), host, port))?)
}
