//! Test sessions.
//!
//! A [`Session`] is a leased [`NodeSlot`] bound to a protocol. It forwards
//! client commands to its node, keeps track of when it was last used and
//! runs a monitor that reports idle or over-long sessions to the registry.

use grid_common::{Capabilities, GridError, GridRequest, GridResponse, NodeProxy, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::driver::Protocol;
use crate::node::NodeId;
use crate::registry::RegistryEvent;
use crate::slot::NodeSlot;

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;
const MAX_IDLE_TIMEOUT_SECS: u64 = 900;
const DEFAULT_MAX_DURATION_SECS: u64 = 1_800;
const MAX_MAX_DURATION_SECS: u64 = 10_800;

/// Bound on the node-side end-session call when no browser timeout is set.
const END_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Why the monitor expired a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    Idle,
    MaxDuration,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutReason::Idle => write!(f, "idle timeout"),
            TimeoutReason::MaxDuration => write!(f, "max duration"),
        }
    }
}

pub struct Session {
    id: String,
    slot: Arc<NodeSlot>,
    proxy: Arc<dyn NodeProxy>,
    requested: Capabilities,
    capabilities: Capabilities,
    creation_response: GridResponse,
    start_time: Instant,
    last_used: Mutex<Instant>,
    in_flight: AtomicUsize,
    idle_timeout: Duration,
    max_duration: Duration,
    monitor: CancellationToken,
    timed_out: AtomicBool,
    terminated: AtomicBool,
}

impl Session {
    /// Creates a session on an already-locked slot.
    ///
    /// # Arguments
    /// * `id` - Session id issued by the node
    /// * `slot` - The slot the session runs on
    /// * `proxy` - Proxy used for every later call to the node
    /// * `requested` - Desired capabilities of the client
    /// * `capabilities` - Capabilities the node resolved
    /// * `creation_response` - Node reply to the new-session call
    pub fn new(
        id: String,
        slot: Arc<NodeSlot>,
        proxy: Arc<dyn NodeProxy>,
        requested: Capabilities,
        capabilities: Capabilities,
        creation_response: GridResponse,
    ) -> Self {
        let idle_timeout = idle_timeout(&requested, slot.config());
        let max_duration = max_duration(&requested, slot.config());
        let now = Instant::now();

        Self {
            id,
            slot,
            proxy,
            requested,
            capabilities,
            creation_response,
            start_time: now,
            last_used: Mutex::new(now),
            in_flight: AtomicUsize::new(0),
            idle_timeout,
            max_duration,
            monitor: CancellationToken::new(),
            timed_out: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn slot(&self) -> &Arc<NodeSlot> {
        &self.slot
    }

    pub fn node_id(&self) -> &NodeId {
        self.slot.node_id()
    }

    pub fn protocol(&self) -> Protocol {
        self.slot.protocol()
    }

    pub fn requested_capabilities(&self) -> &Capabilities {
        &self.requested
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn creation_response(&self) -> &GridResponse {
        &self.creation_response
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Resets the idle clock.
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Decides whether the session has expired at `now`.
    ///
    /// Returns a reason at most once per session. A session with a command
    /// in flight never expires.
    pub fn check_timeout(&self, now: Instant) -> Option<TimeoutReason> {
        if self.in_flight.load(Ordering::Acquire) > 0 || self.is_terminated() {
            return None;
        }

        let reason = if now.saturating_duration_since(self.last_used()) >= self.idle_timeout {
            TimeoutReason::Idle
        } else if now.saturating_duration_since(self.start_time) >= self.max_duration {
            TimeoutReason::MaxDuration
        } else {
            return None;
        };

        (!self.timed_out.swap(true, Ordering::AcqRel)).then_some(reason)
    }

    /// Starts the timeout monitor.
    ///
    /// The monitor ticks every `cleanUpCycle`, sends one
    /// [`RegistryEvent::SessionTimeout`] when the session expires and then
    /// stops. It also stops when the session is terminated, when `shutdown`
    /// fires, or when the session is dropped.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        shutdown: CancellationToken,
        events: UnboundedSender<RegistryEvent>,
    ) -> JoinHandle<()> {
        let session = Arc::downgrade(self);
        let token = self.monitor.clone();
        let period = self.slot.config().clean_up_cycle();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(session) = session.upgrade() else {
                            break;
                        };
                        if let Some(reason) = session.check_timeout(Instant::now()) {
                            warn!(session = %session.id, node = %session.node_id(), %reason, "Session timed out");
                            let _ = events.send(RegistryEvent::SessionTimeout { session, reason });
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Forwards a client command to the node.
    ///
    /// The idle clock is reset before and after the call, and the session
    /// cannot expire while the call is outstanding.
    pub async fn proxy_request(&self, request: &GridRequest) -> Result<GridResponse> {
        if self.is_terminated() {
            return Err(GridError::UnknownSession(self.id.clone()));
        }

        let _in_flight = InFlight::enter(self);
        self.proxy
            .proxy(request, self.slot.node_url(), self.slot.config().browser_timeout())
            .await
    }

    /// Ends the session on its node with the protocol's own request.
    pub async fn terminate(&self) -> Result<GridResponse> {
        let request = self.protocol().driver().build_end_session_request(self);
        self.end(&request).await
    }

    /// Ends the session on its node with `request`, then releases the slot.
    ///
    /// The slot is released whatever the node answers. A second call fails
    /// with [`GridError::UnknownSession`].
    pub async fn end(&self, request: &GridRequest) -> Result<GridResponse> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Err(GridError::UnknownSession(self.id.clone()));
        }
        self.monitor.cancel();

        let _release = ReleaseSlot(self);
        let timeout = self
            .slot
            .config()
            .browser_timeout()
            .unwrap_or(END_SESSION_TIMEOUT);

        let result = self
            .proxy
            .proxy(request, self.slot.node_url(), Some(timeout))
            .await;

        match &result {
            Ok(response) => info!(
                session = %self.id,
                node = %self.node_id(),
                status = %response.status,
                "Session ended"
            ),
            Err(e) => warn!(
                session = %self.id,
                node = %self.node_id(),
                error = %e,
                "Node failed to end session, releasing slot anyway"
            ),
        }

        result
    }

    /// Releases the slot without contacting the node.
    pub fn discard(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.monitor.cancel();
        self.slot.release(&self.id);
        debug!(session = %self.id, "Session discarded");
    }

    /// JSON view served by the test-session endpoint.
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "protocol": self.protocol().as_str(),
            "requestedCapabilities": self.requested,
            "capabilities": self.capabilities,
            "inactivityTime": self.last_used().elapsed().as_millis() as u64,
            "idleTimeout": self.idle_timeout.as_secs(),
            "maxDuration": self.max_duration.as_secs(),
        })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("node", self.node_id())
            .field("protocol", &self.protocol())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

struct InFlight<'a>(&'a Session);

impl<'a> InFlight<'a> {
    fn enter(session: &'a Session) -> Self {
        session.in_flight.fetch_add(1, Ordering::AcqRel);
        session.touch();
        Self(session)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.touch();
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

struct ReleaseSlot<'a>(&'a Session);

impl Drop for ReleaseSlot<'_> {
    fn drop(&mut self) {
        self.0.slot.release(&self.0.id);
    }
}

fn seconds(capabilities: &Capabilities, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| match capabilities.get(*key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn idle_timeout(requested: &Capabilities, config: &NodeConfig) -> Duration {
    let secs = seconds(requested, &["idleTimeout", "timeout"])
        .filter(|s| *s > 0)
        .or_else(|| (config.timeout > 0).then_some(config.timeout))
        .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)
        .min(MAX_IDLE_TIMEOUT_SECS);
    Duration::from_secs(secs + config.timeout_add)
}

fn max_duration(requested: &Capabilities, config: &NodeConfig) -> Duration {
    let secs = seconds(requested, &["maxDuration"])
        .filter(|s| *s > 0)
        .or_else(|| (config.max_duration > 0).then_some(config.max_duration))
        .unwrap_or(DEFAULT_MAX_DURATION_SECS)
        .min(MAX_MAX_DURATION_SECS);
    Duration::from_secs(secs)
}
