use grid_common::{GridError, GridRequest, GridResponse, NodeProxy, Result};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::driver::{NewSessionRequest, ProtocolDriver};
use crate::health_checker::HealthMonitor;
use crate::node::{HealthEvent, Node, NodeId};
use crate::node_set::NodeSet;
use crate::session::{Session, TimeoutReason};
use crate::session_queue::SessionQueue;
use crate::session_set::SessionSet;

/// Notification sent to the registry by node and session monitors.
#[derive(Debug)]
pub enum RegistryEvent {
    NodeHealth {
        node: Arc<Node>,
        event: HealthEvent,
    },
    SessionTimeout {
        session: Arc<Session>,
        reason: TimeoutReason,
    },
}

/// Grid hub registry - the façade the HTTP layer talks to.
///
/// The registry owns the registered nodes, the index of running sessions and
/// the new-session queue. It is the only place nodes are added or removed
/// and the only consumer of [`RegistryEvent`]s.
///
/// # Lifecycle
///
/// - **Registration**: each node gets a [`HealthMonitor`]; re-registering a
///   known id retires the stale node first
/// - **Session requests**: fast-fail when nothing could ever match, else wait
///   in the [`SessionQueue`]
/// - **Events**: broken nodes are unregistered, expired sessions terminated
/// - **Shutdown**: one root token stops every monitor and the queue
pub struct Registry {
    config: HubConfig,
    proxy: Arc<dyn NodeProxy>,
    nodes: Arc<NodeSet>,
    sessions: SessionSet,
    queue: SessionQueue,
    events: UnboundedSender<RegistryEvent>,
    shutdown: CancellationToken,
}

impl Registry {
    /// Creates a registry and starts its event loop.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Arguments
    /// * `config` - Hub configuration
    /// * `proxy` - Proxy used for every call to a node
    pub fn new(config: HubConfig, proxy: Arc<dyn NodeProxy>) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let nodes = Arc::new(NodeSet::new(proxy.clone()));
        let queue = SessionQueue::new(
            nodes.clone(),
            config.new_session_polling(),
            config.new_session_wait_timeout(),
            shutdown.child_token(),
        );
        let (events, receiver) = mpsc::unbounded_channel();

        let registry = Arc::new(Self {
            config,
            proxy,
            nodes,
            sessions: SessionSet::new(),
            queue,
            events,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(run_events(Arc::downgrade(&registry), receiver, shutdown));
        info!("Registry initialized");
        registry
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    pub fn sessions(&self) -> &SessionSet {
        &self.sessions
    }

    pub fn queue(&self) -> &SessionQueue {
        &self.queue
    }

    pub fn node(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes.get(id)
    }

    /// Registers a node from its registration payload.
    ///
    /// A node already registered under the same id is replaced: its monitor
    /// is stopped and its sessions are dropped.
    ///
    /// # Returns
    /// The registered node, or [`GridError::InvalidRegistration`]
    pub fn register_node(&self, registration: &Value) -> Result<Arc<Node>> {
        let node = Arc::new(Node::from_registration(registration, &self.config)?);

        if let Some(stale) = self.nodes.insert(node.clone()) {
            info!(node = %node.id(), "Node registered again, replacing stale entry");
            self.retire_node(&stale);
        }

        HealthMonitor::new(node.clone(), self.proxy.clone(), self.events.clone())
            .spawn(self.shutdown.clone());

        info!(
            node = %node.id(),
            url = %node.url(),
            slots = node.total_slots(),
            "Node registered"
        );
        Ok(node)
    }

    /// Unregisters a node. Unknown ids are ignored.
    pub fn unregister_node(&self, id: &NodeId) -> Option<Arc<Node>> {
        let node = self.nodes.remove(id)?;
        self.retire_node(&node);
        info!(node = %id, "Node unregistered");
        Some(node)
    }

    fn retire_node(&self, node: &Arc<Node>) {
        node.stop_monitor();
        for session in node.sessions() {
            self.sessions.remove(session.id());
            session.discard();
        }
    }

    /// Acquires a session for a new-session request.
    ///
    /// # Arguments
    /// * `driver` - Driver of the protocol the request arrived on
    /// * `request` - The client's new-session request
    ///
    /// # Returns
    /// - `Ok(session)` - A node created the session
    /// - `Err(GridError::CapabilityNotPresent)` - No registered node could ever serve it
    /// - `Err(GridError::NewSessionTimeout)` - Waited longer than `newSessionWaitTimeout`
    pub async fn get_new_session(
        &self,
        driver: &dyn ProtocolDriver,
        request: GridRequest,
    ) -> Result<Arc<Session>> {
        let request = NewSessionRequest::from_request(driver, request)?;
        let desired = Value::Object(request.desired.clone());

        if self.config.throw_on_capability_not_present && !self.nodes.has_capability(&request) {
            warn!(request_id = %request.id, %desired, "No registered node matches request");
            return Err(GridError::CapabilityNotPresent(desired.to_string()));
        }

        info!(request_id = %request.id, %desired, "New session requested");
        let session = self.queue.add_request(request).wait().await?;

        self.sessions.insert(session.clone());
        session.spawn_monitor(self.shutdown.clone(), self.events.clone());
        Ok(session)
    }

    /// Looks up a running session.
    pub fn get_session(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .get(id)
            .ok_or_else(|| GridError::UnknownSession(id.to_string()))
    }

    /// Forwards a command to the node running the addressed session.
    pub async fn proxy_command(
        &self,
        driver: &dyn ProtocolDriver,
        request: &GridRequest,
    ) -> Result<GridResponse> {
        let id = session_id(driver, request)?;
        let session = self.get_session(&id)?;
        session.proxy_request(request).await
    }

    /// Ends the addressed session with the client's own end-session request.
    pub async fn end_session(
        &self,
        driver: &dyn ProtocolDriver,
        request: &GridRequest,
    ) -> Result<GridResponse> {
        let id = session_id(driver, request)?;
        let session = self.get_session(&id)?;
        let result = session.end(request).await;
        self.sessions.remove(&id);
        result
    }

    /// Terminates a session and drops it from the index, whatever the node answers.
    pub async fn terminate_session(&self, session: &Arc<Session>) -> Result<GridResponse> {
        let result = session.terminate().await;
        self.sessions.remove(session.id());
        result
    }

    pub async fn terminate_session_by_id(&self, id: &str) -> Result<GridResponse> {
        let session = self.get_session(id)?;
        self.terminate_session(&session).await
    }

    async fn handle_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::NodeHealth {
                node,
                event: HealthEvent::Broken,
            } => {
                if self.nodes.remove_if_current(&node) {
                    self.retire_node(&node);
                    warn!(node = %node.id(), "Broken node unregistered");
                }
            }
            RegistryEvent::NodeHealth { node, event } => {
                debug!(node = %node.id(), ?event, "Node health changed");
            }
            RegistryEvent::SessionTimeout { session, reason } => {
                info!(session = %session.id(), %reason, "Terminating expired session");
                let _ = self.terminate_session(&session).await;
            }
        }
    }

    /// `(free, total)` slot counts across all nodes.
    pub fn slot_counts(&self) -> (usize, usize) {
        self.nodes.slot_counts()
    }

    /// Number of requests waiting in the queue.
    pub fn pending_requests(&self) -> usize {
        self.queue.len()
    }

    /// Hub status served by `/grid/api/hub`.
    pub fn hub_status(&self) -> Value {
        let (free, total) = self.slot_counts();
        json!({
            "success": true,
            "slotCounts": {"free": free, "total": total},
            "nodes": self.nodes.snapshot().iter().map(|node| node.to_json()).collect::<Vec<_>>(),
            "sessionCount": self.sessions.len(),
            "newSessionRequestCount": self.pending_requests(),
            "newSessionRequests": self.queue.pending_capabilities(),
            "configuration": serde_json::to_value(&self.config).unwrap_or(Value::Null),
        })
    }

    /// Registration status served by `/grid/api/proxy`.
    pub fn proxy_status(&self, id: &NodeId) -> Value {
        match self.nodes.get(id) {
            Some(node) => json!({
                "success": true,
                "msg": "proxy found",
                "id": node.id().as_str(),
                "request": node.registration(),
            }),
            None => json!({
                "success": false,
                "msg": format!("Cannot find proxy with ID = {} in the registry", id),
            }),
        }
    }

    /// Session details served by `/grid/api/testsession`.
    pub fn test_session(&self, id: &str) -> Result<Value> {
        let session = self.get_session(id)?;
        Ok(json!({
            "success": true,
            "session": session.to_json(),
            "proxyId": session.slot().node_url().as_str().trim_end_matches('/'),
        }))
    }

    /// Stops every monitor and fails every queued request.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        for node in self.nodes.snapshot() {
            node.stop_monitor();
        }
        info!("Registry shut down");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn session_id(driver: &dyn ProtocolDriver, request: &GridRequest) -> Result<String> {
    driver
        .get_session_id(request)
        .ok_or_else(|| GridError::InvalidRequest("request does not address a session".to_string()))
}

/// Dispatches monitor events, one task per event.
async fn run_events(
    registry: Weak<Registry>,
    mut events: UnboundedReceiver<RegistryEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        let Some(registry) = registry.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            registry.handle_event(event).await;
        });
    }
    debug!("Registry event loop stopped");
}
