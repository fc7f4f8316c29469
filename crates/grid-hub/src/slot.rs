//! Node slots.
//!
//! A slot is one bookable unit of a node's capacity. It is bound to a single
//! capability profile and holds at most one [`Session`]. The lock flag is
//! taken synchronously, before any network call, so two concurrent requests
//! can never lease the same slot.

use grid_common::protocol::capabilities::BROWSER_NAME;
use grid_common::{Capabilities, NodeProxy, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::config::NodeConfig;
use crate::driver::{legacy_browser_name, NewSessionRequest, Protocol};
use crate::matcher::matches;
use crate::node::NodeId;
use crate::session::Session;

pub struct NodeSlot {
    id: String,
    node_id: NodeId,
    node_url: Url,
    capabilities: Capabilities,
    protocol: Protocol,
    config: Arc<NodeConfig>,
    locked: AtomicBool,
    session: Mutex<Option<Arc<Session>>>,
}

impl NodeSlot {
    /// Creates a slot for one instance of a capability profile.
    ///
    /// # Arguments
    /// * `node_id` - Owning node
    /// * `node_url` - Base URL requests are forwarded to
    /// * `profile` - Normalized capability profile
    /// * `index` - Position of the slot within its node
    /// * `config` - Effective configuration of the owning node
    pub fn new(
        node_id: NodeId,
        node_url: Url,
        mut profile: Capabilities,
        index: usize,
        config: Arc<NodeConfig>,
    ) -> Self {
        let protocol = Protocol::from_capabilities(&profile);

        if protocol == Protocol::Selenium {
            if let Some(Value::String(browser)) = profile.get(BROWSER_NAME) {
                let stripped = legacy_browser_name(browser).to_string();
                profile.insert(BROWSER_NAME.to_string(), Value::String(stripped));
            }
        }

        let mut hasher = DefaultHasher::new();
        node_id.as_str().hash(&mut hasher);
        Value::Object(profile.clone()).to_string().hash(&mut hasher);
        index.hash(&mut hasher);

        Self {
            id: format!("{:016x}", hasher.finish()),
            node_id,
            node_url,
            capabilities: profile,
            protocol,
            config,
            locked: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn node_url(&self) -> &Url {
        &self.node_url
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    /// Takes the lock if it is free.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Takes the lock.
    ///
    /// # Panics
    /// If the slot is already locked.
    pub fn lock(&self) {
        if !self.try_lock() {
            panic!("slot {} on node {} is already locked", self.id, self.node_id);
        }
    }

    /// Releases the lock.
    ///
    /// # Panics
    /// If the slot is not locked.
    pub fn unlock(&self) {
        if self
            .locked
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("slot {} on node {} is not locked", self.id, self.node_id);
        }
    }

    /// Tries to create a session on this slot.
    ///
    /// # Returns
    /// - `Ok(Some(session))` - The node created a session and the slot now holds it
    /// - `Ok(None)` - The slot is busy, or does not serve the request
    /// - `Err(e)` - The node failed to create a session; the slot is free again
    pub async fn get_new_session(
        self: &Arc<Self>,
        request: &NewSessionRequest,
        proxy: &Arc<dyn NodeProxy>,
    ) -> Result<Option<Arc<Session>>> {
        if request.protocol != self.protocol || !matches(&request.desired, &self.capabilities) {
            return Ok(None);
        }
        if !self.try_lock() {
            return Ok(None);
        }

        // Unlocks on every exit below, including the caller dropping this future
        let lease = Lease::new(self);

        debug!(request_id = %request.id, slot = %self.id, node = %self.node_id, "Creating session");
        let created = self
            .protocol
            .driver()
            .proxy_to_node(
                proxy.as_ref(),
                &request.request,
                &self.node_url,
                self.config.browser_timeout(),
            )
            .await?;

        let capabilities = if created.capabilities.is_empty() {
            self.capabilities.clone()
        } else {
            created.capabilities
        };

        let session = Arc::new(Session::new(
            created.session_id,
            self.clone(),
            proxy.clone(),
            request.desired.clone(),
            capabilities,
            created.response,
        ));
        *self.session.lock() = Some(session.clone());
        lease.keep();

        info!(
            request_id = %request.id,
            session = %session.id(),
            node = %self.node_id,
            "Session created"
        );
        Ok(Some(session))
    }

    /// Clears the session and unlocks the slot.
    ///
    /// Returns false, and changes nothing, when `session_id` is not the
    /// session this slot holds.
    pub fn release(&self, session_id: &str) -> bool {
        let mut current = self.session.lock();
        match current.as_ref() {
            Some(session) if session.id() == session_id => {
                *current = None;
                self.unlock();
                true
            }
            _ => false,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "protocol": self.protocol.as_str(),
            "capabilities": self.capabilities,
            "session": self.session().map(|s| s.id().to_string()),
        })
    }
}

impl fmt::Debug for NodeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSlot")
            .field("id", &self.id)
            .field("node", &self.node_id)
            .field("protocol", &self.protocol)
            .field("locked", &self.is_locked())
            .finish()
    }
}

struct Lease<'a> {
    slot: &'a NodeSlot,
    armed: bool,
}

impl<'a> Lease<'a> {
    fn new(slot: &'a NodeSlot) -> Self {
        Self { slot, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slot.unlock();
        }
    }
}
