use grid_common::{NodeProxy, Result};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

use crate::driver::NewSessionRequest;
use crate::matcher::find_first_match;
use crate::node::{Node, NodeId};
use crate::session::Session;

/// Registered nodes, in registration order.
pub struct NodeSet {
    nodes: RwLock<IndexMap<NodeId, Arc<Node>>>,
    proxy: Arc<dyn NodeProxy>,
}

impl NodeSet {
    pub fn new(proxy: Arc<dyn NodeProxy>) -> Self {
        Self {
            nodes: RwLock::new(IndexMap::new()),
            proxy,
        }
    }

    /// Adds `node`, returning the node it replaced if the id was known.
    ///
    /// A replaced node keeps its position, so first-fit order is stable
    /// across re-registration.
    pub fn insert(&self, node: Arc<Node>) -> Option<Arc<Node>> {
        self.nodes.write().insert(node.id().clone(), node)
    }

    pub fn remove(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes.write().shift_remove(id)
    }

    /// Removes `node` only if it is still the registered entry for its id.
    pub fn remove_if_current(&self, node: &Arc<Node>) -> bool {
        let mut nodes = self.nodes.write();
        let is_current = nodes
            .get(node.id())
            .map(|current| Arc::ptr_eq(current, node))
            .unwrap_or(false);
        if is_current {
            nodes.shift_remove(node.id());
        }
        is_current
    }

    pub fn get(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes.read().get(id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Current nodes in registration order. The lock is released on return.
    pub fn snapshot(&self) -> Vec<Arc<Node>> {
        self.nodes.read().values().cloned().collect()
    }

    /// Tries every node in registration order and returns the first session created.
    ///
    /// A node failing to create a session does not stop the scan. The last
    /// such error is returned only when no other node produced a session.
    pub async fn get_new_session(&self, request: &NewSessionRequest) -> Result<Option<Arc<Session>>> {
        let mut last_error = None;

        for node in self.snapshot() {
            match node.get_new_session(request, &self.proxy).await {
                Ok(Some(session)) => return Ok(Some(session)),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        request_id = %request.id,
                        node = %node.id(),
                        error = %e,
                        "Node failed to create session"
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Whether any registered slot could ever serve the request.
    pub fn has_capability(&self, request: &NewSessionRequest) -> bool {
        find_first_match(&request.desired, request.protocol, &self.snapshot()).is_some()
    }

    /// `(free, total)` slot counts across all nodes.
    pub fn slot_counts(&self) -> (usize, usize) {
        self.snapshot().iter().fold((0, 0), |(free, total), node| {
            (free + node.free_slots(), total + node.total_slots())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_proxy, new_session_request, test_node};
    use grid_common::GridError;
    use serde_json::json;

    #[test]
    fn test_insert_replace_remove() {
        let (_fake, proxy) = fake_proxy();
        let set = NodeSet::new(proxy);
        let first = test_node(5555, json!([{"browserName": "firefox"}]));
        let other = test_node(5556, json!([{"browserName": "chrome"}]));
        let again = test_node(5555, json!([{"browserName": "firefox"}]));

        assert!(set.insert(first.clone()).is_none());
        assert!(set.insert(other.clone()).is_none());
        let replaced = set.insert(again.clone()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(set.len(), 2);

        let ids: Vec<_> = set.snapshot().iter().map(|n| n.id().to_string()).collect();
        assert_eq!(ids, ["10.0.0.1:5555", "10.0.0.1:5556"]);

        assert!(!set.remove_if_current(&first));
        assert!(set.contains(first.id()));
        assert!(set.remove_if_current(&again));
        assert!(!set.contains(first.id()));
        assert!(set.remove(other.id()).is_some());
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_get_new_session_skips_failing_node() {
        let (fake, proxy) = fake_proxy();
        let set = NodeSet::new(proxy);
        set.insert(test_node(5555, json!([{"browserName": "firefox"}])));
        set.insert(test_node(5556, json!([{"browserName": "firefox"}])));
        fake.set_node_down("10.0.0.1:5555", true);

        let request = new_session_request(json!({"browserName": "firefox"}));
        let session = set.get_new_session(&request).await.unwrap().unwrap();
        assert_eq!(session.node_id().as_str(), "10.0.0.1:5556");
        assert_eq!(set.slot_counts(), (1, 2));
    }

    #[tokio::test]
    async fn test_get_new_session_reports_error_when_nothing_succeeds() {
        let (fake, proxy) = fake_proxy();
        let set = NodeSet::new(proxy);
        set.insert(test_node(5555, json!([{"browserName": "firefox"}])));
        fake.set_fail_new(true);

        let request = new_session_request(json!({"browserName": "firefox"}));
        assert!(matches!(
            set.get_new_session(&request).await,
            Err(GridError::NodeCommunication(_))
        ));
        assert_eq!(set.slot_counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_has_capability_ignores_lock_state() {
        let (_fake, proxy) = fake_proxy();
        let set = NodeSet::new(proxy);
        set.insert(test_node(5555, json!([{"browserName": "firefox"}])));

        let firefox = new_session_request(json!({"browserName": "firefox"}));
        let chrome = new_session_request(json!({"browserName": "chrome"}));
        let _session = set.get_new_session(&firefox).await.unwrap().unwrap();

        assert!(set.has_capability(&firefox));
        assert!(!set.has_capability(&chrome));
        assert!(set.get_new_session(&firefox).await.unwrap().is_none());
    }
}
