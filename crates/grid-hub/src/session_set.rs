use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::session::Session;

/// Index of running sessions by session id.
///
/// Sessions are owned by their slots; this is a lookup table only.
#[derive(Default)]
pub struct SessionSet {
    sessions: RwLock<IndexMap<String, Arc<Session>>>,
}

impl SessionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .insert(session.id().to_string(), session)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().shift_remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_proxy, new_session_request, test_node};
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_get_remove() {
        let (_fake, proxy) = fake_proxy();
        let node = test_node(5555, json!([{"browserName": "firefox", "maxInstances": 2}]));
        let request = new_session_request(json!({}));
        let a = node.get_new_session(&request, &proxy).await.unwrap().unwrap();
        let b = node.get_new_session(&request, &proxy).await.unwrap().unwrap();

        let set = SessionSet::new();
        assert!(set.insert(a.clone()).is_none());
        assert!(set.insert(b.clone()).is_none());
        assert_eq!(set.len(), 2);
        assert!(set.contains(a.id()));
        assert!(Arc::ptr_eq(&set.get(b.id()).unwrap(), &b));

        assert!(set.remove(a.id()).is_some());
        assert!(set.remove(a.id()).is_none());
        assert!(set.get(a.id()).is_none());
        assert_eq!(set.snapshot().len(), 1);
    }
}
