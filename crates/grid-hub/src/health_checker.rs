use grid_common::{GridError, GridRequest, NodeProxy, Result};
use hyper::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::node::{HealthCheckStatus, HealthEvent, Node};
use crate::registry::RegistryEvent;

/// Periodic status probe of a single node.
pub struct HealthMonitor {
    node: Arc<Node>,
    proxy: Arc<dyn NodeProxy>,
    events: UnboundedSender<RegistryEvent>,
}

impl HealthMonitor {
    /// Creates a health monitor.
    ///
    /// # Arguments
    /// * `node` - The node to probe
    /// * `proxy` - Proxy used for the status requests
    /// * `events` - Channel health transitions are reported on
    pub fn new(
        node: Arc<Node>,
        proxy: Arc<dyn NodeProxy>,
        events: UnboundedSender<RegistryEvent>,
    ) -> Self {
        Self {
            node,
            proxy,
            events,
        }
    }

    /// Starts the monitor task.
    ///
    /// The task stops when the node's monitor token or `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    /// Main probe loop
    async fn run(self, shutdown: CancellationToken) {
        let token = self.node.monitor_token();
        let mut interval = tokio::time::interval(self.node.config().node_polling());
        // first tick fires immediately; the node just registered
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let status = self.check_node_health().await;
                    self.apply(status);
                }
            }
        }

        debug!(node = %self.node.id(), "Health monitor stopped");
    }

    /// One bounded status probe. Only a 200 counts as alive.
    async fn check_node_health(&self) -> HealthCheckStatus {
        let config = self.node.config();
        let request = GridRequest::new(Method::GET, config.status_path.clone());
        let timeout = config.node_status_check_timeout();

        match probe(self.proxy.as_ref(), &request, &self.node, timeout).await {
            Ok(()) => HealthCheckStatus::Healthy,
            Err(e) => HealthCheckStatus::Unhealthy(e.to_string()),
        }
    }

    fn apply(&self, status: HealthCheckStatus) {
        if let HealthCheckStatus::Unhealthy(reason) = &status {
            debug!(node = %self.node.id(), %reason, "Status probe missed");
        }

        let Some(event) = self.node.record_probe(status, Instant::now()) else {
            return;
        };

        match event {
            HealthEvent::Down => warn!(node = %self.node.id(), "Node is down"),
            HealthEvent::Broken => warn!(
                node = %self.node.id(),
                after_ms = self.node.config().unregister_if_still_down_after,
                "Node still down, marking broken"
            ),
            HealthEvent::Up => info!(node = %self.node.id(), "Node recovered"),
        }

        let _ = self.events.send(RegistryEvent::NodeHealth {
            node: self.node.clone(),
            event,
        });
    }
}

async fn probe(
    proxy: &dyn NodeProxy,
    request: &GridRequest,
    node: &Node,
    timeout: Duration,
) -> Result<()> {
    let response = proxy.proxy(request, node.url(), Some(timeout)).await?;
    if response.status != StatusCode::OK {
        return Err(GridError::NodeCommunication(format!(
            "Status probe answered {}",
            response.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_proxy, test_node_with_config};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn flaky_node() -> Arc<Node> {
        test_node_with_config(
            5555,
            json!([{"browserName": "firefox"}]),
            json!({
                "nodePolling": 1000,
                "downPollingLimit": 2,
                "unregisterIfStillDownAfter": 5000,
            }),
        )
    }

    #[tokio::test]
    async fn test_healthy_node_emits_nothing() {
        tokio::time::pause();
        let (fake, proxy) = fake_proxy();
        let node = flaky_node();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = HealthMonitor::new(node.clone(), proxy, tx).spawn(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(fake.requests_to("10.0.0.1:5555").len(), 3);
        assert_eq!(node.last_health_status(), Some(HealthCheckStatus::Healthy));

        node.stop_monitor();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_down_broken_and_recovery_events() {
        tokio::time::pause();
        let (fake, proxy) = fake_proxy();
        fake.set_node_down("10.0.0.1:5555", true);
        let node = flaky_node();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = HealthMonitor::new(node.clone(), proxy, tx).spawn(CancellationToken::new());

        let next_event = |rx: &mut mpsc::UnboundedReceiver<RegistryEvent>| match rx.try_recv() {
            Ok(RegistryEvent::NodeHealth { event, .. }) => Some(event),
            _ => None,
        };

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(next_event(&mut rx), Some(HealthEvent::Down));
        assert!(node.is_down());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(next_event(&mut rx), Some(HealthEvent::Broken));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(next_event(&mut rx), None);

        fake.set_node_down("10.0.0.1:5555", false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(next_event(&mut rx), Some(HealthEvent::Up));
        assert!(!node.is_down());
    }

    #[tokio::test]
    async fn test_shutdown_stops_monitor() {
        tokio::time::pause();
        let (fake, proxy) = fake_proxy();
        let node = flaky_node();
        let (tx, _rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let handle = HealthMonitor::new(node, proxy, tx).spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let probes = fake.requests().len();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fake.requests().len(), probes);
    }
}
