//! Shared fixtures for unit tests.

use async_trait::async_trait;
use grid_common::{GridError, GridRequest, GridResponse, NodeProxy, Result};
use hyper::{Method, StatusCode};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::HubConfig;
use crate::driver::{NewSessionRequest, Protocol, SeleniumProtocol, WebDriverProtocol};
use crate::node::Node;

#[derive(Default)]
struct Script {
    requests: Vec<(String, String)>,
    nodes_down: Vec<String>,
    fail_new: bool,
    fail_end: bool,
    delay: Option<Duration>,
    created: u64,
}

/// Scripted in-memory node farm.
///
/// Answers status probes, session creation, commands and session teardown
/// for both protocols, and records every request as `"METHOD path?query"`.
#[derive(Default)]
pub struct FakeProxy {
    script: Mutex<Script>,
}

impl FakeProxy {
    pub fn requests(&self) -> Vec<String> {
        self.script
            .lock()
            .requests
            .iter()
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Requests sent to the node at `host:port`.
    pub fn requests_to(&self, node: &str) -> Vec<String> {
        self.script
            .lock()
            .requests
            .iter()
            .filter(|(target, _)| target == node)
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn set_node_down(&self, node: &str, down: bool) {
        let mut script = self.script.lock();
        script.nodes_down.retain(|n| n != node);
        if down {
            script.nodes_down.push(node.to_string());
        }
    }

    pub fn set_fail_new(&self, fail: bool) {
        self.script.lock().fail_new = fail;
    }

    pub fn set_fail_end(&self, fail: bool) {
        self.script.lock().fail_end = fail;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.script.lock().delay = delay;
    }

    fn answer(&self, request: &GridRequest, node: &str) -> Result<GridResponse> {
        let mut script = self.script.lock();

        if script.nodes_down.iter().any(|n| n == node) {
            return Err(GridError::NodeCommunication(format!("{} refused connection", node)));
        }

        let path = request.path.as_str();
        if path.starts_with("/selenium-server/driver") {
            return match request.param("cmd").as_deref() {
                Some("getNewBrowserSession") if script.fail_new => {
                    Err(GridError::NodeCommunication("browser launch failed".to_string()))
                }
                Some("getNewBrowserSession") => {
                    script.created += 1;
                    Ok(GridResponse::text(StatusCode::OK, format!("OK,legacy-{}", script.created)))
                }
                Some("testComplete") if script.fail_end => {
                    Err(GridError::NodeCommunication("node went away".to_string()))
                }
                _ => Ok(GridResponse::text(StatusCode::OK, "OK")),
            };
        }

        let is_session_root = path == "/wd/hub/session";
        let is_session_path = path
            .strip_prefix("/wd/hub/session/")
            .map(|rest| !rest.is_empty() && !rest.contains('/'))
            .unwrap_or(false);

        match request.method {
            Method::GET if path.ends_with("/status") => Ok(GridResponse::json(
                StatusCode::OK,
                &json!({"status": 0, "value": {"ready": true}}),
            )),
            Method::POST if is_session_root && script.fail_new => {
                Err(GridError::NodeCommunication("browser launch failed".to_string()))
            }
            Method::POST if is_session_root => {
                script.created += 1;
                let desired = request
                    .json_body()
                    .ok()
                    .and_then(|body| body.get("desiredCapabilities").cloned())
                    .unwrap_or_else(|| json!({}));
                Ok(GridResponse::json(
                    StatusCode::OK,
                    &json!({"sessionId": format!("session-{}", script.created), "status": 0, "value": desired}),
                ))
            }
            Method::DELETE if is_session_path && script.fail_end => {
                Err(GridError::NodeCommunication("node went away".to_string()))
            }
            _ => Ok(GridResponse::json(
                StatusCode::OK,
                &json!({"status": 0, "value": request.path}),
            )),
        }
    }
}

#[async_trait]
impl NodeProxy for FakeProxy {
    async fn proxy(
        &self,
        request: &GridRequest,
        node_url: &Url,
        timeout: Option<Duration>,
    ) -> Result<GridResponse> {
        let node = format!(
            "{}:{}",
            node_url.host_str().unwrap_or_default(),
            node_url.port_or_known_default().unwrap_or_default()
        );
        let delay = {
            let mut script = self.script.lock();
            script.requests.push((
                node.clone(),
                format!("{} {}", request.method, request.path_and_query()),
            ));
            script.delay
        };

        if let Some(delay) = delay {
            match timeout {
                Some(timeout) if timeout < delay => {
                    tokio::time::sleep(timeout).await;
                    return Err(GridError::Timeout(timeout.as_millis() as u64));
                }
                _ => tokio::time::sleep(delay).await,
            }
        }

        self.answer(request, &node)
    }
}

/// A fake proxy plus the same value as the trait object the hub consumes.
pub fn fake_proxy() -> (Arc<FakeProxy>, Arc<dyn NodeProxy>) {
    let fake = Arc::new(FakeProxy::default());
    let proxy: Arc<dyn NodeProxy> = fake.clone();
    (fake, proxy)
}

pub fn registration(port: u16, capabilities: Value, configuration: Value) -> Value {
    let mut config = json!({"host": "10.0.0.1", "port": port});
    if let (Some(base), Value::Object(extra)) = (config.as_object_mut(), configuration) {
        base.extend(extra);
    }
    json!({"capabilities": capabilities, "configuration": config})
}

pub fn test_node(port: u16, capabilities: Value) -> Arc<Node> {
    test_node_with_config(port, capabilities, json!({}))
}

pub fn test_node_with_config(port: u16, capabilities: Value, configuration: Value) -> Arc<Node> {
    let registration = registration(port, capabilities, configuration);
    Arc::new(Node::from_registration(&registration, &HubConfig::default()).unwrap())
}

pub fn webdriver_request(desired: Value) -> GridRequest {
    GridRequest::new(Method::POST, "/wd/hub/session").with_json(&json!({"desiredCapabilities": desired}))
}

pub fn new_session_request(desired: Value) -> NewSessionRequest {
    NewSessionRequest::from_request(&WebDriverProtocol, webdriver_request(desired)).unwrap()
}

pub fn legacy_request(browser: &str, extra: &str) -> GridRequest {
    GridRequest::new(Method::POST, "/selenium-server/driver/")
        .with_query("cmd=getNewBrowserSession")
        .with_form(&[("1", browser), ("2", "http://example.com"), ("4", extra)])
}

pub fn legacy_session_request(browser: &str, extra: &str) -> NewSessionRequest {
    let request = NewSessionRequest::from_request(&SeleniumProtocol, legacy_request(browser, extra)).unwrap();
    assert_eq!(request.protocol, Protocol::Selenium);
    request
}
