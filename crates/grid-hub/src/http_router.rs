//! HTTP Router for the Hub
//!
//! Maps grid endpoints and session requests onto the [`Registry`]. Every
//! handler takes a normalized [`GridRequest`] and returns a [`GridResponse`];
//! the HTTP server only converts between those and axum types.
//!
//! Session requests are dispatched by path prefix to a protocol driver and
//! then by request type:
//!
//! - **New session**: queued in the registry until a slot is leased
//! - **End session**: forwarded, then the slot is released
//! - **Session info / commands**: forwarded to the session's node

use grid_common::{GridError, GridRequest, GridResponse};
use hyper::StatusCode;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::driver::{driver_for_path, RequestType};
use crate::node::NodeId;
use crate::registry::Registry;

/// Hub request router.
pub struct GridRouter {
    registry: Arc<Registry>,
}

impl GridRouter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// `POST /grid/register`
    pub fn register(&self, request: &GridRequest) -> GridResponse {
        let registered = request
            .json_body()
            .and_then(|body| self.registry.register_node(&body));

        match registered {
            Ok(_) => GridResponse::text(StatusCode::OK, "ok"),
            Err(e) => {
                warn!(error = %e, "Registration rejected");
                GridResponse::text(StatusCode::BAD_REQUEST, e.to_string())
            }
        }
    }

    /// `GET|POST /grid/unregister?id=<node>`
    pub fn unregister(&self, request: &GridRequest) -> GridResponse {
        match request.param("id") {
            Some(id) => {
                if self.registry.unregister_node(&NodeId::parse(&id)).is_none() {
                    debug!(node = %id, "Unregister for unknown node");
                }
                GridResponse::text(StatusCode::OK, "ok")
            }
            None => GridResponse::text(StatusCode::BAD_REQUEST, "missing id parameter"),
        }
    }

    /// `GET /grid/api/proxy?id=<node>`
    pub fn proxy_status(&self, request: &GridRequest) -> GridResponse {
        let status = match request.param("id") {
            Some(id) => self.registry.proxy_status(&NodeId::parse(&id)),
            None => json!({"success": false, "msg": "missing id parameter"}),
        };
        GridResponse::json(StatusCode::OK, &status)
    }

    /// `GET /grid/api/hub`
    pub fn hub_status(&self) -> GridResponse {
        GridResponse::json(StatusCode::OK, &self.registry.hub_status())
    }

    /// `GET /grid/api/testsession?session=<id>`
    pub fn test_session(&self, request: &GridRequest) -> GridResponse {
        let id = request.param("session").unwrap_or_default();
        match self.registry.test_session(&id) {
            Ok(value) => GridResponse::json(StatusCode::OK, &value),
            Err(e) => GridResponse::json(
                StatusCode::NOT_FOUND,
                &json!({"success": false, "msg": e.to_string()}),
            ),
        }
    }

    /// `GET /wd/hub/status`
    pub fn readiness(&self) -> GridResponse {
        let (free, total) = self.registry.slot_counts();
        let ready = free > 0;
        let message = if total == 0 {
            "No nodes registered".to_string()
        } else {
            format!("{} of {} slots free", free, total)
        };

        GridResponse::json(
            StatusCode::OK,
            &json!({
                "status": 0,
                "value": {
                    "ready": ready,
                    "message": message,
                    "build": {"version": env!("CARGO_PKG_VERSION")},
                },
            }),
        )
    }

    /// Handles a request under one of the protocol prefixes.
    pub async fn handle_session_request(&self, request: GridRequest) -> GridResponse {
        let Some(driver) = driver_for_path(&request.path) else {
            return GridResponse::text(
                StatusCode::NOT_FOUND,
                format!("No handler for {} {}", request.method, request.path),
            );
        };

        let request_type = driver.get_request_type(&request);
        debug!(protocol = driver.protocol().as_str(), ?request_type, path = %request.path, "Session request");

        let result = match request_type {
            RequestType::NewSession => self
                .registry
                .get_new_session(driver, request)
                .await
                .map(|session| driver.new_session_response(&session)),
            RequestType::EndSession => self.registry.end_session(driver, &request).await,
            RequestType::GetSessionInfo | RequestType::RunCommand => {
                self.registry.proxy_command(driver, &request).await
            }
        };

        result.unwrap_or_else(|e| {
            log_failure(&e);
            driver.error_response(&e)
        })
    }
}

fn log_failure(error: &GridError) {
    match error {
        GridError::UnknownSession(_) | GridError::InvalidRequest(_) => {
            debug!(error = %error, "Session request failed")
        }
        error if error.is_node_failure() => warn!(error = %error, "Node did not answer session request"),
        _ => warn!(error = %error, "Session request failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::test_support::{fake_proxy, legacy_request, registration, webdriver_request, FakeProxy};
    use hyper::Method;
    use serde_json::Value;

    fn response_json(response: &GridResponse) -> Value {
        response.json_body().unwrap_or(Value::Null)
    }

    fn router() -> (GridRouter, Arc<FakeProxy>) {
        let (fake, proxy) = fake_proxy();
        (GridRouter::new(Registry::new(HubConfig::default(), proxy)), fake)
    }

    fn register_request(body: Value) -> GridRequest {
        GridRequest::new(Method::POST, "/grid/register").with_json(&body)
    }

    #[tokio::test]
    async fn test_register_and_query_proxy() {
        let (router, _fake) = router();
        let response = router.register(&register_request(registration(
            5555,
            json!([{"browserName": "firefox"}]),
            json!({}),
        )));
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text_body(), "ok");

        let query = GridRequest::new(Method::GET, "/grid/api/proxy").with_query("id=http://10.0.0.1:5555");
        let status = response_json(&router.proxy_status(&query));
        assert_eq!(status["success"], true);
        assert_eq!(status["request"]["configuration"]["port"], 5555);

        let unregister = GridRequest::new(Method::GET, "/grid/unregister").with_query("id=10.0.0.1:5555");
        assert_eq!(router.unregister(&unregister).text_body(), "ok");
        assert_eq!(response_json(&router.proxy_status(&query))["success"], false);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_payload() {
        let (router, _fake) = router();
        let response = router.register(&register_request(json!({"capabilities": []})));
        assert_eq!(response.status, StatusCode::BAD_REQUEST);

        let mut garbage = GridRequest::new(Method::POST, "/grid/register");
        garbage.body = "not json".into();
        assert_eq!(router.register(&garbage).status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webdriver_session_round_trip() {
        let (router, _fake) = router();
        router.register(&register_request(registration(5555, json!([{"browserName": "firefox"}]), json!({}))));

        let created = router
            .handle_session_request(webdriver_request(json!({"browserName": "firefox"})))
            .await;
        assert_eq!(created.status, StatusCode::OK);
        let session_id = response_json(&created)["sessionId"].as_str().unwrap().to_string();

        let info = router
            .handle_session_request(GridRequest::new(Method::GET, format!("/wd/hub/session/{}", session_id)))
            .await;
        assert!(info.is_success());

        let test_session = router.test_session(
            &GridRequest::new(Method::GET, "/grid/api/testsession").with_query(format!("session={}", session_id)),
        );
        assert_eq!(response_json(&test_session)["proxyId"], "http://10.0.0.1:5555");

        let ended = router
            .handle_session_request(GridRequest::new(Method::DELETE, format!("/wd/hub/session/{}", session_id)))
            .await;
        assert!(ended.is_success());

        let gone = router
            .handle_session_request(GridRequest::new(Method::GET, format!("/wd/hub/session/{}/url", session_id)))
            .await;
        assert_eq!(gone.status, StatusCode::NOT_FOUND);
        assert_eq!(response_json(&gone)["status"], 6);
    }

    #[tokio::test]
    async fn test_errors_are_distinguishable() {
        let (router, fake) = router();
        router.register(&register_request(registration(5555, json!([{"browserName": "firefox"}]), json!({}))));

        let missing = router
            .handle_session_request(webdriver_request(json!({"browserName": "chrome"})))
            .await;
        assert_eq!(missing.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response_json(&missing)["status"], 33);

        let created = router
            .handle_session_request(webdriver_request(json!({"browserName": "firefox"})))
            .await;
        let session_id = response_json(&created)["sessionId"].as_str().unwrap().to_string();

        fake.set_node_down("10.0.0.1:5555", true);
        let comms = router
            .handle_session_request(GridRequest::new(Method::POST, format!("/wd/hub/session/{}/url", session_id)))
            .await;
        assert_eq!(comms.status, StatusCode::BAD_GATEWAY);

        let no_id = router
            .handle_session_request(GridRequest::new(Method::GET, "/wd/hub/sessions"))
            .await;
        assert_eq!(no_id.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_legacy_session_round_trip() {
        let (router, _fake) = router();
        router.register(&register_request(registration(
            5555,
            json!([{"browserName": "*firefox", "seleniumProtocol": "Selenium"}]),
            json!({}),
        )));

        let created = router.handle_session_request(legacy_request("*firefox", "")).await;
        let body = created.text_body();
        let session_id = body.strip_prefix("OK,").unwrap().to_string();

        let complete = GridRequest::new(Method::GET, "/selenium-server/driver")
            .with_query(format!("cmd=testComplete&sessionId={}", session_id));
        assert_eq!(router.handle_session_request(complete.clone()).await.text_body(), "OK");

        let again = router.handle_session_request(complete).await;
        assert!(again.text_body().starts_with("ERROR: "));
    }

    #[tokio::test]
    async fn test_unknown_path_and_readiness() {
        let (router, _fake) = router();
        let unknown = router
            .handle_session_request(GridRequest::new(Method::GET, "/nope"))
            .await;
        assert_eq!(unknown.status, StatusCode::NOT_FOUND);

        assert_eq!(response_json(&router.readiness())["value"]["ready"], false);
        router.register(&register_request(registration(5555, json!([{"browserName": "firefox"}]), json!({}))));
        assert_eq!(response_json(&router.readiness())["value"]["ready"], true);
        assert_eq!(response_json(&router.hub_status())["slotCounts"]["free"], 1);
    }
}
