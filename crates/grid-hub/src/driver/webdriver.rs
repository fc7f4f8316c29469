//! WebDriver (JSON wire) protocol driver.

use grid_common::{normalize_capabilities, Capabilities, GridError, GridRequest, GridResponse, Result};
use hyper::{Method, StatusCode};
use serde_json::{json, Value};

use super::{Protocol, ProtocolDriver, RequestType};
use crate::session::Session;

pub(crate) const PATH_PREFIX: &str = "/wd/hub";

/// Driver for `/wd/hub/...` requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebDriverProtocol;

impl WebDriverProtocol {
    fn segments(path: &str) -> Vec<&str> {
        path.strip_prefix(PATH_PREFIX)
            .unwrap_or(path)
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect()
    }
}

impl ProtocolDriver for WebDriverProtocol {
    fn protocol(&self) -> Protocol {
        Protocol::WebDriver
    }

    fn get_request_type(&self, request: &GridRequest) -> RequestType {
        let segments = Self::segments(&request.path);
        match (&request.method, segments.as_slice()) {
            (&Method::POST, ["session"]) => RequestType::NewSession,
            (&Method::GET, ["session", _]) => RequestType::GetSessionInfo,
            (&Method::DELETE, ["session", _]) => RequestType::EndSession,
            _ => RequestType::RunCommand,
        }
    }

    fn get_request_capabilities(&self, request: &GridRequest) -> Result<Capabilities> {
        let body = request.json_body()?;

        if let Some(desired) = body.get("desiredCapabilities").filter(|v| v.is_object()) {
            return Ok(normalize_capabilities(desired));
        }

        // W3C form: alwaysMatch, completed by the first firstMatch entry
        if let Some(capabilities) = body.get("capabilities") {
            let mut merged = capabilities
                .get("alwaysMatch")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let first_match = capabilities
                .get("firstMatch")
                .and_then(Value::as_array)
                .and_then(|entries| entries.first())
                .and_then(Value::as_object);
            if let Some(first_match) = first_match {
                for (key, value) in first_match {
                    merged.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            return Ok(normalize_capabilities(&Value::Object(merged)));
        }

        Ok(Capabilities::new())
    }

    fn get_session_id(&self, request: &GridRequest) -> Option<String> {
        match Self::segments(&request.path).as_slice() {
            ["session", id, ..] => Some((*id).to_string()),
            _ => None,
        }
    }

    fn parse_proxy_response(&self, response: &GridResponse) -> Result<(String, Capabilities)> {
        let body = response.json_body();

        if !response.is_success() {
            let message = match &body {
                Ok(body) => error_message(body),
                Err(_) => response.text_body(),
            };
            return Err(GridError::InvalidResponse(format!(
                "Node refused to create a session ({}): {}",
                response.status, message
            )));
        }

        let body = body?;
        let status = body.get("status").and_then(Value::as_i64).unwrap_or(0);
        if status != 0 {
            return Err(GridError::InvalidResponse(format!(
                "Node refused to create a session (status {}): {}",
                status,
                error_message(&body)
            )));
        }

        if let Some(id) = body.get("sessionId").and_then(Value::as_str) {
            let capabilities = body
                .get("value")
                .map(normalize_capabilities)
                .unwrap_or_default();
            return Ok((id.to_string(), capabilities));
        }

        let value = body.get("value");
        if let Some(id) = value.and_then(|v| v.get("sessionId")).and_then(Value::as_str) {
            let capabilities = value
                .and_then(|v| v.get("capabilities"))
                .map(normalize_capabilities)
                .unwrap_or_default();
            return Ok((id.to_string(), capabilities));
        }

        Err(GridError::InvalidResponse(
            "Node reply does not contain a session id".to_string(),
        ))
    }

    fn build_end_session_request(&self, session: &Session) -> GridRequest {
        GridRequest::new(
            Method::DELETE,
            format!("{}/session/{}", PATH_PREFIX, session.id()),
        )
    }

    fn new_session_response(&self, session: &Session) -> GridResponse {
        session.creation_response().clone()
    }

    fn error_response(&self, error: &GridError) -> GridResponse {
        let (status, code, name) = match error {
            GridError::UnknownSession(_) => (StatusCode::NOT_FOUND, 6, "no such session"),
            GridError::CapabilityNotPresent(_)
            | GridError::NewSessionTimeout(_)
            | GridError::InvalidResponse(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, 33, "session not created")
            }
            GridError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, 33, "session not created"),
            error if error.is_node_failure() => (StatusCode::BAD_GATEWAY, 13, "unknown error"),
            GridError::InvalidRequest(_) | GridError::InvalidRegistration(_) => {
                (StatusCode::BAD_REQUEST, 13, "invalid argument")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, 13, "unknown error"),
        };

        GridResponse::json(
            status,
            &json!({
                "sessionId": null,
                "status": code,
                "value": {
                    "error": name,
                    "message": error.to_string(),
                },
            }),
        )
    }
}

fn error_message(body: &Value) -> String {
    body.get("value")
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}
