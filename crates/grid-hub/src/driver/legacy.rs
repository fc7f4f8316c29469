//! Legacy Selenium RC protocol driver.
//!
//! Every call goes to a single endpoint and is addressed by its `cmd`
//! parameter. Parameters arrive in the query string, a url-encoded body, or
//! both. Replies are plain text: `OK,<payload>` or `ERROR: <message>`.

use grid_common::protocol::capabilities::BROWSER_NAME;
use grid_common::{normalize_capabilities, Capabilities, GridError, GridRequest, GridResponse, Result};
use hyper::{Method, StatusCode};
use serde_json::Value;

use super::{Protocol, ProtocolDriver, RequestType};
use crate::session::Session;

pub(crate) const PATH_PREFIX: &str = "/selenium-server/driver";

const NEW_SESSION_COMMAND: &str = "getNewBrowserSession";
const END_SESSION_COMMAND: &str = "testComplete";
const BROWSER_PARAM: &str = "1";
const EXTRA_CAPABILITIES_PARAM: &str = "4";
const SESSION_ID_PARAM: &str = "sessionId";

/// Driver for `/selenium-server/driver` requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SeleniumProtocol;

/// Reduces a legacy browser string to a browser name.
///
/// `*firefox /opt/firefox/firefox-bin` becomes `firefox`.
pub(crate) fn browser_name(raw: &str) -> &str {
    let first = raw.split_whitespace().next().unwrap_or("");
    first.strip_prefix('*').unwrap_or(first)
}

impl ProtocolDriver for SeleniumProtocol {
    fn protocol(&self) -> Protocol {
        Protocol::Selenium
    }

    fn get_request_type(&self, request: &GridRequest) -> RequestType {
        match request.param("cmd").as_deref() {
            Some(NEW_SESSION_COMMAND) => RequestType::NewSession,
            Some(END_SESSION_COMMAND) => RequestType::EndSession,
            _ => RequestType::RunCommand,
        }
    }

    fn get_request_capabilities(&self, request: &GridRequest) -> Result<Capabilities> {
        let mut raw = serde_json::Map::new();

        if let Some(browser) = request.param(BROWSER_PARAM) {
            let name = browser_name(&browser);
            if !name.is_empty() {
                raw.insert(BROWSER_NAME.to_string(), Value::String(name.to_string()));
            }
        }

        if let Some(extra) = request.param(EXTRA_CAPABILITIES_PARAM) {
            for pair in extra.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    GridError::InvalidRequest(format!("Malformed capability '{}'", pair))
                })?;
                raw.insert(key.trim().to_string(), Value::String(value.trim().to_string()));
            }
        }

        Ok(normalize_capabilities(&Value::Object(raw)))
    }

    fn get_session_id(&self, request: &GridRequest) -> Option<String> {
        request
            .param(SESSION_ID_PARAM)
            .filter(|id| !id.is_empty())
    }

    fn parse_proxy_response(&self, response: &GridResponse) -> Result<(String, Capabilities)> {
        let text = response.text_body();

        match text.trim().strip_prefix("OK,") {
            Some(id) if response.is_success() && !id.trim().is_empty() => {
                // Legacy nodes do not report capabilities; the slot profile stands in
                Ok((id.trim().to_string(), Capabilities::new()))
            }
            _ => Err(GridError::InvalidResponse(format!(
                "Node refused to create a session ({}): {}",
                response.status,
                text.trim()
            ))),
        }
    }

    fn build_end_session_request(&self, session: &Session) -> GridRequest {
        GridRequest::new(Method::POST, format!("{}/", PATH_PREFIX)).with_form(&[
            ("cmd", END_SESSION_COMMAND),
            (SESSION_ID_PARAM, session.id()),
        ])
    }

    fn new_session_response(&self, session: &Session) -> GridResponse {
        GridResponse::text(StatusCode::OK, format!("OK,{}", session.id()))
    }

    fn error_response(&self, error: &GridError) -> GridResponse {
        GridResponse::text(StatusCode::OK, format!("ERROR: {}", error))
    }
}
