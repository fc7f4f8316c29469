//! Protocol Drivers
//!
//! The hub speaks two session protocols: the JSON, path-addressed WebDriver
//! protocol and the query-parameter, command-addressed legacy Selenium RC
//! protocol. A [`ProtocolDriver`] hides every difference between them from
//! the registry, slots and sessions, which only ever call through the trait.
//!
//! The driver for an inbound request is picked once, by [`driver_for_path`],
//! from a prefix table. The driver for a session is picked by the
//! [`Protocol`] of the slot it runs on.

mod legacy;
mod webdriver;

pub use legacy::SeleniumProtocol;
pub(crate) use legacy::browser_name as legacy_browser_name;
pub use webdriver::WebDriverProtocol;

use async_trait::async_trait;
use grid_common::protocol::capabilities::SELENIUM_PROTOCOL;
use grid_common::{Capabilities, GridError, GridRequest, GridResponse, NodeProxy, Result};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::session::Session;

/// Wire protocol spoken by a slot or a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    WebDriver,
    Selenium,
}

impl Protocol {
    /// `seleniumProtocol: "Selenium"` selects the legacy protocol, anything else WebDriver.
    pub fn from_capabilities(capabilities: &Capabilities) -> Self {
        match capabilities.get(SELENIUM_PROTOCOL).and_then(|v| v.as_str()) {
            Some(name) if name.eq_ignore_ascii_case("selenium") => Protocol::Selenium,
            _ => Protocol::WebDriver,
        }
    }

    pub fn driver(self) -> &'static dyn ProtocolDriver {
        match self {
            Protocol::WebDriver => &WEBDRIVER,
            Protocol::Selenium => &SELENIUM,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::WebDriver => "WebDriver",
            Protocol::Selenium => "Selenium",
        }
    }
}

/// What an inbound session request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    NewSession,
    GetSessionInfo,
    EndSession,
    RunCommand,
}

/// A session the node agreed to create.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session_id: String,
    pub capabilities: Capabilities,
    pub response: GridResponse,
}

/// A new-session request after capability extraction.
#[derive(Debug, Clone)]
pub struct NewSessionRequest {
    /// Correlation id used in logs and by the session queue
    pub id: Uuid,
    pub protocol: Protocol,
    pub desired: Capabilities,
    pub request: GridRequest,
}

impl NewSessionRequest {
    pub fn new(protocol: Protocol, desired: Capabilities, request: GridRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            protocol,
            desired,
            request,
        }
    }

    /// Classifies `request` with `driver` and extracts its desired capabilities.
    pub fn from_request(driver: &dyn ProtocolDriver, request: GridRequest) -> Result<Self> {
        let desired = driver.get_request_capabilities(&request)?;
        Ok(Self::new(driver.protocol(), desired, request))
    }
}

/// Protocol-specific behavior of the hub.
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Classifies an inbound request.
    fn get_request_type(&self, request: &GridRequest) -> RequestType;

    /// Extracts and normalizes the desired capabilities of a new-session request.
    fn get_request_capabilities(&self, request: &GridRequest) -> Result<Capabilities>;

    /// Session id addressed by a command or end-session request.
    fn get_session_id(&self, request: &GridRequest) -> Option<String>;

    /// Reads `(sessionId, capabilities)` from a node's new-session reply.
    ///
    /// Fails with [`GridError::InvalidResponse`] when the reply does not
    /// indicate a created session.
    fn parse_proxy_response(&self, response: &GridResponse) -> Result<(String, Capabilities)>;

    /// Request that ends `session` on its node.
    fn build_end_session_request(&self, session: &Session) -> GridRequest;

    /// Reply sent to the client once a session has been created.
    fn new_session_response(&self, session: &Session) -> GridResponse;

    /// Reply sent to the client for a failed request.
    fn error_response(&self, error: &GridError) -> GridResponse;

    /// Forwards a new-session request to a node and parses its reply.
    async fn proxy_to_node(
        &self,
        proxy: &dyn NodeProxy,
        request: &GridRequest,
        node_url: &Url,
        timeout: Option<Duration>,
    ) -> Result<CreatedSession> {
        let response = proxy.proxy(request, node_url, timeout).await?;
        let (session_id, capabilities) = self.parse_proxy_response(&response)?;
        Ok(CreatedSession {
            session_id,
            capabilities,
            response,
        })
    }
}

static WEBDRIVER: WebDriverProtocol = WebDriverProtocol;
static SELENIUM: SeleniumProtocol = SeleniumProtocol;

/// Path prefixes served by each protocol.
const ROUTES: [(&str, Protocol); 2] = [
    (webdriver::PATH_PREFIX, Protocol::WebDriver),
    (legacy::PATH_PREFIX, Protocol::Selenium),
];

/// Picks the driver serving `path`, if any.
pub fn driver_for_path(path: &str) -> Option<&'static dyn ProtocolDriver> {
    ROUTES
        .iter()
        .find(|(prefix, _)| {
            path.strip_prefix(prefix)
                .map(|rest| rest.is_empty() || rest.starts_with('/'))
                .unwrap_or(false)
        })
        .map(|(_, protocol)| protocol.driver())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn caps(value: serde_json::Value) -> Capabilities {
        grid_common::normalize_capabilities(&value)
    }

    #[test]
    fn test_protocol_from_capabilities() {
        assert_eq!(
            Protocol::from_capabilities(&caps(json!({"seleniumProtocol": "Selenium"}))),
            Protocol::Selenium
        );
        assert_eq!(
            Protocol::from_capabilities(&caps(json!({"seleniumProtocol": "WebDriver"}))),
            Protocol::WebDriver
        );
        assert_eq!(
            Protocol::from_capabilities(&caps(json!({"browserName": "firefox"}))),
            Protocol::WebDriver
        );
    }

    #[test]
    fn test_driver_for_path() {
        assert_eq!(
            driver_for_path("/wd/hub/session").map(|d| d.protocol()),
            Some(Protocol::WebDriver)
        );
        assert_eq!(
            driver_for_path("/wd/hub/session/abc/url").map(|d| d.protocol()),
            Some(Protocol::WebDriver)
        );
        assert_eq!(
            driver_for_path("/selenium-server/driver").map(|d| d.protocol()),
            Some(Protocol::Selenium)
        );
        assert_eq!(
            driver_for_path("/selenium-server/driver/").map(|d| d.protocol()),
            Some(Protocol::Selenium)
        );
        assert!(driver_for_path("/wd/hubby").is_none());
        assert!(driver_for_path("/grid/register").is_none());
        assert!(driver_for_path("/").is_none());
    }

    #[test]
    fn test_protocol_driver_round_trip() {
        assert_eq!(Protocol::WebDriver.driver().protocol(), Protocol::WebDriver);
        assert_eq!(Protocol::Selenium.driver().protocol(), Protocol::Selenium);
    }
}
