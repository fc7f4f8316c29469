//! HTTP Transport
//!
//! This module provides the node-facing proxy primitive and the conversion
//! of grid responses into hyper replies.
//!
//! # Architecture
//!
//! - Requests are forwarded to the node's origin with the client's own path
//!   and query, so a node serving `/wd/hub` sees exactly what the client sent
//! - Hop-by-hop headers are stripped in both directions
//! - Every call may carry its own timeout; elapsing it yields
//!   [`GridError::Timeout`] and never panics
//!
//! # Example
//!
//! ```no_run
//! use grid_common::{GridRequest, HttpNodeProxy, NodeProxy};
//! use hyper::Method;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let proxy = HttpNodeProxy::new();
//! let node = url::Url::parse("http://127.0.0.1:5555")?;
//! let status = GridRequest::new(Method::GET, "/wd/hub/status");
//! let response = proxy.proxy(&status, &node, Some(Duration::from_secs(2))).await?;
//! println!("node answered {}", response.status);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE};
use hyper::{HeaderMap, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use url::Url;

use crate::protocol::error::{GridError, Result};
use crate::protocol::{GridRequest, GridResponse};

/// Type alias for hyper responses with a full body
pub type HyperResponse = Response<Full<Bytes>>;

const HOP_BY_HOP: [HeaderName; 4] = [CONNECTION, TRANSFER_ENCODING, UPGRADE, CONTENT_LENGTH];

/// Forwards a request to a node.
///
/// This is the single seam between the hub core and the network. The hub
/// uses it for health probes, session creation, command forwarding and
/// session teardown.
#[async_trait]
pub trait NodeProxy: Send + Sync {
    /// Sends `request` to the node at `node_url`.
    ///
    /// # Arguments
    /// * `request` - Request to forward; its path and query are kept as-is
    /// * `node_url` - Node base URL; only its origin is used
    /// * `timeout` - Optional bound on the whole exchange
    ///
    /// # Returns
    /// - `Ok(GridResponse)` - Whatever the node answered, including non-2xx
    /// - `Err(GridError::Timeout)` - The node did not answer in time
    /// - `Err(GridError::NodeCommunication)` - Connection-level failure
    async fn proxy(
        &self,
        request: &GridRequest,
        node_url: &Url,
        timeout: Option<Duration>,
    ) -> Result<GridResponse>;
}

/// [`NodeProxy`] backed by a pooled hyper-util HTTP/1 client.
#[derive(Clone)]
pub struct HttpNodeProxy {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpNodeProxy {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client }
    }

    async fn send(&self, request: &GridRequest, target: String) -> Result<GridResponse> {
        let uri: Uri = target
            .parse()
            .map_err(|e| GridError::Transport(format!("Invalid node URI {}: {}", target, e)))?;

        let mut http_request = Request::new(Full::new(request.body.clone()));
        *http_request.method_mut() = request.method.clone();
        *http_request.uri_mut() = uri;
        let mut headers = request.headers.clone();
        headers.remove(HOST);
        strip_hop_by_hop(&mut headers);
        *http_request.headers_mut() = headers;

        tracing::trace!(method = %request.method, %target, "Forwarding request to node");
        let response = self.client.request(http_request).await.map_err(|e| {
            tracing::debug!(%target, error = %e, "Node request failed");
            GridError::NodeCommunication(format!("HTTP request to {} failed: {}", target, e))
        })?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| GridError::NodeCommunication(format!("Failed to read response from {}: {}", target, e)))?
            .to_bytes();

        Ok(GridResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

impl Default for HttpNodeProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeProxy for HttpNodeProxy {
    async fn proxy(
        &self,
        request: &GridRequest,
        node_url: &Url,
        timeout: Option<Duration>,
    ) -> Result<GridResponse> {
        let target = format!(
            "{}{}",
            node_url.origin().ascii_serialization(),
            request.path_and_query()
        );

        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.send(request, target)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(
                        node = %node_url,
                        timeout_ms = timeout.as_millis() as u64,
                        "Node did not answer in time"
                    );
                    Err(GridError::Timeout(timeout.as_millis() as u64))
                }
            },
            None => self.send(request, target).await,
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

/// HTTP transport utility functions
pub struct HttpTransport;

impl HttpTransport {
    /// Converts a grid response into a hyper response.
    ///
    /// Hop-by-hop headers copied from a node reply are dropped; hyper
    /// recomputes framing for the buffered body.
    pub fn to_http_response(response: GridResponse) -> HyperResponse {
        let GridResponse {
            status,
            mut headers,
            body,
        } = response;
        strip_hop_by_hop(&mut headers);

        let mut http_response = Response::new(Full::new(body));
        *http_response.status_mut() = status;
        *http_response.headers_mut() = headers;
        http_response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use hyper::header::CONTENT_TYPE;
    use hyper::{Method, StatusCode};
    use serde_json::json;
    use std::net::SocketAddr;

    async fn spawn_node() -> SocketAddr {
        let app = axum::Router::new()
            .route("/wd/hub/status", get(|| async { "OK" }))
            .route(
                "/wd/hub/session",
                post(|body: Bytes| async move { (StatusCode::OK, body) }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn node_url(addr: SocketAddr) -> Url {
        Url::parse(&format!("http://{}/wd/hub", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_proxy_forwards_path_and_body() {
        let addr = spawn_node().await;
        let proxy = HttpNodeProxy::new();

        let request = GridRequest::new(Method::POST, "/wd/hub/session")
            .with_json(&json!({"desiredCapabilities": {"browserName": "firefox"}}));
        let response = proxy.proxy(&request, &node_url(addr), None).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            response.json_body().unwrap()["desiredCapabilities"]["browserName"],
            "firefox"
        );
    }

    #[tokio::test]
    async fn test_proxy_returns_non_success_status() {
        let addr = spawn_node().await;
        let proxy = HttpNodeProxy::new();

        let request = GridRequest::new(Method::GET, "/missing");
        let response = proxy.proxy(&request, &node_url(addr), None).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_proxy_timeout() {
        let addr = spawn_node().await;
        let proxy = HttpNodeProxy::new();

        let request = GridRequest::new(Method::GET, "/slow");
        let result = proxy
            .proxy(&request, &node_url(addr), Some(Duration::from_millis(100)))
            .await;
        assert!(matches!(result, Err(GridError::Timeout(100))));
    }

    #[tokio::test]
    async fn test_proxy_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy = HttpNodeProxy::new();
        let request = GridRequest::new(Method::GET, "/wd/hub/status");
        let result = proxy
            .proxy(&request, &node_url(addr), Some(Duration::from_secs(2)))
            .await;
        assert!(matches!(result, Err(GridError::NodeCommunication(_))));
    }

    #[test]
    fn test_to_http_response_strips_hop_by_hop() {
        let mut response = GridResponse::json(StatusCode::CREATED, &json!({"status": 0}));
        response
            .headers
            .insert(TRANSFER_ENCODING, "chunked".parse().unwrap());

        let http_response = HttpTransport::to_http_response(response);
        assert_eq!(http_response.status(), StatusCode::CREATED);
        assert!(http_response.headers().get(TRANSFER_ENCODING).is_none());
        assert_eq!(
            http_response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json; charset=utf-8"
        );
    }
}
