//! Grid Response Type
//!
//! Responses travel in both directions: nodes answer the hub with one, and
//! the hub answers clients with one. The HTTP layer turns it into a wire
//! reply via [`HttpTransport`](crate::transport::HttpTransport).

use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{HeaderMap, StatusCode};
use serde_json::Value;

use super::error::{GridError, Result};

#[derive(Debug, Clone)]
pub struct GridResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GridResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Creates a JSON response.
    ///
    /// # Example
    ///
    /// ```
    /// use grid_common::GridResponse;
    /// use hyper::StatusCode;
    /// use serde_json::json;
    ///
    /// let response = GridResponse::json(StatusCode::OK, &json!({"status": 0}));
    /// assert_eq!(response.json_body().unwrap()["status"], 0);
    /// ```
    pub fn json(status: StatusCode, value: &Value) -> Self {
        let mut response = Self::new(status, value.to_string());
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        response
    }

    /// Creates a plain-text response.
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        let mut response = Self::new(status, text.into());
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text_body(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json_body(&self) -> Result<Value> {
        serde_json::from_slice(&self.body).map_err(|e| {
            GridError::InvalidResponse(format!("Body is not valid JSON: {}", e))
        })
    }
}
