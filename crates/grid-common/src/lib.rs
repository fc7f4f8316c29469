//! Grid Common Types and Transport
//!
//! This crate provides the wire-level vocabulary shared by the grid hub and
//! its tooling:
//!
//! - **Protocol Layer**: capability maps, normalized requests/responses and
//!   the [`GridError`] taxonomy
//! - **Transport Layer**: the [`NodeProxy`] primitive used to talk to
//!   registered nodes, and helpers for turning responses into HTTP replies
//!
//! # Example
//!
//! ```
//! use grid_common::{normalize_capabilities, GridRequest};
//! use hyper::Method;
//! use serde_json::json;
//!
//! let caps = normalize_capabilities(&json!({"BrowserName": "firefox", "version": 14}));
//! assert_eq!(caps["browserName"], "firefox");
//! assert_eq!(caps["version"], "14");
//!
//! let request = GridRequest::new(Method::POST, "/wd/hub/session")
//!     .with_json(&json!({"desiredCapabilities": caps}));
//! assert_eq!(request.path, "/wd/hub/session");
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
pub use transport::{HttpNodeProxy, HttpTransport, NodeProxy};
