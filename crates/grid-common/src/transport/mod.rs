//! Grid Transport Layer
//!
//! This module contains the hub's only outbound network primitive:
//! forwarding a [`GridRequest`](crate::GridRequest) to a node and reading
//! back a [`GridResponse`](crate::GridResponse).
//!
//! # Components
//!
//! - **[`NodeProxy`]**: the forwarding seam; the hub core only depends on this trait
//! - **[`HttpNodeProxy`]**: hyper-util client implementation of [`NodeProxy`]
//! - **[`HttpTransport`]**: conversion of responses into hyper replies

pub mod http;

pub use http::{HttpNodeProxy, HttpTransport, HyperResponse, NodeProxy};
