//! HTTP Server for the Hub
//!
//! Binds the grid endpoints with axum. Everything under the protocol
//! prefixes falls through to [`GridRouter::handle_session_request`].

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use grid_common::{GridError, GridRequest, GridResponse, HttpTransport, Result};
use hyper::StatusCode;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::http_router::GridRouter;
use crate::registry::Registry;

/// Largest request body accepted from a client.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// HTTP server exposing a registry.
pub struct HttpServer {
    router: Arc<GridRouter>,
}

impl HttpServer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            router: Arc::new(GridRouter::new(registry)),
        }
    }

    /// The axum application, without binding a socket.
    pub fn app(&self) -> Router {
        Router::new()
            .route("/grid/register", post(register))
            .route("/grid/unregister", get(unregister).post(unregister))
            .route("/grid/api/proxy", get(proxy_status))
            .route("/grid/api/hub", get(hub_status))
            .route("/grid/api/testsession", get(test_session))
            .route("/wd/hub/status", get(readiness))
            .fallback(session_request)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.router.clone())
    }

    /// Binds `addr` and serves until the process exits.
    ///
    /// # Arguments
    /// * `addr` - Socket address to bind to
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GridError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener, std::future::pending()).await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    ///
    /// In-flight requests are allowed to finish before this returns.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener
            .local_addr()
            .map_err(|e| GridError::Transport(e.to_string()))?;
        info!("Grid hub listening on http://{}", addr);

        axum::serve(listener, self.app())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| GridError::Transport(format!("Server error: {}", e)))
    }
}

async fn into_grid_request(request: Request) -> std::result::Result<GridRequest, Response> {
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, MAX_BODY_BYTES).await.map_err(|e| {
        reply(GridResponse::text(
            StatusCode::BAD_REQUEST,
            format!("Failed to read request body: {}", e),
        ))
    })?;
    Ok(GridRequest::from_parts(parts.method, &parts.uri, parts.headers, body))
}

fn reply(response: GridResponse) -> Response {
    HttpTransport::to_http_response(response).into_response()
}

async fn register(State(router): State<Arc<GridRouter>>, request: Request) -> Response {
    match into_grid_request(request).await {
        Ok(request) => reply(router.register(&request)),
        Err(response) => response,
    }
}

async fn unregister(State(router): State<Arc<GridRouter>>, request: Request) -> Response {
    match into_grid_request(request).await {
        Ok(request) => reply(router.unregister(&request)),
        Err(response) => response,
    }
}

async fn proxy_status(State(router): State<Arc<GridRouter>>, request: Request) -> Response {
    match into_grid_request(request).await {
        Ok(request) => reply(router.proxy_status(&request)),
        Err(response) => response,
    }
}

async fn hub_status(State(router): State<Arc<GridRouter>>) -> Response {
    reply(router.hub_status())
}

async fn test_session(State(router): State<Arc<GridRouter>>, request: Request) -> Response {
    match into_grid_request(request).await {
        Ok(request) => reply(router.test_session(&request)),
        Err(response) => response,
    }
}

async fn readiness(State(router): State<Arc<GridRouter>>) -> Response {
    reply(router.readiness())
}

async fn session_request(State(router): State<Arc<GridRouter>>, request: Request) -> Response {
    match into_grid_request(request).await {
        Ok(request) => reply(router.handle_session_request(request).await),
        Err(response) => response,
    }
}
