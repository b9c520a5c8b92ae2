//! HTTP front end.
//!
//! # Responsibilities
//! - Accept HTTP requests on the configured listener
//! - Wire up middleware (request id, tracing, timeout)
//! - Hand every request to the FastCGI transport
//! - Map transport failures to gateway status codes
//!
//! # Design Decisions
//! - One catch-all route; the document root decides what exists
//! - Failure detail goes to the log, the client only sees the status line
//! - Graceful shutdown lets in-flight calls finish

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::fastcgi::Transport;
use crate::http::request::{propagate_request_id_layer, set_request_id_layer, RequestIdExt};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub transport: Arc<Transport>,
}

/// HTTP server in front of one FastCGI transport.
pub struct GatewayServer {
    router: Router,
}

impl GatewayServer {
    pub fn new(transport: Arc<Transport>, request_timeout: Duration) -> Self {
        let state = AppState { transport };
        Self {
            router: Self::build_router(state, request_timeout),
        }
    }

    /// The router, for serving or for driving in tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    #[allow(deprecated)]
    fn build_router(state: AppState, request_timeout: Duration) -> Router {
        Router::new()
            .route("/{*path}", any(fastcgi_handler))
            .route("/", any(fastcgi_handler))
            .with_state(state)
            .layer(TimeoutLayer::new(request_timeout))
            .layer(TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                tracing::info_span!(
                    "request",
                    request_id = %req.request_id(),
                    method = %req.method(),
                    path = %req.uri().path(),
                )
            }))
            .layer(propagate_request_id_layer())
            .layer(set_request_id_layer())
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.wait())
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn fastcgi_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let started = Instant::now();
    let request_id = request.request_id().to_string();

    match state.transport.round_trip(request).await {
        Ok(response) => {
            metrics::record_response(response.status().as_u16());
            response
        }
        Err(e) => {
            let status = e.status_code();
            tracing::warn!(
                request_id = %request_id,
                backend = %state.transport.pool().backend(),
                kind = e.kind(),
                error = %e,
                elapsed = ?started.elapsed(),
                "fastcgi request failed"
            );
            metrics::record_response(status.as_u16());
            (status, status.canonical_reason().unwrap_or_default()).into_response()
        }
    }
}
