//! Metrics collection and exposition.
//!
//! # Metrics
//! - `fcgi_calls_total` (counter): FastCGI calls by backend and outcome
//! - `fcgi_call_duration_seconds` (histogram): call latency per backend
//! - `fcgi_retries_total` (counter): reconnect-and-retry attempts
//! - `fcgi_watchdog_closes_total` (counter): connections closed by the watchdog
//! - `fcgi_pool_acquire_seconds` (histogram): time spent waiting for a client
//! - `gateway_responses_total` (counter): front-end responses by status
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so library users
//!   and tests pay nothing
//! - Exposition is a Prometheus scrape endpoint on its own listener

use std::net::SocketAddr;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::fastcgi::{BackendAddr, FcgiResult};

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let app = Router::new().route("/metrics", get(move || async move { handle.render() }));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server failed");
        }
    });

    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_call<T>(backend: &BackendAddr, result: &FcgiResult<T>, started: Instant) {
    let backend = backend.to_string();
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    counter!("fcgi_calls_total", "backend" => backend.clone(), "outcome" => outcome).increment(1);
    histogram!("fcgi_call_duration_seconds", "backend" => backend).record(started.elapsed().as_secs_f64());
}

pub fn record_retry(backend: &BackendAddr) {
    counter!("fcgi_retries_total", "backend" => backend.to_string()).increment(1);
}

pub fn record_watchdog_close(backend: &BackendAddr) {
    counter!("fcgi_watchdog_closes_total", "backend" => backend.to_string()).increment(1);
}

pub fn record_pool_acquire(backend: &BackendAddr, started: Instant) {
    histogram!("fcgi_pool_acquire_seconds", "backend" => backend.to_string())
        .record(started.elapsed().as_secs_f64());
}

pub fn record_response(status: u16) {
    counter!("gateway_responses_total", "status" => status.to_string()).increment(1);
}
