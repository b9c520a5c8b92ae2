use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::fastcgi::pool::PoolStats;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub pools: usize,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
        pools: state.registry.len(),
    })
}

/// Lease and connection state of every pool.
pub async fn get_pools(State(state): State<AdminState>) -> Json<Vec<PoolStats>> {
    let mut stats: Vec<_> = state.registry.pools().iter().map(|p| p.stats()).collect();
    stats.sort_by(|a, b| a.backend.cmp(&b.backend).then(a.capacity.cmp(&b.capacity)));
    Json(stats)
}
