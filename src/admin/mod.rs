//! Admin API: gateway status and pool introspection behind a bearer key.

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{middleware, routing::get, Router};

use crate::fastcgi::PoolRegistry;

use self::auth::admin_auth_middleware;
use self::handlers::{get_pools, get_status};

#[derive(Debug, Clone)]
pub struct AdminState {
    pub registry: Arc<PoolRegistry>,
    pub api_key: Arc<str>,
    pub started: Instant,
}

impl AdminState {
    pub fn new(registry: Arc<PoolRegistry>, api_key: &str) -> Self {
        Self {
            registry,
            api_key: Arc::from(api_key),
            started: Instant::now(),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/pools", get(get_pools))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header::AUTHORIZATION, Request, StatusCode};
    use tower::ServiceExt;

    use crate::fastcgi::{BackendAddr, PoolOptions};

    fn router() -> Router {
        let registry = Arc::new(PoolRegistry::new());
        registry.get_or_create(BackendAddr::tcp("127.0.0.1:9000"), 2, &PoolOptions::default());
        setup_admin_router(AdminState::new(registry, "s3cret"))
    }

    #[tokio::test]
    async fn missing_key_is_unauthorized() {
        let res = router()
            .oneshot(Request::get("/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = router()
            .oneshot(
                Request::get("/admin/status")
                    .header(AUTHORIZATION, "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn pools_are_listed() {
        let res = router()
            .oneshot(
                Request::get("/admin/pools")
                    .header(AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let pools: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(pools[0]["backend"], "tcp:127.0.0.1:9000");
        assert_eq!(pools[0]["capacity"], 2);
        assert_eq!(pools[0]["leased"], 0);
        assert_eq!(pools[0]["clients"].as_array().unwrap().len(), 2);
    }
}
