//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the pool and transport from a validated configuration
//! - Start the metrics exporter and the admin API when enabled
//! - Bind the front-end listener and serve until shutdown
//! - Close backend connections once traffic has drained
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when ready)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;

use crate::admin::{setup_admin_router, AdminState};
use crate::config::GatewayConfig;
use crate::fastcgi::{FcgiError, PoolRegistry, Transport};
use crate::http::GatewayServer;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::spawn_signal_handler;
use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid backend: {0}")]
    Backend(#[from] FcgiError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("metrics exporter: {0}")]
    Metrics(String),

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// A configured gateway, ready to serve.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<PoolRegistry>,
    transport: Arc<Transport>,
    shutdown: Shutdown,
}

impl Gateway {
    /// Build the backend pool and transport. Nothing is bound yet.
    pub fn new(config: GatewayConfig, registry: Arc<PoolRegistry>) -> Result<Self, StartupError> {
        let fcgi = &config.fastcgi;
        let pool = registry.get_or_create(fcgi.backend()?, fcgi.pool_size, &fcgi.pool_options());
        let transport = Arc::new(Transport::new(
            fcgi.transport_config(config.security.max_body_size),
            pool,
        ));

        Ok(Self {
            config,
            registry,
            transport,
            shutdown: Shutdown::new(),
        })
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Handle for stopping the gateway from outside.
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Serve on the configured address until a signal arrives.
    pub async fn run(self) -> Result<(), StartupError> {
        let addr = self.config.listener.bind_address.clone();
        let listener = bind(&addr).await?;
        spawn_signal_handler(self.shutdown.clone());
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown fires.
    pub async fn serve(self, listener: TcpListener) -> Result<(), StartupError> {
        if self.config.observability.metrics_enabled {
            let addr: SocketAddr = self
                .config
                .observability
                .metrics_address
                .parse()
                .map_err(|e| StartupError::Metrics(format!("{e}")))?;
            metrics::init_metrics(addr)
                .await
                .map_err(|e| StartupError::Metrics(e.to_string()))?;
        }

        if self.config.admin.enabled {
            let admin_listener = bind(&self.config.admin.bind_address).await?;
            let router = setup_admin_router(AdminState::new(self.registry.clone(), &self.config.admin.api_key));
            let stop = self.shutdown.wait();
            tracing::info!(address = %self.config.admin.bind_address, "admin API starting");
            tokio::spawn(async move {
                let served = axum::serve(admin_listener, router)
                    .with_graceful_shutdown(stop)
                    .await;
                if let Err(e) = served {
                    tracing::error!(error = %e, "admin API failed");
                }
            });
        }

        tracing::info!(
            backend = %self.transport.pool().backend(),
            pool_size = self.transport.pool().capacity(),
            root = %self.config.fastcgi.root.display(),
            "gateway ready"
        );

        let server = GatewayServer::new(
            self.transport.clone(),
            Duration::from_secs(self.config.timeouts.request_secs),
        );
        let result = server.run(listener, self.shutdown.clone()).await;

        self.registry.close_all().await;
        tracing::info!("shutdown complete");
        result.map_err(StartupError::from)
    }
}

async fn bind(addr: &str) -> Result<TcpListener, StartupError> {
    TcpListener::bind(addr).await.map_err(|source| StartupError::Bind {
        addr: addr.to_string(),
        source,
    })
}
