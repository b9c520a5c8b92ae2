//! FastCGI gateway.
//!
//! ```text
//!     Client Request                                          PHP-FPM / any
//!     ──────────▶ http server ──▶ transport ──▶ pool ──▶ client ──▶ FastCGI
//!     ◀────────── (axum)          (CGI env)     (lease)  (records)  responder
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use fcgi_gateway::config::{load_config, GatewayConfig};
use fcgi_gateway::fastcgi::PoolRegistry;
use fcgi_gateway::lifecycle::Gateway;
use fcgi_gateway::observability::logging::init_logging;

#[derive(Parser)]
#[command(name = "fcgi-gateway")]
#[command(about = "HTTP to FastCGI gateway", long_about = None)]
struct Args {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override fastcgi.pass, e.g. "tcp:127.0.0.1:9000".
    #[arg(long)]
    pass: Option<String>,

    /// Override fastcgi.root.
    #[arg(long)]
    root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(pass) = args.pass {
        config.fastcgi.pass = pass;
    }
    if let Some(root) = args.root {
        config.fastcgi.root = root;
    }

    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "fcgi-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        pass = %config.fastcgi.pass,
        pool_size = config.fastcgi.pool_size,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    let gateway = Gateway::new(config, Arc::new(PoolRegistry::new()))?;
    gateway.run().await?;
    Ok(())
}
