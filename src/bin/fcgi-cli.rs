use std::io::Write;
use std::path::PathBuf;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

use fcgi_gateway::fastcgi::protocol::{FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS};
use fcgi_gateway::fastcgi::{BackendAddr, FcgiResponse, PoolOptions, PoolRegistry};

#[derive(Parser)]
#[command(name = "fcgi-cli")]
#[command(about = "Talk to a FastCGI responder or a running gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request straight to a FastCGI responder
    Request {
        /// Backend, e.g. "tcp:127.0.0.1:9000" or "unix:/run/php/php-fpm.sock"
        #[arg(short, long)]
        pass: String,
        /// Script to run (SCRIPT_FILENAME)
        script: PathBuf,
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        #[arg(short, long, default_value = "")]
        query: String,
        /// Extra parameter as NAME=VALUE, repeatable
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Request body
        #[arg(short, long)]
        body: Option<String>,
        #[arg(long, default_value = "application/x-www-form-urlencoded")]
        content_type: String,
    },
    /// Ask a responder for its FCGI_GET_VALUES limits
    Probe {
        #[arg(short, long)]
        pass: String,
    },
    /// Gateway status from the admin API
    Status {
        #[arg(short, long, default_value = "http://localhost:8081")]
        url: String,
        #[arg(short, long)]
        key: String,
    },
    /// Pool state from the admin API
    Pools {
        #[arg(short, long, default_value = "http://localhost:8081")]
        url: String,
        #[arg(short, long)]
        key: String,
    },
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected NAME=VALUE, got {s:?}"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Request {
            pass,
            script,
            method,
            query,
            params,
            body,
            content_type,
        } => {
            let addr: BackendAddr = pass.parse()?;
            let pool = PoolRegistry::global().get_or_create(addr, 1, &PoolOptions::default());
            let client = pool.acquire().await?;

            let script = std::path::absolute(&script)?;
            let mut req = client.new_request();
            req.set_param("SCRIPT_FILENAME", script.to_string_lossy())
                .set_param("SCRIPT_NAME", script.to_string_lossy())
                .set_param("QUERY_STRING", query)
                .set_param("SERVER_PROTOCOL", "HTTP/1.1")
                .set_param("GATEWAY_INTERFACE", "CGI/1.1");
            for (name, value) in params {
                req.set_param(name, value);
            }

            let body = body.map(Bytes::from).unwrap_or_default();
            let response = match method.to_ascii_uppercase().as_str() {
                "GET" => client.get(&mut req, body).await?,
                "HEAD" => client.head(&mut req).await?,
                "OPTIONS" => client.options(&mut req).await?,
                other => client.post(&mut req, other, &content_type, body).await?,
            };
            print_fcgi_response(&response)?;
            pool.close().await;
        }
        Commands::Probe { pass } => {
            let addr: BackendAddr = pass.parse()?;
            let pool = PoolRegistry::global().get_or_create(addr, 1, &PoolOptions::default());
            let client = pool.acquire().await?;
            let values = client
                .query_values(&[FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS])
                .await?;
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        Commands::Status { url, key } => admin_get(&url, &key, "/admin/status").await?,
        Commands::Pools { url, key } => admin_get(&url, &key, "/admin/pools").await?,
    }

    Ok(())
}

fn print_fcgi_response(response: &FcgiResponse) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(
        out,
        "{} {}",
        response.status.as_u16(),
        response
            .reason
            .as_deref()
            .or(response.status.canonical_reason())
            .unwrap_or_default()
    )?;
    for (name, value) in &response.headers {
        writeln!(out, "{}: {}", name, String::from_utf8_lossy(value.as_bytes()))?;
    }
    writeln!(out)?;
    out.write_all(response.body())?;
    out.flush()
}

async fn admin_get(url: &str, key: &str, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {key}"))?);

    let res = reqwest::Client::new()
        .get(format!("{url}{path}"))
        .headers(headers)
        .send()
        .await?;

    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {status}");
        if let Ok(text) = res.text().await {
            eprintln!("Response: {text}");
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
