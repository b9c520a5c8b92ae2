//! HTTP to FastCGI adapter.
//!
//! # Responsibilities
//! - Derive the CGI environment from an inbound HTTP request
//! - Lease a client from the pool and dispatch by method
//! - Turn the responder output back into an HTTP response
//!
//! # Data Flow
//! ```text
//! Request<Body> -> decode path -> build_env -> buffer body
//!     -> Pool::acquire -> Client::{get,head,options,post} -> Response<Body>
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use axum::http::{HeaderName, Method, Request, Response};

use crate::fastcgi::error::{FcgiError, FcgiResult};
use crate::fastcgi::pool::Pool;

/// Inserted as a request extension by whatever terminated TLS in front of
/// the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsInfo {
    /// Wire value of the negotiated version, e.g. `0x0304` for TLS 1.3.
    pub protocol_version: u16,
}

impl TlsInfo {
    /// mod_ssl style protocol name.
    pub fn ssl_protocol(&self) -> Option<&'static str> {
        match self.protocol_version {
            0x0301 => Some("TLSv1"),
            0x0302 => Some("TLSv1.1"),
            0x0303 => Some("TLSv1.2"),
            0x0304 => Some("TLSv1.3"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Document root scripts are resolved against.
    pub root: PathBuf,
    /// Markers ending the script part of the path, matched case-insensitively
    /// in order. Empty means the path is never split.
    pub split_path: Vec<String>,
    /// Canonicalize the root per request so symlink swaps are picked up.
    pub resolve_root_symlink: bool,
    /// Extra variables passed to every request.
    pub env: HashMap<String, String>,
    pub server_software: String,
    /// Timeout attached to each FastCGI request.
    pub call_timeout: Duration,
    pub max_body_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/www/html"),
            split_path: vec![".php".to_string()],
            resolve_root_symlink: false,
            env: HashMap::new(),
            server_software: format!("fcgi-gateway/{}", env!("CARGO_PKG_VERSION")),
            call_timeout: Duration::from_secs(5),
            max_body_size: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
pub struct Transport {
    config: TransportConfig,
    pool: Arc<Pool>,
}

impl Transport {
    pub fn new(config: TransportConfig, pool: Arc<Pool>) -> Self {
        Self { config, pool }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Forward one HTTP request to the responder.
    pub async fn round_trip(&self, req: Request<Body>) -> FcgiResult<Response<Body>> {
        // Body is not Sync; only the head may be borrowed across build_env
        let (parts, body) = req.into_parts();
        let head_only = Request::from_parts(parts, ());
        let env = self.build_env(&head_only).await?;
        let (parts, ()) = head_only.into_parts();

        let body = axum::body::to_bytes(body, self.config.max_body_size)
            .await
            .map_err(|e| FcgiError::InvalidRequest(format!("reading request body: {e}")))?;

        let client = self.pool.acquire().await?;
        let mut fcgi = client.new_request();
        fcgi.set_timeout(self.config.call_timeout).set_params(env);

        tracing::debug!(
            client_id = client.id(),
            request_id = fcgi.id(),
            method = %parts.method,
            script = fcgi.param("SCRIPT_FILENAME").unwrap_or_default(),
            "forwarding to fastcgi"
        );

        let head = parts.method == Method::HEAD;
        let response = match parts.method {
            Method::GET => client.get(&mut fcgi, body).await?,
            Method::HEAD => client.head(&mut fcgi).await?,
            Method::OPTIONS => client.options(&mut fcgi).await?,
            ref method => {
                let content_type = parts
                    .headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                client.post(&mut fcgi, method.as_str(), content_type, body).await?
            }
        };
        Ok(response.into_http_response(head))
    }

    /// The CGI environment for `req`.
    pub async fn build_env<B>(&self, req: &Request<B>) -> FcgiResult<HashMap<String, String>> {
        let path = decode_path(req.uri().path())?;

        let mut root = std::path::absolute(&self.config.root)
            .map_err(|e| FcgiError::Environment(format!("document root: {e}")))?;
        if self.config.resolve_root_symlink {
            root = tokio::fs::canonicalize(&root)
                .await
                .map_err(|e| FcgiError::Environment(format!("resolving {}: {e}", root.display())))?;
        }

        Ok(self.cgi_env(req, &root.to_string_lossy(), &path))
    }

    fn cgi_env<B>(&self, req: &Request<B>, root: &str, path: &str) -> HashMap<String, String> {
        let (doc_uri, path_info) = match self.split_pos(path) {
            Some(pos) => path.split_at(pos),
            None => (path, ""),
        };
        let mut script_name = doc_uri.to_string();
        let script_filename = join_clean(root, &script_name);
        if !script_name.is_empty() && !script_name.starts_with('/') {
            script_name.insert(0, '/');
        }

        let (remote_ip, remote_port) = match req.extensions().get::<ConnectInfo<SocketAddr>>() {
            Some(ConnectInfo(addr)) => (addr.ip().to_string(), addr.port().to_string()),
            None => (String::new(), String::new()),
        };

        let tls = req.extensions().get::<TlsInfo>();
        let scheme = if tls.is_some() { "https" } else { "http" };

        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()))
            .unwrap_or_default();
        let (server_name, server_port) = split_host_port(host);
        let server_port = server_port.unwrap_or(if tls.is_some() { "443" } else { "80" });

        let header = |name: HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let remote_user = req
            .uri()
            .authority()
            .and_then(|a| a.as_str().rsplit_once('@'))
            .map(|(user, _)| user.to_string())
            .unwrap_or_default();

        let mut env: HashMap<String, String> = [
            ("AUTH_TYPE", String::new()),
            ("CONTENT_LENGTH", header(CONTENT_LENGTH)),
            ("CONTENT_TYPE", header(CONTENT_TYPE)),
            ("GATEWAY_INTERFACE", "CGI/1.1".to_string()),
            ("PATH_INFO", path_info.to_string()),
            ("QUERY_STRING", req.uri().query().unwrap_or_default().to_string()),
            ("REMOTE_ADDR", remote_ip.clone()),
            ("REMOTE_HOST", remote_ip),
            ("REMOTE_PORT", remote_port),
            ("REMOTE_IDENT", String::new()),
            ("REMOTE_USER", remote_user),
            ("REQUEST_METHOD", req.method().to_string()),
            ("REQUEST_SCHEME", scheme.to_string()),
            ("SERVER_NAME", server_name.to_string()),
            ("SERVER_PORT", server_port.to_string()),
            ("SERVER_PROTOCOL", format!("{:?}", req.version())),
            ("SERVER_SOFTWARE", self.config.server_software.clone()),
            ("DOCUMENT_ROOT", root.to_string()),
            ("DOCUMENT_URI", doc_uri.to_string()),
            ("HTTP_HOST", host.to_string()),
            (
                "REQUEST_URI",
                req.uri()
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/")
                    .to_string(),
            ),
            ("SCRIPT_FILENAME", script_filename),
            ("SCRIPT_NAME", script_name),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        if !path_info.is_empty() {
            env.insert("PATH_TRANSLATED".into(), join_clean(root, path_info));
        }

        if let Some(tls) = tls {
            env.insert("HTTPS".into(), "on".into());
            if let Some(protocol) = tls.ssl_protocol() {
                env.insert("SSL_PROTOCOL".into(), protocol.into());
            }
        }

        for (key, value) in &self.config.env {
            env.insert(key.clone(), value.clone());
        }

        for name in req.headers().keys() {
            let values: Vec<_> = req
                .headers()
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            let key: String = name
                .as_str()
                .chars()
                .map(|c| match c {
                    '-' | ' ' => '_',
                    c => c.to_ascii_uppercase(),
                })
                .collect();
            env.insert(format!("HTTP_{key}"), values.join(", "));
        }

        env
    }

    /// Byte offset just past the first matching split marker.
    fn split_pos(&self, path: &str) -> Option<usize> {
        let lower = path.to_ascii_lowercase();
        self.config.split_path.iter().find_map(|marker| {
            lower
                .find(&marker.to_ascii_lowercase())
                .map(|idx| idx + marker.len())
        })
    }
}

/// Percent-decode a request path, refusing null bytes and invalid UTF-8.
fn decode_path(raw: &str) -> FcgiResult<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let decoded = match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            }
            _ => None,
        };
        match decoded {
            Some(b) => {
                out.push(b);
                i += 3;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }

    if out.contains(&0) {
        return Err(FcgiError::InvalidRequest("invalid request path".into()));
    }
    String::from_utf8(out).map_err(|_| FcgiError::InvalidRequest("request path is not UTF-8".into()))
}

/// `root` joined with `rel`, where `rel` is cleaned as a rooted path first so
/// `..` cannot climb above the root.
fn join_clean(root: &str, rel: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in rel.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let root = root.trim_end_matches('/');
    if segments.is_empty() {
        return if root.is_empty() { "/".to_string() } else { root.to_string() };
    }
    let mut joined = PathBuf::from(if root.is_empty() { "/" } else { root });
    joined.extend(segments);
    joined.to_string_lossy().into_owned()
}

fn split_host_port(host: &str) -> (&str, Option<&str>) {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((ip, tail)) = rest.split_once(']') {
            if let Some(port) = tail.strip_prefix(':') {
                return (ip, Some(port));
            }
        }
        return (host, None);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => (name, Some(port)),
        _ => (host, None),
    }
}
