//! End-to-end: HTTP client → gateway → mock FastCGI responder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fcgi_gateway::config::GatewayConfig;
use fcgi_gateway::fastcgi::{Pool, PoolOptions, PoolRegistry};
use fcgi_gateway::lifecycle::{Gateway, Shutdown};
use tokio::net::TcpListener;

mod common;
use common::{echo_output, Behavior, MockResponder};

struct Running {
    addr: SocketAddr,
    shutdown: Shutdown,
    registry: Arc<PoolRegistry>,
}

impl Running {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn pool(&self) -> Arc<Pool> {
        self.registry.pools()[0].clone()
    }
}

fn config_for(pass: String) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.fastcgi.pass = pass;
    config.fastcgi.root = "/srv/www".into();
    config.fastcgi.pool_size = 2;
    config.fastcgi.call_timeout_secs = 1;
    config.fastcgi.watchdog_interval_ms = 20;
    config.fastcgi.env.insert("APP_ENV".into(), "test".into());
    config.observability.metrics_enabled = false;
    config
}

async fn start(config: GatewayConfig) -> Running {
    let registry = Arc::new(PoolRegistry::new());
    let gateway = Gateway::new(config, registry.clone()).unwrap();
    let shutdown = gateway.shutdown();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        gateway.serve(listener).await.unwrap();
    });

    Running {
        addr,
        shutdown,
        registry,
    }
}

fn http() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn get_maps_request_to_cgi_environment() {
    let mock = MockResponder::echo().await;
    let gw = start(config_for(format!("tcp:{}", mock.addr))).await;

    let res = http()
        .get(gw.url("/blog/index.php/2024/post?lang=en"))
        .header("user-agent", "gateway-test")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert!(res.headers().contains_key("x-request-id"));
    assert_eq!(res.headers()["x-script"], "/blog/index.php");
    assert_eq!(res.text().await.unwrap(), "GET /srv/www/blog/index.php lang=en ");

    let seen = &mock.requests()[0];
    assert_eq!(seen.params["PATH_INFO"], "/2024/post");
    assert_eq!(seen.params["PATH_TRANSLATED"], "/srv/www/2024/post");
    assert_eq!(seen.params["DOCUMENT_ROOT"], "/srv/www");
    assert_eq!(seen.params["REQUEST_URI"], "/blog/index.php/2024/post?lang=en");
    assert_eq!(seen.params["REMOTE_ADDR"], "127.0.0.1");
    assert_eq!(seen.params["SERVER_PORT"], gw.addr.port().to_string());
    assert_eq!(seen.params["HTTP_USER_AGENT"], "gateway-test");
    assert_eq!(seen.params["APP_ENV"], "test");
    assert!(seen.params.contains_key("HTTP_X_REQUEST_ID"));

    gw.shutdown.trigger();
}

#[tokio::test]
async fn post_body_reaches_stdin() {
    let mock = MockResponder::echo().await;
    let gw = start(config_for(format!("tcp:{}", mock.addr))).await;

    let res = http()
        .post(gw.url("/form.php"))
        .header("content-type", "application/json")
        .body(r#"{"name":"ann"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), r#"POST /srv/www/form.php  {"name":"ann"}"#);
    let seen = &mock.requests()[0];
    assert_eq!(seen.params["CONTENT_TYPE"], "application/json");
    assert_eq!(seen.params["CONTENT_LENGTH"], "14");
}

#[tokio::test]
async fn cgi_status_header_sets_response_status() {
    let mock = MockResponder::start(|_, _| {
        Behavior::Reply("Status: 404 Not Found\r\nContent-Type: text/html\r\n\r\nmissing".into())
    })
    .await;
    let gw = start(config_for(format!("tcp:{}", mock.addr))).await;

    let res = http().get(gw.url("/nope.php")).send().await.unwrap();
    assert_eq!(res.status(), 404);
    assert_eq!(res.headers()["content-type"], "text/html");
    assert_eq!(res.text().await.unwrap(), "missing");
}

#[tokio::test]
async fn head_response_has_no_body() {
    let mock = MockResponder::echo().await;
    let gw = start(config_for(format!("tcp:{}", mock.addr))).await;

    let res = http().head(gw.url("/index.php")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(mock.requests()[0].params["REQUEST_METHOD"], "HEAD");
    assert!(res.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn script_errors_become_bad_gateway() {
    let mock = MockResponder::start(|_, _| Behavior::Stderr("PHP Parse error".into())).await;
    let gw = start(config_for(format!("tcp:{}", mock.addr))).await;

    let res = http().get(gw.url("/broken.php")).send().await.unwrap();
    assert_eq!(res.status(), 502);
    assert_eq!(res.text().await.unwrap(), "Bad Gateway");
}

#[tokio::test]
async fn stalled_backend_times_out() {
    let mock = MockResponder::start(|_, _| Behavior::Stall(Duration::from_secs(30))).await;
    let gw = start(config_for(format!("tcp:{}", mock.addr))).await;

    let res = http().get(gw.url("/slow.php")).send().await.unwrap();
    assert_eq!(res.status(), 504);
    assert_eq!(gw.pool().stats().connected, 0);
}

#[tokio::test]
async fn unreachable_backend_is_bad_gateway() {
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = dead.local_addr().unwrap();
    drop(dead);

    let gw = start(config_for(format!("tcp:{addr}"))).await;
    let res = http().get(gw.url("/index.php")).send().await.unwrap();
    assert_eq!(res.status(), 502);
}

#[tokio::test]
async fn concurrent_requests_share_the_pool() {
    let mock = MockResponder::start(|_, req| Behavior::Reply(echo_output(req))).await;
    let gw = start(config_for(format!("tcp:{}", mock.addr))).await;
    let client = http();

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let client = client.clone();
            let url = gw.url(&format!("/index.php?n={i}"));
            tokio::spawn(async move { client.get(url).send().await.unwrap().text().await.unwrap() })
        })
        .collect();
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), format!("GET /srv/www/index.php n={i} "));
    }

    assert!(mock.accepts() <= 2, "pool of 2 opened {} connections", mock.accepts());
    let stats = gw.pool().stats();
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.capacity, 2);
}

#[tokio::test]
async fn shutdown_closes_backend_connections() {
    let mock = MockResponder::echo().await;
    let gw = start(config_for(format!("tcp:{}", mock.addr))).await;

    http().get(gw.url("/index.php")).send().await.unwrap();
    assert_eq!(gw.pool().stats().connected, 1);

    gw.shutdown.trigger();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = gw.pool().stats();
    assert!(stats.closed);
    assert_eq!(stats.connected, 0);
}

#[tokio::test]
async fn registry_pool_serves_direct_clients() {
    let mock = MockResponder::echo().await;
    let registry = PoolRegistry::new();
    let pool = registry.get_or_create(mock.backend(), 1, &PoolOptions::default());

    let client = pool.acquire().await.unwrap();
    let mut req = client.new_request();
    req.set_param("SCRIPT_FILENAME", "/srv/www/a.php");
    let res = client.get(&mut req, Default::default()).await.unwrap();
    assert_eq!(res.body().as_ref(), b"GET /srv/www/a.php  ");
    drop(client);

    assert!(Arc::ptr_eq(
        &pool,
        &registry.get_or_create(mock.backend(), 1, &PoolOptions::default())
    ));
}
