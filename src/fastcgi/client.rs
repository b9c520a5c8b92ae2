//! One backend connection and the policy around it.
//!
//! # Responsibilities
//! - Serialize calls on the connection with an exclusive lock
//! - Retry exactly once after a lost connection
//! - Reclaim idle or overrunning connections from a background watchdog
//! - Offer verb-shaped helpers that fill in the request line parameters
//!
//! # Design Decisions
//! - The watchdog is owned by the client and stops when the client drops
//! - An overrunning call is torn down with its connection; no ABORT_REQUEST is sent
//! - Transient (non keep-alive) clients dial per call and close afterwards

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard, Notify};
use tokio::time::{self, MissedTickBehavior};

use crate::fastcgi::error::{FcgiError, FcgiResult};
use crate::fastcgi::protocol::{self, RecordType, NULL_REQUEST_ID};
use crate::fastcgi::request::{Request, RequestIdCounter};
use crate::fastcgi::response::FcgiResponse;
use crate::fastcgi::stream::{BackendAddr, BackendStream};
use crate::observability::metrics;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Connection policy for a client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Keep the connection open between calls and set KEEP_CONN.
    pub keep_alive: bool,
    pub dial_timeout: Duration,
    /// Deadline applied after every call; an idle connection older than
    /// this is closed by the watchdog.
    pub idle_timeout: Duration,
    /// How often the watchdog checks the deadline.
    pub watchdog_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            keep_alive: true,
            dial_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(86_400),
            watchdog_interval: Duration::from_secs(1),
        }
    }
}

/// Point-in-time view of a client, for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub id: u64,
    pub free: bool,
    pub available: bool,
}

struct Shared {
    id: u64,
    addr: BackendAddr,
    options: ClientOptions,
    conn: AsyncMutex<Option<BackendStream>>,
    free: AtomicBool,
    available: AtomicBool,
    expiry: Mutex<Instant>,
    kill: Notify,
    /// Set when the watchdog fires on a locked connection. Outlives the
    /// notification so a kill that lands between attempts is not lost.
    expired: AtomicBool,
}

impl Shared {
    fn set_expiry(&self, deadline: Instant) {
        *self.expiry.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    fn relax_expiry(&self) {
        self.set_expiry(Instant::now() + self.options.idle_timeout);
    }

    /// Drop the connection if the deadline has passed.
    fn check_expiry(&self) {
        let now = Instant::now();
        {
            let mut expiry = self.expiry.lock().unwrap_or_else(PoisonError::into_inner);
            if now < *expiry {
                return;
            }
            *expiry = now + self.options.idle_timeout;
        }

        match self.conn.try_lock() {
            Ok(mut conn) => {
                if conn.take().is_some() {
                    self.available.store(false, Ordering::Release);
                    metrics::record_watchdog_close(&self.addr);
                    tracing::warn!(client_id = self.id, backend = %self.addr, "closing expired idle connection");
                }
            }
            Err(_) => {
                metrics::record_watchdog_close(&self.addr);
                tracing::warn!(client_id = self.id, backend = %self.addr, "call overran its deadline, closing connection");
                self.expired.store(true, Ordering::Release);
                self.kill.notify_waiters();
            }
        }
    }
}

/// Marks the client busy for the lifetime of a call.
struct BusyGuard<'a>(&'a Shared);

impl<'a> BusyGuard<'a> {
    fn new(shared: &'a Shared) -> Self {
        shared.free.store(false, Ordering::Release);
        Self(shared)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.free.store(true, Ordering::Release);
    }
}

/// The locked connection for one call. If the call future is dropped
/// before `settle`, the stream may hold half a request or half a reply,
/// so it is discarded instead of going back for reuse.
struct ConnSlot<'a> {
    shared: &'a Shared,
    conn: MutexGuard<'a, Option<BackendStream>>,
    settled: bool,
}

impl<'a> ConnSlot<'a> {
    async fn lock(shared: &'a Shared) -> Self {
        let conn = shared.conn.lock().await;
        Self {
            shared,
            conn,
            settled: false,
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for ConnSlot<'_> {
    fn drop(&mut self) {
        if !self.settled && self.conn.take().is_some() {
            self.shared.available.store(false, Ordering::Release);
            tracing::debug!(
                client_id = self.shared.id,
                backend = %self.shared.addr,
                "call cancelled, discarding connection"
            );
        }
    }
}

/// A FastCGI client bound to one backend.
pub struct Client {
    shared: Arc<Shared>,
    ids: Arc<RequestIdCounter>,
    _stop: watch::Sender<()>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.shared.id)
            .field("backend", &self.shared.addr)
            .field("free", &self.is_free())
            .field("available", &self.is_available())
            .finish()
    }
}

impl Client {
    /// Create a client. Nothing is dialed until `connect` or the first call.
    ///
    /// The watchdog runs on the current tokio runtime; outside a runtime
    /// the client works without one.
    pub fn new(addr: BackendAddr, options: ClientOptions, ids: Arc<RequestIdCounter>) -> Self {
        let shared = Arc::new(Shared {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            expiry: Mutex::new(Instant::now() + options.idle_timeout),
            addr,
            options,
            conn: AsyncMutex::new(None),
            free: AtomicBool::new(true),
            available: AtomicBool::new(false),
            kill: Notify::new(),
            expired: AtomicBool::new(false),
        });

        let (stop, stopped) = watch::channel(());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(watchdog(shared.clone(), stopped));
            }
            Err(_) => tracing::warn!(
                client_id = shared.id,
                backend = %shared.addr,
                "no tokio runtime, idle watchdog disabled"
            ),
        }

        Self {
            shared,
            ids,
            _stop: stop,
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn backend(&self) -> &BackendAddr {
        &self.shared.addr
    }

    pub fn is_keep_alive(&self) -> bool {
        self.shared.options.keep_alive
    }

    /// No call is running on this client.
    pub fn is_free(&self) -> bool {
        self.shared.free.load(Ordering::Acquire)
    }

    /// The client holds an open connection.
    pub fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            id: self.id(),
            free: self.is_free(),
            available: self.is_available(),
        }
    }

    /// A fresh request drawing its id from this client's counter.
    pub fn new_request(&self) -> Request {
        Request::new(&self.ids)
    }

    async fn dial(&self) -> FcgiResult<BackendStream> {
        let shared = &self.shared;
        match shared.addr.dial(shared.options.dial_timeout).await {
            Ok(stream) => {
                tracing::debug!(client_id = shared.id, backend = %shared.addr, "connected");
                shared.available.store(true, Ordering::Release);
                Ok(stream)
            }
            Err(e) => {
                tracing::error!(client_id = shared.id, backend = %shared.addr, error = %e, "connect failed");
                shared.available.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn drop_conn(&self, conn: &mut Option<BackendStream>) {
        if conn.take().is_some() {
            tracing::debug!(client_id = self.shared.id, backend = %self.shared.addr, "connection closed");
        }
        self.shared.available.store(false, Ordering::Release);
    }

    /// Open the connection, replacing any existing one.
    pub async fn connect(&self) -> FcgiResult<()> {
        let mut conn = self.shared.conn.lock().await;
        self.drop_conn(&mut conn);
        *conn = Some(self.dial().await?);
        Ok(())
    }

    /// Close the connection if there is one. Idempotent.
    pub async fn close(&self) {
        let mut conn = self.shared.conn.lock().await;
        if let Some(mut stream) = conn.take() {
            let _ = stream.shutdown().await;
            tracing::debug!(client_id = self.shared.id, backend = %self.shared.addr, "connection closed");
        }
        self.shared.available.store(false, Ordering::Release);
    }

    /// Run `req` on this client's connection.
    ///
    /// Dropping the returned future mid-call discards the connection.
    pub async fn call(&self, req: &mut Request) -> FcgiResult<FcgiResponse> {
        let mut slot = ConnSlot::lock(&self.shared).await;
        let _busy = BusyGuard::new(&self.shared);
        let started = Instant::now();
        self.shared.expired.store(false, Ordering::Release);

        if self.is_keep_alive() {
            req.keep_alive();
        }

        let result = self.call_locked(&mut slot.conn, req).await;
        slot.settle();
        match &result {
            Err(e) if e.poisons_connection() => self.drop_conn(&mut slot.conn),
            Err(_) if req.left_partial_write() => self.drop_conn(&mut slot.conn),
            _ if !self.is_keep_alive() => self.drop_conn(&mut slot.conn),
            _ => {}
        }

        metrics::record_call(&self.shared.addr, &result, started);
        if let Err(e) = &result {
            tracing::warn!(
                client_id = self.shared.id,
                backend = %self.shared.addr,
                request_id = req.id(),
                error = %e,
                "fastcgi call failed"
            );
        }
        result
    }

    async fn call_locked(
        &self,
        conn: &mut Option<BackendStream>,
        req: &mut Request,
    ) -> FcgiResult<FcgiResponse> {
        if conn.is_none() {
            *conn = Some(self.dial().await?);
        }

        match self.exchange(conn, req).await {
            Err(e) if e.is_lost_connection() && req.is_replayable() => {
                tracing::warn!(
                    client_id = self.shared.id,
                    backend = %self.shared.addr,
                    request_id = req.id(),
                    attempt = 2,
                    "lost connection, reconnecting"
                );
                metrics::record_retry(&self.shared.addr);
                self.drop_conn(conn);
                *conn = Some(self.dial().await?);
                req.rearm();
                self.exchange(conn, req).await
            }
            other => other,
        }
    }

    /// One attempt, bounded by the watchdog when the request has a timeout.
    async fn exchange(
        &self,
        conn: &mut Option<BackendStream>,
        req: &mut Request,
    ) -> FcgiResult<FcgiResponse> {
        let stream = conn.as_mut().ok_or(FcgiError::NotConnected)?;

        let killed = self.shared.kill.notified();
        tokio::pin!(killed);
        killed.as_mut().enable();

        if let Some(timeout) = req.timeout() {
            self.shared.set_expiry(Instant::now() + timeout);
        }
        let result = if self.shared.expired.swap(false, Ordering::AcqRel) {
            Err(FcgiError::Expired)
        } else {
            tokio::select! {
                result = req.call_on(stream) => result,
                _ = &mut killed => Err(FcgiError::Expired),
            }
        };
        self.shared.relax_expiry();

        if matches!(result, Err(FcgiError::Expired)) {
            req.abandon();
        }
        result
    }

    /// GET with an optional body.
    pub async fn get(&self, req: &mut Request, body: Bytes) -> FcgiResult<FcgiResponse> {
        req.set_param("REQUEST_METHOD", "GET")
            .set_param("CONTENT_LENGTH", body.len().to_string());
        if !body.is_empty() {
            req.set_body_bytes(body);
        }
        self.call(req).await
    }

    pub async fn head(&self, req: &mut Request) -> FcgiResult<FcgiResponse> {
        req.set_param("REQUEST_METHOD", "HEAD")
            .set_param("CONTENT_LENGTH", "0");
        self.call(req).await
    }

    pub async fn options(&self, req: &mut Request) -> FcgiResult<FcgiResponse> {
        req.set_param("REQUEST_METHOD", "OPTIONS")
            .set_param("CONTENT_LENGTH", "0");
        self.call(req).await
    }

    /// POST-like call. An empty or GET method becomes POST; an empty body
    /// type defaults to form encoding.
    pub async fn post(
        &self,
        req: &mut Request,
        method: &str,
        body_type: &str,
        body: Bytes,
    ) -> FcgiResult<FcgiResponse> {
        let method = match method.to_ascii_uppercase() {
            m if m.is_empty() || m == "GET" => "POST".to_string(),
            m => m,
        };
        let body_type = if body_type.is_empty() {
            "application/x-www-form-urlencoded"
        } else {
            body_type
        };
        req.set_param("REQUEST_METHOD", method)
            .set_param("CONTENT_LENGTH", body.len().to_string())
            .set_param("CONTENT_TYPE", body_type)
            .set_body_bytes(body);
        self.call(req).await
    }

    /// Ask the responder for management variables with a GET_VALUES record.
    pub async fn query_values(&self, names: &[&str]) -> FcgiResult<HashMap<String, String>> {
        let mut content = BytesMut::new();
        for name in names {
            protocol::put_name_value(&mut content, name.as_bytes(), b"");
        }
        let mut out = BytesMut::new();
        protocol::put_record(&mut out, RecordType::GetValues, NULL_REQUEST_ID, &content)?;

        let mut slot = ConnSlot::lock(&self.shared).await;
        let _busy = BusyGuard::new(&self.shared);
        if slot.conn.is_none() {
            *slot.conn = Some(self.dial().await?);
        }

        let result = match slot.conn.as_mut() {
            Some(stream) => read_values(stream, &out).await,
            None => Err(FcgiError::NotConnected),
        };
        slot.settle();

        if result.as_ref().is_err_and(FcgiError::poisons_connection) || !self.is_keep_alive() {
            self.drop_conn(&mut slot.conn);
        }
        result
    }
}

async fn read_values(stream: &mut BackendStream, query: &[u8]) -> FcgiResult<HashMap<String, String>> {
    stream.write_all(query).await?;
    stream.flush().await?;

    let mut body = Vec::new();
    loop {
        let header = protocol::read_header(stream).await?;
        protocol::read_body(stream, &header, &mut body).await?;
        if header.request_id == NULL_REQUEST_ID && header.kind() == Some(RecordType::GetValuesResult) {
            break;
        }
    }
    Ok(protocol::decode_name_values(&body)?.into_iter().collect())
}

async fn watchdog(shared: Arc<Shared>, mut stop: watch::Receiver<()>) {
    let mut ticker = time::interval(shared.options.watchdog_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => shared.check_expiry(),
            _ = stop.changed() => break,
        }
    }
    tracing::trace!(client_id = shared.id, "watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(addr: &str) -> Client {
        Client::new(
            BackendAddr::tcp(addr),
            ClientOptions {
                dial_timeout: Duration::from_millis(500),
                ..ClientOptions::default()
            },
            Arc::new(RequestIdCounter::new()),
        )
    }

    #[tokio::test]
    async fn fresh_client_is_free_and_unconnected() {
        let client = client_for("127.0.0.1:9");
        assert!(client.is_free());
        assert!(!client.is_available());
        client.close().await;
        client.close().await;
        assert!(!client.is_available());
    }

    #[tokio::test]
    async fn failed_dial_leaves_client_free() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = client_for(&addr);
        let mut req = client.new_request();
        let err = client.head(&mut req).await.unwrap_err();
        assert!(matches!(err, FcgiError::Connect { .. }), "{err:?}");
        assert!(client.is_free());
        assert!(!client.is_available());
    }

    #[tokio::test]
    async fn requests_share_the_client_counter() {
        let ids = Arc::new(RequestIdCounter::new());
        let a = Client::new(BackendAddr::tcp("127.0.0.1:9"), ClientOptions::default(), ids.clone());
        let b = Client::new(BackendAddr::tcp("127.0.0.1:9"), ClientOptions::default(), ids);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.new_request().id(), 1);
        assert_eq!(b.new_request().id(), 2);
    }

    #[tokio::test]
    async fn call_futures_are_send() {
        fn assert_send<T: Send>(_: &T) {}

        let client = client_for("127.0.0.1:9");
        let mut req = client.new_request();
        req.set_body(tokio::io::empty(), 0);
        let fut = client.call(&mut req);
        assert_send(&fut);
    }

    #[tokio::test]
    async fn kill_between_attempts_is_not_lost() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = client_for(&listener.local_addr().unwrap().to_string());
        client.connect().await.unwrap();

        let mut conn = client.shared.conn.lock().await;
        client.shared.set_expiry(Instant::now());
        client.shared.check_expiry();
        assert!(client.shared.expired.load(Ordering::Acquire));

        // the responder never answers, so only the flag can end this attempt
        let mut req = client.new_request();
        let result = time::timeout(Duration::from_secs(2), client.exchange(&mut conn, &mut req))
            .await
            .expect("expired attempt must not hang");
        assert!(matches!(result, Err(FcgiError::Expired)), "{result:?}");
        assert!(!client.shared.expired.load(Ordering::Acquire));
    }

    #[test]
    fn client_without_runtime_still_builds() {
        let client = Client::new(
            BackendAddr::tcp("127.0.0.1:9"),
            ClientOptions::default(),
            Arc::new(RequestIdCounter::new()),
        );
        assert!(client.is_free());
    }
}
