//! Fixed-capacity client pools.
//!
//! # Responsibilities
//! - Own a fixed set of clients for one backend
//! - Hand each client to at most one caller at a time
//! - Share pools between callers addressing the same backend
//!
//! # Design Decisions
//! - A semaphore with one permit per client bounds the wait; a lease flag per
//!   client picks which one. Holding a permit guarantees a free lease exists.
//! - Selection starts from a rotating cursor so load spreads round-robin
//! - Registries are plain values; `PoolRegistry::global()` is only a default

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::fastcgi::client::{Client, ClientOptions, ClientSnapshot};
use crate::fastcgi::error::{FcgiError, FcgiResult};
use crate::fastcgi::request::RequestIdCounter;
use crate::fastcgi::stream::BackendAddr;
use crate::observability::metrics;

/// Identity of a pool: the backend plus its fixed size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub addr: BackendAddr,
    pub capacity: usize,
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub client: ClientOptions,
    /// Longest a caller waits for a free client.
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            client: ClientOptions::default(),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub backend: String,
    pub capacity: usize,
    pub leased: usize,
    pub connected: usize,
    pub closed: bool,
    pub clients: Vec<ClientSnapshot>,
}

#[derive(Debug)]
pub struct Pool {
    key: PoolKey,
    clients: Vec<Client>,
    leases: Vec<AtomicBool>,
    permits: Arc<Semaphore>,
    cursor: AtomicUsize,
    acquire_timeout: Duration,
}

impl Pool {
    pub fn new(addr: BackendAddr, capacity: usize, options: &PoolOptions, ids: Arc<RequestIdCounter>) -> Self {
        let clients = (0..capacity)
            .map(|_| Client::new(addr.clone(), options.client.clone(), ids.clone()))
            .collect();
        tracing::info!(backend = %addr, capacity, keep_alive = options.client.keep_alive, "fastcgi pool created");

        Self {
            key: PoolKey { addr, capacity },
            clients,
            leases: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            permits: Arc::new(Semaphore::new(capacity)),
            cursor: AtomicUsize::new(0),
            acquire_timeout: options.acquire_timeout,
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn backend(&self) -> &BackendAddr {
        &self.key.addr
    }

    pub fn capacity(&self) -> usize {
        self.key.capacity
    }

    /// Lease a client. Waits up to the acquire timeout for one to come back.
    pub async fn acquire(self: &Arc<Self>) -> FcgiResult<PooledClient> {
        let started = Instant::now();
        let addr = &self.key.addr;

        let permit = match tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(FcgiError::PoolClosed(addr.to_string())),
            Err(_) => {
                tracing::warn!(backend = %addr, timeout = ?self.acquire_timeout, "no free fastcgi client");
                return Err(FcgiError::PoolExhausted(addr.to_string(), self.acquire_timeout));
            }
        };

        let len = self.leases.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..len {
            let index = (start + i) % len;
            if self.leases[index]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                metrics::record_pool_acquire(addr, started);
                return Ok(PooledClient {
                    pool: self.clone(),
                    index,
                    _permit: permit,
                });
            }
        }

        tracing::error!(backend = %addr, "permit held but every client leased");
        Err(FcgiError::PoolExhausted(addr.to_string(), self.acquire_timeout))
    }

    pub fn stats(&self) -> PoolStats {
        let clients: Vec<_> = self.clients.iter().map(Client::snapshot).collect();
        PoolStats {
            backend: self.key.addr.to_string(),
            capacity: self.key.capacity,
            leased: self.leases.iter().filter(|l| l.load(Ordering::Acquire)).count(),
            connected: clients.iter().filter(|c| c.available).count(),
            closed: self.permits.is_closed(),
            clients,
        }
    }

    /// Refuse further acquisitions and close every connection. Calls already
    /// running finish first.
    pub async fn close(&self) {
        self.permits.close();
        for client in &self.clients {
            client.close().await;
        }
        tracing::info!(backend = %self.key.addr, "fastcgi pool closed");
    }
}

/// A leased client; returns to the pool on drop.
#[derive(Debug)]
pub struct PooledClient {
    pool: Arc<Pool>,
    index: usize,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.pool.clients[self.index]
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        // lease first, the permit is released after this runs
        self.pool.leases[self.index].store(false, Ordering::Release);
    }
}

/// Shared pools keyed by backend and capacity. Pools from one registry draw
/// request ids from one counter.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: DashMap<PoolKey, Arc<Pool>>,
    ids: Arc<RequestIdCounter>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry.
    pub fn global() -> &'static PoolRegistry {
        static GLOBAL: OnceLock<PoolRegistry> = OnceLock::new();
        GLOBAL.get_or_init(PoolRegistry::new)
    }

    /// The pool for `(addr, capacity)`, built on first use. Options only
    /// apply to the call that builds it.
    pub fn get_or_create(&self, addr: BackendAddr, capacity: usize, options: &PoolOptions) -> Arc<Pool> {
        let key = PoolKey {
            addr: addr.clone(),
            capacity,
        };
        self.pools
            .entry(key)
            .or_insert_with(|| Arc::new(Pool::new(addr, capacity, options, self.ids.clone())))
            .value()
            .clone()
    }

    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.pools.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub async fn close_all(&self) {
        for pool in self.pools() {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn options(acquire_timeout: Duration) -> PoolOptions {
        PoolOptions {
            acquire_timeout,
            ..PoolOptions::default()
        }
    }

    #[tokio::test]
    async fn same_key_shares_one_pool() {
        let registry = PoolRegistry::new();
        let opts = PoolOptions::default();
        let a = registry.get_or_create(BackendAddr::unix("/run/php/php8.2-fpm.sock"), 5, &opts);
        let b = registry.get_or_create(BackendAddr::unix("/run/php/php8.2-fpm.sock"), 5, &opts);
        let c = registry.get_or_create(BackendAddr::unix("/run/php/php8.2-fpm.sock"), 3, &opts);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
        assert_eq!(a.stats().clients.len(), 5);
    }

    #[tokio::test]
    async fn concurrent_leases_are_exclusive() {
        let pool = Arc::new(Pool::new(
            BackendAddr::tcp("127.0.0.1:9000"),
            3,
            &options(Duration::from_secs(5)),
            Arc::new(RequestIdCounter::new()),
        ));
        let held: Arc<HashMap<u64, AtomicBool>> = Arc::new(
            pool.stats()
                .clients
                .iter()
                .map(|c| (c.id, AtomicBool::new(false)))
                .collect(),
        );
        let seen = Arc::new(Mutex::new(std::collections::HashSet::new()));

        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let pool = pool.clone();
                let held = held.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    let client = pool.acquire().await.unwrap();
                    assert!(!held[&client.id()].swap(true, Ordering::SeqCst), "client leased twice");
                    seen.lock().unwrap().insert(client.id());
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    held[&client.id()].store(false, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(seen.lock().unwrap().len() <= 3);
        assert_eq!(pool.stats().leased, 0);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let pool = Arc::new(Pool::new(
            BackendAddr::tcp("127.0.0.1:9000"),
            1,
            &options(Duration::from_millis(50)),
            Arc::new(RequestIdCounter::new()),
        ));
        let first = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, FcgiError::PoolExhausted(..)));

        drop(first);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn closed_pool_refuses_leases() {
        let pool = Arc::new(Pool::new(
            BackendAddr::tcp("127.0.0.1:9000"),
            2,
            &PoolOptions::default(),
            Arc::new(RequestIdCounter::new()),
        ));
        pool.close().await;
        assert!(pool.stats().closed);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, FcgiError::PoolClosed(_)));
    }
}
