//! Bounded pool of clients to a single endpoint.
//!
//! At most `size` clients are alive at any time. Callers either take an
//! idle client from the queue, create a fresh one while under the bound,
//! or park on a semaphore until a client is released. Stale queue entries
//! (disconnected, or left in flight by a leaky caller) are discarded and
//! accounted for by decrementing the live counter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::client::RedisClient;
use crate::config::PoolConfig;
use crate::error::{RedisError, Result};
use crate::resp::types::RedisValue;

/// A bounded set of [`RedisClient`]s to one endpoint.
pub struct RedisPool {
    config: PoolConfig,
    /// Idle clients ready for checkout (sync mutex, held very briefly).
    idle: SyncMutex<VecDeque<Arc<RedisClient>>>,
    /// Clients owned by the pool: idle plus checked out.
    live: AtomicUsize,
    /// Parking lot for acquirers blocked at the bound.
    idle_sem: Semaphore,
    /// Tasks currently blocked on `idle_sem`.
    waiters: AtomicUsize,
}

/// Decrements the waiter count when a blocked acquire scope unwinds,
/// including cancellation while parked on the semaphore.
struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RedisPool {
    /// Create an empty pool. `size` is clamped to at least 1.
    pub fn new(mut config: PoolConfig) -> Self {
        if config.size == 0 {
            config.size = 1;
        }
        let size = config.size;
        Self {
            config,
            idle: SyncMutex::new(VecDeque::with_capacity(size)),
            live: AtomicUsize::new(0),
            idle_sem: Semaphore::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.config.size
    }

    /// Clients currently owned by the pool (idle + checked out).
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Check out a client, creating one while under the bound or waiting
    /// for a release otherwise.
    pub async fn acquire(&self) -> Result<Arc<RedisClient>> {
        loop {
            // 1. idle queue
            if let Some(client) = self.take_idle() {
                return Ok(client);
            }

            // 2. create while under the bound
            if self.try_reserve_slot() {
                let client = Arc::new(RedisClient::new(self.config.redis.clone()));
                match client.connect().await {
                    Ok(()) => return Ok(client),
                    Err(e) => {
                        self.live.fetch_sub(1, Ordering::AcqRel);
                        self.notify_one_waiter();
                        return Err(e);
                    }
                }
            }

            // 3. wait for a release, then re-check from the top
            self.waiters.fetch_add(1, Ordering::AcqRel);
            let _waiter = WaiterGuard(&self.waiters);

            // re-check after registering: a release that saw no waiters
            // must not be missed
            if let Some(client) = self.take_idle() {
                return Ok(client);
            }
            if self.live.load(Ordering::Acquire) < self.config.size {
                continue;
            }

            match self.idle_sem.acquire().await {
                Ok(permit) => permit.forget(),
                // the semaphore is never closed; keep the loop total anyway
                Err(_) => return Err(RedisError::Io("pool semaphore closed".into())),
            }
            // wakeups can be stale: loop and re-check
        }
    }

    /// Return a client to the pool.
    ///
    /// A faulty, disconnected, or still-in-flight client is dropped and
    /// its slot freed; otherwise it goes back on the idle queue.
    pub fn release(&self, client: Arc<RedisClient>, faulty: bool) {
        if faulty || !client.connected() || !client.is_idle() {
            debug!(addr = %self.config.redis.addr(), faulty, "discarding pooled client");
            self.live.fetch_sub(1, Ordering::AcqRel);
            self.notify_one_waiter();
            return;
        }
        self.idle.lock().push_back(client);
        self.notify_one_waiter();
    }

    /// Prewarm: connect clients up to the bound and seed the idle queue.
    /// Fails on the first client that cannot connect.
    pub async fn connect_all(&self) -> Result<()> {
        while self.try_reserve_slot() {
            let client = Arc::new(RedisClient::new(self.config.redis.clone()));
            match client.connect().await {
                Ok(()) => self.idle.lock().push_back(client),
                Err(e) => {
                    self.live.fetch_sub(1, Ordering::AcqRel);
                    self.notify_one_waiter();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Acquire, run one command, release.
    pub async fn command(&self, verb: &str, args: &[&str]) -> Result<RedisValue> {
        let client = self.acquire().await?;
        let result = client.command(verb, args).await;
        let faulty = matches!(result, Err(ref e) if !e.is_server_reply());
        self.release(client, faulty);
        result
    }

    /// Check out a client wrapped in a guard that releases on drop.
    pub async fn acquire_guard(self: &Arc<Self>) -> Result<PooledConn> {
        let client = self.acquire().await?;
        Ok(PooledConn {
            pool: Arc::clone(self),
            client: Some(client),
        })
    }

    // ── internals ──────────────────────────────────────────────────

    /// Pop idle entries until a healthy one turns up. Stale entries are
    /// accounted as discarded (a client found in flight here was leaked
    /// by a caller that never released it).
    fn take_idle(&self) -> Option<Arc<RedisClient>> {
        loop {
            let client = self.idle.lock().pop_front()?;
            if client.is_idle() {
                return Some(client);
            }
            warn!(addr = %self.config.redis.addr(), "dropping stale idle client");
            self.live.fetch_sub(1, Ordering::AcqRel);
            self.notify_one_waiter();
        }
    }

    /// CAS `live` upward while under the bound.
    fn try_reserve_slot(&self) -> bool {
        let mut live = self.live.load(Ordering::Acquire);
        loop {
            if live >= self.config.size {
                return false;
            }
            match self.live.compare_exchange(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => live = current,
            }
        }
    }

    fn notify_one_waiter(&self) {
        if self.waiters.load(Ordering::Acquire) > 0 {
            self.idle_sem.add_permits(1);
        }
    }
}

/// A checked-out client that returns itself to the pool on drop.
pub struct PooledConn {
    pool: Arc<RedisPool>,
    client: Option<Arc<RedisClient>>,
}

impl PooledConn {
    pub fn client(&self) -> &Arc<RedisClient> {
        self.client.as_ref().expect("client already released")
    }

    /// Run one command on the held client.
    pub async fn command(&self, verb: &str, args: &[&str]) -> Result<RedisValue> {
        self.client().command(verb, args).await
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            // release() demotes clients that are no longer idle
            self.pool.release(client, false);
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Mock server answering every command on every connection with +OK.
    async fn mock_redis_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {
                                if socket.write_all(b"+OK\r\n").await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        addr
    }

    fn pool_config(addr: &str, size: usize) -> PoolConfig {
        let (host, port) = addr.rsplit_once(':').unwrap();
        PoolConfig {
            redis: RedisConfig {
                host: host.to_string(),
                port: port.parse().unwrap(),
                connect_timeout_ms: 1000,
                io_timeout_ms: 1000,
                ..RedisConfig::default()
            },
            size,
        }
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses() {
        let addr = mock_redis_server().await;
        let pool = RedisPool::new(pool_config(&addr, 3));

        let client = pool.acquire().await.unwrap();
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.idle_count(), 0);

        pool.release(client, false);
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.idle_count(), 1);

        let _again = pool.acquire().await.unwrap();
        // reused, not recreated
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn live_count_never_exceeds_size() {
        let addr = mock_redis_server().await;
        let pool = Arc::new(RedisPool::new(pool_config(&addr, 2)));

        let c1 = pool.acquire().await.unwrap();
        let c2 = pool.acquire().await.unwrap();
        assert_eq!(pool.live_count(), 2);

        // third acquirer must wait
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err());
        assert_eq!(pool.live_count(), 2);

        pool.release(c1, false);
        let c3 = pool.acquire().await.unwrap();
        assert_eq!(pool.live_count(), 2);

        pool.release(c2, false);
        pool.release(c3, false);
        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let addr = mock_redis_server().await;
        let pool = Arc::new(RedisPool::new(pool_config(&addr, 1)));

        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let client = pool.acquire().await.unwrap();
                pool.release(client, false);
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(held, false);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn faulty_release_frees_slot() {
        let addr = mock_redis_server().await;
        let pool = RedisPool::new(pool_config(&addr, 1));

        let client = pool.acquire().await.unwrap();
        pool.release(client, true);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count(), 0);

        // slot is free again
        let client = pool.acquire().await.unwrap();
        assert_eq!(pool.live_count(), 1);
        pool.release(client, false);
    }

    #[tokio::test]
    async fn stale_idle_client_is_discarded() {
        let addr = mock_redis_server().await;
        let pool = RedisPool::new(pool_config(&addr, 2));

        let client = pool.acquire().await.unwrap();
        client.close().await;
        // releasing a dead client must not requeue it
        pool.release(client, false);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn connect_failure_propagates_and_frees_slot() {
        let pool = RedisPool::new(pool_config("127.0.0.1:1", 1));
        let err = pool.acquire().await.unwrap_err();
        assert!(err.is_io());
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn connect_all_prewarms() {
        let addr = mock_redis_server().await;
        let pool = RedisPool::new(pool_config(&addr, 3));
        pool.connect_all().await.unwrap();
        assert_eq!(pool.live_count(), 3);
        assert_eq!(pool.idle_count(), 3);
    }

    #[tokio::test]
    async fn connect_all_failure_keeps_accounting() {
        let pool = RedisPool::new(pool_config("127.0.0.1:1", 2));
        assert!(pool.connect_all().await.is_err());
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn pool_command_releases() {
        let addr = mock_redis_server().await;
        let pool = RedisPool::new(pool_config(&addr, 2));

        let reply = pool.command("SET", &["k", "v"]).await.unwrap();
        assert_eq!(reply, RedisValue::SimpleString("OK".into()));
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.live_count(), 1);
    }

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let addr = mock_redis_server().await;
        let pool = Arc::new(RedisPool::new(pool_config(&addr, 2)));

        {
            let guard = pool.acquire_guard().await.unwrap();
            let reply = guard.command("PING", &[]).await.unwrap();
            assert_eq!(reply, RedisValue::SimpleString("OK".into()));
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_unregisters() {
        let addr = mock_redis_server().await;
        let pool = Arc::new(RedisPool::new(pool_config(&addr, 1)));

        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let _ = pool.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        waiter.abort();
        let _ = waiter.await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.waiters.load(Ordering::Acquire), 0);

        pool.release(held, false);
    }

    #[tokio::test]
    async fn backpressure_three_tasks_two_slots() {
        let addr = mock_redis_server().await;
        let pool = Arc::new(RedisPool::new(pool_config(&addr, 2)));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                let client = pool.acquire().await.unwrap();
                // hold the client across a suspension, like a slow command
                tokio::time::sleep(Duration::from_millis(50)).await;
                let reply = client.command("PING", &[]).await.unwrap();
                assert_eq!(reply, RedisValue::SimpleString("OK".into()));
                pool.release(client, false);
            }));
        }

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("task should finish")
                .unwrap();
        }
        // the bound held throughout
        assert!(pool.live_count() <= 2);
    }
}
