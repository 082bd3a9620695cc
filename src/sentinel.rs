//! Sentinel master resolution and the sentinel-backed pool.
//!
//! [`resolve_master`] is a one-shot query over the configured sentinels.
//! [`RedisSentinelPool`] lazily resolves the master, keeps a bounded pool
//! to it, and re-resolves exactly once when a command fails with an I/O
//! error (the usual symptom of a failover).

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::client::RedisClient;
use crate::config::{PoolConfig, RedisConfig, SentinelConfig};
use crate::error::{RedisError, Result};
use crate::pool::{PooledConn, RedisPool};
use crate::resp::types::RedisValue;

/// Ask the configured sentinels for the current master address.
///
/// Sentinels are tried in order; the first that answers
/// `SENTINEL get-master-addr-by-name` with a well-formed `[host, port]`
/// array wins. The returned config is `base_redis` with host/port
/// overridden, so auth, db and timeouts carry over to the master.
pub async fn resolve_master(cfg: &SentinelConfig) -> Result<RedisConfig> {
    if cfg.sentinels.is_empty() {
        return Err(RedisError::Io("no sentinels configured".into()));
    }

    for node in &cfg.sentinels {
        let sentinel_cfg = RedisConfig {
            host: node.host.clone(),
            port: node.port,
            db: 0,
            username: node.username.clone(),
            password: node.password.clone(),
            connect_timeout_ms: cfg.connect_timeout_ms,
            io_timeout_ms: cfg.io_timeout_ms,
        };
        let addr = sentinel_cfg.addr();

        let client = RedisClient::new(sentinel_cfg);
        if let Err(e) = client.connect().await {
            warn!(sentinel = %addr, error = %e, "sentinel connect failed");
            continue;
        }

        let reply = client
            .command("SENTINEL", &["get-master-addr-by-name", &cfg.master_name])
            .await;
        client.close().await;

        let reply = match reply {
            Ok(v) => v,
            Err(e) => {
                warn!(sentinel = %addr, error = %e, "sentinel query failed");
                continue;
            }
        };

        let RedisValue::Array(items) = reply else {
            warn!(sentinel = %addr, "unexpected sentinel reply shape (not an array)");
            continue;
        };
        if items.len() < 2 {
            warn!(sentinel = %addr, "sentinel reply missing host/port");
            continue;
        }
        let (Some(host), Some(port_str)) = (items[0].as_str(), items[1].as_str()) else {
            warn!(sentinel = %addr, "sentinel reply host/port are not strings");
            continue;
        };
        let port = match port_str.parse::<u32>() {
            Ok(p) if (1..=65535).contains(&p) => p as u16,
            _ => {
                warn!(sentinel = %addr, port = port_str, "sentinel reported invalid port");
                continue;
            }
        };

        let mut master = cfg.base_redis.clone();
        master.host = host.to_string();
        master.port = port;
        info!(
            master = %master.addr(),
            master_name = %cfg.master_name,
            "resolved master via sentinel"
        );
        return Ok(master);
    }

    Err(RedisError::Io("all sentinels failed".into()))
}

struct SentinelState {
    pool: Option<Arc<RedisPool>>,
    connected: bool,
}

/// A command endpoint backed by a sentinel-monitored master.
pub struct RedisSentinelPool {
    config: SentinelConfig,
    state: Mutex<SentinelState>,
}

impl RedisSentinelPool {
    /// Create an unconnected sentinel pool. `pool_size` is clamped to at
    /// least 1.
    pub fn new(mut config: SentinelConfig) -> Self {
        if config.pool_size == 0 {
            config.pool_size = 1;
        }
        Self {
            config,
            state: Mutex::new(SentinelState {
                pool: None,
                connected: false,
            }),
        }
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    /// Resolve the master and build its pool, unless already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_connected_locked(&mut state).await.map(|_| ())
    }

    /// Check out a client to the current master. The guard releases the
    /// client back to the pool on drop.
    pub async fn get_master_client(&self) -> Result<PooledConn> {
        let pool = {
            let mut state = self.state.lock().await;
            self.ensure_connected_locked(&mut state).await?
        };
        pool.acquire_guard().await
    }

    /// Run one command on the master.
    ///
    /// An `Io` failure drops the pool, re-resolves the master, and retries
    /// exactly once; if re-resolution fails, the original error is
    /// returned. All other errors surface unchanged.
    pub async fn command(&self, verb: &str, args: &[&str]) -> Result<RedisValue> {
        let pool = {
            let mut state = self.state.lock().await;
            self.ensure_connected_locked(&mut state).await?
        };

        let original = match pool.command(verb, args).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_io() => e,
            Err(e) => return Err(e),
        };

        warn!(verb, error = %original, "master command failed, re-resolving once");

        let pool = {
            let mut state = self.state.lock().await;
            state.connected = false;
            state.pool = None;
            match self.ensure_connected_locked(&mut state).await {
                Ok(pool) => pool,
                Err(e) => {
                    warn!(error = %e, "re-resolution failed, keeping original error");
                    return Err(original);
                }
            }
        };

        pool.command(verb, args).await
    }

    async fn ensure_connected_locked(
        &self,
        state: &mut SentinelState,
    ) -> Result<Arc<RedisPool>> {
        if state.connected {
            if let Some(pool) = &state.pool {
                return Ok(Arc::clone(pool));
            }
        }

        let master = resolve_master(&self.config).await?;
        let pool = Arc::new(RedisPool::new(PoolConfig {
            redis: master.clone(),
            size: self.config.pool_size,
        }));
        pool.connect_all().await?;

        info!(master = %master.addr(), db = master.db, "sentinel pool connected");
        state.pool = Some(Arc::clone(&pool));
        state.connected = true;
        Ok(pool)
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SentinelNode;

    #[tokio::test]
    async fn resolve_with_no_sentinels_is_io() {
        let cfg = SentinelConfig {
            master_name: "mymaster".into(),
            ..SentinelConfig::default()
        };
        let err = resolve_master(&cfg).await.unwrap_err();
        assert!(err.is_io());
    }

    #[tokio::test]
    async fn resolve_with_unreachable_sentinel_is_io() {
        let cfg = SentinelConfig {
            master_name: "mymaster".into(),
            sentinels: vec![SentinelNode::new("127.0.0.1", 1)],
            connect_timeout_ms: 100,
            ..SentinelConfig::default()
        };
        let err = resolve_master(&cfg).await.unwrap_err();
        assert!(err.is_io());
    }

    #[tokio::test]
    async fn pool_size_is_clamped() {
        let cfg = SentinelConfig {
            master_name: "mymaster".into(),
            pool_size: 0,
            ..SentinelConfig::default()
        };
        let pool = RedisSentinelPool::new(cfg);
        assert_eq!(pool.config().pool_size, 1);
    }
}
