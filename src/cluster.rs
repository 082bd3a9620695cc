//! Cluster topology router.
//!
//! Discovers the slot layout via `CLUSTER SLOTS`, keeps a node list plus a
//! flat `slot → node` table, and routes each command by the slot of its
//! first argument. Server-driven `MOVED`/`ASK` redirections mutate the
//! table and retry within a bounded budget. When the store reports
//! cluster support disabled, the router degrades to a single-node mode
//! where every key maps to the first seed.
//!
//! Each node carries two kinds of connections: a persistent `main` client
//! reserved for routing traffic (`CLUSTER SLOTS`, `ASKING`, MOVED
//! targets) and a bounded pool used for user commands.

use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::client::RedisClient;
use crate::config::{ClusterConfig, PoolConfig, RedisConfig};
use crate::crc16::{hash_slot, SLOT_COUNT};
use crate::error::{RedisError, Result};
use crate::pool::RedisPool;
use crate::resp::types::RedisValue;

/// Error text a non-cluster store answers `CLUSTER SLOTS` with.
const CLUSTER_DISABLED_MARKER: &str = "cluster support disabled";

/// One cluster node: endpoint, routing connection, command pool.
struct Node {
    config: RedisConfig,
    /// Persistent non-pooled connection for routing operations.
    main: Mutex<Option<Arc<RedisClient>>>,
    pool: RedisPool,
}

impl Node {
    fn new(config: RedisConfig, pool_size: usize) -> Self {
        let pool = RedisPool::new(PoolConfig {
            redis: config.clone(),
            size: pool_size,
        });
        Self {
            config,
            main: Mutex::new(None),
            pool,
        }
    }

    /// The routing connection, created (or replaced, when dead) on demand.
    async fn main_client(&self) -> Result<Arc<RedisClient>> {
        let mut guard = self.main.lock().await;
        if let Some(client) = guard.as_ref() {
            if client.connected() {
                return Ok(Arc::clone(client));
            }
            debug!(node = %self.config.addr(), "replacing dead main client");
        }
        let client = Arc::new(RedisClient::new(self.config.clone()));
        client.connect().await?;
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }
}

struct ClusterState {
    nodes: Vec<Arc<Node>>,
    /// Node index per slot; -1 = unmapped.
    slot_to_node: Vec<i32>,
    standalone_mode: bool,
}

// ── Redirection parsing ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RedirKind {
    Moved,
    Ask,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Redirection {
    kind: RedirKind,
    slot: u16,
    host: String,
    port: u16,
}

/// Parse `MOVED <slot> <host>:<port>` / `ASK <slot> <host>:<port>` from
/// the head of a server reply message. Tolerant of surrounding
/// whitespace; anything malformed is simply not a redirection.
fn parse_redirection(msg: &str) -> Option<Redirection> {
    let mut tokens = msg.split_whitespace();
    let kind = match tokens.next()? {
        "MOVED" => RedirKind::Moved,
        "ASK" => RedirKind::Ask,
        _ => return None,
    };
    let slot: i64 = tokens.next()?.parse().ok()?;
    if !(0..i64::from(SLOT_COUNT)).contains(&slot) {
        return None;
    }
    let addr = tokens.next()?;
    let (host, port_str) = addr.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u32 = port_str.parse().ok()?;
    if !(1..=65535).contains(&port) {
        return None;
    }
    Some(Redirection {
        kind,
        slot: slot as u16,
        host: host.to_string(),
        port: port as u16,
    })
}

/// Parse a `[host, port, …]` node-info array from `CLUSTER SLOTS`.
fn node_addr_from_info(value: &RedisValue) -> Option<(String, u16)> {
    let RedisValue::Array(items) = value else {
        return None;
    };
    if items.len() < 2 {
        return None;
    }
    let host = items[0].as_str()?;
    let port = items[1].as_int()?;
    if !(1..=65535).contains(&port) {
        return None;
    }
    Some((host.to_string(), port as u16))
}

enum AskOutcome {
    Done(RedisValue),
    Moved(Redirection),
}

// ── Router ─────────────────────────────────────────────────────────

/// Client for the sharded cluster topology.
pub struct RedisClusterClient {
    config: ClusterConfig,
    state: Mutex<ClusterState>,
    /// Single-flight discovery: the first result, success or failure, is
    /// cached for the router's lifetime.
    init: OnceCell<Result<()>>,
}

impl RedisClusterClient {
    /// Create an unconnected router. A zero `max_redirections` falls back
    /// to the default of 5; `max_connections_per_node` is clamped to 1.
    pub fn new(mut config: ClusterConfig) -> Self {
        if config.max_redirections == 0 {
            config.max_redirections = 5;
        }
        if config.max_connections_per_node == 0 {
            config.max_connections_per_node = 1;
        }
        Self {
            config,
            state: Mutex::new(ClusterState {
                nodes: Vec::new(),
                slot_to_node: vec![-1; SLOT_COUNT as usize],
                standalone_mode: false,
            }),
            init: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Run discovery, or await/return the already-cached result.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_initialized().await
    }

    /// True when the router fell back to single-node mode.
    pub async fn is_standalone(&self) -> bool {
        self.state.lock().await.standalone_mode
    }

    /// Route one command by the slot of its first argument.
    ///
    /// `MOVED` repoints the slot table and retries; `ASK` retries once on
    /// the target's main client after `ASKING`. The redirect budget is
    /// `max_redirections` attempts, after which a `Protocol` error is
    /// returned.
    pub async fn command(&self, verb: &str, args: &[&str]) -> Result<RedisValue> {
        self.ensure_initialized().await?;

        // Copy the routing key before the first await: the caller's
        // borrow cannot be relied on across the redirect loop's
        // suspensions.
        let routing_key: Option<String> = args.first().map(|s| s.to_string());

        for attempt in 0..self.config.max_redirections {
            let node = match &routing_key {
                Some(key) => self.node_for_slot(hash_slot(key.as_bytes())).await?,
                None => self.first_node().await?,
            };

            let client = node.pool.acquire().await?;
            match client.command(verb, args).await {
                Ok(value) => {
                    node.pool.release(client, false);
                    return Ok(value);
                }
                Err(RedisError::ServerReply(msg)) => {
                    node.pool.release(client, false);
                    let Some(redir) = parse_redirection(&msg) else {
                        return Err(RedisError::ServerReply(msg));
                    };
                    match redir.kind {
                        RedirKind::Moved => {
                            info!(
                                slot = redir.slot,
                                host = %redir.host,
                                port = redir.port,
                                attempt,
                                "MOVED redirect"
                            );
                            self.apply_moved(&redir).await;
                            continue;
                        }
                        RedirKind::Ask => {
                            info!(
                                slot = redir.slot,
                                host = %redir.host,
                                port = redir.port,
                                attempt,
                                "ASK redirect"
                            );
                            match self.follow_ask(&redir, verb, args).await? {
                                AskOutcome::Done(value) => return Ok(value),
                                AskOutcome::Moved(next) => {
                                    self.apply_moved(&next).await;
                                    continue;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    node.pool.release(client, true);
                    return Err(e);
                }
            }
        }

        Err(RedisError::Protocol("too many redirections".into()))
    }

    /// Main client of the node owning `key`'s slot. An empty key routes
    /// like a keyless command.
    pub async fn get_client_for_key(&self, key: &str) -> Result<Arc<RedisClient>> {
        self.ensure_initialized().await?;
        if key.is_empty() {
            return self.get_any_client().await;
        }
        let node = self.node_for_slot(hash_slot(key.as_bytes())).await?;
        node.main_client().await
    }

    /// Main client of the node owning `slot`.
    pub async fn get_client_for_slot(&self, slot: u16) -> Result<Arc<RedisClient>> {
        self.ensure_initialized().await?;
        if slot >= SLOT_COUNT {
            return Err(RedisError::Protocol(format!("invalid slot {slot}")));
        }
        let node = self.node_for_slot(slot).await?;
        node.main_client().await
    }

    /// Main client of the first known node.
    pub async fn get_any_client(&self) -> Result<Arc<RedisClient>> {
        self.ensure_initialized().await?;
        let node = self.first_node().await?;
        node.main_client().await
    }

    // ── Initialization ─────────────────────────────────────────────

    async fn ensure_initialized(&self) -> Result<()> {
        self.init.get_or_init(|| self.discover()).await.clone()
    }

    /// Try each seed in order: connect its main client, ask for the slot
    /// layout, and install it. A "cluster support disabled" reply flips
    /// the router into single-node mode instead.
    async fn discover(&self) -> Result<()> {
        if self.config.seeds.is_empty() {
            return Err(RedisError::Protocol("cluster seeds list is empty".into()));
        }

        for seed in &self.config.seeds {
            let node = {
                let mut state = self.state.lock().await;
                self.ensure_node_locked(&mut *state, &seed.host, seed.port).1
            };

            let client = match node.main_client().await {
                Ok(c) => c,
                Err(e) => {
                    warn!(seed = %node.config.addr(), error = %e, "seed connect failed");
                    continue;
                }
            };

            match client.command("CLUSTER", &["SLOTS"]).await {
                Err(RedisError::ServerReply(msg))
                    if msg.contains(CLUSTER_DISABLED_MARKER) =>
                {
                    info!(
                        seed = %node.config.addr(),
                        "store has cluster support disabled, using single-node mode"
                    );
                    return self.enter_standalone_mode().await;
                }
                Err(e) => {
                    warn!(seed = %node.config.addr(), error = %e, "CLUSTER SLOTS failed");
                    continue;
                }
                Ok(RedisValue::Array(ranges)) => {
                    let nodes = {
                        let mut state = self.state.lock().await;
                        for slot in state.slot_to_node.iter_mut() {
                            *slot = -1;
                        }
                        for entry in &ranges {
                            self.apply_slot_range(&mut *state, entry);
                        }
                        state.nodes.clone()
                    };
                    self.prewarm(&nodes).await;
                    info!(
                        seed = %node.config.addr(),
                        nodes = nodes.len(),
                        "cluster discovery complete"
                    );
                    return Ok(());
                }
                Ok(other) => {
                    warn!(
                        seed = %node.config.addr(),
                        reply = other.type_name(),
                        "CLUSTER SLOTS reply is not an array"
                    );
                    continue;
                }
            }
        }

        Err(RedisError::Io("CLUSTER SLOTS failed on all seeds".into()))
    }

    /// Install one `[start, end, master, replicas…]` entry. Malformed
    /// entries are skipped. Replica endpoints become known nodes but are
    /// never written into the slot table.
    fn apply_slot_range(&self, state: &mut ClusterState, entry: &RedisValue) {
        let RedisValue::Array(items) = entry else {
            return;
        };
        if items.len() < 3 {
            return;
        }
        let (Some(start), Some(end)) = (items[0].as_int(), items[1].as_int()) else {
            return;
        };
        let Some((host, port)) = node_addr_from_info(&items[2]) else {
            return;
        };

        let (idx, _) = self.ensure_node_locked(state, &host, port);
        let start = start.max(0);
        let end = end.min(i64::from(SLOT_COUNT) - 1);
        for slot in start..=end {
            state.slot_to_node[slot as usize] = idx as i32;
        }

        for info in &items[3..] {
            if let Some((host, port)) = node_addr_from_info(info) {
                self.ensure_node_locked(state, &host, port);
            }
        }
    }

    /// Fallback for a non-cluster store: one node per seed, every slot
    /// pointing at the first.
    async fn enter_standalone_mode(&self) -> Result<()> {
        let nodes = {
            let mut state = self.state.lock().await;
            if state.nodes.is_empty() {
                for seed in &self.config.seeds {
                    self.ensure_node_locked(&mut *state, &seed.host, seed.port);
                }
            }
            for slot in state.slot_to_node.iter_mut() {
                *slot = 0;
            }
            state.standalone_mode = true;
            state.nodes.clone()
        };
        self.prewarm(&nodes).await;
        Ok(())
    }

    /// Best-effort pool prewarm after discovery.
    async fn prewarm(&self, nodes: &[Arc<Node>]) {
        for node in nodes {
            if let Err(e) = node.pool.connect_all().await {
                warn!(node = %node.config.addr(), error = %e, "pool prewarm incomplete");
            }
        }
    }

    // ── Routing ────────────────────────────────────────────────────

    fn node_config(&self, host: &str, port: u16) -> RedisConfig {
        RedisConfig {
            host: host.to_string(),
            port,
            db: 0,
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            connect_timeout_ms: self.config.connect_timeout_ms,
            io_timeout_ms: self.config.io_timeout_ms,
        }
    }

    /// Find a node by endpoint, creating it when unknown. Node indices
    /// are stable: the list only grows.
    fn ensure_node_locked(
        &self,
        state: &mut ClusterState,
        host: &str,
        port: u16,
    ) -> (usize, Arc<Node>) {
        if let Some(idx) = state
            .nodes
            .iter()
            .position(|n| n.config.host == host && n.config.port == port)
        {
            return (idx, Arc::clone(&state.nodes[idx]));
        }
        let node = Arc::new(Node::new(
            self.node_config(host, port),
            self.config.max_connections_per_node,
        ));
        state.nodes.push(Arc::clone(&node));
        (state.nodes.len() - 1, node)
    }

    /// Snapshot the owning node for a slot; the mutex is released before
    /// any I/O happens on the node.
    async fn node_for_slot(&self, slot: u16) -> Result<Arc<Node>> {
        let state = self.state.lock().await;
        if state.nodes.is_empty() {
            return Err(RedisError::Protocol("no cluster nodes discovered".into()));
        }
        let idx = state.slot_to_node[slot as usize];
        if idx < 0 || idx as usize >= state.nodes.len() {
            return Err(RedisError::Protocol(format!(
                "no node mapped for slot {slot}"
            )));
        }
        Ok(Arc::clone(&state.nodes[idx as usize]))
    }

    async fn first_node(&self) -> Result<Arc<Node>> {
        let state = self.state.lock().await;
        state
            .nodes
            .first()
            .cloned()
            .ok_or_else(|| RedisError::Protocol("no cluster nodes discovered".into()))
    }

    /// Repoint a slot at the MOVED target, once the target's main client
    /// is reachable. An unreachable target leaves the table unchanged;
    /// the retry loop will see the same redirection again and eventually
    /// exhaust its budget.
    async fn apply_moved(&self, redir: &Redirection) {
        let (idx, node) = {
            let mut state = self.state.lock().await;
            self.ensure_node_locked(&mut *state, &redir.host, redir.port)
        };
        if let Err(e) = node.main_client().await {
            warn!(target = %node.config.addr(), error = %e, "MOVED target unreachable");
            return;
        }
        let mut state = self.state.lock().await;
        state.slot_to_node[redir.slot as usize] = idx as i32;
    }

    /// Serve an ASK redirect: `ASKING` then one retry on the target's
    /// main client. A MOVED answer to the retry is handed back to the
    /// outer loop; anything else is final.
    async fn follow_ask(
        &self,
        redir: &Redirection,
        verb: &str,
        args: &[&str],
    ) -> Result<AskOutcome> {
        let node = {
            let mut state = self.state.lock().await;
            self.ensure_node_locked(&mut *state, &redir.host, redir.port).1
        };
        let client = node.main_client().await?;

        // the ASKING reply carries no information; failures surface on
        // the retry right after
        let _ = client.command("ASKING", &[]).await;

        match client.command(verb, args).await {
            Ok(value) => Ok(AskOutcome::Done(value)),
            Err(RedisError::ServerReply(msg)) => {
                if let Some(next) = parse_redirection(&msg) {
                    if next.kind == RedirKind::Moved {
                        return Ok(AskOutcome::Moved(next));
                    }
                }
                Err(RedisError::ServerReply(msg))
            }
            Err(e) => Err(e),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
