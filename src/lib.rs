//! Async client for RESP-speaking in-memory stores, covering three
//! deployment topologies behind one `command(verb, args)` API:
//!
//! - [`RedisClient`] — a single owned connection to one server, with
//!   typed helpers, plus [`RedisPool`] for bounded pooling;
//! - [`RedisSentinelPool`] — a replicated pair fronted by a sentinel
//!   quorum, re-resolving the master on I/O failure;
//! - [`RedisClusterClient`] — a sharded cluster of 16384 slots, with
//!   slot discovery, MOVED/ASK redirection handling, and fallback to
//!   single-node mode.
//!
//! The crate is runtime-hosted: every type is a plain library object on
//! tokio, with no global state or background tasks.

pub mod client;
pub mod cluster;
pub mod config;
pub mod crc16;
pub mod error;
pub mod pool;
pub mod resp;
pub mod sentinel;

pub use client::RedisClient;
pub use cluster::RedisClusterClient;
pub use config::{
    ClusterConfig, ClusterNode, PoolConfig, RedisConfig, SentinelConfig, SentinelNode,
};
pub use error::{RedisError, Result};
pub use pool::{PooledConn, RedisPool};
pub use resp::RedisValue;
pub use sentinel::{resolve_master, RedisSentinelPool};
