//! Single owned connection to one Redis endpoint.
//!
//! A [`RedisClient`] serializes commands, writes them to the socket, and
//! reads exactly one reply per command. At most one command is in flight
//! at a time, enforced by an async mutex around the socket. Every I/O
//! fault is terminal: the socket is shut down and the client stays closed
//! until an explicit new [`RedisClient::connect`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::RedisConfig;
use crate::error::{RedisError, Result};
use crate::resp::parser::RespParser;
use crate::resp::types::RedisValue;
use crate::resp::writer::encode_command;

/// Per-read scratch size.
const READ_CHUNK: usize = 64 * 1024;

/// Socket plus decode state, owned exclusively by whoever holds the op gate.
#[derive(Debug)]
struct Connection {
    stream: TcpStream,
    parser: RespParser,
    scratch: Box<[u8]>,
}

/// A single asynchronous connection to one Redis server.
///
/// Created disconnected; [`connect`](Self::connect) opens the socket and
/// runs the AUTH/SELECT handshake. Shareable across tasks: the internal
/// mutex serializes commands.
#[derive(Debug)]
pub struct RedisClient {
    config: RedisConfig,
    /// The exclusive-operation gate. `None` once closed.
    conn: Mutex<Option<Connection>>,
    connected: AtomicBool,
    closing: AtomicBool,
    in_flight: AtomicBool,
}

/// Clears `in_flight` when a command scope unwinds.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RedisClient {
    /// Create a disconnected client.
    pub fn new(config: RedisConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// True iff connected, not closing, and no command is in flight.
    pub fn is_idle(&self) -> bool {
        self.connected.load(Ordering::Acquire)
            && !self.closing.load(Ordering::Acquire)
            && !self.in_flight.load(Ordering::Acquire)
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.config.io_timeout_ms)
    }

    /// Open the TCP connection and run the handshake.
    ///
    /// Idempotent while connected. A closed client may be revived by an
    /// explicit call.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        self.closing.store(false, Ordering::Release);

        let addr = self.config.addr();
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.closing.store(true, Ordering::Release);
                warn!(%addr, error = %e, "connect failed");
                return Err(RedisError::Io(format!("connect to {addr} failed: {e}")));
            }
            Err(_) => {
                self.closing.store(true, Ordering::Release);
                warn!(%addr, timeout_ms = self.config.connect_timeout_ms, "connect timed out");
                return Err(RedisError::Io(format!(
                    "connect to {addr} timed out after {}ms",
                    self.config.connect_timeout_ms
                )));
            }
        };
        stream.set_nodelay(true).ok();

        let mut conn = Connection {
            stream,
            parser: RespParser::new(),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        };

        if let Err(e) = self.handshake(&mut conn).await {
            warn!(%addr, error = %e, "handshake failed");
            self.closing.store(true, Ordering::Release);
            return Err(e);
        }

        *guard = Some(conn);
        self.connected.store(true, Ordering::Release);
        debug!(%addr, db = self.config.db, "connected");
        Ok(())
    }

    /// AUTH (when a password is configured) then SELECT (when db != 0).
    /// Anything but `+OK` is fatal for the connection.
    async fn handshake(&self, conn: &mut Connection) -> Result<()> {
        let io_timeout = self.io_timeout();

        if let Some(password) = self.config.password.as_deref() {
            let reply = match self.config.username.as_deref() {
                Some(user) => send_and_read(conn, io_timeout, "AUTH", &[user, password]).await?,
                None => send_and_read(conn, io_timeout, "AUTH", &[password]).await?,
            };
            match reply {
                RedisValue::SimpleString(ref s) if s == "OK" => {}
                other => {
                    return Err(RedisError::Protocol(format!(
                        "AUTH: unexpected reply: {}",
                        other.type_name()
                    )));
                }
            }
        }

        if self.config.db != 0 {
            let db = self.config.db.to_string();
            let reply = send_and_read(conn, io_timeout, "SELECT", &[&db]).await?;
            match reply {
                RedisValue::SimpleString(ref s) if s == "OK" => {}
                other => {
                    return Err(RedisError::Protocol(format!(
                        "SELECT: unexpected reply: {}",
                        other.type_name()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Execute one command and return its reply.
    ///
    /// An Error frame from the server becomes [`RedisError::ServerReply`]
    /// and leaves the connection usable; any transport or protocol fault
    /// hard-closes the client.
    pub async fn command(&self, verb: &str, args: &[&str]) -> Result<RedisValue> {
        let mut guard = self.conn.lock().await;

        if !self.connected.load(Ordering::Acquire) || self.closing.load(Ordering::Acquire) {
            return Err(RedisError::Io("client is not connected".into()));
        }

        self.in_flight.store(true, Ordering::Release);
        let _in_flight = InFlightGuard(&self.in_flight);

        let io_timeout = self.io_timeout();
        let result = match guard.as_mut() {
            Some(conn) => send_and_read(conn, io_timeout, verb, args).await,
            None => Err(RedisError::Io("socket is gone".into())),
        };

        match result {
            Err(e) if !e.is_server_reply() => {
                warn!(verb, error = %e, "command failed, closing client");
                self.hard_close_slot(&mut *guard);
                Err(e)
            }
            other => other,
        }
    }

    /// Terminal close; idempotent.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        let mut guard = self.conn.lock().await;
        if guard.take().is_some() {
            debug!(addr = %self.config.addr(), "client closed");
        }
    }

    fn hard_close_slot(&self, slot: &mut Option<Connection>) {
        self.closing.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        slot.take();
    }

    // ── Typed helpers ──────────────────────────────────────────────

    /// PING; true on `+PONG`.
    pub async fn ping(&self) -> Result<bool> {
        let reply = self.command("PING", &[]).await?;
        Ok(matches!(reply, RedisValue::SimpleString(ref s) if s == "PONG"))
    }

    /// GET; `None` when the key does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let reply = self.command("GET", &[key]).await?;
        expect_optional_string("GET", reply)
    }

    /// SET key value.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.command("SET", &[key, value]).await?;
        Ok(())
    }

    /// SETEX key ttl value.
    pub async fn setex(&self, key: &str, ttl_secs: i64, value: &str) -> Result<()> {
        let ttl = ttl_secs.to_string();
        self.command("SETEX", &[key, &ttl, value]).await?;
        Ok(())
    }

    /// DEL; number of keys removed. No-op for an empty key list.
    pub async fn del(&self, keys: &[&str]) -> Result<i64> {
        if keys.is_empty() {
            return Ok(0);
        }
        expect_integer("DEL", self.command("DEL", keys).await?)
    }

    /// INCRBY key delta.
    pub async fn incrby(&self, key: &str, delta: i64) -> Result<i64> {
        let d = delta.to_string();
        expect_integer("INCRBY", self.command("INCRBY", &[key, &d]).await?)
    }

    /// HSET key field value; number of new fields.
    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<i64> {
        expect_integer("HSET", self.command("HSET", &[key, field, value]).await?)
    }

    /// HGET; `None` when the field does not exist.
    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let reply = self.command("HGET", &[key, field]).await?;
        expect_optional_string("HGET", reply)
    }

    /// HGETALL projected to a field → value map.
    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let reply = self.command("HGETALL", &[key]).await?;
        match reply {
            RedisValue::Null => Ok(HashMap::new()),
            RedisValue::Array(ref arr) if arr.len() % 2 != 0 => Err(RedisError::Protocol(
                "HGETALL: odd array length".into(),
            )),
            v @ RedisValue::Array(_) => Ok(v.as_map()),
            other => Err(unexpected("HGETALL", &other)),
        }
    }

    /// SADD; number of members added. No-op for an empty member list.
    pub async fn sadd(&self, key: &str, members: &[&str]) -> Result<i64> {
        if members.is_empty() {
            return Ok(0);
        }
        let args = prepend_key(key, members);
        expect_integer("SADD", self.command("SADD", &args).await?)
    }

    /// SREM; number of members removed. No-op for an empty member list.
    pub async fn srem(&self, key: &str, members: &[&str]) -> Result<i64> {
        if members.is_empty() {
            return Ok(0);
        }
        let args = prepend_key(key, members);
        expect_integer("SREM", self.command("SREM", &args).await?)
    }

    /// SMEMBERS as a list of strings.
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let reply = self.command("SMEMBERS", &[key]).await?;
        match reply {
            RedisValue::Null => Ok(Vec::new()),
            v @ RedisValue::Array(_) => Ok(v.as_string_array()),
            other => Err(unexpected("SMEMBERS", &other)),
        }
    }

    /// LPUSH; resulting list length. No-op for an empty value list.
    pub async fn lpush(&self, key: &str, values: &[&str]) -> Result<i64> {
        if values.is_empty() {
            return Ok(0);
        }
        let args = prepend_key(key, values);
        expect_integer("LPUSH", self.command("LPUSH", &args).await?)
    }

    /// LRANGE key start stop.
    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let s1 = start.to_string();
        let s2 = stop.to_string();
        let reply = self.command("LRANGE", &[key, &s1, &s2]).await?;
        match reply {
            v @ RedisValue::Array(_) => Ok(v.as_string_array()),
            other => Err(unexpected("LRANGE", &other)),
        }
    }

    /// ZADD with (member, score) pairs; number of members added.
    pub async fn zadd(&self, key: &str, members: &[(&str, f64)]) -> Result<i64> {
        if members.is_empty() {
            return Ok(0);
        }
        let scores: Vec<String> = members.iter().map(|(_, s)| s.to_string()).collect();
        let mut args: Vec<&str> = Vec::with_capacity(1 + members.len() * 2);
        args.push(key);
        for ((member, _), score) in members.iter().zip(&scores) {
            args.push(score);
            args.push(member);
        }
        expect_integer("ZADD", self.command("ZADD", &args).await?)
    }

    /// ZRANGE … WITHSCORES projected to (member, score) pairs.
    pub async fn zrange_with_scores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>> {
        let s1 = start.to_string();
        let s2 = stop.to_string();
        let reply = self
            .command("ZRANGE", &[key, &s1, &s2, "WITHSCORES"])
            .await?;
        let arr = match reply {
            RedisValue::Array(arr) => arr,
            other => return Err(unexpected("ZRANGE", &other)),
        };
        if arr.len() % 2 != 0 {
            return Err(RedisError::Protocol("ZRANGE: odd array length".into()));
        }
        let mut out = Vec::with_capacity(arr.len() / 2);
        for pair in arr.chunks_exact(2) {
            let (Some(member), Some(score)) = (pair[0].as_str(), pair[1].as_str()) else {
                continue;
            };
            let score: f64 = score.parse().map_err(|_| {
                RedisError::Protocol(format!("ZRANGE: invalid score '{score}'"))
            })?;
            out.push((member.to_string(), score));
        }
        Ok(out)
    }
}

// ── Wire helpers ───────────────────────────────────────────────────

/// Write the full encoded frame (re-arming the timeout per write), then
/// pull frames from the parser, reading 64 KiB chunks as needed, until
/// one reply is complete.
async fn send_and_read(
    conn: &mut Connection,
    io_timeout: Duration,
    verb: &str,
    args: &[&str],
) -> Result<RedisValue> {
    let frame = encode_command(verb, args);

    let mut off = 0;
    while off < frame.len() {
        let n = match tokio::time::timeout(io_timeout, conn.stream.write(&frame[off..])).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(RedisError::Io(format!("write failed: {e}"))),
            Err(_) => return Err(RedisError::Io("write timed out".into())),
        };
        if n == 0 {
            return Err(RedisError::Io("write made no progress".into()));
        }
        off += n;
    }

    loop {
        if let Some(value) = conn.parser.next()? {
            if let RedisValue::Error(msg) = value {
                return Err(RedisError::ServerReply(msg));
            }
            return Ok(value);
        }
        let n = match tokio::time::timeout(io_timeout, conn.stream.read(&mut conn.scratch)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(RedisError::Io(format!("read failed: {e}"))),
            Err(_) => return Err(RedisError::Io("read timed out".into())),
        };
        if n == 0 {
            return Err(RedisError::Io("connection closed by peer".into()));
        }
        conn.parser.feed(&conn.scratch[..n]);
    }
}

// ── Reply shape checks ─────────────────────────────────────────────

fn unexpected(verb: &str, reply: &RedisValue) -> RedisError {
    RedisError::Protocol(format!("{verb}: unexpected reply: {}", reply.type_name()))
}

fn expect_integer(verb: &str, reply: RedisValue) -> Result<i64> {
    match reply {
        RedisValue::Integer(n) => Ok(n),
        other => Err(unexpected(verb, &other)),
    }
}

fn expect_optional_string(verb: &str, reply: RedisValue) -> Result<Option<String>> {
    match reply {
        RedisValue::Null => Ok(None),
        RedisValue::SimpleString(s) => Ok(Some(s)),
        RedisValue::BulkString(b) => match std::str::from_utf8(&b) {
            Ok(s) => Ok(Some(s.to_string())),
            Err(_) => Err(RedisError::Protocol(format!(
                "{verb}: reply is not valid UTF-8"
            ))),
        },
        other => Err(unexpected(verb, &other)),
    }
}

fn prepend_key<'a>(key: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
    let mut args = Vec::with_capacity(1 + rest.len());
    args.push(key);
    args.extend_from_slice(rest);
    args
}

// ── Tests ──────────────────────────────────────────────────────────
