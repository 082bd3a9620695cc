//! Shared mock-server infrastructure for the integration tests.
//!
//! Each mock node is a real TCP listener that decodes commands with the
//! crate's own RESP parser and answers them through a scripted handler,
//! so the cluster and sentinel scenarios run without any external store.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use tridis::resp::parser::RespParser;
use tridis::resp::types::RedisValue;
use tridis::resp::writer::encode_value;

/// Scripted reply logic: command args in (verb first), reply out.
/// `None` closes the connection without replying.
pub type Handler = Arc<dyn Fn(Vec<String>) -> Option<RedisValue> + Send + Sync>;

pub fn handler<F>(f: F) -> Handler
where
    F: Fn(Vec<String>) -> Option<RedisValue> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Open-connection gauge for a mock node.
#[derive(Default)]
pub struct ConnGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConnGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

/// A running mock store node.
pub struct MockNode {
    pub host: String,
    pub port: u16,
    alive: Arc<AtomicBool>,
    pub connections: Arc<ConnGauge>,
}

impl MockNode {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Simulate a crash: new and existing connections are dropped without
    /// replies from now on.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn revive(&self) {
        self.alive.store(true, Ordering::Release);
    }
}

/// Bind a listener first so a port is known before its handler (which may
/// need to mention other nodes' ports) is built.
pub async fn bind_node() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Start serving a bound listener with the given handler.
pub fn serve_node(listener: TcpListener, handler: Handler) -> MockNode {
    let port = listener.local_addr().unwrap().port();
    let alive = Arc::new(AtomicBool::new(true));
    let connections = Arc::new(ConnGauge::default());

    let alive_accept = Arc::clone(&alive);
    let gauge_accept = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            if !alive_accept.load(Ordering::Acquire) {
                drop(socket);
                continue;
            }
            let handler = Arc::clone(&handler);
            let alive = Arc::clone(&alive_accept);
            let gauge = Arc::clone(&gauge_accept);
            tokio::spawn(async move {
                gauge.enter();
                serve_connection(socket, handler, alive).await;
                gauge.exit();
            });
        }
    });

    MockNode {
        host: "127.0.0.1".to_string(),
        port,
        alive,
        connections,
    }
}

/// Bind and serve in one step.
pub async fn spawn_node(handler: Handler) -> MockNode {
    let (listener, _) = bind_node().await;
    serve_node(listener, handler)
}

async fn serve_connection(mut socket: TcpStream, handler: Handler, alive: Arc<AtomicBool>) {
    let mut parser = RespParser::new();
    let mut buf = vec![0u8; 4096];
    loop {
        loop {
            let frame = match parser.next() {
                Ok(Some(v)) => v,
                Ok(None) => break,
                Err(_) => return,
            };
            if !alive.load(Ordering::Acquire) {
                return;
            }
            let Some(reply) = handler(command_args(frame)) else {
                return;
            };
            if socket.write_all(&encode_value(&reply)).await.is_err() {
                return;
            }
        }
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => parser.feed(&buf[..n]),
        }
    }
}

fn command_args(frame: RedisValue) -> Vec<String> {
    match frame {
        RedisValue::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

// ── Reply builders ─────────────────────────────────────────────────

pub fn ok() -> RedisValue {
    RedisValue::SimpleString("OK".into())
}

pub fn pong() -> RedisValue {
    RedisValue::SimpleString("PONG".into())
}

pub fn bulk(s: &str) -> RedisValue {
    RedisValue::BulkString(Bytes::copy_from_slice(s.as_bytes()))
}

pub fn int(n: i64) -> RedisValue {
    RedisValue::Integer(n)
}

pub fn err(msg: &str) -> RedisValue {
    RedisValue::Error(msg.to_string())
}

pub fn nil() -> RedisValue {
    RedisValue::Null
}

/// Build a `CLUSTER SLOTS` reply from `(start, end, host, port)` ranges.
pub fn slots_reply(ranges: &[(i64, i64, &str, u16)]) -> RedisValue {
    RedisValue::Array(
        ranges
            .iter()
            .map(|(start, end, host, port)| {
                RedisValue::Array(vec![
                    RedisValue::Integer(*start),
                    RedisValue::Integer(*end),
                    RedisValue::Array(vec![bulk(host), RedisValue::Integer(i64::from(*port))]),
                ])
            })
            .collect(),
    )
}
