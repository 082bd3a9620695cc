//! Error taxonomy shared by every layer of the crate.

use thiserror::Error;

/// All failures surfaced by this crate.
///
/// The message text of [`RedisError::ServerReply`] is preserved verbatim;
/// the cluster router inspects it to recognize `MOVED`/`ASK` redirections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedisError {
    /// Transport fault: connect failure, short read/write, timeout, or a
    /// connection closed mid-reply. Always terminal for the client it
    /// occurred on.
    #[error("io error: {0}")]
    Io(String),

    /// Malformed RESP, an unexpected reply shape in a typed helper, or a
    /// routing-table violation (slot out of range, missing mapping).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A `-...` error reply from the server, message kept verbatim.
    #[error("server reply: {0}")]
    ServerReply(String),
}

impl RedisError {
    /// True when this is a transport-level fault.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// True when this wraps an error reply from the server.
    pub fn is_server_reply(&self) -> bool {
        matches!(self, Self::ServerReply(_))
    }

    /// The human-readable message, without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Io(m) | Self::Protocol(m) | Self::ServerReply(m) => m,
        }
    }
}

impl From<std::io::Error> for RedisError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RedisError>;

// ── Tests ──────────────────────────────────────────────────────────
