//! RESP-2 value type and reply projections.

use bytes::Bytes;
use std::collections::HashMap;

/// A parsed RESP-2 frame.
///
/// Values are immutable once parsed. `$-1` and `*-1` both decode to
/// [`RedisValue::Null`].
#[derive(Debug, Clone, PartialEq)]
pub enum RedisValue {
    /// `$-1\r\n` or `*-1\r\n`
    Null,
    /// `+OK\r\n`
    SimpleString(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:1000\r\n`
    Integer(i64),
    /// `$6\r\nfoobar\r\n`
    BulkString(Bytes),
    /// `*2\r\n…`
    Array(Vec<RedisValue>),
}

impl RedisValue {
    /// Interpret this value as a UTF-8 string, when it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::SimpleString(s) => Some(s),
            Self::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Interpret this value as raw bytes, when it is a string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::BulkString(b) => Some(b),
            Self::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// The integer payload, when this is an Integer frame.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Self::SimpleString(_) | Self::BulkString(_))
    }

    /// The error message, when this is an Error frame.
    pub fn as_error_msg(&self) -> Option<&str> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Interpret this value as an array (consumes self).
    pub fn into_array(self) -> Option<Vec<RedisValue>> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Project a string reply to `Some(text)`, Null to `None`.
    ///
    /// SimpleString and BulkString are accepted interchangeably; anything
    /// else (including non-UTF-8 bulk data) projects to `None`.
    pub fn as_optional_string(&self) -> Option<String> {
        match self {
            Self::SimpleString(s) => Some(s.clone()),
            Self::BulkString(b) => std::str::from_utf8(b).ok().map(str::to_string),
            _ => None,
        }
    }

    /// Project an Integer reply (or a numeric string) to `Some(n)`.
    pub fn as_optional_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::SimpleString(_) | Self::BulkString(_) => {
                self.as_str().and_then(|s| s.parse().ok())
            }
            _ => None,
        }
    }

    /// Project an alternating `[field, value, …]` array into a map.
    ///
    /// Non-string entries are skipped pairwise; odd-length or non-array
    /// input yields an empty map. Callers that must reject odd arrays
    /// (HGETALL) check the length before projecting.
    pub fn as_map(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        let Self::Array(arr) = self else {
            return out;
        };
        if arr.len() % 2 != 0 {
            return out;
        }
        out.reserve(arr.len() / 2);
        for pair in arr.chunks_exact(2) {
            let (Some(field), Some(value)) = (pair[0].as_str(), pair[1].as_str()) else {
                continue;
            };
            out.insert(field.to_string(), value.to_string());
        }
        out
    }

    /// Project an alternating `[field, value, …]` array into ordered pairs.
    pub fn as_pairs(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let Self::Array(arr) = self else {
            return out;
        };
        if arr.len() % 2 != 0 {
            return out;
        }
        out.reserve(arr.len() / 2);
        for pair in arr.chunks_exact(2) {
            let (Some(field), Some(value)) = (pair[0].as_str(), pair[1].as_str()) else {
                continue;
            };
            out.push((field.to_string(), value.to_string()));
        }
        out
    }

    /// Project an array of strings; non-string entries are skipped.
    pub fn as_string_array(&self) -> Vec<String> {
        let Self::Array(arr) = self else {
            return Vec::new();
        };
        arr.iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    /// Frame type name, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::SimpleString(_) => "simple_string",
            Self::Error(_) => "error",
            Self::Integer(_) => "integer",
            Self::BulkString(_) => "bulk_string",
            Self::Array(_) => "array",
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
