//! Incremental RESP-2 decoder.
//!
//! [`parse`] decodes one frame from the front of a buffer and reports how
//! many bytes it consumed; `Ok(None)` means the frame is incomplete and no
//! bytes were consumed. [`RespParser`] wraps it with a feed buffer so the
//! client can push arbitrary socket chunks and pull complete frames.
//!
//! Buffers are `Bytes` (ref-counted) so bulk string payloads are extracted
//! with zero-copy `slice()`.

use bytes::{Bytes, BytesMut};
use memchr::memchr;

use crate::error::{RedisError, Result};
use crate::resp::types::RedisValue;

/// Decode one RESP-2 frame from the front of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` for a complete frame,
/// `Ok(None)` when more data is needed, and `Err(Protocol)` for malformed
/// input.
pub fn parse(buf: &Bytes) -> Result<Option<(RedisValue, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    match buf[0] {
        b'+' => parse_simple_string(buf),
        b'-' => parse_error(buf),
        b':' => parse_integer(buf),
        b'$' => parse_bulk_string(buf),
        b'*' => parse_array(buf),
        other => Err(RedisError::Protocol(format!(
            "unknown RESP type byte: 0x{other:02x}"
        ))),
    }
}

/// Convenience wrapper: decode from a byte slice (copies into `Bytes`).
pub fn parse_slice(buf: &[u8]) -> Result<Option<(RedisValue, usize)>> {
    parse(&Bytes::copy_from_slice(buf))
}

/// Stateful pull parser over arbitrary input chunks.
///
/// Bytes of an incomplete frame stay buffered until the frame completes;
/// a malformed frame is a hard [`RedisError::Protocol`] error.
#[derive(Debug, Default)]
pub struct RespParser {
    buf: BytesMut,
}

impl RespParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of raw input.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pull the next complete frame, if the buffer holds one.
    pub fn next(&mut self) -> Result<Option<RedisValue>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        // Freeze the buffer so bulk strings can slice it zero-copy; put
        // back whatever the parser did not consume.
        let snapshot = self.buf.split().freeze();
        match parse(&snapshot) {
            Ok(Some((value, consumed))) => {
                if consumed < snapshot.len() {
                    self.buf.extend_from_slice(&snapshot[consumed..]);
                }
                Ok(Some(value))
            }
            Ok(None) => {
                self.buf.extend_from_slice(&snapshot);
                Ok(None)
            }
            Err(e) => {
                self.buf.extend_from_slice(&snapshot);
                Err(e)
            }
        }
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Find the `\r\n` terminator starting the search at `offset`.
/// Returns the index of `\r`, or `None` when the line is incomplete.
#[inline]
fn find_crlf(buf: &[u8], offset: usize) -> Result<Option<usize>> {
    match memchr(b'\r', &buf[offset..]) {
        Some(pos) => {
            let abs = offset + pos;
            if abs + 1 >= buf.len() {
                Ok(None)
            } else if buf[abs + 1] == b'\n' {
                Ok(Some(abs))
            } else {
                Err(RedisError::Protocol("expected \\n after \\r".into()))
            }
        }
        None => Ok(None),
    }
}

/// Read the line at `buf[offset..]` up to `\r\n`.
/// Returns `(line_bytes, index_after_crlf)`.
#[inline]
fn read_line(buf: &[u8], offset: usize) -> Result<Option<(&[u8], usize)>> {
    match find_crlf(buf, offset)? {
        Some(cr) => Ok(Some((&buf[offset..cr], cr + 2))),
        None => Ok(None),
    }
}

/// Parse a signed base-10 integer from raw bytes, without allocating.
fn parse_int(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Err(RedisError::Protocol("empty integer".into()));
    }
    let (negative, digits) = match bytes[0] {
        b'-' => (true, &bytes[1..]),
        b'+' => (false, &bytes[1..]),
        _ => (false, bytes),
    };
    if digits.is_empty() {
        return Err(RedisError::Protocol("integer has no digits".into()));
    }

    // Accumulate negative so i64::MIN parses without overflow.
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(RedisError::Protocol(format!(
                "invalid byte in integer: 0x{b:02x}"
            )));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_sub((b - b'0') as i64))
            .ok_or_else(|| RedisError::Protocol("integer overflow".into()))?;
    }

    Ok(if negative { n } else { -n })
}

// ── Frame parsers ──────────────────────────────────────────────────

/// `+<string>\r\n`
fn parse_simple_string(buf: &Bytes) -> Result<Option<(RedisValue, usize)>> {
    let Some((line, next)) = read_line(buf, 1)? else {
        return Ok(None);
    };
    let s = std::str::from_utf8(line)
        .map_err(|e| RedisError::Protocol(format!("invalid UTF-8 in simple string: {e}")))?
        .to_string();
    Ok(Some((RedisValue::SimpleString(s), next)))
}

/// `-<message>\r\n`
fn parse_error(buf: &Bytes) -> Result<Option<(RedisValue, usize)>> {
    let Some((line, next)) = read_line(buf, 1)? else {
        return Ok(None);
    };
    let s = std::str::from_utf8(line)
        .map_err(|e| RedisError::Protocol(format!("invalid UTF-8 in error: {e}")))?
        .to_string();
    Ok(Some((RedisValue::Error(s), next)))
}

/// `:<integer>\r\n`
fn parse_integer(buf: &Bytes) -> Result<Option<(RedisValue, usize)>> {
    let Some((line, next)) = read_line(buf, 1)? else {
        return Ok(None);
    };
    Ok(Some((RedisValue::Integer(parse_int(line)?), next)))
}

/// `$<length>\r\n<data>\r\n`, or `$-1\r\n` for null.
fn parse_bulk_string(buf: &Bytes) -> Result<Option<(RedisValue, usize)>> {
    let Some((line, next)) = read_line(buf, 1)? else {
        return Ok(None);
    };
    let len = parse_int(line)?;

    if len < 0 {
        return Ok(Some((RedisValue::Null, next)));
    }

    let len = len as usize;
    let data_end = next + len;
    if buf.len() < data_end + 2 {
        return Ok(None);
    }
    if buf[data_end] != b'\r' || buf[data_end + 1] != b'\n' {
        return Err(RedisError::Protocol(
            "bulk string not terminated by \\r\\n".into(),
        ));
    }

    // Zero-copy slice into the ref-counted buffer.
    let data = buf.slice(next..data_end);
    Ok(Some((RedisValue::BulkString(data), data_end + 2)))
}

/// `*<count>\r\n<elements>`, or `*-1\r\n` for null.
fn parse_array(buf: &Bytes) -> Result<Option<(RedisValue, usize)>> {
    let Some((line, mut next)) = read_line(buf, 1)? else {
        return Ok(None);
    };
    let count = parse_int(line)?;

    if count < 0 {
        return Ok(Some((RedisValue::Null, next)));
    }

    let count = count as usize;
    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        let sub = buf.slice(next..);
        match parse(&sub)? {
            Some((value, consumed)) => {
                elements.push(value);
                next += consumed;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((RedisValue::Array(elements), next)))
}

// ── Tests ──────────────────────────────────────────────────────────
