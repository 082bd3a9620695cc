//! RESP command and value serializer.
//!
//! Commands are written as an array of bulk strings:
//! `*<1+N>\r\n$<len>\r\nVERB\r\n$<len>\r\narg1\r\n…`

use itoa::Buffer;

use crate::resp::types::RedisValue;

/// Encode `verb` plus binary-safe `args` into wire format.
pub fn encode_command_bytes(verb: &[u8], args: &[&[u8]]) -> Vec<u8> {
    // Pre-size: header + one bulk per argument
    let mut cap = 1 + 10 + 2 + bulk_len(verb.len());
    for arg in args {
        cap += bulk_len(arg.len());
    }

    let mut buf = Vec::with_capacity(cap);
    let mut itoa_buf = Buffer::new();

    buf.push(b'*');
    buf.extend_from_slice(itoa_buf.format(1 + args.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");

    append_bulk(&mut buf, &mut itoa_buf, verb);
    for arg in args {
        append_bulk(&mut buf, &mut itoa_buf, arg);
    }

    buf
}

/// Encode a command from string arguments.
pub fn encode_command(verb: &str, args: &[&str]) -> Vec<u8> {
    let byte_args: Vec<&[u8]> = args.iter().map(|s| s.as_bytes()).collect();
    encode_command_bytes(verb.as_bytes(), &byte_args)
}

/// Encode a value back into RESP-2 wire format.
///
/// `Null` encodes as the null bulk string `$-1\r\n`.
pub fn encode_value(value: &RedisValue) -> Vec<u8> {
    let mut buf = Vec::new();
    write_value(&mut buf, value);
    buf
}

fn write_value(buf: &mut Vec<u8>, value: &RedisValue) {
    let mut itoa_buf = Buffer::new();
    match value {
        RedisValue::Null => buf.extend_from_slice(b"$-1\r\n"),
        RedisValue::SimpleString(s) => {
            buf.push(b'+');
            buf.extend_from_slice(s.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        RedisValue::Error(s) => {
            buf.push(b'-');
            buf.extend_from_slice(s.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        RedisValue::Integer(i) => {
            buf.push(b':');
            buf.extend_from_slice(itoa_buf.format(*i).as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        RedisValue::BulkString(data) => append_bulk(buf, &mut itoa_buf, data),
        RedisValue::Array(items) => {
            buf.push(b'*');
            buf.extend_from_slice(itoa_buf.format(items.len()).as_bytes());
            buf.extend_from_slice(b"\r\n");
            for item in items {
                write_value(buf, item);
            }
        }
    }
}

#[inline]
fn append_bulk(buf: &mut Vec<u8>, itoa_buf: &mut Buffer, data: &[u8]) {
    buf.push(b'$');
    buf.extend_from_slice(itoa_buf.format(data.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

#[inline]
fn bulk_len(data_len: usize) -> usize {
    1 + 10 + 2 + data_len + 2
}

// ── Tests ──────────────────────────────────────────────────────────
