//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server responses incrementally,
//! so a reply can be assembled from any number of partial socket reads.
//!
//! ## Design Principles
//! 1. **Pure Parsing**: `parse_value` borrows a buffer and returns a new value
//!    plus the number of bytes it used; no parse state survives the call.
//! 2. **Buffer Ownership**: `RespDecoder` owns only the accumulated bytes.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Never Guess**: A truncated buffer is "needs more data", never a
//!    short success; invalid framing is a protocol error immediately.
//!
//! ## Parse Outcomes
//!
//! ```text
//! Ok(Some((value, consumed)))  one whole value at the front of the buffer
//! Ok(None)                     prefix of a valid value, read more and retry
//! Err(DATAERR)                 framing violation
//! ```

use bytes::{Buf, BytesMut};
use kvlink_common::{ErrorCode, KvError, KvResult};

/// Deepest array nesting accepted before the reply is rejected.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Largest bulk string accepted (same ceiling as the server).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays; null and empty arrays are both empty.
    Array(Vec<RespValue>),
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        let arg = arg.as_ref();
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Parses the value at the front of `buf`.
pub fn parse_value(buf: &[u8]) -> KvResult<Option<(RespValue, usize)>> {
    parse_nested(buf, 0)
}

fn parse_nested(buf: &[u8], depth: usize) -> KvResult<Option<(RespValue, usize)>> {
    let Some(&prefix) = buf.first() else {
        return Ok(None);
    };
    if !matches!(prefix, b'+' | b'-' | b':' | b'$' | b'*') {
        return Err(protocol(format!("unexpected type byte {:#04x}", prefix)));
    }

    let Some(line_len) = find_crlf(&buf[1..]) else {
        return Ok(None);
    };
    let line = &buf[1..1 + line_len];
    // prefix + line + CRLF
    let header_len = line_len + 3;

    match prefix {
        b'+' => Ok(Some((RespValue::Simple(line.to_vec()), header_len))),
        b'-' => Ok(Some((RespValue::Error(line.to_vec()), header_len))),
        b':' => Ok(Some((RespValue::Integer(parse_i64(line)?), header_len))),
        b'$' => parse_bulk(buf, header_len, parse_i64(line)?),
        _ => parse_array(buf, header_len, parse_i64(line)?, depth),
    }
}

fn parse_bulk(buf: &[u8], header_len: usize, len: i64) -> KvResult<Option<(RespValue, usize)>> {
    if len == -1 {
        return Ok(Some((RespValue::Bulk(None), header_len)));
    }
    if len < 0 {
        return Err(protocol(format!("invalid bulk length {}", len)));
    }
    let len = len as usize;
    if len > MAX_BULK_SIZE {
        return Err(protocol(format!("bulk length {} exceeds limit", len)));
    }

    let total = header_len + len + 2;
    if buf.len() < total {
        return Ok(None);
    }
    if &buf[total - 2..total] != b"\r\n" {
        return Err(protocol("bulk string missing trailing CRLF"));
    }

    let data = buf[header_len..header_len + len].to_vec();
    Ok(Some((RespValue::Bulk(Some(data)), total)))
}

fn parse_array(
    buf: &[u8],
    header_len: usize,
    count: i64,
    depth: usize,
) -> KvResult<Option<(RespValue, usize)>> {
    if count < -1 {
        return Err(protocol(format!("invalid array length {}", count)));
    }
    if count <= 0 {
        return Ok(Some((RespValue::Array(Vec::new()), header_len)));
    }
    if depth >= MAX_NESTING_DEPTH {
        return Err(protocol("array nesting too deep"));
    }

    let count = count as usize;
    // Cap the up-front reservation; a hostile count must not allocate by itself.
    let mut items = Vec::with_capacity(count.min(1024));
    let mut consumed = header_len;
    for _ in 0..count {
        match parse_nested(&buf[consumed..], depth + 1)? {
            Some((item, used)) => {
                items.push(item);
                consumed += used;
            }
            None => return Ok(None),
        }
    }

    Ok(Some((RespValue::Array(items), consumed)))
}

/// Accumulates reply bytes up to a fixed capacity and decodes whole values.
#[derive(Debug)]
pub struct RespDecoder {
    buf: BytesMut,
    capacity: usize,
}

impl RespDecoder {
    /// Creates a decoder that holds at most `capacity` unread bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        RespDecoder {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of buffered bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes buffered and not yet decoded.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true when nothing is buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Room left before the buffer is full.
    #[inline]
    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    /// Appends freshly received bytes.
    ///
    /// Fails with `PARAMERR` when the bytes would overflow the capacity.
    pub fn extend(&mut self, data: &[u8]) -> KvResult<()> {
        if data.len() > self.remaining_capacity() {
            return Err(KvError::new(
                ErrorCode::ParamErr,
                "reply exceeds receive buffer",
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Decodes one value, consuming its bytes on success.
    pub fn decode(&mut self) -> KvResult<Option<RespValue>> {
        match parse_value(&self.buf)? {
            Some((value, used)) => {
                self.buf.advance(used);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Drops any buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

fn parse_i64(data: &[u8]) -> KvResult<i64> {
    if data.is_empty() {
        return Err(protocol("empty integer"));
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }
    if idx == data.len() {
        return Err(protocol("integer without digits"));
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(protocol(format!(
                "invalid integer {:?}",
                String::from_utf8_lossy(data)
            )));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

fn protocol(detail: impl Into<String>) -> KvError {
    KvError::new(
        ErrorCode::DataErr,
        format!("{}: {}", ErrorCode::DataErr.message(), detail.into()),
    )
}
