//! # Commands and Replies
//!
//! Purpose: Build a request from pre-stringified arguments and collect the
//! server's answer in a shape presentation code can read directly.
//!
//! ## Design Principles
//! 1. **Builder Pattern**: `Command::new("SET").arg(key).arg(value)`.
//! 2. **Explicit Numbers**: Numeric arguments go through `arg_int` /
//!    `arg_float`, never through implicit conversions.
//! 3. **Flat Reply List**: Array replies are flattened, in order, into one
//!    list of byte strings; the raw value is kept alongside.

use kvlink_common::{ErrorCode, KvError, KvResult, STATUS_OK};

use crate::resp::{encode_command, RespValue};

/// One request plus the reply it accumulated on its last execution.
#[derive(Debug, Clone, Default)]
pub struct Command {
    args: Vec<Vec<u8>>,
    reply: Reply,
}

impl Command {
    /// Starts a command with its name.
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Command {
            args: vec![name.as_ref().to_vec()],
            reply: Reply::default(),
        }
    }

    /// Builds a command from a full argument list (name first).
    pub fn from_args<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        Command {
            args: args.into_iter().map(|arg| arg.as_ref().to_vec()).collect(),
            reply: Reply::default(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, value: impl AsRef<[u8]>) -> Self {
        self.push_arg(value);
        self
    }

    /// Appends a signed integer argument in decimal form.
    pub fn arg_int(self, value: i64) -> Self {
        self.arg(value.to_string())
    }

    /// Appends an unsigned integer argument in decimal form.
    pub fn arg_uint(self, value: u64) -> Self {
        self.arg(value.to_string())
    }

    /// Appends a floating point argument (scores).
    pub fn arg_float(self, value: f64) -> Self {
        self.arg(value.to_string())
    }

    /// Appends one argument in place.
    pub fn push_arg(&mut self, value: impl AsRef<[u8]>) -> &mut Self {
        self.args.push(value.as_ref().to_vec());
        self
    }

    /// Arguments in wire order.
    #[inline]
    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Command name, if any argument was given.
    pub fn name(&self) -> Option<&[u8]> {
        self.args.first().map(Vec::as_slice)
    }

    /// Serializes the command as a RESP array of bulk strings.
    pub fn encode(&self, out: &mut Vec<u8>) {
        encode_command(&self.args, out);
    }

    /// Reply from the last execution.
    #[inline]
    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub(crate) fn reply_mut(&mut self) -> &mut Reply {
        &mut self.reply
    }

    /// Consumes the command, keeping its reply.
    pub fn into_reply(self) -> Reply {
        self.reply
    }
}

/// Reply accumulated by one command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    status: i64,
    message: String,
    error_kind: Option<String>,
    data: Vec<Vec<u8>>,
    value: Option<RespValue>,
}

impl Reply {
    /// Numeric payload: `1` for status replies, the integer for integer replies.
    #[inline]
    pub fn status(&self) -> i64 {
        self.status
    }

    /// Status text or server error text.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Leading token of a server error (`ERR`, `WRONGTYPE`, ...).
    pub fn error_kind(&self) -> Option<&str> {
        self.error_kind.as_deref()
    }

    /// Returned bulk strings, in order.
    #[inline]
    pub fn data(&self) -> &[Vec<u8>] {
        &self.data
    }

    /// One returned bulk string.
    pub fn get(&self, idx: usize) -> Option<&[u8]> {
        self.data.get(idx).map(Vec::as_slice)
    }

    /// Takes the returned bulk strings out of the reply.
    pub fn take_data(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.data)
    }

    /// Raw value of the last reply.
    pub fn value(&self) -> Option<&RespValue> {
        self.value.as_ref()
    }

    pub(crate) fn reset(&mut self) {
        self.status = 0;
        self.message.clear();
        self.error_kind = None;
        self.data.clear();
        self.value = None;
    }

    /// Records `value` and maps it to the execution result.
    ///
    /// `+` and `:` and `$` yield `STATUS_OK`, `*` yields the number of
    /// flattened entries, `-` yields `FAIL` and `$-1` yields `NOTFOUND`.
    pub(crate) fn absorb(&mut self, value: RespValue) -> KvResult<i64> {
        let result = match &value {
            RespValue::Simple(text) => {
                self.status = STATUS_OK as i64;
                self.message = String::from_utf8_lossy(text).into_owned();
                Ok(STATUS_OK as i64)
            }
            RespValue::Error(text) => {
                let text = String::from_utf8_lossy(text);
                let (kind, message) = split_error(&text);
                self.error_kind = kind.map(str::to_string);
                self.message = message.to_string();
                Err(KvError::new(ErrorCode::Fail, message))
            }
            RespValue::Integer(n) => {
                self.status = *n;
                self.message = n.to_string();
                Ok(STATUS_OK as i64)
            }
            RespValue::Bulk(None) => {
                self.message = ErrorCode::NotFound.message().to_string();
                Err(KvError::from_code(ErrorCode::NotFound))
            }
            RespValue::Bulk(Some(data)) => {
                self.data.push(data.clone());
                Ok(STATUS_OK as i64)
            }
            RespValue::Array(items) => {
                self.data.clear();
                for item in items {
                    flatten(item, &mut self.data);
                }
                Ok(self.data.len() as i64)
            }
        };
        self.value = Some(value);
        result
    }
}

/// Splits `"ERR bad command"` into `(Some("ERR"), "bad command")`.
///
/// Only an all-caps leading token followed by text counts as an error kind.
fn split_error(text: &str) -> (Option<&str>, &str) {
    if let Some((head, rest)) = text.split_once(' ') {
        let is_kind = !head.is_empty()
            && head
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_');
        let rest = rest.trim_start();
        if is_kind && !rest.is_empty() {
            return (Some(head), rest);
        }
    }
    (None, text)
}

fn flatten(value: &RespValue, out: &mut Vec<Vec<u8>>) {
    match value {
        RespValue::Bulk(Some(data)) => out.push(data.clone()),
        // Keep positions stable for MGET-style replies.
        RespValue::Bulk(None) => out.push(Vec::new()),
        RespValue::Simple(text) | RespValue::Error(text) => out.push(text.clone()),
        RespValue::Integer(n) => out.push(n.to_string().into_bytes()),
        RespValue::Array(items) => items.iter().for_each(|item| flatten(item, out)),
    }
}
