//! # Result Codes and Errors
//!
//! Purpose: Define the closed set of result codes shared by every KVLink
//! component, plus the error value that carries one of them.
//!
//! ## Design Principles
//! 1. **Closed Taxonomy**: Every failure maps onto exactly one `ErrorCode`.
//! 2. **Stable Numbers**: Codes keep fixed negative values so presentation
//!    layers can print or compare them without matching on Rust types.
//! 3. **Message Travels With Code**: `KvError` pairs the code with either a
//!    default message or the server's own error text.
//!
//! ## Code Table
//!
//! ```text
//! STATUS_OK =  1    NETERR  =  -4    SYSBUSY  =  -7    NETCLOSE = -10
//! FAIL      = -1    TIMEOUT =  -5    PARAMERR =  -8    NETDELAY = -11
//! IOERR     = -2    DATAERR =  -6    NOTFOUND =  -9    AUTHFAIL = -12
//! SYSERR    = -3
//! ```

use std::fmt;

use thiserror::Error;

/// Result value reported for a successful status reply.
pub const STATUS_OK: i32 = 1;

/// Negative result codes reported by client operations.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The server rejected the command (error reply) or the session is closed.
    Fail = -1,
    /// Local I/O failure outside of the socket send/receive path.
    IoErr = -2,
    /// Operating-system level failure.
    SysErr = -3,
    /// Fatal network failure while connecting, sending or receiving.
    NetErr = -4,
    /// No complete reply within the logical timeout.
    Timeout = -5,
    /// Reply bytes violate RESP framing.
    DataErr = -6,
    /// No resource available (pool exhausted).
    SysBusy = -7,
    /// Invalid argument or a reply larger than the receive buffer.
    ParamErr = -8,
    /// Null bulk reply: the requested element does not exist.
    NotFound = -9,
    /// Peer closed the connection.
    NetClose = -10,
    /// Network too slow to make progress.
    NetDelay = -11,
    /// Server rejected the credential.
    AuthFail = -12,
}

impl ErrorCode {
    /// Every code, ordered by descending numeric value.
    pub const ALL: [ErrorCode; 12] = [
        ErrorCode::Fail,
        ErrorCode::IoErr,
        ErrorCode::SysErr,
        ErrorCode::NetErr,
        ErrorCode::Timeout,
        ErrorCode::DataErr,
        ErrorCode::SysBusy,
        ErrorCode::ParamErr,
        ErrorCode::NotFound,
        ErrorCode::NetClose,
        ErrorCode::NetDelay,
        ErrorCode::AuthFail,
    ];

    /// Returns the numeric (negative) code.
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Maps a numeric code back to its variant.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|candidate| candidate.code() == code)
    }

    /// Upper-case name used in logs and presentation output.
    pub const fn name(self) -> &'static str {
        match self {
            ErrorCode::Fail => "FAIL",
            ErrorCode::IoErr => "IOERR",
            ErrorCode::SysErr => "SYSERR",
            ErrorCode::NetErr => "NETERR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::DataErr => "DATAERR",
            ErrorCode::SysBusy => "SYSBUSY",
            ErrorCode::ParamErr => "PARAMERR",
            ErrorCode::NotFound => "NOTFOUND",
            ErrorCode::NetClose => "NETCLOSE",
            ErrorCode::NetDelay => "NETDELAY",
            ErrorCode::AuthFail => "AUTHFAIL",
        }
    }

    /// Default human-readable message for the code.
    pub const fn message(self) -> &'static str {
        match self {
            ErrorCode::Fail => "command failed",
            ErrorCode::IoErr => "io error",
            ErrorCode::SysErr => "system error",
            ErrorCode::NetErr => "network error",
            ErrorCode::Timeout => "response timeout",
            ErrorCode::DataErr => "protocol error",
            ErrorCode::SysBusy => "system busy",
            ErrorCode::ParamErr => "parameter error",
            ErrorCode::NotFound => "element not found",
            ErrorCode::NetClose => "connection closed",
            ErrorCode::NetDelay => "network delay",
            ErrorCode::AuthFail => "authentication failed",
        }
    }

    /// Returns true when a connection that produced this code can no longer
    /// be trusted to be in sync with the server.
    ///
    /// Server rejections, missing elements and pool exhaustion leave the
    /// session intact; everything else does not.
    pub const fn breaks_connection(self) -> bool {
        !matches!(
            self,
            ErrorCode::Fail | ErrorCode::NotFound | ErrorCode::SysBusy
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error value returned by every fallible KVLink operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}({}): {message}", code.code())]
pub struct KvError {
    code: ErrorCode,
    message: String,
}

impl KvError {
    /// Creates an error with an explicit message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        KvError {
            code,
            message: message.into(),
        }
    }

    /// Creates an error carrying the code's default message.
    pub fn from_code(code: ErrorCode) -> Self {
        KvError::new(code, code.message())
    }

    /// Returns the error variant.
    #[inline]
    pub fn kind(&self) -> ErrorCode {
        self.code
    }

    /// Returns the numeric (negative) code.
    #[inline]
    pub fn code(&self) -> i32 {
        self.code.code()
    }

    /// Returns the error message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Result alias used across the workspace.
pub type KvResult<T> = Result<T, KvError>;
