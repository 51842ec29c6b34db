//! Error taxonomy for the probing engine.
//!
//! Only [`ScanError`] ever reaches the caller of a scan. Connection and
//! protocol failures are folded into probe outcomes by the scheduler.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure to obtain a connection that is ready for a TLS handshake.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ConnectError {
    #[error("dns resolution failed for {host}: {reason}")]
    DnsFailure { host: String, reason: String },

    #[error("tcp connection refused: {0}")]
    TcpRefused(String),

    #[error("tcp connect timed out after {0:?}")]
    TcpTimeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("starttls negotiation rejected: {0}")]
    StartTlsRejected(String),

    #[error("proxy tunnel failed: {0}")]
    ProxyFailed(String),

    #[error("local socket resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("connection attempt cancelled")]
    Cancelled,
}

impl ConnectError {
    /// Classify an I/O error raised while connecting a socket.
    pub fn from_io(err: &std::io::Error) -> Self {
        if is_exhaustion(err) {
            return ConnectError::ResourceExhausted(err.to_string());
        }
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ConnectError::TcpRefused(err.to_string()),
            _ => ConnectError::Network(err.to_string()),
        }
    }

    /// Worth another attempt by the scheduler.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ConnectError::ResourceExhausted(_) | ConnectError::Cancelled
        )
    }
}

#[cfg(unix)]
fn is_exhaustion(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EMFILE || code == libc::ENFILE || code == libc::ENOBUFS
    )
}

#[cfg(not(unix))]
fn is_exhaustion(_err: &std::io::Error) -> bool {
    false
}

/// A server response that does not follow the TLS/SSL wire format.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected record content type 0x{0:02x}")]
    UnexpectedContentType(u8),

    #[error("invalid record version {0:#06x}")]
    InvalidRecordVersion(u16),

    #[error("record length {0} exceeds the protocol maximum")]
    OversizedRecord(usize),

    #[error("empty {0} record")]
    EmptyRecord(&'static str),

    #[error("unexpected handshake message type {0} before ServerHello")]
    UnexpectedHandshake(u8),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("server selected cipher suite {0:#06x} that was not offered")]
    UnofferedCipher(u32),

    #[error("{field} of {len} bytes does not fit its length prefix")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("{0}")]
    Invalid(String),
}

/// Errors that abort a whole scan rather than a single probe.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("socket resources exhausted while scanning {target}: {reason}")]
    ResourceExhausted { target: String, reason: String },

    #[error("target {0} was queued more than once")]
    DuplicateTarget(String),

    #[error("probe {probe} was selected more than once for {target}")]
    DuplicateProbe { target: String, probe: String },

    #[error("invalid scan configuration: {0}")]
    InvalidConfig(String),
}

/// Failure to load a trust store.
#[derive(Debug, Error)]
pub enum TrustStoreError {
    #[error("cannot read trust store {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse trust store {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: openssl::error::ErrorStack,
    },

    #[error("trust store {0} contains no certificates")]
    Empty(String),

    #[error("no system trust store found")]
    NoSystemStore,
}
