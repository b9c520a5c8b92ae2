//! Error taxonomy for the FastCGI client.
//!
//! # Design Decisions
//! - Peer disconnects are normalized into a single `LostConnection` variant;
//!   it is the only condition the client retries on
//! - Every variant maps to the HTTP status the front end answers with

use std::io;
use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

use crate::fastcgi::protocol::ProtocolStatus;

/// Errors that can occur while talking to a FastCGI responder.
#[derive(Debug, Error)]
pub enum FcgiError {
    /// Dialing the backend failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Dialing the backend did not finish in time.
    #[error("timed out connecting to {addr} after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    /// A call was issued on a client that holds no connection.
    #[error("no connection to server")]
    NotConnected,

    /// The peer closed the stream while a record was being read or written.
    #[error("lost connection to server")]
    LostConnection,

    /// Any other I/O failure on the backend stream.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// Record content larger than the 16-bit length field allows.
    #[error("record content of {0} bytes exceeds the 65535 byte limit")]
    RecordTooLarge(usize),

    /// A body was supplied without a resolvable CONTENT_LENGTH.
    #[error("'CONTENT_LENGTH' should be specified")]
    MissingContentLength,

    /// The responder sent something that cannot be interpreted.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The `Status` header did not start with a numeric code.
    #[error("invalid status header: {0:?}")]
    InvalidStatus(String),

    /// END_REQUEST carried a protocol status other than REQUEST_COMPLETE.
    #[error("request rejected by responder: {0}")]
    Rejected(ProtocolStatus),

    /// The responder wrote to its error stream.
    #[error("fastcgi error: {0}")]
    Stderr(String),

    /// The watchdog closed the connection while the call was in flight.
    #[error("connection expired before the call completed")]
    Expired,

    /// No pooled client became free within the acquire timeout.
    #[error("no client available for {0} within {1:?}")]
    PoolExhausted(String, Duration),

    /// The pool was closed.
    #[error("pool for {0} is closed")]
    PoolClosed(String),

    /// A backend address could not be parsed.
    #[error("invalid backend address: {0}")]
    InvalidAddress(String),

    /// The inbound HTTP request cannot be forwarded.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The CGI environment could not be built.
    #[error("building environment: {0}")]
    Environment(String),
}

/// Result type for FastCGI operations.
pub type FcgiResult<T> = Result<T, FcgiError>;

impl FcgiError {
    /// True when the failure means the peer went away mid-exchange.
    pub fn is_lost_connection(&self) -> bool {
        matches!(self, FcgiError::LostConnection)
    }

    /// True when the connection this error was raised on must not be reused.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            FcgiError::LostConnection
                | FcgiError::Io(_)
                | FcgiError::Expired
                | FcgiError::MalformedResponse(_)
        )
    }

    /// HTTP status the front end answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            FcgiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            FcgiError::Expired
            | FcgiError::DialTimeout { .. }
            | FcgiError::PoolExhausted(..) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FcgiError::Connect { .. } | FcgiError::DialTimeout { .. } => "connect",
            FcgiError::NotConnected | FcgiError::LostConnection => "lost_connection",
            FcgiError::Io(_) => "io",
            FcgiError::RecordTooLarge(_)
            | FcgiError::MissingContentLength
            | FcgiError::MalformedResponse(_)
            | FcgiError::InvalidStatus(_)
            | FcgiError::Rejected(_) => "protocol",
            FcgiError::Stderr(_) => "stderr",
            FcgiError::Expired => "expired",
            FcgiError::PoolExhausted(..) | FcgiError::PoolClosed(_) => "pool",
            FcgiError::InvalidAddress(_)
            | FcgiError::InvalidRequest(_)
            | FcgiError::Environment(_) => "request",
        }
    }
}

impl From<io::Error> for FcgiError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero => FcgiError::LostConnection,
            _ => FcgiError::Io(err),
        }
    }
}
