//! Error types for the MySQL client.
//!
//! Errors divide into two families: those that leave the wire in an
//! indeterminate state (framing desync, truncated payloads, auth failures,
//! I/O) and close the connection, and those the connection survives (server
//! errors, usage errors). [`Error::is_fatal`] makes the distinction; the
//! connection state machine and the pool both consult it.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the MySQL client.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Protocol errors (fatal for the connection)
    // =========================================================================
    /// Malformed packet or unexpected opcode
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Packet sequence id did not match the expected value
    #[error("packet sequence desync: expected {expected}, got {actual}")]
    SequenceDesync { expected: u8, actual: u8 },

    /// Payload ended in the middle of a field
    #[error("truncated packet while reading {0}")]
    Truncated(&'static str),

    // =========================================================================
    // Authentication errors (fatal)
    // =========================================================================
    /// Server rejected credentials or required an unavailable plugin
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Authentication plugin requested by the server is not implemented
    #[error("unsupported authentication plugin: {0}")]
    UnsupportedAuthPlugin(String),

    // =========================================================================
    // Server errors (the connection stays usable)
    // =========================================================================
    /// Error reported by the server in an ERR packet
    #[error("server error {code} ({sqlstate}): {message}")]
    Server {
        code: u16,
        sqlstate: String,
        message: String,
    },

    // =========================================================================
    // Transport errors (fatal)
    // =========================================================================
    /// Underlying socket error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    // =========================================================================
    // Usage errors (the connection stays usable)
    // =========================================================================
    /// A command was issued while another was in flight
    #[error("connection is busy with another command")]
    ConnectionBusy,

    /// Operation on a closed connection
    #[error("connection is closed")]
    ConnectionClosed,

    /// Prepared-statement parameter count does not match the placeholders
    #[error("statement expects {expected} parameters, got {actual}")]
    BadParameterCount { expected: usize, actual: usize },

    /// Server asked for a local file but `local_infile` is not enabled
    #[error("LOCAL INFILE request for {0:?} denied by client policy")]
    LocalInfileDenied(String),

    /// Feature negotiated away or not supported by this client
    #[error("not supported: {0}")]
    Unsupported(String),

    // =========================================================================
    // Pool errors
    // =========================================================================
    /// The pool has been closed
    #[error("pool is closed")]
    PoolClosed,

    /// Timed out waiting for a pooled connection
    #[error("timed out acquiring a connection after {0:?}")]
    PoolTimeout(std::time::Duration),
}

impl Error {
    /// Create a protocol error from a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create an error from a parsed server ERR packet.
    pub fn server(code: u16, sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Server {
            code,
            sqlstate: sqlstate.into(),
            message: message.into(),
        }
    }

    /// Whether this error leaves the wire in an indeterminate state.
    ///
    /// Fatal errors transition the connection to `Closed`; the pool drops
    /// such connections instead of returning them to the idle set.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::SequenceDesync { .. }
                | Error::Truncated(_)
                | Error::Auth(_)
                | Error::UnsupportedAuthPlugin(_)
                | Error::Io(_)
                | Error::Tls(_)
        )
    }

    /// Check if this is a server-reported error (connection still usable).
    pub fn is_server_error(&self) -> bool {
        matches!(self, Error::Server { .. })
    }

    /// MySQL error code, when the server reported one.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = Error::server(1045, "28000", "Access denied for user");
        assert_eq!(
            err.to_string(),
            "server error 1045 (28000): Access denied for user"
        );
    }

    #[test]
    fn test_fatality() {
        assert!(Error::protocol("bad opcode").is_fatal());
        assert!(Error::SequenceDesync {
            expected: 1,
            actual: 3
        }
        .is_fatal());
        assert!(Error::Truncated("column count").is_fatal());
        assert!(Error::Auth("denied".into()).is_fatal());

        assert!(!Error::server(1062, "23000", "Duplicate entry").is_fatal());
        assert!(!Error::ConnectionBusy.is_fatal());
        assert!(!Error::BadParameterCount {
            expected: 2,
            actual: 1
        }
        .is_fatal());
        assert!(!Error::PoolClosed.is_fatal());
    }

    #[test]
    fn test_server_code() {
        assert_eq!(
            Error::server(1062, "23000", "dup").server_code(),
            Some(1062)
        );
        assert_eq!(Error::ConnectionBusy.server_code(), None);
    }
}
