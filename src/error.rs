//! Error types for zero-mysql.

use thiserror::Error;

/// Result type for zero-mysql operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error reported by the server in an ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// MySQL error code (e.g. 1064)
    pub code: u16,
    /// SQLSTATE (5 characters, `HY000` when the server omits it)
    pub sql_state: String,
    /// Human readable message
    pub message: String,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ERROR {} ({}): {}", self.code, self.sql_state, self.message)
    }
}

/// Error type for zero-mysql.
#[derive(Debug, Error)]
pub enum Error {
    /// Server error response. Does not affect connection liveness.
    #[error("MySQL error: {0}")]
    Server(ServerError),

    /// Protocol error (malformed packet, unexpected response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The connection was closed or died and cannot serve commands
    #[error("Connection is unavailable")]
    ConnectionUnavailable,

    /// The resource (e.g. a prepared statement) was explicitly closed
    #[error("{0} is closed")]
    Closed(&'static str),

    /// The transaction was already committed or rolled back
    #[error("Transaction is no longer active")]
    TransactionClosed,

    /// A statement parameter had neither an argument nor a pre-bound value
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    /// Invalid bind target or value
    #[error("Invalid bind: {0}")]
    InvalidBind(String),

    /// Invalid usage (e.g., bad configuration, invalid isolation level)
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Value could not be converted to the requested Rust type
    #[error("Decode error: {0}")]
    Decode(String),

    /// The pool was closed
    #[error("Pool is closed")]
    PoolClosed,
}

impl Error {
    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Protocol(_) | Error::Auth(_) | Error::ConnectionUnavailable
        )
    }

    /// Returns true for errors detected locally before any network interaction.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::Closed(_)
                | Error::TransactionClosed
                | Error::MissingParameter(_)
                | Error::InvalidBind(_)
                | Error::InvalidUsage(_)
        )
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Server(e) => Some(e.sql_state.as_str()),
            _ => None,
        }
    }

    /// Get the MySQL error code if this is a server error.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server(e) => Some(e.code),
            _ => None,
        }
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broken_classification() {
        assert!(Error::Protocol("bad".into()).is_connection_broken());
        assert!(Error::ConnectionUnavailable.is_connection_broken());
        let server = Error::Server(ServerError {
            code: 1062,
            sql_state: "23000".into(),
            message: "Duplicate entry".into(),
        });
        assert!(!server.is_connection_broken());
        assert_eq!(server.sql_state(), Some("23000"));
        assert_eq!(server.server_code(), Some(1062));
    }

    #[test]
    fn test_usage_classification() {
        assert!(Error::MissingParameter("id".into()).is_usage_error());
        assert!(Error::TransactionClosed.is_usage_error());
        assert!(!Error::PoolClosed.is_usage_error());
    }

    #[test]
    fn test_server_error_display() {
        let e = ServerError {
            code: 1146,
            sql_state: "42S02".into(),
            message: "Table 'x' doesn't exist".into(),
        };
        assert_eq!(e.to_string(), "ERROR 1146 (42S02): Table 'x' doesn't exist");
    }
}
