//! Error types for velum

use thiserror::Error;

/// Main error type for velum
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// True for the end-of-stream family of errors. Event loops that
    /// end this way are not worth logging above debug level.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

/// Result type alias for velum
pub type Result<T> = std::result::Result<T, Error>;
