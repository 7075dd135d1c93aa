//! Error types for client bootstrap and transport operations

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the bootstrap core, transport channel and managers can report.
///
/// The type is `Clone` so a single close cause can be handed to every
/// request that was still waiting on the channel.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// An operation was invoked in a state that does not allow it
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// The server refused the handshake (credentials, database, ...)
    #[error("Handshake rejected: {message}")]
    HandshakeRejected { message: String },

    /// The transport is closed or dropped while a request was outstanding
    #[error("Connection closed: {message}")]
    ConnectionClosed { message: String },

    /// The shared execution resource could not be created or resolved
    #[error("Resource creation failed: {message}")]
    ResourceCreationFailed { message: String },

    /// Operation timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// I/O operation errors
    #[error("I/O error: {source}")]
    Io { source: Arc<std::io::Error> },

    /// Frame or payload encoding failures
    #[error("Codec error: {message}")]
    Codec { message: String },

    /// Protocol-level errors reported by the server
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The server answered with something the client cannot interpret
    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    /// A text command could not be parsed
    #[error("Invalid command: {message}")]
    InvalidCommand { message: String },

    /// Configuration loading or validation errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl Error {
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Error::InvalidState { message: msg.into() }
    }

    pub fn handshake_rejected<S: Into<String>>(msg: S) -> Self {
        Error::HandshakeRejected { message: msg.into() }
    }

    pub fn connection_closed<S: Into<String>>(msg: S) -> Self {
        Error::ConnectionClosed { message: msg.into() }
    }

    pub fn resource_creation<S: Into<String>>(msg: S) -> Self {
        Error::ResourceCreationFailed { message: msg.into() }
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout { message: msg.into() }
    }

    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Error::Codec { message: msg.into() }
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol { message: msg.into() }
    }

    pub fn invalid_response<S: Into<String>>(msg: S) -> Self {
        Error::InvalidResponse { message: msg.into() }
    }

    pub fn invalid_command<S: Into<String>>(msg: S) -> Self {
        Error::InvalidCommand { message: msg.into() }
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config { message: msg.into() }
    }

    /// Whether retrying against the same configuration could succeed.
    ///
    /// Transport failures are retryable; rejected handshakes, misuse and bad
    /// configuration are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed { .. } | Error::Timeout { .. } | Error::Io { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            source: Arc::new(err),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(Error::connection_closed("reset").is_retryable());
        assert!(Error::timeout("handshake").is_retryable());
        let io: Error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(io.is_retryable());
    }

    #[test]
    fn configuration_errors_are_terminal() {
        assert!(!Error::handshake_rejected("WRONGPASS").is_retryable());
        assert!(!Error::invalid_state("already connected").is_retryable());
        assert!(!Error::config("bad address").is_retryable());
    }

    #[test]
    fn clone_keeps_io_source() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert!(copy.to_string().contains("pipe"));
    }
}
