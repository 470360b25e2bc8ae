//! Errors raised by the daemon core.

use std::io;

/// A `Result` alias for operations inside the core.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy shared by the connection engine, the protocol engine,
/// and the control surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fatal configuration problem detected at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An I/O failure on the socket.
    #[error("an io error occurred")]
    Io(#[from] io::Error),

    /// A TLS setup or handshake failure.
    #[error("a TLS error occurred")]
    Tls(#[from] native_tls::Error),

    /// A line that could not be parsed as an IRC message.
    #[error("invalid message: {string}")]
    InvalidMessage {
        /// The line that failed to parse.
        string: String,
        /// The detailed parse error.
        #[source]
        cause: MessageParseError,
    },

    /// A control operation was invoked while the connection is not alive.
    #[error("not connected to the server")]
    NotConnected,

    /// A control operation received unusable input.
    #[error("bad request: {0}")]
    BadInput(String),

    /// A LIST or WHOIS request did not complete within the caller's window.
    #[error("request timed out")]
    RequestTimeout,

    /// A lookup against tracked state found nothing.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Errors that occur while parsing a single wire line.
#[derive(Debug, thiserror::Error)]
pub enum MessageParseError {
    /// The line was empty after stripping its terminator.
    #[error("empty message")]
    EmptyMessage,

    /// The command was missing.
    #[error("missing command")]
    MissingCommand,
}
