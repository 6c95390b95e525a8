use std::io;

use thiserror::Error;

/// Why an SMTP session could not continue.
///
/// Negative SMTP replies are not errors at this level: commands hand back the
/// [`Response`](super::Response) and the caller decides what a 4xx or 5xx means.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// The relay sent bytes that are not an SMTP reply.
    #[error("Malformed reply: {0}")]
    ParseError(String),

    /// TLS setup or handshake failed.
    #[error("TLS failure: {0}")]
    TlsError(String),

    /// The server does not offer an authentication mechanism this client speaks.
    #[error("No supported AUTH mechanism advertised (server offers: {0})")]
    AuthUnsupported(String),

    /// A reply the protocol does not allow at this point, e.g. 334 outside AUTH.
    #[error("Reply {code} not valid here: {message}")]
    UnexpectedResponse { code: u16, message: String },

    /// Message could not be assembled.
    #[error("Invalid message: {0}")]
    BuilderError(String),

    #[error("Relay closed the connection")]
    ConnectionClosed,

    #[error("Reply is not valid UTF-8: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// Returns `true` if the failure happened below the SMTP dialogue (socket or TLS).
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::TlsError(_) | Self::ConnectionClosed)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
