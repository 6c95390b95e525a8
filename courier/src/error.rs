use std::path::PathBuf;

use courier_common::error::AddressError;
use courier_delivery::ValidationError;
use courier_smtp::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: ron::error::SpannedError,
    },

    #[error("COURIER_CONFIG points to non-existent file: {}", .0.display())]
    Missing(PathBuf),
}

/// Failure to produce relay records.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Missing required environment variable {0}")]
    MissingVariable(String),

    #[error("Invalid {variable} value '{value}': {reason}")]
    InvalidVariable {
        variable: String,
        value: String,
        reason: String,
    },

    #[error("{0}: STARTTLS and implicit TLS cannot both be enabled")]
    ConflictingEncryption(String),

    #[error("{0}: a username and a password must be given together")]
    IncompleteCredentials(String),

    #[error("No relays configured")]
    NoRelays,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A [`crate::compose::SendRequest`] that cannot become a message.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("No sender given and no default sender configured")]
    NoSender,

    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("Failed to build message: {0}")]
    Message(#[from] ClientError),
}

#[derive(Debug, Error)]
pub enum CourierError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}
