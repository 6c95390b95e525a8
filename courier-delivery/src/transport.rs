//! The seam between the failover engine and whatever actually talks SMTP.

use std::fmt;

use async_trait::async_trait;
use courier_common::envelope::Envelope;
use serde::Serialize;
use thiserror::Error;

use crate::relay::RelayRecord;

/// Point in the SMTP dialogue a reply belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtpStage {
    Greeting,
    Ehlo,
    StartTls,
    Auth,
    MailFrom,
    RcptTo,
    Data,
    DataEnd,
}

impl fmt::Display for SmtpStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Greeting => "greeting",
            Self::Ehlo => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::Auth => "AUTH",
            Self::MailFrom => "MAIL FROM",
            Self::RcptTo => "RCPT TO",
            Self::Data => "DATA",
            Self::DataEnd => "end of data",
        })
    }
}

/// Raw outcome of a failed delivery, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The relay answered with a reply code other than the one expected.
    #[error("{stage} rejected with {code}: {message}")]
    Reply {
        stage: SmtpStage,
        code: u16,
        message: String,
    },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("TLS failure: {0}")]
    Tls(String),

    /// Credentials are configured but the relay offers no usable mechanism.
    #[error("Authentication unavailable: {0}")]
    AuthUnavailable(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The request itself is unusable, whichever relay it goes to.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    #[must_use]
    pub fn reply(stage: SmtpStage, code: u16, message: impl Into<String>) -> Self {
        Self::Reply {
            stage,
            code,
            message: message.into(),
        }
    }
}

/// What a relay said when it took the message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Accepted {
    /// Message id reported by the transport, if it knows one.
    pub message_id: Option<String>,
    /// Final reply text, e.g. `2.0.0 Ok: queued as 4F2A1`.
    pub response: String,
}

/// Delivers one message through one relay.
///
/// Each call opens its own connection and releases it before returning, so a
/// transport can be shared by any number of concurrent sends.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(
        &self,
        relay: &RelayRecord,
        envelope: &Envelope,
        message: &[u8],
    ) -> Result<Accepted, TransportError>;

    /// Connects, negotiates and authenticates without sending anything.
    async fn probe(&self, relay: &RelayRecord) -> Result<(), TransportError>;
}
