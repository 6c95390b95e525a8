//! Failure taxonomy for sends, reloads and switches.
//!
//! Delivery failures fall into three families, and the family decides what the
//! coordinator does next:
//! - [`TemporaryError`]: retried against the same relay, then the next relay
//! - [`RelayError`]: this relay cannot deliver; move on to the next one
//! - [`RequestError`]: no relay can deliver this request; stop

use std::{fmt, time::Duration};

use courier_smtp::client::EnhancedStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    coordinator::AttemptRecord,
    transport::{SmtpStage, TransportError},
};

/// Reply codes that mean the relay refused our credentials or wants them.
const AUTH_CODES: [u16; 4] = [530, 534, 535, 538];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("Relay failure: {0}")]
    Relay(#[from] RelayError),

    #[error("Request rejected: {0}")]
    Request(#[from] RequestError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemporaryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Temporary SMTP error at {stage} ({code}): {message}")]
    SmtpTemporary {
        stage: SmtpStage,
        code: u16,
        message: String,
    },

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Permanent for this relay, but another relay may succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Authentication failed ({code}): {message}")]
    AuthenticationFailed { code: u16, message: String },

    #[error("Authentication unavailable: {0}")]
    AuthenticationUnavailable(String),

    #[error("Rejected at {stage} ({code}): {message}")]
    Rejected {
        stage: SmtpStage,
        code: u16,
        message: String,
    },
}

/// Permanent for the request itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("No recipients given")]
    NoRecipients,

    #[error("Too many recipients: {count} (limit {limit})")]
    TooManyRecipients { count: usize, limit: usize },

    #[error("Message payload is empty")]
    EmptyMessage,

    #[error("Message payload is {size} bytes (limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Recipient rejected ({code}): {message}")]
    InvalidRecipient { code: u16, message: String },

    #[error("Sender rejected ({code}): {message}")]
    InvalidSender { code: u16, message: String },

    #[error("Invalid request: {0}")]
    Malformed(String),
}

impl RequestError {
    /// Problems with the envelope's shape are validation errors; everything else is
    /// a permanent rejection of the request.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NoRecipients | Self::TooManyRecipients { .. } => ErrorKind::ValidationError,
            _ => ErrorKind::PermanentRequestError,
        }
    }
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_relay_permanent(&self) -> bool {
        matches!(self, Self::Relay(_))
    }

    /// Returns `true` if no other relay could do better.
    #[must_use]
    pub const fn is_request_level(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Temporary(_) => ErrorKind::TransientDeliveryError,
            Self::Relay(_) => ErrorKind::PermanentRelayError,
            Self::Request(e) => e.kind(),
        }
    }
}

impl From<TransportError> for DeliveryError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Reply {
                stage,
                code,
                message,
            } => classify_reply(stage, code, message),
            TransportError::Connection(e) => TemporaryError::ConnectionFailed(e).into(),
            TransportError::Tls(e) => TemporaryError::TlsHandshakeFailed(e).into(),
            TransportError::Protocol(e) => TemporaryError::Protocol(e).into(),
            TransportError::AuthUnavailable(e) => RelayError::AuthenticationUnavailable(e).into(),
            TransportError::InvalidRequest(e) => RequestError::Malformed(e).into(),
        }
    }
}

fn classify_reply(stage: SmtpStage, code: u16, message: String) -> DeliveryError {
    match code {
        400..=499 => TemporaryError::SmtpTemporary {
            stage,
            code,
            message,
        }
        .into(),
        500..=599 => {
            if stage == SmtpStage::Auth || AUTH_CODES.contains(&code) {
                return RelayError::AuthenticationFailed { code, message }.into();
            }

            let status = EnhancedStatus::parse(&message);
            match stage {
                SmtpStage::RcptTo if rejects_recipient(code, status, &message) => {
                    RequestError::InvalidRecipient { code, message }.into()
                }
                SmtpStage::MailFrom if rejects_sender(code, status) => {
                    RequestError::InvalidSender { code, message }.into()
                }
                _ => RelayError::Rejected {
                    stage,
                    code,
                    message,
                }
                .into(),
            }
        }
        _ => TemporaryError::Protocol(format!("Unexpected {code} reply at {stage}: {message}"))
            .into(),
    }
}

/// A recipient refusal is about the address unless the relay is refusing to relay
/// for us, which is a property of the relay (5.7.x, "relay access denied").
fn rejects_recipient(code: u16, status: Option<EnhancedStatus>, message: &str) -> bool {
    match status {
        Some(status) if status.subject == 1 => true,
        Some(status) if status.subject == 7 => false,
        _ => match code {
            501 | 553 => true,
            550 | 551 => !message.to_ascii_lowercase().contains("relay"),
            _ => false,
        },
    }
}

fn rejects_sender(code: u16, status: Option<EnhancedStatus>) -> bool {
    match status {
        Some(status) => status.subject == 1 && matches!(status.detail, 7 | 8),
        None => matches!(code, 501 | 553),
    }
}

/// Problems with configuration input or operator commands. Never changes state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Relay #{index} has an empty name")]
    EmptyName { index: usize },

    #[error("Duplicate relay name '{0}'")]
    DuplicateName(String),

    #[error("Relay '{0}' has an empty host")]
    EmptyHost(String),

    #[error("Relay '{0}' has port 0")]
    InvalidPort(String),

    #[error("Relay '{0}' has a zero timeout")]
    InvalidTimeout(String),

    #[error("Relay '{0}' has credentials with an empty username")]
    EmptyUsername(String),

    #[error("Relays '{first}' and '{second}' both use {endpoint} with the same username")]
    DuplicateEndpoint {
        first: String,
        second: String,
        endpoint: String,
    },

    #[error("No relays configured")]
    NoRelays,

    #[error("Unknown relay '{name}' (available: {})", .available.join(", "))]
    UnknownRelay {
        name: String,
        available: Vec<String>,
    },
}

impl ValidationError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownRelay { .. } => ErrorKind::UnknownRelay,
            _ => ErrorKind::ValidationError,
        }
    }
}

/// Coarse failure category reported to callers.
///
/// Tells apart "try again later" (`TransientDeliveryError`, `NoAvailableRelay`),
/// "fix the request" (`ValidationError`, `PermanentRequestError`) and "fix the relay
/// configuration" (`PermanentRelayError`, or `AllRelaysFailed` with relay errors in
/// the attempt log).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    TransientDeliveryError,
    PermanentRelayError,
    PermanentRequestError,
    NoAvailableRelay,
    AllRelaysFailed,
    UnknownRelay,
}

impl ErrorKind {
    /// Returns `true` when the same request may succeed if sent again later.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::TransientDeliveryError | Self::NoAvailableRelay | Self::AllRelaysFailed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a send did not go out, with every attempt that was made.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {detail}")]
pub struct SendFailure {
    pub kind: ErrorKind,
    pub detail: String,
    pub attempts: Vec<AttemptRecord>,
}

impl SendFailure {
    #[must_use]
    pub fn new(kind: ErrorKind, detail: impl Into<String>, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(stage: SmtpStage, code: u16, message: &str) -> DeliveryError {
        TransportError::reply(stage, code, message).into()
    }

    #[test]
    fn test_4xx_is_temporary_everywhere() {
        for stage in [SmtpStage::Greeting, SmtpStage::Auth, SmtpStage::RcptTo, SmtpStage::DataEnd] {
            let error = classify(stage, 451, "4.3.0 try later");
            assert!(error.is_temporary(), "{stage} 451 should be temporary");
            assert_eq!(error.kind(), ErrorKind::TransientDeliveryError);
        }
    }

    #[test]
    fn test_auth_failures_are_relay_level() {
        assert!(matches!(
            classify(SmtpStage::Auth, 535, "5.7.8 bad credentials"),
            DeliveryError::Relay(RelayError::AuthenticationFailed { code: 535, .. })
        ));
        // Authentication required, reported at MAIL FROM.
        assert!(classify(SmtpStage::MailFrom, 530, "5.7.0 Authentication required").is_relay_permanent());
    }

    #[test]
    fn test_recipient_rejections() {
        assert!(classify(SmtpStage::RcptTo, 550, "5.1.1 User unknown").is_request_level());
        assert!(classify(SmtpStage::RcptTo, 553, "mailbox name not allowed").is_request_level());
        assert!(classify(SmtpStage::RcptTo, 550, "No such user here").is_request_level());

        assert!(classify(SmtpStage::RcptTo, 554, "5.7.1 Relay access denied").is_relay_permanent());
        assert!(classify(SmtpStage::RcptTo, 550, "Relaying denied").is_relay_permanent());
    }

    #[test]
    fn test_sender_rejections() {
        assert!(matches!(
            classify(SmtpStage::MailFrom, 553, "5.1.8 Bad sender domain"),
            DeliveryError::Request(RequestError::InvalidSender { .. })
        ));
        assert!(classify(SmtpStage::MailFrom, 550, "5.7.1 Sender not permitted").is_relay_permanent());
    }

    #[test]
    fn test_other_5xx_are_relay_level() {
        assert!(classify(SmtpStage::Greeting, 554, "No service").is_relay_permanent());
        assert!(classify(SmtpStage::DataEnd, 552, "5.3.4 Message too big").is_relay_permanent());
    }

    #[test]
    fn test_transport_failures() {
        assert!(DeliveryError::from(TransportError::Connection("refused".into())).is_temporary());
        assert!(DeliveryError::from(TransportError::Tls("bad cert".into())).is_temporary());
        assert!(DeliveryError::from(TransportError::AuthUnavailable("none".into())).is_relay_permanent());
        assert!(DeliveryError::from(TransportError::InvalidRequest("bad".into())).is_request_level());
        assert!(classify(SmtpStage::Data, 250, "odd").is_temporary());
    }

    #[test]
    fn test_request_error_kinds() {
        assert_eq!(RequestError::NoRecipients.kind(), ErrorKind::ValidationError);
        assert_eq!(RequestError::EmptyMessage.kind(), ErrorKind::PermanentRequestError);
        assert_eq!(
            DeliveryError::from(RequestError::InvalidRecipient {
                code: 550,
                message: String::new()
            })
            .kind(),
            ErrorKind::PermanentRequestError
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ValidationError::UnknownRelay {
                name: "backup".into(),
                available: vec!["primary".into(), "secondary".into()],
            }
            .to_string(),
            "Unknown relay 'backup' (available: primary, secondary)"
        );
        assert_eq!(ErrorKind::NoAvailableRelay.to_string(), "NoAvailableRelay");
        assert_eq!(
            DeliveryError::from(TemporaryError::Timeout(Duration::from_secs(30))).to_string(),
            "Temporary failure: Timed out after 30s"
        );
    }
}
