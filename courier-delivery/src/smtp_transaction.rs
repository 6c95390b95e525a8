//! [`Transport`] over SMTP submission.
//!
//! Each call runs one complete session on its own connection:
//! 1. Connect (TLS from the start for implicit TLS) and read the greeting
//! 2. EHLO, then STARTTLS and EHLO again when the relay uses it
//! 3. AUTH when credentials are configured
//! 4. MAIL FROM, RCPT TO for every recipient, DATA and the message
//! 5. QUIT, whose failure is ignored once the message is accepted

use async_trait::async_trait;
use courier_common::{envelope::Envelope, tracing};
use courier_smtp::client::{ClientError, Response, SmtpClient};
use serde::{Deserialize, Serialize};

use crate::{
    relay::{Encryption, RelayRecord},
    transport::{Accepted, SmtpStage, Transport, TransportError},
};

mod defaults {
    pub fn helo_name() -> String {
        "localhost".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpTransportConfig {
    /// Name announced in EHLO.
    #[serde(default = "defaults::helo_name")]
    pub helo_name: String,

    /// Skip certificate verification. Only for relays with self-signed certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for SmtpTransportConfig {
    fn default() -> Self {
        Self {
            helo_name: defaults::helo_name(),
            accept_invalid_certs: false,
        }
    }
}

impl From<ClientError> for TransportError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Io(_) | ClientError::ConnectionClosed => Self::Connection(error.to_string()),
            ClientError::TlsError(e) => Self::Tls(e),
            ClientError::AuthUnsupported(_) => Self::AuthUnavailable(error.to_string()),
            ClientError::BuilderError(e) => Self::InvalidRequest(e),
            ClientError::ParseError(_)
            | ClientError::UnexpectedResponse { .. }
            | ClientError::Utf8Error(_) => Self::Protocol(error.to_string()),
        }
    }
}

/// Accepts `response` if its code is one of `expected`.
fn expect(stage: SmtpStage, response: Response, expected: &[u16]) -> Result<Response, TransportError> {
    if expected.contains(&response.code) {
        Ok(response)
    } else {
        Err(TransportError::reply(stage, response.code, response.message()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SmtpTransport {
    config: SmtpTransportConfig,
}

impl SmtpTransport {
    #[must_use]
    pub fn new(config: SmtpTransportConfig) -> Self {
        if config.accept_invalid_certs {
            tracing::warn!("TLS certificate validation is disabled for all relays");
        }
        Self { config }
    }

    async fn connect(&self, relay: &RelayRecord) -> Result<SmtpClient, TransportError> {
        let address = relay.address();
        let connected = match relay.encryption() {
            Encryption::ImplicitTls => {
                SmtpClient::connect_tls(&address, relay.host(), self.config.accept_invalid_certs).await
            }
            Encryption::StartTls | Encryption::None => SmtpClient::connect(&address, relay.host())
                .await
                .map(|client| client.accept_invalid_certs(self.config.accept_invalid_certs)),
        };

        connected.map_err(|e| match TransportError::from(e) {
            TransportError::Connection(reason) => TransportError::Connection(format!("{address}: {reason}")),
            other => other,
        })
    }

    async fn greet(&self, client: &mut SmtpClient) -> Result<(), TransportError> {
        expect(SmtpStage::Greeting, client.read_greeting().await?, &[220])?;
        expect(SmtpStage::Ehlo, client.ehlo(&self.config.helo_name).await?, &[250])?;
        Ok(())
    }

    /// Connected, greeted, encrypted as configured and authenticated.
    async fn open(&self, relay: &RelayRecord) -> Result<SmtpClient, TransportError> {
        let mut client = self.connect(relay).await?;
        self.greet(&mut client).await?;

        if relay.encryption() == Encryption::StartTls {
            if client.capabilities().supports("STARTTLS") {
                let failure = match client.starttls().await {
                    Ok(response) if response.is_success() => None,
                    Ok(response) => Some(response.to_string()),
                    Err(e) => Some(e.to_string()),
                };

                match failure {
                    None => {
                        expect(SmtpStage::Ehlo, client.ehlo(&self.config.helo_name).await?, &[250])?;
                    }
                    Some(reason) if relay.credentials().is_some() => {
                        return Err(TransportError::Tls(format!("STARTTLS failed: {reason}")));
                    }
                    Some(reason) => {
                        // RFC 3207 section 4.1: opportunistic TLS may fall back to a fresh
                        // plaintext session.
                        tracing::info!(relay = %relay.name(), %reason, "STARTTLS failed, reconnecting without TLS");
                        client = self.connect(relay).await?;
                        self.greet(&mut client).await?;
                    }
                }
            } else if relay.credentials().is_some() {
                return Err(TransportError::AuthUnavailable(
                    "relay does not offer STARTTLS, refusing to send credentials in plaintext".to_string(),
                ));
            } else {
                tracing::debug!(relay = %relay.name(), "STARTTLS not offered, continuing in plaintext");
            }
        }

        if let Some(credentials) = relay.credentials() {
            let response = client
                .authenticate(&credentials.username, credentials.secret.expose())
                .await?;
            expect(SmtpStage::Auth, response, &[235])?;
        }

        Ok(client)
    }

    async fn transaction(
        client: &mut SmtpClient,
        envelope: &Envelope,
        message: &[u8],
    ) -> Result<Accepted, TransportError> {
        let sender = envelope.sender().to_string();
        expect(SmtpStage::MailFrom, client.mail_from(&sender).await?, &[250])?;

        for recipient in envelope.recipients().iter() {
            let response = client.rcpt_to(&recipient.to_string()).await?;
            expect(SmtpStage::RcptTo, response, &[250, 251])?;
        }

        expect(SmtpStage::Data, client.data().await?, &[354])?;
        let response = expect(SmtpStage::DataEnd, client.send_data(message).await?, &[250])?;

        Ok(Accepted {
            message_id: None,
            response: response.message(),
        })
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn deliver(
        &self,
        relay: &RelayRecord,
        envelope: &Envelope,
        message: &[u8],
    ) -> Result<Accepted, TransportError> {
        let mut client = self.open(relay).await?;
        let result = Self::transaction(&mut client, envelope, message).await;

        if let Err(e) = client.quit().await {
            tracing::debug!(relay = %relay.name(), error = %e, "QUIT failed");
        }

        result
    }

    async fn probe(&self, relay: &RelayRecord) -> Result<(), TransportError> {
        let mut client = self.open(relay).await?;
        let _ = client.quit().await;
        Ok(())
    }
}
