//! Delivery against a single relay, with in-relay retries for transient failures.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use courier_common::{envelope::Envelope, tracing};
use mailparse::MailHeaderMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::{DeliveryError, TemporaryError},
    relay::RelayRecord,
    transport::{Transport, TransportError},
};

mod defaults {
    pub const fn retry_delay_ms() -> u64 {
        500
    }
}

/// Executor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Fixed pause between tries against the same relay (milliseconds).
    ///
    /// Default: 500 milliseconds
    #[serde(default = "defaults::retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: defaults::retry_delay_ms(),
        }
    }
}

/// A message the relay took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub message_id: String,
    pub response: String,
}

/// The result of trying one relay, including any internal retries.
#[derive(Debug)]
pub struct Outcome {
    pub result: Result<Delivered, DeliveryError>,
    /// Tries made, at least 1.
    pub tries: u32,
    pub elapsed: Duration,
}

impl Outcome {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs deliveries against one relay at a time. Records no health.
#[derive(Clone)]
pub struct DeliveryExecutor {
    transport: Arc<dyn Transport>,
    retry_delay: Duration,
}

impl std::fmt::Debug for DeliveryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryExecutor")
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl DeliveryExecutor {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: ExecutorConfig) -> Self {
        Self {
            transport,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Delivers `message` through `relay`.
    ///
    /// Every try is bounded by the relay's timeout. Transient failures are retried up
    /// to the relay's `max_retries` more times with a fixed pause between tries;
    /// anything else ends the attempt at once. Error text is scrubbed of the relay's
    /// secrets before it is returned.
    #[tracing::instrument(skip_all, fields(relay = %relay.name()))]
    pub async fn attempt(&self, relay: &RelayRecord, envelope: &Envelope, message: &[u8]) -> Outcome {
        let started = Instant::now();
        let limit = relay.max_retries().saturating_add(1);
        let mut tries = 0;

        loop {
            tries += 1;

            let result = match tokio::time::timeout(
                relay.timeout(),
                self.transport.deliver(relay, envelope, message),
            )
            .await
            {
                Ok(Ok(accepted)) => Ok(Delivered {
                    message_id: accepted
                        .message_id
                        .or_else(|| header_message_id(message))
                        .unwrap_or_else(|| generated_message_id(relay)),
                    response: accepted.response,
                }),
                Ok(Err(error)) => Err(scrub(error, relay)),
                Err(_) => Err(TemporaryError::Timeout(relay.timeout()).into()),
            };

            match result {
                Ok(delivered) => {
                    tracing::info!(tries, message_id = %delivered.message_id, "Delivered");
                    return Outcome {
                        result: Ok(delivered),
                        tries,
                        elapsed: started.elapsed(),
                    };
                }
                Err(error) if error.is_temporary() && tries < limit => {
                    tracing::debug!(tries, limit, %error, "Transient failure, retrying relay");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(error) => {
                    tracing::debug!(tries, kind = %error.kind(), %error, "Attempt failed");
                    return Outcome {
                        result: Err(error),
                        tries,
                        elapsed: started.elapsed(),
                    };
                }
            }
        }
    }

    /// Checks that `relay` accepts a connection and our credentials, within its
    /// timeout. Returns how long the check took.
    ///
    /// # Errors
    ///
    /// Returns the classified failure.
    #[tracing::instrument(skip_all, fields(relay = %relay.name()))]
    pub async fn probe(&self, relay: &RelayRecord) -> Result<Duration, DeliveryError> {
        let started = Instant::now();
        match tokio::time::timeout(relay.timeout(), self.transport.probe(relay)).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(error)) => Err(scrub(error, relay)),
            Err(_) => Err(TemporaryError::Timeout(relay.timeout()).into()),
        }
    }
}

fn scrub(error: TransportError, relay: &RelayRecord) -> DeliveryError {
    let redactor = crate::redact::Redactor::for_relays([relay]);
    let clean = |text: String| redactor.redact(&text).into_owned();

    let error = match error {
        TransportError::Reply {
            stage,
            code,
            message,
        } => TransportError::Reply {
            stage,
            code,
            message: clean(message),
        },
        TransportError::Connection(e) => TransportError::Connection(clean(e)),
        TransportError::Tls(e) => TransportError::Tls(clean(e)),
        TransportError::AuthUnavailable(e) => TransportError::AuthUnavailable(clean(e)),
        TransportError::Protocol(e) => TransportError::Protocol(clean(e)),
        TransportError::InvalidRequest(e) => TransportError::InvalidRequest(clean(e)),
    };

    error.into()
}

fn header_message_id(message: &[u8]) -> Option<String> {
    let (headers, _) = mailparse::parse_headers(message).ok()?;
    headers
        .get_first_value("Message-ID")
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

fn generated_message_id(relay: &RelayRecord) -> String {
    format!("<{}@{}>", ulid::Ulid::new(), relay.host())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        relay::Credentials,
        transport::{Accepted, SmtpStage},
    };

    /// Fails the first `failures` calls with `error`, then accepts.
    struct Flaky {
        failures: u32,
        error: TransportError,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, error: TransportError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn deliver(
            &self,
            _relay: &RelayRecord,
            _envelope: &Envelope,
            _message: &[u8],
        ) -> Result<Accepted, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(Accepted {
                    message_id: None,
                    response: "2.0.0 queued".into(),
                })
            }
        }

        async fn probe(&self, _relay: &RelayRecord) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct Hangs;

    #[async_trait]
    impl Transport for Hangs {
        async fn deliver(
            &self,
            _relay: &RelayRecord,
            _envelope: &Envelope,
            _message: &[u8],
        ) -> Result<Accepted, TransportError> {
            std::future::pending().await
        }

        async fn probe(&self, _relay: &RelayRecord) -> Result<(), TransportError> {
            std::future::pending().await
        }
    }

    fn executor(transport: Arc<dyn Transport>) -> DeliveryExecutor {
        DeliveryExecutor::new(transport, ExecutorConfig { retry_delay_ms: 1 })
    }

    fn envelope() -> Envelope {
        Envelope::parse("sender@example.com", &["rcpt@example.org"]).unwrap()
    }

    #[tokio::test]
    async fn test_transient_failures_retried_within_relay() {
        let transport = Flaky::new(2, TransportError::reply(SmtpStage::MailFrom, 451, "try later"));
        let relay = RelayRecord::new("a", "a.example.com", 587).with_max_retries(3);

        let outcome = executor(transport.clone()).attempt(&relay, &envelope(), b"Subject: x\r\n\r\nhi").await;

        assert!(outcome.is_ok());
        assert_eq!(outcome.tries, 3);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let transport = Flaky::new(u32::MAX, TransportError::Connection("refused".into()));
        let relay = RelayRecord::new("a", "a.example.com", 587).with_max_retries(2);

        let outcome = executor(transport.clone()).attempt(&relay, &envelope(), b"x").await;

        assert_eq!(outcome.tries, 3);
        assert!(outcome.result.unwrap_err().is_temporary());
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let transport = Flaky::new(u32::MAX, TransportError::reply(SmtpStage::Auth, 535, "bad credentials"));
        let relay = RelayRecord::new("a", "a.example.com", 587).with_max_retries(5);

        let outcome = executor(transport.clone()).attempt(&relay, &envelope(), b"x").await;

        assert_eq!(outcome.tries, 1);
        assert!(outcome.result.unwrap_err().is_relay_permanent());
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let relay = RelayRecord::new("a", "a.example.com", 587)
            .with_timeout_secs(1)
            .with_max_retries(0);

        let outcome = executor(Arc::new(Hangs)).attempt(&relay, &envelope(), b"x").await;

        assert_eq!(outcome.tries, 1);
        assert!(matches!(
            outcome.result,
            Err(DeliveryError::Temporary(TemporaryError::Timeout(_)))
        ));
        assert!(outcome.elapsed >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_secret_scrubbed_from_error() {
        let transport = Flaky::new(
            u32::MAX,
            TransportError::reply(SmtpStage::Auth, 535, "credentials mailer:hunter2 rejected"),
        );
        let relay = RelayRecord::new("a", "a.example.com", 587)
            .with_credentials(Credentials::new("mailer", "hunter2"));

        let error = executor(transport).attempt(&relay, &envelope(), b"x").await.result.unwrap_err();
        assert!(!error.to_string().contains("hunter2"));
        assert!(error.to_string().contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_message_id_from_header_or_generated() {
        let relay = RelayRecord::new("a", "a.example.com", 587);

        let with_header = executor(Flaky::new(0, TransportError::Protocol(String::new())))
            .attempt(&relay, &envelope(), b"Message-ID: <abc@example.com>\r\n\r\nhi")
            .await;
        assert_eq!(with_header.result.unwrap().message_id, "<abc@example.com>");

        let generated = executor(Flaky::new(0, TransportError::Protocol(String::new())))
            .attempt(&relay, &envelope(), b"Subject: none\r\n\r\nhi")
            .await;
        let id = generated.result.unwrap().message_id;
        assert!(id.starts_with('<') && id.ends_with("@a.example.com>"));
    }
}
