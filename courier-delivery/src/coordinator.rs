//! One logical send: select candidates, try them in order, record what happened.
//!
//! ```text
//! Selecting ──(no candidates)──────────────────────────> Exhausted(NoAvailableRelay)
//!     │
//!     v
//! Attempting ──(delivered)─────────────────────────────> Succeeded
//!     │  ^
//!     │  └──(relay-level failure, candidates left)── Escalating
//!     │
//!     ├──(request-level failure)───────────────────────> Exhausted(PermanentRequestError)
//!     └──(relay-level failure, none left)──────────────> Exhausted(AllRelaysFailed)
//! ```
//!
//! Candidates are tried strictly one after another. Trying two relays at once could
//! deliver the same message twice.

use std::{sync::Arc, time::Instant};

use courier_common::{envelope::Envelope, tracing};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ErrorKind, RequestError, SendFailure},
    executor::DeliveryExecutor,
    manager::ConfigurationManager,
    relay::RelayRecord,
    selector::RelaySelector,
};

mod defaults {
    pub const fn max_recipients() -> usize {
        100
    }

    pub const fn max_message_bytes() -> usize {
        10 * 1024 * 1024
    }
}

/// Limits checked before any relay is contacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLimits {
    /// Default: 100
    #[serde(default = "defaults::max_recipients")]
    pub max_recipients: usize,

    /// Default: 10 MiB
    #[serde(default = "defaults::max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_recipients: defaults::max_recipients(),
            max_message_bytes: defaults::max_message_bytes(),
        }
    }
}

impl RequestLimits {
    /// # Errors
    ///
    /// Returns the first limit the request breaks.
    pub fn check(&self, envelope: &Envelope, message: &[u8]) -> Result<(), RequestError> {
        let count = envelope.recipients().len();
        if count == 0 {
            return Err(RequestError::NoRecipients);
        }
        if count > self.max_recipients {
            return Err(RequestError::TooManyRecipients {
                count,
                limit: self.max_recipients,
            });
        }
        if message.is_empty() {
            return Err(RequestError::EmptyMessage);
        }
        if message.len() > self.max_message_bytes {
            return Err(RequestError::MessageTooLarge {
                size: message.len(),
                limit: self.max_message_bytes,
            });
        }
        Ok(())
    }
}

/// One relay tried during a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub relay: String,
    pub succeeded: bool,
    /// Tries against this relay, counting in-relay retries.
    pub tries: u32,
    pub elapsed_ms: u64,
    pub error_kind: Option<ErrorKind>,
    /// Failure text, with secrets removed.
    pub error: Option<String>,
}

/// A delivered send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    pub relay: String,
    pub message_id: String,
    pub response: String,
    pub attempts: Vec<AttemptRecord>,
}

/// Probe result for one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub relay: String,
    pub address: String,
    pub priority: i64,
    pub ok: bool,
    pub elapsed_ms: u64,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone)]
pub struct FailoverCoordinator {
    manager: Arc<ConfigurationManager>,
    executor: DeliveryExecutor,
    limits: RequestLimits,
}

impl FailoverCoordinator {
    #[must_use]
    pub const fn new(
        manager: Arc<ConfigurationManager>,
        executor: DeliveryExecutor,
        limits: RequestLimits,
    ) -> Self {
        Self {
            manager,
            executor,
            limits,
        }
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<ConfigurationManager> {
        &self.manager
    }

    /// Delivers `message` to the envelope's recipients through the best relay that
    /// will take it.
    ///
    /// # Errors
    ///
    /// Returns a [`SendFailure`] whose `kind` says whether to retry later, fix the
    /// request, or fix the relays, with every attempt made.
    #[tracing::instrument(skip_all, fields(recipients = envelope.recipients().len()))]
    pub async fn send(&self, envelope: &Envelope, message: &[u8]) -> Result<SendReceipt, SendFailure> {
        if let Err(error) = self.limits.check(envelope, message) {
            tracing::warn!(%error, "Request refused before selection");
            return Err(SendFailure::new(error.kind(), error.to_string(), Vec::new()));
        }

        // Selecting
        let set = self.manager.snapshot();
        let sticky = self.manager.active_relay();
        let candidates =
            RelaySelector::candidates(&set, self.manager.health(), sticky.as_deref(), Instant::now());

        if candidates.is_empty() {
            let detail = if set.is_empty() {
                "No relays are configured".to_string()
            } else {
                format!("All {} relays are cooling down", set.len())
            };
            tracing::warn!(%detail, "No relay available");
            return Err(SendFailure::new(ErrorKind::NoAvailableRelay, detail, Vec::new()));
        }

        let mut attempts = Vec::with_capacity(candidates.len());
        for (index, relay) in candidates.iter().enumerate() {
            // Attempting
            let outcome = self.executor.attempt(relay, envelope, message).await;
            let elapsed_ms = millis(outcome.elapsed);

            let error = match outcome.result {
                Ok(delivered) => {
                    attempts.push(AttemptRecord {
                        relay: relay.name().to_string(),
                        succeeded: true,
                        tries: outcome.tries,
                        elapsed_ms,
                        error_kind: None,
                        error: None,
                    });

                    // Succeeded
                    self.manager.record_success(relay.name());
                    self.manager.set_active_relay(relay.name());
                    return Ok(SendReceipt {
                        relay: relay.name().to_string(),
                        message_id: delivered.message_id,
                        response: delivered.response,
                        attempts,
                    });
                }
                Err(error) => error,
            };

            let detail = set.redactor().redact(&error.to_string()).into_owned();
            attempts.push(AttemptRecord {
                relay: relay.name().to_string(),
                succeeded: false,
                tries: outcome.tries,
                elapsed_ms,
                error_kind: Some(error.kind()),
                error: Some(detail.clone()),
            });

            if error.is_request_level() {
                tracing::warn!(relay = %relay.name(), error = %detail, "Request rejected, not trying other relays");
                return Err(SendFailure::new(error.kind(), detail, attempts));
            }

            // Escalating
            let cooldown = self.manager.record_failure(relay.name(), &detail);
            self.manager.clear_active_relay(relay.name());
            tracing::warn!(
                relay = %relay.name(),
                kind = %error.kind(),
                error = %detail,
                cooldown_secs = cooldown.map(|c| c.as_secs()),
                remaining = candidates.len() - index - 1,
                "Relay failed"
            );
        }

        Err(SendFailure::new(
            ErrorKind::AllRelaysFailed,
            summarise(&candidates, &attempts),
            attempts,
        ))
    }

    /// Probes every configured relay in selection order. Health is not touched.
    pub async fn probe_all(&self) -> Vec<ProbeReport> {
        let set = self.manager.snapshot();
        let mut reports = Vec::with_capacity(set.len());

        for relay in set.iter() {
            let started = Instant::now();
            let result = self.executor.probe(relay).await;

            let (ok, error_kind, error) = match result {
                Ok(_) => (true, None, None),
                Err(error) => (
                    false,
                    Some(error.kind()),
                    Some(set.redactor().redact(&error.to_string()).into_owned()),
                ),
            };

            reports.push(ProbeReport {
                relay: relay.name().to_string(),
                address: relay.address(),
                priority: relay.priority(),
                ok,
                elapsed_ms: millis(started.elapsed()),
                error_kind,
                error,
            });
        }

        reports
    }
}

fn summarise(candidates: &[&RelayRecord], attempts: &[AttemptRecord]) -> String {
    let failures: Vec<String> = attempts
        .iter()
        .filter_map(|a| a.error.as_ref().map(|e| format!("{}: {e}", a.relay)))
        .collect();

    format!(
        "All {} candidate relays failed ({})",
        candidates.len(),
        failures.join("; ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_limits() {
        let limits = RequestLimits {
            max_recipients: 2,
            max_message_bytes: 8,
        };
        let one = Envelope::parse("s@example.com", &["a@example.com"]).unwrap();
        let three =
            Envelope::parse("s@example.com", &["a@example.com", "b@example.com", "c@example.com"])
                .unwrap();
        let none = Envelope::parse::<&str>("s@example.com", &[]).unwrap();

        assert_eq!(limits.check(&one, b"hello"), Ok(()));
        assert_eq!(limits.check(&none, b"hello"), Err(RequestError::NoRecipients));
        assert_eq!(
            limits.check(&three, b"hello"),
            Err(RequestError::TooManyRecipients { count: 3, limit: 2 })
        );
        assert_eq!(limits.check(&one, b""), Err(RequestError::EmptyMessage));
        assert_eq!(
            limits.check(&one, b"123456789"),
            Err(RequestError::MessageTooLarge { size: 9, limit: 8 })
        );
    }

    #[test]
    fn test_default_limits() {
        let limits = RequestLimits::default();
        assert_eq!(limits.max_recipients, 100);
        assert_eq!(limits.max_message_bytes, 10 * 1024 * 1024);
    }
}
