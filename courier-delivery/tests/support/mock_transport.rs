//! Scripted [`Transport`] that never touches the network.
//!
//! Each relay gets a queue of outcomes consumed one per delivery. When a relay's
//! queue is empty the relay's default applies, and relays with no script accept.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_common::envelope::Envelope;
use courier_delivery::{Accepted, RelayRecord, SmtpStage, Transport, TransportError};
use dashmap::DashMap;
use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub enum Script {
    Accept,
    Fail(TransportError),
    Hang,
    /// Waits, then accepts.
    Slow(Duration),
}

impl Script {
    pub fn temporary() -> Self {
        Self::Fail(TransportError::reply(SmtpStage::Greeting, 421, "Service not available"))
    }

    pub fn refused() -> Self {
        Self::Fail(TransportError::Connection("connection refused".to_string()))
    }

    pub fn auth_failed() -> Self {
        Self::Fail(TransportError::reply(
            SmtpStage::Auth,
            535,
            "5.7.8 Authentication credentials invalid",
        ))
    }

    pub fn unknown_user() -> Self {
        Self::Fail(TransportError::reply(
            SmtpStage::RcptTo,
            550,
            "5.1.1 User unknown",
        ))
    }
}

#[derive(Default)]
struct Plan {
    queued: VecDeque<Script>,
    fallback: Option<Script>,
}

#[derive(Default, Clone)]
pub struct MockTransport {
    plans: Arc<DashMap<String, Mutex<Plan>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues outcomes for the next deliveries through `relay`.
    pub fn script(&self, relay: &str, outcomes: impl IntoIterator<Item = Script>) -> &Self {
        self.plans
            .entry(relay.to_string())
            .or_default()
            .lock()
            .queued
            .extend(outcomes);
        self
    }

    /// Outcome for every delivery through `relay` once its queue runs out.
    pub fn always(&self, relay: &str, outcome: Script) -> &Self {
        self.plans.entry(relay.to_string()).or_default().lock().fallback = Some(outcome);
        self
    }

    /// Relay names in delivery order, one entry per try.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, relay: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == relay).count()
    }

    fn next(&self, relay: &str) -> Script {
        self.plans
            .get(relay)
            .map(|plan| {
                let mut plan = plan.lock();
                plan.queued
                    .pop_front()
                    .or_else(|| plan.fallback.clone())
                    .unwrap_or(Script::Accept)
            })
            .unwrap_or(Script::Accept)
    }

    async fn play(&self, relay: &RelayRecord) -> Result<Accepted, TransportError> {
        self.calls.lock().push(relay.name().to_string());

        match self.next(relay.name()) {
            Script::Accept => Ok(Accepted {
                message_id: None,
                response: format!("2.0.0 Ok: queued by {}", relay.name()),
            }),
            Script::Fail(error) => Err(error),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(TransportError::Connection("hung".to_string()))
            }
            Script::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(Accepted {
                    message_id: None,
                    response: "2.0.0 Ok".to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn deliver(
        &self,
        relay: &RelayRecord,
        _envelope: &Envelope,
        _message: &[u8],
    ) -> Result<Accepted, TransportError> {
        self.play(relay).await
    }

    async fn probe(&self, relay: &RelayRecord) -> Result<(), TransportError> {
        self.play(relay).await.map(|_| ())
    }
}
