use std::sync::Arc;

use courier_common::{envelope::Envelope, internal, tracing};
use courier_delivery::{
    ConfigurationManager, DeliveryExecutor, ErrorKind, FailoverCoordinator, ProbeReport,
    RelayRecord, ReloadSummary, SendFailure, SendReceipt, SmtpTransport, StatusReport,
    SwitchOutcome, Transport, ValidationError,
};

use crate::{
    compose::{SendRequest, compose},
    config::CourierConfig,
    error::{CourierError, SourceError},
    source::{EnvRelaySource, FileRelaySource, RelaySource},
};

/// Sends mail through the configured relays and exposes the operator controls:
/// reload, switch, status, check and reconnect.
pub struct Courier {
    coordinator: FailoverCoordinator,
    source: Box<dyn RelaySource>,
    default_sender: Option<String>,
}

impl std::fmt::Debug for Courier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Courier")
            .field("source", &self.source.describe())
            .field("default_sender", &self.default_sender)
            .finish_non_exhaustive()
    }
}

impl Courier {
    /// Delivers over SMTP with relays from `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source fails or its records are invalid.
    pub fn new(config: &CourierConfig, source: impl RelaySource + 'static) -> Result<Self, CourierError> {
        let transport = Arc::new(SmtpTransport::new(config.transport()));
        Self::with_transport(config, source, transport)
    }

    /// Like [`Self::new`], delivering through `transport`.
    ///
    /// A source with no relays at all is accepted: sends fail with
    /// `NoAvailableRelay` until a reload finds some.
    ///
    /// # Errors
    ///
    /// Returns an error if the source fails or its records are invalid.
    pub fn with_transport(
        config: &CourierConfig,
        source: impl RelaySource + 'static,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, CourierError> {
        let records = match source.load() {
            Ok(records) => records,
            Err(SourceError::NoRelays) => {
                tracing::warn!(source = %source.describe(), "No relays configured");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let manager = Arc::new(ConfigurationManager::new(records, config.backoff)?);
        let executor = DeliveryExecutor::new(transport, config.executor());
        let default_sender = config
            .default_sender
            .clone()
            .or_else(|| source.default_sender());

        internal!(
            level = INFO,
            source = %source.describe(),
            relays = manager.snapshot().len(),
            "Courier ready"
        );

        Ok(Self {
            coordinator: FailoverCoordinator::new(manager, executor, config.limits()),
            source: Box::new(source),
            default_sender,
        })
    }

    /// Uses the configuration file that [`CourierConfig::discover`] finds. Relays
    /// come from that file when it lists them, otherwise from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or the relays cannot be loaded.
    pub fn from_environment() -> Result<Self, CourierError> {
        let (config, path) = CourierConfig::discover()?;
        match path {
            Some(path) if config.relays.is_some() => Self::new(&config, FileRelaySource::new(path)),
            _ => Self::new(&config, EnvRelaySource::new()),
        }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<ConfigurationManager> {
        self.coordinator.manager()
    }

    #[must_use]
    pub fn default_sender(&self) -> Option<&str> {
        self.default_sender.as_deref()
    }

    /// Composes and delivers `request`.
    ///
    /// # Errors
    ///
    /// A request that cannot be composed fails with `ValidationError` before any
    /// relay is contacted; otherwise see [`FailoverCoordinator::send`].
    pub async fn send(&self, request: &SendRequest) -> Result<SendReceipt, SendFailure> {
        let composed = compose(request, self.default_sender.as_deref()).map_err(|error| {
            SendFailure::new(ErrorKind::ValidationError, error.to_string(), Vec::new())
        })?;

        self.send_message(&composed.envelope, &composed.message).await
    }

    /// Delivers an already composed message.
    ///
    /// # Errors
    ///
    /// See [`FailoverCoordinator::send`].
    pub async fn send_message(&self, envelope: &Envelope, message: &[u8]) -> Result<SendReceipt, SendFailure> {
        self.coordinator.send(envelope, message).await
    }

    /// Asks the relay source again and swaps in what it returns.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the running configuration alone, if the source fails
    /// or returns an invalid or empty set.
    pub fn reload(&self) -> Result<ReloadSummary, CourierError> {
        let records = match self.source.load() {
            Ok(records) => records,
            Err(SourceError::NoRelays) => return Err(ValidationError::NoRelays.into()),
            Err(e) => return Err(e.into()),
        };
        Ok(self.reload_with(records)?)
    }

    /// # Errors
    ///
    /// See [`ConfigurationManager::reload`].
    pub fn reload_with(&self, records: Vec<RelayRecord>) -> Result<ReloadSummary, ValidationError> {
        self.manager().reload(records)
    }

    /// # Errors
    ///
    /// See [`ConfigurationManager::switch_to`].
    pub fn switch_to(&self, name: Option<&str>) -> Result<SwitchOutcome, ValidationError> {
        self.manager().switch_to(name)
    }

    #[must_use]
    pub fn status(&self) -> StatusReport {
        self.manager().status()
    }

    /// Probes every relay. Health is left as it is.
    pub async fn check(&self) -> Vec<ProbeReport> {
        self.coordinator.probe_all().await
    }

    /// Forgets every cooldown so all relays are tried again from priority order.
    pub fn reconnect(&self) -> StatusReport {
        self.manager().reset_health();
        self.status()
    }
}
