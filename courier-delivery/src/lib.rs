//! Multi-relay selection and failover for outbound mail.
//!
//! A [`ConfigurationManager`] holds the prioritised relay set and per-relay health.
//! A [`FailoverCoordinator`] turns one send into attempts against the candidates the
//! [`RelaySelector`] picks, through a [`DeliveryExecutor`] that drives a
//! [`Transport`].

mod coordinator;
mod error;
mod executor;
mod health;
mod manager;
pub mod redact;
mod relay;
mod selector;
mod smtp_transaction;
mod transport;

pub use coordinator::{AttemptRecord, FailoverCoordinator, ProbeReport, RequestLimits, SendReceipt};
pub use error::{
    DeliveryError, ErrorKind, RelayError, RequestError, SendFailure, TemporaryError,
    ValidationError,
};
pub use executor::{Delivered, DeliveryExecutor, ExecutorConfig, Outcome};
pub use health::{BackoffPolicy, HealthSnapshot, HealthTracker};
pub use manager::{
    ConfigurationManager, RelayChange, RelayStatus, ReloadSummary, StatusReport, SwitchOutcome,
};
pub use relay::{ConfigurationSet, Credentials, Encryption, RelayRecord, Secret};
pub use selector::RelaySelector;
pub use smtp_transaction::{SmtpTransport, SmtpTransportConfig};
pub use transport::{Accepted, SmtpStage, Transport, TransportError};
