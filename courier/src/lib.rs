//! Outbound mail through prioritised SMTP relays.
//!
//! [`Courier`] ties the failover engine in `courier-delivery` to its surroundings:
//! engine settings from a RON file, relay records from the environment or that file,
//! and composition of a [`SendRequest`] into a message.

pub mod compose;
pub mod config;
mod controller;
pub mod error;
pub mod source;

pub use compose::SendRequest;
pub use config::CourierConfig;
pub use controller::Courier;
pub use error::{ComposeError, ConfigError, CourierError, SourceError};
pub use source::{EnvRelaySource, FileRelaySource, RelaySource, StaticRelaySource};
