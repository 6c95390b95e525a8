//! Error types shared by the courier crates.

use thiserror::Error;

/// Reasons a mailbox could not be turned into an [`Address`](crate::address::Address).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Address is empty")]
    Empty,

    #[error("Unable to parse address '{input}': {reason}")]
    Unparseable { input: String, reason: String },

    /// Groups (`undisclosed-recipients:;`) are header syntax, not envelope addresses.
    #[error("Address '{0}' is a group, expected a single mailbox")]
    Group(String),

    #[error("Expected exactly one mailbox in '{0}'")]
    Multiple(String),

    #[error("Address '{0}' has no local part")]
    MissingLocalPart(String),

    #[error("Address '{0}' has no valid domain")]
    InvalidDomain(String),
}
