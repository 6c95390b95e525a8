use serde::{Deserialize, Serialize};

use crate::{
    address::{Address, AddressList},
    error::AddressError,
};

/// Delivery addressing for one message, separate from its headers.
///
/// Recipients are everything the relay is asked to deliver to (To, Cc and Bcc), so
/// an envelope can legitimately list addresses that never appear in the message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    sender: Address,
    recipients: AddressList,
}

impl Envelope {
    #[inline]
    pub const fn new(sender: Address, recipients: AddressList) -> Self {
        Self { sender, recipients }
    }

    /// Parse a sender and recipient list into an envelope.
    ///
    /// # Errors
    ///
    /// Returns the first [`AddressError`] encountered.
    pub fn parse<S: AsRef<str>>(sender: &str, recipients: &[S]) -> Result<Self, AddressError> {
        Ok(Self {
            sender: Address::parse(sender)?,
            recipients: AddressList::parse(recipients)?,
        })
    }

    /// Returns a reference to the [`Envelope`] sender for this message
    #[inline]
    pub const fn sender(&self) -> &Address {
        &self.sender
    }

    /// Returns a reference to the [`Envelope`] recipients for this message
    #[inline]
    pub const fn recipients(&self) -> &AddressList {
        &self.recipients
    }

    /// Returns a mutable reference to the [`Envelope`] recipients for this message
    #[inline]
    pub const fn recipients_mut(&mut self) -> &mut AddressList {
        &mut self.recipients
    }
}
