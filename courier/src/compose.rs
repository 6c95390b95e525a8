//! Turns a caller's request into an envelope and a transport-ready message.

use std::collections::HashSet;

use courier_common::{
    address::{Address, AddressList},
    envelope::Envelope,
};
use courier_smtp::{MessageBuilder, client::Attachment};
use serde::Deserialize;

use crate::error::ComposeError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendRequest {
    /// Falls back to the configured default sender.
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    /// Receives the message without appearing in its headers.
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(skip)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone)]
pub struct Composed {
    pub envelope: Envelope,
    pub message: Vec<u8>,
}

/// Builds the envelope (to, cc and bcc, each address once) and the message.
///
/// # Errors
///
/// Returns a [`ComposeError`] if there is no sender, an address is invalid, or
/// header text contains a line break.
pub fn compose(request: &SendRequest, default_sender: Option<&str>) -> Result<Composed, ComposeError> {
    let from = request
        .from
        .as_deref()
        .filter(|from| !from.trim().is_empty())
        .or(default_sender)
        .ok_or(ComposeError::NoSender)?;
    let sender = Address::parse(from)?;

    let to = AddressList::parse(&request.to)?;
    let cc = AddressList::parse(&request.cc)?;
    let bcc = AddressList::parse(&request.bcc)?;

    let mut seen = HashSet::new();
    let recipients: AddressList = to
        .iter()
        .chain(cc.iter())
        .chain(bcc.iter())
        .filter(|address| seen.insert(address.to_string()))
        .cloned()
        .collect();

    let mut builder = MessageBuilder::new()
        .from(sender.mailbox())
        .subject(request.subject.as_str());
    for address in to.iter() {
        builder = builder.to(address.mailbox());
    }
    for address in cc.iter() {
        builder = builder.cc(address.mailbox());
    }
    if let Some(reply_to) = &request.reply_to {
        builder = builder.reply_to(Address::parse(reply_to)?.mailbox());
    }
    if !request.body.is_empty() || request.html.is_none() {
        builder = builder.text(request.body.as_str());
    }
    if let Some(html) = &request.html {
        builder = builder.html(html.as_str());
    }
    for attachment in &request.attachments {
        builder = builder.attach(
            attachment.filename.as_str(),
            attachment.content_type.as_str(),
            attachment.data.clone(),
        );
    }

    Ok(Composed {
        envelope: Envelope::new(sender, recipients),
        message: builder.build()?,
    })
}
