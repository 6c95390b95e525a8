#![allow(dead_code)]

pub mod mock_server;
pub mod mock_transport;

use courier_common::envelope::Envelope;
use courier_delivery::{Credentials, RelayRecord};

pub const MESSAGE: &[u8] =
    b"From: sender@example.com\r\nTo: rcpt@example.org\r\nMessage-ID: <fixed@example.com>\r\nSubject: Hi\r\n\r\nHello\r\n";

pub fn envelope() -> Envelope {
    Envelope::parse("sender@example.com", &["rcpt@example.org"]).unwrap()
}

/// A relay with no retries and a short timeout, so tests stay fast.
pub fn relay(name: &str, priority: i64) -> RelayRecord {
    RelayRecord::new(name, format!("{name}.example.com"), 587)
        .with_priority(priority)
        .with_max_retries(0)
        .with_timeout_secs(5)
}

pub fn relay_with_credentials(name: &str, priority: i64, username: &str, secret: &str) -> RelayRecord {
    relay(name, priority).with_credentials(Credentials::new(username, secret))
}
