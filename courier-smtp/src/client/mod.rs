//! SMTP submission client.
//!
//! A single [`SmtpClient`] owns one connection for the lifetime of one delivery:
//! connect (plain or implicit TLS), greet, `EHLO`, optionally `STARTTLS` and `AUTH`,
//! then the mail transaction and `QUIT`. Nothing is pooled or shared between callers.
//!
//! ```no_run
//! use courier_smtp::client::SmtpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SmtpClient::connect("relay.example.com:587", "relay.example.com").await?;
//! client.read_greeting().await?;
//! client.ehlo("client.example.com").await?;
//! client.starttls().await?;
//! client.ehlo("client.example.com").await?;
//! client.authenticate("user", "secret").await?;
//! client.mail_from("sender@example.com").await?;
//! client.rcpt_to("recipient@example.com").await?;
//! client.data().await?;
//! client.send_data(b"Subject: Test\r\n\r\nHello World\r\n").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod error;
mod message;
mod response;
mod smtp_client;
mod tls;

pub use auth::AuthMechanism;
pub use error::{ClientError, Result};
pub use message::{Attachment, MessageBuilder};
pub use response::{Capabilities, EnhancedStatus, Response, ResponseLine};
pub use smtp_client::SmtpClient;
