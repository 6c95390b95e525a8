pub mod client;

pub use client::{
    AuthMechanism, Capabilities, ClientError, MessageBuilder, Response, SmtpClient,
};
