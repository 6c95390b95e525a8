//! SASL encodings for `AUTH PLAIN` (RFC 4616) and `AUTH LOGIN`.

use base64::{Engine, engine::general_purpose::STANDARD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
}

impl AuthMechanism {
    /// Pick the mechanism to use from those a server advertises, `PLAIN` first.
    #[must_use]
    pub fn choose(advertised: &[String]) -> Option<Self> {
        let offers = |name: &str| advertised.iter().any(|m| m.eq_ignore_ascii_case(name));

        if offers("PLAIN") {
            Some(Self::Plain)
        } else if offers("LOGIN") {
            Some(Self::Login)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// Initial response for `AUTH PLAIN`: `base64("\0" user "\0" secret)`.
pub(crate) fn plain_token(username: &str, secret: &str) -> String {
    STANDARD.encode(format!("\0{username}\0{secret}"))
}

pub(crate) fn encode(value: &str) -> String {
    STANDARD.encode(value)
}
