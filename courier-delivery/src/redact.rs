//! Keeps credential secrets out of anything that is stored or reported.

use std::{borrow::Cow, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::relay::RelayRecord;

pub const REDACTED: &str = "[REDACTED]";

/// Replaces every configured secret, and the base64 forms a secret takes on the
/// wire during `AUTH`, with [`REDACTED`].
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    needles: Arc<[String]>,
}

impl Redactor {
    pub fn for_relays<'a>(relays: impl IntoIterator<Item = &'a RelayRecord>) -> Self {
        let mut needles: Vec<String> = Vec::new();

        for credentials in relays.into_iter().filter_map(RelayRecord::credentials) {
            let secret = credentials.secret.expose();
            if secret.is_empty() {
                continue;
            }

            let username = credentials.username.as_str();
            needles.push(secret.to_string());
            needles.push(STANDARD.encode(secret));
            needles.push(STANDARD.encode(format!("\0{username}\0{secret}")));
            needles.push(STANDARD.encode(format!("{username}\0{username}\0{secret}")));
        }

        // Longest first, so an encoded token is removed whole before any secret
        // that happens to be a substring of it.
        needles.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        needles.dedup();

        Self {
            needles: needles.into(),
        }
    }

    #[must_use]
    pub fn redact<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut text = Cow::Borrowed(text);
        for needle in self.needles.iter() {
            if text.contains(needle.as_str()) {
                text = Cow::Owned(text.replace(needle.as_str(), REDACTED));
            }
        }
        text
    }
}

/// Shortens a username for display: `mailer@example.com` becomes `ma***@example.com`.
#[must_use]
pub fn mask_username(username: &str) -> String {
    let (local, domain) = username
        .split_once('@')
        .map_or((username, None), |(local, domain)| (local, Some(domain)));

    let shown: String = local.chars().take(2).collect();
    match domain {
        Some(domain) => format!("{shown}***@{domain}"),
        None => format!("{shown}***"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Credentials;

    fn redactor() -> Redactor {
        Redactor::for_relays(&[
            RelayRecord::new("a", "a.example.com", 587)
                .with_credentials(Credentials::new("mailer", "correct-horse")),
            RelayRecord::new("b", "b.example.com", 587),
            RelayRecord::new("c", "c.example.com", 587).with_credentials(Credentials::new("x", "")),
        ])
    }

    #[test]
    fn test_plain_secret_removed() {
        let text = "535 Authentication failed for mailer/correct-horse";
        assert_eq!(
            redactor().redact(text),
            "535 Authentication failed for mailer/[REDACTED]"
        );
    }

    #[test]
    fn test_encoded_forms_removed() {
        let plain = STANDARD.encode("\0mailer\0correct-horse");
        let login = STANDARD.encode("correct-horse");
        let text = format!("rejected AUTH PLAIN {plain} then {login}");

        let redacted = redactor().redact(&text);
        assert!(!redacted.contains(&plain));
        assert!(!redacted.contains(&login));
        assert!(!redacted.contains("correct-horse"));
    }

    #[test]
    fn test_clean_text_is_borrowed() {
        assert!(matches!(redactor().redact("421 try later"), Cow::Borrowed(_)));
        assert!(matches!(Redactor::default().redact("anything"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_mask_username() {
        assert_eq!(mask_username("mailer@example.com"), "ma***@example.com");
        assert_eq!(mask_username("apikey"), "ap***");
        assert_eq!(mask_username("x"), "x***");
    }
}
