//! Relay definitions and the priority-ordered set selection works from.

use std::{fmt, sync::Arc, time::Duration};

use ahash::AHashSet;
use courier_common::tracing;
use serde::{Deserialize, Serialize};

use crate::{error::ValidationError, redact::Redactor};

/// How the connection to a relay is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encryption {
    /// Plain SMTP, no TLS at all.
    None,
    /// TLS from the first byte (SMTPS).
    ImplicitTls,
    /// Upgrade with `STARTTLS` when the relay advertises it.
    #[default]
    StartTls,
}

impl Encryption {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ImplicitTls => "implicit_tls",
            Self::StartTls => "starttls",
        }
    }

    /// Port conventionally used with this mode.
    #[must_use]
    pub const fn conventional_port(self) -> u16 {
        match self {
            Self::None => 25,
            Self::ImplicitTls => 465,
            Self::StartTls => 587,
        }
    }
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A credential secret. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secret: Secret,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::new(secret),
        }
    }
}

mod defaults {
    pub const fn timeout_secs() -> u64 {
        30
    }

    pub const fn max_retries() -> u32 {
        3
    }
}

/// Connection facts for one outbound relay. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelayRecord {
    name: String,

    /// Higher is preferred; equal priorities keep declaration order.
    #[serde(default)]
    priority: i64,

    host: String,
    port: u16,

    #[serde(default)]
    credentials: Option<Credentials>,

    #[serde(default)]
    encryption: Encryption,

    /// Bound on one connect-and-deliver try.
    #[serde(default = "defaults::timeout_secs")]
    timeout_secs: u64,

    /// Further tries against this relay after a transient failure.
    #[serde(default = "defaults::max_retries")]
    max_retries: u32,
}

impl RelayRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            host: host.into(),
            port,
            credentials: None,
            encryption: Encryption::default(),
            timeout_secs: defaults::timeout_secs(),
            max_retries: defaults::max_retries(),
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub const fn with_encryption(mut self, encryption: Encryption) -> Self {
        self.encryption = encryption;
        self
    }

    #[must_use]
    pub const fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn priority(&self) -> i64 {
        self.priority
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, as handed to the socket layer.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    #[must_use]
    pub const fn encryption(&self) -> Encryption {
        self.encryption
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Names of the fields that differ from `other`, for reload summaries.
    #[must_use]
    pub fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.host != other.host {
            fields.push("host");
        }
        if self.port != other.port {
            fields.push("port");
        }
        if self.credentials != other.credentials {
            fields.push("credentials");
        }
        if self.priority != other.priority {
            fields.push("priority");
        }
        if self.encryption != other.encryption {
            fields.push("encryption");
        }
        if self.timeout_secs != other.timeout_secs {
            fields.push("timeout");
        }
        if self.max_retries != other.max_retries {
            fields.push("max_retries");
        }
        fields
    }

    /// Checks the record on its own. Uniqueness is checked by [`ConfigurationSet`].
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName { index });
        }
        if self.host.trim().is_empty() {
            return Err(ValidationError::EmptyHost(self.name.clone()));
        }
        if self.port == 0 {
            return Err(ValidationError::InvalidPort(self.name.clone()));
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout(self.name.clone()));
        }
        if self
            .credentials
            .as_ref()
            .is_some_and(|c| c.username.trim().is_empty())
        {
            return Err(ValidationError::EmptyUsername(self.name.clone()));
        }

        match (self.encryption, self.port) {
            (Encryption::ImplicitTls, 25 | 587) | (Encryption::StartTls | Encryption::None, 465) => {
                tracing::warn!(
                    relay = %self.name,
                    port = self.port,
                    encryption = %self.encryption,
                    expected = self.encryption.conventional_port(),
                    "Unusual port for this encryption mode"
                );
            }
            _ => {}
        }

        Ok(())
    }
}

/// The relays in canonical selection order, plus the manual pin.
///
/// Sorted once on construction by descending priority; the sort is stable, so
/// relays of equal priority stay in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationSet {
    relays: Arc<[RelayRecord]>,
    preferred: Option<String>,
    redactor: Redactor,
}

impl ConfigurationSet {
    /// Validates and orders `records`. An empty list is accepted here.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if any record is invalid, two records share a
    /// name, or two records point at the same host, port and username.
    pub fn new(mut records: Vec<RelayRecord>) -> Result<Self, ValidationError> {
        let mut names = AHashSet::with_capacity(records.len());
        let mut endpoints: Vec<(String, &str)> = Vec::with_capacity(records.len());

        for (index, record) in records.iter().enumerate() {
            record.validate(index)?;

            if !names.insert(record.name.as_str()) {
                return Err(ValidationError::DuplicateName(record.name.clone()));
            }

            let endpoint = format!(
                "{}:{}:{}",
                record.host.to_ascii_lowercase(),
                record.port,
                record.credentials.as_ref().map_or("", |c| c.username.as_str())
            );
            if let Some((_, first)) = endpoints.iter().find(|(e, _)| *e == endpoint) {
                return Err(ValidationError::DuplicateEndpoint {
                    first: (*first).to_string(),
                    second: record.name.clone(),
                    endpoint: record.address(),
                });
            }
            endpoints.push((endpoint, record.name.as_str()));
        }

        records.sort_by(|a, b| b.priority.cmp(&a.priority));
        let redactor = Redactor::for_relays(&records);

        Ok(Self {
            relays: records.into(),
            preferred: None,
            redactor,
        })
    }

    /// A copy of this set with a different pin. Callers check the name exists.
    #[must_use]
    pub(crate) fn with_preferred(&self, preferred: Option<String>) -> Self {
        Self {
            relays: Arc::clone(&self.relays),
            preferred,
            redactor: self.redactor.clone(),
        }
    }

    #[must_use]
    pub fn relays(&self) -> &[RelayRecord] {
        &self.relays
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RelayRecord> {
        self.relays.iter()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RelayRecord> {
        self.relays.iter().find(|r| r.name == name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.relays.iter().map(|r| r.name.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.relays.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    #[must_use]
    pub fn preferred(&self) -> Option<&str> {
        self.preferred.as_deref()
    }

    /// Scrubs every secret in this set from error text.
    #[must_use]
    pub const fn redactor(&self) -> &Redactor {
        &self.redactor
    }
}

impl<'a> IntoIterator for &'a ConfigurationSet {
    type Item = &'a RelayRecord;
    type IntoIter = std::slice::Iter<'a, RelayRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
