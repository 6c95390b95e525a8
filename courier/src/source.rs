//! Where relay records come from. A source is asked again on every reload.

use std::{path::PathBuf, str::FromStr, sync::Arc};

use courier_delivery::{Credentials, Encryption, RelayRecord};

use crate::{config::CourierConfig, error::SourceError};

pub trait RelaySource: Send + Sync {
    /// Reads the relay records as they are now.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read or are incomplete.
    fn load(&self) -> Result<Vec<RelayRecord>, SourceError>;

    /// Sender this source suggests when the configuration names none.
    fn default_sender(&self) -> Option<String> {
        None
    }

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;
}

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Relays from `SMTP_*` environment variables.
///
/// Numbered relays use `SMTP_HOST_1`, `SMTP_PORT_1`, ... and are read until the first
/// missing `SMTP_HOST_N`. When there are none, a single relay is read from the
/// unsuffixed variables.
///
/// | Variable | Default |
/// |----------|---------|
/// | `SMTP_HOST` | required |
/// | `SMTP_PORT` | required |
/// | `SMTP_USERNAME`, `SMTP_PASSWORD` | none; both or neither |
/// | `SMTP_USE_TLS` | `true` (STARTTLS) |
/// | `SMTP_USE_SSL` | `false` (implicit TLS) |
/// | `SMTP_TIMEOUT` | `30` |
/// | `SMTP_MAX_RETRIES` | `3` |
/// | `SMTP_NAME` | `server_N`, or `primary` |
/// | `SMTP_PRIORITY` | `100 - N`, or `0` |
#[derive(Clone)]
pub struct EnvRelaySource {
    lookup: Lookup,
}

impl std::fmt::Debug for EnvRelaySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvRelaySource").finish_non_exhaustive()
    }
}

impl Default for EnvRelaySource {
    fn default() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }
}

impl EnvRelaySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads variables through `lookup` instead of the process environment.
    #[must_use]
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    fn var(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, SourceError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.var(key).map_or(Ok(default), |value| {
            value
                .trim()
                .parse()
                .map_err(|e: T::Err| SourceError::InvalidVariable {
                    variable: key.to_string(),
                    reason: e.to_string(),
                    value,
                })
        })
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.var(key).map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            )
        })
    }

    fn record(&self, suffix: &str, name: String, priority: i64) -> Result<RelayRecord, SourceError> {
        let key = |base: &str| format!("{base}{suffix}");

        let host = self
            .var(&key("SMTP_HOST"))
            .ok_or_else(|| SourceError::MissingVariable(key("SMTP_HOST")))?;
        let port_key = key("SMTP_PORT");
        if self.var(&port_key).is_none() {
            return Err(SourceError::MissingVariable(port_key));
        }
        let port = self.parse::<u16>(&port_key, 0)?;

        let name = self.var(&key("SMTP_NAME")).unwrap_or(name);
        let priority = self.parse(&key("SMTP_PRIORITY"), priority)?;
        let timeout_secs = self.parse(&key("SMTP_TIMEOUT"), 30)?;
        let max_retries = self.parse(&key("SMTP_MAX_RETRIES"), 3)?;

        let starttls = self.flag(&key("SMTP_USE_TLS"));
        let implicit = self.flag(&key("SMTP_USE_SSL")).unwrap_or(false);
        let encryption = match (starttls, implicit) {
            (Some(true), true) => return Err(SourceError::ConflictingEncryption(name)),
            (_, true) => Encryption::ImplicitTls,
            (None | Some(true), false) => Encryption::StartTls,
            (Some(false), false) => Encryption::None,
        };

        let credentials = match (
            self.var(&key("SMTP_USERNAME")),
            (self.lookup)(&key("SMTP_PASSWORD")).filter(|p| !p.is_empty()),
        ) {
            (Some(username), Some(password)) => Some(Credentials::new(username.trim(), password)),
            (None, None) => None,
            _ => return Err(SourceError::IncompleteCredentials(name)),
        };

        let mut record = RelayRecord::new(name, host.trim(), port)
            .with_priority(priority)
            .with_encryption(encryption)
            .with_timeout_secs(timeout_secs)
            .with_max_retries(max_retries);
        if let Some(credentials) = credentials {
            record = record.with_credentials(credentials);
        }

        Ok(record)
    }
}

impl RelaySource for EnvRelaySource {
    fn load(&self) -> Result<Vec<RelayRecord>, SourceError> {
        let mut records = Vec::new();

        for index in 1_i64.. {
            let suffix = format!("_{index}");
            if self.var(&format!("SMTP_HOST{suffix}")).is_none() {
                break;
            }
            records.push(self.record(&suffix, format!("server_{index}"), 100 - index)?);
        }

        if records.is_empty() && self.var("SMTP_HOST").is_some() {
            records.push(self.record("", "primary".to_string(), 0)?);
        }

        if records.is_empty() {
            return Err(SourceError::NoRelays);
        }

        tracing::debug!(relays = records.len(), "Loaded relays from environment");
        Ok(records)
    }

    fn default_sender(&self) -> Option<String> {
        self.var("SMTP_FROM_EMAIL")
            .or_else(|| self.var("SMTP_FROM_EMAIL_1"))
    }

    fn describe(&self) -> String {
        "environment".to_string()
    }
}

/// Relays from the `relays` list of a configuration file, re-read on every load.
#[derive(Debug, Clone)]
pub struct FileRelaySource {
    path: PathBuf,
}

impl FileRelaySource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RelaySource for FileRelaySource {
    fn load(&self) -> Result<Vec<RelayRecord>, SourceError> {
        let config = CourierConfig::load(&self.path)?;
        match config.relays {
            Some(relays) if !relays.is_empty() => Ok(relays),
            _ => Err(SourceError::NoRelays),
        }
    }

    fn default_sender(&self) -> Option<String> {
        CourierConfig::load(&self.path).ok()?.default_sender
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// A fixed list, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRelaySource {
    records: Vec<RelayRecord>,
}

impl StaticRelaySource {
    #[must_use]
    pub const fn new(records: Vec<RelayRecord>) -> Self {
        Self { records }
    }
}

impl RelaySource for StaticRelaySource {
    fn load(&self) -> Result<Vec<RelayRecord>, SourceError> {
        Ok(self.records.clone())
    }

    fn describe(&self) -> String {
        format!("{} static relays", self.records.len())
    }
}
