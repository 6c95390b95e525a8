//! Engine settings, read from a RON file.
//!
//! ```ron
//! (
//!     backoff: (base_delay_secs: 30, max_delay_secs: 300),
//!     retry_delay_ms: 500,
//!     helo_name: "mail.example.com",
//!     default_sender: Some("noreply@example.com"),
//!     relays: Some([
//!         (name: "primary", priority: 100, host: "smtp.example.com", port: 587,
//!          credentials: Some((username: "mailer", secret: "..."))),
//!     ]),
//! )
//! ```

use std::path::{Path, PathBuf};

use courier_delivery::{
    BackoffPolicy, ExecutorConfig, RelayRecord, RequestLimits, SmtpTransportConfig,
};
use serde::Deserialize;

use crate::error::ConfigError;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

/// Searched in order when [`CONFIG_ENV`] is not set.
pub const DEFAULT_PATHS: [&str; 2] = ["./courier.config.ron", "/etc/courier/courier.config.ron"];

mod defaults {
    pub const fn retry_delay_ms() -> u64 {
        500
    }

    pub fn helo_name() -> String {
        "localhost".to_string()
    }

    pub const fn max_recipients() -> usize {
        100
    }

    pub const fn max_message_bytes() -> usize {
        10 * 1024 * 1024
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Pause between tries against the same relay (milliseconds).
    ///
    /// Default: 500 milliseconds
    #[serde(default = "defaults::retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Default: `localhost`
    #[serde(default = "defaults::helo_name")]
    pub helo_name: String,

    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Sender used when a request does not name one.
    #[serde(default)]
    pub default_sender: Option<String>,

    /// Default: 100
    #[serde(default = "defaults::max_recipients")]
    pub max_recipients: usize,

    /// Default: 10 MiB
    #[serde(default = "defaults::max_message_bytes")]
    pub max_message_bytes: usize,

    /// Relays defined in the file itself. When absent, relays come from the
    /// environment.
    #[serde(default)]
    pub relays: Option<Vec<RelayRecord>>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            retry_delay_ms: defaults::retry_delay_ms(),
            helo_name: defaults::helo_name(),
            accept_invalid_certs: false,
            default_sender: None,
            max_recipients: defaults::max_recipients(),
            max_message_bytes: defaults::max_message_bytes(),
            relays: None,
        }
    }
}

impl CourierConfig {
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        ron::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Loads the file [`locate`] finds, or the defaults if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if [`CONFIG_ENV`] names a missing file, or the file found
    /// cannot be read or parsed.
    pub fn discover() -> Result<(Self, Option<PathBuf>), ConfigError> {
        match locate(|key| std::env::var(key).ok())? {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    #[must_use]
    pub const fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            retry_delay_ms: self.retry_delay_ms,
        }
    }

    #[must_use]
    pub fn transport(&self) -> SmtpTransportConfig {
        SmtpTransportConfig {
            helo_name: self.helo_name.clone(),
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }

    #[must_use]
    pub const fn limits(&self) -> RequestLimits {
        RequestLimits {
            max_recipients: self.max_recipients,
            max_message_bytes: self.max_message_bytes,
        }
    }
}

/// Finds the configuration file:
/// 1. the path in [`CONFIG_ENV`], which must exist
/// 2. the first of [`DEFAULT_PATHS`] that exists
///
/// # Errors
///
/// Returns an error if [`CONFIG_ENV`] points at a file that does not exist.
pub fn locate(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = lookup(CONFIG_ENV).filter(|p| !p.is_empty()) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(Some(path));
        }
        return Err(ConfigError::Missing(path));
    }

    Ok(DEFAULT_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists()))
}
