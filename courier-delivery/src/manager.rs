//! Live relay configuration: atomic reloads, manual pinning and status.
//!
//! The active [`ConfigurationSet`] is only ever replaced, never edited. A send takes
//! an `Arc` to the set when it starts and keeps using it, so a reload landing
//! mid-send is invisible to that send. Reloads and switches are serialised by a
//! writer lock that no send ever takes.

use std::{sync::Arc, time::Instant};

use ahash::AHashSet;
use chrono::{DateTime, Utc};
use courier_common::{internal, tracing};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::{
    error::ValidationError,
    health::{BackoffPolicy, HealthSnapshot, HealthTracker},
    redact::mask_username,
    relay::{ConfigurationSet, Encryption, RelayRecord},
    selector::RelaySelector,
};

/// A relay whose record changed on reload, and which fields changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayChange {
    pub name: String,
    pub fields: Vec<&'static str>,
}

/// What a successful reload did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<RelayChange>,
    pub unchanged: Vec<String>,
    /// The highest-priority relay is now a different one.
    pub primary_changed: bool,
    /// The pin was dropped because the pinned relay no longer exists.
    pub pin_cleared: bool,
}

impl ReloadSummary {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty())
    }
}

/// What a switch did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwitchOutcome {
    pub previous_preferred: Option<String>,
    pub preferred: Option<String>,
    /// The relay a send would try first right now.
    pub effective: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub name: String,
    pub priority: i64,
    pub host: String,
    pub port: u16,
    pub encryption: Encryption,
    /// Masked; the secret itself is never reported.
    pub username: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub preferred: bool,
    pub active: bool,
    pub available: bool,
    pub consecutive_failures: u32,
    pub cooldown_remaining_secs: u64,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub relays: Vec<RelayStatus>,
    pub total: usize,
    pub available: usize,
    pub preferred: Option<String>,
    /// The relay that delivered most recently.
    pub active: Option<String>,
    pub effective: Option<String>,
}

/// Owns the live relay set, the manual pin, health state and the active relay hint.
#[derive(Debug)]
pub struct ConfigurationManager {
    current: RwLock<Arc<ConfigurationSet>>,
    health: HealthTracker,
    /// Relay that last delivered. Advisory: stale reads are harmless.
    active: RwLock<Option<String>>,
    writer: Mutex<()>,
}

impl ConfigurationManager {
    /// Builds a manager over `records`. An empty list is allowed; sends then fail
    /// with `NoAvailableRelay` until a reload supplies relays.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the records are invalid.
    pub fn new(records: Vec<RelayRecord>, backoff: BackoffPolicy) -> Result<Self, ValidationError> {
        let set = ConfigurationSet::new(records)?;
        internal!(level = INFO, relays = set.len(), "Relay configuration loaded");

        Ok(Self {
            current: RwLock::new(Arc::new(set)),
            health: HealthTracker::new(backoff),
            active: RwLock::new(None),
            writer: Mutex::new(()),
        })
    }

    /// The set a send should use from start to finish.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ConfigurationSet> {
        Arc::clone(&self.current.read())
    }

    #[must_use]
    pub const fn health(&self) -> &HealthTracker {
        &self.health
    }

    #[must_use]
    pub fn active_relay(&self) -> Option<String> {
        self.active.read().clone()
    }

    pub(crate) fn set_active_relay(&self, name: &str) {
        let current = self.current.read();
        if !current.contains(name) {
            return;
        }

        let mut active = self.active.write();
        if active.as_deref() != Some(name) {
            tracing::debug!(relay = %name, previous = ?*active, "Active relay changed");
            *active = Some(name.to_string());
        }
    }

    /// Clears the hint if it still names `name`.
    pub(crate) fn clear_active_relay(&self, name: &str) {
        let mut active = self.active.write();
        if active.as_deref() == Some(name) {
            *active = None;
        }
    }

    /// Records a delivery through `name`, unless a reload has since removed it.
    pub(crate) fn record_success(&self, name: &str) {
        // Holding the read guard keeps a concurrent reload from pruning between the
        // membership check and the write.
        let current = self.current.read();
        if current.contains(name) {
            self.health.record_success(name);
        }
    }

    /// Records a failure of `name`, unless a reload has since removed it.
    pub(crate) fn record_failure(&self, name: &str, error: &str) -> Option<std::time::Duration> {
        let current = self.current.read();
        if current.contains(name) {
            Some(self.health.record_failure(name, error))
        } else {
            tracing::debug!(relay = %name, "Relay was removed by a reload, not recording failure");
            None
        }
    }

    /// Replaces the relay set with `records`, all or nothing.
    ///
    /// Health state is kept for names that survive, even if their host or priority
    /// changed, and dropped for names that do not. The pin survives when its relay
    /// does. The active relay hint is cleared so the next send starts from priority
    /// order.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`], leaving everything untouched, if `records` is
    /// empty or invalid.
    #[tracing::instrument(skip_all, fields(relays = records.len()))]
    pub fn reload(&self, records: Vec<RelayRecord>) -> Result<ReloadSummary, ValidationError> {
        if records.is_empty() {
            return Err(ValidationError::NoRelays);
        }

        let _writer = self.writer.lock();
        let incoming = ConfigurationSet::new(records)?;
        let old = self.snapshot();

        let mut summary = ReloadSummary::default();
        for relay in &incoming {
            match old.get(relay.name()) {
                None => summary.added.push(relay.name().to_string()),
                Some(previous) => {
                    let fields = previous.changed_fields(relay);
                    if fields.is_empty() {
                        summary.unchanged.push(relay.name().to_string());
                    } else {
                        summary.changed.push(RelayChange {
                            name: relay.name().to_string(),
                            fields,
                        });
                    }
                }
            }
        }
        summary.removed = old
            .iter()
            .filter(|relay| !incoming.contains(relay.name()))
            .map(|relay| relay.name().to_string())
            .collect();
        summary.primary_changed = old.relays().first().map(RelayRecord::name)
            != incoming.relays().first().map(RelayRecord::name);

        let preferred = old
            .preferred()
            .filter(|name| incoming.contains(name))
            .map(ToString::to_string);
        summary.pin_cleared = old.preferred().is_some() && preferred.is_none();
        let incoming = incoming.with_preferred(preferred);

        let keep: AHashSet<String> = incoming.names().into_iter().collect();
        {
            let mut current = self.current.write();
            *current = Arc::new(incoming);
            self.health.retain(|name| keep.contains(name));
        }
        *self.active.write() = None;

        internal!(
            level = INFO,
            added = ?summary.added,
            removed = ?summary.removed,
            changed = summary.changed.len(),
            unchanged = summary.unchanged.len(),
            "Relay configuration reloaded"
        );

        Ok(summary)
    }

    /// Pins `name`, or with `None` returns to automatic selection.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::UnknownRelay`], changing nothing, if `name` is not
    /// in the current set.
    #[tracing::instrument(skip(self))]
    pub fn switch_to(&self, name: Option<&str>) -> Result<SwitchOutcome, ValidationError> {
        let _writer = self.writer.lock();
        let old = self.snapshot();

        if let Some(name) = name
            && !old.contains(name)
        {
            return Err(ValidationError::UnknownRelay {
                name: name.to_string(),
                available: old.names(),
            });
        }

        let previous_preferred = old.preferred().map(ToString::to_string);
        let preferred = name.map(ToString::to_string);
        *self.current.write() = Arc::new(old.with_preferred(preferred.clone()));
        *self.active.write() = None;

        let effective = self.effective_relay();
        internal!(
            level = INFO,
            previous = ?previous_preferred,
            preferred = ?preferred,
            effective = ?effective,
            "Relay preference changed"
        );

        Ok(SwitchOutcome {
            previous_preferred,
            preferred,
            effective,
        })
    }

    /// The relay a send starting now would try first.
    #[must_use]
    pub fn effective_relay(&self) -> Option<String> {
        let set = self.snapshot();
        let active = self.active_relay();
        RelaySelector::candidates(&set, &self.health, active.as_deref(), Instant::now())
            .first()
            .map(|relay| relay.name().to_string())
    }

    /// Forgets all failure history and the active relay, so every relay is eligible.
    pub fn reset_health(&self) {
        let _writer = self.writer.lock();
        self.health.reset();
        *self.active.write() = None;
        internal!(level = INFO, "Relay health reset");
    }

    /// Relay facts joined with their health, in selection order.
    #[must_use]
    pub fn status(&self) -> StatusReport {
        let set = self.snapshot();
        let health = self.health.snapshot();
        let active = self.active_relay();

        let relays: Vec<RelayStatus> = set
            .iter()
            .map(|relay| {
                let snapshot = health.get(relay.name()).cloned().unwrap_or_default();
                relay_status(relay, snapshot, &set, active.as_deref())
            })
            .collect();

        StatusReport {
            total: relays.len(),
            available: relays.iter().filter(|r| r.available).count(),
            relays,
            preferred: set.preferred().map(ToString::to_string),
            active,
            effective: self.effective_relay(),
        }
    }
}

fn relay_status(
    relay: &RelayRecord,
    health: HealthSnapshot,
    set: &ConfigurationSet,
    active: Option<&str>,
) -> RelayStatus {
    RelayStatus {
        name: relay.name().to_string(),
        priority: relay.priority(),
        host: relay.host().to_string(),
        port: relay.port(),
        encryption: relay.encryption(),
        username: relay.credentials().map(|c| mask_username(&c.username)),
        timeout_secs: relay.timeout().as_secs(),
        max_retries: relay.max_retries(),
        preferred: set.preferred() == Some(relay.name()),
        active: active == Some(relay.name()),
        available: health.available,
        consecutive_failures: health.consecutive_failures,
        cooldown_remaining_secs: health.cooldown_remaining_secs,
        cooldown_until: health.cooldown_until,
        last_failure_at: health.last_failure_at,
        last_error: health
            .last_error
            .map(|error| set.redactor().redact(&error).into_owned()),
    }
}
