//! Per-relay health: consecutive failures and the cooldown they earn.
//!
//! Each relay's state sits behind its own mutex inside a [`DashMap`], so sends to
//! different relays never contend and a send only ever holds one relay's lock for
//! the length of a counter update. Nothing here performs I/O.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use courier_common::tracing;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Exponent cap, so `2^(n-1)` cannot overflow however long a relay stays down.
const MAX_EXPONENT: u32 = 10;

/// Cooldown growth after consecutive failures: `min(base * 2^(n-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Cooldown after the first failure (seconds).
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::base_delay_secs")]
    pub base_delay_secs: u64,

    /// Longest cooldown, however many failures have been seen (seconds).
    ///
    /// Default: 300 seconds (5 minutes)
    #[serde(default = "defaults::max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: defaults::base_delay_secs(),
            max_delay_secs: defaults::max_delay_secs(),
        }
    }
}

impl BackoffPolicy {
    /// Cooldown after `failures` consecutive failures. `0` is treated as `1`.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(MAX_EXPONENT);
        let base = Duration::from_secs(self.base_delay_secs);
        let max = Duration::from_secs(self.max_delay_secs);

        base.saturating_mul(1 << exponent).min(max)
    }
}

mod defaults {
    pub const fn base_delay_secs() -> u64 {
        30
    }

    pub const fn max_delay_secs() -> u64 {
        300
    }
}

#[derive(Debug, Default)]
struct HealthState {
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    /// Wall-clock twin of `cooldown_until`, for reporting only.
    cooldown_until_utc: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl HealthState {
    fn is_available_at(&self, now: Instant) -> bool {
        self.cooldown_until.is_none_or(|until| now >= until)
    }

    fn snapshot(&self, now: Instant) -> HealthSnapshot {
        let remaining = self
            .cooldown_until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(now));

        HealthSnapshot {
            available: self.is_available_at(now),
            consecutive_failures: self.consecutive_failures,
            // Rounded up, so a relay still cooling never reports zero.
            cooldown_remaining_secs: u64::try_from(remaining.as_millis().div_ceil(1000))
                .unwrap_or(u64::MAX),
            cooldown_until: self.cooldown_until_utc.filter(|_| !remaining.is_zero()),
            last_failure_at: self.last_failure_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Point-in-time view of one relay's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub available: bool,
    pub consecutive_failures: u32,
    pub cooldown_remaining_secs: u64,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            available: true,
            consecutive_failures: 0,
            cooldown_remaining_secs: 0,
            cooldown_until: None,
            last_failure_at: None,
            last_error: None,
        }
    }
}

/// Health state for every relay name that has been observed.
///
/// Keyed by name rather than by record, so a relay keeps its history when a
/// reload changes its host or priority.
#[derive(Debug, Default)]
pub struct HealthTracker {
    policy: BackoffPolicy,
    relays: DashMap<String, Arc<Mutex<HealthState>>>,
}

impl HealthTracker {
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            relays: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Cooldown after `failures` consecutive failures.
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        self.policy.delay(failures)
    }

    /// The state for `name`, created on first use. The map guard is released before
    /// the caller locks the state.
    fn state(&self, name: &str) -> Arc<Mutex<HealthState>> {
        if let Some(state) = self.relays.get(name) {
            return Arc::clone(&state);
        }

        self.relays
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HealthState::default())))
            .clone()
    }

    fn existing(&self, name: &str) -> Option<Arc<Mutex<HealthState>>> {
        self.relays.get(name).map(|state| Arc::clone(&state))
    }

    #[must_use]
    pub fn is_available(&self, name: &str) -> bool {
        self.is_available_at(name, Instant::now())
    }

    /// `true` if `name` has never failed, or its cooldown ended by `now`.
    #[must_use]
    pub fn is_available_at(&self, name: &str, now: Instant) -> bool {
        self.existing(name)
            .is_none_or(|state| state.lock().is_available_at(now))
    }

    /// Clears the failure count and cooldown; the relay is eligible immediately.
    pub fn record_success(&self, name: &str) {
        let state = self.state(name);
        let mut state = state.lock();

        if state.consecutive_failures > 0 {
            tracing::info!(
                relay = %name,
                failures = state.consecutive_failures,
                "Relay recovered"
            );
        }

        state.consecutive_failures = 0;
        state.cooldown_until = None;
        state.cooldown_until_utc = None;
    }

    /// Counts a failure and starts a cooldown sized by the new failure count.
    ///
    /// Returns the cooldown applied.
    pub fn record_failure(&self, name: &str, error: &str) -> Duration {
        let state = self.state(name);
        let mut state = state.lock();

        let now = Instant::now();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let cooldown = self.policy.delay(state.consecutive_failures);

        state.cooldown_until = Some(now + cooldown);
        state.cooldown_until_utc = chrono::Duration::from_std(cooldown)
            .ok()
            .map(|cooldown| Utc::now() + cooldown);
        state.last_failure_at = Some(Utc::now());
        state.last_error = Some(error.to_string());

        tracing::warn!(
            relay = %name,
            failures = state.consecutive_failures,
            cooldown_secs = cooldown.as_secs(),
            error,
            "Relay placed in cooldown"
        );

        cooldown
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<HealthSnapshot> {
        self.existing(name)
            .map(|state| state.lock().snapshot(Instant::now()))
    }

    /// Read-only view of every tracked relay.
    #[must_use]
    pub fn snapshot(&self) -> AHashMap<String, HealthSnapshot> {
        let now = Instant::now();
        let states: Vec<(String, Arc<Mutex<HealthState>>)> = self
            .relays
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        states
            .into_iter()
            .map(|(name, state)| {
                let snapshot = state.lock().snapshot(now);
                (name, snapshot)
            })
            .collect()
    }

    /// Drops state for every relay `keep` rejects.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        self.relays.retain(|name, _| {
            let kept = keep(name);
            if !kept {
                tracing::debug!(relay = %name, "Dropping health state");
            }
            kept
        });
    }

    /// Forgets every relay's history.
    pub fn reset(&self) {
        self.relays.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.relays.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }
}
