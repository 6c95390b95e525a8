use std::time::Instant;

use courier_common::tracing;

use crate::{
    health::HealthTracker,
    relay::{ConfigurationSet, RelayRecord},
};

/// Orders the relays one send should try.
///
/// Pure over its inputs: the same set, health and hint always give the same list.
pub struct RelaySelector;

impl RelaySelector {
    /// Candidates for one send, in the order they must be tried.
    ///
    /// 1. A pinned relay that is available is the only candidate.
    /// 2. Otherwise every available relay, in priority order, with `sticky` (the relay
    ///    that last delivered) moved to the front if it is still available.
    ///
    /// A pinned relay in cooldown falls through to rule 2. An empty result means no
    /// relay can be tried right now.
    #[must_use]
    pub fn candidates<'a>(
        set: &'a ConfigurationSet,
        health: &HealthTracker,
        sticky: Option<&str>,
        now: Instant,
    ) -> Vec<&'a RelayRecord> {
        if let Some(pinned) = set.preferred().and_then(|name| set.get(name)) {
            if health.is_available_at(pinned.name(), now) {
                return vec![pinned];
            }

            tracing::debug!(
                relay = %pinned.name(),
                "Pinned relay is cooling down, using automatic selection"
            );
        }

        let mut candidates: Vec<&RelayRecord> = set
            .iter()
            .filter(|relay| health.is_available_at(relay.name(), now))
            .collect();

        if let Some(position) =
            sticky.and_then(|name| candidates.iter().position(|relay| relay.name() == name))
        {
            candidates[..=position].rotate_right(1);
        }

        candidates
    }
}
