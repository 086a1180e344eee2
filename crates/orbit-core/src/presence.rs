//! Presence state machine for Orbit.
//!
//! Connectivity events (login, logout, disconnect) move a user between
//! `ONLINE` and `OFFLINE`, but never out of a deliberately chosen "appear"
//! state. Only an explicit status set may leave a sticky state.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use orbit_protocol::{now_millis, PresenceState, StatusRecord};
use tracing::debug;

/// What caused a presence change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTrigger {
    /// The user logged in on a connection.
    Login,
    /// The user logged out or a connection dropped.
    Logout,
    /// A status sent by the client.
    ///
    /// `hard` sets apply unconditionally; soft sets follow the same sticky
    /// rule as login and logout.
    Set {
        /// Requested state.
        state: PresenceState,
        /// Whether the user picked the state explicitly.
        hard: bool,
    },
}

impl PresenceTrigger {
    /// A status the user picked explicitly.
    #[must_use]
    pub fn explicit(state: PresenceState) -> Self {
        PresenceTrigger::Set { state, hard: true }
    }

    /// A status inferred by the client rather than picked by the user.
    #[must_use]
    pub fn soft(state: PresenceState) -> Self {
        PresenceTrigger::Set { state, hard: false }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            PresenceTrigger::Login => "login",
            PresenceTrigger::Logout => "logout",
            PresenceTrigger::Set { hard: true, .. } => "explicit_set",
            PresenceTrigger::Set { hard: false, .. } => "soft_set",
        }
    }
}

/// The result of a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Record before the change, if any.
    pub previous: Option<StatusRecord>,
    /// Record after the change.
    pub record: StatusRecord,
    /// Whether the change was requested by the user.
    pub is_hard_update: bool,
}

/// Compute the next status from the current one.
///
/// Returns `None` when the trigger leaves the status untouched, in which case
/// nothing should be broadcast.
#[must_use]
pub fn transition(
    current: Option<&StatusRecord>,
    trigger: PresenceTrigger,
    now: u64,
) -> Option<Transition> {
    let sticky = current.is_some_and(|record| record.state.is_sticky());

    let (state, is_hard_update) = match trigger {
        PresenceTrigger::Set { state, hard: true } => (state, true),
        _ if sticky => return None,
        PresenceTrigger::Login => (PresenceState::Online, false),
        PresenceTrigger::Logout => (PresenceState::Offline, false),
        PresenceTrigger::Set { state, hard: false } => (state, false),
    };

    Some(Transition {
        previous: current.copied(),
        record: StatusRecord::new(state, now),
        is_hard_update,
    })
}

/// Receives statuses decided on other instances.
///
/// Without this, each instance would judge stickiness from only the events
/// its own clients produced.
pub trait PresenceSink: Send + Sync {
    /// Record a status for `uid` unless the one held locally is newer.
    ///
    /// Returns `true` if the record was stored.
    fn observe(&self, uid: &str, record: StatusRecord) -> bool;
}

/// Latest-write-wins status records for the users seen by this instance.
///
/// Durable storage of statuses belongs to other services; this map only
/// holds what the state machine needs to decide the next transition.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    records: DashMap<String, StatusRecord>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current record for a user.
    #[must_use]
    pub fn get(&self, uid: &str) -> Option<StatusRecord> {
        self.records.get(uid).map(|record| *record)
    }

    /// Seed a record for a user this instance knows nothing about yet.
    ///
    /// Returns `true` if the record was stored.
    pub fn seed(&self, uid: &str, record: StatusRecord) -> bool {
        let mut seeded = false;
        self.records.entry(uid.to_string()).or_insert_with(|| {
            seeded = true;
            record
        });
        if seeded {
            debug!(uid = %uid, state = %record.state, "Seeded presence record");
        }
        seeded
    }

    /// Apply a trigger now.
    pub fn apply(&self, uid: &str, trigger: PresenceTrigger) -> Option<Transition> {
        self.apply_at(uid, trigger, now_millis())
    }

    /// Apply a trigger at the given time.
    ///
    /// The read and the write happen under the same entry lock, so concurrent
    /// triggers for one user are applied one after the other.
    pub fn apply_at(&self, uid: &str, trigger: PresenceTrigger, now: u64) -> Option<Transition> {
        let entry = self.records.entry(uid.to_string());
        let current = match &entry {
            Entry::Occupied(occupied) => Some(*occupied.get()),
            Entry::Vacant(_) => None,
        };

        let Some(next) = transition(current.as_ref(), trigger, now) else {
            debug!(uid = %uid, trigger = trigger.label(), "Sticky state kept");
            return None;
        };

        match entry {
            Entry::Occupied(mut occupied) => {
                occupied.insert(next.record);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(next.record);
            }
        }

        debug!(
            uid = %uid,
            trigger = trigger.label(),
            state = %next.record.state,
            hard = next.is_hard_update,
            "Presence transition"
        );
        Some(next)
    }

    /// Store a record decided elsewhere, last write wins by `lastSeen`.
    ///
    /// A record without `lastSeen` only fills an empty slot. Equal times are
    /// accepted so a redelivered event is harmless.
    pub fn merge(&self, uid: &str, record: StatusRecord) -> bool {
        match self.records.entry(uid.to_string()) {
            Entry::Occupied(mut occupied) => {
                let held = *occupied.get();
                if record.last_seen.unwrap_or(0) < held.last_seen.unwrap_or(0) {
                    debug!(
                        uid = %uid,
                        state = %record.state,
                        held = %held.state,
                        "Ignoring older remote status"
                    );
                    return false;
                }
                occupied.insert(record);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
            }
        }
        debug!(uid = %uid, state = %record.state, "Merged remote status");
        true
    }

    /// Number of users with a record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if no user has a record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl PresenceSink for PresenceTracker {
    fn observe(&self, uid: &str, record: StatusRecord) -> bool {
        self.merge(uid, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_STATES: [PresenceState; 5] = [
        PresenceState::Online,
        PresenceState::Offline,
        PresenceState::AppearAway,
        PresenceState::AppearBusy,
        PresenceState::AppearOffline,
    ];

    fn any_state() -> impl Strategy<Value = PresenceState> {
        prop::sample::select(ALL_STATES.to_vec())
    }

    #[test]
    fn test_first_login_goes_online() {
        let tracker = PresenceTracker::new();

        let t = tracker.apply_at("u1", PresenceTrigger::Login, 1_000).unwrap();
        assert_eq!(t.previous, None);
        assert_eq!(t.record, StatusRecord::new(PresenceState::Online, 1_000));
        assert!(!t.is_hard_update);
        assert_eq!(tracker.get("u1").unwrap().state, PresenceState::Online);
    }

    #[test]
    fn test_login_refreshes_last_seen() {
        let tracker = PresenceTracker::new();
        tracker.apply_at("u1", PresenceTrigger::Login, 1_000);

        let t = tracker.apply_at("u1", PresenceTrigger::Login, 2_000).unwrap();
        assert_eq!(t.record.last_seen, Some(2_000));
    }

    #[test]
    fn test_sticky_state_survives_connectivity() {
        let tracker = PresenceTracker::new();
        tracker.apply_at("u1", PresenceTrigger::explicit(PresenceState::AppearBusy), 1_000);

        assert!(tracker.apply_at("u1", PresenceTrigger::Logout, 2_000).is_none());
        assert!(tracker.apply_at("u1", PresenceTrigger::Login, 3_000).is_none());
        assert!(tracker
            .apply_at("u1", PresenceTrigger::soft(PresenceState::Online), 4_000)
            .is_none());

        let record = tracker.get("u1").unwrap();
        assert_eq!(record, StatusRecord::new(PresenceState::AppearBusy, 1_000));
    }

    #[test]
    fn test_explicit_set_leaves_sticky_state() {
        let tracker = PresenceTracker::new();
        tracker.apply_at("u1", PresenceTrigger::explicit(PresenceState::AppearOffline), 1_000);

        let t = tracker
            .apply_at("u1", PresenceTrigger::explicit(PresenceState::Online), 2_000)
            .unwrap();
        assert_eq!(t.previous.unwrap().state, PresenceState::AppearOffline);
        assert_eq!(t.record.state, PresenceState::Online);

        // Back to automatic transitions
        let t = tracker.apply_at("u1", PresenceTrigger::Logout, 3_000).unwrap();
        assert_eq!(t.record.state, PresenceState::Offline);
    }

    #[test]
    fn test_seed_only_when_unknown() {
        let tracker = PresenceTracker::new();

        assert!(tracker.seed("u1", StatusRecord::new(PresenceState::AppearAway, 10)));
        assert!(!tracker.seed("u1", StatusRecord::new(PresenceState::Online, 20)));
        assert_eq!(tracker.get("u1").unwrap().state, PresenceState::AppearAway);

        // A seeded sticky state blocks the login transition
        assert!(tracker.apply("u1", PresenceTrigger::Login).is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_merge_keeps_the_newest_record() {
        let tracker = PresenceTracker::new();

        assert!(tracker.merge("u1", StatusRecord::new(PresenceState::Online, 1_000)));
        assert!(tracker.merge("u1", StatusRecord::new(PresenceState::AppearBusy, 2_000)));
        assert!(!tracker.merge("u1", StatusRecord::new(PresenceState::Offline, 1_500)));
        // Redelivery
        assert!(tracker.merge("u1", StatusRecord::new(PresenceState::AppearBusy, 2_000)));

        assert_eq!(
            tracker.get("u1").unwrap(),
            StatusRecord::new(PresenceState::AppearBusy, 2_000)
        );
    }

    #[test]
    fn test_merged_sticky_state_blocks_local_logout() {
        let tracker = PresenceTracker::new();
        tracker.apply_at("u1", PresenceTrigger::Login, 1_000);

        // Another instance saw the user pick a status
        let sink: &dyn PresenceSink = &tracker;
        assert!(sink.observe("u1", StatusRecord::new(PresenceState::AppearAway, 2_000)));

        assert!(tracker.apply_at("u1", PresenceTrigger::Logout, 3_000).is_none());
        assert_eq!(tracker.get("u1").unwrap().state, PresenceState::AppearAway);
    }

    #[test]
    fn test_merge_without_last_seen_only_fills_gaps() {
        let tracker = PresenceTracker::new();
        let unknown_time = StatusRecord {
            state: PresenceState::AppearAway,
            last_seen: None,
        };

        assert!(tracker.merge("u1", unknown_time));
        assert!(tracker.merge("u1", StatusRecord::new(PresenceState::Online, 5)));
        assert!(!tracker.merge("u1", unknown_time));
        assert_eq!(tracker.get("u1").unwrap().state, PresenceState::Online);
    }

    proptest! {
        #[test]
        fn prop_connectivity_alone_ends_offline(
            pairs in 1usize..32,
            extra_logins in prop::collection::vec(any::<bool>(), 0..8),
        ) {
            let tracker = PresenceTracker::new();
            let mut now = 0;
            for _ in 0..pairs {
                now += 1;
                prop_assert!(tracker.apply_at("u1", PresenceTrigger::Login, now).is_some());
                prop_assert!(tracker.apply_at("u1", PresenceTrigger::Logout, now).is_some());
            }
            // Interleaved devices: any extra logins are closed by their logouts.
            for login in &extra_logins {
                if *login {
                    tracker.apply_at("u1", PresenceTrigger::Login, now);
                }
            }
            for _ in &extra_logins {
                tracker.apply_at("u1", PresenceTrigger::Logout, now);
            }
            prop_assert_eq!(tracker.get("u1").unwrap().state, PresenceState::Offline);
        }

        #[test]
        fn prop_sticky_states_ignore_connectivity(
            state in prop::sample::select(PresenceState::STICKY.to_vec()),
            events in prop::collection::vec(any::<bool>(), 1..32),
        ) {
            let record = StatusRecord::new(state, 1);
            for login in events {
                let trigger = if login { PresenceTrigger::Login } else { PresenceTrigger::Logout };
                prop_assert!(transition(Some(&record), trigger, 2).is_none());
            }
        }

        #[test]
        fn prop_explicit_set_always_applies(
            current in prop::option::of(any_state()),
            requested in any_state(),
            now in 0u64..u64::MAX,
        ) {
            let current = current.map(|state| StatusRecord::new(state, 0));
            let t = transition(current.as_ref(), PresenceTrigger::explicit(requested), now).unwrap();
            prop_assert_eq!(t.record, StatusRecord::new(requested, now));
            prop_assert!(t.is_hard_update);
        }
    }
}
