//! Online/offline state derived from live session counts.
//!
//! Only the gateway opens and closes sessions, so an identity's presence can
//! change only through its own connections.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    CameOnline,
    WentOffline { last_seen_at: DateTime<Utc> },
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PresenceRecord {
    pub identity_id: Uuid,
    pub is_online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Entry {
    live_sessions: usize,
    last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: DashMap<Uuid, Entry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn session_opened(&self, identity_id: Uuid) -> PresenceChange {
        let mut entry = self.entries.entry(identity_id).or_default();
        entry.live_sessions += 1;
        if entry.live_sessions == 1 {
            tracing::info!(identity = %identity_id, "identity online");
            PresenceChange::CameOnline
        } else {
            PresenceChange::Unchanged
        }
    }

    pub(crate) fn session_closed(&self, identity_id: Uuid) -> PresenceChange {
        let Some(mut entry) = self.entries.get_mut(&identity_id) else {
            return PresenceChange::Unchanged;
        };
        if entry.live_sessions == 0 {
            return PresenceChange::Unchanged;
        }

        entry.live_sessions -= 1;
        if entry.live_sessions > 0 {
            return PresenceChange::Unchanged;
        }

        let last_seen_at = Utc::now();
        entry.last_seen_at = Some(last_seen_at);
        tracing::info!(identity = %identity_id, "identity offline");
        PresenceChange::WentOffline { last_seen_at }
    }

    pub fn is_online(&self, identity_id: Uuid) -> bool {
        self.entries
            .get(&identity_id)
            .map_or(false, |e| e.live_sessions > 0)
    }

    pub fn last_seen(&self, identity_id: Uuid) -> Option<DateTime<Utc>> {
        self.entries.get(&identity_id).and_then(|e| e.last_seen_at)
    }

    pub fn snapshot(&self, identity_id: Uuid) -> PresenceRecord {
        let (is_online, last_seen_at) = self
            .entries
            .get(&identity_id)
            .map_or((false, None), |e| (e.live_sessions > 0, e.last_seen_at));
        PresenceRecord {
            identity_id,
            is_online,
            last_seen_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_at_boundaries() {
        let presence = PresenceTracker::new();
        let id = Uuid::new_v4();

        assert_eq!(presence.session_opened(id), PresenceChange::CameOnline);
        assert_eq!(presence.session_opened(id), PresenceChange::Unchanged);
        assert_eq!(presence.session_closed(id), PresenceChange::Unchanged);
        assert!(presence.is_online(id));
        assert!(presence.last_seen(id).is_none());

        assert!(matches!(presence.session_closed(id), PresenceChange::WentOffline { .. }));
        assert!(!presence.is_online(id));
        assert!(presence.last_seen(id).is_some());
    }

    #[test]
    fn extra_close_does_not_underflow() {
        let presence = PresenceTracker::new();
        let id = Uuid::new_v4();
        assert_eq!(presence.session_closed(id), PresenceChange::Unchanged);

        presence.session_opened(id);
        presence.session_closed(id);
        assert_eq!(presence.session_closed(id), PresenceChange::Unchanged);
        assert_eq!(presence.session_opened(id), PresenceChange::CameOnline);

        let snapshot = presence.snapshot(id);
        assert!(snapshot.is_online);
        assert!(snapshot.last_seen_at.is_some());
    }
}
