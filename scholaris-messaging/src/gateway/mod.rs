//! Live sessions and conversation rooms.
//!
//! The gateway never waits on a consumer: every session has a bounded queue
//! and an event that does not fit evicts the session. Evicted clients
//! reconnect and rebuild their view from a plain read.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use uuid::Uuid;

use scholaris_shared::errors::{AppError, AppResult, ErrorCode};
use scholaris_shared::types::auth::AuthUser;

use crate::admission::RoomGrant;
use crate::presence::{PresenceChange, PresenceTracker};

pub mod events;

pub use events::ServerEvent;

pub type SessionId = Uuid;

struct SessionEntry {
    caller: AuthUser,
    tx: mpsc::Sender<ServerEvent>,
    rooms: HashSet<Uuid>,
    last_seen: Instant,
    liveness: Liveness,
}

/// Who decides that a session has gone silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The client must emit heartbeats; the reaper drops it otherwise.
    Heartbeat,
    /// The transport runs its own ping/pong and reports the disconnect.
    Transport,
}

/// Caller-owned end of a live connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    caller: AuthUser,
    events: mpsc::Receiver<ServerEvent>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn caller(&self) -> &AuthUser {
        &self.caller
    }

    /// `None` once the gateway has dropped the session.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.events.try_recv().ok()
    }

    pub fn into_receiver(self) -> mpsc::Receiver<ServerEvent> {
        self.events
    }
}

#[derive(Debug, Clone)]
pub enum Audience {
    Room(Uuid),
    Identities(Vec<Uuid>),
    RoomAndIdentities(Uuid, Vec<Uuid>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disconnected {
    pub session_id: SessionId,
    pub identity_id: Uuid,
    pub tenant_id: Uuid,
    pub went_offline: bool,
}

/// Outcome of one fan-out.
#[derive(Debug, Default)]
pub struct Delivery {
    pub delivered: usize,
    pub evicted: Vec<Disconnected>,
}

pub struct Gateway {
    sessions: DashMap<SessionId, SessionEntry>,
    rooms: DashMap<Uuid, HashSet<SessionId>>,
    identities: DashMap<Uuid, HashSet<SessionId>>,
    presence: Arc<PresenceTracker>,
    queue_capacity: usize,
}

impl Gateway {
    pub fn new(presence: Arc<PresenceTracker>, queue_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            rooms: DashMap::new(),
            identities: DashMap::new(),
            presence,
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn connect(&self, caller: &AuthUser) -> Session {
        self.connect_with(caller, Liveness::Heartbeat)
    }

    pub fn connect_with(&self, caller: &AuthUser, liveness: Liveness) -> Session {
        let id = Uuid::now_v7();
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        self.sessions.insert(
            id,
            SessionEntry {
                caller: caller.clone(),
                tx,
                rooms: HashSet::new(),
                last_seen: Instant::now(),
                liveness,
            },
        );
        self.identities.entry(caller.id).or_default().insert(id);
        self.presence.session_opened(caller.id);
        gauge!("gateway_sessions_active").set(self.sessions.len() as f64);

        tracing::debug!(session = %id, identity = %caller.id, tenant = %caller.tenant_id, "session connected");

        Session {
            id,
            caller: caller.clone(),
            events: rx,
        }
    }

    /// Idempotent; returns `None` when the session was already gone.
    pub fn disconnect(&self, session_id: SessionId) -> Option<Disconnected> {
        let (_, entry) = self.sessions.remove(&session_id)?;

        for room in &entry.rooms {
            self.rooms.remove_if_mut(room, |_, members| {
                members.remove(&session_id);
                members.is_empty()
            });
        }
        self.identities.remove_if_mut(&entry.caller.id, |_, sessions| {
            sessions.remove(&session_id);
            sessions.is_empty()
        });

        let went_offline = matches!(
            self.presence.session_closed(entry.caller.id),
            PresenceChange::WentOffline { .. }
        );
        gauge!("gateway_sessions_active").set(self.sessions.len() as f64);

        tracing::debug!(session = %session_id, identity = %entry.caller.id, went_offline, "session disconnected");

        Some(Disconnected {
            session_id,
            identity_id: entry.caller.id,
            tenant_id: entry.caller.tenant_id,
            went_offline,
        })
    }

    pub fn caller(&self, session_id: SessionId) -> AppResult<AuthUser> {
        self.sessions
            .get(&session_id)
            .map(|e| e.caller.clone())
            .ok_or_else(|| AppError::unauthorized("session is not connected"))
    }

    pub fn join_room(&self, grant: RoomGrant) -> AppResult<()> {
        let mut entry = self
            .sessions
            .get_mut(&grant.session_id())
            .ok_or_else(|| AppError::unauthorized("session is not connected"))?;
        entry.rooms.insert(grant.conversation_id());
        self.rooms
            .entry(grant.conversation_id())
            .or_default()
            .insert(grant.session_id());
        Ok(())
    }

    pub fn leave_room(&self, session_id: SessionId, conversation_id: Uuid) {
        if let Some(mut entry) = self.sessions.get_mut(&session_id) {
            entry.rooms.remove(&conversation_id);
        }
        self.rooms.remove_if_mut(&conversation_id, |_, members| {
            members.remove(&session_id);
            members.is_empty()
        });
    }

    pub fn is_in_room(&self, session_id: SessionId, conversation_id: Uuid) -> bool {
        self.sessions
            .get(&session_id)
            .map_or(false, |e| e.rooms.contains(&conversation_id))
    }

    pub fn ensure_in_room(&self, session_id: SessionId, conversation_id: Uuid) -> AppResult<()> {
        if self.is_in_room(session_id, conversation_id) {
            Ok(())
        } else {
            Err(AppError::new(ErrorCode::NotInRoom, "join the conversation first"))
        }
    }

    /// Marks the session as alive. Returns false for unknown sessions.
    pub fn touch(&self, session_id: SessionId) -> bool {
        match self.sessions.get_mut(&session_id) {
            Some(mut entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Disconnects every heartbeat session silent for longer than `timeout`.
    /// Transport-backed sessions are left to the transport's own ping timeout.
    pub fn reap_stale(&self, timeout: Duration) -> Vec<Disconnected> {
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| e.liveness == Liveness::Heartbeat && e.last_seen.elapsed() > timeout)
            .map(|e| *e.key())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                tracing::info!(session = %id, "reaping silent session");
                self.disconnect(id)
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Enqueues `event` once per target session, skipping `exclude` identity.
    pub fn broadcast(&self, audience: Audience, exclude: Option<Uuid>, event: ServerEvent) -> Delivery {
        let (room, identities) = match audience {
            Audience::Room(room) => (Some(room), Vec::new()),
            Audience::Identities(ids) => (None, ids),
            Audience::RoomAndIdentities(room, ids) => (Some(room), ids),
        };

        let mut targets: HashSet<SessionId> = HashSet::new();
        if let Some(room) = room {
            if let Some(members) = self.rooms.get(&room) {
                targets.extend(members.iter().copied());
            }
        }
        for identity in identities {
            if let Some(sessions) = self.identities.get(&identity) {
                targets.extend(sessions.iter().copied());
            }
        }

        let mut delivery = Delivery::default();
        let mut evict = Vec::new();
        for session_id in targets {
            let Some(entry) = self.sessions.get(&session_id) else {
                continue;
            };
            if exclude == Some(entry.caller.id) {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(session = %session_id, event = event.name(), "session queue full, evicting");
                    evict.push(session_id);
                }
                Err(TrySendError::Closed(_)) => evict.push(session_id),
            }
        }

        for session_id in evict {
            counter!("gateway_events_dropped_total").increment(1);
            if let Some(gone) = self.disconnect(session_id) {
                delivery.evicted.push(gone);
            }
        }

        delivery
    }
}
