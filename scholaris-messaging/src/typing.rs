//! Typing indicators.
//!
//! Signals are advisory and carry their own expiry. Receivers drop an
//! indicator once it expires even if the stop signal never arrives.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::gateway::events::{TypingSignal, TypingStopped};
use crate::gateway::ServerEvent;

pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(4);

fn to_chrono(timeout: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(timeout.as_millis() as i64)
}

/// Server-side record of who is typing where.
pub struct TypingCoordinator {
    timeout: chrono::Duration,
    active: DashMap<(Uuid, Uuid), DateTime<Utc>>,
}

impl TypingCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: to_chrono(timeout),
            active: DashMap::new(),
        }
    }

    pub fn start(&self, conversation_id: Uuid, identity_id: Uuid) -> ServerEvent {
        self.start_at(conversation_id, identity_id, Utc::now())
    }

    pub fn start_at(&self, conversation_id: Uuid, identity_id: Uuid, now: DateTime<Utc>) -> ServerEvent {
        let expires_at = now + self.timeout;
        self.active.insert((conversation_id, identity_id), expires_at);
        ServerEvent::UserTyping(TypingSignal {
            conversation_id,
            identity_id,
            expires_at,
        })
    }

    pub fn stop(&self, conversation_id: Uuid, identity_id: Uuid) -> ServerEvent {
        self.active.remove(&(conversation_id, identity_id));
        ServerEvent::UserStoppedTyping(TypingStopped {
            conversation_id,
            identity_id,
        })
    }

    /// Stop events for every unexpired signal of `identity_id`.
    pub fn clear_identity(&self, identity_id: Uuid, now: DateTime<Utc>) -> Vec<ServerEvent> {
        let keys: Vec<(Uuid, Uuid)> = self
            .active
            .iter()
            .filter(|e| e.key().1 == identity_id)
            .map(|e| *e.key())
            .collect();

        keys.into_iter()
            .filter_map(|key| self.active.remove(&key))
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|((conversation_id, identity_id), _)| {
                ServerEvent::UserStoppedTyping(TypingStopped {
                    conversation_id,
                    identity_id,
                })
            })
            .collect()
    }

    pub fn prune(&self, now: DateTime<Utc>) {
        self.active.retain(|_, expires_at| *expires_at > now);
    }
}

/// Receiver-side view of typing indicators.
#[derive(Debug, Clone)]
pub struct TypingBoard {
    local_timeout: chrono::Duration,
    entries: HashMap<(Uuid, Uuid), DateTime<Utc>>,
}

impl TypingBoard {
    pub fn new(local_timeout: Duration) -> Self {
        Self {
            local_timeout: to_chrono(local_timeout),
            entries: HashMap::new(),
        }
    }

    /// Feeds a received event. Returns true when the board changed.
    pub fn observe(&mut self, event: &ServerEvent, received_at: DateTime<Utc>) -> bool {
        match event {
            ServerEvent::UserTyping(signal) => {
                // Never trust a remote clock beyond our own timeout.
                let expires_at = signal.expires_at.min(received_at + self.local_timeout);
                self.entries
                    .insert((signal.conversation_id, signal.identity_id), expires_at);
                true
            }
            ServerEvent::UserStoppedTyping(stop) => self
                .entries
                .remove(&(stop.conversation_id, stop.identity_id))
                .is_some(),
            ServerEvent::NewMessage(message) => self
                .entries
                .remove(&(message.conversation_id, message.sender_id))
                .is_some(),
            _ => false,
        }
    }

    pub fn is_typing(&self, conversation_id: Uuid, identity_id: Uuid, now: DateTime<Utc>) -> bool {
        self.entries
            .get(&(conversation_id, identity_id))
            .map_or(false, |expires_at| *expires_at > now)
    }

    pub fn typers(&self, conversation_id: Uuid, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut typers: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|((conv, _), expires_at)| *conv == conversation_id && **expires_at > now)
            .map(|((_, identity), _)| *identity)
            .collect();
        typers.sort();
        typers
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.entries.retain(|_, expires_at| *expires_at > now);
    }
}
