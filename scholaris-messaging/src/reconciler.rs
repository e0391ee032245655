//! Keeps live fan-out in commit order.
//!
//! The store write and the broadcast enqueue for one conversation happen under
//! the same async lock, so two concurrent sends can never reach sessions in
//! the opposite order from the one the store assigned.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Default)]
pub struct ConversationSequencer {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ConversationSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, conversation_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(conversation_id).or_default().clone();
        lock.lock_owned().await
    }

    /// Drops locks nobody is holding or waiting on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
