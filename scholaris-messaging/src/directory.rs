use dashmap::DashMap;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scholaris_shared::clients::db::DbPool;
use scholaris_shared::errors::{AppError, AppResult};
use scholaris_shared::types::auth::Role;

use crate::schema::directory_identities;

/// Who an identity is, as far as chat admission cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub identity_id: Uuid,
    pub tenant_id: Uuid,
    pub role: Role,
}

/// Identity records are owned elsewhere; this service only reads them.
pub trait DirectoryLookup: Send + Sync {
    fn lookup(&self, identity_id: Uuid) -> AppResult<Option<DirectoryEntry>>;
}

/// Reads the `directory_identities` view maintained by the school platform.
pub struct PgDirectory {
    pool: DbPool,
}

impl PgDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl DirectoryLookup for PgDirectory {
    fn lookup(&self, identity_id: Uuid) -> AppResult<Option<DirectoryEntry>> {
        let mut conn = self.pool.get().map_err(|e| AppError::Internal(e.into()))?;

        let row: Option<(Uuid, String)> = directory_identities::table
            .find(identity_id)
            .select((directory_identities::tenant_id, directory_identities::role))
            .first(&mut conn)
            .optional()?;

        row.map(|(tenant_id, role)| {
            let role = role
                .parse::<Role>()
                .map_err(|e| AppError::internal(format!("directory entry {identity_id}: {e}")))?;
            Ok(DirectoryEntry { identity_id, tenant_id, role })
        })
        .transpose()
    }
}

#[derive(Default)]
pub struct InMemoryDirectory {
    entries: DashMap<Uuid, DirectoryEntry>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = DirectoryEntry>) -> Self {
        let directory = Self::new();
        for entry in entries {
            directory.insert(entry);
        }
        directory
    }

    pub fn insert(&self, entry: DirectoryEntry) {
        self.entries.insert(entry.identity_id, entry);
    }
}

impl DirectoryLookup for InMemoryDirectory {
    fn lookup(&self, identity_id: Uuid) -> AppResult<Option<DirectoryEntry>> {
        Ok(self.entries.get(&identity_id).map(|e| *e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_lookup() {
        let entry = DirectoryEntry {
            identity_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            role: Role::Parent,
        };
        let directory = InMemoryDirectory::with_entries([entry]);

        assert_eq!(directory.lookup(entry.identity_id).unwrap(), Some(entry));
        assert_eq!(directory.lookup(Uuid::new_v4()).unwrap(), None);
    }
}
