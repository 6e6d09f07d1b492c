//! Local Store - persistence seam for syncable records
//!
//! The orchestrator never talks to SQLite directly; it goes through
//! `LocalStore`, implemented by `Database` and by `MemoryStore` for tests.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::conflict::ConflictRecord;
use super::error::SyncError;
use super::events::lock;
use super::models::{EntityType, SyncState, SyncableEntity};
use crate::db::Database;

const PENDING_CONFLICTS_KEY: &str = "pending_conflicts";

/// Local record storage used by the sync engine
pub trait LocalStore: Send + Sync {
    fn get_entity(&self, entity_type: &EntityType, id: &str) -> Result<Option<SyncableEntity>, SyncError>;

    fn put_entity(&self, entity: &SyncableEntity) -> Result<(), SyncError>;

    fn delete_entity(&self, entity_type: &EntityType, id: &str) -> Result<bool, SyncError>;

    fn list_by_state(&self, state: SyncState) -> Result<Vec<SyncableEntity>, SyncError>;

    fn count_by_state(&self, state: SyncState) -> Result<usize, SyncError>;

    /// Mark an entity synced if it still holds the pushed version
    fn mark_synced(
        &self,
        entity: &SyncableEntity,
        remote_updated_at: DateTime<Utc>,
    ) -> Result<bool, SyncError>;

    fn load_setting(&self, key: &str) -> Result<Option<String>, SyncError>;

    fn save_setting(&self, key: &str, json: &str) -> Result<(), SyncError>;

    /// Entities waiting to be pushed, oldest change first
    fn list_unsynced(&self) -> Result<Vec<SyncableEntity>, SyncError> {
        self.list_by_state(SyncState::Pending)
    }

    fn count_unsynced(&self) -> Result<usize, SyncError> {
        self.count_by_state(SyncState::Pending)
    }

    fn load_conflicts(&self) -> Result<Vec<ConflictRecord>, SyncError> {
        match self.load_setting(PENDING_CONFLICTS_KEY)? {
            Some(json) => serde_json::from_str(&json).map_err(|e| SyncError::Storage(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    fn save_conflicts(&self, conflicts: &[ConflictRecord]) -> Result<(), SyncError> {
        let json = serde_json::to_string(conflicts).map_err(|e| SyncError::Storage(e.to_string()))?;
        self.save_setting(PENDING_CONFLICTS_KEY, &json)
    }
}

impl LocalStore for Database {
    fn get_entity(&self, entity_type: &EntityType, id: &str) -> Result<Option<SyncableEntity>, SyncError> {
        Ok(Database::get_entity(self, entity_type, id)?)
    }

    fn put_entity(&self, entity: &SyncableEntity) -> Result<(), SyncError> {
        Ok(self.upsert_entity(entity)?)
    }

    fn delete_entity(&self, entity_type: &EntityType, id: &str) -> Result<bool, SyncError> {
        Ok(Database::delete_entity(self, entity_type, id)?)
    }

    fn list_by_state(&self, state: SyncState) -> Result<Vec<SyncableEntity>, SyncError> {
        Ok(self.get_entities_by_state(state)?)
    }

    fn count_by_state(&self, state: SyncState) -> Result<usize, SyncError> {
        Ok(self.count_entities_by_state(state)?)
    }

    fn mark_synced(
        &self,
        entity: &SyncableEntity,
        remote_updated_at: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        Ok(self.mark_entity_synced(entity, &remote_updated_at)?)
    }

    fn load_setting(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.get_setting_raw(key)?)
    }

    fn save_setting(&self, key: &str, json: &str) -> Result<(), SyncError> {
        Ok(self.set_setting_raw(key, json)?)
    }
}

/// In-memory store (for testing and ephemeral sessions)
#[derive(Default)]
pub struct MemoryStore {
    entities: Mutex<BTreeMap<(String, String), SyncableEntity>>,
    settings: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get_entity(&self, entity_type: &EntityType, id: &str) -> Result<Option<SyncableEntity>, SyncError> {
        let key = (entity_type.as_str().to_string(), id.to_string());
        Ok(lock(&self.entities).get(&key).cloned())
    }

    fn put_entity(&self, entity: &SyncableEntity) -> Result<(), SyncError> {
        let key = (entity.entity_type.as_str().to_string(), entity.id.clone());
        lock(&self.entities).insert(key, entity.clone());
        Ok(())
    }

    fn delete_entity(&self, entity_type: &EntityType, id: &str) -> Result<bool, SyncError> {
        let key = (entity_type.as_str().to_string(), id.to_string());
        Ok(lock(&self.entities).remove(&key).is_some())
    }

    fn list_by_state(&self, state: SyncState) -> Result<Vec<SyncableEntity>, SyncError> {
        let mut entities: Vec<SyncableEntity> = lock(&self.entities)
            .values()
            .filter(|e| e.sync_state == state)
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.local_updated_at.cmp(&b.local_updated_at));
        Ok(entities)
    }

    fn count_by_state(&self, state: SyncState) -> Result<usize, SyncError> {
        Ok(lock(&self.entities)
            .values()
            .filter(|e| e.sync_state == state)
            .count())
    }

    fn mark_synced(
        &self,
        entity: &SyncableEntity,
        remote_updated_at: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        let key = (entity.entity_type.as_str().to_string(), entity.id.clone());
        let mut entities = lock(&self.entities);
        match entities.get_mut(&key) {
            Some(stored)
                if stored.sync_state == SyncState::Syncing
                    && stored.local_updated_at == entity.local_updated_at =>
            {
                stored.sync_state = SyncState::Synced;
                stored.remote_updated_at = Some(remote_updated_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn load_setting(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(lock(&self.settings).get(key).cloned())
    }

    fn save_setting(&self, key: &str, json: &str) -> Result<(), SyncError> {
        lock(&self.settings).insert(key.to_string(), json.to_string());
        Ok(())
    }
}
