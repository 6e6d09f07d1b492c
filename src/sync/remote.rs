//! Remote Backend - the seam to the shared sync server
//!
//! - `batch_write`: atomic multi-entity write (per-entity outcomes)
//! - `write`: single entity write, used when batching is unsupported and for queue replay
//! - `fetch_changes`: change feed filtered by owner, excluding one device

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::models::{EntityType, SyncState, SyncableEntity};
use super::queue::MutationOp;

/// One entity write sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteWrite {
    pub op: MutationOp,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
    pub device_id: String,
    pub owner_id: String,
}

impl RemoteWrite {
    pub fn from_entity(
        op: MutationOp,
        entity: &SyncableEntity,
        device_id: &str,
        owner_id: &str,
    ) -> Self {
        Self {
            op,
            entity_type: entity.entity_type.clone(),
            entity_id: entity.id.clone(),
            payload: entity.payload.clone(),
            updated_at: entity.local_updated_at,
            device_id: device_id.to_string(),
            owner_id: owner_id.to_string(),
        }
    }
}

/// Result of one write inside a batch; `Ok` carries the server timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub result: Result<DateTime<Utc>, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchWriteResult {
    pub outcomes: Vec<WriteOutcome>,
}

/// A change read from the backend's feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(default)]
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteChange {
    /// The change as a local entity that matches the backend
    pub fn to_entity(&self) -> SyncableEntity {
        SyncableEntity {
            id: self.entity_id.clone(),
            entity_type: self.entity_type.clone(),
            payload: self.payload.clone(),
            local_updated_at: self.updated_at,
            remote_updated_at: Some(self.updated_at),
            sync_state: SyncState::Synced,
            origin_device_id: self.device_id.clone(),
        }
    }
}

/// Change feed filter
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeQuery {
    pub owner_id: String,
    pub exclude_device_id: String,
    pub since: Option<DateTime<Utc>>,
}

/// Shared sync backend
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn batch_write(&self, writes: &[RemoteWrite]) -> Result<BatchWriteResult, RemoteError>;

    async fn write(&self, write: &RemoteWrite) -> Result<DateTime<Utc>, RemoteError>;

    async fn fetch_changes(&self, query: &ChangeQuery) -> Result<Vec<RemoteChange>, RemoteError>;

    fn supports_atomic_batch(&self) -> bool {
        true
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Invalid backend URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
