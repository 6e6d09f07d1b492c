//! Error taxonomy for the sync engine.

use super::models::SyncState;

/// Errors surfaced by the sync engine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("Network unavailable")]
    NetworkUnavailable,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Sync already in progress")]
    AlreadySyncing,

    #[error("Sync is disabled")]
    SyncDisabled,

    #[error("Remote write failed for {entity_id}: {reason}")]
    RemoteWriteFailed { entity_id: String, reason: String },

    #[error("Remote read failed: {0}")]
    RemoteReadFailed(String),

    #[error("Conflict detected for {0}")]
    ConflictDetected(String),

    #[error("Manual resolution required for conflict {0}")]
    ManualResolutionRequired(String),

    #[error("Queue item {item_id} exhausted after {attempts} attempts: {reason}")]
    QueueItemExhausted {
        item_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Invalid sync state transition for {entity_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        entity_id: String,
        from: SyncState,
        to: SyncState,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),
}

impl SyncError {
    /// Failures that abort a whole cycle rather than a single item
    pub fn is_cycle_level(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable
                | Self::NotAuthenticated
                | Self::AlreadySyncing
                | Self::SyncDisabled
        )
    }
}

impl From<crate::db::DbError> for SyncError {
    fn from(e: crate::db::DbError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<super::queue::QueueError> for SyncError {
    fn from(e: super::queue::QueueError) -> Self {
        Self::Queue(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_level_classification() {
        assert!(SyncError::NotAuthenticated.is_cycle_level());
        assert!(SyncError::NetworkUnavailable.is_cycle_level());
        assert!(!SyncError::RemoteReadFailed("timeout".into()).is_cycle_level());
    }

    #[test]
    fn test_already_syncing_message() {
        assert_eq!(SyncError::AlreadySyncing.to_string(), "Sync already in progress");
    }
}
