//! Sync Data Models
//!
//! Defines the data structures shared by the sync engine components.
//!
//! Data Categories:
//! - SyncConfig: Sync settings (persisted in the settings table, overridable from env)
//! - SyncableEntity: A local record (round, score, player, course) and its sync state
//! - SyncSession / SyncProgress: Orchestrator state exposed to the UI
//! - ConflictStrategy: Named conflict resolution policies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::conflict::ConflictRecord;

// ============================================================================
// Sync Configuration
// ============================================================================

const ENV_PREFIX: &str = "SCORECARD_SYNC_";

/// Sync configuration
///
/// Stored locally under the `sync_config` settings key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Whether sync is enabled
    pub enabled: bool,

    /// Unique device identifier (UUID v4). Remote changes written by this
    /// device are filtered out of the pull.
    pub device_id: String,

    /// Human readable device name
    pub device_name: String,

    /// Periodic sync interval in minutes (0 = manual only)
    pub sync_interval_minutes: u64,

    /// Sync when the app starts
    pub sync_on_startup: bool,

    /// Strategy applied to conflicts detected during a pull
    pub default_strategy: ConflictStrategy,

    /// Timestamps closer than this are not a conflict
    pub conflict_tolerance_ms: i64,

    /// Maximum entities per remote batch write
    pub batch_size: usize,

    /// Attempts before a queued mutation is dropped
    pub max_attempts: u32,

    /// First retry delay; doubles per attempt
    pub retry_base_delay_ms: u64,

    /// Upper bound for the retry delay
    pub retry_max_delay_ms: u64,

    /// Base URL of the sync backend
    pub api_base_url: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: get_default_device_name(),
            sync_interval_minutes: 15,
            sync_on_startup: true,
            default_strategy: ConflictStrategy::LastWriteWins,
            conflict_tolerance_ms: 1_000,
            batch_size: 50,
            max_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            api_base_url: "https://api.scorecard.app/v1".to_string(),
        }
    }
}

impl SyncConfig {
    /// Build a config from defaults overridden by `SCORECARD_SYNC_*`
    /// environment variables (a `.env` file is loaded first if present).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build a config from defaults overridden by the given variable lookup
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = parse_var(&var, "ENABLED") {
            config.enabled = v;
        }
        if let Some(v) = var("DEVICE_ID").filter(|v| !v.is_empty()) {
            config.device_id = v;
        }
        if let Some(v) = var("DEVICE_NAME").filter(|v| !v.is_empty()) {
            config.device_name = v;
        }
        if let Some(v) = parse_var(&var, "INTERVAL_MINUTES") {
            config.sync_interval_minutes = v;
        }
        if let Some(v) = var("DEFAULT_STRATEGY") {
            match ConflictStrategy::parse(&v) {
                Some(strategy) => config.default_strategy = strategy,
                None => log::warn!("Ignoring unknown conflict strategy in env: {}", v),
            }
        }
        if let Some(v) = parse_var(&var, "CONFLICT_TOLERANCE_MS") {
            config.conflict_tolerance_ms = v;
        }
        if let Some(v) = parse_var(&var, "BATCH_SIZE") {
            config.batch_size = v;
        }
        if let Some(v) = parse_var(&var, "MAX_ATTEMPTS") {
            config.max_attempts = v;
        }
        if let Some(v) = parse_var(&var, "RETRY_BASE_DELAY_MS") {
            config.retry_base_delay_ms = v;
        }
        if let Some(v) = parse_var(&var, "RETRY_MAX_DELAY_MS") {
            config.retry_max_delay_ms = v;
        }
        if let Some(v) = var("API_URL").filter(|v| !v.is_empty()) {
            config.api_base_url = v;
        }

        config
    }
}

fn parse_var<T, F>(var: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = var(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring invalid value for {}{}: {:?}", ENV_PREFIX, name, raw);
            None
        }
    }
}

/// Get default device name from hostname
fn get_default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Scorecard Device".to_string())
}

// ============================================================================
// Entities
// ============================================================================

/// Kind of syncable record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Round,
    Score,
    Player,
    Course,
    /// Record kind this build does not know; merged field by field
    Other(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Round => "round",
            Self::Score => "score",
            Self::Player => "player",
            Self::Course => "course",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "round" => Self::Round,
            "score" => Self::Score,
            "player" => Self::Player,
            "course" => Self::Course,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<EntityType> for String {
    fn from(t: EntityType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-entity sync state
///
/// Lifecycle: pending -> syncing -> {synced, conflict}. A fresh local
/// mutation moves any state back to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Syncing,
    Synced,
    Conflict,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "syncing" => Some(Self::Syncing),
            "synced" => Some(Self::Synced),
            "conflict" => Some(Self::Conflict),
            _ => None,
        }
    }

    /// Whether the sync engine may move an entity from `self` to `next`.
    ///
    /// Returning to `Pending` is not a sync transition; only a local
    /// mutation (`SyncableEntity::mark_pending`) does that.
    pub fn can_transition_to(&self, next: SyncState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Syncing)
                | (Self::Syncing, Self::Synced)
                | (Self::Syncing, Self::Conflict)
                | (Self::Synced, Self::Syncing)
                | (Self::Conflict, Self::Syncing)
        )
    }
}

/// A local record tracked by the sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableEntity {
    pub id: String,
    pub entity_type: EntityType,

    /// Record body (JSON object with the app's camelCase field names)
    pub payload: Value,

    /// Last local modification
    pub local_updated_at: DateTime<Utc>,

    /// Timestamp of the version last seen on the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_updated_at: Option<DateTime<Utc>>,

    pub sync_state: SyncState,

    /// Device that produced this payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_device_id: Option<String>,
}

impl SyncableEntity {
    /// Create a new locally modified entity
    pub fn new(entity_type: EntityType, id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            entity_type,
            payload,
            local_updated_at: Utc::now(),
            remote_updated_at: None,
            sync_state: SyncState::Pending,
            origin_device_id: None,
        }
    }

    /// Move along the sync lifecycle
    pub fn transition(&mut self, next: SyncState) -> Result<(), super::error::SyncError> {
        if self.sync_state == next {
            return Ok(());
        }
        if !self.sync_state.can_transition_to(next) {
            return Err(super::error::SyncError::InvalidTransition {
                entity_id: self.id.clone(),
                from: self.sync_state,
                to: next,
            });
        }
        self.sync_state = next;
        Ok(())
    }

    /// Record a fresh local mutation
    pub fn mark_pending(&mut self, at: DateTime<Utc>) {
        self.local_updated_at = at;
        self.sync_state = SyncState::Pending;
    }

    /// The timestamp used to compare this version against another
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.local_updated_at
    }
}

// ============================================================================
// Session & Status
// ============================================================================

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Syncing,
    Success,
    Error,
    Conflict,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::Error => "error",
            Self::Conflict => "conflict",
        }
    }
}

/// Progress of the current cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub current: usize,
    pub total: usize,
    pub message: String,
}

impl SyncProgress {
    pub fn new(current: usize, total: usize, message: impl Into<String>) -> Self {
        Self {
            current,
            total,
            message: message.into(),
        }
    }
}

/// Snapshot of the orchestrator session, bound by the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    pub status: SessionStatus,
    pub progress: SyncProgress,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub pending_count: usize,
    /// Dismissible error indicator
    pub error: Option<String>,
}

impl Default for SyncSession {
    fn default() -> Self {
        Self {
            status: SessionStatus::Idle,
            progress: SyncProgress::default(),
            last_sync_time: None,
            pending_count: 0,
            error: None,
        }
    }
}

/// Aggregated status returned by `SyncOrchestrator::get_sync_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub is_online: bool,
    pub is_authenticated: bool,
    pub pending_count: usize,
    pub conflicts: Vec<ConflictRecord>,
}

// ============================================================================
// Conflict Resolution
// ============================================================================

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    /// Newer timestamp wins
    LastWriteWins,

    /// Always keep the local version
    LocalFirst,

    /// Always keep the remote version
    RemoteFirst,

    /// Entity-specific field merge
    Merge,

    /// Ask the user
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastWriteWins => "LAST_WRITE_WINS",
            Self::LocalFirst => "LOCAL_FIRST",
            Self::RemoteFirst => "REMOTE_FIRST",
            Self::Merge => "MERGE",
            Self::Manual => "MANUAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "LAST_WRITE_WINS" | "LWW" => Some(Self::LastWriteWins),
            "LOCAL_FIRST" => Some(Self::LocalFirst),
            "REMOTE_FIRST" => Some(Self::RemoteFirst),
            "MERGE" => Some(Self::Merge),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
