//! Sync Module - Offline-First Scorecard Synchronization
//!
//! Keeps rounds, scores, players and courses consistent between the local
//! store and the shared backend:
//! - Network monitoring (connectivity readings and transitions)
//! - Durable mutation queue with retry policy
//! - Conflict detection and resolution (LWW, local/remote first, merge, manual)
//! - Sync orchestration (push, pull, drain) with periodic scheduling
//!
//! Architecture:
//! - Local-first: every edit lands in the local store as `pending`
//! - Single-flight: one sync cycle or queue drain per device (`SyncLock`)
//! - Pluggable seams: `LocalStore`, `RemoteBackend`, `AuthProvider`, `ConnectivityProvider`

pub mod api;
pub mod auth;
pub mod conflict;
pub mod error;
pub mod events;
pub mod lock;
pub mod manager;
pub mod models;
pub mod network;
pub mod queue;
pub mod remote;
pub mod scheduler;
pub mod store;


// Re-export commonly used types
pub use api::HttpRemoteBackend;
pub use auth::{AuthEvent, AuthProvider, AuthSession};
pub use conflict::{
    ConflictRecord, ConflictResolver, ManualChoice, MergeOptions, Resolution, ResolutionOutcome, Severity,
};
pub use error::SyncError;
pub use events::{EventBus, Subscription};
pub use lock::{SyncGuard, SyncLock};
pub use manager::{SyncEvent, SyncOrchestrator, SyncResult};
pub use models::{
    ConflictStrategy, EntityType, SessionStatus, SyncConfig, SyncProgress, SyncSession, SyncState, SyncStatus,
    SyncableEntity,
};
pub use network::{ConnectionType, ConnectivityError, ConnectivityProvider, NetworkMonitor, NetworkStatus};
pub use queue::{
    MemoryQueueStore, MutationOp, MutationQueue, MutationQueueItem, ProcessQueueResult, QueueError, QueueStatus,
    QueueStore, RetryPolicy,
};
pub use remote::{ChangeQuery, RemoteBackend, RemoteChange, RemoteError, RemoteWrite};
pub use scheduler::{SchedulerConfig, SchedulerError, SyncScheduler};
pub use store::{LocalStore, MemoryStore};
