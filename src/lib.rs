//! # Scorecard Sync
//!
//! Offline-first synchronization engine for the scorekeeping app.
//! Rounds, scores, players and courses are edited locally and reconciled with
//! the shared backend whenever the device is online and the user is signed in.

pub mod db;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use db::Database;
use sync::{
    AuthProvider, MutationQueue, NetworkMonitor, RemoteBackend, RetryPolicy, SyncConfig, SyncError, SyncLock,
    SyncOrchestrator,
};

pub use db::DbError;
pub use sync::{SyncEvent, SyncResult, SyncStatus};

/// Initialize logging (`RUST_LOG` overrides the default `info` filter)
pub fn init_logging() {
    dotenvy::dotenv().ok();
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

/// Wire the sync engine on top of an opened database.
///
/// A configuration saved through `SyncOrchestrator::update_config` takes
/// precedence over `config`. Call `start()` on the result to attach the
/// connectivity and auth triggers.
pub fn open_sync_engine(
    config: SyncConfig,
    db: Database,
    remote: Arc<dyn RemoteBackend>,
    auth: Arc<dyn AuthProvider>,
    network: Arc<NetworkMonitor>,
) -> Result<Arc<SyncOrchestrator>, SyncError> {
    let config = SyncOrchestrator::stored_config(&db)?.unwrap_or(config);

    let policy = RetryPolicy::exponential(
        config.max_attempts,
        Duration::from_millis(config.retry_base_delay_ms),
        Duration::from_millis(config.retry_max_delay_ms),
    );
    let queue = MutationQueue::open(Arc::new(db.clone()), policy, network.clone(), SyncLock::new())?;

    log::info!(
        "Sync engine opened (device: {}, {} queued mutations)",
        config.device_id,
        queue.len()
    );

    SyncOrchestrator::new(config, Arc::new(db), remote, auth, network, Arc::new(queue))
}
