//! Periodic Sync Scheduler
//!
//! Triggers `SyncOrchestrator::perform_sync` at a fixed interval.
//! Uses a Tokio task; ticks are skipped while sync is disabled, the user is
//! signed out or the device is offline.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::events::lock;
use super::manager::SyncOrchestrator;
use super::store::LocalStore;

const SCHEDULER_CONFIG_KEY: &str = "scheduler_config";
const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub last_run: Option<String>, // RFC 3339 timestamp
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 15 * 60 * 1000,
            last_run: None,
        }
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("No async runtime to run the scheduler on")]
    NoRuntime,
}

/// Background scheduler for periodic sync cycles
pub struct SyncScheduler {
    store: Arc<dyn LocalStore>,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Mutex::new(None),
        }
    }

    /// Load configuration from the settings table
    pub fn load_config(&self) -> Result<SchedulerConfig, SchedulerError> {
        let config: SchedulerConfig = match self
            .store
            .load_setting(SCHEDULER_CONFIG_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?
        {
            Some(json) => serde_json::from_str(&json).map_err(|e| SchedulerError::Database(e.to_string()))?,
            None => SchedulerConfig::default(),
        };

        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config.clone();
        Ok(config)
    }

    /// Save configuration to the settings table
    pub fn save_config(&self) -> Result<(), SchedulerError> {
        save_config(self.store.as_ref(), &self.get_config())
    }

    pub fn get_config(&self) -> SchedulerConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Start the background task
    pub fn start(&self, target: Weak<SyncOrchestrator>, interval: Duration) -> Result<(), SchedulerError> {
        if interval.is_zero() || interval > MAX_INTERVAL {
            return Err(SchedulerError::InvalidInterval(format!(
                "Interval must be between 1ms and 24h, got {:?}",
                interval
            )));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            config.enabled = true;
            config.interval_ms = interval.as_millis() as u64;
        }
        if let Err(e) = self.save_config() {
            log::warn!("Failed to persist scheduler config: {}", e);
        }

        let handle = runtime.spawn(scheduler_loop(
            self.running.clone(),
            self.store.clone(),
            self.config.clone(),
            target,
            interval,
        ));
        *lock(&self.task_handle) = Some(handle);

        log::info!("Periodic sync started (interval: {:?})", interval);
        Ok(())
    }

    /// Stop the background task
    pub fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(handle) = lock(&self.task_handle).take() {
            handle.abort();
        }

        self.config.write().unwrap_or_else(|e| e.into_inner()).enabled = false;
        if let Err(e) = self.save_config() {
            log::warn!("Failed to persist scheduler config: {}", e);
        }

        log::info!("Periodic sync stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task_handle).take() {
            handle.abort();
        }
    }
}

fn save_config(store: &dyn LocalStore, config: &SchedulerConfig) -> Result<(), SchedulerError> {
    let json = serde_json::to_string(config).map_err(|e| SchedulerError::Database(e.to_string()))?;
    store
        .save_setting(SCHEDULER_CONFIG_KEY, &json)
        .map_err(|e| SchedulerError::Database(e.to_string()))
}

/// Background scheduler loop (runs in spawned task)
async fn scheduler_loop(
    running: Arc<AtomicBool>,
    store: Arc<dyn LocalStore>,
    config: Arc<RwLock<SchedulerConfig>>,
    target: Weak<SyncOrchestrator>,
    period: Duration,
) {
    // First tick one period from now
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        if !running.load(Ordering::SeqCst) {
            break;
        }

        let orchestrator = match target.upgrade() {
            Some(orchestrator) => orchestrator,
            None => {
                log::debug!("Orchestrator dropped, scheduler loop exiting");
                break;
            }
        };

        if !orchestrator.can_sync() {
            log::debug!("Scheduled sync skipped: disabled, signed out or offline");
            continue;
        }

        log::info!("Background sync triggered by scheduler");
        let result = orchestrator.perform_sync().await;
        drop(orchestrator);

        if result.success {
            log::info!(
                "Background sync completed: synced={}, failed={}, conflicts={}",
                result.synced_count,
                result.failed_count,
                result.conflicts.len()
            );
        } else {
            log::warn!("Background sync finished with errors: {:?}", result.errors);
        }

        let snapshot = {
            let mut cfg = config.write().unwrap_or_else(|e| e.into_inner());
            cfg.last_run = Some(Utc::now().to_rfc3339());
            cfg.clone()
        };
        if let Err(e) = save_config(store.as_ref(), &snapshot) {
            log::error!("Failed to save last_run timestamp: {}", e);
        }
    }

    log::info!("Scheduler loop exited");
}

// ============================================================================
// Tests
// ============================================================================
