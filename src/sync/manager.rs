//! Sync Orchestrator - coordinates synchronization cycles
//!
//! Ties the components together:
//! - Reacts to connectivity restored and sign-in events
//! - Pushes unsynced local entities in batches; failures go to the mutation queue
//! - Pulls remote changes from other devices and routes divergences to the resolver
//! - Drains the mutation queue
//! - Exposes session status, progress and pending conflicts to the UI
//!
//! Only one cycle runs at a time (`SyncLock`). A cycle that cannot start
//! (disabled, signed out, offline, already running) returns a failed
//! `SyncResult` without touching any state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use super::auth::{AuthEvent, AuthProvider};
use super::conflict::{ConflictRecord, ConflictResolver, ManualChoice, Resolution, ResolutionOutcome};
use super::error::SyncError;
use super::events::{lock, EventBus, Subscription};
use super::lock::{SyncGuard, SyncLock};
use super::models::{
    ConflictStrategy, EntityType, SessionStatus, SyncConfig, SyncProgress, SyncSession, SyncState,
    SyncStatus, SyncableEntity,
};
use super::network::{ConnectivityChange, NetworkEvent, NetworkMonitor};
use super::queue::{MutationApplier, MutationOp, MutationQueue, MutationQueueItem, QueueEvent, QueueProgress};
use super::remote::{ChangeQuery, RemoteBackend, RemoteChange, RemoteWrite};
use super::scheduler::{SchedulerError, SyncScheduler};
use super::store::LocalStore;

const SYNC_CONFIG_KEY: &str = "sync_config";
const PULL_CURSOR_KEY: &str = "pull_cursor";
const LAST_SYNC_TIME_KEY: &str = "last_sync_time";
const EXHAUSTED_KEY: &str = "exhausted_mutations";

// ============================================================================
// Events & Results
// ============================================================================

/// Status stream published to subscribers
#[derive(Debug, Clone)]
pub enum SyncEvent {
    StatusChanged(SyncSession),
    Progress(SyncProgress),
    ConflictDetected(ConflictRecord),
    ConflictResolved { conflict_id: String, entity_id: String },
    QueueItemExhausted { item: MutationQueueItem, error: SyncError },
    CycleCompleted(SyncResult),
}

/// Outcome of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    /// Entities pushed, pulled, resolved or replayed
    pub synced_count: usize,
    /// Failed pushes plus exhausted queue items
    pub failed_count: usize,
    /// Conflicts waiting for a manual choice
    pub conflicts: Vec<ConflictRecord>,
    pub errors: Vec<String>,
}

impl SyncResult {
    /// A cycle that did not start
    pub fn failed(error: &SyncError) -> Self {
        Self {
            success: false,
            errors: vec![error.to_string()],
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOrder {
    /// push -> pull -> drain (`perform_sync`)
    PushFirst,
    /// pull -> push -> drain (`manual_sync`)
    PullFirst,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Sync orchestrator - main coordinator
pub struct SyncOrchestrator {
    config: RwLock<SyncConfig>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteBackend>,
    auth: Arc<dyn AuthProvider>,
    network: Arc<NetworkMonitor>,
    queue: Arc<MutationQueue>,
    resolver: RwLock<ConflictResolver>,
    lock: SyncLock,
    conflicts: Mutex<Vec<ConflictRecord>>,
    /// Mutations that ran out of attempts; parked until `retry_exhausted`
    exhausted: Mutex<Vec<MutationQueueItem>>,
    session: Mutex<SyncSession>,
    events: EventBus<SyncEvent>,
    scheduler: SyncScheduler,
    subscriptions: Mutex<Vec<Subscription>>,
    runtime: Mutex<Option<tokio::runtime::Handle>>,
}

impl SyncOrchestrator {
    /// Create an orchestrator; restores pending conflicts and the last sync time
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteBackend>,
        auth: Arc<dyn AuthProvider>,
        network: Arc<NetworkMonitor>,
        queue: Arc<MutationQueue>,
    ) -> Result<Arc<Self>, SyncError> {
        let conflicts = store.load_conflicts()?;
        if !conflicts.is_empty() {
            log::info!("Restored {} pending conflicts", conflicts.len());
        }

        let exhausted = load_exhausted(store.as_ref())?;
        if !exhausted.is_empty() {
            log::info!("{} exhausted mutations waiting for retry", exhausted.len());
        }

        let last_sync_time = load_timestamp(store.as_ref(), LAST_SYNC_TIME_KEY)?;
        let pending_count = store.count_unsynced()? + queue.len() + exhausted.len();

        let session = SyncSession {
            status: if conflicts.is_empty() {
                SessionStatus::Idle
            } else {
                SessionStatus::Conflict
            },
            last_sync_time,
            pending_count,
            ..Default::default()
        };

        let orchestrator = Arc::new(Self {
            resolver: RwLock::new(ConflictResolver::new(config.conflict_tolerance_ms)),
            config: RwLock::new(config),
            scheduler: SyncScheduler::new(store.clone()),
            store,
            remote,
            auth,
            network,
            lock: queue.sync_lock(),
            queue,
            conflicts: Mutex::new(conflicts),
            exhausted: Mutex::new(exhausted),
            session: Mutex::new(session),
            events: EventBus::new(),
            subscriptions: Mutex::new(Vec::new()),
            runtime: Mutex::new(None),
        });

        // Park exhausted queue items and forward them to the status stream
        let weak = Arc::downgrade(&orchestrator);
        let subscription = orchestrator.queue.subscribe(move |event: &QueueEvent| {
            if let (Some(this), QueueEvent::Exhausted { item, error }) = (weak.upgrade(), event) {
                if let Err(e) = this.park_exhausted(item.clone()) {
                    log::error!("Failed to record exhausted mutation {}: {}", item.id, e);
                }
                this.events.publish(&SyncEvent::QueueItemExhausted {
                    item: item.clone(),
                    error: error.clone(),
                });
            }
        });
        lock(&orchestrator.subscriptions).push(subscription);

        Ok(orchestrator)
    }

    /// Persisted configuration, if any was saved by `update_config`
    pub fn stored_config(store: &dyn LocalStore) -> Result<Option<SyncConfig>, SyncError> {
        match store.load_setting(SYNC_CONFIG_KEY)? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| SyncError::Storage(e.to_string())),
            None => Ok(None),
        }
    }

    /// Wire up connectivity and auth triggers, recover interrupted pushes,
    /// start periodic sync and run the startup sync.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        *lock(&self.runtime) = tokio::runtime::Handle::try_current().ok();

        let weak = Arc::downgrade(self);
        let network_subscription = self.network.add_listener(move |event: &NetworkEvent| {
            let Some(this) = weak.upgrade() else { return };
            match event.change {
                ConnectivityChange::Restored => this.spawn_sync("connectivity restored"),
                ConnectivityChange::Lost => log::info!("Offline: pausing sync until connectivity returns"),
                ConnectivityChange::Changed => {}
            }
        });

        let weak = Arc::downgrade(self);
        let auth_subscription = self.auth.on_auth_state_changed(Box::new(move |event: &AuthEvent| {
            let Some(this) = weak.upgrade() else { return };
            match event {
                AuthEvent::SignedIn { .. } => this.spawn_sync("signed in"),
                AuthEvent::SignedOut => log::info!("Signed out: sync paused"),
            }
        }));

        {
            let mut subscriptions = lock(&self.subscriptions);
            subscriptions.push(network_subscription);
            subscriptions.push(auth_subscription);
        }

        let recovered = self.recover_interrupted()?;
        if recovered > 0 {
            log::info!("Re-queued {} interrupted pushes", recovered);
        }

        let config = self.get_config();
        if config.enabled && config.sync_interval_minutes > 0 {
            if let Err(e) = self.start_periodic_sync(Duration::from_secs(config.sync_interval_minutes * 60)) {
                log::warn!("Failed to start periodic sync: {}", e);
            }
        }

        if config.sync_on_startup {
            self.spawn_sync("startup");
        }

        log::info!("Sync orchestrator started (device: {})", config.device_name);
        Ok(())
    }

    /// Detach listeners and stop periodic sync
    pub fn shutdown(&self) {
        let _ = self.scheduler.stop();
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.unsubscribe();
        }
        log::info!("Sync orchestrator stopped");
    }

    fn spawn_sync(self: &Arc<Self>, reason: &'static str) {
        if !self.can_sync() {
            log::debug!("Sync not triggered ({}): disabled, signed out or offline", reason);
            return;
        }

        let runtime = lock(&self.runtime).clone();
        match runtime {
            Some(handle) => {
                let this = self.clone();
                handle.spawn(async move {
                    log::info!("Sync triggered: {}", reason);
                    this.perform_sync().await;
                });
            }
            None => log::warn!("Sync not triggered ({}): no async runtime registered", reason),
        }
    }

    // ========================================================================
    // Sync Cycles
    // ========================================================================

    /// Push, pull, then drain the mutation queue
    pub async fn perform_sync(&self) -> SyncResult {
        self.run_cycle(CycleOrder::PushFirst).await
    }

    /// Pull, push, then drain (user-initiated refresh)
    pub async fn manual_sync(&self) -> SyncResult {
        self.run_cycle(CycleOrder::PullFirst).await
    }

    /// Enabled, signed in and online
    pub fn can_sync(&self) -> bool {
        self.check_preconditions().is_ok()
    }

    fn check_preconditions(&self) -> Result<(), SyncError> {
        if !self.get_config().enabled {
            return Err(SyncError::SyncDisabled);
        }
        if !self.auth.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }
        if !self.network.is_online_now() {
            return Err(SyncError::NetworkUnavailable);
        }
        Ok(())
    }

    async fn run_cycle(&self, order: CycleOrder) -> SyncResult {
        let guard = match self.lock.try_acquire() {
            Some(guard) => guard,
            None => {
                log::info!("Sync already in progress, skipping");
                return SyncResult::failed(&SyncError::AlreadySyncing);
            }
        };

        if let Err(e) = self.check_preconditions() {
            log::info!("Sync skipped: {}", e);
            return SyncResult::failed(&e);
        }
        let owner_id = match self.auth.current_user_id() {
            Some(id) => id,
            None => return SyncResult::failed(&SyncError::NotAuthenticated),
        };

        let config = self.get_config();
        log::info!("Starting sync cycle ({:?})", order);
        self.update_session(|session| {
            session.status = SessionStatus::Syncing;
            session.progress = SyncProgress::new(0, 0, "Starting sync");
        });

        let mut result = SyncResult::default();
        let since = match load_timestamp(self.store.as_ref(), PULL_CURSOR_KEY) {
            Ok(since) => since,
            Err(e) => {
                result.errors.push(format!("Pull cursor: {}", e));
                None
            }
        };

        match order {
            CycleOrder::PushFirst => {
                self.push_phase(&config, &owner_id, &mut result).await;
                self.pull_phase(&config, &owner_id, since, &mut result).await;
            }
            CycleOrder::PullFirst => {
                self.pull_phase(&config, &owner_id, since, &mut result).await;
                self.push_phase(&config, &owner_id, &mut result).await;
            }
        }

        self.drain_phase(&guard, &config, &owner_id, &mut result).await;

        self.finish_cycle(result)
    }

    async fn push_phase(&self, config: &SyncConfig, owner_id: &str, result: &mut SyncResult) {
        if let Err(e) = self.push_unsynced(config, owner_id, result).await {
            log::error!("Push failed: {}", e);
            result.errors.push(format!("Push: {}", e));
        }
    }

    async fn pull_phase(
        &self,
        config: &SyncConfig,
        owner_id: &str,
        since: Option<DateTime<Utc>>,
        result: &mut SyncResult,
    ) {
        if let Err(e) = self.pull_changes(config, owner_id, since, result).await {
            log::error!("Pull failed: {}", e);
            result.errors.push(format!("Pull: {}", e));
        }
    }

    /// Send every pending entity; per-item failures go to the queue
    async fn push_unsynced(
        &self,
        config: &SyncConfig,
        owner_id: &str,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        let unsynced = self.store.list_unsynced()?;
        let total = unsynced.len();
        if total == 0 {
            return Ok(());
        }

        log::info!("Pushing {} local changes", total);
        let mut done = 0;

        for chunk in unsynced.chunks(config.batch_size.max(1)) {
            let mut batch = Vec::with_capacity(chunk.len());
            for entity in chunk {
                let mut entity = entity.clone();
                entity.transition(SyncState::Syncing)?;
                self.store.put_entity(&entity)?;
                batch.push(entity);
            }

            let writes: Vec<RemoteWrite> = batch
                .iter()
                .map(|entity| RemoteWrite::from_entity(push_op(entity), entity, &config.device_id, owner_id))
                .collect();

            let outcomes = self.write_remote(&writes).await;

            for (entity, outcome) in batch.into_iter().zip(outcomes) {
                done += 1;
                match outcome {
                    Ok(remote_updated_at) => {
                        if self.store.mark_synced(&entity, remote_updated_at)? {
                            result.synced_count += 1;
                        } else {
                            log::debug!("{} {} changed during push, left pending", entity.entity_type, entity.id);
                        }
                    }
                    Err(reason) => {
                        log::warn!("Push of {} {} failed: {}", entity.entity_type, entity.id, reason);
                        self.enqueue_entity(push_op(&entity), &entity)?;
                        result.failed_count += 1;
                        result.errors.push(
                            SyncError::RemoteWriteFailed {
                                entity_id: entity.id.clone(),
                                reason,
                            }
                            .to_string(),
                        );
                    }
                }
                self.publish_progress(
                    done,
                    total,
                    format!("Pushed {} of {} local changes", done, total),
                );
            }
        }

        Ok(())
    }

    /// One outcome per write, in order
    async fn write_remote(&self, writes: &[RemoteWrite]) -> Vec<Result<DateTime<Utc>, String>> {
        if !self.remote.supports_atomic_batch() {
            let mut outcomes = Vec::with_capacity(writes.len());
            for write in writes {
                outcomes.push(self.remote.write(write).await.map_err(|e| e.to_string()));
            }
            return outcomes;
        }

        match self.remote.batch_write(writes).await {
            Ok(batch) => writes
                .iter()
                .map(|write| {
                    batch
                        .outcomes
                        .iter()
                        .find(|o| o.entity_type == write.entity_type && o.entity_id == write.entity_id)
                        .map(|o| o.result.clone())
                        .unwrap_or_else(|| Err("No outcome returned for entity".to_string()))
                })
                .collect(),
            Err(e) => {
                let reason = e.to_string();
                writes.iter().map(|_| Err(reason.clone())).collect()
            }
        }
    }

    /// Apply remote changes made by other devices since `since`
    async fn pull_changes(
        &self,
        config: &SyncConfig,
        owner_id: &str,
        since: Option<DateTime<Utc>>,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        let query = ChangeQuery {
            owner_id: owner_id.to_string(),
            exclude_device_id: config.device_id.clone(),
            since,
        };

        let changes = self
            .remote
            .fetch_changes(&query)
            .await
            .map_err(|e| SyncError::RemoteReadFailed(e.to_string()))?;

        if changes.is_empty() {
            log::debug!("No remote changes since {:?}", since);
            return Ok(());
        }
        log::info!("Pulled {} remote changes", changes.len());

        let mut first_failure: Option<DateTime<Utc>> = None;
        for change in &changes {
            if change.device_id.as_deref() == Some(config.device_id.as_str()) {
                continue;
            }

            if let Err(e) = self.apply_remote_change(change, config.default_strategy, result) {
                log::warn!("Failed to apply remote change to {} {}: {}", change.entity_type, change.entity_id, e);
                result.errors.push(format!("Pull {} {}: {}", change.entity_type, change.entity_id, e));
                first_failure = Some(first_failure.map_or(change.updated_at, |f| f.min(change.updated_at)));
            }
        }

        // The cursor stays below the earliest failed change so the next pull fetches it again
        let cursor = changes
            .iter()
            .map(|change| change.updated_at)
            .filter(|updated_at| first_failure.map_or(true, |f| *updated_at < f))
            .fold(since, |cursor, updated_at| match cursor {
                Some(c) if c >= updated_at => Some(c),
                _ => Some(updated_at),
            });

        if let Some(cursor) = cursor.filter(|c| Some(*c) != since) {
            save_timestamp(self.store.as_ref(), PULL_CURSOR_KEY, cursor)?;
        }
        Ok(())
    }

    fn apply_remote_change(
        &self,
        change: &RemoteChange,
        strategy: ConflictStrategy,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        let local = self.store.get_entity(&change.entity_type, &change.entity_id)?;

        if change.deleted {
            match local {
                Some(local) if local.sync_state == SyncState::Synced => {
                    self.store.delete_entity(&change.entity_type, &change.entity_id)?;
                    result.synced_count += 1;
                    log::debug!("Removed {} {} deleted remotely", change.entity_type, change.entity_id);
                }
                Some(_) => log::info!(
                    "Keeping {} {}: deleted remotely but has unsynced local changes",
                    change.entity_type,
                    change.entity_id
                ),
                None => {}
            }
            return Ok(());
        }

        let remote = change.to_entity();
        let local = match local {
            Some(local) => local,
            None => {
                self.store.put_entity(&remote)?;
                result.synced_count += 1;
                return Ok(());
            }
        };

        if local.sync_state == SyncState::Synced
            && local.remote_updated_at.map_or(false, |seen| seen >= change.updated_at)
        {
            log::debug!("Already have {} {} at {}", change.entity_type, change.entity_id, change.updated_at);
            return Ok(());
        }

        // A synced local copy has nothing to lose: fast-forward
        let conflict = if local.sync_state == SyncState::Synced {
            None
        } else {
            self.resolver().detect_conflict(&local, &remote)
        };

        let Some(conflict) = conflict else {
            self.write_through(local, &remote)?;
            result.synced_count += 1;
            return Ok(());
        };

        log::warn!(
            "{} (severity {:?})",
            SyncError::ConflictDetected(format!("{} {}", conflict.entity_type, conflict.entity_id)),
            conflict.severity
        );

        match self.resolver().resolve(&conflict, strategy) {
            ResolutionOutcome::Resolved(resolution) => {
                self.apply_resolution(local, &resolution, &conflict)?;
                // Supersedes a conflict still waiting from an earlier manual cycle
                self.drop_conflicts_for(&conflict.entity_type, &conflict.entity_id)?;
                result.synced_count += 1;
            }
            ResolutionOutcome::RequiresManualChoice { .. } => {
                let mut local = local;
                local.transition(SyncState::Syncing)?;
                local.transition(SyncState::Conflict)?;
                self.store.put_entity(&local)?;
                self.add_conflict(conflict.clone())?;
                self.events.publish(&SyncEvent::ConflictDetected(conflict));
            }
        }

        Ok(())
    }

    /// Replace the local version with the remote one
    fn write_through(&self, mut local: SyncableEntity, remote: &SyncableEntity) -> Result<(), SyncError> {
        local.transition(SyncState::Syncing)?;
        local.payload = remote.payload.clone();
        local.local_updated_at = remote.local_updated_at;
        local.remote_updated_at = remote.remote_updated_at;
        local.origin_device_id = remote.origin_device_id.clone();
        local.transition(SyncState::Synced)?;
        self.store.put_entity(&local)?;
        self.forget_exhausted(&local.entity_type, &local.id)?;

        // A newer remote write supersedes a stale pending conflict
        self.drop_conflicts_for(&local.entity_type, &local.id)
    }

    /// Store a resolved payload. Equal to remote: synced. Otherwise it is a
    /// fresh local mutation and goes out with the next push.
    fn apply_resolution(
        &self,
        mut entity: SyncableEntity,
        resolution: &Resolution,
        conflict: &ConflictRecord,
    ) -> Result<(), SyncError> {
        entity.transition(SyncState::Syncing)?;
        entity.payload = resolution.payload.clone();
        entity.remote_updated_at = Some(conflict.remote_timestamp);

        if resolution.payload == conflict.remote_payload {
            entity.local_updated_at = conflict.remote_timestamp;
            entity.transition(SyncState::Synced)?;
        } else {
            entity.mark_pending(Utc::now());
        }

        log::info!(
            "Resolved conflict on {} {} with {} (winner: {:?})",
            entity.entity_type,
            entity.id,
            resolution.metadata.strategy.as_str(),
            resolution.winner
        );
        self.store.put_entity(&entity)?;
        self.forget_exhausted(&entity.entity_type, &entity.id)
    }

    async fn drain_phase(
        &self,
        guard: &SyncGuard,
        config: &SyncConfig,
        owner_id: &str,
        result: &mut SyncResult,
    ) {
        if self.queue.is_empty() {
            return;
        }

        let applier = ReplayApplier {
            remote: self.remote.as_ref(),
            store: self.store.as_ref(),
            device_id: &config.device_id,
            owner_id,
        };
        let mut on_progress = |progress: &QueueProgress| {
            self.publish_progress(
                progress.processed,
                progress.processed + progress.remaining,
                format!("Replayed {} queued changes", progress.processed),
            );
        };

        match self.queue.drain(guard, &applier, &mut on_progress).await {
            Ok(drained) => {
                result.synced_count += drained.succeeded;
                result.failed_count += drained.exhausted.len();
                for item in &drained.exhausted {
                    result.errors.push(
                        SyncError::QueueItemExhausted {
                            item_id: item.id.clone(),
                            attempts: item.attempt_count,
                            reason: item.last_error.clone().unwrap_or_default(),
                        }
                        .to_string(),
                    );
                }
            }
            Err(e) => {
                log::error!("Queue drain failed: {}", e);
                result.errors.push(format!("Queue: {}", e));
            }
        }
    }

    fn finish_cycle(&self, mut result: SyncResult) -> SyncResult {
        let now = Utc::now();
        result.success = result.is_success();
        result.conflicts = self.pending_conflicts();

        if result.success {
            if let Err(e) = save_timestamp(self.store.as_ref(), LAST_SYNC_TIME_KEY, now) {
                log::warn!("Failed to persist last sync time: {}", e);
            }
        }

        let status = if result.has_conflicts() {
            SessionStatus::Conflict
        } else if result.success {
            SessionStatus::Success
        } else {
            SessionStatus::Error
        };
        let pending_count = self.count_pending();
        let error = if result.errors.is_empty() {
            None
        } else {
            Some(result.errors.join("; "))
        };

        self.update_session(|session| {
            session.status = status;
            session.progress = SyncProgress::default();
            session.pending_count = pending_count;
            session.error = error;
            if result.success {
                session.last_sync_time = Some(now);
            }
        });

        log::info!(
            "Sync cycle finished: status={}, synced={}, failed={}, conflicts={}",
            status.as_str(),
            result.synced_count,
            result.failed_count,
            result.conflicts.len()
        );
        self.events.publish(&SyncEvent::CycleCompleted(result.clone()));

        if status != SessionStatus::Conflict {
            self.update_session(|session| session.status = SessionStatus::Idle);
        }

        result
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    pub fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        lock(&self.conflicts).clone()
    }

    /// Resolve a pending conflict with an automatic strategy
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ConflictStrategy,
    ) -> Result<Resolution, SyncError> {
        if strategy == ConflictStrategy::Manual {
            return Err(SyncError::ManualResolutionRequired(conflict_id.to_string()));
        }

        let _guard = self.lock.acquire().await;
        let conflict = self.find_conflict(conflict_id)?;

        match self.resolver().resolve(&conflict, strategy) {
            ResolutionOutcome::Resolved(resolution) => {
                self.commit_resolution(&conflict, &resolution)?;
                Ok(resolution)
            }
            ResolutionOutcome::RequiresManualChoice { conflict_id } => {
                Err(SyncError::ManualResolutionRequired(conflict_id))
            }
        }
    }

    /// Resolve a pending conflict with the user's choice
    pub async fn apply_manual_resolution(
        &self,
        conflict_id: &str,
        choice: ManualChoice,
    ) -> Result<Resolution, SyncError> {
        let _guard = self.lock.acquire().await;
        let conflict = self.find_conflict(conflict_id)?;

        let resolution = self.resolver().apply_manual_resolution(&conflict, choice);
        self.commit_resolution(&conflict, &resolution)?;
        Ok(resolution)
    }

    fn find_conflict(&self, conflict_id: &str) -> Result<ConflictRecord, SyncError> {
        lock(&self.conflicts)
            .iter()
            .find(|c| c.id == conflict_id)
            .cloned()
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))
    }

    fn commit_resolution(&self, conflict: &ConflictRecord, resolution: &Resolution) -> Result<(), SyncError> {
        let entity = match self.store.get_entity(&conflict.entity_type, &conflict.entity_id)? {
            Some(entity) => entity,
            None => SyncableEntity {
                id: conflict.entity_id.clone(),
                entity_type: conflict.entity_type.clone(),
                payload: conflict.local_payload.clone(),
                local_updated_at: conflict.local_timestamp,
                remote_updated_at: Some(conflict.remote_timestamp),
                sync_state: SyncState::Conflict,
                origin_device_id: None,
            },
        };

        self.apply_resolution(entity, resolution, conflict)?;
        self.remove_conflict(&conflict.id)?;

        self.events.publish(&SyncEvent::ConflictResolved {
            conflict_id: conflict.id.clone(),
            entity_id: conflict.entity_id.clone(),
        });
        self.refresh_after_conflict_change();
        Ok(())
    }

    fn add_conflict(&self, conflict: ConflictRecord) -> Result<(), SyncError> {
        let mut conflicts = lock(&self.conflicts);
        let mut next = conflicts.clone();
        next.retain(|c| !(c.entity_type == conflict.entity_type && c.entity_id == conflict.entity_id));
        next.push(conflict);
        self.store.save_conflicts(&next)?;
        *conflicts = next;
        Ok(())
    }

    fn remove_conflict(&self, conflict_id: &str) -> Result<(), SyncError> {
        let mut conflicts = lock(&self.conflicts);
        let mut next = conflicts.clone();
        next.retain(|c| c.id != conflict_id);
        self.store.save_conflicts(&next)?;
        *conflicts = next;
        Ok(())
    }

    fn drop_conflicts_for(&self, entity_type: &EntityType, entity_id: &str) -> Result<(), SyncError> {
        let stale: Vec<String> = lock(&self.conflicts)
            .iter()
            .filter(|c| &c.entity_type == entity_type && c.entity_id == entity_id)
            .map(|c| c.id.clone())
            .collect();

        for conflict_id in stale {
            self.remove_conflict(&conflict_id)?;
            self.events.publish(&SyncEvent::ConflictResolved {
                conflict_id,
                entity_id: entity_id.to_string(),
            });
        }
        Ok(())
    }

    /// Leave the conflict state once nothing is pending
    fn refresh_after_conflict_change(&self) {
        let no_conflicts = lock(&self.conflicts).is_empty();
        let pending_count = self.count_pending();
        self.update_session(|session| {
            session.pending_count = pending_count;
            if no_conflicts && session.status == SessionStatus::Conflict {
                session.status = SessionStatus::Idle;
            }
        });
    }

    // ========================================================================
    // Local Changes
    // ========================================================================

    /// Record a local edit; it is pushed by the next cycle
    pub fn record_local_change(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: Value,
    ) -> Result<SyncableEntity, SyncError> {
        let device_id = self.get_config().device_id;

        let entity = match self.store.get_entity(&entity_type, id)? {
            Some(mut entity) => {
                entity.payload = payload;
                entity.mark_pending(Utc::now());
                entity.origin_device_id = Some(device_id);
                entity
            }
            None => {
                let mut entity = SyncableEntity::new(entity_type, id, payload);
                entity.origin_device_id = Some(device_id);
                entity
            }
        };

        self.store.put_entity(&entity)?;
        self.forget_exhausted(&entity.entity_type, &entity.id)?;
        log::debug!("Recorded local change to {} {}", entity.entity_type, entity.id);

        let pending_count = self.count_pending();
        self.update_session(|session| session.pending_count = pending_count);
        Ok(entity)
    }

    /// Delete locally; the remote delete goes through the mutation queue
    pub fn delete_entity(&self, entity_type: &EntityType, id: &str) -> Result<bool, SyncError> {
        let existing = match self.store.get_entity(entity_type, id)? {
            Some(entity) => entity,
            None => return Ok(false),
        };

        self.store.delete_entity(entity_type, id)?;
        self.forget_exhausted(entity_type, id)?;

        // Never reached the backend: nothing to delete remotely
        if existing.remote_updated_at.is_some() {
            let mut tombstone = existing;
            tombstone.mark_pending(Utc::now());
            self.enqueue_entity(MutationOp::Delete, &tombstone)?;
        }

        let pending_count = self.count_pending();
        self.update_session(|session| session.pending_count = pending_count);
        Ok(true)
    }

    /// Queue entities left in `syncing` by an interrupted cycle.
    /// Parked exhausted mutations stay parked.
    pub fn recover_interrupted(&self) -> Result<usize, SyncError> {
        let Some(_guard) = self.lock.try_acquire() else {
            return Ok(0);
        };

        let mut recovered = 0;
        for entity in self.store.list_by_state(SyncState::Syncing)? {
            if self.queue.contains_entity(&entity.entity_type, &entity.id)
                || self.is_exhausted(&entity.entity_type, &entity.id)
            {
                continue;
            }
            self.enqueue_entity(push_op(&entity), &entity)?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Give an exhausted mutation a fresh attempt budget
    pub fn retry_exhausted(&self, item: MutationQueueItem) -> Result<(), SyncError> {
        self.unpark(|parked| parked.id != item.id)?;
        self.queue.requeue(item)?;
        let pending_count = self.count_pending();
        self.update_session(|session| session.pending_count = pending_count);
        Ok(())
    }

    /// Mutations that ran out of attempts and wait for `retry_exhausted`
    pub fn exhausted_mutations(&self) -> Vec<MutationQueueItem> {
        lock(&self.exhausted).clone()
    }

    fn park_exhausted(&self, item: MutationQueueItem) -> Result<(), SyncError> {
        let mut exhausted = lock(&self.exhausted);
        let mut next = exhausted.clone();
        next.retain(|parked| !(parked.entity_type == item.entity_type && parked.entity_id == item.entity_id));
        next.push(item);
        save_exhausted(self.store.as_ref(), &next)?;
        *exhausted = next;
        Ok(())
    }

    fn is_exhausted(&self, entity_type: &EntityType, entity_id: &str) -> bool {
        lock(&self.exhausted)
            .iter()
            .any(|parked| &parked.entity_type == entity_type && parked.entity_id == entity_id)
    }

    /// The entity moved on (edited, deleted or settled by a pull)
    fn forget_exhausted(&self, entity_type: &EntityType, entity_id: &str) -> Result<(), SyncError> {
        self.unpark(|parked| !(&parked.entity_type == entity_type && parked.entity_id == entity_id))
    }

    /// Keep only the parked items matching `keep`
    fn unpark(&self, keep: impl Fn(&MutationQueueItem) -> bool) -> Result<(), SyncError> {
        let mut exhausted = lock(&self.exhausted);
        if exhausted.iter().all(|parked| keep(parked)) {
            return Ok(());
        }
        let next: Vec<MutationQueueItem> = exhausted.iter().filter(|parked| keep(parked)).cloned().collect();
        save_exhausted(self.store.as_ref(), &next)?;
        *exhausted = next;
        Ok(())
    }

    fn enqueue_entity(&self, op: MutationOp, entity: &SyncableEntity) -> Result<(), SyncError> {
        let snapshot = serde_json::to_value(entity).map_err(|e| SyncError::Queue(e.to_string()))?;
        self.queue
            .enqueue(op, entity.entity_type.clone(), entity.id.clone(), snapshot)?;
        Ok(())
    }

    // ========================================================================
    // Status & Configuration
    // ========================================================================

    pub fn get_sync_status(&self) -> SyncStatus {
        SyncStatus {
            is_syncing: lock(&self.session).status == SessionStatus::Syncing,
            is_online: self.network.is_online_now(),
            is_authenticated: self.auth.is_authenticated(),
            pending_count: self.count_pending(),
            conflicts: self.pending_conflicts(),
        }
    }

    pub fn get_session(&self) -> SyncSession {
        lock(&self.session).clone()
    }

    pub fn dismiss_error(&self) {
        self.update_session(|session| session.error = None);
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn get_config(&self) -> SyncConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Persist and apply a new configuration
    pub fn update_config(self: &Arc<Self>, config: SyncConfig) -> Result<(), SyncError> {
        let json = serde_json::to_string(&config).map_err(|e| SyncError::Storage(e.to_string()))?;
        self.store.save_setting(SYNC_CONFIG_KEY, &json)?;

        *self.resolver.write().unwrap_or_else(|e| e.into_inner()) =
            ConflictResolver::new(config.conflict_tolerance_ms);
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config.clone();

        if self.scheduler.is_running() {
            let _ = self.scheduler.stop();
        }
        if config.enabled && config.sync_interval_minutes > 0 {
            if let Err(e) = self.start_periodic_sync(Duration::from_secs(config.sync_interval_minutes * 60)) {
                log::warn!("Failed to restart periodic sync: {}", e);
            }
        }

        log::info!(
            "Sync config updated: enabled={}, interval={} minutes, strategy={}",
            config.enabled,
            config.sync_interval_minutes,
            config.default_strategy.as_str()
        );
        Ok(())
    }

    pub fn set_enabled(self: &Arc<Self>, enabled: bool) -> Result<(), SyncError> {
        let mut config = self.get_config();
        config.enabled = enabled;
        self.update_config(config)
    }

    /// Run `perform_sync` every `interval` (skipped while sync cannot run)
    pub fn start_periodic_sync(self: &Arc<Self>, interval: Duration) -> Result<(), SchedulerError> {
        if self.scheduler.is_running() {
            self.scheduler.stop()?;
        }
        self.scheduler.start(Arc::downgrade(self), interval)
    }

    pub fn stop_periodic_sync(&self) -> Result<(), SchedulerError> {
        self.scheduler.stop()
    }

    pub fn is_periodic_sync_running(&self) -> bool {
        self.scheduler.is_running()
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn resolver(&self) -> ConflictResolver {
        self.resolver.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn count_pending(&self) -> usize {
        let unsynced = self.store.count_unsynced().unwrap_or_else(|e| {
            log::warn!("Failed to count unsynced entities: {}", e);
            0
        });
        unsynced + self.queue.len() + lock(&self.exhausted).len()
    }

    fn update_session(&self, f: impl FnOnce(&mut SyncSession)) {
        let snapshot = {
            let mut session = lock(&self.session);
            f(&mut session);
            session.clone()
        };
        self.events.publish(&SyncEvent::StatusChanged(snapshot));
    }

    fn publish_progress(&self, current: usize, total: usize, message: String) {
        let progress = SyncProgress::new(current, total, message);
        lock(&self.session).progress = progress.clone();
        self.events.publish(&SyncEvent::Progress(progress));
    }
}

/// Create for entities the backend has never acknowledged
fn push_op(entity: &SyncableEntity) -> MutationOp {
    if entity.remote_updated_at.is_some() {
        MutationOp::Update
    } else {
        MutationOp::Create
    }
}

fn load_timestamp(store: &dyn LocalStore, key: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
    match store.load_setting(key)? {
        Some(json) => serde_json::from_str(&json).map_err(|e| SyncError::Storage(e.to_string())),
        None => Ok(None),
    }
}

fn load_exhausted(store: &dyn LocalStore) -> Result<Vec<MutationQueueItem>, SyncError> {
    match store.load_setting(EXHAUSTED_KEY)? {
        Some(json) => serde_json::from_str(&json).map_err(|e| SyncError::Storage(e.to_string())),
        None => Ok(Vec::new()),
    }
}

fn save_exhausted(store: &dyn LocalStore, items: &[MutationQueueItem]) -> Result<(), SyncError> {
    let json = serde_json::to_string(items).map_err(|e| SyncError::Storage(e.to_string()))?;
    store.save_setting(EXHAUSTED_KEY, &json)
}

fn save_timestamp(store: &dyn LocalStore, key: &str, ts: DateTime<Utc>) -> Result<(), SyncError> {
    let json = serde_json::to_string(&ts).map_err(|e| SyncError::Storage(e.to_string()))?;
    store.save_setting(key, &json)
}

// ============================================================================
// Queue Replay
// ============================================================================

/// Replays queued mutations as single remote writes
struct ReplayApplier<'a> {
    remote: &'a dyn RemoteBackend,
    store: &'a dyn LocalStore,
    device_id: &'a str,
    owner_id: &'a str,
}

#[async_trait]
impl<'a> MutationApplier for ReplayApplier<'a> {
    async fn apply(&self, item: &MutationQueueItem) -> Result<(), SyncError> {
        let entity: SyncableEntity = serde_json::from_value(item.payload.clone())
            .map_err(|e| SyncError::Queue(format!("Invalid snapshot in {}: {}", item.id, e)))?;

        if item.op_type != MutationOp::Delete {
            match self.store.get_entity(&entity.entity_type, &entity.id)? {
                // Edited or resolved since: the newer version is pushed instead
                Some(current) if current.local_updated_at != entity.local_updated_at => {
                    log::debug!("Queued mutation {} superseded by a newer local version", item.id);
                    return Ok(());
                }
                Some(current) if current.sync_state == SyncState::Conflict => {
                    log::debug!("Queued mutation {} dropped: entity awaits conflict resolution", item.id);
                    return Ok(());
                }
                None => {
                    log::debug!("Queued mutation {} dropped: entity deleted locally", item.id);
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        let write = RemoteWrite::from_entity(item.op_type, &entity, self.device_id, self.owner_id);
        let remote_updated_at =
            self.remote
                .write(&write)
                .await
                .map_err(|e| SyncError::RemoteWriteFailed {
                    entity_id: entity.id.clone(),
                    reason: e.to_string(),
                })?;

        if item.op_type != MutationOp::Delete {
            self.store.mark_synced(&entity, remote_updated_at)?;
        }
        Ok(())
    }
}
