//! Mutation Queue - durable FIFO of local writes that failed to reach the backend
//!
//! When a push fails (offline, server down, rejected), the mutation is queued
//! locally and replayed on the next drain.
//!
//! Features:
//! - Every change is persisted (`QueueStore`) before the call returns
//! - Explicit `RetryPolicy` (attempt budget + exponential backoff)
//! - Failed items move to the tail; exhausted items are dropped and published
//! - Drains stop early when connectivity is lost, keeping the rest in order
//! - Single flight: shares the device-wide `SyncLock` with sync cycles

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::error::SyncError;
use super::events::{lock, EventBus, Subscription};
use super::lock::{SyncGuard, SyncLock};
use super::models::EntityType;
use super::network::NetworkMonitor;
use crate::db::{format_timestamp, parse_timestamp, Database};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY_MS: u64 = 500; // First retry after 500ms
const MAX_DELAY_MS: u64 = 30_000; // Never wait more than 30s

// ============================================================================
// Data Types
// ============================================================================

/// Kind of local mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A queued mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationQueueItem {
    pub id: String,
    pub op_type: MutationOp,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Serialized entity snapshot to replay
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Backoff: not attempted before this instant
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl MutationQueueItem {
    pub fn new(
        op_type: MutationOp,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        payload: Value,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            entity_type,
            entity_id: entity_id.into(),
            payload,
            enqueued_at: Utc::now(),
            attempt_count: 0,
            max_attempts,
            next_attempt_at: None, // Ready immediately
            last_error: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Retry budget and backoff schedule
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    delay_fn: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
}

impl RetryPolicy {
    /// `delay_fn(attempt_count)` is the wait before the next attempt
    pub fn new<F>(max_attempts: u32, delay_fn: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self {
            max_attempts,
            delay_fn: Arc::new(delay_fn),
        }
    }

    /// `base`, `2 * base`, `4 * base`, ... capped at `max_delay`
    pub fn exponential(max_attempts: u32, base: Duration, max_delay: Duration) -> Self {
        Self::new(max_attempts, move |attempt| {
            let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
            base.checked_mul(factor).unwrap_or(max_delay).min(max_delay)
        })
    }

    /// No wait between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, |_| Duration::ZERO)
    }

    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        (self.delay_fn)(attempt_count)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(
            DEFAULT_MAX_ATTEMPTS,
            Duration::from_millis(BASE_DELAY_MS),
            Duration::from_millis(MAX_DELAY_MS),
        )
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Snapshot returned by `MutationQueue::get_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub count: usize,
    pub items: Vec<MutationQueueItem>,
    pub is_processing: bool,
}

/// Per-item drain progress
#[derive(Debug, Clone, PartialEq)]
pub struct QueueProgress {
    pub processed: usize,
    pub remaining: usize,
    pub item_id: String,
    pub succeeded: bool,
}

/// Result of a drain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessQueueResult {
    /// Attempts made (an item retried twice counts twice)
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items dropped after running out of attempts
    pub exhausted: Vec<MutationQueueItem>,
    /// Stopped early because connectivity was lost
    pub interrupted: bool,
    /// Did not run (offline, already processing or lock held)
    pub skipped: bool,
}

impl ProcessQueueResult {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Exhausted {
        item: MutationQueueItem,
        error: SyncError,
    },
    Drained(ProcessQueueResult),
}

// ============================================================================
// Persistence
// ============================================================================

/// Backing storage for the queue; `save` replaces the whole content
pub trait QueueStore: Send + Sync {
    fn load(&self) -> Result<Vec<MutationQueueItem>, QueueError>;

    fn save(&self, items: &[MutationQueueItem]) -> Result<(), QueueError>;
}

/// Non-durable store (for testing)
#[derive(Default)]
pub struct MemoryQueueStore {
    items: Mutex<Vec<MutationQueueItem>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn load(&self) -> Result<Vec<MutationQueueItem>, QueueError> {
        Ok(lock(&self.items).clone())
    }

    fn save(&self, items: &[MutationQueueItem]) -> Result<(), QueueError> {
        *lock(&self.items) = items.to_vec();
        Ok(())
    }
}

impl QueueStore for Database {
    fn load(&self) -> Result<Vec<MutationQueueItem>, QueueError> {
        let rows = self
            .query(
                r#"
                SELECT id, op_type, entity_type, entity_id, payload, enqueued_at,
                       attempt_count, max_attempts, next_attempt_at, last_error
                FROM mutation_queue
                ORDER BY position ASC
                "#,
                params![],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, u32>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                    ))
                },
            )
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        rows.into_iter()
            .map(
                |(id, op, entity_type, entity_id, payload, enqueued_at, attempts, max, next, last_error)| {
                    Ok(MutationQueueItem {
                        op_type: MutationOp::parse(&op)
                            .ok_or_else(|| QueueError::Serialization(format!("unknown op type: {}", op)))?,
                        entity_type: EntityType::from(entity_type),
                        entity_id,
                        payload: serde_json::from_str(&payload)
                            .map_err(|e| QueueError::Serialization(e.to_string()))?,
                        enqueued_at: parse_timestamp(&enqueued_at).ok_or_else(|| {
                            QueueError::Serialization(format!("invalid timestamp for item {}", id))
                        })?,
                        attempt_count: attempts,
                        max_attempts: max,
                        next_attempt_at: next.as_deref().and_then(parse_timestamp),
                        last_error,
                        id,
                    })
                },
            )
            .collect()
    }

    fn save(&self, items: &[MutationQueueItem]) -> Result<(), QueueError> {
        self.transaction(|tx| {
            tx.execute("DELETE FROM mutation_queue", [])?;

            let mut stmt = tx.prepare(
                r#"
                INSERT INTO mutation_queue (
                    position, id, op_type, entity_type, entity_id, payload,
                    enqueued_at, attempt_count, max_attempts, next_attempt_at, last_error
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
            )?;

            for (position, item) in items.iter().enumerate() {
                let payload = serde_json::to_string(&item.payload)
                    .map_err(|e| crate::db::DbError::Serialization(e.to_string()))?;
                stmt.execute(params![
                    position as i64,
                    item.id,
                    item.op_type.as_str(),
                    item.entity_type.as_str(),
                    item.entity_id,
                    payload,
                    format_timestamp(&item.enqueued_at),
                    item.attempt_count,
                    item.max_attempts,
                    item.next_attempt_at.as_ref().map(format_timestamp),
                    item.last_error,
                ])?;
            }

            Ok(())
        })
        .map_err(|e| QueueError::DatabaseError(e.to_string()))
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Replays one queued mutation against the backend
#[async_trait]
pub trait MutationApplier: Send + Sync {
    async fn apply(&self, item: &MutationQueueItem) -> Result<(), SyncError>;
}

struct ProcessingFlag<'a>(&'a AtomicBool);

impl Drop for ProcessingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Durable FIFO of pending local writes
pub struct MutationQueue {
    items: Mutex<VecDeque<MutationQueueItem>>,
    store: Arc<dyn QueueStore>,
    policy: RetryPolicy,
    network: Arc<NetworkMonitor>,
    lock: SyncLock,
    processing: AtomicBool,
    events: EventBus<QueueEvent>,
}

impl MutationQueue {
    /// Open the queue, restoring persisted items in order
    pub fn open(
        store: Arc<dyn QueueStore>,
        policy: RetryPolicy,
        network: Arc<NetworkMonitor>,
        lock: SyncLock,
    ) -> Result<Self, QueueError> {
        let items: VecDeque<MutationQueueItem> = store.load()?.into();
        if !items.is_empty() {
            log::info!("Restored {} queued mutations", items.len());
        }

        Ok(Self {
            items: Mutex::new(items),
            store,
            policy,
            network,
            lock,
            processing: AtomicBool::new(false),
            events: EventBus::new(),
        })
    }

    /// Apply `f` to a copy of the queue, persist it, then publish it
    fn update<R>(
        &self,
        f: impl FnOnce(&mut VecDeque<MutationQueueItem>) -> R,
    ) -> Result<R, QueueError> {
        let mut items = lock(&self.items);
        let mut next = items.clone();
        let out = f(&mut next);
        self.store.save(next.make_contiguous())?;
        *items = next;
        Ok(out)
    }

    /// Append a mutation; persisted before returning
    pub fn enqueue(
        &self,
        op_type: MutationOp,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Result<MutationQueueItem, QueueError> {
        let item = MutationQueueItem::new(
            op_type,
            entity_type,
            entity_id,
            payload,
            self.policy.max_attempts,
        );
        self.enqueue_item(item.clone())?;
        Ok(item)
    }

    pub fn enqueue_item(&self, item: MutationQueueItem) -> Result<(), QueueError> {
        log::info!(
            "Queueing {} of {} {} (item {})",
            item.op_type.as_str(),
            item.entity_type,
            item.entity_id,
            item.id
        );
        self.update(|items| items.push_back(item))
    }

    /// Put an exhausted item back with a fresh attempt budget
    pub fn requeue(&self, mut item: MutationQueueItem) -> Result<(), QueueError> {
        item.attempt_count = 0;
        item.max_attempts = self.policy.max_attempts;
        item.next_attempt_at = None;
        item.last_error = None;
        self.enqueue_item(item)
    }

    pub fn get_status(&self) -> QueueStatus {
        let items: Vec<MutationQueueItem> = lock(&self.items).iter().cloned().collect();
        QueueStatus {
            count: items.len(),
            items,
            is_processing: self.is_processing(),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    /// Drop every item; returns how many were removed
    pub fn clear(&self) -> Result<usize, QueueError> {
        let removed = self.update(|items| {
            let count = items.len();
            items.clear();
            count
        })?;
        log::info!("Cleared {} queued mutations", removed);
        Ok(removed)
    }

    pub fn remove(&self, id: &str) -> Result<MutationQueueItem, QueueError> {
        self.update(|items| {
            let position = items.iter().position(|item| item.id == id)?;
            items.remove(position)
        })?
        .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))
    }

    pub fn contains_entity(&self, entity_type: &EntityType, entity_id: &str) -> bool {
        lock(&self.items)
            .iter()
            .any(|item| &item.entity_type == entity_type && item.entity_id == entity_id)
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn sync_lock(&self) -> SyncLock {
        self.lock.clone()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Drain the queue unless offline or a sync cycle holds the lock
    pub async fn process(
        &self,
        applier: &dyn MutationApplier,
    ) -> Result<ProcessQueueResult, QueueError> {
        if !self.network.is_online_now() {
            log::debug!("Queue processing skipped: offline");
            return Ok(ProcessQueueResult::skipped());
        }

        let guard = match self.lock.try_acquire() {
            Some(guard) => guard,
            None => {
                log::debug!("Queue processing skipped: sync in progress");
                return Ok(ProcessQueueResult::skipped());
            }
        };

        self.drain(&guard, applier, &mut |_: &QueueProgress| {}).await
    }

    /// Drain while the caller holds the sync lock
    pub async fn drain(
        &self,
        _guard: &SyncGuard,
        applier: &dyn MutationApplier,
        on_progress: &mut (dyn FnMut(&QueueProgress) + Send),
    ) -> Result<ProcessQueueResult, QueueError> {
        if self.processing.swap(true, Ordering::SeqCst) {
            return Ok(ProcessQueueResult::skipped());
        }
        let _flag = ProcessingFlag(&self.processing);

        let mut result = ProcessQueueResult::default();

        loop {
            if !self.network.is_online_now() {
                if !self.is_empty() {
                    result.interrupted = true;
                    log::info!("Connectivity lost, {} queued mutations left for later", self.len());
                }
                break;
            }

            let head = match lock(&self.items).front() {
                Some(item) => item.clone(),
                None => break,
            };

            if let Some(not_before) = head.next_attempt_at {
                let wait = (not_before - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                    continue;
                }
            }

            let outcome = applier.apply(&head).await;
            result.processed += 1;

            let succeeded = match outcome {
                Ok(()) => {
                    self.update(|items| items.retain(|item| item.id != head.id))?;
                    result.succeeded += 1;
                    log::debug!("Replayed queued mutation {}", head.id);
                    true
                }
                Err(e) => {
                    result.failed += 1;
                    self.record_failure(&head.id, &e, &mut result)?;
                    false
                }
            };

            on_progress(&QueueProgress {
                processed: result.processed,
                remaining: self.len(),
                item_id: head.id.clone(),
                succeeded,
            });
        }

        if result.processed > 0 {
            log::info!(
                "Queue drain finished: {} attempted, {} succeeded, {} exhausted",
                result.processed,
                result.succeeded,
                result.exhausted.len()
            );
            self.events.publish(&QueueEvent::Drained(result.clone()));
        }

        Ok(result)
    }

    /// Count the failed attempt; move the item to the tail or drop it
    fn record_failure(
        &self,
        id: &str,
        error: &SyncError,
        result: &mut ProcessQueueResult,
    ) -> Result<(), QueueError> {
        let policy = &self.policy;
        let exhausted = self.update(|items| {
            let position = items.iter().position(|item| item.id == id)?;
            let mut item = items.remove(position)?;
            item.attempt_count += 1;
            item.last_error = Some(error.to_string());

            if item.is_exhausted() {
                return Some(item);
            }

            let delay = policy.delay_for(item.attempt_count);
            item.next_attempt_at = Some(
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            );
            log::warn!(
                "Queued mutation {} failed (attempt {}/{}): {}",
                item.id,
                item.attempt_count,
                item.max_attempts,
                error
            );
            items.push_back(item);
            None
        })?;

        if let Some(item) = exhausted {
            log::warn!(
                "Queued mutation {} dropped after {} attempts: {}",
                item.id,
                item.attempt_count,
                error
            );
            let error = SyncError::QueueItemExhausted {
                item_id: item.id.clone(),
                attempts: item.attempt_count,
                reason: error.to_string(),
            };
            result.exhausted.push(item.clone());
            self.events.publish(&QueueEvent::Exhausted { item, error });
        }

        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Queue item not found: {0}")]
    ItemNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::network::{ConnectionType, NetworkStatus};
    use serde_json::json;
    use std::collections::HashMap;

    fn online_monitor() -> Arc<NetworkMonitor> {
        let monitor = Arc::new(NetworkMonitor::new());
        monitor.apply_reading(NetworkStatus::online(ConnectionType::Wifi));
        monitor
    }

    fn create_test_queue(network: Arc<NetworkMonitor>, max_attempts: u32) -> MutationQueue {
        MutationQueue::open(
            Arc::new(MemoryQueueStore::new()),
            RetryPolicy::immediate(max_attempts),
            network,
            SyncLock::new(),
        )
        .expect("Failed to open queue")
    }

    fn enqueue_named(queue: &MutationQueue, name: &str) {
        queue
            .enqueue(MutationOp::Update, EntityType::Score, name, json!({"strokes": 4}))
            .unwrap();
    }

    fn queued_ids(queue: &MutationQueue) -> Vec<String> {
        queue
            .get_status()
            .items
            .into_iter()
            .map(|item| item.entity_id)
            .collect()
    }

    /// Records calls; fails each entity a scripted number of times
    #[derive(Default)]
    struct ScriptedApplier {
        calls: Mutex<Vec<String>>,
        failures: Mutex<HashMap<String, u32>>,
        offline_after: Option<(usize, Arc<NetworkMonitor>)>,
    }

    impl ScriptedApplier {
        fn failing(entity_id: &str, times: u32) -> Self {
            let applier = Self::default();
            lock(&applier.failures).insert(entity_id.to_string(), times);
            applier
        }

        fn calls(&self) -> Vec<String> {
            lock(&self.calls).clone()
        }
    }

    #[async_trait]
    impl MutationApplier for ScriptedApplier {
        async fn apply(&self, item: &MutationQueueItem) -> Result<(), SyncError> {
            let call_count = {
                let mut calls = lock(&self.calls);
                calls.push(item.entity_id.clone());
                calls.len()
            };

            if let Some((after, network)) = &self.offline_after {
                if call_count == *after {
                    network.apply_reading(NetworkStatus::offline());
                }
            }

            let mut failures = lock(&self.failures);
            match failures.get_mut(&item.entity_id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(SyncError::RemoteWriteFailed {
                        entity_id: item.entity_id.clone(),
                        reason: "server unavailable".to_string(),
                    })
                }
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_enqueue_persists_immediately() {
        let store = Arc::new(MemoryQueueStore::new());
        let queue = MutationQueue::open(
            store.clone(),
            RetryPolicy::default(),
            online_monitor(),
            SyncLock::new(),
        )
        .unwrap();

        let item = queue
            .enqueue(MutationOp::Create, EntityType::Round, "r1", json!({"notes": ""}))
            .unwrap();

        assert_eq!(item.attempt_count, 0);
        assert_eq!(item.max_attempts, 3);
        assert_eq!(store.load().unwrap(), vec![item]);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = create_test_queue(online_monitor(), 3);
        for name in ["A", "B", "C"] {
            enqueue_named(&queue, name);
        }

        let applier = ScriptedApplier::default();
        let result = queue.process(&applier).await.unwrap();

        assert_eq!(applier.calls(), vec!["A", "B", "C"]);
        assert_eq!(result.succeeded, 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_retried_item_goes_behind_others() {
        let queue = create_test_queue(online_monitor(), 3);
        for name in ["A", "B", "C"] {
            enqueue_named(&queue, name);
        }

        let applier = ScriptedApplier::failing("A", 1);
        let result = queue.process(&applier).await.unwrap();

        assert_eq!(applier.calls(), vec!["A", "B", "C", "A"]);
        assert_eq!(result.processed, 4);
        assert_eq!(result.failed, 1);
        assert_eq!(result.succeeded, 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_item_dropped_and_surfaced() {
        let queue = create_test_queue(online_monitor(), 3);
        enqueue_named(&queue, "doomed");
        enqueue_named(&queue, "fine");

        let surfaced = Arc::new(Mutex::new(Vec::new()));
        let sink = surfaced.clone();
        queue.subscribe(move |event| {
            if let QueueEvent::Exhausted { item, error } = event {
                lock(&sink).push((item.entity_id.clone(), error.clone()));
            }
        });

        let applier = ScriptedApplier::failing("doomed", u32::MAX);
        let result = queue.process(&applier).await.unwrap();

        assert_eq!(applier.calls(), vec!["doomed", "fine", "doomed", "doomed"]);
        assert_eq!(result.exhausted.len(), 1);
        assert_eq!(result.exhausted[0].attempt_count, 3);
        assert_eq!(queue.len(), 0);

        let surfaced = lock(&surfaced);
        assert_eq!(surfaced.len(), 1);
        assert_eq!(surfaced[0].0, "doomed");
        assert!(matches!(
            surfaced[0].1,
            SyncError::QueueItemExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_connectivity_loss_stops_drain() {
        let network = online_monitor();
        let queue = create_test_queue(network.clone(), 3);
        for name in ["1", "2", "3", "4", "5"] {
            enqueue_named(&queue, name);
        }

        let applier = ScriptedApplier {
            offline_after: Some((2, network.clone())),
            ..Default::default()
        };
        let result = queue.process(&applier).await.unwrap();

        assert_eq!(applier.calls(), vec!["1", "2"]);
        assert!(result.interrupted);
        assert_eq!(queued_ids(&queue), vec!["3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_process_skipped_when_offline_or_locked() {
        let network = Arc::new(NetworkMonitor::new());
        let queue = create_test_queue(network.clone(), 3);
        enqueue_named(&queue, "A");

        let applier = ScriptedApplier::default();
        assert!(queue.process(&applier).await.unwrap().skipped);

        network.apply_reading(NetworkStatus::online(ConnectionType::Wifi));
        let guard = queue.sync_lock().try_acquire().unwrap();
        assert!(queue.process(&applier).await.unwrap().skipped);

        drop(guard);
        let result = queue.process(&applier).await.unwrap();
        assert!(!result.skipped);
        assert_eq!(result.succeeded, 1);
    }

    #[tokio::test]
    async fn test_drain_reports_progress() {
        let queue = create_test_queue(online_monitor(), 3);
        enqueue_named(&queue, "A");
        enqueue_named(&queue, "B");

        let guard = queue.sync_lock().try_acquire().unwrap();
        let mut progress = Vec::new();
        queue
            .drain(&guard, &ScriptedApplier::default(), &mut |p: &QueueProgress| {
                progress.push(p.clone())
            })
            .await
            .unwrap();

        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].remaining, 1);
        assert_eq!(progress[1].processed, 2);
        assert_eq!(progress[1].remaining, 0);
    }

    #[test]
    fn test_remove_and_clear() {
        let queue = create_test_queue(online_monitor(), 3);
        enqueue_named(&queue, "A");
        enqueue_named(&queue, "B");
        enqueue_named(&queue, "C");

        let id = queue.get_status().items[1].id.clone();
        assert_eq!(queue.remove(&id).unwrap().entity_id, "B");
        assert!(matches!(queue.remove(&id), Err(QueueError::ItemNotFound(_))));
        assert_eq!(queued_ids(&queue), vec!["A", "C"]);

        assert!(queue.contains_entity(&EntityType::Score, "A"));
        assert_eq!(queue.clear().unwrap(), 2);
        assert!(!queue.contains_entity(&EntityType::Score, "A"));
    }

    #[test]
    fn test_requeue_resets_budget() {
        let queue = create_test_queue(online_monitor(), 3);
        let mut item = MutationQueueItem::new(MutationOp::Delete, EntityType::Player, "p1", json!({}), 3);
        item.attempt_count = 3;
        item.last_error = Some("gone".to_string());

        queue.requeue(item).unwrap();

        let status = queue.get_status();
        assert_eq!(status.count, 1);
        assert_eq!(status.items[0].attempt_count, 0);
        assert!(status.items[0].last_error.is_none());
    }

    #[test]
    fn test_failed_save_leaves_queue_unchanged() {
        struct BrokenStore;

        impl QueueStore for BrokenStore {
            fn load(&self) -> Result<Vec<MutationQueueItem>, QueueError> {
                Ok(Vec::new())
            }

            fn save(&self, _items: &[MutationQueueItem]) -> Result<(), QueueError> {
                Err(QueueError::DatabaseError("disk full".to_string()))
            }
        }

        let queue = MutationQueue::open(
            Arc::new(BrokenStore),
            RetryPolicy::default(),
            online_monitor(),
            SyncLock::new(),
        )
        .unwrap();

        assert!(queue
            .enqueue(MutationOp::Create, EntityType::Round, "r1", json!({}))
            .is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        {
            let db = Arc::new(Database::new(path.clone()).unwrap());
            let queue =
                MutationQueue::open(db, RetryPolicy::default(), online_monitor(), SyncLock::new())
                    .unwrap();
            for name in ["A", "B", "C"] {
                enqueue_named(&queue, name);
            }
        }

        let db = Arc::new(Database::new(path).unwrap());
        let queue =
            MutationQueue::open(db, RetryPolicy::default(), online_monitor(), SyncLock::new()).unwrap();

        assert_eq!(queued_ids(&queue), vec!["A", "B", "C"]);
        assert_eq!(queue.get_status().items[0].payload, json!({"strokes": 4}));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(30_000));

        assert_eq!(RetryPolicy::immediate(5).delay_for(3), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_backoff_delays_retry() {
        let queue = MutationQueue::open(
            Arc::new(MemoryQueueStore::new()),
            RetryPolicy::new(2, |_| Duration::from_millis(20)),
            online_monitor(),
            SyncLock::new(),
        )
        .unwrap();
        enqueue_named(&queue, "A");

        let started = std::time::Instant::now();
        let result = queue.process(&ScriptedApplier::failing("A", 1)).await.unwrap();

        assert_eq!(result.succeeded, 1);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
