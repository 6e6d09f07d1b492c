//! Conflict Resolver - detection and resolution of divergent versions
//!
//! Pure decision logic; nothing here touches storage or the network.
//!
//! Strategies:
//! - LAST_WRITE_WINS: newer timestamp wins (tie goes to local)
//! - LOCAL_FIRST / REMOTE_FIRST: fixed side
//! - MERGE: field merge rules per entity type
//! - MANUAL: returns `RequiresManualChoice`; completed by `apply_manual_resolution`

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::models::{ConflictStrategy, EntityType, SyncableEntity};

const DEFAULT_TOLERANCE_MS: i64 = 1_000;
const HIGH_SEVERITY_STROKE_DIFF: f64 = 2.0;

// ============================================================================
// Data Types
// ============================================================================

/// UI ordering hint; never changes how a conflict is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A divergence between the local and remote version of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub local_payload: Value,
    pub remote_payload: Value,
    pub local_timestamp: DateTime<Utc>,
    pub remote_timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn local_is_newer(&self) -> bool {
        self.local_timestamp >= self.remote_timestamp
    }
}

/// Which side a value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDiff {
    pub field: String,
    pub local: Option<Value>,
    pub remote: Option<Value>,
    pub chosen: Side,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionMetadata {
    pub strategy: ConflictStrategy,
    pub resolved_at: DateTime<Utc>,
    pub diffs: Vec<FieldDiff>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub conflict_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: Value,
    pub winner: Side,
    pub metadata: ResolutionMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    Resolved(Resolution),
    RequiresManualChoice { conflict_id: String },
}

/// Field overrides for the default merge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOptions {
    #[serde(default)]
    pub prefer_local: Vec<String>,
    #[serde(default)]
    pub prefer_remote: Vec<String>,
}

/// User's answer to a manual conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "payload")]
pub enum ManualChoice {
    KeepLocal,
    KeepRemote,
    Custom(Value),
}

// ============================================================================
// Resolver
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    tolerance_ms: i64,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE_MS)
    }
}

impl ConflictResolver {
    pub fn new(tolerance_ms: i64) -> Self {
        Self {
            tolerance_ms: tolerance_ms.max(0),
        }
    }

    pub fn tolerance_ms(&self) -> i64 {
        self.tolerance_ms
    }

    /// A conflict exists when the versions are further apart than the
    /// tolerance window and their payloads differ.
    pub fn detect_conflict(
        &self,
        local: &SyncableEntity,
        remote: &SyncableEntity,
    ) -> Option<ConflictRecord> {
        let local_ts = local.effective_timestamp();
        let remote_ts = remote.effective_timestamp();

        if (local_ts - remote_ts).num_milliseconds().abs() < self.tolerance_ms {
            return None;
        }
        if local.payload == remote.payload {
            return None;
        }

        let mut record = ConflictRecord {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: local.entity_type.clone(),
            entity_id: local.id.clone(),
            local_payload: local.payload.clone(),
            remote_payload: remote.payload.clone(),
            local_timestamp: local_ts,
            remote_timestamp: remote_ts,
            severity: Severity::Low,
            detected_at: Utc::now(),
        };
        record.severity = self.get_conflict_severity(&record);

        log::debug!(
            "Conflict on {} {}: local {} vs remote {}",
            record.entity_type,
            record.entity_id,
            local_ts,
            remote_ts
        );
        Some(record)
    }

    pub fn resolve(&self, conflict: &ConflictRecord, strategy: ConflictStrategy) -> ResolutionOutcome {
        self.resolve_with(conflict, strategy, &MergeOptions::default())
    }

    pub fn resolve_with(
        &self,
        conflict: &ConflictRecord,
        strategy: ConflictStrategy,
        options: &MergeOptions,
    ) -> ResolutionOutcome {
        let payload = match strategy {
            ConflictStrategy::LastWriteWins => {
                if conflict.local_is_newer() {
                    conflict.local_payload.clone()
                } else {
                    conflict.remote_payload.clone()
                }
            }
            ConflictStrategy::LocalFirst => conflict.local_payload.clone(),
            ConflictStrategy::RemoteFirst => conflict.remote_payload.clone(),
            ConflictStrategy::Merge => merge(conflict, options),
            ConflictStrategy::Manual => {
                return ResolutionOutcome::RequiresManualChoice {
                    conflict_id: conflict.id.clone(),
                }
            }
        };

        ResolutionOutcome::Resolved(build_resolution(conflict, strategy, payload))
    }

    /// Complete a conflict the user resolved by hand
    pub fn apply_manual_resolution(&self, conflict: &ConflictRecord, choice: ManualChoice) -> Resolution {
        let payload = match choice {
            ManualChoice::KeepLocal => conflict.local_payload.clone(),
            ManualChoice::KeepRemote => conflict.remote_payload.clone(),
            ManualChoice::Custom(payload) => payload,
        };
        build_resolution(conflict, ConflictStrategy::Manual, payload)
    }

    pub fn get_conflict_severity(&self, conflict: &ConflictRecord) -> Severity {
        match conflict.entity_type {
            EntityType::Score => {
                let local = conflict.local_payload.get("strokes").and_then(Value::as_f64);
                let remote = conflict.remote_payload.get("strokes").and_then(Value::as_f64);
                match (local, remote) {
                    (Some(l), Some(r)) if (l - r).abs() > HIGH_SEVERITY_STROKE_DIFF => Severity::High,
                    _ => Severity::Low,
                }
            }
            EntityType::Round => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn can_auto_resolve(&self, strategy: ConflictStrategy) -> bool {
        strategy != ConflictStrategy::Manual
    }
}

fn build_resolution(conflict: &ConflictRecord, strategy: ConflictStrategy, payload: Value) -> Resolution {
    let winner = if payload == conflict.local_payload {
        Side::Local
    } else if payload == conflict.remote_payload {
        Side::Remote
    } else {
        Side::Merged
    };

    let diffs = field_diffs(&conflict.local_payload, &conflict.remote_payload, &payload);

    Resolution {
        conflict_id: conflict.id.clone(),
        entity_type: conflict.entity_type.clone(),
        entity_id: conflict.entity_id.clone(),
        payload,
        winner,
        metadata: ResolutionMetadata {
            strategy,
            resolved_at: Utc::now(),
            diffs,
        },
    }
}

/// Fields whose local and remote values differ, with the side that was kept
fn field_diffs(local: &Value, remote: &Value, resolved: &Value) -> Vec<FieldDiff> {
    let empty = Map::new();
    let local = local.as_object().unwrap_or(&empty);
    let remote = remote.as_object().unwrap_or(&empty);
    let resolved = resolved.as_object().unwrap_or(&empty);

    let fields: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();

    fields
        .into_iter()
        .filter(|field| local.get(*field) != remote.get(*field))
        .map(|field| {
            let l = local.get(field);
            let r = remote.get(field);
            let chosen = resolved.get(field);
            let side = if chosen == l {
                Side::Local
            } else if chosen == r {
                Side::Remote
            } else {
                Side::Merged
            };
            FieldDiff {
                field: field.clone(),
                local: l.cloned(),
                remote: r.cloned(),
                chosen: side,
            }
        })
        .collect()
}

// ============================================================================
// Merge Rules
// ============================================================================

fn merge(conflict: &ConflictRecord, options: &MergeOptions) -> Value {
    let (local, remote) = match (conflict.local_payload.as_object(), conflict.remote_payload.as_object()) {
        (Some(l), Some(r)) => (l, r),
        // Not objects: nothing to merge field by field
        _ => {
            return if conflict.local_is_newer() {
                conflict.local_payload.clone()
            } else {
                conflict.remote_payload.clone()
            }
        }
    };
    let local_newer = conflict.local_is_newer();

    let merged = match conflict.entity_type {
        EntityType::Round => merge_round(local, remote, local_newer),
        EntityType::Score => merge_score(local, remote, local_newer),
        EntityType::Player => overlay_newer(local, remote, local_newer),
        EntityType::Course => remote.clone(),
        EntityType::Other(_) => merge_fields(local, remote, local_newer, options),
    };

    Value::Object(merged)
}

/// Union of fields; the newer side wins where both have one
fn overlay_newer(local: &Map<String, Value>, remote: &Map<String, Value>, local_newer: bool) -> Map<String, Value> {
    let (older, newer) = if local_newer { (remote, local) } else { (local, remote) };
    let mut merged = older.clone();
    for (key, value) in newer {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn merge_round(local: &Map<String, Value>, remote: &Map<String, Value>, local_newer: bool) -> Map<String, Value> {
    // Fields not handled below, courseId included, follow the newer side
    let mut merged = overlay_newer(local, remote, local_newer);

    if local.contains_key("playerIds") || remote.contains_key("playerIds") {
        let mut players: BTreeMap<String, Value> = BTreeMap::new();
        for side in [local, remote] {
            if let Some(ids) = side.get("playerIds").and_then(Value::as_array) {
                for id in ids {
                    let key = id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string());
                    players.insert(key, id.clone());
                }
            }
        }
        merged.insert("playerIds".to_string(), Value::Array(players.into_values().collect()));
    }

    if let Some(start) = pick_time(local.get("startTime"), remote.get("startTime"), |a, b| a <= b) {
        merged.insert("startTime".to_string(), start);
    }
    if let Some(end) = pick_time(local.get("endTime"), remote.get("endTime"), |a, b| a >= b) {
        merged.insert("endTime".to_string(), end);
    }

    let local_notes = non_empty_str(local.get("notes"));
    let remote_notes = non_empty_str(remote.get("notes"));
    match (local_notes, remote_notes) {
        (Some(l), Some(r)) if l != r => {
            merged.insert("notes".to_string(), Value::String(format!("{}\n{}", l, r)));
        }
        (Some(l), _) => {
            merged.insert("notes".to_string(), Value::String(l.to_string()));
        }
        (None, Some(r)) => {
            merged.insert("notes".to_string(), Value::String(r.to_string()));
        }
        (None, None) => {}
    }

    if local.contains_key("isCompleted") || remote.contains_key("isCompleted") {
        let completed = is_true(local.get("isCompleted")) || is_true(remote.get("isCompleted"));
        merged.insert("isCompleted".to_string(), Value::Bool(completed));
    }

    merged
}

fn merge_score(local: &Map<String, Value>, remote: &Map<String, Value>, local_newer: bool) -> Map<String, Value> {
    let mut merged = overlay_newer(local, remote, local_newer);

    if let Some(strokes) = pick_number(local.get("strokes"), remote.get("strokes"), |a, b| a <= b) {
        merged.insert("strokes".to_string(), strokes);
    }

    let local_putts = local.get("putts").filter(|v| is_non_zero(v));
    let remote_putts = remote.get("putts").filter(|v| is_non_zero(v));
    let putts = match (local_putts, remote_putts) {
        (Some(l), None) => Some(l),
        (None, Some(r)) => Some(r),
        (Some(l), Some(r)) => Some(if local_newer { l } else { r }),
        (None, None) => None,
    };
    if let Some(putts) = putts {
        merged.insert("putts".to_string(), putts.clone());
    }

    if let Some(ob) = pick_number(local.get("obCount"), remote.get("obCount"), |a, b| a >= b) {
        merged.insert("obCount".to_string(), ob);
    }

    if local.contains_key("fairwayHit") || remote.contains_key("fairwayHit") {
        let hit = is_true(local.get("fairwayHit")) || is_true(remote.get("fairwayHit"));
        merged.insert("fairwayHit".to_string(), Value::Bool(hit));
    }

    merged
}

/// Per field: newer wins unless a preference list names the field
fn merge_fields(
    local: &Map<String, Value>,
    remote: &Map<String, Value>,
    local_newer: bool,
    options: &MergeOptions,
) -> Map<String, Value> {
    let mut merged = overlay_newer(local, remote, local_newer);

    for field in &options.prefer_local {
        if let Some(value) = local.get(field) {
            merged.insert(field.clone(), value.clone());
        }
    }
    for field in &options.prefer_remote {
        if options.prefer_local.contains(field) {
            continue;
        }
        if let Some(value) = remote.get(field) {
            merged.insert(field.clone(), value.clone());
        }
    }

    merged
}

// ============================================================================
// Value helpers
// ============================================================================

/// Parse an RFC 3339 string or epoch milliseconds
pub fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Of two optional timestamp values, the non-null one, or the one `keep_first` prefers
fn pick_time<F>(a: Option<&Value>, b: Option<&Value>, keep_first: F) -> Option<Value>
where
    F: Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
{
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (Some(x), Some(y)) => match (parse_time(x), parse_time(y)) {
            (Some(tx), Some(ty)) => Some(if keep_first(tx, ty) { x.clone() } else { y.clone() }),
            (Some(_), None) => Some(x.clone()),
            (None, Some(_)) => Some(y.clone()),
            (None, None) => None,
        },
        (Some(x), None) => Some(x.clone()),
        (None, Some(y)) => Some(y.clone()),
        (None, None) => None,
    }
}

fn pick_number<F>(a: Option<&Value>, b: Option<&Value>, keep_first: F) -> Option<Value>
where
    F: Fn(f64, f64) -> bool,
{
    match (a.and_then(Value::as_f64), b.and_then(Value::as_f64)) {
        (Some(x), Some(y)) => {
            if keep_first(x, y) {
                a.cloned()
            } else {
                b.cloned()
            }
        }
        (Some(_), None) => a.cloned(),
        (None, Some(_)) => b.cloned(),
        (None, None) => None,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

fn is_true(value: Option<&Value>) -> bool {
    value.and_then(Value::as_bool).unwrap_or(false)
}

fn is_non_zero(value: &Value) -> bool {
    value.as_f64().map(|n| n != 0.0).unwrap_or(false)
}

// ============================================================================
// Tests
// ============================================================================
