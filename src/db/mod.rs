//! Database module for Scorecard Sync
//!
//! Provides SQLite storage for syncable records, settings and the
//! persisted mutation queue.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::sync::models::{EntityType, SyncState, SyncableEntity};

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Format a timestamp for storage.
///
/// Fixed-width nanosecond precision keeps string ordering equal to time
/// ordering and round-trips `Utc::now()` exactly.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a stored RFC 3339 timestamp
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) a database file with a connection pool
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;"));

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        // Initialize one connection for schema and migrations
        let conn = pool.get()?;

        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        log::debug!("Database journal mode: {}", journal_mode);

        conn.execute_batch(
            r#"
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        Self::initialize(&conn)?;
        drop(conn);

        log::info!("Opened sync database at {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every SQLite in-memory connection is its own database, so the pool
    /// holds exactly one connection that is never recycled.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::initialize(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn initialize(conn: &Connection) -> DbResult<()> {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok(())
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value (stored as JSON)
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        match self.get_setting_raw(key)? {
            Some(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        self.set_setting_raw(key, &json)
    }

    /// Get the raw JSON text of a setting
    pub fn get_setting_raw(&self, key: &str) -> DbResult<Option<String>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    /// Store raw JSON text under a setting key
    pub fn set_setting_raw(&self, key: &str, json: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;
        Ok(())
    }

    // =========================================================================
    // ENTITIES
    // =========================================================================

    /// Insert or replace an entity
    pub fn upsert_entity(&self, entity: &SyncableEntity) -> DbResult<()> {
        let conn = self.get_conn()?;
        let payload = serde_json::to_string(&entity.payload)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO entities (
                entity_type, id, payload, local_updated_at,
                remote_updated_at, sync_state, origin_device_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(entity_type, id) DO UPDATE SET
                payload = excluded.payload,
                local_updated_at = excluded.local_updated_at,
                remote_updated_at = excluded.remote_updated_at,
                sync_state = excluded.sync_state,
                origin_device_id = excluded.origin_device_id
            "#,
            params![
                entity.entity_type.as_str(),
                entity.id,
                payload,
                format_timestamp(&entity.local_updated_at),
                entity.remote_updated_at.as_ref().map(format_timestamp),
                entity.sync_state.as_str(),
                entity.origin_device_id,
            ],
        )?;

        Ok(())
    }

    /// Get an entity by type and ID
    pub fn get_entity(&self, entity_type: &EntityType, id: &str) -> DbResult<Option<SyncableEntity>> {
        let conn = self.get_conn()?;
        let entity = conn
            .query_row(
                &format!("{} WHERE entity_type = ?1 AND id = ?2", ENTITY_SELECT),
                params![entity_type.as_str(), id],
                entity_from_row,
            )
            .optional()?;
        Ok(entity)
    }

    /// Delete an entity; returns whether a row existed
    pub fn delete_entity(&self, entity_type: &EntityType, id: &str) -> DbResult<bool> {
        let deleted = self.execute(
            "DELETE FROM entities WHERE entity_type = ?1 AND id = ?2",
            params![entity_type.as_str(), id],
        )?;
        Ok(deleted > 0)
    }

    /// List entities in a sync state, oldest local change first
    pub fn get_entities_by_state(&self, state: SyncState) -> DbResult<Vec<SyncableEntity>> {
        self.query(
            &format!(
                "{} WHERE sync_state = ?1 ORDER BY local_updated_at ASC, entity_type ASC, id ASC",
                ENTITY_SELECT
            ),
            params![state.as_str()],
            entity_from_row,
        )
    }

    /// Count entities in a sync state
    pub fn count_entities_by_state(&self, state: SyncState) -> DbResult<usize> {
        let count: i64 = self.query_row(
            "SELECT COUNT(*) FROM entities WHERE sync_state = ?1",
            params![state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Mark an entity synced if it still holds the pushed version.
    ///
    /// Returns false when the row changed locally after the push started.
    pub fn mark_entity_synced(
        &self,
        entity: &SyncableEntity,
        remote_updated_at: &DateTime<Utc>,
    ) -> DbResult<bool> {
        let updated = self.execute(
            r#"
            UPDATE entities
            SET sync_state = 'synced', remote_updated_at = ?1
            WHERE entity_type = ?2 AND id = ?3
              AND sync_state = 'syncing'
              AND local_updated_at = ?4
            "#,
            params![
                format_timestamp(remote_updated_at),
                entity.entity_type.as_str(),
                entity.id,
                format_timestamp(&entity.local_updated_at),
            ],
        )?;
        Ok(updated > 0)
    }

    // =========================================================================
    // HELPER METHODS (for queue module and other internal use)
    // =========================================================================

    /// Execute a SQL statement and return affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;
        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query single row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        conn.query_row(sql, params, f).map_err(DbError::from)
    }

    /// Execute batch SQL
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(sql).map_err(DbError::from)
    }

    /// Run `f` inside a transaction; commits only if `f` succeeds
    pub fn transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> DbResult<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

const ENTITY_SELECT: &str = r#"
    SELECT entity_type, id, payload, local_updated_at,
           remote_updated_at, sync_state, origin_device_id
    FROM entities
"#;

fn entity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncableEntity> {
    let entity_type: String = row.get(0)?;
    let payload: String = row.get(2)?;
    let local_updated_at: String = row.get(3)?;
    let remote_updated_at: Option<String> = row.get(4)?;
    let sync_state: String = row.get(5)?;

    Ok(SyncableEntity {
        entity_type: EntityType::from(entity_type),
        id: row.get(1)?,
        payload: serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        local_updated_at: parse_timestamp(&local_updated_at).ok_or(rusqlite::Error::InvalidQuery)?,
        remote_updated_at: remote_updated_at.as_deref().and_then(parse_timestamp),
        sync_state: SyncState::parse(&sync_state).ok_or(rusqlite::Error::InvalidQuery)?,
        origin_device_id: row.get(6)?,
    })
}
