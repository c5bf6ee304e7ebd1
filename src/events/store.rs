//! `EventStore`: append-only persisted log of sessions, events and
//! interactions.
//!
//! Uses a single `sqlx::SqlitePool` kept to one connection
//! (`max_connections(1)`) so writes serialize through a single handle
//! rather than racing across a pool.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::error::ProxyResult;
use crate::model::{Event, Interaction, InteractionDirection, PersistedSession};

pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    /// Open (creating if absent) the sqlite database at `path` and run the
    /// embedded schema migration.
    pub async fn open(path: &Path) -> ProxyResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub async fn open_in_memory() -> ProxyResult<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:").create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> ProxyResult<()> {
        sqlx::query("PRAGMA journal_mode=WAL").execute(&self.pool).await?;
        sqlx::query("PRAGMA synchronous=NORMAL").execute(&self.pool).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                start_time INTEGER NOT NULL,
                last_activity INTEGER NOT NULL,
                status TEXT NOT NULL,
                metadata TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT,
                event_type TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                payload TEXT NOT NULL,
                duration_millis INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_session_ts ON events (session_id, timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_type_ts ON events (event_type, timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_ts ON events (timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS interactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                message_type TEXT NOT NULL,
                request_id TEXT,
                method TEXT,
                content BLOB NOT NULL,
                content_size INTEGER NOT NULL,
                timestamp INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_interactions_session ON interactions (session_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_interactions_request ON interactions (request_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_session(&self, session: &PersistedSession) -> ProxyResult<()> {
        let metadata = serde_json::to_string(&session.metadata)?;
        sqlx::query(
            "INSERT INTO sessions (session_id, start_time, last_activity, status, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                last_activity = excluded.last_activity,
                status = excluded.status,
                metadata = excluded.metadata",
        )
        .bind(&session.session_id)
        .bind(session.start_time as i64)
        .bind(session.last_activity as i64)
        .bind(&session.status)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_event(&self, event: &Event) -> ProxyResult<()> {
        let payload = serde_json::to_string(&event.payload)?;
        sqlx::query(
            "INSERT INTO events (session_id, event_type, timestamp, payload, duration_millis)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&event.session_id)
        .bind(event.event_type.to_string())
        .bind(event.timestamp as i64)
        .bind(payload)
        .bind(event.duration_millis.map(|d| d as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_interaction(&self, interaction: &Interaction) -> ProxyResult<()> {
        let direction = match interaction.direction {
            InteractionDirection::Inbound => "inbound",
            InteractionDirection::Outbound => "outbound",
        };
        sqlx::query(
            "INSERT INTO interactions
                (session_id, direction, message_type, request_id, method, content, content_size, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&interaction.session_id)
        .bind(direction)
        .bind(&interaction.message_type)
        .bind(&interaction.request_id)
        .bind(&interaction.method)
        .bind(&interaction.content)
        .bind(interaction.content_size as i64)
        .bind(interaction.timestamp as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Events for one session, most recent first, capped at `limit`.
    pub async fn events_for_session(&self, session_id: &str, limit: i64) -> ProxyResult<Vec<Value>> {
        let rows = sqlx::query(
            "SELECT event_type, timestamp, payload, duration_millis FROM events
             WHERE session_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                serde_json::json!({
                    "event_type": row.get::<String, _>("event_type"),
                    "timestamp": row.get::<i64, _>("timestamp"),
                    "payload": serde_json::from_str::<Value>(&row.get::<String, _>("payload")).unwrap_or(Value::Null),
                    "duration_millis": row.get::<Option<i64>, _>("duration_millis"),
                })
            })
            .collect())
    }

    /// Delete events older than `retention`. Returns the number removed.
    pub async fn cleanup(&self, retention: Duration) -> ProxyResult<u64> {
        let cutoff = (crate::model::now_millis() as i64) - retention.as_millis() as i64;
        let result = sqlx::query("DELETE FROM events WHERE timestamp < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Background retention task, cleaning up events older than `retention`
/// (default 30 days) on each `tick`.
pub fn spawn_retention_task(store: std::sync::Arc<EventStore>, retention: Duration, tick: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            match store.cleanup(retention).await {
                Ok(removed) if removed > 0 => tracing::debug!(removed, "event retention cleanup"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "event retention cleanup failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{now_millis, EventType};
    use std::collections::HashMap;

    #[tokio::test]
    async fn record_and_query_event() {
        let store = EventStore::open_in_memory().await.unwrap();
        let event = Event {
            session_id: Some("s1".to_string()),
            event_type: EventType::ToolCall,
            timestamp: now_millis(),
            payload: serde_json::json!({"tool": "list_julia_sessions"}),
            duration_millis: Some(12),
        };
        store.record_event(&event).await.unwrap();
        let rows = store.events_for_session("s1", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["event_type"], "TOOL_CALL");
    }

    #[tokio::test]
    async fn upsert_session_updates_in_place() {
        let store = EventStore::open_in_memory().await.unwrap();
        let mut session = PersistedSession {
            session_id: "s1".to_string(),
            start_time: 1,
            last_activity: 1,
            status: "active".to_string(),
            metadata: HashMap::new(),
        };
        store.upsert_session(&session).await.unwrap();
        session.last_activity = 42;
        session.status = "idle".to_string();
        store.upsert_session(&session).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_events() {
        let store = EventStore::open_in_memory().await.unwrap();
        let old = Event { session_id: None, event_type: EventType::Heartbeat, timestamp: 0, payload: serde_json::json!({}), duration_millis: None };
        let fresh = Event { session_id: None, event_type: EventType::Heartbeat, timestamp: now_millis(), payload: serde_json::json!({}), duration_millis: None };
        store.record_event(&old).await.unwrap();
        store.record_event(&fresh).await.unwrap();
        let removed = store.cleanup(Duration::from_secs(60)).await.unwrap();
        assert_eq!(removed, 1);
    }
}
