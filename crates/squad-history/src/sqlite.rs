//! SQLite-based persistent history driver.
//!
//! Provides a portable, ACID journal via sqlx. The full entry is stored as
//! a JSON blob next to the indexed routing columns, so queries stay on
//! indexes while the record round-trips losslessly.

use std::path::Path;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Row, SqlitePool};
use uuid::Uuid;

use crate::{HistoryEntry, HistoryError, HistoryQuery, HistoryStore};

/// A persistent history store backed by SQLite.
#[derive(Debug)]
pub struct SqliteHistory {
    pool: SqlitePool,
}

impl SqliteHistory {
    /// Open or create a database at the given path and run migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, HistoryError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| HistoryError::Storage(e.to_string()))?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory database, useful for tests.
    pub async fn in_memory() -> Result<Self, HistoryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| HistoryError::Storage(e.to_string()))?;
        Self::from_pool(pool).await
    }

    /// Build a store from an existing pool and run migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, HistoryError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), HistoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history_entries (
                id BLOB PRIMARY KEY,
                execution_id BLOB NOT NULL,
                sender_id BLOB,
                recipient_id BLOB,
                conversation_id BLOB,
                created_at_ms INTEGER NOT NULL,
                entry_data BLOB NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| HistoryError::Storage(e.to_string()))?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_history_execution ON history_entries(execution_id, created_at_ms, id)",
            "CREATE INDEX IF NOT EXISTS idx_history_conversation ON history_entries(conversation_id)",
            "CREATE INDEX IF NOT EXISTS idx_history_sender ON history_entries(sender_id)",
            "CREATE INDEX IF NOT EXISTS idx_history_recipient ON history_entries(recipient_id)",
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| HistoryError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    /// Number of journalled entries.
    pub async fn len(&self) -> Result<i64, HistoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM history_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| HistoryError::Storage(e.to_string()))?;
        Ok(row.get("count"))
    }
}

fn id_bytes(id: Uuid) -> Vec<u8> {
    id.as_bytes().to_vec()
}

#[async_trait::async_trait]
impl HistoryStore for SqliteHistory {
    async fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        let data =
            serde_json::to_vec(&entry).map_err(|e| HistoryError::Storage(e.to_string()))?;
        let (sender, recipient, conversation) = match entry.as_message() {
            Some(msg) => (
                Some(id_bytes(msg.sender_id.0)),
                msg.recipient_id.map(|r| id_bytes(r.0)),
                msg.conversation_id.map(|c| id_bytes(c.0)),
            ),
            None => (None, None, None),
        };

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO history_entries
                (id, execution_id, sender_id, recipient_id, conversation_id, created_at_ms, entry_data)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id_bytes(entry.id.0))
        .bind(id_bytes(entry.execution_id.0))
        .bind(sender)
        .bind(recipient)
        .bind(conversation)
        .bind(entry.created_at.timestamp_millis())
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(|e| HistoryError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn query(&self, query: HistoryQuery) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT entry_data FROM history_entries WHERE 1=1");

        if let Some(execution_id) = query.execution_id {
            builder.push(" AND execution_id = ");
            builder.push_bind(id_bytes(execution_id.0));
        }
        if let Some(agent_id) = query.agent_id {
            builder.push(" AND (sender_id = ");
            builder.push_bind(id_bytes(agent_id.0));
            builder.push(" OR recipient_id = ");
            builder.push_bind(id_bytes(agent_id.0));
            builder.push(")");
        }
        if let Some(conversation_id) = query.conversation_id {
            builder.push(" AND conversation_id = ");
            builder.push_bind(id_bytes(conversation_id.0));
        }
        if let Some((since_at, since_id)) = query.since {
            builder.push(" AND (created_at_ms > ");
            builder.push_bind(since_at.timestamp_millis());
            builder.push(" OR (created_at_ms = ");
            builder.push_bind(since_at.timestamp_millis());
            builder.push(" AND id > ");
            builder.push_bind(id_bytes(since_id.0));
            builder.push("))");
        }

        builder.push(" ORDER BY created_at_ms, id");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| HistoryError::Storage(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let data: Vec<u8> = row.get("entry_data");
                serde_json::from_slice(&data).map_err(|e| HistoryError::Corrupt(e.to_string()))
            })
            .collect()
    }

    async fn prune(
        &self,
        execution_id: squad_types::ExecutionId,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<usize, HistoryError> {
        let result = sqlx::query(
            "DELETE FROM history_entries WHERE execution_id = ? AND created_at_ms < ?",
        )
        .bind(id_bytes(execution_id.0))
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| HistoryError::Storage(e.to_string()))?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MonotonicClock;
    use squad_types::{AgentId, AgentMessage, ExecutionId, MessageType};

    #[tokio::test]
    async fn sqlite_round_trip_preserves_order_and_content() {
        let store = SqliteHistory::in_memory().await.unwrap();
        let clock = MonotonicClock::new();
        let exec = ExecutionId::new();

        let mut entries = Vec::new();
        for i in 0..5 {
            let msg = AgentMessage::direct(
                exec,
                AgentId::new(),
                AgentId::new(),
                MessageType::StatusUpdate,
                format!("update {i}"),
            );
            let entry = HistoryEntry::message(msg, clock.now().await);
            store.append(entry.clone()).await.unwrap();
            entries.push(entry);
        }

        let result = store.query(HistoryQuery::execution(exec)).await.unwrap();
        assert_eq!(result, entries);
    }

    #[tokio::test]
    async fn sqlite_append_is_idempotent() {
        let store = SqliteHistory::in_memory().await.unwrap();
        let clock = MonotonicClock::new();
        let exec = ExecutionId::new();

        let msg = AgentMessage::direct(
            exec,
            AgentId::new(),
            AgentId::new(),
            MessageType::Question,
            "which region?",
        );
        let entry = HistoryEntry::message(msg, clock.now().await);
        store.append(entry.clone()).await.unwrap();
        store.append(entry).await.unwrap();

        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let clock = MonotonicClock::new();
        let exec = ExecutionId::new();

        let entry = HistoryEntry::message(
            AgentMessage::direct(
                exec,
                AgentId::new(),
                AgentId::new(),
                MessageType::StatusUpdate,
                "persisted across restarts",
            ),
            clock.now().await,
        );
        {
            let store = SqliteHistory::open(&path).await.unwrap();
            store.append(entry.clone()).await.unwrap();
        }

        let reopened = SqliteHistory::open(&path).await.unwrap();
        let result = reopened.query(HistoryQuery::execution(exec)).await.unwrap();
        assert_eq!(result, vec![entry]);
    }

    #[tokio::test]
    async fn sqlite_since_cursor_and_agent_filter() {
        let store = SqliteHistory::in_memory().await.unwrap();
        let clock = MonotonicClock::new();
        let exec = ExecutionId::new();
        let watched = AgentId::new();

        let mut watched_entries = Vec::new();
        for i in 0..6 {
            let recipient = if i % 2 == 0 { watched } else { AgentId::new() };
            let msg = AgentMessage::direct(
                exec,
                AgentId::new(),
                recipient,
                MessageType::StatusUpdate,
                format!("update {i}"),
            );
            let entry = HistoryEntry::message(msg, clock.now().await);
            store.append(entry.clone()).await.unwrap();
            if recipient == watched {
                watched_entries.push(entry);
            }
        }

        let result = store.query(HistoryQuery::agent(watched)).await.unwrap();
        assert_eq!(result, watched_entries);

        let cursor = watched_entries[0].sort_key();
        let result = store
            .query(HistoryQuery::agent(watched).since(cursor))
            .await
            .unwrap();
        assert_eq!(result, watched_entries[1..].to_vec());
    }
}
