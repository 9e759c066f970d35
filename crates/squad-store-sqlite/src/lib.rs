#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **squad-store-sqlite** – SQLite-backed persistent state.
//!
//! One database holds the relational state the core persists outside the
//! message journal: squads and their members, tasks, task executions,
//! conversations with their append-only event log, and opaque session
//! blobs. Each row is stored as a JSON (or MessagePack, for sessions) blob
//! next to the indexed routing columns, so lookups stay on indexes while
//! records round-trip losslessly.
//!
//! The store implements the storage traits of the owning crates:
//! [`ExecutionStore`] for the workflow engine, [`ConversationStore`] for
//! the conversation tracker, [`SessionStore`] for the agent runtime and
//! [`Roster`] for role routing.

use std::path::Path;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use squad_agent_runtime::{AgentRuntimeError, Session, SessionStore};
use squad_conversation::{ConversationError, ConversationStore};
use squad_types::{
    AgentId, AgentRole, Conversation, ConversationEvent, ConversationId, ExecutionId, Roster,
    SessionId, Squad, SquadId, SquadMember, Task, TaskExecution, TaskId,
};
use squad_workflow::{ExecutionStore, WorkflowError};

/// Errors produced by the relational store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database failed.
    #[error("sqlite store error: {0}")]
    Database(String),
    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl squad_types::Classify for StoreError {
    fn class(&self) -> squad_types::ErrorClass {
        match self {
            StoreError::Database(_) => squad_types::ErrorClass::Transient,
            StoreError::Corrupt(_) => squad_types::ErrorClass::Permanent,
        }
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn id_bytes(id: Uuid) -> Vec<u8> {
    id.as_bytes().to_vec()
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Database(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// SQLite-backed persistent state store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a database at the given path and run migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePool::connect(&url).await.map_err(db_err)?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory database, useful for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        Self::from_pool(pool).await
    }

    /// Build a store from an existing pool and run migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS squads (
                id BLOB PRIMARY KEY,
                org_id BLOB NOT NULL,
                row_data BLOB NOT NULL
            ) STRICT
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS squad_members (
                id BLOB PRIMARY KEY,
                squad_id BLOB NOT NULL,
                role TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                row_data BLOB NOT NULL
            ) STRICT
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id BLOB PRIMARY KEY,
                project_id BLOB NOT NULL,
                row_data BLOB NOT NULL
            ) STRICT
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS task_executions (
                id BLOB PRIMARY KEY,
                task_id BLOB NOT NULL,
                squad_id BLOB NOT NULL,
                row_data BLOB NOT NULL
            ) STRICT
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id BLOB PRIMARY KEY,
                execution_id BLOB NOT NULL,
                initial_message_id BLOB NOT NULL,
                version INTEGER NOT NULL,
                terminal INTEGER NOT NULL,
                row_data BLOB NOT NULL
            ) STRICT
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS conversation_events (
                id BLOB PRIMARY KEY,
                conversation_id BLOB NOT NULL,
                seq INTEGER NOT NULL,
                row_data BLOB NOT NULL
            ) STRICT
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id BLOB PRIMARY KEY,
                agent_id BLOB NOT NULL,
                blob_data BLOB NOT NULL
            ) STRICT
            "#,
            "CREATE INDEX IF NOT EXISTS idx_members_squad ON squad_members(squad_id, role)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_initial
                ON conversations(execution_id, initial_message_id)",
            "CREATE INDEX IF NOT EXISTS idx_events_conversation
                ON conversation_events(conversation_id, seq)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await.map_err(db_err)?;
        }
        debug!("sqlite state store migrated");
        Ok(())
    }

    //───────────────────── squads and members ─────────────────────

    /// Insert or replace a squad.
    pub async fn upsert_squad(&self, squad: &Squad) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO squads (id, org_id, row_data) VALUES (?, ?, ?)")
            .bind(id_bytes(squad.id.0))
            .bind(id_bytes(squad.org_id.0))
            .bind(encode(squad)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Load a squad by id.
    pub async fn squad(&self, id: SquadId) -> Result<Option<Squad>, StoreError> {
        let row = sqlx::query("SELECT row_data FROM squads WHERE id = ?")
            .bind(id_bytes(id.0))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| decode(&r.get::<Vec<u8>, _>("row_data"))).transpose()
    }

    /// Insert or replace a squad member.
    pub async fn upsert_member(&self, member: &SquadMember) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO squad_members (id, squad_id, role, created_at_ms, row_data)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id_bytes(member.id.0))
        .bind(id_bytes(member.squad_id.0))
        .bind(member.role.as_str())
        .bind(member.created_at.timestamp_millis())
        .bind(encode(member)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Load a member by id.
    pub async fn member_record(&self, id: AgentId) -> Result<Option<SquadMember>, StoreError> {
        let row = sqlx::query("SELECT row_data FROM squad_members WHERE id = ?")
            .bind(id_bytes(id.0))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| decode(&r.get::<Vec<u8>, _>("row_data"))).transpose()
    }

    /// All members of a squad, ordered by creation time.
    pub async fn members_of(&self, squad_id: SquadId) -> Result<Vec<SquadMember>, StoreError> {
        let rows = sqlx::query(
            "SELECT row_data FROM squad_members WHERE squad_id = ? ORDER BY created_at_ms, id",
        )
        .bind(id_bytes(squad_id.0))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| decode(&r.get::<Vec<u8>, _>("row_data")))
            .collect()
    }

    //───────────────────── tasks ─────────────────────

    /// Insert or replace a task.
    pub async fn upsert_task(&self, task: &Task) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO tasks (id, project_id, row_data) VALUES (?, ?, ?)")
            .bind(id_bytes(task.id.0))
            .bind(id_bytes(task.project_id.0))
            .bind(encode(task)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Load a task by id.
    pub async fn task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT row_data FROM tasks WHERE id = ?")
            .bind(id_bytes(id.0))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| decode(&r.get::<Vec<u8>, _>("row_data"))).transpose()
    }
}

//─────────────────────────────
//  Execution rows (workflow engine)
//─────────────────────────────

#[async_trait::async_trait]
impl ExecutionStore for SqliteStore {
    async fn insert(&self, execution: TaskExecution) -> Result<(), WorkflowError> {
        sqlx::query(
            "INSERT OR REPLACE INTO task_executions (id, task_id, squad_id, row_data)
             VALUES (?, ?, ?, ?)",
        )
        .bind(id_bytes(execution.id.0))
        .bind(id_bytes(execution.task_id.0))
        .bind(id_bytes(execution.squad_id.0))
        .bind(encode(&execution).map_err(|e| WorkflowError::Store(e.to_string()))?)
        .execute(&self.pool)
        .await
        .map_err(|e| WorkflowError::Store(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: ExecutionId) -> Result<Option<TaskExecution>, WorkflowError> {
        let row = sqlx::query("SELECT row_data FROM task_executions WHERE id = ?")
            .bind(id_bytes(id.0))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WorkflowError::Store(e.to_string()))?;
        row.map(|r| {
            decode(&r.get::<Vec<u8>, _>("row_data"))
                .map_err(|e| WorkflowError::Store(e.to_string()))
        })
        .transpose()
    }

    async fn update(&self, execution: TaskExecution) -> Result<(), WorkflowError> {
        let result = sqlx::query("UPDATE task_executions SET row_data = ? WHERE id = ?")
            .bind(encode(&execution).map_err(|e| WorkflowError::Store(e.to_string()))?)
            .bind(id_bytes(execution.id.0))
            .execute(&self.pool)
            .await
            .map_err(|e| WorkflowError::Store(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(WorkflowError::UnknownExecution(execution.id));
        }
        Ok(())
    }
}

//─────────────────────────────
//  Conversations (tracker)
//─────────────────────────────

fn conversation_err(e: sqlx::Error) -> ConversationError {
    ConversationError::Storage(e.to_string())
}

#[async_trait::async_trait]
impl ConversationStore for SqliteStore {
    async fn insert(
        &self,
        conversation: Conversation,
        event: ConversationEvent,
    ) -> Result<(), ConversationError> {
        let mut tx = self.pool.begin().await.map_err(conversation_err)?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO conversations
                 (id, execution_id, initial_message_id, version, terminal, row_data)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id_bytes(conversation.id.0))
        .bind(id_bytes(conversation.execution_id.0))
        .bind(id_bytes(conversation.initial_message_id.0))
        .bind(conversation.version as i64)
        .bind(conversation.state.is_terminal() as i64)
        .bind(encode(&conversation).map_err(|e| ConversationError::Storage(e.to_string()))?)
        .execute(&mut *tx)
        .await
        .map_err(conversation_err)?;
        if inserted.rows_affected() == 0 {
            return Err(ConversationError::DuplicateInitialMessage(
                conversation.initial_message_id,
            ));
        }
        append_event(&mut tx, &event, 0).await?;
        tx.commit().await.map_err(conversation_err)?;
        Ok(())
    }

    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>, ConversationError> {
        let row = sqlx::query("SELECT row_data FROM conversations WHERE id = ?")
            .bind(id_bytes(id.0))
            .fetch_optional(&self.pool)
            .await
            .map_err(conversation_err)?;
        row.map(|r| {
            decode(&r.get::<Vec<u8>, _>("row_data"))
                .map_err(|e| ConversationError::Storage(e.to_string()))
        })
        .transpose()
    }

    async fn find_by_initial_message(
        &self,
        execution_id: ExecutionId,
        message_id: squad_types::MessageId,
    ) -> Result<Option<Conversation>, ConversationError> {
        let row = sqlx::query(
            "SELECT row_data FROM conversations WHERE execution_id = ? AND initial_message_id = ?",
        )
        .bind(id_bytes(execution_id.0))
        .bind(id_bytes(message_id.0))
        .fetch_optional(&self.pool)
        .await
        .map_err(conversation_err)?;
        row.map(|r| {
            decode(&r.get::<Vec<u8>, _>("row_data"))
                .map_err(|e| ConversationError::Storage(e.to_string()))
        })
        .transpose()
    }

    async fn transition(
        &self,
        mut updated: Conversation,
        expected_version: u64,
        event: ConversationEvent,
    ) -> Result<(), ConversationError> {
        updated.version = expected_version + 1;
        let mut tx = self.pool.begin().await.map_err(conversation_err)?;
        append_event(&mut tx, &event, updated.version as i64).await?;
        let result = sqlx::query(
            "UPDATE conversations SET version = ?, terminal = ?, row_data = ?
             WHERE id = ? AND version = ?",
        )
        .bind(updated.version as i64)
        .bind(updated.state.is_terminal() as i64)
        .bind(encode(&updated).map_err(|e| ConversationError::Storage(e.to_string()))?)
        .bind(id_bytes(updated.id.0))
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await
        .map_err(conversation_err)?;

        if result.rows_affected() == 0 {
            // Distinguish a missing row from a stale version.
            let current = sqlx::query("SELECT version FROM conversations WHERE id = ?")
                .bind(id_bytes(updated.id.0))
                .fetch_optional(&mut *tx)
                .await
                .map_err(conversation_err)?;
            return match current {
                Some(row) => Err(ConversationError::VersionConflict {
                    conversation_id: updated.id,
                    expected: expected_version,
                    actual: row.get::<i64, _>("version") as u64,
                }),
                None => Err(ConversationError::UnknownConversation(updated.id)),
            };
        }
        tx.commit().await.map_err(conversation_err)?;
        Ok(())
    }

    async fn open_conversations(&self) -> Result<Vec<Conversation>, ConversationError> {
        let rows = sqlx::query("SELECT row_data FROM conversations WHERE terminal = 0")
            .fetch_all(&self.pool)
            .await
            .map_err(conversation_err)?;
        rows.iter()
            .map(|r| {
                decode(&r.get::<Vec<u8>, _>("row_data"))
                    .map_err(|e| ConversationError::Storage(e.to_string()))
            })
            .collect()
    }

    async fn events(
        &self,
        id: ConversationId,
    ) -> Result<Vec<ConversationEvent>, ConversationError> {
        let rows = sqlx::query(
            "SELECT row_data FROM conversation_events WHERE conversation_id = ? ORDER BY seq, id",
        )
        .bind(id_bytes(id.0))
        .fetch_all(&self.pool)
        .await
        .map_err(conversation_err)?;
        rows.iter()
            .map(|r| {
                decode(&r.get::<Vec<u8>, _>("row_data"))
                    .map_err(|e| ConversationError::Storage(e.to_string()))
            })
            .collect()
    }
}

async fn append_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    event: &ConversationEvent,
    seq: i64,
) -> Result<(), ConversationError> {
    sqlx::query(
        "INSERT OR IGNORE INTO conversation_events (id, conversation_id, seq, row_data)
         VALUES (?, ?, ?, ?)",
    )
    .bind(id_bytes(event.id.0))
    .bind(id_bytes(event.conversation_id.0))
    .bind(seq)
    .bind(encode(event).map_err(|e| ConversationError::Storage(e.to_string()))?)
    .execute(&mut **tx)
    .await
    .map_err(conversation_err)?;
    Ok(())
}

//─────────────────────────────
//  Sessions (agent runtime)
//─────────────────────────────

#[async_trait::async_trait]
impl SessionStore for SqliteStore {
    async fn load(&self, session_id: SessionId) -> Result<Option<Session>, AgentRuntimeError> {
        let row = sqlx::query("SELECT blob_data FROM sessions WHERE session_id = ?")
            .bind(id_bytes(session_id.0))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AgentRuntimeError::SessionStorage(e.to_string()))?;
        row.map(|r| Session::decode(&r.get::<Vec<u8>, _>("blob_data")))
            .transpose()
    }

    async fn save(&self, session: &Session) -> Result<(), AgentRuntimeError> {
        sqlx::query(
            "INSERT OR REPLACE INTO sessions (session_id, agent_id, blob_data) VALUES (?, ?, ?)",
        )
        .bind(id_bytes(session.session_id.0))
        .bind(id_bytes(session.agent_id.0))
        .bind(session.encode()?)
        .execute(&self.pool)
        .await
        .map_err(|e| AgentRuntimeError::SessionStorage(e.to_string()))?;
        Ok(())
    }
}

//─────────────────────────────
//  Roster (role routing)
//─────────────────────────────

#[async_trait::async_trait]
impl Roster for SqliteStore {
    async fn member(&self, agent_id: AgentId) -> Option<SquadMember> {
        self.member_record(agent_id).await.ok().flatten()
    }

    async fn first_with_role(&self, squad_id: SquadId, role: AgentRole) -> Option<SquadMember> {
        let row = sqlx::query(
            "SELECT row_data FROM squad_members WHERE squad_id = ? AND role = ?
             ORDER BY created_at_ms, id LIMIT 1",
        )
        .bind(id_bytes(squad_id.0))
        .bind(role.as_str())
        .fetch_optional(&self.pool)
        .await
        .ok()??;
        decode(&row.get::<Vec<u8>, _>("row_data")).ok()
    }
}
