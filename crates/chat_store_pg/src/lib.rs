//! A [`chat_core::Store`] implementation over PostgreSQL, using `sqlx` and the `pgvector`
//! extension for cosine-distance memory retrieval.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use time::OffsetDateTime;

use chat_core::store::{ExtractionTxStats, MemoryAction, NearbyMemory, Store, StoreError};
use chat_core::{HealthCheck, Memory, Message, MessageRole, Session};

/// The `message_role` Postgres enum, kept local to this crate so `chat_core` stays free of
/// a `sqlx` dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "message_role", rename_all = "lowercase")]
enum DbMessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl From<MessageRole> for DbMessageRole {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::System => DbMessageRole::System,
            MessageRole::User => DbMessageRole::User,
            MessageRole::Assistant => DbMessageRole::Assistant,
            MessageRole::Tool => DbMessageRole::Tool,
        }
    }
}

impl From<DbMessageRole> for MessageRole {
    fn from(role: DbMessageRole) -> Self {
        match role {
            DbMessageRole::System => MessageRole::System,
            DbMessageRole::User => MessageRole::User,
            DbMessageRole::Assistant => MessageRole::Assistant,
            DbMessageRole::Tool => MessageRole::Tool,
        }
    }
}

#[derive(FromRow)]
struct SessionRow {
    id: i64,
    user_id: String,
    title: Option<String>,
    metadata: serde_json::Value,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    session_id: i64,
    role: DbMessageRole,
    content: String,
    metadata: serde_json::Value,
    extracted_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            session_id: row.session_id,
            role: row.role.into(),
            content: row.content,
            metadata: row.metadata,
            extracted_at: row.extracted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct MemoryRow {
    id: i64,
    user_id: String,
    content: String,
    embedding: Option<Vector>,
    metadata: serde_json::Value,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<MemoryRow> for Memory {
    fn from(row: MemoryRow) -> Self {
        Memory {
            id: row.id,
            user_id: row.user_id,
            content: row.content,
            embedding: row.embedding.map(|v| v.to_vec()).unwrap_or_default(),
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct NearbyMemoryRow {
    #[sqlx(flatten)]
    memory: MemoryRow,
    distance: f32,
}

/// A [`Store`] backed by a PostgreSQL connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects to `database_url`, running pending migrations first.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(PgStore { pool })
    }

    /// Wraps an already-connected pool without running migrations (used by embedders that
    /// manage migrations separately).
    pub fn from_pool(pool: PgPool) -> Self {
        PgStore { pool }
    }

    async fn transaction(&self) -> Result<Transaction<'_, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    /// A cheap liveness probe for `/db/health`: true iff the pool can round-trip a query.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[async_trait]
impl HealthCheck for PgStore {
    async fn is_healthy(&self) -> bool {
        PgStore::is_healthy(self).await
    }
}

fn map_sqlx_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StoreError::Constraint(db_err.message().to_string())
        }
        sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
            StoreError::Constraint(db_err.message().to_string())
        }
        _ => StoreError::Connection(e.to_string()),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_session(&self, user_id: &str) -> Result<Session, StoreError> {
        let row: SessionRow = sqlx::query_as(
            "insert into sessions (user_id) values ($1)
             returning id, user_id, title, metadata, created_at, updated_at",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(row.into())
    }

    async fn find_session(
        &self,
        session_id: i64,
        user_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(
            "select id, user_id, title, metadata, created_at, updated_at
             from sessions where id = $1 and user_id = $2",
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(row.map(Into::into))
    }

    async fn append_message(
        &self,
        session_id: i64,
        role: MessageRole,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<Message, StoreError> {
        let row: MessageRow = sqlx::query_as(
            "insert into messages (session_id, role, content, metadata)
             values ($1, $2, $3, $4)
             returning id, session_id, role, content, metadata, extracted_at, created_at, updated_at",
        )
        .bind(session_id)
        .bind(DbMessageRole::from(role))
        .bind(content)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(row.into())
    }

    async fn list_messages_by_session(
        &self,
        session_id: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "select id, session_id, role, content, metadata, extracted_at, created_at, updated_at
             from messages where session_id = $1
             order by created_at desc, id desc
             limit $2",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_messages_across_user_sessions(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "select m.id, m.session_id, m.role, m.content, m.metadata, m.extracted_at,
                    m.created_at, m.updated_at
             from messages m
             join sessions s on s.id = m.session_id
             where s.user_id = $1
             order by m.created_at desc, m.id desc
             limit $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_pending_messages(&self, user_id: &str) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "select m.id, m.session_id, m.role, m.content, m.metadata, m.extracted_at,
                    m.created_at, m.updated_at
             from messages m
             join sessions s on s.id = m.session_id
             where s.user_id = $1 and m.extracted_at is null
             order by m.created_at asc, m.id asc",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_messages_extracted(
        &self,
        ids: &[i64],
        timestamp: OffsetDateTime,
    ) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            "update messages set extracted_at = $1, updated_at = $1
             where id = any($2) and extracted_at is null",
        )
        .bind(timestamp)
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    async fn find_nearby_memories(
        &self,
        user_id: &str,
        embedding: &[f32],
        d_max: f32,
        top_k: i64,
    ) -> Result<Vec<NearbyMemory>, StoreError> {
        let vector = Vector::from(embedding.to_vec());

        let rows: Vec<NearbyMemoryRow> = sqlx::query_as(
            "select id, user_id, content, embedding, metadata, created_at, updated_at,
                    (embedding <=> $2)::real as distance
             from memories
             where user_id = $1 and embedding is not null and (embedding <=> $2) <= $3
             order by embedding <=> $2 asc
             limit $4",
        )
        .bind(user_id)
        .bind(&vector)
        .bind(d_max)
        .bind(top_k)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows
            .into_iter()
            .map(|row| NearbyMemory {
                memory: row.memory.into(),
                distance: row.distance,
            })
            .collect())
    }

    async fn list_recent_memories(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<Memory>, StoreError> {
        let rows: Vec<MemoryRow> = sqlx::query_as(
            "select id, user_id, content, embedding, metadata, created_at, updated_at
             from memories where user_id = $1
             order by updated_at desc, id desc
             limit $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn apply_memory_actions(
        &self,
        user_id: &str,
        actions: Vec<MemoryAction>,
    ) -> Result<ExtractionTxStats, StoreError> {
        let mut tx = self.transaction().await?;
        let mut stats = ExtractionTxStats::default();

        for action in actions {
            match action {
                MemoryAction::Add { content, embedding } => {
                    let vector = Vector::from(embedding);
                    sqlx::query(
                        "insert into memories (user_id, content, embedding) values ($1, $2, $3)",
                    )
                    .bind(user_id)
                    .bind(&content)
                    .bind(&vector)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_err)?;

                    stats.added += 1;
                }
                MemoryAction::Update {
                    id,
                    content,
                    embedding,
                } => {
                    let vector = Vector::from(embedding);
                    let result = sqlx::query(
                        "update memories set content = $1, embedding = $2, updated_at = now()
                         where id = $3 and user_id = $4",
                    )
                    .bind(&content)
                    .bind(&vector)
                    .bind(id)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_err)?;

                    if result.rows_affected() > 0 {
                        stats.updated += 1;
                    }
                }
                MemoryAction::Delete { id } => {
                    let result = sqlx::query("delete from memories where id = $1 and user_id = $2")
                        .bind(id)
                        .bind(user_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(map_sqlx_err)?;

                    if result.rows_affected() > 0 {
                        stats.deleted += 1;
                    }
                }
            }
        }

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> PgStore {
        let url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL must point at a scratch Postgres instance");
        PgStore::connect(&url).await.expect("connect")
    }

    #[tokio::test]
    #[ignore = "requires a live Postgres with the vector extension"]
    async fn session_ownership_is_enforced() {
        let store = store().await;
        let session = store.insert_session("user-a").await.unwrap();

        assert!(store
            .find_session(session.id, "user-b")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_session(session.id, "user-a")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    #[ignore = "requires a live Postgres with the vector extension"]
    async fn pending_messages_exclude_extracted() {
        let store = store().await;
        let session = store.insert_session("user-pending").await.unwrap();
        let msg = store
            .append_message(
                session.id,
                MessageRole::User,
                "hello",
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let pending = store.list_pending_messages("user-pending").await.unwrap();
        assert!(pending.iter().any(|m| m.id == msg.id));

        store
            .mark_messages_extracted(&[msg.id], OffsetDateTime::now_utc())
            .await
            .unwrap();

        let pending = store.list_pending_messages("user-pending").await.unwrap();
        assert!(!pending.iter().any(|m| m.id == msg.id));
    }
}
