//! Message persistence
//!
//! Postgres-backed message storage with newest-first paging, idempotent
//! read markers and the durable unread count.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use super::{map_sqlx_err, with_deadline, MessageRepository, NewMessage, RepoResult, RepositoryError};
use crate::models::{Message, MessageKind, Page};

pub(crate) fn message_from_row(row: &PgRow) -> RepoResult<Message> {
    let kind_raw: String = row.get("kind");
    let kind = MessageKind::parse(&kind_raw).ok_or_else(|| {
        RepositoryError::IntegrityViolation(format!("unknown message kind '{}'", kind_raw))
    })?;

    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        content: row.get("content"),
        kind,
        parent_id: row.get("parent_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const SELECT_COLUMNS: &str =
    "id, conversation_id, sender_id, content, kind, parent_id, created_at, updated_at";

pub struct PgMessageRepository {
    pool: PgPool,
    deadline: Duration,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool, deadline: Duration) -> Self {
        Self { pool, deadline }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create(&self, msg: NewMessage) -> RepoResult<Message> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO messages (conversation_id, sender_id, content, kind, parent_id)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {}
                "#,
                SELECT_COLUMNS
            ))
            .bind(msg.conversation_id)
            .bind(msg.sender_id)
            .bind(&msg.content)
            .bind(msg.kind.as_str())
            .bind(msg.parent_id)
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_err)?;

            message_from_row(&row)
        })
        .await
    }

    async fn get(&self, id: Uuid) -> RepoResult<Message> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let row = sqlx::query(&format!(
                "SELECT {} FROM messages WHERE id = $1",
                SELECT_COLUMNS
            ))
            .bind(id)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(RepositoryError::NotFound)?;

            message_from_row(&row)
        })
        .await
    }

    async fn list_by_conversation(
        &self,
        conversation_id: Uuid,
        page: Page,
        before: Option<DateTime<Utc>>,
    ) -> RepoResult<(Vec<Message>, i64)> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let total: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = $1",
            )
            .bind(conversation_id)
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_err)?;

            // created_at descending with the id as a deterministic tiebreak
            let rows = match before {
                Some(bound) => {
                    sqlx::query(&format!(
                        r#"
                        SELECT {} FROM messages
                        WHERE conversation_id = $1 AND created_at < $2
                        ORDER BY created_at DESC, id DESC
                        LIMIT $3 OFFSET $4
                        "#,
                        SELECT_COLUMNS
                    ))
                    .bind(conversation_id)
                    .bind(bound)
                    .bind(page.limit())
                    .bind(page.offset())
                    .fetch_all(&pool)
                    .await
                }
                None => {
                    sqlx::query(&format!(
                        r#"
                        SELECT {} FROM messages
                        WHERE conversation_id = $1
                        ORDER BY created_at DESC, id DESC
                        LIMIT $2 OFFSET $3
                        "#,
                        SELECT_COLUMNS
                    ))
                    .bind(conversation_id)
                    .bind(page.limit())
                    .bind(page.offset())
                    .fetch_all(&pool)
                    .await
                }
            }
            .map_err(map_sqlx_err)?;

            let messages = rows
                .iter()
                .map(message_from_row)
                .collect::<RepoResult<Vec<_>>>()?;

            Ok((messages, total))
        })
        .await
    }

    async fn mark_read(&self, user_id: Uuid, message_ids: &[Uuid]) -> RepoResult<()> {
        let pool = self.pool.clone();
        let ids = message_ids.to_vec();
        with_deadline(self.deadline, async move {
            let mut tx = pool.begin().await.map_err(map_sqlx_err)?;

            for message_id in &ids {
                sqlx::query(
                    r#"
                    INSERT INTO read_markers (user_id, message_id)
                    VALUES ($1, $2)
                    ON CONFLICT (user_id, message_id) DO NOTHING
                    "#,
                )
                .bind(user_id)
                .bind(message_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
            }

            tx.commit().await.map_err(map_sqlx_err)?;

            debug!(user_id = %user_id, count = ids.len(), "Read markers recorded");
            Ok(())
        })
        .await
    }

    async fn unread_count(&self, user_id: Uuid, conversation_id: Uuid) -> RepoResult<i64> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let count: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM messages m
                WHERE m.conversation_id = $1
                  AND m.sender_id <> $2
                  AND NOT EXISTS (
                      SELECT 1 FROM read_markers r
                      WHERE r.message_id = m.id AND r.user_id = $2
                  )
                "#,
            )
            .bind(conversation_id)
            .bind(user_id)
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Ok(count)
        })
        .await
    }
}
