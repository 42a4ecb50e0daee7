//! Conversation persistence
//!
//! Postgres-backed storage for conversations, including the atomic
//! direct-pair and group creation paths.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use super::{
    map_sqlx_err, with_deadline, ConversationRepository, NewConversation, RepoResult,
    RepositoryError,
};
use crate::models::{
    Conversation, ConversationKind, ConversationWithUnread, MemberRole, Page,
};

/// Canonical unordered-pair key for direct conversations.
pub(crate) fn direct_pair_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}", lo, hi)
}

pub(crate) fn conversation_from_row(row: &PgRow) -> RepoResult<Conversation> {
    let kind_raw: String = row.get("kind");
    let kind = ConversationKind::parse(&kind_raw).ok_or_else(|| {
        RepositoryError::IntegrityViolation(format!("unknown conversation kind '{}'", kind_raw))
    })?;

    Ok(Conversation {
        id: row.get("id"),
        kind,
        name: row.get("name"),
        description: row.get("description"),
        is_private: row.get("is_private"),
        max_members: row.get("max_members"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const SELECT_COLUMNS: &str =
    "id, kind, name, description, is_private, max_members, created_by, created_at, updated_at";

pub struct PgConversationRepository {
    pool: PgPool,
    deadline: Duration,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool, deadline: Duration) -> Self {
        Self { pool, deadline }
    }

    /// Durable unread subquery shared by the listing paths.
    const UNREAD_SUBQUERY: &'static str = r#"
        SELECT COUNT(*) FROM messages m
        WHERE m.conversation_id = c.id
          AND m.sender_id <> $1
          AND NOT EXISTS (
              SELECT 1 FROM read_markers r
              WHERE r.message_id = m.id AND r.user_id = $1
          )
    "#;
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn create(&self, conv: NewConversation) -> RepoResult<Conversation> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO conversations (kind, name, description, is_private, max_members, created_by)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING {}
                "#,
                SELECT_COLUMNS
            ))
            .bind(conv.kind.as_str())
            .bind(&conv.name)
            .bind(&conv.description)
            .bind(conv.is_private)
            .bind(conv.max_members)
            .bind(conv.created_by)
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_err)?;

            conversation_from_row(&row)
        })
        .await
    }

    async fn create_group(
        &self,
        conv: NewConversation,
        participants: &[Uuid],
    ) -> RepoResult<Conversation> {
        let pool = self.pool.clone();
        let creator = conv.created_by;
        let participants = participants.to_vec();

        with_deadline(self.deadline, async move {
            let mut tx = pool.begin().await.map_err(map_sqlx_err)?;

            let row = sqlx::query(&format!(
                r#"
                INSERT INTO conversations (kind, name, description, is_private, max_members, created_by)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING {}
                "#,
                SELECT_COLUMNS
            ))
            .bind(conv.kind.as_str())
            .bind(&conv.name)
            .bind(&conv.description)
            .bind(conv.is_private)
            .bind(conv.max_members)
            .bind(creator)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

            let created = conversation_from_row(&row)?;

            sqlx::query(
                "INSERT INTO memberships (conversation_id, user_id, role) VALUES ($1, $2, $3)",
            )
            .bind(created.id)
            .bind(creator)
            .bind(MemberRole::Owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

            for participant in &participants {
                sqlx::query(
                    "INSERT INTO memberships (conversation_id, user_id, role) VALUES ($1, $2, $3)",
                )
                .bind(created.id)
                .bind(participant)
                .bind(MemberRole::Member.as_str())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
            }

            tx.commit().await.map_err(map_sqlx_err)?;

            debug!(
                conversation_id = %created.id,
                members = participants.len() + 1,
                "Group conversation created"
            );
            Ok(created)
        })
        .await
    }

    async fn get(&self, id: Uuid) -> RepoResult<Conversation> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let row = sqlx::query(&format!(
                "SELECT {} FROM conversations WHERE id = $1",
                SELECT_COLUMNS
            ))
            .bind(id)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(RepositoryError::NotFound)?;

            conversation_from_row(&row)
        })
        .await
    }

    async fn update_metadata(
        &self,
        id: Uuid,
        name: Option<String>,
        description: Option<String>,
    ) -> RepoResult<Conversation> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let row = sqlx::query(&format!(
                r#"
                UPDATE conversations
                SET name = COALESCE($2, name),
                    description = COALESCE($3, description),
                    updated_at = NOW()
                WHERE id = $1 AND kind = 'group'
                RETURNING {}
                "#,
                SELECT_COLUMNS
            ))
            .bind(id)
            .bind(name)
            .bind(description)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(RepositoryError::NotFound)?;

            conversation_from_row(&row)
        })
        .await
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let result = sqlx::query("DELETE FROM conversations WHERE id = $1")
                .bind(id)
                .execute(&pool)
                .await
                .map_err(map_sqlx_err)?;

            if result.rows_affected() == 0 {
                return Err(RepositoryError::NotFound);
            }
            Ok(())
        })
        .await
    }

    async fn list_by_participant(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> RepoResult<(Vec<Conversation>, i64)> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let total: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM memberships WHERE user_id = $1")
                    .bind(user_id)
                    .fetch_one(&pool)
                    .await
                    .map_err(map_sqlx_err)?;

            let rows = sqlx::query(&format!(
                r#"
                SELECT {} FROM conversations c
                JOIN memberships mb ON mb.conversation_id = c.id
                WHERE mb.user_id = $1
                ORDER BY c.updated_at DESC, c.id DESC
                LIMIT $2 OFFSET $3
                "#,
                SELECT_COLUMNS
                    .split(", ")
                    .map(|col| format!("c.{}", col))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
            .bind(user_id)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&pool)
            .await
            .map_err(map_sqlx_err)?;

            let conversations = rows
                .iter()
                .map(conversation_from_row)
                .collect::<RepoResult<Vec<_>>>()?;

            Ok((conversations, total))
        })
        .await
    }

    async fn get_direct_by_pair(&self, a: Uuid, b: Uuid) -> RepoResult<Conversation> {
        let pool = self.pool.clone();
        let key = direct_pair_key(a, b);
        with_deadline(self.deadline, async move {
            let row = sqlx::query(&format!(
                "SELECT {} FROM conversations WHERE direct_key = $1",
                SELECT_COLUMNS
            ))
            .bind(&key)
            .fetch_optional(&pool)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(RepositoryError::NotFound)?;

            conversation_from_row(&row)
        })
        .await
    }

    async fn create_direct(&self, a: Uuid, b: Uuid) -> RepoResult<Conversation> {
        let pool = self.pool.clone();
        let key = direct_pair_key(a, b);
        with_deadline(self.deadline, async move {
            let mut tx = pool.begin().await.map_err(map_sqlx_err)?;

            let row = sqlx::query(&format!(
                r#"
                INSERT INTO conversations (kind, is_private, max_members, created_by, direct_key)
                VALUES ('direct', TRUE, 2, $1, $2)
                RETURNING {}
                "#,
                SELECT_COLUMNS
            ))
            .bind(a)
            .bind(&key)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

            let created = conversation_from_row(&row)?;

            for user in [a, b] {
                sqlx::query(
                    "INSERT INTO memberships (conversation_id, user_id, role) VALUES ($1, $2, $3)",
                )
                .bind(created.id)
                .bind(user)
                .bind(MemberRole::Owner.as_str())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
            }

            tx.commit().await.map_err(map_sqlx_err)?;
            Ok(created)
        })
        .await
    }

    async fn list_with_unread(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> RepoResult<(Vec<ConversationWithUnread>, i64)> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let total: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM memberships WHERE user_id = $1")
                    .bind(user_id)
                    .fetch_one(&pool)
                    .await
                    .map_err(map_sqlx_err)?;

            let columns = SELECT_COLUMNS
                .split(", ")
                .map(|col| format!("c.{}", col))
                .collect::<Vec<_>>()
                .join(", ");

            let rows = sqlx::query(&format!(
                r#"
                SELECT {}, ({}) AS unread_count
                FROM conversations c
                JOIN memberships mb ON mb.conversation_id = c.id
                WHERE mb.user_id = $1
                ORDER BY c.updated_at DESC, c.id DESC
                LIMIT $2 OFFSET $3
                "#,
                columns,
                Self::UNREAD_SUBQUERY
            ))
            .bind(user_id)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&pool)
            .await
            .map_err(map_sqlx_err)?;

            let mut listed = Vec::with_capacity(rows.len());
            for row in &rows {
                listed.push(ConversationWithUnread {
                    conversation: conversation_from_row(row)?,
                    unread_count: row.get("unread_count"),
                });
            }

            Ok((listed, total))
        })
        .await
    }
}
