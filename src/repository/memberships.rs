//! Membership persistence
//!
//! Postgres-backed (conversation, user) membership rows with role
//! management and the last-owner guard.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{map_sqlx_err, with_deadline, MembershipRepository, RepoResult, RepositoryError};
use crate::models::{MemberRole, Membership};

pub(crate) fn membership_from_row(row: &PgRow) -> RepoResult<Membership> {
    let role_raw: String = row.get("role");
    let role = MemberRole::parse(&role_raw).ok_or_else(|| {
        RepositoryError::IntegrityViolation(format!("unknown member role '{}'", role_raw))
    })?;

    Ok(Membership {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        user_id: row.get("user_id"),
        role,
        joined_at: row.get("joined_at"),
    })
}

const SELECT_COLUMNS: &str = "id, conversation_id, user_id, role, joined_at";

pub struct PgMembershipRepository {
    pool: PgPool,
    deadline: Duration,
}

impl PgMembershipRepository {
    pub fn new(pool: PgPool, deadline: Duration) -> Self {
        Self { pool, deadline }
    }
}

#[async_trait]
impl MembershipRepository for PgMembershipRepository {
    async fn add(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
    ) -> RepoResult<Membership> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO memberships (conversation_id, user_id, role)
                VALUES ($1, $2, $3)
                RETURNING {}
                "#,
                SELECT_COLUMNS
            ))
            .bind(conversation_id)
            .bind(user_id)
            .bind(role.as_str())
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_err)?;

            membership_from_row(&row)
        })
        .await
    }

    async fn remove(&self, conversation_id: Uuid, user_id: Uuid) -> RepoResult<()> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let result =
                sqlx::query("DELETE FROM memberships WHERE conversation_id = $1 AND user_id = $2")
                    .bind(conversation_id)
                    .bind(user_id)
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

    async fn list_by_conversation(&self, conversation_id: Uuid) -> RepoResult<Vec<Membership>> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let rows = sqlx::query(&format!(
                "SELECT {} FROM memberships WHERE conversation_id = $1 ORDER BY joined_at ASC",
                SELECT_COLUMNS
            ))
            .bind(conversation_id)
            .fetch_all(&pool)
            .await
            .map_err(map_sqlx_err)?;

            rows.iter().map(membership_from_row).collect()
        })
        .await
    }

    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> RepoResult<bool> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM memberships WHERE conversation_id = $1 AND user_id = $2)",
            )
            .bind(conversation_id)
            .bind(user_id)
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_err)?;

            Ok(exists)
        })
        .await
    }

    async fn member_count(&self, conversation_id: Uuid) -> RepoResult<i64> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM memberships WHERE conversation_id = $1")
                    .bind(conversation_id)
                    .fetch_one(&pool)
                    .await
                    .map_err(map_sqlx_err)?;

            Ok(count)
        })
        .await
    }

    async fn update_role(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
    ) -> RepoResult<Membership> {
        let pool = self.pool.clone();
        with_deadline(self.deadline, async move {
            let mut tx = pool.begin().await.map_err(map_sqlx_err)?;

            // Demoting the last owner would orphan the conversation.
            if role != MemberRole::Owner {
                let owners: i64 = sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM memberships
                    WHERE conversation_id = $1 AND role = 'owner' AND user_id <> $2
                    "#,
                )
                .bind(conversation_id)
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                let current_role: Option<String> = sqlx::query_scalar(
                    "SELECT role FROM memberships WHERE conversation_id = $1 AND user_id = $2",
                )
                .bind(conversation_id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                if current_role.as_deref() == Some("owner") && owners == 0 {
                    return Err(RepositoryError::IntegrityViolation(
                        "conversation must retain at least one owner".to_string(),
                    ));
                }
            }

            let row = sqlx::query(&format!(
                r#"
                UPDATE memberships SET role = $3
                WHERE conversation_id = $1 AND user_id = $2
                RETURNING {}
                "#,
                SELECT_COLUMNS
            ))
            .bind(conversation_id)
            .bind(user_id)
            .bind(role.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(RepositoryError::NotFound)?;

            let updated = membership_from_row(&row)?;
            tx.commit().await.map_err(map_sqlx_err)?;
            Ok(updated)
        })
        .await
    }
}
