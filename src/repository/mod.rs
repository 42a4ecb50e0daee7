//! Repository layer
//!
//! Typed persistence for conversations, messages, memberships and read
//! markers. Every operation runs under a configured deadline and returns a
//! typed error distinguishing not-found, unique violation, integrity
//! violation and backend failure.

pub mod conversations;
pub mod memberships;
pub mod messages;

pub use conversations::PgConversationRepository;
pub use memberships::PgMembershipRepository;
pub use messages::PgMessageRepository;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::{
    Conversation, ConversationKind, ConversationWithUnread, MemberRole, Membership, Message,
    MessageKind, Page,
};

/// Typed repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("row not found")]
    NotFound,
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

pub type RepoResult<T> = Result<T, RepositoryError>;

/// Map a sqlx error onto the typed taxonomy.
pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => RepositoryError::UniqueViolation(db.message().to_string()),
            Some("23503") | Some("23514") => {
                RepositoryError::IntegrityViolation(db.message().to_string())
            }
            _ => RepositoryError::Backend(db.message().to_string()),
        },
        _ => RepositoryError::Backend(err.to_string()),
    }
}

/// Run a repository future under the configured deadline.
pub(crate) async fn with_deadline<T, F>(deadline: Duration, fut: F) -> RepoResult<T>
where
    F: Future<Output = RepoResult<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(RepositoryError::Backend(format!(
            "deadline of {:?} exceeded",
            deadline
        ))),
    }
}

/// Input record for conversation creation.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_private: bool,
    pub max_members: i32,
    pub created_by: Uuid,
}

/// Input record for message creation.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
    pub parent_id: Option<Uuid>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create(&self, conv: NewConversation) -> RepoResult<Conversation>;

    /// Create the conversation and all initial memberships in one
    /// transaction; the creator joins as owner, everyone else as member.
    async fn create_group(
        &self,
        conv: NewConversation,
        participants: &[Uuid],
    ) -> RepoResult<Conversation>;

    async fn get(&self, id: Uuid) -> RepoResult<Conversation>;

    async fn update_metadata(
        &self,
        id: Uuid,
        name: Option<String>,
        description: Option<String>,
    ) -> RepoResult<Conversation>;

    async fn delete(&self, id: Uuid) -> RepoResult<()>;

    async fn list_by_participant(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> RepoResult<(Vec<Conversation>, i64)>;

    /// Lookup of a direct conversation by its unordered member pair.
    async fn get_direct_by_pair(&self, a: Uuid, b: Uuid) -> RepoResult<Conversation>;

    /// Atomic insert of a direct conversation plus both memberships.
    async fn create_direct(&self, a: Uuid, b: Uuid) -> RepoResult<Conversation>;

    async fn list_with_unread(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> RepoResult<(Vec<ConversationWithUnread>, i64)>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, msg: NewMessage) -> RepoResult<Message>;

    async fn get(&self, id: Uuid) -> RepoResult<Message>;

    /// Newest-first page of a conversation's messages; `before` bounds
    /// `created_at` when present.
    async fn list_by_conversation(
        &self,
        conversation_id: Uuid,
        page: Page,
        before: Option<DateTime<Utc>>,
    ) -> RepoResult<(Vec<Message>, i64)>;

    /// Idempotent batch insert of read markers.
    async fn mark_read(&self, user_id: Uuid, message_ids: &[Uuid]) -> RepoResult<()>;

    /// Durable unread count: messages from others minus read markers.
    async fn unread_count(&self, user_id: Uuid, conversation_id: Uuid) -> RepoResult<i64>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MembershipRepository: Send + Sync {
    async fn add(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
    ) -> RepoResult<Membership>;

    async fn remove(&self, conversation_id: Uuid, user_id: Uuid) -> RepoResult<()>;

    async fn list_by_conversation(&self, conversation_id: Uuid) -> RepoResult<Vec<Membership>>;

    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> RepoResult<bool>;

    async fn member_count(&self, conversation_id: Uuid) -> RepoResult<i64>;

    async fn update_role(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
    ) -> RepoResult<Membership>;
}

/// Bundle of trait objects handed to the chat core.
#[derive(Clone)]
pub struct Repositories {
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub memberships: Arc<dyn MembershipRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool, op_timeout: Duration) -> Self {
        Self {
            conversations: Arc::new(PgConversationRepository::new(pool.clone(), op_timeout)),
            messages: Arc::new(PgMessageRepository::new(pool.clone(), op_timeout)),
            memberships: Arc::new(PgMembershipRepository::new(pool, op_timeout)),
        }
    }
}

/// Connect a pool with the configured size.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(config.op_timeout)
        .connect(&config.dsn)
        .await
}

/// Apply the schema files shipped under `migrations/`.
pub async fn initialize_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    info!("Initializing chat schema");

    let migrations = [
        include_str!("../../migrations/0001_conversations.sql"),
        include_str!("../../migrations/0002_memberships.sql"),
        include_str!("../../migrations/0003_messages.sql"),
        include_str!("../../migrations/0004_read_markers.sql"),
    ];

    for migration in migrations {
        for statement in migration.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(pool).await?;
        }
    }

    info!("Chat schema initialized");
    Ok(())
}
