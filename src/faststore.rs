//! Fast-store client
//!
//! Thin wrapper over Redis providing the TTL'd key-value operations, set
//! membership, pub/sub and health probing used by the unread counters,
//! presence tracking and the fan-out bus. Regular operations share one
//! multiplexed connection; subscriptions get a dedicated connection because
//! subscription mode is stateful.
//!
//! The key-value surface is a trait so the chat core and presence layers
//! can be exercised against an in-memory double.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;
use uuid::Uuid;

/// Key and channel naming shared across the engine.
pub mod keys {
    use uuid::Uuid;

    pub const ONLINE_SET: &str = "online";

    pub fn unread(user_id: Uuid, conversation_id: Uuid) -> String {
        format!("unread:{}:{}", user_id, conversation_id)
    }

    pub fn presence(user_id: Uuid) -> String {
        format!("presence:{}", user_id)
    }

    pub fn typing(conversation_id: Uuid, user_id: Uuid) -> String {
        format!("typing:{}:{}", conversation_id, user_id)
    }
}

pub mod channels {
    use uuid::Uuid;

    pub fn conversation(conversation_id: Uuid) -> String {
        format!("conv:{}", conversation_id)
    }

    /// Reserved for user-scoped notifications.
    pub fn user(user_id: Uuid) -> String {
        format!("user:{}", user_id)
    }
}

/// TTL policy for the ephemeral keys.
pub mod ttl {
    use std::time::Duration;

    pub const UNREAD: Duration = Duration::from_secs(30 * 24 * 60 * 60);
    pub const PRESENCE: Duration = Duration::from_secs(5 * 60);
    pub const TYPING: Duration = Duration::from_secs(10);
}

#[derive(Debug, thiserror::Error)]
pub enum FastStoreError {
    #[error("fast store transport error: {0}")]
    Transport(#[from] redis::RedisError),
    #[error("fast store operation timed out")]
    Timeout,
    #[error("fast store payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type FastStoreResult<T> = Result<T, FastStoreError>;

/// TTL'd key-value and set capability required by the engine.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_i64(&self, key: &str) -> FastStoreResult<Option<i64>>;

    async fn set_i64_ex(&self, key: &str, value: i64, ttl: Duration) -> FastStoreResult<()>;

    /// Increment and refresh the TTL in the same round of operations.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> FastStoreResult<i64>;

    async fn delete(&self, key: &str) -> FastStoreResult<()>;

    /// Reset a key's TTL; false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> FastStoreResult<bool>;

    async fn exists(&self, key: &str) -> FastStoreResult<bool>;

    /// Remaining TTL in seconds; negative when the key is absent or has no
    /// expiry.
    async fn ttl_secs(&self, key: &str) -> FastStoreResult<i64>;

    async fn get_raw(&self, key: &str) -> FastStoreResult<Option<String>>;

    async fn set_raw_ex(&self, key: &str, value: String, ttl: Duration) -> FastStoreResult<()>;

    async fn set_add(&self, set: &str, member: Uuid) -> FastStoreResult<()>;

    async fn set_remove(&self, set: &str, member: Uuid) -> FastStoreResult<()>;

    /// Health probe.
    async fn ping(&self) -> FastStoreResult<()>;
}

/// Shared Redis handle. Cloning is cheap; all clones share the same
/// multiplexed connection.
#[derive(Clone)]
pub struct FastStore {
    client: redis::Client,
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl FastStore {
    pub async fn connect(endpoint: &str, op_timeout: Duration) -> FastStoreResult<Self> {
        let client = redis::Client::open(endpoint)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!(endpoint = endpoint, "Fast store connected");
        Ok(Self { client, conn, op_timeout })
    }

    async fn timed<T, F>(&self, fut: F) -> FastStoreResult<T>
    where
        F: std::future::Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(FastStoreError::Transport),
            Err(_) => Err(FastStoreError::Timeout),
        }
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> FastStoreResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.publish::<_, _, ()>(channel, payload).await })
            .await
    }

    /// Dedicated pub/sub connection for a subscriber task.
    pub async fn subscriber(&self) -> FastStoreResult<redis::aio::PubSub> {
        let conn = self.client.get_async_connection().await?;
        Ok(conn.into_pubsub())
    }
}

#[async_trait]
impl KeyValueStore for FastStore {
    async fn get_i64(&self, key: &str) -> FastStoreResult<Option<i64>> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.get::<_, Option<i64>>(key).await }).await
    }

    async fn set_i64_ex(&self, key: &str, value: i64, ttl: Duration) -> FastStoreResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move {
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs() as usize).await
        })
        .await
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> FastStoreResult<i64> {
        let mut conn = self.conn.clone();
        self.timed(async move {
            let value: i64 = conn.incr(key, 1i64).await?;
            conn.expire::<_, bool>(key, ttl.as_secs() as usize).await?;
            Ok(value)
        })
        .await
    }

    async fn delete(&self, key: &str) -> FastStoreResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.del::<_, ()>(key).await }).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> FastStoreResult<bool> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.expire::<_, bool>(key, ttl.as_secs() as usize).await })
            .await
    }

    async fn exists(&self, key: &str) -> FastStoreResult<bool> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.exists::<_, bool>(key).await }).await
    }

    async fn ttl_secs(&self, key: &str) -> FastStoreResult<i64> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.ttl::<_, i64>(key).await }).await
    }

    async fn get_raw(&self, key: &str) -> FastStoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.get::<_, Option<String>>(key).await }).await
    }

    async fn set_raw_ex(&self, key: &str, value: String, ttl: Duration) -> FastStoreResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move {
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs() as usize).await
        })
        .await
    }

    async fn set_add(&self, set: &str, member: Uuid) -> FastStoreResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.sadd::<_, _, ()>(set, member.to_string()).await })
            .await
    }

    async fn set_remove(&self, set: &str, member: Uuid) -> FastStoreResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.srem::<_, _, ()>(set, member.to_string()).await })
            .await
    }

    async fn ping(&self) -> FastStoreResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move {
            redis::cmd("PING").query_async::<_, String>(&mut conn).await.map(|_| ())
        })
        .await
    }
}
