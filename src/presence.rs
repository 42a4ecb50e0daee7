//! Presence and typing indicators
//!
//! Ephemeral user state in the fast store with auto-expiry. Presence lives
//! five minutes past the last heartbeat and mirrors membership in the
//! `online` set; typing indicators expire after ten seconds and repeated
//! triggers within the window only refresh the key.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::EventSink;
use crate::events::Event;
use crate::faststore::{keys, ttl, FastStoreResult, KeyValueStore};
use crate::models::{Presence, PresenceStatus};

pub struct PresenceService {
    store: Arc<dyn KeyValueStore>,
    events: Arc<dyn EventSink>,
}

impl PresenceService {
    pub fn new(store: Arc<dyn KeyValueStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Write the presence record and maintain the online set. A status
    /// change observed by a conversation is announced on its channel.
    pub async fn set_presence(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        current_conversation: Option<Uuid>,
    ) -> FastStoreResult<()> {
        let previous = self.get_presence(user_id).await?.status;

        let record = Presence {
            user_id,
            status,
            last_seen: Some(Utc::now()),
            current_conversation,
        };
        let payload = serde_json::to_string(&record)?;
        self.store
            .set_raw_ex(&keys::presence(user_id), payload, ttl::PRESENCE)
            .await?;

        if status == PresenceStatus::Offline {
            self.store.set_remove(keys::ONLINE_SET, user_id).await?;
        } else {
            self.store.set_add(keys::ONLINE_SET, user_id).await?;
        }

        if previous != status {
            if let Some(conversation_id) = current_conversation {
                self.events
                    .publish(&Event::PresenceChanged {
                        conversation_id,
                        user_id,
                        timestamp: Utc::now(),
                        status,
                    })
                    .await;
            }
            debug!(user_id = %user_id, status = status.as_str(), "Presence changed");
        }

        Ok(())
    }

    /// Read presence; an absent record means offline with an unknown
    /// last-seen.
    pub async fn get_presence(&self, user_id: Uuid) -> FastStoreResult<Presence> {
        match self.store.get_raw(&keys::presence(user_id)).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(record) => Ok(record),
                Err(err) => {
                    warn!(user_id = %user_id, error = %err, "Corrupt presence record, treating as offline");
                    Ok(Presence::offline(user_id))
                }
            },
            None => Ok(Presence::offline(user_id)),
        }
    }

    /// Refresh the heartbeat-driven presence TTL without announcing a
    /// status change.
    pub async fn touch(&self, user_id: Uuid, conversation_id: Uuid) -> FastStoreResult<()> {
        self.set_presence(user_id, PresenceStatus::Online, Some(conversation_id))
            .await
    }

    /// Set or clear the typing indicator. Repeated `on` inside the TTL
    /// window refreshes the key without another publish.
    pub async fn set_typing(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        typing: bool,
    ) -> FastStoreResult<()> {
        let key = keys::typing(conversation_id, user_id);

        if typing {
            let already_typing = self.store.exists(&key).await?;
            self.store.set_i64_ex(&key, 1, ttl::TYPING).await?;

            if !already_typing {
                self.events
                    .publish(&Event::Typing {
                        conversation_id,
                        user_id,
                        timestamp: Utc::now(),
                    })
                    .await;
            }
        } else {
            self.store.delete(&key).await?;
            self.events
                .publish(&Event::StopTyping {
                    conversation_id,
                    user_id,
                    timestamp: Utc::now(),
                })
                .await;
        }

        Ok(())
    }

    /// Best-effort typing cleanup on disconnect or after a sent message;
    /// failures are logged by the caller's layer, never surfaced to users.
    pub async fn clear_typing(&self, conversation_id: Uuid, user_id: Uuid) {
        if let Err(err) = self.set_typing(conversation_id, user_id, false).await {
            warn!(
                conversation_id = %conversation_id,
                user_id = %user_id,
                error = %err,
                "Failed to clear typing indicator"
            );
        }
    }
}
