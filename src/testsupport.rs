//! Test support doubles
//!
//! In-memory implementations of the fast-store and event-sink seams used by
//! unit and integration tests. Not wired into the production binary.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::bus::EventSink;
use crate::events::Event;
use crate::faststore::{FastStoreError, FastStoreResult, KeyValueStore};
use crate::models::{
    Conversation, ConversationKind, ConversationWithUnread, MemberRole, Membership, Message,
    Page,
};
use crate::repository::{
    ConversationRepository, MembershipRepository, MessageRepository, NewConversation, NewMessage,
    RepoResult, Repositories, RepositoryError,
};

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

/// HashMap-backed [`KeyValueStore`] honoring TTLs, with a switch that makes
/// every operation fail to exercise best-effort paths.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    sets: Mutex<HashMap<String, HashSet<Uuid>>>,
    failing: Mutex<bool>,
}

impl MemoryStore {
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    fn check(&self) -> FastStoreResult<()> {
        if *self.failing.lock().unwrap() {
            Err(FastStoreError::Timeout)
        } else {
            Ok(())
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(Entry::live)
            .unwrap_or(false)
    }

    pub fn set_contains(&self, set: &str, member: Uuid) -> bool {
        self.sets
            .lock()
            .unwrap()
            .get(set)
            .map(|members| members.contains(&member))
            .unwrap_or(false)
    }

    pub fn value_i64(&self, key: &str) -> Option<i64> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .filter(|entry| entry.live())
            .and_then(|entry| entry.value.parse().ok())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_i64(&self, key: &str) -> FastStoreResult<Option<i64>> {
        self.check()?;
        Ok(self.value_i64(key))
    }

    async fn set_i64_ex(&self, key: &str, value: i64, ttl: Duration) -> FastStoreResult<()> {
        self.check()?;
        self.entries.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> FastStoreResult<i64> {
        self.check()?;
        let mut entries = self.entries.lock().unwrap();
        let current = entries
            .get(key)
            .filter(|entry| entry.live())
            .and_then(|entry| entry.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(next)
    }

    async fn delete(&self, key: &str) -> FastStoreResult<()> {
        self.check()?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> FastStoreResult<bool> {
        self.check()?;
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key).filter(|entry| entry.live()) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> FastStoreResult<bool> {
        self.check()?;
        Ok(self.contains(key))
    }

    async fn ttl_secs(&self, key: &str) -> FastStoreResult<i64> {
        self.check()?;
        let entries = self.entries.lock().unwrap();
        Ok(match entries.get(key).filter(|entry| entry.live()) {
            Some(Entry { expires_at: Some(at), .. }) => {
                at.saturating_duration_since(Instant::now()).as_secs() as i64
            }
            Some(_) => -1,
            None => -2,
        })
    }

    async fn get_raw(&self, key: &str) -> FastStoreResult<Option<String>> {
        self.check()?;
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(key)
            .filter(|entry| entry.live())
            .map(|entry| entry.value.clone()))
    }

    async fn set_raw_ex(&self, key: &str, value: String, ttl: Duration) -> FastStoreResult<()> {
        self.check()?;
        self.entries.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_add(&self, set: &str, member: Uuid) -> FastStoreResult<()> {
        self.check()?;
        self.sets
            .lock()
            .unwrap()
            .entry(set.to_string())
            .or_default()
            .insert(member);
        Ok(())
    }

    async fn set_remove(&self, set: &str, member: Uuid) -> FastStoreResult<()> {
        self.check()?;
        if let Some(members) = self.sets.lock().unwrap().get_mut(set) {
            members.remove(&member);
        }
        Ok(())
    }

    async fn ping(&self) -> FastStoreResult<()> {
        self.check()
    }
}

/// [`EventSink`] and bus double that records everything published through
/// it, plus subscription reference changes as `(conversation, acquired)`.
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<Event>>,
    refs: Mutex<Vec<(Uuid, bool)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.published.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::kind).collect()
    }

    pub fn subscription_changes(&self) -> Vec<(Uuid, bool)> {
        self.refs.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &Event) {
        self.published.lock().unwrap().push(event.clone());
    }
}

#[async_trait]
impl crate::bus::BusHandle for RecordingSink {
    async fn publish(&self, event: &Event) {
        self.published.lock().unwrap().push(event.clone());
    }

    fn ensure(&self, conversation_id: Uuid) {
        self.refs.lock().unwrap().push((conversation_id, true));
    }

    fn release(&self, conversation_id: Uuid) {
        self.refs.lock().unwrap().push((conversation_id, false));
    }
}

#[derive(Default)]
struct MemDb {
    conversations: HashMap<Uuid, Conversation>,
    direct_keys: HashMap<String, Uuid>,
    memberships: Vec<Membership>,
    messages: Vec<Message>,
    read_markers: HashSet<(Uuid, Uuid)>,
}

impl MemDb {
    fn unread(&self, user_id: Uuid, conversation_id: Uuid) -> i64 {
        self.messages
            .iter()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.sender_id != user_id
                    && !self.read_markers.contains(&(user_id, m.id))
            })
            .count() as i64
    }

    fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> bool {
        self.memberships
            .iter()
            .any(|m| m.conversation_id == conversation_id && m.user_id == user_id)
    }

    fn add_membership(
        &mut self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
    ) -> RepoResult<Membership> {
        if self.is_member(conversation_id, user_id) {
            return Err(RepositoryError::UniqueViolation(
                "memberships_conversation_id_user_id_key".into(),
            ));
        }
        let membership = Membership {
            id: Uuid::new_v4(),
            conversation_id,
            user_id,
            role,
            joined_at: Utc::now(),
        };
        self.memberships.push(membership.clone());
        Ok(membership)
    }
}

fn direct_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}", lo, hi)
}

/// In-memory implementation of all three repository traits, preserving the
/// uniqueness and idempotency semantics of the relational schema.
#[derive(Default)]
pub struct MemoryRepos {
    db: Mutex<MemDb>,
}

impl MemoryRepos {
    /// A repository bundle backed by one shared in-memory database.
    pub fn bundle() -> (Repositories, Arc<MemoryRepos>) {
        let repos = Arc::new(MemoryRepos::default());
        (
            Repositories {
                conversations: repos.clone(),
                messages: repos.clone(),
                memberships: repos.clone(),
            },
            repos,
        )
    }

    /// Number of direct conversations stored for the unordered pair.
    pub fn direct_rows(&self, a: Uuid, b: Uuid) -> usize {
        let db = self.db.lock().unwrap();
        let key = direct_key(a, b);
        db.direct_keys.contains_key(&key) as usize
    }

    pub fn read_marker_count(&self, user_id: Uuid) -> usize {
        let db = self.db.lock().unwrap();
        db.read_markers.iter().filter(|(u, _)| *u == user_id).count()
    }

    pub fn message_count(&self, conversation_id: Uuid) -> usize {
        let db = self.db.lock().unwrap();
        db.messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .count()
    }
}

#[async_trait]
impl ConversationRepository for MemoryRepos {
    async fn create(&self, conv: NewConversation) -> RepoResult<Conversation> {
        let mut db = self.db.lock().unwrap();
        let now = Utc::now();
        let created = Conversation {
            id: Uuid::new_v4(),
            kind: conv.kind,
            name: conv.name,
            description: conv.description,
            is_private: conv.is_private,
            max_members: conv.max_members,
            created_by: conv.created_by,
            created_at: now,
            updated_at: now,
        };
        db.conversations.insert(created.id, created.clone());
        Ok(created)
    }

    async fn create_group(
        &self,
        conv: NewConversation,
        participants: &[Uuid],
    ) -> RepoResult<Conversation> {
        let mut db = self.db.lock().unwrap();
        let now = Utc::now();
        let creator = conv.created_by;
        let created = Conversation {
            id: Uuid::new_v4(),
            kind: conv.kind,
            name: conv.name,
            description: conv.description,
            is_private: conv.is_private,
            max_members: conv.max_members,
            created_by: creator,
            created_at: now,
            updated_at: now,
        };
        db.conversations.insert(created.id, created.clone());
        db.add_membership(created.id, creator, MemberRole::Owner)?;
        for participant in participants {
            db.add_membership(created.id, *participant, MemberRole::Member)?;
        }
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> RepoResult<Conversation> {
        let db = self.db.lock().unwrap();
        db.conversations.get(&id).cloned().ok_or(RepositoryError::NotFound)
    }

    async fn update_metadata(
        &self,
        id: Uuid,
        name: Option<String>,
        description: Option<String>,
    ) -> RepoResult<Conversation> {
        let mut db = self.db.lock().unwrap();
        let conv = db.conversations.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        if conv.kind != ConversationKind::Group {
            return Err(RepositoryError::NotFound);
        }
        if let Some(name) = name {
            conv.name = Some(name);
        }
        if let Some(description) = description {
            conv.description = Some(description);
        }
        conv.updated_at = Utc::now();
        Ok(conv.clone())
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        let mut db = self.db.lock().unwrap();
        db.conversations.remove(&id).ok_or(RepositoryError::NotFound)?;
        db.memberships.retain(|m| m.conversation_id != id);
        let removed: HashSet<Uuid> = db
            .messages
            .iter()
            .filter(|m| m.conversation_id == id)
            .map(|m| m.id)
            .collect();
        db.messages.retain(|m| m.conversation_id != id);
        db.read_markers.retain(|(_, message_id)| !removed.contains(message_id));
        db.direct_keys.retain(|_, conv_id| *conv_id != id);
        Ok(())
    }

    async fn list_by_participant(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> RepoResult<(Vec<Conversation>, i64)> {
        let db = self.db.lock().unwrap();
        let mut listed: Vec<Conversation> = db
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| db.conversations.get(&m.conversation_id).cloned())
            .collect();
        listed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        let total = listed.len() as i64;
        let paged = listed
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .collect();
        Ok((paged, total))
    }

    async fn get_direct_by_pair(&self, a: Uuid, b: Uuid) -> RepoResult<Conversation> {
        let db = self.db.lock().unwrap();
        let id = db
            .direct_keys
            .get(&direct_key(a, b))
            .ok_or(RepositoryError::NotFound)?;
        db.conversations.get(id).cloned().ok_or(RepositoryError::NotFound)
    }

    async fn create_direct(&self, a: Uuid, b: Uuid) -> RepoResult<Conversation> {
        let mut db = self.db.lock().unwrap();
        let key = direct_key(a, b);
        if db.direct_keys.contains_key(&key) {
            return Err(RepositoryError::UniqueViolation(
                "idx_conversations_direct_key".into(),
            ));
        }
        let now = Utc::now();
        let created = Conversation {
            id: Uuid::new_v4(),
            kind: ConversationKind::Direct,
            name: None,
            description: None,
            is_private: true,
            max_members: 2,
            created_by: a,
            created_at: now,
            updated_at: now,
        };
        db.conversations.insert(created.id, created.clone());
        db.direct_keys.insert(key, created.id);
        db.add_membership(created.id, a, MemberRole::Owner)?;
        db.add_membership(created.id, b, MemberRole::Owner)?;
        Ok(created)
    }

    async fn list_with_unread(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> RepoResult<(Vec<ConversationWithUnread>, i64)> {
        let (conversations, total) = self.list_by_participant(user_id, page).await?;
        let db = self.db.lock().unwrap();
        let listed = conversations
            .into_iter()
            .map(|conversation| {
                let unread_count = db.unread(user_id, conversation.id);
                ConversationWithUnread { conversation, unread_count }
            })
            .collect();
        Ok((listed, total))
    }
}

#[async_trait]
impl MessageRepository for MemoryRepos {
    async fn create(&self, msg: NewMessage) -> RepoResult<Message> {
        let mut db = self.db.lock().unwrap();
        if !db.conversations.contains_key(&msg.conversation_id) {
            return Err(RepositoryError::IntegrityViolation(
                "messages_conversation_id_fkey".into(),
            ));
        }
        let now = Utc::now();
        let created = Message {
            id: Uuid::new_v4(),
            conversation_id: msg.conversation_id,
            sender_id: msg.sender_id,
            content: msg.content,
            kind: msg.kind,
            parent_id: msg.parent_id,
            created_at: now,
            updated_at: now,
        };
        db.messages.push(created.clone());
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> RepoResult<Message> {
        let db = self.db.lock().unwrap();
        db.messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn list_by_conversation(
        &self,
        conversation_id: Uuid,
        page: Page,
        before: Option<DateTime<Utc>>,
    ) -> RepoResult<(Vec<Message>, i64)> {
        let db = self.db.lock().unwrap();
        let mut listed: Vec<Message> = db
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| before.map(|bound| m.created_at < bound).unwrap_or(true))
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = listed.len() as i64;
        let paged = listed
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .collect();
        Ok((paged, total))
    }

    async fn mark_read(&self, user_id: Uuid, message_ids: &[Uuid]) -> RepoResult<()> {
        let mut db = self.db.lock().unwrap();
        for message_id in message_ids {
            db.read_markers.insert((user_id, *message_id));
        }
        Ok(())
    }

    async fn unread_count(&self, user_id: Uuid, conversation_id: Uuid) -> RepoResult<i64> {
        let db = self.db.lock().unwrap();
        Ok(db.unread(user_id, conversation_id))
    }
}

#[async_trait]
impl MembershipRepository for MemoryRepos {
    async fn add(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
    ) -> RepoResult<Membership> {
        let mut db = self.db.lock().unwrap();
        if !db.conversations.contains_key(&conversation_id) {
            return Err(RepositoryError::IntegrityViolation(
                "memberships_conversation_id_fkey".into(),
            ));
        }
        db.add_membership(conversation_id, user_id, role)
    }

    async fn remove(&self, conversation_id: Uuid, user_id: Uuid) -> RepoResult<()> {
        let mut db = self.db.lock().unwrap();
        let before = db.memberships.len();
        db.memberships
            .retain(|m| !(m.conversation_id == conversation_id && m.user_id == user_id));
        if db.memberships.len() == before {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_by_conversation(&self, conversation_id: Uuid) -> RepoResult<Vec<Membership>> {
        let db = self.db.lock().unwrap();
        Ok(db
            .memberships
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> RepoResult<bool> {
        let db = self.db.lock().unwrap();
        Ok(db.is_member(conversation_id, user_id))
    }

    async fn member_count(&self, conversation_id: Uuid) -> RepoResult<i64> {
        let db = self.db.lock().unwrap();
        Ok(db
            .memberships
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .count() as i64)
    }

    async fn update_role(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
    ) -> RepoResult<Membership> {
        let mut db = self.db.lock().unwrap();

        if role != MemberRole::Owner {
            let other_owners = db
                .memberships
                .iter()
                .filter(|m| {
                    m.conversation_id == conversation_id
                        && m.role == MemberRole::Owner
                        && m.user_id != user_id
                })
                .count();
            let is_owner = db.memberships.iter().any(|m| {
                m.conversation_id == conversation_id
                    && m.user_id == user_id
                    && m.role == MemberRole::Owner
            });
            if is_owner && other_owners == 0 {
                return Err(RepositoryError::IntegrityViolation(
                    "conversation must retain at least one owner".into(),
                ));
            }
        }

        let membership = db
            .memberships
            .iter_mut()
            .find(|m| m.conversation_id == conversation_id && m.user_id == user_id)
            .ok_or(RepositoryError::NotFound)?;
        membership.role = role;
        Ok(membership.clone())
    }
}
