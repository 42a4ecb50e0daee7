//! Chat core service
//!
//! The transactional boundary: validates requests, persists to the durable
//! store, maintains the dual-path unread counters and hands fan-out work to
//! a bounded worker pool. Database failures on the commit path are surfaced
//! to the caller; fast-store failures after the commit are logged and
//! absorbed.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventSink;
use crate::error::ChatError;
use crate::events::Event;
use crate::faststore::{keys, ttl, KeyValueStore};
use crate::models::{
    Conversation, ConversationKind, ConversationWithUnread, MemberRole, Membership, Message,
    MessageKind, Page, MAX_MESSAGE_CHARS,
};
use crate::repository::{
    MembershipRepository, NewConversation, NewMessage, Repositories, RepositoryError,
};

const MAX_GROUP_NAME_CHARS: usize = 100;
const MAX_GROUP_DESCRIPTION_CHARS: usize = 500;
const MAX_GROUP_PARTICIPANTS: usize = 1000;

/// Post-commit work executed off the caller's request path.
#[derive(Debug)]
pub enum FanoutJob {
    /// Increment every other member's unread counter with a TTL refresh.
    UpdateUnread {
        conversation_id: Uuid,
        sender_id: Uuid,
    },
    /// Drop the sender's typing indicator after a sent message.
    ClearTyping {
        conversation_id: Uuid,
        user_id: Uuid,
    },
    /// Hand an event to the fan-out bus.
    PublishEvent { event: Event },
}

struct FanoutContext {
    memberships: Arc<dyn MembershipRepository>,
    store: Arc<dyn KeyValueStore>,
    events: Arc<dyn EventSink>,
}

/// Bounded pool running post-commit fan-out jobs. Overflow executes the job
/// inline on the submitting task, so saturation degrades latency instead of
/// correctness; shutdown drains the queue and joins every worker so the
/// drain path observes outstanding work.
pub struct FanoutPool {
    sender: Mutex<Option<mpsc::Sender<FanoutJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    ctx: Arc<FanoutContext>,
}

impl FanoutPool {
    pub fn start(
        worker_count: usize,
        queue_depth: usize,
        memberships: Arc<dyn MembershipRepository>,
        store: Arc<dyn KeyValueStore>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let ctx = Arc::new(FanoutContext {
            memberships,
            store,
            events,
        });

        let (sender, receiver) = mpsc::channel::<FanoutJob>(queue_depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let ctx = ctx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = receiver.lock().await;
                        guard.recv().await
                    };
                    match job {
                        Some(job) => run_job(&ctx, job).await,
                        None => break,
                    }
                }
            }));
        }

        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            ctx,
        })
    }

    /// Enqueue a job; a full or closed queue runs it inline.
    pub async fn submit(&self, job: FanoutJob) {
        let sender = self.sender.lock().await.clone();
        let job = match sender {
            Some(sender) => match sender.try_send(job) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(job))
                | Err(mpsc::error::TrySendError::Closed(job)) => job,
            },
            None => job,
        };

        debug!("Fan-out queue saturated, executing job inline");
        run_job(&self.ctx, job).await;
    }

    /// Close the queue, drain the remaining jobs and join every worker.
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        info!("Fan-out workers drained");
    }
}

async fn run_job(ctx: &FanoutContext, job: FanoutJob) {
    match job {
        FanoutJob::UpdateUnread {
            conversation_id,
            sender_id,
        } => match ctx.memberships.list_by_conversation(conversation_id).await {
            Ok(members) => {
                for member in members.iter().filter(|m| m.user_id != sender_id) {
                    let key = keys::unread(member.user_id, conversation_id);
                    if let Err(err) = ctx.store.incr_with_ttl(&key, ttl::UNREAD).await {
                        warn!(
                            user_id = %member.user_id,
                            conversation_id = %conversation_id,
                            error = %err,
                            "Unread counter update failed; durable count remains correct"
                        );
                    }
                }
            }
            Err(err) => warn!(
                conversation_id = %conversation_id,
                error = %err,
                "Membership load for unread update failed"
            ),
        },
        FanoutJob::ClearTyping {
            conversation_id,
            user_id,
        } => {
            let key = keys::typing(conversation_id, user_id);
            if let Err(err) = ctx.store.delete(&key).await {
                warn!(
                    conversation_id = %conversation_id,
                    user_id = %user_id,
                    error = %err,
                    "Typing indicator cleanup failed"
                );
            }
        }
        FanoutJob::PublishEvent { event } => ctx.events.publish(&event).await,
    }
}

/// Request payload for group creation.
#[derive(Debug, Clone)]
pub struct CreateGroupRequest {
    pub name: String,
    pub description: Option<String>,
    pub is_private: bool,
    pub max_members: i32,
    pub participant_ids: Vec<Uuid>,
}

/// Request payload for sending a message.
#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub content: String,
    pub message_type: String,
    pub parent_id: Option<Uuid>,
}

pub struct ChatService {
    repos: Repositories,
    store: Arc<dyn KeyValueStore>,
    fanout: Arc<FanoutPool>,
}

impl ChatService {
    pub fn new(repos: Repositories, store: Arc<dyn KeyValueStore>, fanout: Arc<FanoutPool>) -> Self {
        Self { repos, store, fanout }
    }

    /// Create a group conversation with the creator as owner.
    pub async fn create_group(
        &self,
        req: CreateGroupRequest,
        creator: Uuid,
    ) -> Result<Conversation, ChatError> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidArgument("group name is required".into()));
        }
        if name.chars().count() > MAX_GROUP_NAME_CHARS {
            return Err(ChatError::InvalidArgument(format!(
                "group name exceeds {} characters",
                MAX_GROUP_NAME_CHARS
            )));
        }
        if let Some(description) = &req.description {
            if description.chars().count() > MAX_GROUP_DESCRIPTION_CHARS {
                return Err(ChatError::InvalidArgument(format!(
                    "description exceeds {} characters",
                    MAX_GROUP_DESCRIPTION_CHARS
                )));
            }
        }
        if req.participant_ids.is_empty() {
            return Err(ChatError::InvalidArgument(
                "at least one participant is required".into(),
            ));
        }
        if req.participant_ids.len() > MAX_GROUP_PARTICIPANTS {
            return Err(ChatError::InvalidArgument(format!(
                "participant list exceeds {}",
                MAX_GROUP_PARTICIPANTS
            )));
        }
        let distinct: HashSet<Uuid> = req.participant_ids.iter().copied().collect();
        if distinct.len() != req.participant_ids.len() {
            return Err(ChatError::InvalidArgument(
                "participant ids must be distinct".into(),
            ));
        }
        if distinct.contains(&creator) {
            return Err(ChatError::InvalidArgument(
                "creator must not appear in the participant list".into(),
            ));
        }
        if req.max_members < 0 {
            return Err(ChatError::InvalidArgument(
                "max_members must be zero or positive".into(),
            ));
        }

        let conversation = self
            .repos
            .conversations
            .create_group(
                NewConversation {
                    kind: ConversationKind::Group,
                    name: Some(name.to_string()),
                    description: req.description.clone(),
                    is_private: req.is_private,
                    max_members: req.max_members,
                    created_by: creator,
                },
                &req.participant_ids,
            )
            .await?;

        for participant in &req.participant_ids {
            self.fanout
                .submit(FanoutJob::PublishEvent {
                    event: Event::UserJoined {
                        conversation_id: conversation.id,
                        user_id: *participant,
                        timestamp: Utc::now(),
                    },
                })
                .await;
        }

        info!(conversation_id = %conversation.id, creator = %creator, "Group conversation created");
        Ok(conversation)
    }

    /// Return the direct conversation for the unordered pair, creating it
    /// on first use. Concurrent creators converge on one row.
    pub async fn create_or_get_direct(&self, a: Uuid, b: Uuid) -> Result<Conversation, ChatError> {
        if a == b {
            return Err(ChatError::InvalidArgument(
                "a direct conversation needs two distinct users".into(),
            ));
        }

        match self.repos.conversations.get_direct_by_pair(a, b).await {
            Ok(existing) => return Ok(existing),
            Err(RepositoryError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }

        match self.repos.conversations.create_direct(a, b).await {
            Ok(created) => Ok(created),
            // Lost the creation race; the winner's row is committed.
            Err(RepositoryError::UniqueViolation(_)) => {
                match self.repos.conversations.get_direct_by_pair(a, b).await {
                    Ok(existing) => Ok(existing),
                    Err(err) => Err(ChatError::Internal(format!(
                        "direct conversation lookup after unique violation failed: {}",
                        err
                    ))),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Validate, persist and fan out a message. The returned message is
    /// committed; delivery happens asynchronously.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        sender: Uuid,
        req: SendMessageRequest,
    ) -> Result<Message, ChatError> {
        let content = req.content.trim();
        if content.is_empty() {
            return Err(ChatError::InvalidArgument("message content is empty".into()));
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ChatError::InvalidArgument(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }
        let kind = MessageKind::parse(&req.message_type).ok_or_else(|| {
            ChatError::InvalidArgument(format!("unknown message type '{}'", req.message_type))
        })?;
        if kind == MessageKind::System {
            return Err(ChatError::InvalidArgument(
                "system messages cannot be sent by clients".into(),
            ));
        }

        self.assert_member(conversation_id, sender).await?;

        let message = self
            .repos
            .messages
            .create(NewMessage {
                conversation_id,
                sender_id: sender,
                content: content.to_string(),
                kind,
                parent_id: req.parent_id,
            })
            .await?;

        // Post-commit work; the caller does not wait on its outcome.
        self.fanout
            .submit(FanoutJob::UpdateUnread {
                conversation_id,
                sender_id: sender,
            })
            .await;
        self.fanout
            .submit(FanoutJob::ClearTyping {
                conversation_id,
                user_id: sender,
            })
            .await;
        self.fanout
            .submit(FanoutJob::PublishEvent {
                event: Event::Message {
                    conversation_id,
                    user_id: sender,
                    timestamp: message.created_at,
                    message: message.clone(),
                },
            })
            .await;

        Ok(message)
    }

    /// Newest-first page of messages, gated on membership.
    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        caller: Uuid,
        page: Page,
        before: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Message>, i64), ChatError> {
        self.assert_member(conversation_id, caller).await?;
        Ok(self
            .repos
            .messages
            .list_by_conversation(conversation_id, page, before)
            .await?)
    }

    /// Record read markers and reset the cached unread counter.
    pub async fn mark_read(
        &self,
        caller: Uuid,
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
    ) -> Result<(), ChatError> {
        if message_ids.is_empty() {
            return Err(ChatError::InvalidArgument(
                "at least one message id is required".into(),
            ));
        }

        self.repos.messages.mark_read(caller, &message_ids).await?;

        let key = keys::unread(caller, conversation_id);
        if let Err(err) = self.store.set_i64_ex(&key, 0, ttl::UNREAD).await {
            warn!(
                user_id = %caller,
                conversation_id = %conversation_id,
                error = %err,
                "Unread counter reset failed; durable markers are committed"
            );
        }

        self.fanout
            .submit(FanoutJob::PublishEvent {
                event: Event::MessageRead {
                    conversation_id,
                    user_id: caller,
                    timestamp: Utc::now(),
                    message_ids,
                },
            })
            .await;

        Ok(())
    }

    /// Unread count hedged across both stores: the durable aggregate is the
    /// floor, the warm cache may run ahead of it.
    pub async fn unread_count(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<i64, ChatError> {
        let durable = self
            .repos
            .messages
            .unread_count(user_id, conversation_id)
            .await?;

        let fast = match self.store.get_i64(&keys::unread(user_id, conversation_id)).await {
            Ok(value) => value.unwrap_or(0),
            Err(err) => {
                warn!(
                    user_id = %user_id,
                    conversation_id = %conversation_id,
                    error = %err,
                    "Unread cache read failed, serving durable count"
                );
                0
            }
        };

        Ok(durable.max(fast))
    }

    /// Conversations for the caller with hedged unread counts.
    pub async fn list_conversations(
        &self,
        caller: Uuid,
        page: Page,
    ) -> Result<(Vec<ConversationWithUnread>, i64), ChatError> {
        let (mut listed, total) = self
            .repos
            .conversations
            .list_with_unread(caller, page)
            .await?;

        for entry in &mut listed {
            let key = keys::unread(caller, entry.conversation.id);
            if let Ok(Some(cached)) = self.store.get_i64(&key).await {
                entry.unread_count = entry.unread_count.max(cached);
            }
        }

        Ok((listed, total))
    }

    /// Join a public conversation with room to spare.
    pub async fn join(&self, conversation_id: Uuid, user_id: Uuid) -> Result<Membership, ChatError> {
        let conversation = self.repos.conversations.get(conversation_id).await?;

        if self
            .repos
            .memberships
            .is_member(conversation_id, user_id)
            .await?
        {
            return Err(ChatError::Conflict("already a member".into()));
        }
        if conversation.is_private {
            return Err(ChatError::PermissionDenied(
                "private conversations require an invitation".into(),
            ));
        }

        let current = self.repos.memberships.member_count(conversation_id).await?;
        if !conversation.has_capacity(current) {
            return Err(ChatError::ResourceExhausted(format!(
                "conversation is full ({} members)",
                conversation.max_members
            )));
        }

        let membership = self
            .repos
            .memberships
            .add(conversation_id, user_id, MemberRole::Member)
            .await?;

        self.fanout
            .submit(FanoutJob::PublishEvent {
                event: Event::UserJoined {
                    conversation_id,
                    user_id,
                    timestamp: Utc::now(),
                },
            })
            .await;

        Ok(membership)
    }

    /// Leave a conversation and drop the cached unread counter.
    pub async fn leave(&self, conversation_id: Uuid, user_id: Uuid) -> Result<(), ChatError> {
        self.repos.memberships.remove(conversation_id, user_id).await?;

        let key = keys::unread(user_id, conversation_id);
        if let Err(err) = self.store.delete(&key).await {
            warn!(
                user_id = %user_id,
                conversation_id = %conversation_id,
                error = %err,
                "Unread counter cleanup on leave failed"
            );
        }

        self.fanout
            .submit(FanoutJob::PublishEvent {
                event: Event::UserLeft {
                    conversation_id,
                    user_id,
                    timestamp: Utc::now(),
                },
            })
            .await;

        Ok(())
    }

    /// Membership gate shared by the message paths and the session
    /// handshake.
    pub async fn assert_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<(), ChatError> {
        if self
            .repos
            .memberships
            .is_member(conversation_id, user_id)
            .await?
        {
            Ok(())
        } else {
            Err(ChatError::PermissionDenied(
                "caller is not a member of the conversation".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{
        MockConversationRepository, MockMembershipRepository, MockMessageRepository,
    };
    use crate::testsupport::{MemoryStore, RecordingSink};
    use mockall::predicate::eq;

    struct Harness {
        conversations: MockConversationRepository,
        messages: MockMessageRepository,
        memberships: MockMembershipRepository,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                conversations: MockConversationRepository::new(),
                messages: MockMessageRepository::new(),
                memberships: MockMembershipRepository::new(),
                store: Arc::new(MemoryStore::default()),
                sink: Arc::new(RecordingSink::default()),
            }
        }

        fn build(self) -> (ChatService, Arc<FanoutPool>, Arc<MemoryStore>, Arc<RecordingSink>) {
            let repos = Repositories {
                conversations: Arc::new(self.conversations),
                messages: Arc::new(self.messages),
                memberships: Arc::new(self.memberships),
            };
            let fanout = FanoutPool::start(
                2,
                16,
                repos.memberships.clone(),
                self.store.clone(),
                self.sink.clone(),
            );
            let service = ChatService::new(repos, self.store.clone(), fanout.clone());
            (service, fanout, self.store, self.sink)
        }
    }

    fn conversation(kind: ConversationKind, max_members: i32, is_private: bool) -> Conversation {
        Conversation {
            id: Uuid::new_v4(),
            kind,
            name: Some("room".into()),
            description: None,
            is_private,
            max_members,
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn stored_message(conversation_id: Uuid, sender: Uuid, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: sender,
            content: content.to_string(),
            kind: MessageKind::Text,
            parent_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn membership(conversation_id: Uuid, user_id: Uuid) -> Membership {
        Membership {
            id: Uuid::new_v4(),
            conversation_id,
            user_id,
            role: MemberRole::Member,
            joined_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_send_message_rejects_bad_content() {
        let (service, _, _, _) = Harness::new().build();
        let conv = Uuid::new_v4();
        let sender = Uuid::new_v4();

        let empty = service
            .send_message(conv, sender, SendMessageRequest {
                content: "   ".into(),
                message_type: "text".into(),
                parent_id: None,
            })
            .await;
        assert!(matches!(empty, Err(ChatError::InvalidArgument(_))));

        let oversize = service
            .send_message(conv, sender, SendMessageRequest {
                content: "x".repeat(MAX_MESSAGE_CHARS + 1),
                message_type: "text".into(),
                parent_id: None,
            })
            .await;
        assert!(matches!(oversize, Err(ChatError::InvalidArgument(_))));

        let system = service
            .send_message(conv, sender, SendMessageRequest {
                content: "hello".into(),
                message_type: "system".into(),
                parent_id: None,
            })
            .await;
        assert!(matches!(system, Err(ChatError::InvalidArgument(_))));

        let unknown = service
            .send_message(conv, sender, SendMessageRequest {
                content: "hello".into(),
                message_type: "sticker".into(),
                parent_id: None,
            })
            .await;
        assert!(matches!(unknown, Err(ChatError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_send_message_requires_membership() {
        let mut harness = Harness::new();
        let conv = Uuid::new_v4();
        let outsider = Uuid::new_v4();

        harness
            .memberships
            .expect_is_member()
            .with(eq(conv), eq(outsider))
            .returning(|_, _| Ok(false));
        // No message may be persisted for a non-member.
        harness.messages.expect_create().never();

        let (service, _, _, sink) = harness.build();
        let result = service
            .send_message(conv, outsider, SendMessageRequest {
                content: "hello".into(),
                message_type: "text".into(),
                parent_id: None,
            })
            .await;

        assert!(matches!(result, Err(ChatError::PermissionDenied(_))));
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_commits_then_fans_out() {
        let mut harness = Harness::new();
        let conv = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let peer_a = Uuid::new_v4();
        let peer_b = Uuid::new_v4();

        harness
            .memberships
            .expect_is_member()
            .returning(|_, _| Ok(true));
        harness.messages.expect_create().returning(move |new| {
            Ok(stored_message(new.conversation_id, new.sender_id, &new.content))
        });
        harness
            .memberships
            .expect_list_by_conversation()
            .with(eq(conv))
            .returning(move |conversation_id| {
                Ok(vec![
                    membership(conversation_id, sender),
                    membership(conversation_id, peer_a),
                    membership(conversation_id, peer_b),
                ])
            });

        let (service, fanout, store, sink) = harness.build();
        let message = service
            .send_message(conv, sender, SendMessageRequest {
                content: "  hello  ".into(),
                message_type: "text".into(),
                parent_id: None,
            })
            .await
            .unwrap();

        // Content is stored trimmed.
        assert_eq!(message.content, "hello");

        // Drain the pool so the post-commit jobs have run.
        fanout.shutdown().await;

        assert_eq!(store.value_i64(&keys::unread(peer_a, conv)), Some(1));
        assert_eq!(store.value_i64(&keys::unread(peer_b, conv)), Some(1));
        assert_eq!(store.value_i64(&keys::unread(sender, conv)), None);

        let kinds = sink.kinds();
        assert_eq!(kinds, vec!["message"]);
    }

    #[tokio::test]
    async fn test_unread_hedge_takes_maximum() {
        let mut harness = Harness::new();
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();

        harness
            .messages
            .expect_unread_count()
            .returning(|_, _| Ok(2));

        let (service, _, store, _) = harness.build();

        // Cold cache: durable count wins.
        assert_eq!(service.unread_count(user, conv).await.unwrap(), 2);

        // Warm cache ahead of the durable aggregate wins.
        store
            .set_i64_ex(&keys::unread(user, conv), 5, ttl::UNREAD)
            .await
            .unwrap();
        assert_eq!(service.unread_count(user, conv).await.unwrap(), 5);

        // Fast-store failure degrades to the durable count.
        store.set_failing(true);
        assert_eq!(service.unread_count(user, conv).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_mark_read_resets_counter_and_publishes() {
        let mut harness = Harness::new();
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];

        harness
            .messages
            .expect_mark_read()
            .times(1)
            .returning(|_, _| Ok(()));

        let (service, fanout, store, sink) = harness.build();
        store
            .set_i64_ex(&keys::unread(user, conv), 7, ttl::UNREAD)
            .await
            .unwrap();

        service.mark_read(user, conv, ids.clone()).await.unwrap();
        fanout.shutdown().await;

        assert_eq!(store.value_i64(&keys::unread(user, conv)), Some(0));
        match sink.events().as_slice() {
            [Event::MessageRead { message_ids, user_id, .. }] => {
                assert_eq!(message_ids, &ids);
                assert_eq!(*user_id, user);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mark_read_requires_ids() {
        let (service, _, _, _) = Harness::new().build();
        let result = service.mark_read(Uuid::new_v4(), Uuid::new_v4(), vec![]).await;
        assert!(matches!(result, Err(ChatError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_mark_read_survives_fast_store_outage() {
        let mut harness = Harness::new();
        harness.messages.expect_mark_read().returning(|_, _| Ok(()));

        let (service, fanout, store, sink) = harness.build();
        store.set_failing(true);

        service
            .mark_read(Uuid::new_v4(), Uuid::new_v4(), vec![Uuid::new_v4()])
            .await
            .unwrap();
        fanout.shutdown().await;
        assert_eq!(sink.kinds(), vec!["message_read"]);
    }

    #[tokio::test]
    async fn test_create_group_validation() {
        let (service, _, _, _) = Harness::new().build();
        let creator = Uuid::new_v4();
        let participant = Uuid::new_v4();

        let base = CreateGroupRequest {
            name: "team".into(),
            description: None,
            is_private: false,
            max_members: 0,
            participant_ids: vec![participant],
        };

        let blank = CreateGroupRequest { name: "  ".into(), ..base.clone() };
        assert!(matches!(
            service.create_group(blank, creator).await,
            Err(ChatError::InvalidArgument(_))
        ));

        let long_name = CreateGroupRequest { name: "n".repeat(101), ..base.clone() };
        assert!(matches!(
            service.create_group(long_name, creator).await,
            Err(ChatError::InvalidArgument(_))
        ));

        let long_description = CreateGroupRequest {
            description: Some("d".repeat(501)),
            ..base.clone()
        };
        assert!(matches!(
            service.create_group(long_description, creator).await,
            Err(ChatError::InvalidArgument(_))
        ));

        let nobody = CreateGroupRequest { participant_ids: vec![], ..base.clone() };
        assert!(matches!(
            service.create_group(nobody, creator).await,
            Err(ChatError::InvalidArgument(_))
        ));

        let duplicated = CreateGroupRequest {
            participant_ids: vec![participant, participant],
            ..base.clone()
        };
        assert!(matches!(
            service.create_group(duplicated, creator).await,
            Err(ChatError::InvalidArgument(_))
        ));

        let includes_creator = CreateGroupRequest {
            participant_ids: vec![creator],
            ..base
        };
        assert!(matches!(
            service.create_group(includes_creator, creator).await,
            Err(ChatError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_create_group_publishes_joins() {
        let mut harness = Harness::new();
        let creator = Uuid::new_v4();
        let members = vec![Uuid::new_v4(), Uuid::new_v4()];

        harness
            .conversations
            .expect_create_group()
            .times(1)
            .returning(|conv, _| {
                Ok(Conversation {
                    id: Uuid::new_v4(),
                    kind: conv.kind,
                    name: conv.name,
                    description: conv.description,
                    is_private: conv.is_private,
                    max_members: conv.max_members,
                    created_by: conv.created_by,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
            });

        let (service, fanout, _, sink) = harness.build();
        service
            .create_group(
                CreateGroupRequest {
                    name: "team".into(),
                    description: Some("the team".into()),
                    is_private: false,
                    max_members: 0,
                    participant_ids: members.clone(),
                },
                creator,
            )
            .await
            .unwrap();
        fanout.shutdown().await;

        let joined: Vec<Uuid> = sink
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::UserJoined { user_id, .. } => Some(*user_id),
                _ => None,
            })
            .collect();
        assert_eq!(joined, members);
    }

    #[tokio::test]
    async fn test_create_or_get_direct_rejects_self() {
        let (service, _, _, _) = Harness::new().build();
        let user = Uuid::new_v4();
        assert!(matches!(
            service.create_or_get_direct(user, user).await,
            Err(ChatError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_create_or_get_direct_retries_on_race() {
        let mut harness = Harness::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let winner = conversation(ConversationKind::Direct, 2, true);
        let winner_clone = winner.clone();

        // First lookup misses, creation loses the race, the retry finds the
        // winner's row.
        let mut lookups = 0;
        harness
            .conversations
            .expect_get_direct_by_pair()
            .times(2)
            .returning(move |_, _| {
                lookups += 1;
                if lookups == 1 {
                    Err(RepositoryError::NotFound)
                } else {
                    Ok(winner_clone.clone())
                }
            });
        harness
            .conversations
            .expect_create_direct()
            .times(1)
            .returning(|_, _| Err(RepositoryError::UniqueViolation("direct_key".into())));

        let (service, _, _, _) = harness.build();
        let resolved = service.create_or_get_direct(a, b).await.unwrap();
        assert_eq!(resolved.id, winner.id);
    }

    #[tokio::test]
    async fn test_join_capacity_gate() {
        let mut harness = Harness::new();
        let conv = conversation(ConversationKind::Group, 3, false);
        let conv_id = conv.id;
        let user = Uuid::new_v4();

        harness
            .conversations
            .expect_get()
            .returning(move |_| Ok(conv.clone()));
        harness
            .memberships
            .expect_is_member()
            .returning(|_, _| Ok(false));
        harness
            .memberships
            .expect_member_count()
            .returning(|_| Ok(3));
        harness.memberships.expect_add().never();

        let (service, _, _, _) = harness.build();
        let result = service.join(conv_id, user).await;
        assert!(matches!(result, Err(ChatError::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn test_join_rejects_existing_member_and_private() {
        let mut harness = Harness::new();
        let open = conversation(ConversationKind::Group, 0, false);
        let open_id = open.id;

        harness
            .conversations
            .expect_get()
            .returning(move |_| Ok(open.clone()));
        harness
            .memberships
            .expect_is_member()
            .returning(|_, _| Ok(true));

        let (service, _, _, _) = harness.build();
        assert!(matches!(
            service.join(open_id, Uuid::new_v4()).await,
            Err(ChatError::Conflict(_))
        ));

        let mut harness = Harness::new();
        let private = conversation(ConversationKind::Group, 0, true);
        let private_id = private.id;
        harness
            .conversations
            .expect_get()
            .returning(move |_| Ok(private.clone()));
        harness
            .memberships
            .expect_is_member()
            .returning(|_, _| Ok(false));

        let (service, _, _, _) = harness.build();
        assert!(matches!(
            service.join(private_id, Uuid::new_v4()).await,
            Err(ChatError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_join_success_publishes() {
        let mut harness = Harness::new();
        let conv = conversation(ConversationKind::Group, 10, false);
        let conv_id = conv.id;
        let user = Uuid::new_v4();

        harness
            .conversations
            .expect_get()
            .returning(move |_| Ok(conv.clone()));
        harness
            .memberships
            .expect_is_member()
            .returning(|_, _| Ok(false));
        harness
            .memberships
            .expect_member_count()
            .returning(|_| Ok(2));
        harness
            .memberships
            .expect_add()
            .with(eq(conv_id), eq(user), eq(MemberRole::Member))
            .returning(|conversation_id, user_id, _| Ok(membership(conversation_id, user_id)));

        let (service, fanout, _, sink) = harness.build();
        service.join(conv_id, user).await.unwrap();
        fanout.shutdown().await;

        assert_eq!(sink.kinds(), vec!["user_joined"]);
    }

    #[tokio::test]
    async fn test_leave_clears_counter_and_publishes() {
        let mut harness = Harness::new();
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();

        harness
            .memberships
            .expect_remove()
            .with(eq(conv), eq(user))
            .returning(|_, _| Ok(()));

        let (service, fanout, store, sink) = harness.build();
        store
            .set_i64_ex(&keys::unread(user, conv), 4, ttl::UNREAD)
            .await
            .unwrap();

        service.leave(conv, user).await.unwrap();
        fanout.shutdown().await;

        assert!(!store.contains(&keys::unread(user, conv)));
        assert_eq!(sink.kinds(), vec!["user_left"]);
    }

    #[tokio::test]
    async fn test_leave_of_non_member_is_not_found() {
        let mut harness = Harness::new();
        harness
            .memberships
            .expect_remove()
            .returning(|_, _| Err(RepositoryError::NotFound));

        let (service, _, _, sink) = harness.build();
        let result = service.leave(Uuid::new_v4(), Uuid::new_v4()).await;
        assert!(matches!(result, Err(ChatError::NotFound(_))));
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_list_messages_requires_membership() {
        let mut harness = Harness::new();
        harness
            .memberships
            .expect_is_member()
            .returning(|_, _| Ok(false));
        harness.messages.expect_list_by_conversation().never();

        let (service, _, _, _) = harness.build();
        let result = service
            .list_messages(Uuid::new_v4(), Uuid::new_v4(), Page::new(0, 50), None)
            .await;
        assert!(matches!(result, Err(ChatError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_fanout_overflow_runs_inline() {
        let mut harness = Harness::new();
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();
        harness
            .memberships
            .expect_remove()
            .returning(|_, _| Ok(()));

        let (service, fanout, _, sink) = harness.build();
        // Close the pool first so every publish takes the inline path.
        fanout.shutdown().await;

        service.leave(conv, user).await.unwrap();
        assert_eq!(sink.kinds(), vec!["user_left"]);
    }
}
