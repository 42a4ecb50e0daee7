//! Fan-out bus
//!
//! Cross-instance event distribution over the fast store's pub/sub
//! facility. Locally produced events are published to `conv:{id}` and come
//! back through the same subscription path that remote events use, so
//! delivery ordering within a conversation is decided in one place.
//!
//! The subscriber task owns a dedicated pub/sub connection. It reconnects
//! with jittered exponential backoff and re-subscribes every channel that
//! still has local references; events published during a gap are lost
//! (at-most-once), clients resync through the paged message history.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::Event;
use crate::faststore::{channels, FastStore};
use crate::hub::ConnectionHub;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Destination for locally produced events. The production sink is the
/// fan-out bus; tests substitute a recording double.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &Event);
}

#[async_trait::async_trait]
impl EventSink for FanoutBus {
    async fn publish(&self, event: &Event) {
        FanoutBus::publish(self, event).await;
    }
}

/// The full bus surface a session needs: publishing plus subscription
/// reference management.
#[async_trait::async_trait]
pub trait BusHandle: Send + Sync {
    async fn publish(&self, event: &Event);
    fn ensure(&self, conversation_id: Uuid);
    fn release(&self, conversation_id: Uuid);
}

#[async_trait::async_trait]
impl BusHandle for FanoutBus {
    async fn publish(&self, event: &Event) {
        FanoutBus::publish(self, event).await;
    }

    fn ensure(&self, conversation_id: Uuid) {
        FanoutBus::ensure(self, conversation_id);
    }

    fn release(&self, conversation_id: Uuid) {
        FanoutBus::release(self, conversation_id);
    }
}

#[derive(Debug)]
enum SubCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Reference counts per channel name.
#[derive(Default)]
pub(crate) struct ChannelRefs {
    counts: DashMap<String, usize>,
}

impl ChannelRefs {
    /// Returns true when this was the first reference.
    fn acquire(&self, channel: &str) -> bool {
        let mut entry = self.counts.entry(channel.to_string()).or_insert(0);
        *entry += 1;
        *entry == 1
    }

    /// Returns true when the last reference was dropped.
    fn release(&self, channel: &str) -> bool {
        let mut dropped = false;
        if let Some(mut entry) = self.counts.get_mut(channel) {
            if *entry > 0 {
                *entry -= 1;
            }
            dropped = *entry == 0;
        }
        if dropped {
            self.counts.remove_if(channel, |_, count| *count == 0);
        }
        dropped
    }

    fn referenced(&self) -> Vec<String> {
        self.counts.iter().map(|entry| entry.key().clone()).collect()
    }
}

pub struct FanoutBus {
    store: FastStore,
    refs: Arc<ChannelRefs>,
    commands: mpsc::UnboundedSender<SubCommand>,
}

impl FanoutBus {
    /// Build the bus and spawn its subscriber task.
    pub fn start(
        store: FastStore,
        hub: Arc<ConnectionHub>,
        reconnect_backoff: Duration,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let refs = Arc::new(ChannelRefs::default());
        let (commands, command_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(subscriber_loop(
            store.clone(),
            hub,
            refs.clone(),
            command_rx,
            reconnect_backoff,
        ));

        (Arc::new(Self { store, refs, commands }), task)
    }

    /// Publish an event on its conversation channel. Fire-and-forget:
    /// transient backend failures are logged, never surfaced.
    pub async fn publish(&self, event: &Event) {
        let channel = channels::conversation(event.conversation_id());
        let encoded = match event.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(kind = event.kind(), error = %err, "Failed to encode event");
                return;
            }
        };

        if let Err(err) = self.store.publish(&channel, &encoded).await {
            warn!(
                channel = %channel,
                kind = event.kind(),
                error = %err,
                "Event publish failed; recipients resync from history"
            );
        }
    }

    /// Reference a conversation channel; subscribes on first use.
    pub fn ensure(&self, conversation_id: Uuid) {
        let channel = channels::conversation(conversation_id);
        if self.refs.acquire(&channel) {
            let _ = self.commands.send(SubCommand::Subscribe(channel));
        }
    }

    /// Drop a reference; unsubscribes when the last one goes.
    pub fn release(&self, conversation_id: Uuid) {
        let channel = channels::conversation(conversation_id);
        if self.refs.release(&channel) {
            let _ = self.commands.send(SubCommand::Unsubscribe(channel));
        }
    }
}

enum Wake {
    Incoming(Option<redis::Msg>),
    Command(Option<SubCommand>),
}

async fn subscriber_loop(
    store: FastStore,
    hub: Arc<ConnectionHub>,
    refs: Arc<ChannelRefs>,
    mut command_rx: mpsc::UnboundedReceiver<SubCommand>,
    base_backoff: Duration,
) {
    let mut attempt: u32 = 0;

    loop {
        let mut pubsub = match store.subscriber().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                warn!(error = %err, "Subscriber connection failed, backing off");
                tokio::time::sleep(backoff_delay(base_backoff, attempt)).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
        };

        // Re-subscribe everything still referenced locally.
        let mut resubscribe_failed = false;
        let referenced = refs.referenced();
        for channel in &referenced {
            if let Err(err) = pubsub.subscribe(channel).await {
                warn!(channel = %channel, error = %err, "Re-subscribe failed");
                resubscribe_failed = true;
                break;
            }
        }
        if resubscribe_failed {
            tokio::time::sleep(backoff_delay(base_backoff, attempt)).await;
            attempt = attempt.saturating_add(1);
            continue;
        }

        info!(channels = referenced.len(), "Fan-out subscriber connected");
        attempt = 0;

        loop {
            let wake = {
                let mut stream = pubsub.on_message();
                tokio::select! {
                    msg = stream.next() => Wake::Incoming(msg),
                    cmd = command_rx.recv() => Wake::Command(cmd),
                }
            };

            match wake {
                Wake::Incoming(Some(msg)) => {
                    deliver_local(&hub, msg.get_payload_bytes());
                }
                Wake::Incoming(None) => {
                    warn!("Subscription transport lost, reconnecting");
                    break;
                }
                Wake::Command(Some(SubCommand::Subscribe(channel))) => {
                    if let Err(err) = pubsub.subscribe(&channel).await {
                        warn!(channel = %channel, error = %err, "Subscribe failed, reconnecting");
                        break;
                    }
                    debug!(channel = %channel, "Subscribed");
                }
                Wake::Command(Some(SubCommand::Unsubscribe(channel))) => {
                    if let Err(err) = pubsub.unsubscribe(&channel).await {
                        warn!(channel = %channel, error = %err, "Unsubscribe failed, reconnecting");
                        break;
                    }
                    debug!(channel = %channel, "Unsubscribed");
                }
                Wake::Command(None) => {
                    info!("Fan-out bus shut down");
                    return;
                }
            }
        }

        tokio::time::sleep(backoff_delay(base_backoff, attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Decode an incoming payload and hand it to the hub. Unknown event kinds
/// are logged and dropped so newer peers can ship new kinds first. This is
/// the single delivery path for both local and remote origins.
pub fn deliver_local(hub: &ConnectionHub, payload: &[u8]) {
    let event = match Event::decode(payload) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "Dropping undecodable bus payload");
            return;
        }
    };

    let encoded = match event.encode() {
        Ok(encoded) => encoded,
        Err(err) => {
            error!(error = %err, "Failed to re-encode event for delivery");
            return;
        }
    };

    let exclude = event.excludes_originator().then(|| event.user_id());
    let delivered = hub.broadcast(event.conversation_id(), &encoded, exclude);
    debug!(
        kind = event.kind(),
        conversation_id = %event.conversation_id(),
        delivered,
        "Event dispatched to local connections"
    );
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.min(6)));
    let capped = exp.min(MAX_BACKOFF);
    // Up to 50% jitter keeps reconnecting instances from stampeding.
    let jitter = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2);
    capped + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;

    #[test]
    fn test_channel_refs_first_and_last() {
        let refs = ChannelRefs::default();

        assert!(refs.acquire("conv:a"));
        assert!(!refs.acquire("conv:a"));
        assert!(!refs.release("conv:a"));
        assert!(refs.release("conv:a"));

        // Releasing an unknown channel is a no-op.
        assert!(!refs.release("conv:b"));
        assert!(refs.referenced().is_empty());
    }

    #[test]
    fn test_channel_refs_resubscribe_set() {
        let refs = ChannelRefs::default();
        refs.acquire("conv:a");
        refs.acquire("conv:b");
        refs.acquire("conv:b");

        let mut channels = refs.referenced();
        channels.sort();
        assert_eq!(channels, vec!["conv:a".to_string(), "conv:b".to_string()]);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let base = Duration::from_millis(500);
        let first = backoff_delay(base, 0);
        assert!(first >= base && first <= base * 2);

        let late = backoff_delay(base, 20);
        assert!(late <= MAX_BACKOFF + MAX_BACKOFF / 2);
        assert!(late >= MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_room() {
        let hub = ConnectionHub::new(8);
        let conv = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let mut reg = hub.register(conv, Uuid::new_v4(), Uuid::new_v4());

        let event = Event::Message {
            conversation_id: conv,
            user_id: sender,
            timestamp: chrono::Utc::now(),
            message: crate::models::Message {
                id: Uuid::new_v4(),
                conversation_id: conv,
                sender_id: sender,
                content: "hello".into(),
                kind: MessageKind::Text,
                parent_id: None,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
        };

        deliver_local(&hub, event.encode().unwrap().as_bytes());

        let frame = reg.receiver.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["message"]["content"], "hello");
    }

    #[tokio::test]
    async fn test_dispatch_applies_typing_exclusion() {
        let hub = ConnectionHub::new(8);
        let conv = Uuid::new_v4();
        let typist = Uuid::new_v4();

        let mut typist_reg = hub.register(conv, Uuid::new_v4(), typist);
        let mut peer_reg = hub.register(conv, Uuid::new_v4(), Uuid::new_v4());

        let event = Event::Typing {
            conversation_id: conv,
            user_id: typist,
            timestamp: chrono::Utc::now(),
        };
        deliver_local(&hub, event.encode().unwrap().as_bytes());

        assert!(typist_reg.receiver.try_recv().is_err());
        assert!(peer_reg.receiver.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_drops_garbage() {
        let hub = ConnectionHub::new(8);
        let conv = Uuid::new_v4();
        let mut reg = hub.register(conv, Uuid::new_v4(), Uuid::new_v4());

        deliver_local(&hub, b"{not json");
        deliver_local(&hub, br#"{"type":"unknown_kind"}"#);

        assert!(reg.receiver.try_recv().is_err());
    }
}
