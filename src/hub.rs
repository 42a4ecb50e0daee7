//! Connection hub
//!
//! Process-local routing table from conversation to live WebSocket
//! connections. State is sharded by conversation so fan-out for one room
//! never serializes behind another; the broadcast path snapshots a room's
//! senders and writes to the per-connection queues outside the shard lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle the hub keeps per live connection.
#[derive(Clone)]
struct ConnectionHandle {
    user_id: Uuid,
    sender: mpsc::Sender<String>,
    closer: Arc<Notify>,
    healthy: Arc<AtomicBool>,
}

/// What a session receives when it registers.
pub struct Registration {
    pub receiver: mpsc::Receiver<String>,
    /// Fired when the hub wants the connection gone (slow consumer, drain).
    pub closer: Arc<Notify>,
    /// True when this connection created the room, i.e. it is the first
    /// local connection for the conversation and the caller must request a
    /// bus subscription.
    pub first_in_conversation: bool,
}

/// Result of removing a connection.
pub struct Unregistration {
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    /// True when the room became empty and the caller must release the bus
    /// subscription.
    pub last_in_conversation: bool,
}

pub struct ConnectionHub {
    rooms: DashMap<Uuid, HashMap<Uuid, ConnectionHandle>>,
    index: DashMap<Uuid, (Uuid, Uuid)>,
    queue_depth: usize,
}

impl ConnectionHub {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            index: DashMap::new(),
            queue_depth,
        }
    }

    /// Add a connection to a conversation's room.
    pub fn register(&self, conversation_id: Uuid, connection_id: Uuid, user_id: Uuid) -> Registration {
        let (sender, receiver) = mpsc::channel(self.queue_depth);
        let closer = Arc::new(Notify::new());
        let handle = ConnectionHandle {
            user_id,
            sender,
            closer: closer.clone(),
            healthy: Arc::new(AtomicBool::new(true)),
        };

        let mut room = self.rooms.entry(conversation_id).or_default();
        let first_in_conversation = room.is_empty();
        room.insert(connection_id, handle);
        drop(room);

        self.index.insert(connection_id, (user_id, conversation_id));

        debug!(
            conversation_id = %conversation_id,
            connection_id = %connection_id,
            user_id = %user_id,
            "Connection registered"
        );

        Registration {
            receiver,
            closer,
            first_in_conversation,
        }
    }

    /// Remove a connection; reports whether its room emptied.
    pub fn unregister(&self, connection_id: Uuid) -> Option<Unregistration> {
        let (_, (user_id, conversation_id)) = self.index.remove(&connection_id)?;

        let mut last_in_conversation = false;
        if let Some(mut room) = self.rooms.get_mut(&conversation_id) {
            room.remove(&connection_id);
            last_in_conversation = room.is_empty();
        }
        if last_in_conversation {
            self.rooms
                .remove_if(&conversation_id, |_, room| room.is_empty());
        }

        debug!(
            conversation_id = %conversation_id,
            connection_id = %connection_id,
            "Connection unregistered"
        );

        Some(Unregistration {
            user_id,
            conversation_id,
            last_in_conversation,
        })
    }

    /// Enqueue an encoded event on every connection in the room, optionally
    /// skipping all of one user's connections. A full queue marks that
    /// connection unhealthy and requests its termination without affecting
    /// the rest of the room.
    pub fn broadcast(&self, conversation_id: Uuid, encoded: &str, exclude_user: Option<Uuid>) -> usize {
        let targets: Vec<(Uuid, ConnectionHandle)> = match self.rooms.get(&conversation_id) {
            Some(room) => room
                .iter()
                .filter(|(_, handle)| exclude_user != Some(handle.user_id))
                .map(|(id, handle)| (*id, handle.clone()))
                .collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for (connection_id, handle) in targets {
            if !handle.healthy.load(Ordering::Acquire) {
                continue;
            }
            match handle.sender.try_send(encoded.to_string()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        connection_id = %connection_id,
                        conversation_id = %conversation_id,
                        "Outbound queue full, closing slow consumer"
                    );
                    handle.healthy.store(false, Ordering::Release);
                    handle.closer.notify_one();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    handle.healthy.store(false, Ordering::Release);
                }
            }
        }
        delivered
    }

    /// Size of the local room.
    pub fn count(&self, conversation_id: Uuid) -> usize {
        self.rooms
            .get(&conversation_id)
            .map(|room| room.len())
            .unwrap_or(0)
    }

    /// Total live connections on this instance.
    pub fn total_connections(&self) -> usize {
        self.index.len()
    }

    /// Conversations with at least one local connection.
    pub fn active_conversations(&self) -> Vec<Uuid> {
        self.rooms.iter().map(|entry| *entry.key()).collect()
    }

    /// Request termination of every connection; used on drain.
    pub fn close_all(&self) {
        for room in self.rooms.iter() {
            for handle in room.values() {
                handle.closer.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn encoded() -> String {
        r#"{"type":"typing"}"#.to_string()
    }

    #[tokio::test]
    async fn test_register_unregister_room_lifecycle() {
        let hub = ConnectionHub::new(8);
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();

        let reg_a = hub.register(conv, conn_a, user);
        assert!(reg_a.first_in_conversation);

        let reg_b = hub.register(conv, conn_b, user);
        assert!(!reg_b.first_in_conversation);
        assert_eq!(hub.count(conv), 2);

        let out_a = hub.unregister(conn_a).unwrap();
        assert!(!out_a.last_in_conversation);

        let out_b = hub.unregister(conn_b).unwrap();
        assert!(out_b.last_in_conversation);
        assert_eq!(out_b.conversation_id, conv);
        assert_eq!(hub.count(conv), 0);

        // Unknown connection is a no-op.
        assert!(hub.unregister(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_members() {
        let hub = ConnectionHub::new(8);
        let conv = Uuid::new_v4();
        let mut reg_a = hub.register(conv, Uuid::new_v4(), Uuid::new_v4());
        let mut reg_b = hub.register(conv, Uuid::new_v4(), Uuid::new_v4());

        let delivered = hub.broadcast(conv, &encoded(), None);
        assert_eq!(delivered, 2);
        assert_ok!(reg_a.receiver.try_recv());
        assert_ok!(reg_b.receiver.try_recv());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_originator_connections() {
        let hub = ConnectionHub::new(8);
        let conv = Uuid::new_v4();
        let originator = Uuid::new_v4();

        let mut reg_orig = hub.register(conv, Uuid::new_v4(), originator);
        let mut reg_peer = hub.register(conv, Uuid::new_v4(), Uuid::new_v4());

        let delivered = hub.broadcast(conv, &encoded(), Some(originator));
        assert_eq!(delivered, 1);
        assert!(reg_orig.receiver.try_recv().is_err());
        assert!(reg_peer.receiver.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_slow_consumer_is_closed_without_affecting_peers() {
        let hub = ConnectionHub::new(2);
        let conv = Uuid::new_v4();

        let slow_reg = hub.register(conv, Uuid::new_v4(), Uuid::new_v4());
        let mut fast_reg = hub.register(conv, Uuid::new_v4(), Uuid::new_v4());

        // Saturate the slow consumer's queue (depth 2), then overflow it.
        for _ in 0..3 {
            hub.broadcast(conv, &encoded(), None);
        }

        // The fast consumer saw every event.
        let mut seen = 0;
        while fast_reg.receiver.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 3);

        // The close request is sticky: it is observed even though no task
        // was waiting when the queue overflowed.
        tokio::time::timeout(std::time::Duration::from_secs(1), slow_reg.closer.notified())
            .await
            .expect("slow consumer should be scheduled for termination");

        // Subsequent broadcasts skip the unhealthy connection entirely.
        let delivered = hub.broadcast(conv, &encoded(), None);
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn test_active_conversations_and_totals() {
        let hub = ConnectionHub::new(8);
        let conv_a = Uuid::new_v4();
        let conv_b = Uuid::new_v4();

        hub.register(conv_a, Uuid::new_v4(), Uuid::new_v4());
        hub.register(conv_b, Uuid::new_v4(), Uuid::new_v4());
        hub.register(conv_b, Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(hub.total_connections(), 3);
        let mut active = hub.active_conversations();
        active.sort();
        let mut expected = vec![conv_a, conv_b];
        expected.sort();
        assert_eq!(active, expected);
    }
}
