use crate::event::CallEvent;
use crate::store::Role;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

pub type ConnectionId = Uuid;
pub type EventSender = mpsc::UnboundedSender<CallEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<CallEvent>;

/// Room-scoped publish/subscribe hub.
///
/// All provider webhooks and client actions funnel through `publish`, and
/// each connection gets its own ordered mpsc queue, so subscribers of a
/// call room observe that call's events in the order the relay received
/// them. Cross-room ordering is not guaranteed and not needed.
#[derive(Default)]
pub struct EventHub {
    rooms: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    connections: RwLock<HashMap<ConnectionId, EventSender>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_room(call_id: Uuid) -> String {
        format!("call:{}", call_id)
    }

    pub fn role_room(role: Role) -> String {
        let name = match role {
            Role::Agent => "agent",
            Role::Supervisor => "supervisor",
            Role::Admin => "admin",
        };
        format!("role:{}", name)
    }

    /// Attach a connection and obtain its event queue.
    pub async fn register(&self, connection: ConnectionId) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().await.insert(connection, tx);
        rx
    }

    /// Detach a connection and drop every room membership it held. This is
    /// the single cleanup point for disconnects; no orphaned subscriptions
    /// survive it.
    pub async fn unregister(&self, connection: ConnectionId) {
        self.connections.write().await.remove(&connection);
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, members| {
            members.remove(&connection);
            !members.is_empty()
        });
    }

    pub async fn subscribe(&self, connection: ConnectionId, room: &str) {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection);
    }

    pub async fn unsubscribe(&self, connection: ConnectionId, room: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&connection);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    pub async fn is_member(&self, connection: ConnectionId, room: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|m| m.contains(&connection))
            .unwrap_or(false)
    }

    /// Fan an event out to every member of a room. Returns the number of
    /// connections the event was queued for.
    pub async fn publish(&self, room: &str, event: CallEvent) -> usize {
        let members: Vec<ConnectionId> = match self.rooms.read().await.get(room) {
            Some(members) => members.iter().copied().collect(),
            None => {
                debug!(room = %room, "publish to empty room");
                return 0;
            }
        };
        let connections = self.connections.read().await;
        let mut delivered = 0;
        for member in members {
            if let Some(tx) = connections.get(&member) {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Publish to several rooms, deduplicating connections that sit in
    /// more than one of them.
    pub async fn publish_many(&self, rooms: &[String], event: CallEvent) -> usize {
        let mut targets: HashSet<ConnectionId> = HashSet::new();
        {
            let room_map = self.rooms.read().await;
            for room in rooms {
                if let Some(members) = room_map.get(room) {
                    targets.extend(members.iter().copied());
                }
            }
        }
        let connections = self.connections.read().await;
        let mut delivered = 0;
        for member in targets {
            if let Some(tx) = connections.get(&member) {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}
