//! Realtime channel registry: which live connections belong to which user,
//! and which delivery addresses each connection listens on.
//!
//! A connection is registered only after its credential was verified, and is
//! subscribed to its owner's personal address at that moment. Room addresses
//! are joined explicitly or pushed on invite. Delivery never queues: an
//! address with no live subscriber simply drops the event.

use crate::models::{Message, RoomId, UserId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Every connection of one user
    Personal(UserId),
    Room(RoomId),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomSummary {
    pub id: RoomId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviterSummary {
    pub id: UserId,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomInviteEvent {
    pub room: RoomSummary,
    pub inviter: InviterSummary,
}

/// Events pushed to clients, framed as `{"event": .., "data": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "new_message")]
    NewMessage(Message),
    #[serde(rename = "typing")]
    Typing(TypingEvent),
    #[serde(rename = "room-invite")]
    RoomInvite(RoomInviteEvent),
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Subscribed to the personal address only
    Authenticated,
    /// Also subscribed to these rooms
    Joined(Vec<RoomId>),
    Closed,
}

/// The registry's side of a registered connection. The socket task drains
/// `events` and writes them out.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
}

struct Connection {
    user_id: UserId,
    sender: mpsc::UnboundedSender<ServerEvent>,
    rooms: HashSet<RoomId>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    subscribers: HashMap<Address, HashSet<ConnectionId>>,
}

impl Inner {
    fn subscribe(&mut self, address: Address, connection_id: ConnectionId) {
        self.subscribers
            .entry(address)
            .or_default()
            .insert(connection_id);
    }

    fn unsubscribe(&mut self, address: &Address, connection_id: &ConnectionId) {
        if let Some(ids) = self.subscribers.get_mut(address) {
            ids.remove(connection_id);
            if ids.is_empty() {
                self.subscribers.remove(address);
            }
        }
    }

    fn join(&mut self, connection_id: ConnectionId, room_id: &str) -> bool {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return false;
        };
        if connection.rooms.insert(room_id.to_string()) {
            self.subscribe(Address::Room(room_id.to_string()), connection_id);
        }
        true
    }

    fn leave(&mut self, connection_id: ConnectionId, room_id: &str) -> bool {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return false;
        };
        let removed = connection.rooms.remove(room_id);
        if removed {
            self.unsubscribe(&Address::Room(room_id.to_string()), &connection_id);
        }
        removed
    }

    fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.subscribers
            .get(&Address::Personal(user_id.to_string()))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Address-to-connection map shared by the socket handlers and the fan-out.
///
/// One reader-writer lock guards the whole map, so an emission always sees a
/// complete subscriber list.
#[derive(Default)]
pub struct ChannelRegistry {
    inner: RwLock<Inner>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection for `user_id` and subscribe it to
    /// the user's personal address.
    pub async fn connect(&self, user_id: &str) -> ConnectionHandle {
        let (sender, events) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let mut inner = self.inner.write().await;
        inner.connections.insert(
            id,
            Connection {
                user_id: user_id.to_string(),
                sender,
                rooms: HashSet::new(),
            },
        );
        inner.subscribe(Address::Personal(user_id.to_string()), id);
        debug!(connection = %id, user = %user_id, "Connection registered");

        ConnectionHandle {
            id,
            user_id: user_id.to_string(),
            events,
        }
    }

    /// Subscribe one connection to a room address. Returns false for an
    /// unknown connection.
    pub async fn join(&self, connection_id: ConnectionId, room_id: &str) -> bool {
        self.inner.write().await.join(connection_id, room_id)
    }

    pub async fn leave(&self, connection_id: ConnectionId, room_id: &str) -> bool {
        self.inner.write().await.leave(connection_id, room_id)
    }

    /// Drop a connection and every subscription it held.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let mut inner = self.inner.write().await;
        let Some(connection) = inner.connections.remove(&connection_id) else {
            return;
        };

        inner.unsubscribe(&Address::Personal(connection.user_id.clone()), &connection_id);
        for room_id in connection.rooms {
            inner.unsubscribe(&Address::Room(room_id), &connection_id);
        }
        debug!(connection = %connection_id, user = %connection.user_id, "Connection closed");
    }

    /// Subscribe every live connection of `user_id` to a room. Returns the
    /// number of connections subscribed.
    pub async fn subscribe_user(&self, user_id: &str, room_id: &str) -> usize {
        let mut inner = self.inner.write().await;
        let ids = inner.connections_of(user_id);
        ids.into_iter()
            .filter(|id| inner.join(*id, room_id))
            .count()
    }

    /// Unsubscribe every live connection of `user_id` from a room.
    pub async fn unsubscribe_user(&self, user_id: &str, room_id: &str) -> usize {
        let mut inner = self.inner.write().await;
        let ids = inner.connections_of(user_id);
        ids.into_iter()
            .filter(|id| inner.leave(*id, room_id))
            .count()
    }

    /// Addresses the user currently listens on: always the personal address,
    /// plus any room a live connection of theirs has joined.
    pub async fn addresses_for(&self, user_id: &str) -> HashSet<Address> {
        let inner = self.inner.read().await;
        let mut addresses = HashSet::from([Address::Personal(user_id.to_string())]);
        for id in inner.connections_of(user_id) {
            if let Some(connection) = inner.connections.get(&id) {
                addresses.extend(connection.rooms.iter().cloned().map(Address::Room));
            }
        }
        addresses
    }

    pub async fn state(&self, connection_id: ConnectionId) -> ConnectionState {
        let inner = self.inner.read().await;
        match inner.connections.get(&connection_id) {
            None => ConnectionState::Closed,
            Some(connection) if connection.rooms.is_empty() => ConnectionState::Authenticated,
            Some(connection) => {
                let mut rooms: Vec<RoomId> = connection.rooms.iter().cloned().collect();
                rooms.sort();
                ConnectionState::Joined(rooms)
            }
        }
    }

    /// Emit to one connection only, e.g. to answer a refused request.
    pub async fn send_to(&self, connection_id: ConnectionId, event: &ServerEvent) -> bool {
        let inner = self.inner.read().await;
        inner
            .connections
            .get(&connection_id)
            .is_some_and(|connection| connection.sender.send(event.clone()).is_ok())
    }

    /// Emit to every live connection subscribed to `address`. Returns how
    /// many connections accepted the event; zero is normal for offline users.
    pub async fn deliver(&self, address: &Address, event: &ServerEvent) -> usize {
        self.deliver_matching(address, event, |_| true).await
    }

    /// Like [`deliver`](Self::deliver), but only to connections owned by a
    /// user in `users`. A room address outlives membership until the removal
    /// event arrives, so room emissions pass the current member list here.
    pub async fn deliver_to_users(
        &self,
        address: &Address,
        event: &ServerEvent,
        users: &HashSet<UserId>,
    ) -> usize {
        self.deliver_matching(address, event, |user_id| users.contains(user_id))
            .await
    }

    async fn deliver_matching(
        &self,
        address: &Address,
        event: &ServerEvent,
        keep: impl Fn(&str) -> bool,
    ) -> usize {
        let inner = self.inner.read().await;
        let Some(ids) = inner.subscribers.get(address) else {
            debug!(?address, "No live subscribers, dropping event");
            return 0;
        };

        let mut delivered = 0;
        for id in ids {
            let Some(connection) = inner.connections.get(id) else {
                continue;
            };
            if !keep(&connection.user_id) {
                continue;
            }
            if connection.sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(connection = %id, "Connection gone, event dropped");
            }
        }
        delivered
    }
}
