//! Scene synchronization hub.
//!
//! One task owns the session registry and every room. Sessions, the gallery
//! and the HTTP layer talk to it only through [`HubHandle`], which queues
//! commands on an unbounded channel; the hub applies them one at a time, so
//! registry reads are never torn and a room move can't interleave with a
//! broadcast.
//!
//! Delivery is enqueue-only. A session whose outbound queue is full is
//! dropped from the registry on the spot, which closes its queue and lets
//! its writer shut the socket. The broadcaster never waits on a client.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::messages::ServerMessage;
use crate::room::{Room, RoomId};
use crate::session::SessionId;

/// A serialized event, shared by every queue it is pushed onto.
pub type Outbound = Arc<str>;

enum Command {
    Register {
        id: SessionId,
        outbound: mpsc::Sender<Outbound>,
    },
    Unregister {
        id: SessionId,
    },
    Join {
        id: SessionId,
        room: RoomId,
        device_key: Option<String>,
    },
    Broadcast {
        room: RoomId,
        payload: Outbound,
    },
    RoomOf {
        id: SessionId,
        reply: oneshot::Sender<Option<RoomId>>,
    },
    Members {
        room: RoomId,
        reply: oneshot::Sender<Vec<SessionId>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub sessions: usize,
    pub rooms: usize,
}

#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl HubHandle {
    /// Admits a session into the unassigned room.
    pub fn register(&self, id: SessionId, outbound: mpsc::Sender<Outbound>) {
        self.send(Command::Register { id, outbound });
    }

    /// Removes a session. Unknown ids are ignored, so every task touching a
    /// session may call this.
    pub fn unregister(&self, id: SessionId) {
        self.send(Command::Unregister { id });
    }

    pub fn join(&self, id: SessionId, room: RoomId, device_key: Option<String>) {
        self.send(Command::Join {
            id,
            room,
            device_key,
        });
    }

    /// Fire-and-forget fan-out to everyone currently in `room`.
    pub fn broadcast(&self, room: RoomId, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(payload) => self.send(Command::Broadcast {
                room,
                payload: payload.into(),
            }),
            Err(err) => error!("failed to serialize broadcast for {room}: {err}"),
        }
    }

    pub async fn room_of(&self, id: SessionId) -> Option<RoomId> {
        self.ask(|reply| Command::RoomOf { id, reply })
            .await
            .flatten()
    }

    pub async fn members(&self, room: RoomId) -> Vec<SessionId> {
        self.ask(|reply| Command::Members { room, reply })
            .await
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> HubStats {
        self.ask(|reply| Command::Stats { reply })
            .await
            .unwrap_or_default()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("hub is not running; command dropped");
        }
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, answer) = oneshot::channel();
        self.send(build(reply));
        answer.await.ok()
    }
}

struct SessionEntry {
    outbound: mpsc::Sender<Outbound>,
    room: RoomId,
    device_key: Option<String>,
}

#[derive(Default)]
pub struct Hub {
    sessions: HashMap<SessionId, SessionEntry>,
    rooms: HashMap<RoomId, Room>,
}

impl Hub {
    /// Starts the hub loop on the current runtime. It runs until every
    /// handle has been dropped.
    pub fn spawn() -> HubHandle {
        let (commands, queue) = mpsc::unbounded_channel();
        tokio::spawn(Hub::default().run(queue));
        HubHandle { commands }
    }

    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Command>) {
        debug!("hub started");
        while let Some(command) = queue.recv().await {
            self.apply(command);
        }
        info!("hub stopped with {} sessions registered", self.sessions.len());
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register { id, outbound } => self.register(id, outbound),
            Command::Unregister { id } => self.unregister(id),
            Command::Join {
                id,
                room,
                device_key,
            } => self.join(id, room, device_key),
            Command::Broadcast { room, payload } => self.broadcast(room, &payload),
            Command::RoomOf { id, reply } => {
                let _ = reply.send(self.sessions.get(&id).map(|entry| entry.room));
            }
            Command::Members { room, reply } => {
                let members = self
                    .rooms
                    .get(&room)
                    .map(|room| room.members().collect())
                    .unwrap_or_default();
                let _ = reply.send(members);
            }
            Command::Stats { reply } => {
                let _ = reply.send(HubStats {
                    sessions: self.sessions.len(),
                    rooms: self.rooms.len(),
                });
            }
        }
    }

    fn register(&mut self, id: SessionId, outbound: mpsc::Sender<Outbound>) {
        if self.sessions.contains_key(&id) {
            warn!("session {id} registered twice; keeping the first registration");
            return;
        }
        self.sessions.insert(
            id,
            SessionEntry {
                outbound,
                room: RoomId::Unassigned,
                device_key: None,
            },
        );
        self.enter(id, RoomId::Unassigned);
        debug!("session {id} registered ({} total)", self.sessions.len());
    }

    fn unregister(&mut self, id: SessionId) {
        // Dropping the entry drops the only sender, which closes the queue.
        let Some(entry) = self.sessions.remove(&id) else {
            return;
        };
        self.leave(id, entry.room);
        match entry.device_key {
            Some(key) => info!("display {key} (session {id}) left {}", entry.room),
            None => debug!("session {id} left {}", entry.room),
        }
    }

    fn join(&mut self, id: SessionId, room: RoomId, device_key: Option<String>) {
        let Some(entry) = self.sessions.get_mut(&id) else {
            debug!("join for unknown session {id} ignored");
            return;
        };
        if device_key.is_some() {
            entry.device_key = device_key;
        }
        let previous = std::mem::replace(&mut entry.room, room);
        if previous == room {
            return;
        }
        self.leave(id, previous);
        self.enter(id, room);
        debug!("session {id} moved from {previous} to {room}");
    }

    fn broadcast(&mut self, room_id: RoomId, payload: &Outbound) {
        let Some(room) = self.rooms.get(&room_id) else {
            debug!("broadcast to empty room {room_id} dropped");
            return;
        };

        let mut delivered = 0usize;
        let mut evicted = Vec::new();
        for id in room.members() {
            let Some(entry) = self.sessions.get(&id) else {
                continue;
            };
            match entry.outbound.try_send(Arc::clone(payload)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("session {id} is not keeping up; disconnecting it");
                    evicted.push(id);
                }
                Err(TrySendError::Closed(_)) => evicted.push(id),
            }
        }
        debug!(
            "broadcast to {room_id}: {delivered} queued, {} evicted",
            evicted.len()
        );

        for id in evicted {
            self.unregister(id);
        }
    }

    fn enter(&mut self, id: SessionId, room: RoomId) {
        self.rooms.entry(room).or_default().add_member(id);
    }

    fn leave(&mut self, id: SessionId, room: RoomId) {
        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove_member(id);
            if members.is_empty() {
                self.rooms.remove(&room);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn session(hub: &HubHandle, capacity: usize) -> (SessionId, mpsc::Receiver<Outbound>) {
        let id = SessionId::new();
        let (tx, rx) = mpsc::channel(capacity);
        hub.register(id, tx);
        (id, rx)
    }

    fn reset() -> ServerMessage {
        ServerMessage::SceneReset { hard: true }
    }

    #[tokio::test]
    async fn admission_lands_in_the_unassigned_room() {
        let hub = Hub::spawn();
        let (id, _rx) = session(&hub, 4);
        assert_eq!(hub.room_of(id).await, Some(RoomId::Unassigned));
        assert_eq!(hub.members(RoomId::Unassigned).await, vec![id]);
        assert_eq!(
            hub.stats().await,
            HubStats {
                sessions: 1,
                rooms: 1
            }
        );
    }

    #[tokio::test]
    async fn join_moves_a_session_to_exactly_one_room() {
        let hub = Hub::spawn();
        let (id, _rx) = session(&hub, 4);
        hub.join(id, RoomId::scene(1), Some("east".into()));
        assert_eq!(hub.room_of(id).await, Some(RoomId::scene(1)));
        assert!(hub.members(RoomId::Unassigned).await.is_empty());

        hub.join(id, RoomId::scene(2), None);
        assert_eq!(hub.room_of(id).await, Some(RoomId::scene(2)));
        assert!(hub.members(RoomId::scene(1)).await.is_empty());
        assert_eq!(hub.members(RoomId::scene(2)).await, vec![id]);
        // Emptied rooms are dropped.
        assert_eq!(hub.stats().await.rooms, 1);
    }

    #[tokio::test]
    async fn broadcast_stays_inside_its_room() {
        let hub = Hub::spawn();
        let (a, mut rx_a) = session(&hub, 4);
        let (b, mut rx_b) = session(&hub, 4);
        let (_idle, mut rx_idle) = session(&hub, 4);
        hub.join(a, RoomId::scene(1), None);
        hub.join(b, RoomId::scene(2), None);

        hub.broadcast(RoomId::scene(1), &reset());
        hub.stats().await;

        let payload = rx_a.try_recv().unwrap();
        assert_eq!(&*payload, r#"{"type":"scene.reset","data":{"hard":true}}"#);
        assert_eq!(rx_b.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(rx_idle.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn broadcasts_arrive_in_order() {
        let hub = Hub::spawn();
        let (id, mut rx) = session(&hub, 8);
        hub.join(id, RoomId::scene(5), None);
        for artwork_id in 1..=3 {
            hub.broadcast(RoomId::scene(5), &ServerMessage::EntityDelete { artwork_id });
        }
        hub.stats().await;
        for artwork_id in 1..=3 {
            let expected = serde_json::to_string(&ServerMessage::EntityDelete { artwork_id }).unwrap();
            assert_eq!(&*rx.try_recv().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn a_full_queue_disconnects_only_that_session() {
        let hub = Hub::spawn();
        let (slow, mut rx_slow) = session(&hub, 1);
        let (fast, mut rx_fast) = session(&hub, 8);
        hub.join(slow, RoomId::scene(1), None);
        hub.join(fast, RoomId::scene(1), None);

        hub.broadcast(RoomId::scene(1), &reset());
        hub.broadcast(RoomId::scene(1), &reset());
        hub.broadcast(RoomId::scene(1), &reset());

        assert_eq!(hub.room_of(slow).await, None);
        assert_eq!(hub.members(RoomId::scene(1)).await, vec![fast]);
        for _ in 0..3 {
            assert!(rx_fast.try_recv().is_ok());
        }
        // The slow session keeps what was queued, then sees its queue closed.
        assert!(rx_slow.recv().await.is_some());
        assert!(rx_slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn sessions_with_dropped_receivers_are_pruned_on_broadcast() {
        let hub = Hub::spawn();
        let (gone, rx) = session(&hub, 4);
        hub.join(gone, RoomId::scene(9), None);
        drop(rx);
        hub.broadcast(RoomId::scene(9), &reset());
        assert_eq!(hub.stats().await, HubStats::default());
    }

    #[tokio::test]
    async fn missing_rooms_and_repeated_unregisters_are_harmless() {
        let hub = Hub::spawn();
        let (id, mut rx) = session(&hub, 4);
        hub.broadcast(RoomId::scene(404), &reset());
        hub.unregister(id);
        hub.unregister(id);
        hub.join(id, RoomId::scene(1), None);
        assert_eq!(hub.stats().await, HubStats::default());
        assert!(rx.recv().await.is_none());
    }
}
