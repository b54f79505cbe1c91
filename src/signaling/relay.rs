use super::{Deliver, SignalMessage, SignalingChannel, Subscribers};
use crate::error::SignalingError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Звонок только на двоих
pub const ROOM_CAPACITY: usize = 2;

pub type Route = Arc<dyn Deliver>;

struct Member {
    user_id: String,
    route: Route,
}

#[derive(Default)]
struct Room {
    members: Vec<Member>,
}

impl Room {
    fn others<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a Member> + 'a {
        self.members.iter().filter(move |m| m.user_id != user_id)
    }

    fn contains(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }
}

/// Ретранслятор комнат: владеет списком участников и пересылает
/// сигнальные сообщения второму участнику. Медиа не касается.
#[derive(Default)]
pub struct Relay {
    rooms: Mutex<HashMap<String, Room>>,
}

impl Relay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Обработка сообщения от клиента `sender`, ответы уходят через `route`
    pub fn handle(
        &self,
        sender: &str,
        route: &Route,
        message: SignalMessage,
    ) -> Result<(), SignalingError> {
        match message {
            SignalMessage::Join { room_id, user_id } => self.join(&room_id, &user_id, route),
            SignalMessage::ParticipantJoined { .. } => Err(SignalingError::Unrecognized(
                "call:participant is relay-originated".into(),
            )),
            SignalMessage::End { room_id, user_id } => {
                self.forward(sender, SignalMessage::End {
                    room_id: room_id.clone(),
                    user_id,
                });
                self.leave(&room_id, sender);
                Ok(())
            }
            other => {
                self.forward(sender, other);
                Ok(())
            }
        }
    }

    fn join(&self, room_id: &str, user_id: &str, route: &Route) -> Result<(), SignalingError> {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(room_id.to_string()).or_default();

        if let Some(existing) = room.members.iter_mut().find(|m| m.user_id == user_id) {
            debug!("User {} rejoined room {}, replacing route", user_id, room_id);
            existing.route = route.clone();
        } else if room.members.len() >= ROOM_CAPACITY {
            warn!("Room {} is full, rejecting {}", room_id, user_id);
            return Err(SignalingError::RoomFull(room_id.to_string()));
        } else {
            room.members.push(Member {
                user_id: user_id.to_string(),
                route: route.clone(),
            });
        }

        info!(
            "User {} joined room {} ({} members)",
            user_id,
            room_id,
            room.members.len()
        );

        for other in room.others(user_id) {
            // уведомляем остальных о новом участнике
            other.route.deliver(SignalMessage::ParticipantJoined {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
            // а новому сообщаем, кто уже в комнате
            route.deliver(SignalMessage::ParticipantJoined {
                room_id: room_id.to_string(),
                user_id: other.user_id.clone(),
            });
        }
        Ok(())
    }

    fn forward(&self, sender: &str, message: SignalMessage) {
        let rooms = self.rooms.lock();
        let Some(room) = rooms.get(message.room_id()) else {
            debug!(
                "Dropping {} for unknown room {}",
                message.event_name(),
                message.room_id()
            );
            return;
        };
        if !room.contains(sender) {
            warn!(
                "Dropping {} from {} who is not in room {}",
                message.event_name(),
                sender,
                message.room_id()
            );
            return;
        }
        for other in room.others(sender) {
            other.route.deliver(message.clone());
        }
    }

    pub fn leave(&self, room_id: &str, user_id: &str) {
        let mut rooms = self.rooms.lock();
        if let Some(room) = rooms.get_mut(room_id) {
            room.members.retain(|m| m.user_id != user_id);
            if room.members.is_empty() {
                debug!("Room {} is empty, removing", room_id);
                rooms.remove(room_id);
            }
        }
    }

    /// Обрыв транспорта клиента: собеседник получает `endCall`.
    /// Если участник уже вошёл заново через другой `route`, ничего не делает.
    pub fn disconnect(&self, room_id: &str, user_id: &str, route: &Route) {
        let current = self.rooms.lock().get(room_id).and_then(|room| {
            room.members
                .iter()
                .find(|m| m.user_id == user_id)
                .map(|m| Arc::ptr_eq(&m.route, route))
        });
        if current != Some(true) {
            debug!(
                "Stale connection of {} closed, room {} keeps the live one",
                user_id, room_id
            );
            return;
        }
        self.forward(user_id, SignalMessage::End {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        });
        self.leave(room_id, user_id);
    }

    pub fn members(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .lock()
            .get(room_id)
            .map(|r| r.members.iter().map(|m| m.user_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }
}

/// Клиент ретранслятора в том же процессе
pub struct LocalSignaling {
    relay: Arc<Relay>,
    user_id: String,
    subscribers: Arc<Subscribers>,
}

impl LocalSignaling {
    pub fn connect(relay: &Arc<Relay>, user_id: &str) -> Arc<Self> {
        Arc::new(Self {
            relay: relay.clone(),
            user_id: user_id.to_string(),
            subscribers: Arc::new(Subscribers::default()),
        })
    }
}

#[async_trait]
impl SignalingChannel for LocalSignaling {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalMessage> {
        self.subscribers.subscribe()
    }

    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        debug!("{} -> relay: {}", self.user_id, message.event_name());
        let route: Route = self.subscribers.clone();
        self.relay.handle(&self.user_id, &route, message)
    }

    async fn leave(&self, room_id: &str) {
        self.relay.leave(room_id, &self.user_id);
    }
}
