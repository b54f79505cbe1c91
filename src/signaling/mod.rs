//! Сигнальный канал: типизированные сообщения звонка и транспорт комнаты.
//!
//! Канал только пересылает сигнальные сообщения между участниками комнаты,
//! медиа через него никогда не идёт.

pub mod relay;
pub mod server;
pub mod websocket;

use crate::error::SignalingError;
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use relay::{LocalSignaling, Relay};
pub use server::serve_ws;
pub use websocket::WsSignaling;

const KNOWN_EVENTS: [&str; 6] = [
    "call:join",
    "call:participant",
    "call:offer",
    "call:answer",
    "call:ice-candidate",
    "endCall",
];

/// Сообщение сигнального протокола. На проводе:
/// `{"event": "call:offer", "data": {"roomId": ..., "offer": ..., "from": ...}}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum SignalMessage {
    #[serde(rename = "call:join", rename_all = "camelCase")]
    Join { room_id: String, user_id: String },

    #[serde(rename = "call:participant", rename_all = "camelCase")]
    ParticipantJoined { room_id: String, user_id: String },

    #[serde(rename = "call:offer", rename_all = "camelCase")]
    Offer {
        room_id: String,
        #[serde(rename = "offer")]
        sdp: SessionDescription,
        from: String,
    },

    #[serde(rename = "call:answer", rename_all = "camelCase")]
    Answer {
        room_id: String,
        #[serde(rename = "answer")]
        sdp: SessionDescription,
        from: String,
    },

    #[serde(rename = "call:ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        room_id: String,
        candidate: IceCandidate,
    },

    #[serde(rename = "endCall", rename_all = "camelCase")]
    End { room_id: String, user_id: String },
}

impl SignalMessage {
    pub fn room_id(&self) -> &str {
        match self {
            SignalMessage::Join { room_id, .. }
            | SignalMessage::ParticipantJoined { room_id, .. }
            | SignalMessage::Offer { room_id, .. }
            | SignalMessage::Answer { room_id, .. }
            | SignalMessage::IceCandidate { room_id, .. }
            | SignalMessage::End { room_id, .. } => room_id,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            SignalMessage::Join { .. } => "call:join",
            SignalMessage::ParticipantJoined { .. } => "call:participant",
            SignalMessage::Offer { .. } => "call:offer",
            SignalMessage::Answer { .. } => "call:answer",
            SignalMessage::IceCandidate { .. } => "call:ice-candidate",
            SignalMessage::End { .. } => "endCall",
        }
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    /// Разбор текстового кадра. Неизвестное событие и битый payload
    /// различаются, чтобы в логах было видно, что именно пришло.
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))?;
        let event = value
            .get("event")
            .and_then(|e| e.as_str())
            .ok_or_else(|| SignalingError::Malformed("missing event name".into()))?;
        if !KNOWN_EVENTS.contains(&event) {
            return Err(SignalingError::Unrecognized(event.to_string()));
        }
        serde_json::from_value(value).map_err(|e| SignalingError::Malformed(e.to_string()))
    }
}

/// Транспорт сигнальных сообщений, привязанный к комнате.
///
/// Реализация передаётся в сессию явно; глобальных подключений нет.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Новый подписчик на входящие сообщения
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalMessage>;

    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;

    /// Выход из комнаты без уведомления собеседника
    async fn leave(&self, room_id: &str);
}

/// Получатель сообщений, которые раздаёт ретранслятор
pub trait Deliver: Send + Sync {
    fn deliver(&self, message: SignalMessage);
}

impl Deliver for mpsc::UnboundedSender<SignalMessage> {
    fn deliver(&self, message: SignalMessage) {
        let _ = self.send(message);
    }
}

/// Рассылка входящих сообщений всем живым подписчикам
#[derive(Default)]
pub struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<SignalMessage>>>,
}

impl Subscribers {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    pub fn dispatch(&self, message: SignalMessage) {
        self.senders
            .lock()
            .retain(|tx| tx.send(message.clone()).is_ok());
    }

    /// Закрывает все подписки: получатели увидят конец потока
    pub fn close(&self) {
        self.senders.lock().clear();
    }
}

impl Deliver for Subscribers {
    fn deliver(&self, message: SignalMessage) {
        self.dispatch(message);
    }
}
