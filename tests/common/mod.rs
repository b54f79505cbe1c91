#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use ssc_call::media::VirtualDevices;
use ssc_call::peer::{LoopbackConnector, SdpType, SessionDescription};
use ssc_call::signaling::Subscribers;
use ssc_call::{
    CallConfig, CallDeps, CallOptions, CallSession, Role, RoleAssignment, SessionEvent,
    SessionState, SignalMessage, SignalingChannel, SignalingError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const ROOM: &str = "r1";
pub const LOCAL: &str = "alice";
pub const REMOTE: &str = "bob";

/// Сигнальный канал без ретранслятора: тест сам подаёт входящие
/// сообщения и смотрит, что отправила сессия
#[derive(Default)]
pub struct ScriptedSignaling {
    subscribers: Subscribers,
    sent: Mutex<Vec<SignalMessage>>,
    left: AtomicUsize,
}

impl ScriptedSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inject(&self, message: SignalMessage) {
        self.subscribers.dispatch(message);
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.event_name() == event)
            .count()
    }

    pub fn left(&self) -> usize {
        self.left.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for ScriptedSignaling {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalMessage> {
        self.subscribers.subscribe()
    }

    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.sent.lock().push(message);
        Ok(())
    }

    async fn leave(&self, _room_id: &str) {
        self.left.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub session: CallSession,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub signaling: Arc<ScriptedSignaling>,
    pub devices: Arc<VirtualDevices>,
    pub connector: Arc<LoopbackConnector>,
}

impl Harness {
    pub fn start(role: Role, config: CallConfig) -> Self {
        Self::start_with(role, config, VirtualDevices::new())
    }

    pub fn start_with(role: Role, config: CallConfig, devices: VirtualDevices) -> Self {
        let signaling = ScriptedSignaling::new();
        let devices = Arc::new(devices);
        let connector = LoopbackConnector::new();
        let deps = CallDeps {
            signaling: signaling.clone(),
            devices: devices.clone(),
            connector: connector.clone(),
        };
        let options = CallOptions::new(ROOM, LOCAL, RoleAssignment::Fixed(role));
        let (session, events) =
            CallSession::start(config, deps, options).expect("session should start");
        Self {
            session,
            events,
            signaling,
            devices,
            connector,
        }
    }

    /// Инициатор доходит до Connected: собеседник объявлен и ответил
    pub async fn connect_as_initiator(&mut self) -> Vec<SessionEvent> {
        let mut seen = wait_for_state(&mut self.events, SessionState::WaitingForPeer).await;
        self.signaling.inject(participant(REMOTE));
        seen.extend(wait_for_state(&mut self.events, SessionState::Offering).await);
        self.signaling.inject(answer_from(REMOTE));
        seen.extend(wait_for_state(&mut self.events, SessionState::Connected).await);
        seen
    }
}

pub fn test_config() -> CallConfig {
    CallConfig {
        grace_period_ms: 2_000,
        max_reconnect_attempts: 2,
        ..CallConfig::default()
    }
}

pub fn remote_sdp(sdp_type: SdpType) -> SessionDescription {
    SessionDescription::new(
        sdp_type,
        "v=0\r\no=- bob 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
         m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=msid:bob-stream bob-audio\r\n\
         m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:bob-stream bob-video\r\n",
    )
}

pub fn participant(user_id: &str) -> SignalMessage {
    SignalMessage::ParticipantJoined {
        room_id: ROOM.into(),
        user_id: user_id.into(),
    }
}

pub fn offer_from(user_id: &str) -> SignalMessage {
    SignalMessage::Offer {
        room_id: ROOM.into(),
        sdp: remote_sdp(SdpType::Offer),
        from: user_id.into(),
    }
}

pub fn answer_from(user_id: &str) -> SignalMessage {
    SignalMessage::Answer {
        room_id: ROOM.into(),
        sdp: remote_sdp(SdpType::Answer),
        from: user_id.into(),
    }
}

pub fn end_from(user_id: &str) -> SignalMessage {
    SignalMessage::End {
        room_id: ROOM.into(),
        user_id: user_id.into(),
    }
}

/// Читает события, пока не встретится подходящее; возвращает все прочитанные
pub async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, pred: F) -> Vec<SessionEvent>
where
    F: Fn(&SessionEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(120), events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session event stream closed");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

pub async fn wait_for_state(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    state: SessionState,
) -> Vec<SessionEvent> {
    wait_for(events, |e| matches!(e, SessionEvent::StateChanged { to, .. } if *to == state)).await
}

/// Даёт actor'у разобрать всё, что уже лежит в очередях
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub fn states(events: &[SessionEvent]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

/// Все события, пришедшие без ожидания
pub fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
