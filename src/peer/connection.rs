use crate::error::NegotiationError;
use crate::media::{MediaHandle, MediaTrack};
use crate::peer::types::{
    IceCandidate, PeerConnectionState, PeerEvent, RemoteTrack, SdpType, SessionDescription,
    SignalingState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Прямое медиа-соединение с собеседником (обёртка над конкретным стеком)
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), NegotiationError>;
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    /// Замена исходящего видео на существующем sender, без renegotiation
    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), NegotiationError>;
    async fn has_remote_description(&self) -> bool;
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> PeerConnectionState;
    async fn close(&self);
}

/// Создаёт соединения с уже прикреплёнными локальными треками
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        local: &MediaHandle,
        events: EventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

/// Куда backend пишет события. После закрытия события глотаются.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PeerEvent>,
    closed: Arc<AtomicBool>,
    remote_stream: Arc<Mutex<Vec<RemoteTrack>>>,
}

impl EventSink {
    fn new(tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            remote_stream: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn ice_candidate(&self, candidate: IceCandidate) {
        self.emit(PeerEvent::IceCandidate(candidate));
    }

    pub fn state_changed(&self, state: PeerConnectionState) {
        self.emit(PeerEvent::StateChanged(state));
    }

    /// Добавляет трек в накопительный удалённый поток
    pub fn remote_track(&self, track: RemoteTrack) {
        if self.is_closed() {
            return;
        }
        {
            let mut stream = self.remote_stream.lock();
            if stream.iter().any(|t| t.id == track.id) {
                return;
            }
            stream.push(track.clone());
        }
        self.emit(PeerEvent::RemoteTrack(track));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: PeerEvent) {
        if self.is_closed() {
            return;
        }
        let _ = self.tx.send(event);
    }
}

/// Менеджер соединения: проверяет состояние согласования перед каждым
/// шагом, чтобы поздние и повторные сигналы отклонялись одинаково
/// для любого backend.
pub struct PeerConnectionManager {
    conn: Arc<dyn PeerConnection>,
    sink: EventSink,
}

impl PeerConnectionManager {
    pub async fn create(
        connector: &dyn PeerConnector,
        local: &MediaHandle,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), NegotiationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        let conn = connector.connect(local, sink.clone()).await?;
        info!(
            "Peer connection created with {} local tracks",
            local.live_tracks()
        );
        Ok((Self { conn, sink }, rx))
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.sink.is_closed() {
            return Err(NegotiationError::InvalidState("connection is closed".into()));
        }
        Ok(())
    }

    fn expect_signaling(&self, expected: SignalingState, op: &str) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let current = self.conn.signaling_state();
        if current != expected {
            return Err(NegotiationError::InvalidState(format!(
                "{op} requires {expected:?}, connection is {current:?}"
            )));
        }
        Ok(())
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.expect_signaling(SignalingState::Stable, "create_offer")?;
        self.conn.create_offer().await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.expect_signaling(SignalingState::HaveRemoteOffer, "create_answer")?;
        self.conn.create_answer().await
    }

    pub async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let expected = match desc.sdp_type {
            SdpType::Offer => SignalingState::Stable,
            SdpType::Answer => SignalingState::HaveRemoteOffer,
        };
        self.expect_signaling(expected, "set_local_description")?;
        self.conn.set_local_description(desc).await
    }

    pub async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let expected = match desc.sdp_type {
            SdpType::Offer => SignalingState::Stable,
            SdpType::Answer => SignalingState::HaveLocalOffer,
        };
        self.expect_signaling(expected, "set_remote_description")?;
        self.conn.set_remote_description(desc).await
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if !self.conn.has_remote_description().await {
            return Err(NegotiationError::InvalidState(
                "remote description is not set".into(),
            ));
        }
        self.conn.add_ice_candidate(candidate).await
    }

    pub async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.conn.replace_video_track(track).await
    }

    /// Можно ли сейчас применить удалённый offer
    pub fn can_accept_offer(&self) -> bool {
        !self.sink.is_closed() && self.conn.signaling_state() == SignalingState::Stable
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        if self.sink.is_closed() {
            return PeerConnectionState::Closed;
        }
        self.conn.connection_state()
    }

    pub fn remote_stream(&self) -> Vec<RemoteTrack> {
        self.sink.remote_stream.lock().clone()
    }

    /// Закрывает соединение; повторный вызов ничего не делает
    pub async fn close(&self) {
        if self.sink.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing peer connection");
        self.conn.close().await;
    }
}
