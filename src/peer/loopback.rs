//! Соединение без сети: моделирует offer/answer и состояния ICE.
//! Используется в тестах и для прогона сессии без медиастека.

use super::connection::{EventSink, PeerConnection, PeerConnector};
use super::types::{
    IceCandidate, PeerConnectionState, RemoteTrack, SdpType, SessionDescription, SignalingState,
};
use crate::error::NegotiationError;
use crate::media::{MediaHandle, MediaTrack, TrackKind};
use crate::utils::random_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub struct LoopbackConnector {
    peers: Mutex<Vec<Arc<LoopbackPeer>>>,
    auto_connect: AtomicBool,
}

impl LoopbackConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(Vec::new()),
            auto_connect: AtomicBool::new(true),
        })
    }

    /// Соединения остаются в Connecting, пока тест не сменит состояние сам
    pub fn set_auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        self.peers.lock().clone()
    }

    pub fn last_peer(&self) -> Option<Arc<LoopbackPeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(
        &self,
        local: &MediaHandle,
        events: EventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let peer = Arc::new(LoopbackPeer {
            id: random_id(),
            stream_id: local.stream_id.clone(),
            sink: events,
            auto_connect: self.auto_connect.load(Ordering::SeqCst),
            close_count: AtomicUsize::new(0),
            state: Mutex::new(LoopbackState {
                signaling: SignalingState::Stable,
                connection: PeerConnectionState::New,
                local: None,
                remote: None,
                audio_id: local.audio.id().to_string(),
                video_id: local.video.as_ref().map(|v| v.id().to_string()),
                applied_candidates: Vec::new(),
                video_replacements: 0,
            }),
        });
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

struct LoopbackState {
    signaling: SignalingState,
    connection: PeerConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    audio_id: String,
    video_id: Option<String>,
    applied_candidates: Vec<IceCandidate>,
    video_replacements: usize,
}

pub struct LoopbackPeer {
    id: String,
    stream_id: String,
    sink: EventSink,
    auto_connect: bool,
    close_count: AtomicUsize,
    state: Mutex<LoopbackState>,
}

impl LoopbackPeer {
    /// Имитация события ICE (обрыв, восстановление)
    pub fn force_state(&self, state: PeerConnectionState) {
        self.state.lock().connection = state;
        self.sink.state_changed(state);
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn video_replacements(&self) -> usize {
        self.state.lock().video_replacements
    }

    pub fn video_track_id(&self) -> Option<String> {
        self.state.lock().video_id.clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn build_sdp(&self, state: &LoopbackState) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.id
        );
        sdp.push_str(&format!(
            "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=msid:{} {}\r\n",
            self.stream_id, state.audio_id
        ));
        if let Some(video_id) = &state.video_id {
            sdp.push_str(&format!(
                "m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:{} {}\r\n",
                self.stream_id, video_id
            ));
        }
        sdp
    }

    /// Треки из строк `m=`/`a=msid:` удалённого описания
    fn parse_tracks(sdp: &str) -> Vec<RemoteTrack> {
        let mut tracks = Vec::new();
        let mut kind = None;
        for line in sdp.lines() {
            if let Some(media) = line.strip_prefix("m=") {
                kind = match media.split_whitespace().next() {
                    Some("audio") => Some(TrackKind::Audio),
                    Some("video") => Some(TrackKind::Video),
                    _ => None,
                };
            } else if let Some(msid) = line.strip_prefix("a=msid:") {
                let mut parts = msid.split_whitespace();
                if let (Some(kind), Some(stream_id), Some(id)) = (kind, parts.next(), parts.next())
                {
                    tracks.push(RemoteTrack {
                        id: id.to_string(),
                        stream_id: stream_id.to_string(),
                        kind,
                    });
                }
            }
        }
        tracks
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 50000 typ host",
                &self.id[..8]
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    /// Обе стороны описаны: ICE "проходит" мгновенно
    fn connect_if_ready(&self) {
        if !self.auto_connect {
            return;
        }
        let ready = {
            let mut state = self.state.lock();
            let ready = state.signaling == SignalingState::Stable
                && state.local.is_some()
                && state.remote.is_some()
                && state.connection == PeerConnectionState::New;
            if ready {
                state.connection = PeerConnectionState::Connected;
            }
            ready
        };
        if ready {
            self.sink.state_changed(PeerConnectionState::Connecting);
            self.sink.state_changed(PeerConnectionState::Connected);
        }
    }

    fn invalid(state: &LoopbackState, op: &str) -> NegotiationError {
        NegotiationError::InvalidState(format!("{op} in {:?}", state.signaling))
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let state = self.state.lock();
        if state.signaling != SignalingState::Stable {
            return Err(Self::invalid(&state, "create_offer"));
        }
        Ok(SessionDescription::new(SdpType::Offer, self.build_sdp(&state)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Self::invalid(&state, "create_answer"));
        }
        Ok(SessionDescription::new(SdpType::Answer, self.build_sdp(&state)))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        {
            let mut state = self.state.lock();
            state.signaling = match (state.signaling, desc.sdp_type) {
                (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveLocalOffer,
                (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
                _ => return Err(Self::invalid(&state, "set_local_description")),
            };
            state.local = Some(desc);
        }
        self.sink.ice_candidate(self.local_candidate());
        self.connect_if_ready();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if !desc.sdp.starts_with("v=0") {
            return Err(NegotiationError::SetDescriptionFailed(
                "sdp must start with v=0".into(),
            ));
        }
        let tracks = Self::parse_tracks(&desc.sdp);
        {
            let mut state = self.state.lock();
            state.signaling = match (state.signaling, desc.sdp_type) {
                (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
                (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
                _ => return Err(Self::invalid(&state, "set_remote_description")),
            };
            state.remote = Some(desc);
        }
        for track in tracks {
            self.sink.remote_track(track);
        }
        self.connect_if_ready();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(NegotiationError::InvalidState(
                "remote description is not set".into(),
            ));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        if state.video_id.is_none() {
            return Err(NegotiationError::InvalidState("no video sender".into()));
        }
        state.video_id = Some(track.id().to_string());
        state.video_replacements += 1;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.signaling = SignalingState::Closed;
        state.connection = PeerConnectionState::Closed;
    }
}
