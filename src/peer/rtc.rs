//! Соединение на стеке `webrtc`: opus + VP8, trickle ICE.

use super::connection::{EventSink, PeerConnection, PeerConnector};
use super::types::{
    IceCandidate, PeerConnectionState, RemoteTrack, SdpType, SessionDescription, SignalingState,
};
use crate::config::{IceServerConfig, IceServerKind};
use crate::error::NegotiationError;
use crate::logger::dump_candidate;
use crate::media::{MediaHandle, MediaTrack, TrackKind};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn rtc_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::SetDescriptionFailed(e.to_string())
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(servers: &[IceServerConfig]) -> RTCConfiguration {
    let ice_servers = servers
        .iter()
        .map(|config| RTCIceServer {
            urls: config.normalized_urls(),
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn build_api() -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(rtc_err)?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_err)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn sample_track(track: &MediaTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    let mime_type = match track.kind() {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        track.id().to_owned(),
        stream_id.to_owned(),
    ))
}

// RTCP надо вычитывать, иначе interceptor'ы не работают
fn spawn_rtcp_reader(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    rtc.map_err(rtc_err)
}

fn from_rtc(desc: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        _ => SdpType::Answer,
    };
    SessionDescription::new(sdp_type, desc.sdp)
}

/// Фабрика соединений на `webrtc`
pub struct RtcConnector {
    ice_servers: Vec<IceServerConfig>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Arc<Self> {
        Arc::new(Self { ice_servers })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        local: &MediaHandle,
        events: EventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let api = build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(rtc_config(&self.ice_servers))
                .await
                .map_err(rtc_err)?,
        );

        let audio = sample_track(&local.audio, &local.stream_id);
        let audio_sender = pc
            .add_track(Arc::clone(&audio) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_err)?;
        spawn_rtcp_reader(audio_sender);

        let mut video_sender = None;
        if let Some(video) = &local.video {
            let track = sample_track(video, &local.stream_id);
            let sender = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(rtc_err)?;
            spawn_rtcp_reader(sender.clone());
            video_sender = Some(sender);
        }

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        };
                        dump_candidate("LOCAL", &candidate);
                        sink.ice_candidate(candidate);
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                },
                None => debug!("ICE candidate gathering completed (null candidate received)"),
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!("Peer connection state changed to: {:?}", st);
            sink.state_changed(map_connection_state(st));
            Box::pin(async {})
        }));

        let sink = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    info!("Remote {:?} track {} arrived", kind, track.id());
                    sink.remote_track(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    });
                }
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(RtcPeer {
            pc,
            stream_id: local.stream_id.clone(),
            video_sender,
        }))
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    stream_id: String,
    video_sender: Option<Arc<RTCRtpSender>>,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.pc.create_offer(None).await.map(from_rtc).map_err(rtc_err)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.pc.create_answer(None).await.map(from_rtc).map_err(rtc_err)
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(rtc_err)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(rtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        dump_candidate("REMOTE", &candidate);
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(rtc_err)
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), NegotiationError> {
        let Some(sender) = &self.video_sender else {
            return Err(NegotiationError::InvalidState("no video sender".into()));
        };
        let sample = sample_track(track, &self.stream_id);
        sender
            .replace_track(Some(sample as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(rtc_err)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> PeerConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
    }
}

/// Проверка STUN/TURN сервера: ждём srflx (STUN) или relay (TURN) кандидата
pub async fn probe_ice_server(config: &IceServerConfig, wait: Duration) -> bool {
    info!("Probing ICE server {} ({:?})", config.id, config.kind);
    if let Err(e) = config.validate() {
        warn!("Refusing to probe invalid ICE server: {}", e);
        return false;
    }

    let rtc_config = RTCConfiguration {
        ice_servers: rtc_config(std::slice::from_ref(config)).ice_servers,
        ..Default::default()
    };
    let peer_connection = match APIBuilder::new().build().new_peer_connection(rtc_config).await {
        Ok(pc) => Arc::new(pc),
        Err(e) => {
            warn!("Failed to create probe peer connection: {}", e);
            return false;
        }
    };

    let wanted = match config.kind {
        IceServerKind::Stun => "typ srflx",
        IceServerKind::Turn => "typ relay",
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    peer_connection.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        if let Some(json) = cand.and_then(|c| c.to_json().ok()) {
            debug!("Probe candidate: {}", json.candidate);
            if json.candidate.contains(wanted) {
                let _ = tx.send(());
            }
        }
        Box::pin(async {})
    }));

    // data channel нужен только чтобы запустить сбор кандидатов
    if let Err(e) = peer_connection.create_data_channel("probe", None).await {
        warn!("Failed to create probe data channel: {}", e);
        let _ = peer_connection.close().await;
        return false;
    }
    let gathered = match peer_connection.create_offer(None).await {
        Ok(offer) => peer_connection.set_local_description(offer).await.is_ok(),
        Err(e) => {
            warn!("Failed to create probe offer: {}", e);
            false
        }
    };

    let reachable = gathered && matches!(timeout(wait, rx.recv()).await, Ok(Some(())));
    info!("ICE server {} reachable: {}", config.id, reachable);
    let _ = peer_connection.close().await;
    reachable
}
