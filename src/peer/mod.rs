pub mod connection;
pub mod loopback;
pub mod rtc;
pub mod types;

pub use connection::{EventSink, PeerConnection, PeerConnectionManager, PeerConnector};
pub use loopback::{LoopbackConnector, LoopbackPeer};
pub use rtc::{probe_ice_server, RtcConnector};
pub use types::{
    IceCandidate, PeerConnectionState, PeerEvent, RemoteTrack, SdpType, SessionDescription,
    SignalingState,
};
