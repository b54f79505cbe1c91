pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{CallConfig, IceServerConfig, IceServerKind};
pub use error::{
    CallError, ConnectivityError, MediaAcquisitionError, NegotiationError, Result, SignalingError,
};
pub use session::{
    CallDeps, CallOptions, CallSession, Role, RoleAssignment, SessionEvent, SessionSnapshot,
    SessionState,
};
pub use signaling::{LocalSignaling, Relay, SignalMessage, SignalingChannel, WsSignaling};
