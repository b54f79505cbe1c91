use thiserror::Error;

/// Ошибки захвата камеры/микрофона. Терминальны для текущей попытки звонка.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MediaAcquisitionError {
    #[error("permission to use camera or microphone was denied")]
    PermissionDenied,
    #[error("required camera or microphone was not found")]
    DeviceNotFound,
    #[error("camera or microphone is used by another application")]
    DeviceBusy,
    #[error("no device satisfies the requested constraints")]
    ConstraintsUnsatisfiable,
}

/// Ошибки сигнального канала. Битые сообщения отбрасываются и логируются.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("malformed signaling message: {0}")]
    Malformed(String),
    #[error("unrecognized signaling event: {0}")]
    Unrecognized(String),
    #[error("room {0} already has two participants")]
    RoomFull(String),
    #[error("signaling channel is closed")]
    Closed,
    #[error("signaling transport error: {0}")]
    Transport(String),
}

/// Ошибки согласования SDP/ICE. Сессия глотает их, не падая.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("operation is not allowed in the current negotiation state: {0}")]
    InvalidState(String),
    #[error("failed to apply session description: {0}")]
    SetDescriptionFailed(String),
}

/// Потеря прямого соединения между пирами.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectivityError {
    #[error("ICE negotiation failed")]
    IceFailed,
    #[error("peer connection stayed disconnected past the grace period")]
    Disconnected,
    #[error("peer connection failed")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaAcquisitionError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("call session has already finished")]
    SessionClosed,
}

impl CallError {
    /// Текст для показа пользователю
    pub fn user_message(&self) -> &'static str {
        match self {
            CallError::Media(MediaAcquisitionError::PermissionDenied) => {
                "Allow access to the camera and microphone to make calls."
            }
            CallError::Media(MediaAcquisitionError::DeviceNotFound) => {
                "No camera or microphone was found on this device."
            }
            CallError::Media(MediaAcquisitionError::DeviceBusy) => {
                "Your camera or microphone is being used by another app."
            }
            CallError::Media(MediaAcquisitionError::ConstraintsUnsatisfiable) => {
                "Your camera does not support the requested settings."
            }
            CallError::Connectivity(_) => "The connection was lost. End the call and try again.",
            CallError::Signaling(_) => "Could not reach the call server.",
            CallError::Negotiation(_) => "Could not set up the call with the other side.",
            CallError::Config(_) => "The call is not configured correctly.",
            CallError::SessionClosed => "The call has already ended.",
        }
    }
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;
