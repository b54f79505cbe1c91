use super::state::SessionState;
use crate::error::CallError;
use crate::media::MediaHandle;
use crate::peer::types::RemoteTrack;

/// События сессии для UI. Отрисовка только по ним.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Error(CallError),
    /// Длительность разговора в секундах
    DurationTick(u64),
    RemoteTrack(RemoteTrack),
    /// Локальные треки для превью (после захвата и смены камеры)
    LocalMedia(MediaHandle),
    ConnectionProblem,
    ConnectionRecovering,
    ConnectionRecovered,
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
    },
    /// Можно уходить с экрана звонка
    NavigateAway,
}
