//! Сессия звонка: один actor на звонок, который последовательно
//! обрабатывает команды UI, сигнальные сообщения, события соединения и
//! таймеры. UI общается с ним через [`CallSession`].

pub mod events;
mod machine;
pub mod state;

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::media::{LocalMediaState, MediaDevices, MediaHandle, MediaKind};
use crate::peer::PeerConnector;
use crate::signaling::SignalingChannel;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

pub use events::SessionEvent;
pub use state::{Participant, Role, RoleAssignment, SessionState};

/// Параметры конкретного звонка
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub room_id: String,
    pub user_id: String,
    pub role: RoleAssignment,
    /// Если не задано, берётся из конфигурации
    pub media_kind: Option<MediaKind>,
}

impl CallOptions {
    pub fn new(room_id: &str, user_id: &str, role: RoleAssignment) -> Self {
        Self {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            role,
            media_kind: None,
        }
    }

    pub fn with_media_kind(mut self, kind: MediaKind) -> Self {
        self.media_kind = Some(kind);
        self
    }
}

/// Внешние зависимости сессии, передаются явно
#[derive(Clone)]
pub struct CallDeps {
    pub signaling: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn PeerConnector>,
}

/// Снимок сессии для отладки и UI
#[derive(Serialize, Debug, Clone)]
pub struct SessionSnapshot {
    pub room_id: String,
    pub state: SessionState,
    pub local: Participant,
    pub remote: Option<Participant>,
    pub media: LocalMediaState,
    pub duration_secs: u64,
    /// Момент первого соединения (UTC)
    pub connected_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}

pub(crate) enum Command {
    SetMuted(bool, oneshot::Sender<()>),
    SetVideoEnabled(bool, oneshot::Sender<()>),
    SwitchCamera(oneshot::Sender<Result<MediaHandle>>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    End(Option<oneshot::Sender<()>>),
}

/// Ручка управления звонком. Удаление ручки завершает звонок.
pub struct CallSession {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    duration: Arc<AtomicU64>,
}

impl CallSession {
    /// Запускает звонок. Должен вызываться внутри tokio runtime.
    pub fn start(
        config: CallConfig,
        deps: CallDeps,
        options: CallOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;
        if options.room_id.is_empty() || options.user_id.is_empty() {
            return Err(CallError::Config(
                "room id and user id must not be empty".into(),
            ));
        }

        info!(
            "Starting call in room {} as {}",
            options.room_id, options.user_id
        );
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let duration = Arc::new(AtomicU64::new(0));

        let actor = machine::CallActor::new(config, deps, options, event_tx, state_tx, duration.clone());
        tokio::spawn(actor.run(command_rx));

        Ok((
            Self {
                commands: command_tx,
                state: state_rx,
                duration,
            },
            event_rx,
        ))
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Подписка на смену состояния
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn duration_secs(&self) -> u64 {
        self.duration.load(Ordering::SeqCst)
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.request(|reply| Command::SetMuted(muted, reply)).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetVideoEnabled(enabled, reply))
            .await
    }

    /// Фронтальная/тыловая камера. Возвращает новые локальные треки.
    pub async fn switch_camera(&self) -> Result<MediaHandle> {
        self.request(Command::SwitchCamera).await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Положить трубку. Повторные вызовы и вызов после завершения
    /// ничего не делают.
    pub async fn end(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::End(Some(tx))).is_err() {
            debug!("Call session already finished");
            return;
        }
        let _ = rx.await;
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::End(None));
    }
}
