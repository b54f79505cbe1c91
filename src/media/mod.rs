//! Локальные медиа: треки камеры/микрофона и контроллер устройств.

pub mod controller;
pub mod virtual_devices;

use crate::error::MediaAcquisitionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use controller::MediaDeviceController;
pub use virtual_devices::VirtualDevices;

/// Что захватываем для звонка
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    AudioVideo,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Фронтальная или тыловая камера
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

impl FacingMode {
    pub fn opposite(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
    AudioOutput,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    pub label: String,
    /// Только для камер
    pub facing: Option<FacingMode>,
}

/// Запрос к getUserMedia
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<FacingMode>,
}

type StopHook = Box<dyn Fn(&MediaTrack) + Send + Sync>;

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    facing: Option<FacingMode>,
    enabled: AtomicBool,
    live: AtomicBool,
    on_stop: Option<StopHook>,
}

/// Живой трек устройства. Клоны указывают на один и тот же трек.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self::build(id.into(), kind, label.into(), None, None)
    }

    /// Трек с колбэком остановки, backend так узнаёт об освобождении устройства
    pub fn with_stop_hook<F>(
        id: impl Into<String>,
        kind: TrackKind,
        label: impl Into<String>,
        facing: Option<FacingMode>,
        hook: F,
    ) -> Self
    where
        F: Fn(&MediaTrack) + Send + Sync + 'static,
    {
        Self::build(id.into(), kind, label.into(), facing, Some(Box::new(hook)))
    }

    fn build(
        id: String,
        kind: TrackKind,
        label: String,
        facing: Option<FacingMode>,
        on_stop: Option<StopHook>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                label,
                facing,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                on_stop,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn facing(&self) -> Option<FacingMode> {
        self.inner.facing
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Останавливает трек; повторный вызов ничего не делает
    pub fn stop(&self) {
        if self.inner.live.swap(false, Ordering::SeqCst) {
            if let Some(hook) = &self.inner.on_stop {
                hook(self);
            }
        }
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Поток, который вернул backend устройств
#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

/// Локальные медиа сессии: аудио всегда, видео для видеозвонка
#[derive(Debug, Clone)]
pub struct MediaHandle {
    pub stream_id: String,
    pub audio: MediaTrack,
    pub video: Option<MediaTrack>,
}

impl MediaHandle {
    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        std::iter::once(&self.audio).chain(self.video.iter())
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks().filter(|t| t.is_live()).count()
    }
}

/// Снимок локального медиа-состояния для UI
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LocalMediaState {
    pub audio_track_id: Option<String>,
    pub video_track_id: Option<String>,
    pub muted: bool,
    pub video_enabled: bool,
    pub facing: FacingMode,
    pub live_tracks: usize,
}

/// Доступ к устройствам ОС/браузера
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaAcquisitionError>;

    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaAcquisitionError>;
}
