use super::{
    DeviceKind, FacingMode, LocalMediaState, MediaConstraints, MediaDevices, MediaHandle,
    MediaKind, MediaStream, MediaTrack, TrackKind,
};
use crate::error::MediaAcquisitionError;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Владеет локальными треками сессии.
///
/// Флаги `muted`/`video_enabled` хранятся отдельно от треков: после смены
/// камеры новый трек получает текущее значение.
pub struct MediaDeviceController {
    devices: Arc<dyn MediaDevices>,
    handle: Option<MediaHandle>,
    muted: bool,
    video_enabled: bool,
    facing: FacingMode,
}

impl MediaDeviceController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            handle: None,
            muted: false,
            video_enabled: true,
            facing: FacingMode::User,
        }
    }

    pub fn current(&self) -> Option<&MediaHandle> {
        self.handle.as_ref()
    }

    /// Захват микрофона (и камеры). Если живые треки уже есть, возвращает их.
    pub async fn acquire(&mut self, kind: MediaKind) -> Result<MediaHandle, MediaAcquisitionError> {
        if let Some(handle) = &self.handle {
            if handle.live_tracks() > 0 {
                debug!("Reusing live media stream {}", handle.stream_id);
                return Ok(handle.clone());
            }
        }

        // Предварительно проверяем, что нужные устройства вообще есть,
        // иначе отказ в доступе и отсутствие камеры неразличимы
        let devices = self.devices.enumerate_devices().await?;
        let has = |k: DeviceKind| devices.iter().any(|d| d.kind == k);
        if !has(DeviceKind::AudioInput) {
            warn!("No audio input devices found");
            return Err(MediaAcquisitionError::DeviceNotFound);
        }
        let want_video = kind == MediaKind::AudioVideo;
        if want_video && !has(DeviceKind::VideoInput) {
            warn!("No video input devices found");
            return Err(MediaAcquisitionError::DeviceNotFound);
        }

        let constraints = MediaConstraints {
            audio: true,
            video: want_video.then_some(self.facing),
        };
        let stream = self.devices.get_user_media(constraints).await?;
        let handle = self.build_handle(stream, want_video)?;
        info!(
            "Acquired media stream {} ({} tracks)",
            handle.stream_id,
            handle.live_tracks()
        );
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    fn build_handle(
        &self,
        stream: MediaStream,
        want_video: bool,
    ) -> Result<MediaHandle, MediaAcquisitionError> {
        let audio = stream
            .tracks
            .iter()
            .find(|t| t.kind() == TrackKind::Audio)
            .cloned();
        let video = stream
            .tracks
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .cloned();
        let Some(audio) = audio else {
            stream.tracks.iter().for_each(MediaTrack::stop);
            return Err(MediaAcquisitionError::ConstraintsUnsatisfiable);
        };
        if want_video && video.is_none() {
            stream.tracks.iter().for_each(MediaTrack::stop);
            return Err(MediaAcquisitionError::ConstraintsUnsatisfiable);
        }
        let video = match video {
            Some(v) if !want_video => {
                v.stop();
                None
            }
            other => other,
        };
        audio.set_enabled(!self.muted);
        if let Some(video) = &video {
            video.set_enabled(self.video_enabled);
        }
        Ok(MediaHandle {
            stream_id: stream.id,
            audio,
            video,
        })
    }

    /// Выключает/включает микрофон, видео не трогает
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(handle) = &self.handle {
            handle.audio.set_enabled(!muted);
        }
        debug!("Audio muted: {}", muted);
    }

    /// Выключает/включает камеру, аудио не трогает
    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        if let Some(video) = self.handle.as_ref().and_then(|h| h.video.as_ref()) {
            video.set_enabled(enabled);
        }
        debug!("Video enabled: {}", enabled);
    }

    /// Переключение фронтальная/тыловая. Аудиотрек остаётся прежним.
    pub async fn switch_facing(&mut self) -> Result<MediaHandle, MediaAcquisitionError> {
        let Some(old_video) = self.handle.as_ref().and_then(|h| h.video.clone()) else {
            return Err(MediaAcquisitionError::ConstraintsUnsatisfiable);
        };
        let next = self.facing.opposite();
        info!("Switching camera {:?} -> {:?}", self.facing, next);

        // на телефонах две камеры одновременно не открываются
        old_video.stop();
        let result = self.open_camera(next).await;
        let (video, outcome) = match result {
            Ok(video) => {
                self.facing = next;
                (Some(video), Ok(()))
            }
            Err(e) => {
                warn!("Camera switch failed: {}, restoring {:?}", e, self.facing);
                (self.open_camera(self.facing).await.ok(), Err(e))
            }
        };

        let Some(handle) = self.handle.as_mut() else {
            // release() не может случиться посреди переключения, но трек не теряем
            if let Some(v) = video {
                v.stop();
            }
            return Err(MediaAcquisitionError::DeviceBusy);
        };
        handle.video = video;
        outcome.map(|_| handle.clone())
    }

    async fn open_camera(&self, facing: FacingMode) -> Result<MediaTrack, MediaAcquisitionError> {
        let stream = self
            .devices
            .get_user_media(MediaConstraints {
                audio: false,
                video: Some(facing),
            })
            .await?;
        let mut video = None;
        for track in stream.tracks {
            if track.kind() == TrackKind::Video && video.is_none() {
                video = Some(track);
            } else {
                track.stop();
            }
        }
        let video = video.ok_or(MediaAcquisitionError::ConstraintsUnsatisfiable)?;
        video.set_enabled(self.video_enabled);
        Ok(video)
    }

    /// Останавливает все треки. Повторный вызов ничего не делает.
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            for track in handle.tracks() {
                track.stop();
            }
            info!("Released media stream {}", handle.stream_id);
        }
    }

    pub fn live_track_count(&self) -> usize {
        self.handle.as_ref().map_or(0, MediaHandle::live_tracks)
    }

    pub fn state(&self) -> LocalMediaState {
        LocalMediaState {
            audio_track_id: self.handle.as_ref().map(|h| h.audio.id().to_string()),
            video_track_id: self
                .handle
                .as_ref()
                .and_then(|h| h.video.as_ref())
                .map(|v| v.id().to_string()),
            muted: self.muted,
            video_enabled: self.video_enabled,
            facing: self.facing,
            live_tracks: self.live_track_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::VirtualDevices;

    fn controller(devices: &Arc<VirtualDevices>) -> MediaDeviceController {
        MediaDeviceController::new(devices.clone())
    }

    #[tokio::test]
    async fn acquires_audio_and_video() {
        let devices = Arc::new(VirtualDevices::new());
        let mut media = controller(&devices);
        let handle = media.acquire(MediaKind::AudioVideo).await.unwrap();
        assert!(handle.video.is_some());
        assert_eq!(media.live_track_count(), 2);
        assert_eq!(devices.live_tracks(), 2);
    }

    #[tokio::test]
    async fn missing_camera_is_not_found_not_denied() {
        let devices = Arc::new(VirtualDevices::audio_only());
        devices.deny_permission();
        let mut media = controller(&devices);
        assert_eq!(
            media.acquire(MediaKind::AudioVideo).await.unwrap_err(),
            MediaAcquisitionError::DeviceNotFound
        );
        assert_eq!(devices.requests(), 0);
    }

    #[tokio::test]
    async fn denied_permission_is_reported() {
        let devices = Arc::new(VirtualDevices::new());
        devices.deny_permission();
        let mut media = controller(&devices);
        assert_eq!(
            media.acquire(MediaKind::Audio).await.unwrap_err(),
            MediaAcquisitionError::PermissionDenied
        );
        assert_eq!(devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn mute_and_video_toggles_are_independent() {
        let devices = Arc::new(VirtualDevices::new());
        let mut media = controller(&devices);
        let handle = media.acquire(MediaKind::AudioVideo).await.unwrap();
        let video = handle.video.clone().unwrap();

        media.set_muted(true);
        assert!(!handle.audio.is_enabled());
        assert!(video.is_enabled());
        media.set_muted(false);
        assert!(handle.audio.is_enabled());
        assert!(video.is_enabled());

        media.set_video_enabled(false);
        assert!(!video.is_enabled());
        assert!(handle.audio.is_enabled());
        media.set_video_enabled(true);
        assert!(video.is_enabled());
        assert!(handle.audio.is_live() && video.is_live());
    }

    #[tokio::test]
    async fn switch_keeps_audio_and_applies_toggles_to_new_track() {
        let devices = Arc::new(VirtualDevices::new());
        let mut media = controller(&devices);
        let before = media.acquire(MediaKind::AudioVideo).await.unwrap();
        media.set_video_enabled(false);

        let after = media.switch_facing().await.unwrap();
        assert!(after.audio.same_track(&before.audio));
        let old_video = before.video.unwrap();
        let new_video = after.video.clone().unwrap();
        assert!(!old_video.is_live());
        assert_eq!(new_video.facing(), Some(FacingMode::Environment));
        assert!(!new_video.is_enabled());

        media.set_video_enabled(true);
        assert!(new_video.is_enabled());
        assert_eq!(devices.live_tracks(), 2);
    }

    #[tokio::test]
    async fn failed_switch_restores_previous_camera() {
        let devices = Arc::new(VirtualDevices::with_devices(VirtualDevices::front_only()));
        let mut media = controller(&devices);
        media.acquire(MediaKind::AudioVideo).await.unwrap();
        assert_eq!(
            media.switch_facing().await.unwrap_err(),
            MediaAcquisitionError::ConstraintsUnsatisfiable
        );
        let state = media.state();
        assert_eq!(state.facing, FacingMode::User);
        assert_eq!(state.live_tracks, 2);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let devices = Arc::new(VirtualDevices::new());
        let mut media = controller(&devices);
        media.acquire(MediaKind::AudioVideo).await.unwrap();
        media.release();
        media.release();
        assert_eq!(media.live_track_count(), 0);
        assert_eq!(devices.live_tracks(), 0);
        assert_eq!(devices.stopped_tracks(), 2);
    }
}
