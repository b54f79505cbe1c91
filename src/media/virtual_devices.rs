use super::{
    DeviceInfo, DeviceKind, FacingMode, MediaConstraints, MediaDevices, MediaStream, MediaTrack,
    TrackKind,
};
use crate::error::MediaAcquisitionError;
use crate::utils::random_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

struct VirtualState {
    devices: Vec<DeviceInfo>,
    permission_granted: bool,
    busy: bool,
    issued: Vec<MediaTrack>,
    requests: usize,
}

/// Программные устройства без железа: для headless запуска и тестов.
/// Считает выданные и остановленные треки.
pub struct VirtualDevices {
    state: Mutex<VirtualState>,
    stopped: Arc<AtomicUsize>,
}

impl Default for VirtualDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDevices {
    /// Микрофон, фронтальная и тыловая камеры
    pub fn new() -> Self {
        let mut devices = Self::front_only();
        devices.push(camera("cam-back", "Back Camera", FacingMode::Environment));
        Self::with_devices(devices)
    }

    pub fn audio_only() -> Self {
        Self::with_devices(vec![microphone()])
    }

    pub fn front_only() -> Vec<DeviceInfo> {
        vec![
            microphone(),
            camera("cam-front", "Front Camera", FacingMode::User),
        ]
    }

    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            state: Mutex::new(VirtualState {
                devices,
                permission_granted: true,
                busy: false,
                issued: Vec::new(),
                requests: 0,
            }),
            stopped: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn deny_permission(&self) {
        self.state.lock().permission_granted = false;
    }

    pub fn set_busy(&self, busy: bool) {
        self.state.lock().busy = busy;
    }

    pub fn live_tracks(&self) -> usize {
        self.state.lock().issued.iter().filter(|t| t.is_live()).count()
    }

    pub fn stopped_tracks(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.state.lock().requests
    }

    fn open(&self, kind: TrackKind, device: &DeviceInfo) -> MediaTrack {
        let stopped = self.stopped.clone();
        MediaTrack::with_stop_hook(
            format!("{}-{}", device.device_id, random_id()),
            kind,
            device.label.clone(),
            device.facing,
            move |track| {
                debug!("Virtual track {} stopped", track.id());
                stopped.fetch_add(1, Ordering::SeqCst);
            },
        )
    }
}

fn microphone() -> DeviceInfo {
    DeviceInfo {
        device_id: "mic-default".into(),
        kind: DeviceKind::AudioInput,
        label: "Default Microphone".into(),
        facing: None,
    }
}

fn camera(id: &str, label: &str, facing: FacingMode) -> DeviceInfo {
    DeviceInfo {
        device_id: id.into(),
        kind: DeviceKind::VideoInput,
        label: label.into(),
        facing: Some(facing),
    }
}

#[async_trait]
impl MediaDevices for VirtualDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaAcquisitionError> {
        Ok(self.state.lock().devices.clone())
    }

    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaAcquisitionError> {
        let (mic, cam) = {
            let mut state = self.state.lock();
            state.requests += 1;
            if !state.permission_granted {
                return Err(MediaAcquisitionError::PermissionDenied);
            }
            if state.busy {
                return Err(MediaAcquisitionError::DeviceBusy);
            }
            let mic = if constraints.audio {
                let mic = state
                    .devices
                    .iter()
                    .find(|d| d.kind == DeviceKind::AudioInput)
                    .cloned()
                    .ok_or(MediaAcquisitionError::DeviceNotFound)?;
                Some(mic)
            } else {
                None
            };
            let cam = match constraints.video {
                Some(facing) => {
                    let any_camera = state.devices.iter().any(|d| d.kind == DeviceKind::VideoInput);
                    if !any_camera {
                        return Err(MediaAcquisitionError::DeviceNotFound);
                    }
                    let cam = state
                        .devices
                        .iter()
                        .find(|d| d.kind == DeviceKind::VideoInput && d.facing == Some(facing))
                        .cloned()
                        .ok_or(MediaAcquisitionError::ConstraintsUnsatisfiable)?;
                    Some(cam)
                }
                None => None,
            };
            (mic, cam)
        };

        let mut tracks = Vec::new();
        if let Some(mic) = mic {
            tracks.push(self.open(TrackKind::Audio, &mic));
        }
        if let Some(cam) = cam {
            tracks.push(self.open(TrackKind::Video, &cam));
        }
        let mut state = self.state.lock();
        // остановленные треки больше не нужны для подсчёта живых
        state.issued.retain(|t| t.is_live());
        state.issued.extend(tracks.iter().cloned());
        drop(state);
        Ok(MediaStream {
            id: random_id(),
            tracks,
        })
    }
}
