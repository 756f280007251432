use crate::error::{CallError, DeviceError, Result};
use crate::media::source::{MediaSource, TrackSet};
use crate::peer::transport::PeerTransport;
use crate::peer::types::MediaKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: VideoConstraints,
    pub audio: AudioConstraints,
}

impl MediaConstraints {
    pub fn for_device(class: DeviceClass) -> Self {
        let video = match class {
            DeviceClass::Desktop => VideoConstraints {
                width: 1280,
                height: 720,
                frame_rate: 30,
            },
            DeviceClass::Mobile => VideoConstraints {
                width: 640,
                height: 480,
                frame_rate: 24,
            },
        };
        Self {
            video,
            audio: AudioConstraints {
                echo_cancellation: true,
                noise_suppression: true,
            },
        }
    }
}

/// Устройства захвата. Настоящие камеры живут за пределами крейта,
/// здесь есть только синтетическая реализация.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> std::result::Result<TrackSet, DeviceError>;

    async fn open_display_media(&self) -> std::result::Result<MediaSource, DeviceError>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoMode {
    #[default]
    Camera,
    Screen,
}

/// Владеет локальными источниками и подменяет видео в sender'е
pub struct MediaTrackManager {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    audio: Option<MediaSource>,
    camera: Option<MediaSource>,
    screen: Option<MediaSource>,
    mode: VideoMode,
}

impl MediaTrackManager {
    pub fn new(devices: Arc<dyn MediaDevices>, constraints: MediaConstraints) -> Self {
        Self {
            devices,
            constraints,
            audio: None,
            camera: None,
            screen: None,
            mode: VideoMode::Camera,
        }
    }

    /// Захватывает камеру и микрофон. Повторный вызов отдаёт уже открытые источники.
    /// Ошибки устройств не повторяются.
    pub async fn acquire_local_media(&mut self) -> std::result::Result<TrackSet, DeviceError> {
        if let Some(tracks) = self.tracks() {
            return Ok(tracks);
        }
        let tracks = self.devices.open_user_media(&self.constraints).await?;
        info!(
            "Local media acquired: audio={} video={} ({}x{}@{})",
            tracks.audio.id(),
            tracks.video.id(),
            self.constraints.video.width,
            self.constraints.video.height,
            self.constraints.video.frame_rate
        );
        self.audio = Some(tracks.audio.clone());
        self.camera = Some(tracks.video.clone());
        self.mode = VideoMode::Camera;
        Ok(tracks)
    }

    /// Текущий набор: звук и активное видео
    pub fn tracks(&self) -> Option<TrackSet> {
        Some(TrackSet {
            audio: self.audio.clone()?,
            video: self.active_video()?.clone(),
        })
    }

    pub fn active_video(&self) -> Option<&MediaSource> {
        match self.mode {
            VideoMode::Screen => self.screen.as_ref(),
            VideoMode::Camera => self.camera.as_ref(),
        }
    }

    pub fn audio(&self) -> Option<&MediaSource> {
        self.audio.as_ref()
    }

    pub fn camera(&self) -> Option<&MediaSource> {
        self.camera.as_ref()
    }

    pub fn screen(&self) -> Option<&MediaSource> {
        self.screen.as_ref()
    }

    pub fn mode(&self) -> VideoMode {
        self.mode
    }

    pub fn is_sharing(&self) -> bool {
        self.mode == VideoMode::Screen
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio.as_ref().is_some_and(|s| s.is_enabled())
    }

    pub fn video_enabled(&self) -> bool {
        self.camera.as_ref().is_some_and(|s| s.is_enabled())
    }

    /// Mute на месте: трек остаётся в sender'е
    pub fn toggle_audio(&mut self) -> Result<bool> {
        let audio = self.audio.as_ref().ok_or(CallError::NotJoined)?;
        let enabled = !audio.is_enabled();
        audio.set_enabled(enabled);
        debug!("Audio enabled: {enabled}");
        Ok(enabled)
    }

    /// Переключает камеру, даже если сейчас показывается экран
    pub fn toggle_video(&mut self) -> Result<bool> {
        let camera = self.camera.as_ref().ok_or(CallError::NotJoined)?;
        let enabled = !camera.is_enabled();
        camera.set_enabled(enabled);
        debug!("Video enabled: {enabled}");
        Ok(enabled)
    }

    /// Подключает звук и текущее видео к транспорту
    pub async fn attach_to(&self, transport: &dyn PeerTransport) -> Result<()> {
        let tracks = self.tracks().ok_or(CallError::NotJoined)?;
        transport.attach_source(&tracks.audio).await?;
        transport.attach_source(&tracks.video).await?;
        debug!("Attached {} and {} to transport", tracks.audio.id(), tracks.video.id());
        Ok(())
    }

    /// Начинает показ экрана. Возвращает новый источник или `None`,
    /// если показ уже идёт.
    pub async fn start_screen_share(
        &mut self,
        transport: &dyn PeerTransport,
    ) -> Result<Option<MediaSource>> {
        if self.is_sharing() {
            debug!("Screen share already active");
            return Ok(None);
        }
        if self.camera.is_none() {
            return Err(CallError::NotJoined);
        }

        let screen = self.devices.open_display_media().await?;
        if let Err(e) = transport.replace_source(MediaKind::Video, &screen).await {
            warn!("Failed to replace video track with screen: {e}");
            screen.stop();
            return Err(e);
        }

        info!("Screen share started: {}", screen.id());
        self.screen = Some(screen.clone());
        self.mode = VideoMode::Screen;
        Ok(Some(screen))
    }

    /// Возвращает камеру на место экрана. false, если показа не было.
    pub async fn stop_screen_share(&mut self, transport: Option<&dyn PeerTransport>) -> Result<bool> {
        if !self.is_sharing() {
            debug!("Screen share not active");
            return Ok(false);
        }
        if let (Some(transport), Some(camera)) = (transport, self.camera.as_ref()) {
            transport.replace_source(MediaKind::Video, camera).await?;
        }

        self.mode = VideoMode::Camera;
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        info!("Screen share stopped, camera restored");
        Ok(true)
    }

    /// Останавливает все источники ровно один раз
    pub fn stop_all(&mut self) {
        for source in [self.audio.take(), self.camera.take(), self.screen.take()]
            .into_iter()
            .flatten()
        {
            source.stop();
        }
        self.mode = VideoMode::Camera;
    }
}
