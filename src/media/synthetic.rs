//! Синтетические устройства для тестового режима (`?test=1`).

use crate::config::CallConfig;
use crate::error::DeviceError;
use crate::media::manager::{MediaConstraints, MediaDevices};
use crate::media::source::{MediaSource, SourceOrigin, TrackSet};
use crate::peer::types::MediaKind;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, warn};

/// Пакет тишины Opus (20 мс)
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];
const AUDIO_FRAME: Duration = Duration::from_millis(20);
const SCREEN_FRAME_RATE: u32 = 5;

/// Выбирает источник захвата по конфигурации. В тестовом режиме всегда
/// синтетика, иначе устройства встраивающего приложения.
pub fn devices_for(
    config: &CallConfig,
    hardware: Option<Arc<dyn MediaDevices>>,
) -> Result<Arc<dyn MediaDevices>, DeviceError> {
    if config.media.test_mode {
        debug!("Test mode: using synthetic capture");
        return Ok(Arc::new(SyntheticDevices::new()));
    }
    hardware.ok_or_else(|| DeviceError::NotFound("capture".into()))
}

#[derive(Default)]
pub struct SyntheticDevices {
    last_screen: Mutex<Option<MediaSource>>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Завершает последний показ экрана, как будто пользователь нажал
    /// «прекратить показ» в системном интерфейсе
    pub fn end_screen_capture(&self) -> bool {
        let screen = self
            .last_screen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match screen {
            Some(screen) if !screen.is_stopped() => {
                screen.end();
                true
            }
            _ => false,
        }
    }
}

/// Размер синтетического кадра под разрешение
fn frame_size(width: u32, height: u32) -> usize {
    ((width * height) / 768).clamp(64, 1200) as usize
}

fn video_frame(size: usize) -> Bytes {
    let mut frame = vec![0u8; size];
    rand::rng().fill(&mut frame[..]);
    Bytes::from(frame)
}

/// Пишет кадры в источник, пока он жив и не остановлен
fn spawn_pump(source: &MediaSource, period: Duration, frame: impl Fn() -> Bytes + Send + 'static) {
    let weak = source.downgrade();
    let handle = tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let Some(source) = weak.upgrade() else {
                break;
            };
            if source.is_stopped() {
                break;
            }
            if let Err(e) = source.write_frame(frame(), period).await {
                warn!("Synthetic {} frame write failed: {e}", source.kind());
            }
        }
    });
    source.set_pump(handle.abort_handle());
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open_user_media(&self, constraints: &MediaConstraints) -> Result<TrackSet, DeviceError> {
        let audio = MediaSource::new(MediaKind::Audio, SourceOrigin::Microphone, true);
        let video = MediaSource::new(MediaKind::Video, SourceOrigin::Camera, true);

        spawn_pump(&audio, AUDIO_FRAME, || Bytes::from_static(&OPUS_SILENCE));
        let size = frame_size(constraints.video.width, constraints.video.height);
        let period = Duration::from_millis(1000 / u64::from(constraints.video.frame_rate.max(1)));
        spawn_pump(&video, period, move || video_frame(size));

        debug!("Opened synthetic camera and microphone");
        Ok(TrackSet { audio, video })
    }

    async fn open_display_media(&self) -> Result<MediaSource, DeviceError> {
        let screen = MediaSource::new(MediaKind::Video, SourceOrigin::Screen, true);
        spawn_pump(
            &screen,
            Duration::from_millis(1000 / u64::from(SCREEN_FRAME_RATE)),
            || video_frame(1200),
        );
        *self
            .last_screen
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(screen.clone());
        debug!("Opened synthetic screen capture {}", screen.id());
        Ok(screen)
    }
}
