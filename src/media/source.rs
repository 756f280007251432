use crate::error::Result;
use crate::peer::types::MediaKind;
use crate::utils::random_id;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceOrigin {
    Camera,
    Microphone,
    Screen,
}

struct SourceInner {
    id: String,
    kind: MediaKind,
    origin: SourceOrigin,
    synthetic: bool,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    ended: watch::Sender<bool>,
    pump: OnceLock<AbortHandle>,
}

/// Разделяемый хэндл одного локального источника. Клоны указывают на тот же
/// источник, сравнение через `same_as` идёт по указателю.
#[derive(Clone)]
pub struct MediaSource {
    inner: Arc<SourceInner>,
}

/// Слабая ссылка для фоновых задач, чтобы они не держали источник живым
#[derive(Clone)]
pub struct WeakMediaSource(Weak<SourceInner>);

impl WeakMediaSource {
    pub fn upgrade(&self) -> Option<MediaSource> {
        self.0.upgrade().map(|inner| MediaSource { inner })
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
    }
}

impl MediaSource {
    pub fn new(kind: MediaKind, origin: SourceOrigin, synthetic: bool) -> Self {
        let id = format!("{}-{}", origin_label(origin), random_id());
        let track = Arc::new(TrackLocalStaticSample::new(
            codec_for(kind),
            id.clone(),
            "ssc-local".to_owned(),
        ));
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(SourceInner {
                id,
                kind,
                origin,
                synthetic,
                track,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                ended,
                pump: OnceLock::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn origin(&self) -> SourceOrigin {
        self.inner.origin
    }

    pub fn is_synthetic(&self) -> bool {
        self.inner.synthetic
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.track.clone()
    }

    pub fn same_as(&self, other: &MediaSource) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakMediaSource {
        WeakMediaSource(Arc::downgrade(&self.inner))
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Останавливает захват. Возвращает true только при первом вызове.
    pub fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(pump) = self.inner.pump.get() {
            pump.abort();
        }
        debug!("Stopped {} source {}", self.kind(), self.id());
        true
    }

    /// Захват завершился сам (например, пользователь закрыл показ экрана)
    pub fn end(&self) {
        self.stop();
        self.inner.ended.send_replace(true);
    }

    /// Получатель уведомления о завершении захвата
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.inner.ended.subscribe()
    }

    pub(crate) fn set_pump(&self, handle: AbortHandle) {
        if self.is_stopped() {
            handle.abort();
            return;
        }
        if let Err(handle) = self.inner.pump.set(handle) {
            handle.abort();
        }
    }

    /// Пишет кадр в трек. Выключенный или остановленный источник ничего не отправляет.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<bool> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        self.inner
            .track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }
}

fn origin_label(origin: SourceOrigin) -> &'static str {
    match origin {
        SourceOrigin::Camera => "camera",
        SourceOrigin::Microphone => "microphone",
        SourceOrigin::Screen => "screen",
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("origin", &self.inner.origin)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Исходящие источники: один звук и одно активное видео
#[derive(Debug, Clone)]
pub struct TrackSet {
    pub audio: MediaSource,
    pub video: MediaSource,
}
