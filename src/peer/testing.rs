//! Подставные транспорт, сигнальный канал и устройства для unit-тестов.

use crate::error::{CallError, DeviceError, Result, SignalingError};
use crate::media::{MediaConstraints, MediaDevices, MediaSource, SourceOrigin, TrackSet};
use crate::peer::transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};
use crate::peer::types::{
    IceCandidate, IceState, MediaKind, SdpType, SessionDescription, SignalingState,
    TransportStats,
};
use crate::signaling::{SignalMessage, SignalingTransport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct FakeState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    ice: IceState,
    senders: Vec<MediaSource>,
    applied: Vec<IceCandidate>,
    offer_sdp: String,
    offers_created: usize,
    ice_restarts: usize,
    rollbacks: usize,
    replacements: usize,
    stats: TransportStats,
    closed: bool,
}

/// Транспорт с моделью signaling state, как у браузерного RTCPeerConnection
pub struct FakeTransport {
    state: Mutex<FakeState>,
    events: Option<TransportEvents>,
    stall_attach: bool,
}

fn refused(reason: &str) -> CallError {
    CallError::Transport(reason.to_owned())
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                signaling: SignalingState::Stable,
                local: None,
                remote: None,
                ice: IceState::New,
                senders: Vec::new(),
                applied: Vec::new(),
                offer_sdp: "v=0\r\n".to_owned(),
                offers_created: 0,
                ice_restarts: 0,
                rollbacks: 0,
                replacements: 0,
                stats: TransportStats::default(),
                closed: false,
            }),
            events: None,
            stall_attach: false,
        }
    }

    pub fn with_events(events: TransportEvents) -> Self {
        Self {
            events: Some(events),
            ..Self::new()
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Имитирует событие от нижележащего соединения
    pub fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    pub fn generation(&self) -> Option<u64> {
        self.events.as_ref().map(|e| e.generation())
    }

    pub fn set_ice_state(&self, ice: IceState) {
        self.with_state(|s| s.ice = ice);
    }

    pub fn set_stats(&self, stats: TransportStats) {
        self.with_state(|s| s.stats = stats);
    }

    pub fn set_offer_sdp(&self, sdp: &str) {
        self.with_state(|s| s.offer_sdp = sdp.to_owned());
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.with_state(|s| s.remote.clone())
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.with_state(|s| s.applied.clone())
    }

    pub fn sender_source(&self, kind: MediaKind) -> Option<MediaSource> {
        self.with_state(|s| s.senders.iter().find(|src| src.kind() == kind).cloned())
    }

    pub fn offers_created(&self) -> usize {
        self.with_state(|s| s.offers_created)
    }

    pub fn ice_restarts(&self) -> usize {
        self.with_state(|s| s.ice_restarts)
    }

    pub fn rollbacks(&self) -> usize {
        self.with_state(|s| s.rollbacks)
    }

    pub fn replacements(&self) -> usize {
        self.with_state(|s| s.replacements)
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.closed)
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    fn signaling_state(&self) -> SignalingState {
        self.with_state(|s| s.signaling)
    }

    fn ice_state(&self) -> IceState {
        self.with_state(|s| s.ice)
    }

    async fn has_remote_description(&self) -> bool {
        self.with_state(|s| s.remote.is_some())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.with_state(|s| {
            if s.closed {
                return Err(refused("closed"));
            }
            s.offers_created += 1;
            if ice_restart {
                s.ice_restarts += 1;
            }
            Ok(SessionDescription::offer(s.offer_sdp.clone()))
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.with_state(|s| match s.signaling {
            SignalingState::HaveRemoteOffer => Ok(SessionDescription::answer("v=0\r\n")),
            _ => Err(refused("no remote offer to answer")),
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.with_state(|s| {
            s.signaling = match (desc.sdp_type, s.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                _ => return Err(refused("invalid local description for state")),
            };
            s.local = Some(desc);
            Ok(())
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.with_state(|s| {
            s.signaling = match (desc.sdp_type, s.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                _ => return Err(refused("invalid remote description for state")),
            };
            s.remote = Some(desc);
            Ok(())
        })
    }

    async fn rollback(&self) -> Result<()> {
        self.with_state(|s| {
            if s.signaling != SignalingState::HaveLocalOffer {
                return Err(refused("nothing to roll back"));
            }
            s.signaling = SignalingState::Stable;
            s.local = None;
            s.rollbacks += 1;
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.with_state(|s| {
            if s.remote.is_none() {
                return Err(refused("remote description is not set"));
            }
            s.applied.push(candidate);
            Ok(())
        })
    }

    async fn attach_source(&self, source: &MediaSource) -> Result<()> {
        if self.stall_attach {
            std::future::pending::<()>().await;
        }
        self.with_state(|s| s.senders.push(source.clone()));
        Ok(())
    }

    async fn replace_source(&self, kind: MediaKind, source: &MediaSource) -> Result<()> {
        self.with_state(|s| {
            let slot = s
                .senders
                .iter_mut()
                .find(|src| src.kind() == kind)
                .ok_or_else(|| refused("no sender for kind"))?;
            *slot = source.clone();
            s.replacements += 1;
            Ok(())
        })
    }

    async fn sender_count(&self) -> usize {
        self.with_state(|s| s.senders.len())
    }

    async fn stats(&self) -> Result<TransportStats> {
        Ok(self.with_state(|s| s.stats))
    }

    async fn close(&self) -> Result<()> {
        self.with_state(|s| {
            s.closed = true;
            s.signaling = SignalingState::Closed;
        });
        Ok(())
    }
}

/// Запоминает все созданные транспорты
#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<Arc<FakeTransport>>>,
    stall_attach: AtomicBool,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Новые транспорты навсегда зависают на подключении источников
    pub fn stall_attach(&self) {
        self.stall_attach.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn latest(&self) -> Arc<FakeTransport> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transport created yet")
    }

    pub fn all(&self) -> Vec<Arc<FakeTransport>> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(FakeTransport {
            stall_attach: self.stall_attach.load(Ordering::SeqCst),
            ..FakeTransport::with_events(events)
        });
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// Сигнальный канал, который только записывает исходящие сообщения
pub struct RecordingSignaling {
    sent: Mutex<Vec<SignalMessage>>,
    closed: AtomicBool,
    inbound: Mutex<Option<mpsc::UnboundedSender<SignalMessage>>>,
}

impl Default for RecordingSignaling {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSignaling {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            inbound: Mutex::new(None),
        }
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Забирает накопленные исходящие сообщения
    pub fn take_sent(&self) -> Vec<SignalMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Доставляет сообщение подписчику, как будто оно пришло из комнаты
    pub fn deliver(&self, message: SignalMessage) -> bool {
        match self.inbound.lock().unwrap().as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SignalingTransport for RecordingSignaling {
    async fn send(&self, message: SignalMessage) -> std::result::Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn subscribe(&self) -> std::result::Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.inbound.lock().unwrap().take();
    }
}

/// Устройства без фоновых задач, с возможностью отказа
#[derive(Default)]
pub struct FakeDevices {
    failure: Option<DeviceError>,
    user_media_requests: AtomicUsize,
    screens: Mutex<Vec<MediaSource>>,
}

impl FakeDevices {
    pub fn failing(error: DeviceError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn user_media_requests(&self) -> usize {
        self.user_media_requests.load(Ordering::SeqCst)
    }

    pub fn last_screen(&self) -> Option<MediaSource> {
        self.screens.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open_user_media(
        &self,
        _constraints: &MediaConstraints,
    ) -> std::result::Result<TrackSet, DeviceError> {
        self.user_media_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(TrackSet {
            audio: MediaSource::new(MediaKind::Audio, SourceOrigin::Microphone, true),
            video: MediaSource::new(MediaKind::Video, SourceOrigin::Camera, true),
        })
    }

    async fn open_display_media(&self) -> std::result::Result<MediaSource, DeviceError> {
        let screen = MediaSource::new(MediaKind::Video, SourceOrigin::Screen, true);
        self.screens.lock().unwrap().push(screen.clone());
        Ok(screen)
    }
}
