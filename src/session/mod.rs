pub mod actor;
pub mod input;

pub use actor::spawn_session;
pub use input::{Command, Reply, SessionInput};

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::events::{CallEvent, EventBus};
use crate::media::{MediaDevices, MediaSource, MediaTrackManager};
use crate::peer::ice::analyze_candidates;
use crate::peer::identity::{PeerIdentityTracker, PeerObservation};
use crate::peer::negotiator::{OfferOutcome, SessionNegotiator};
use crate::peer::state::{Action, CallState, ConnectionEvent, ConnectionStateMachine};
use crate::peer::timers::TimerRegistry;
use crate::peer::transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};
use crate::peer::types::{IceCandidate, RemoteTrackInfo};
use crate::quality::{ConnectionQualitySample, QualityMonitor};
use crate::signaling::{SignalMessage, SignalPayload, SignalingTransport};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Внешние зависимости сессии
#[derive(Clone)]
pub struct SessionDeps {
    pub signaling: Arc<dyn SignalingTransport>,
    pub transports: Arc<dyn TransportFactory>,
    pub devices: Arc<dyn MediaDevices>,
}

/// Звонок в одной комнате. Все входы проходят через `handle`,
/// поэтому состояние согласования никогда не разделяется между задачами.
pub struct Session {
    room_id: String,
    local_id: String,
    config: CallConfig,
    deps: SessionDeps,
    inputs: mpsc::UnboundedSender<SessionInput>,
    bus: EventBus,
    machine: ConnectionStateMachine,
    timers: TimerRegistry,
    media: MediaTrackManager,
    identity: PeerIdentityTracker,
    negotiator: Option<SessionNegotiator>,
    /// Транспорт, которым сейчас не владеет negotiator: ещё подключается или уже закрывается
    pending_transport: Option<Arc<dyn PeerTransport>>,
    generation: u64,
    quality: QualityMonitor,
    forwarder: Option<JoinHandle<()>>,
    capture_watch: Option<JoinHandle<()>>,
    local_candidates: Vec<IceCandidate>,
    remote_tracks: Vec<RemoteTrackInfo>,
    joined: bool,
    closed: bool,
}

impl Session {
    pub fn new(
        room_id: impl Into<String>,
        local_id: impl Into<String>,
        config: CallConfig,
        deps: SessionDeps,
        inputs: mpsc::UnboundedSender<SessionInput>,
        bus: EventBus,
    ) -> Self {
        let machine = ConnectionStateMachine::new(config.recovery.policy());
        let media = MediaTrackManager::new(deps.devices.clone(), config.media_constraints());
        Self {
            room_id: room_id.into(),
            local_id: local_id.into(),
            timers: TimerRegistry::new(inputs.clone()),
            config,
            deps,
            inputs,
            bus,
            machine,
            media,
            identity: PeerIdentityTracker::new(),
            negotiator: None,
            pending_transport: None,
            generation: 0,
            quality: QualityMonitor::new(),
            forwarder: None,
            capture_watch: None,
            local_candidates: Vec::new(),
            remote_tracks: Vec::new(),
            joined: false,
            closed: false,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn state(&self) -> CallState {
        self.machine.state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.identity.current()
    }

    pub fn media(&self) -> &MediaTrackManager {
        &self.media
    }

    pub fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.negotiator.as_ref().map(|n| n.transport().clone())
    }

    fn negotiator_mut(&mut self) -> Result<&mut SessionNegotiator> {
        self.negotiator.as_mut().ok_or(CallError::NotJoined)
    }

    /// Единственная точка обработки входов
    pub async fn handle(&mut self, input: SessionInput) {
        if self.closed {
            if let SessionInput::Command(command) = input {
                command.reject(|| CallError::Closed);
            }
            return;
        }

        match input {
            SessionInput::Command(command) => self.handle_command(command).await,
            SessionInput::Signal(message) => {
                let kind = message.kind();
                if let Err(e) = self.handle_signal(message).await {
                    warn!("Failed to handle {kind}: {e}");
                }
            }
            SessionInput::Transport { generation, event } => {
                if generation != self.generation {
                    debug!("Ignoring event from stale transport generation {generation}");
                    return;
                }
                self.handle_transport_event(event).await;
            }
            SessionInput::TimerFired { purpose, token } => {
                if self.timers.take_fired(purpose, token) {
                    self.drive(ConnectionEvent::TimerFired(purpose)).await;
                }
            }
            SessionInput::CaptureEnded { source_id } => self.on_capture_ended(&source_id).await,
            SessionInput::Quality { generation, sample } => {
                self.on_quality_sample(generation, sample)
            }
            SessionInput::SignalingClosed => {
                warn!("Signaling channel closed, remote messages will no longer arrive");
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join(reply) => {
                let _ = reply.send(self.join().await);
            }
            Command::ToggleAudio(reply) => {
                let _ = reply.send(self.toggle_audio());
            }
            Command::ToggleVideo(reply) => {
                let _ = reply.send(self.toggle_video());
            }
            Command::StartScreenShare(reply) => {
                let _ = reply.send(self.start_screen_share().await);
            }
            Command::StopScreenShare(reply) => {
                let _ = reply.send(self.stop_screen_share().await);
            }
            Command::ShareLocation(location, reply) => {
                let _ = reply.send(self.share_location(location).await);
            }
        }
    }

    /// Захват медиа, транспорт, подписка на комнату и `ready`
    pub async fn join(&mut self) -> Result<()> {
        if self.joined {
            return Err(CallError::AlreadyJoined);
        }
        info!("Joining room {} as {}", self.room_id, self.local_id);

        let tracks = self.media.acquire_local_media().await?;
        self.bus.update(|s| {
            s.audio_enabled = tracks.audio.is_enabled();
            s.video_enabled = tracks.video.is_enabled();
        });

        if let Err(e) = self.create_transport().await {
            self.media.stop_all();
            return Err(e);
        }

        let mut inbound = match self.deps.signaling.subscribe() {
            Ok(inbound) => inbound,
            Err(e) => {
                self.media.stop_all();
                self.retire_transport().await;
                return Err(e.into());
            }
        };
        let tx = self.inputs.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if tx.send(SessionInput::Signal(message)).is_err() {
                    return;
                }
            }
            let _ = tx.send(SessionInput::SignalingClosed);
        }));

        self.joined = true;
        if let Some(negotiator) = &self.negotiator {
            negotiator.announce_ready().await;
        }
        Ok(())
    }

    async fn create_transport(&mut self) -> Result<Arc<dyn PeerTransport>> {
        self.generation += 1;
        let events = TransportEvents::new(self.generation, self.inputs.clone());
        let transport = self.deps.transports.create(events).await?;
        self.pending_transport = Some(transport.clone());
        if let Err(e) = self.media.attach_to(transport.as_ref()).await {
            let _ = transport.close().await;
            self.pending_transport = None;
            return Err(e);
        }
        self.pending_transport = None;
        self.negotiator = Some(SessionNegotiator::new(
            self.local_id.clone(),
            transport.clone(),
            self.deps.signaling.clone(),
            self.config.sdp_preferences(),
        ));
        debug!("Transport generation {} ready", self.generation);
        Ok(transport)
    }

    pub async fn handle_signal(&mut self, message: SignalMessage) -> Result<()> {
        let SignalMessage { from, payload } = message;
        if from == self.local_id {
            debug!("Dropping own {} echo", payload.kind());
            return Ok(());
        }
        if !self.joined {
            debug!("Not joined yet, dropping {} from {from}", payload.kind());
            return Ok(());
        }

        match payload {
            SignalPayload::Ready => {
                let observation = self.identity.observe_ready(&from);
                self.on_peer_observed(&from, observation).await?;
                self.make_offer(false).await
            }
            SignalPayload::Offer(offer) => {
                let observation = self.identity.observe_offer(&from);
                self.on_peer_observed(&from, observation).await?;
                let outcome = self
                    .negotiator_mut()?
                    .handle_incoming_offer(offer, &from)
                    .await?;
                if let OfferOutcome::Answered(_) = outcome {
                    self.drive(ConnectionEvent::DescriptionApplied).await;
                }
                Ok(())
            }
            SignalPayload::Answer(answer) => {
                if !self.identity.is_current(&from) {
                    debug!("Ignoring answer from untracked peer {from}");
                    return Ok(());
                }
                if self.negotiator_mut()?.handle_incoming_answer(answer).await? {
                    self.drive(ConnectionEvent::DescriptionApplied).await;
                }
                Ok(())
            }
            SignalPayload::IceCandidate(candidate) => {
                if self.identity.current().is_some_and(|current| current != from) {
                    debug!("Ignoring candidate from untracked peer {from}");
                    return Ok(());
                }
                self.negotiator_mut()?
                    .handle_incoming_candidate(candidate)
                    .await?;
                Ok(())
            }
            SignalPayload::Leave => {
                if !self.identity.is_current(&from) {
                    debug!("Ignoring leave from untracked peer {from}");
                    return Ok(());
                }
                info!("Peer {from} left the room");
                self.forget_remote_peer();
                self.reset_session(&format!("peer {from} left")).await
            }
            SignalPayload::LocationInfo(location) => {
                self.bus.emit(CallEvent::PeerLocation { from, location });
                Ok(())
            }
        }
    }

    async fn on_peer_observed(&mut self, from: &str, observation: PeerObservation) -> Result<()> {
        let used_transport = observation == PeerObservation::First
            && self.negotiator.as_ref().is_some_and(|n| n.has_negotiated());

        if observation.requires_reset() || used_transport {
            let reason = match &observation {
                PeerObservation::Rejoined => format!("peer {from} rejoined"),
                PeerObservation::Replaced { previous } => {
                    self.bus.emit(CallEvent::PeerLeft {
                        peer_id: previous.clone(),
                    });
                    format!("peer {previous} replaced by {from}")
                }
                _ => format!("peer {from} arrived on a used transport"),
            };
            self.reset_session(&reason).await?;
        }

        if observation != PeerObservation::Same {
            self.bus.update(|s| s.remote_peer = Some(from.to_owned()));
            self.bus.emit(CallEvent::PeerJoined {
                peer_id: from.to_owned(),
            });
        }
        Ok(())
    }

    async fn make_offer(&mut self, ice_restart: bool) -> Result<()> {
        if self
            .negotiator_mut()?
            .create_offer(ice_restart)
            .await?
            .is_some()
        {
            self.drive(ConnectionEvent::DescriptionApplied).await;
        }
        Ok(())
    }

    /// Пересоздаёт транспорт без повторного захвата устройств
    pub async fn reset_session(&mut self, reason: &str) -> Result<()> {
        info!("Resetting session: {reason}");
        self.quality.stop();
        self.local_candidates.clear();
        self.clear_remote_media();
        self.retire_transport().await;
        self.drive(ConnectionEvent::SessionReset).await;
        self.create_transport().await?;
        self.bus.emit(CallEvent::SessionReset {
            reason: reason.to_owned(),
        });
        Ok(())
    }

    /// Закрывает текущий транспорт. До конца закрытия он остаётся
    /// в `pending_transport`, чтобы прерванная обработка его не потеряла.
    async fn retire_transport(&mut self) {
        if let Some(mut negotiator) = self.negotiator.take() {
            self.pending_transport = Some(negotiator.transport().clone());
            negotiator.close().await;
            self.pending_transport = None;
        }
    }

    async fn drive(&mut self, event: ConnectionEvent) {
        let actions = self.machine.apply(event);
        self.run_actions(actions).await;
    }

    async fn run_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Arm(purpose, delay) => {
                    self.timers.arm(purpose, delay);
                }
                Action::Cancel(purpose) => {
                    self.timers.cancel(purpose);
                }
                Action::RestartIce => self.restart_ice().await,
                Action::EvictRemotePeer => {
                    warn!("Remote peer did not come back, evicting");
                    self.forget_remote_peer();
                }
                Action::StartQualityMonitor => {
                    if let Some(transport) = self.transport() {
                        self.quality.start(
                            transport,
                            self.generation,
                            self.inputs.clone(),
                            self.config.quality_interval(),
                        );
                    }
                }
                Action::StopQualityMonitor => self.quality.stop(),
                Action::Notify(state) => {
                    self.bus.update(|s| {
                        s.state = state;
                        if matches!(state, CallState::Connected | CallState::New) {
                            s.error = None;
                        }
                    });
                    self.bus.emit(CallEvent::StateChanged { state });
                }
                Action::GiveUp { attempts } => {
                    let err = CallError::ReconnectExhausted { attempts };
                    error!("{err}");
                    let message = err.to_string();
                    self.bus.update(|s| s.error = Some(message.clone()));
                    self.bus.emit(CallEvent::Fatal { message });
                }
                Action::ReleaseResources => self.release_resources().await,
            }
        }
    }

    async fn restart_ice(&mut self) {
        let Some(negotiator) = self.negotiator.as_mut() else {
            return;
        };
        match negotiator.restart_ice().await {
            Ok(Some(_)) => info!("ICE restart offer sent"),
            Ok(None) => debug!("ICE restart skipped: answering a remote offer"),
            Err(e) => warn!("ICE restart failed: {e}"),
        }
    }

    fn forget_remote_peer(&mut self) {
        if let Some(peer_id) = self.identity.clear() {
            self.bus.emit(CallEvent::PeerLeft { peer_id });
        }
        self.bus.update(|s| s.remote_peer = None);
        self.clear_remote_media();
    }

    fn clear_remote_media(&mut self) {
        if self.remote_tracks.is_empty() {
            return;
        }
        self.remote_tracks.clear();
        self.bus.update(|s| s.remote_tracks.clear());
        self.bus.emit(CallEvent::RemoteMediaCleared);
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.local_candidates.push(candidate.clone());
                if let Some(negotiator) = &self.negotiator {
                    negotiator.send(SignalPayload::IceCandidate(candidate)).await;
                }
            }
            TransportEvent::GatheringComplete => {
                analyze_candidates(&self.local_candidates);
            }
            TransportEvent::StateChanged(state) => {
                self.drive(ConnectionEvent::Transport(state)).await;
            }
            TransportEvent::IceStateChanged(state) => {
                self.bus.update(|s| s.ice_state = state);
                self.bus.emit(CallEvent::IceStateChanged { state });
            }
            TransportEvent::RemoteTrack(info) => {
                if self.remote_tracks.contains(&info) {
                    return;
                }
                self.remote_tracks.push(info.clone());
                let tracks = self.remote_tracks.clone();
                self.bus.update(|s| s.remote_tracks = tracks);
                self.bus.emit(CallEvent::RemoteTrack(info));
            }
        }
    }

    fn on_quality_sample(&mut self, generation: u64, sample: ConnectionQualitySample) {
        if generation != self.generation || self.machine.state() != CallState::Connected {
            debug!("Dropping quality sample from a stale monitor");
            return;
        }
        let bucket = sample.bucket();
        self.bus.update(|s| s.quality = Some(bucket));
        self.bus.emit(CallEvent::Quality { sample, bucket });
    }

    fn toggle_audio(&mut self) -> Result<bool> {
        let enabled = self.media.toggle_audio()?;
        self.bus.update(|s| s.audio_enabled = enabled);
        self.bus.emit(CallEvent::AudioToggled { enabled });
        Ok(enabled)
    }

    fn toggle_video(&mut self) -> Result<bool> {
        let enabled = self.media.toggle_video()?;
        self.bus.update(|s| s.video_enabled = enabled);
        self.bus.emit(CallEvent::VideoToggled { enabled });
        Ok(enabled)
    }

    async fn start_screen_share(&mut self) -> Result<()> {
        let transport = self.transport().ok_or(CallError::NotJoined)?;
        let Some(screen) = self.media.start_screen_share(transport.as_ref()).await? else {
            return Ok(());
        };
        self.watch_capture(&screen);
        self.bus.update(|s| s.screen_sharing = true);
        self.bus.emit(CallEvent::ScreenShare { active: true });
        Ok(())
    }

    async fn stop_screen_share(&mut self) -> Result<()> {
        let was_sharing = self.media.is_sharing();
        let transport = self.transport();
        let result = self.media.stop_screen_share(transport.as_deref()).await;
        if was_sharing && !self.media.is_sharing() {
            self.stop_capture_watch();
            self.bus.update(|s| s.screen_sharing = false);
            self.bus.emit(CallEvent::ScreenShare { active: false });
        }
        result.map(|_| ())
    }

    fn watch_capture(&mut self, screen: &MediaSource) {
        self.stop_capture_watch();
        let mut ended = screen.ended();
        let source_id = screen.id().to_owned();
        let tx = self.inputs.clone();
        self.capture_watch = Some(tokio::spawn(async move {
            let ended_by_user = ended.wait_for(|e| *e).await.is_ok();
            if ended_by_user {
                let _ = tx.send(SessionInput::CaptureEnded { source_id });
            }
        }));
    }

    fn stop_capture_watch(&mut self) {
        if let Some(watch) = self.capture_watch.take() {
            watch.abort();
        }
    }

    async fn on_capture_ended(&mut self, source_id: &str) {
        if !self.media.screen().is_some_and(|s| s.id() == source_id) {
            debug!("Capture {source_id} already replaced");
            return;
        }
        info!("Screen capture ended outside the app, reverting to camera");
        if let Err(e) = self.stop_screen_share().await {
            warn!("Failed to restore camera after capture ended: {e}");
        }
    }

    async fn share_location(&mut self, location: Value) -> Result<()> {
        let negotiator = self.negotiator.as_ref().ok_or(CallError::NotJoined)?;
        negotiator.send(SignalPayload::LocationInfo(location)).await;
        Ok(())
    }

    /// Выход из комнаты. Повторные вызовы ничего не делают.
    pub async fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        info!("Leaving room {}", self.room_id);
        if self.joined {
            if let Some(negotiator) = &self.negotiator {
                negotiator.send(SignalPayload::Leave).await;
            }
        }
        self.drive(ConnectionEvent::Teardown).await;
        self.closed = true;
    }

    async fn release_resources(&mut self) {
        self.quality.stop();
        self.timers.cancel_all();
        self.stop_capture_watch();
        self.media.stop_all();
        if let Some(transport) = self.pending_transport.take() {
            debug!("Closing transport left by an interrupted step");
            if let Err(e) = transport.close().await {
                debug!("Transport close failed: {e}");
            }
        }
        self.retire_transport().await;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.deps.signaling.close().await;
        self.identity.clear();
        self.remote_tracks.clear();
        self.local_candidates.clear();
        self.bus.update(|s| {
            s.remote_peer = None;
            s.remote_tracks.clear();
            s.screen_sharing = false;
            s.quality = None;
        });
        debug!("Session resources released");
    }
}

#[cfg(test)]
mod tests;
