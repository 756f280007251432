use super::*;
use crate::error::DeviceError;
use crate::peer::testing::{FakeDevices, FakeFactory, FakeTransport, RecordingSignaling};
use crate::peer::timers::TimerPurpose;
use crate::peer::types::{IceCandidate, IceState, MediaKind, PeerState, SessionDescription, SignalingState};
use crate::signaling::SignalKind;
use serde_json::json;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;

struct Harness {
    session: Session,
    rx: mpsc::UnboundedReceiver<SessionInput>,
    factory: Arc<FakeFactory>,
    signaling: Arc<RecordingSignaling>,
    devices: Arc<FakeDevices>,
    bus: EventBus,
    events: broadcast::Receiver<CallEvent>,
}

fn harness(local_id: &str) -> Harness {
    harness_with(local_id, FakeDevices::default())
}

fn harness_with(local_id: &str, devices: FakeDevices) -> Harness {
    let (tx, rx) = mpsc::unbounded_channel();
    let factory = Arc::new(FakeFactory::new());
    let signaling = Arc::new(RecordingSignaling::new());
    let devices = Arc::new(devices);
    let deps = SessionDeps {
        signaling: signaling.clone(),
        transports: factory.clone(),
        devices: devices.clone(),
    };
    let bus = EventBus::new();
    let events = bus.subscribe();
    let session = Session::new("room", local_id, CallConfig::default(), deps, tx, bus.clone());
    Harness {
        session,
        rx,
        factory,
        signaling,
        devices,
        bus,
        events,
    }
}

impl Harness {
    async fn joined(local_id: &str) -> Self {
        let mut h = harness(local_id);
        h.session.join().await.unwrap();
        h
    }

    async fn signal(&mut self, from: &str, payload: SignalPayload) {
        self.session
            .handle(SessionInput::Signal(SignalMessage::new(from, payload)))
            .await;
    }

    /// Обрабатывает всё, что уже лежит в очереди
    async fn pump(&mut self) {
        while let Ok(input) = self.rx.try_recv() {
            self.session.handle(input).await;
        }
    }

    /// Обрабатывает входы, пока не сработает таймер нужного назначения
    async fn run_until_timer(&mut self, purpose: TimerPurpose) {
        loop {
            let input = self.rx.recv().await.unwrap();
            let found = matches!(input, SessionInput::TimerFired { purpose: p, .. } if p == purpose);
            self.session.handle(input).await;
            if found {
                return;
            }
        }
    }

    async fn emit(&mut self, event: TransportEvent) {
        self.transport().emit(event);
        self.pump().await;
    }

    fn transport(&self) -> Arc<FakeTransport> {
        self.factory.latest()
    }

    fn sent_kinds(&self) -> Vec<SignalKind> {
        self.signaling.sent().iter().map(|m| m.kind()).collect()
    }

    fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// ready от пира, наш offer, его answer, транспорт сообщает Connected
    async fn connect_to(&mut self, peer: &str) {
        self.signal(peer, SignalPayload::Ready).await;
        self.signal(peer, SignalPayload::Answer(SessionDescription::answer("v=0")))
            .await;
        self.emit(TransportEvent::StateChanged(PeerState::Connected)).await;
        assert_eq!(self.session.state(), CallState::Connected);
    }

    async fn command<T>(&mut self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.session.handle(SessionInput::Command(make(tx))).await;
        rx.await.unwrap()
    }
}

fn candidate(n: u16) -> IceCandidate {
    IceCandidate {
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        ..IceCandidate::new(format!(
            "candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"
        ))
    }
}

fn assert_elapsed(started: Instant, expected: Duration) {
    let elapsed = started.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "expected {expected:?}, got {elapsed:?}"
    );
}

#[tokio::test]
async fn join_attaches_media_before_announcing_ready() {
    let h = Harness::joined("alice").await;

    assert_eq!(h.sent_kinds(), vec![SignalKind::Ready]);
    assert_eq!(h.factory.created(), 1);
    assert_eq!(h.transport().sender_count().await, 2);
    assert_eq!(h.devices.user_media_requests(), 1);

    let snapshot = h.bus.snapshot();
    assert!(snapshot.audio_enabled);
    assert!(snapshot.video_enabled);
    assert_eq!(snapshot.state, CallState::New);
}

#[tokio::test]
async fn joining_twice_is_rejected() {
    let mut h = Harness::joined("alice").await;
    assert!(matches!(h.session.join().await, Err(CallError::AlreadyJoined)));
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn device_failure_aborts_join() {
    let mut h = harness_with(
        "alice",
        FakeDevices::failing(DeviceError::PermissionDenied("camera".into())),
    );

    let err = h.session.join().await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Device(DeviceError::PermissionDenied(_))
    ));
    assert_eq!(h.factory.created(), 0);
    assert!(h.signaling.sent().is_empty());
}

#[tokio::test]
async fn ready_from_peer_triggers_offer() {
    let mut h = Harness::joined("alice").await;
    h.signal("bob", SignalPayload::Ready).await;

    assert_eq!(h.sent_kinds(), vec![SignalKind::Ready, SignalKind::Offer]);
    assert_eq!(h.session.remote_peer(), Some("bob"));
    assert_eq!(h.session.state(), CallState::Connecting);
    assert_eq!(h.transport().signaling_state(), SignalingState::HaveLocalOffer);
    assert!(h.drain_events().contains(&CallEvent::PeerJoined {
        peer_id: "bob".into()
    }));
}

#[tokio::test]
async fn own_echo_is_dropped() {
    let mut h = Harness::joined("alice").await;
    h.signal("alice", SignalPayload::Ready).await;

    assert_eq!(h.sent_kinds(), vec![SignalKind::Ready]);
    assert_eq!(h.session.remote_peer(), None);
}

#[tokio::test]
async fn rejoining_peer_resets_exactly_once() {
    let mut h = Harness::joined("alice").await;
    h.connect_to("bob").await;
    h.drain_events();

    h.signal("bob", SignalPayload::Ready).await;

    assert_eq!(h.factory.created(), 2);
    assert!(h.factory.all()[0].is_closed());
    let resets = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, CallEvent::SessionReset { .. }))
        .count();
    assert_eq!(resets, 1);
    // новый транспорт сразу предлагает offer и несёт те же источники
    assert_eq!(h.transport().offers_created(), 1);
    assert_eq!(h.transport().sender_count().await, 2);
    assert_eq!(h.devices.user_media_requests(), 1);
    assert_eq!(h.session.state(), CallState::Connecting);
}

#[tokio::test]
async fn offer_from_new_peer_replaces_previous_one() {
    let mut h = Harness::joined("alice").await;
    h.signal("bob", SignalPayload::Ready).await;
    h.drain_events();

    h.signal("carol", SignalPayload::Offer(SessionDescription::offer("v=0")))
        .await;

    assert_eq!(h.factory.created(), 2);
    assert_eq!(h.session.remote_peer(), Some("carol"));
    assert_eq!(h.sent_kinds().last(), Some(&SignalKind::Answer));
    assert!(h.transport().remote_description().is_some());

    let events = h.drain_events();
    assert!(events.contains(&CallEvent::PeerLeft {
        peer_id: "bob".into()
    }));
    assert!(events.contains(&CallEvent::PeerJoined {
        peer_id: "carol".into()
    }));
}

#[tokio::test]
async fn events_from_replaced_transport_are_ignored() {
    let mut h = Harness::joined("alice").await;
    h.signal("bob", SignalPayload::Ready).await;
    let stale = h.transport();

    h.signal("bob", SignalPayload::Ready).await;
    assert_eq!(h.factory.created(), 2);

    stale.emit(TransportEvent::StateChanged(PeerState::Connected));
    h.pump().await;
    assert_eq!(h.session.state(), CallState::Connecting);

    h.emit(TransportEvent::StateChanged(PeerState::Connected)).await;
    assert_eq!(h.session.state(), CallState::Connected);
}

#[tokio::test]
async fn early_candidates_are_applied_after_offer() {
    let mut h = Harness::joined("alice").await;
    h.signal("bob", SignalPayload::IceCandidate(candidate(1))).await;
    h.signal("bob", SignalPayload::IceCandidate(candidate(2))).await;
    assert!(h.transport().applied_candidates().is_empty());

    h.signal("bob", SignalPayload::Offer(SessionDescription::offer("v=0")))
        .await;

    assert_eq!(h.transport().applied_candidates(), vec![candidate(1), candidate(2)]);
    assert_eq!(h.sent_kinds(), vec![SignalKind::Ready, SignalKind::Answer]);
}

#[tokio::test]
async fn candidates_from_other_peers_are_dropped() {
    let mut h = Harness::joined("alice").await;
    h.signal("bob", SignalPayload::Offer(SessionDescription::offer("v=0")))
        .await;
    h.signal("mallory", SignalPayload::IceCandidate(candidate(3))).await;
    h.signal("bob", SignalPayload::IceCandidate(candidate(4))).await;

    assert_eq!(h.transport().applied_candidates(), vec![candidate(4)]);
}

#[tokio::test]
async fn local_candidates_are_trickled() {
    let mut h = Harness::joined("alice").await;
    h.emit(TransportEvent::LocalCandidate(candidate(7))).await;
    h.emit(TransportEvent::GatheringComplete).await;

    let last = h.signaling.sent().pop().unwrap();
    assert_eq!(last.payload, SignalPayload::IceCandidate(candidate(7)));
    assert_eq!(last.from, "alice");
}

#[tokio::test(start_paused = true)]
async fn disconnect_restarts_ice_then_evicts_peer() {
    let mut h = Harness::joined("alice").await;
    h.connect_to("bob").await;
    h.drain_events();

    let started = Instant::now();
    h.emit(TransportEvent::StateChanged(PeerState::Disconnected)).await;
    assert_eq!(h.session.state(), CallState::Disconnected);

    h.run_until_timer(TimerPurpose::IceRestart).await;
    assert_elapsed(started, Duration::from_secs(3));
    assert_eq!(h.transport().ice_restarts(), 1);
    assert_eq!(h.sent_kinds().last(), Some(&SignalKind::Offer));

    h.run_until_timer(TimerPurpose::PeerEviction).await;
    assert_elapsed(started, Duration::from_secs(10));
    assert_eq!(h.session.remote_peer(), None);
    assert!(h.drain_events().contains(&CallEvent::PeerLeft {
        peer_id: "bob".into()
    }));
    assert_eq!(h.bus.snapshot().remote_peer, None);
}

#[tokio::test(start_paused = true)]
async fn recovery_cancels_pending_timers() {
    let mut h = Harness::joined("alice").await;
    h.connect_to("bob").await;

    h.emit(TransportEvent::StateChanged(PeerState::Disconnected)).await;
    h.emit(TransportEvent::StateChanged(PeerState::Connected)).await;

    tokio::time::sleep(Duration::from_secs(15)).await;
    h.pump().await;
    assert_eq!(h.transport().ice_restarts(), 0);
    assert_eq!(h.session.remote_peer(), Some("bob"));
    assert_eq!(h.session.state(), CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn failed_transport_backs_off_and_gives_up() {
    let mut h = Harness::joined("alice").await;
    h.connect_to("bob").await;
    h.drain_events();

    for (attempt, delay_ms) in [(1, 1000), (2, 2000), (3, 4000)] {
        let started = Instant::now();
        h.emit(TransportEvent::StateChanged(PeerState::Failed)).await;
        assert_eq!(h.session.state(), CallState::Failed);

        h.run_until_timer(TimerPurpose::ReconnectBackoff).await;
        assert_elapsed(started, Duration::from_millis(delay_ms));
        assert_eq!(h.transport().ice_restarts(), attempt);

        h.signal("bob", SignalPayload::Answer(SessionDescription::answer("v=0")))
            .await;
    }

    h.emit(TransportEvent::StateChanged(PeerState::Failed)).await;
    assert_eq!(h.transport().ice_restarts(), 3);

    let fatal = h
        .drain_events()
        .into_iter()
        .find(|e| matches!(e, CallEvent::Fatal { .. }));
    assert!(fatal.is_some());
    assert!(h.bus.snapshot().error.is_some());
}

#[tokio::test(start_paused = true)]
async fn every_backoff_attempt_restarts_ice_without_an_answer() {
    let mut h = Harness::joined("alice").await;
    h.connect_to("bob").await;

    h.emit(TransportEvent::StateChanged(PeerState::Disconnected)).await;
    h.run_until_timer(TimerPurpose::IceRestart).await;
    assert_eq!(h.transport().ice_restarts(), 1);
    assert_eq!(h.transport().signaling_state(), SignalingState::HaveLocalOffer);

    for attempt in 1..=3 {
        h.emit(TransportEvent::StateChanged(PeerState::Failed)).await;
        h.run_until_timer(TimerPurpose::ReconnectBackoff).await;
        assert_eq!(h.transport().ice_restarts(), 1 + attempt);
        assert_eq!(h.transport().rollbacks(), attempt);
        assert_eq!(h.sent_kinds().last(), Some(&SignalKind::Offer));
    }

    h.emit(TransportEvent::StateChanged(PeerState::Failed)).await;
    assert_eq!(h.transport().ice_restarts(), 4);
    assert!(h.bus.snapshot().error.is_some());
}

#[tokio::test(start_paused = true)]
async fn quality_samples_flow_only_while_connected() {
    let mut h = Harness::joined("alice").await;
    h.connect_to("bob").await;
    h.drain_events();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    h.pump().await;
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, CallEvent::Quality { .. })));
    assert!(h.bus.snapshot().quality.is_some());

    h.emit(TransportEvent::StateChanged(PeerState::Disconnected)).await;
    h.drain_events();
    let generation = h.session.generation;
    let sample = ConnectionQualitySample {
        bitrate_kbps: 900.0,
        packet_loss_count: 0,
        jitter_seconds: 0.0,
        round_trip_ms: 40.0,
        ice_state: IceState::Connected,
        sampled_at: chrono::Utc::now(),
    };
    h.session
        .handle(SessionInput::Quality { generation, sample })
        .await;
    assert!(!h
        .drain_events()
        .iter()
        .any(|e| matches!(e, CallEvent::Quality { .. })));
}

#[tokio::test]
async fn toggles_keep_senders_in_place() {
    let mut h = Harness::joined("alice").await;
    let transport = h.transport();

    assert!(!h.command(Command::ToggleAudio).await.unwrap());
    assert!(!h.command(Command::ToggleVideo).await.unwrap());
    assert!(h.command(Command::ToggleVideo).await.unwrap());

    assert_eq!(transport.sender_count().await, 2);
    assert_eq!(transport.replacements(), 0);
    let snapshot = h.bus.snapshot();
    assert!(!snapshot.audio_enabled);
    assert!(snapshot.video_enabled);
    assert!(h.drain_events().contains(&CallEvent::AudioToggled { enabled: false }));
}

#[tokio::test]
async fn commands_before_join_fail() {
    let mut h = harness("alice");
    assert!(matches!(
        h.command(Command::ToggleAudio).await,
        Err(CallError::NotJoined)
    ));
    assert!(matches!(
        h.command(Command::StartScreenShare).await,
        Err(CallError::NotJoined)
    ));
}

#[tokio::test]
async fn screen_share_swaps_and_restores_camera() {
    let mut h = Harness::joined("alice").await;
    let transport = h.transport();
    let camera = transport.sender_source(MediaKind::Video).unwrap();

    h.command(Command::StartScreenShare).await.unwrap();
    let screen = h.devices.last_screen().unwrap();
    assert!(transport.sender_source(MediaKind::Video).unwrap().same_as(&screen));
    assert!(h.bus.snapshot().screen_sharing);

    h.command(Command::StopScreenShare).await.unwrap();
    assert!(transport.sender_source(MediaKind::Video).unwrap().same_as(&camera));
    assert!(screen.is_stopped());
    assert!(!h.bus.snapshot().screen_sharing);
    assert_eq!(transport.sender_count().await, 2);
}

#[tokio::test]
async fn ended_capture_reverts_to_camera() {
    let mut h = Harness::joined("alice").await;
    let transport = h.transport();
    let camera = transport.sender_source(MediaKind::Video).unwrap();

    h.command(Command::StartScreenShare).await.unwrap();
    h.devices.last_screen().unwrap().end();

    let input = h.rx.recv().await.unwrap();
    assert!(matches!(input, SessionInput::CaptureEnded { .. }));
    h.session.handle(input).await;

    assert!(transport.sender_source(MediaKind::Video).unwrap().same_as(&camera));
    assert!(!h.session.media().is_sharing());
    assert!(h
        .drain_events()
        .contains(&CallEvent::ScreenShare { active: false }));
}

#[tokio::test]
async fn leave_from_peer_resets_and_accepts_next_one() {
    let mut h = Harness::joined("alice").await;
    h.connect_to("bob").await;
    h.emit(TransportEvent::RemoteTrack(RemoteTrackInfo {
        id: "v".into(),
        stream_id: "s".into(),
        kind: MediaKind::Video,
    }))
    .await;
    h.drain_events();

    h.signal("bob", SignalPayload::Leave).await;

    assert_eq!(h.factory.created(), 2);
    assert_eq!(h.session.remote_peer(), None);
    assert_eq!(h.session.state(), CallState::New);
    let events = h.drain_events();
    assert!(events.contains(&CallEvent::PeerLeft {
        peer_id: "bob".into()
    }));
    assert!(events.contains(&CallEvent::RemoteMediaCleared));
    assert!(h.bus.snapshot().remote_tracks.is_empty());

    h.signal("bob", SignalPayload::Ready).await;
    assert_eq!(h.factory.created(), 2);
    assert_eq!(h.session.remote_peer(), Some("bob"));
}

#[tokio::test]
async fn leave_from_stranger_is_ignored() {
    let mut h = Harness::joined("alice").await;
    h.signal("bob", SignalPayload::Ready).await;
    h.signal("mallory", SignalPayload::Leave).await;

    assert_eq!(h.factory.created(), 1);
    assert_eq!(h.session.remote_peer(), Some("bob"));
}

#[tokio::test]
async fn location_is_forwarded_both_ways() {
    let mut h = Harness::joined("alice").await;
    let location = json!({"lat": 55.75, "lon": 37.62});

    h.command(|reply| Command::ShareLocation(location.clone(), reply))
        .await
        .unwrap();
    assert_eq!(
        h.signaling.sent().last().unwrap().payload,
        SignalPayload::LocationInfo(location.clone())
    );

    h.signal("bob", SignalPayload::LocationInfo(location.clone()))
        .await;
    assert!(h.drain_events().contains(&CallEvent::PeerLocation {
        from: "bob".into(),
        location
    }));
}

#[tokio::test]
async fn closed_signaling_does_not_break_negotiation() {
    let mut h = Harness::joined("alice").await;
    h.signaling.close().await;

    h.signal("bob", SignalPayload::Ready).await;

    assert_eq!(h.transport().offers_created(), 1);
    assert_eq!(h.session.state(), CallState::Connecting);
    assert_eq!(h.sent_kinds(), vec![SignalKind::Ready]);
}

#[tokio::test]
async fn cleanup_is_idempotent() {
    let mut h = Harness::joined("alice").await;
    h.connect_to("bob").await;
    let transport = h.transport();
    let audio = transport.sender_source(MediaKind::Audio).unwrap();

    h.session.cleanup().await;
    h.session.cleanup().await;

    let leaves = h
        .signaling
        .sent()
        .iter()
        .filter(|m| m.kind() == SignalKind::Leave)
        .count();
    assert_eq!(leaves, 1);
    assert!(transport.is_closed());
    assert!(audio.is_stopped());
    assert!(h.signaling.is_closed());
    assert!(h.session.is_closed());
    assert_eq!(h.bus.snapshot().state, CallState::Closed);

    assert!(matches!(
        h.command(Command::ToggleAudio).await,
        Err(CallError::Closed)
    ));
}

#[tokio::test]
async fn simultaneous_join_converges_on_one_offer() {
    let mut alice = Harness::joined("alice").await;
    let mut bob = Harness::joined("bob").await;

    async fn exchange(from: &mut Harness, to: &mut Harness) {
        for message in from.signaling.take_sent() {
            to.session.handle(SessionInput::Signal(message)).await;
        }
    }

    // оба получают ready друг друга и оба шлют offer
    let alice_ready = alice.signaling.take_sent();
    let bob_ready = bob.signaling.take_sent();
    for message in bob_ready {
        alice.session.handle(SessionInput::Signal(message)).await;
    }
    for message in alice_ready {
        bob.session.handle(SessionInput::Signal(message)).await;
    }
    assert_eq!(alice.transport().offers_created(), 1);
    assert_eq!(bob.transport().offers_created(), 1);

    exchange(&mut alice, &mut bob).await;
    exchange(&mut bob, &mut alice).await;
    exchange(&mut alice, &mut bob).await;

    // "alice" < "bob": alice уступает, bob оставляет свой offer
    assert_eq!(alice.transport().rollbacks(), 1);
    assert_eq!(bob.transport().rollbacks(), 0);
    assert_eq!(alice.transport().signaling_state(), SignalingState::Stable);
    assert_eq!(bob.transport().signaling_state(), SignalingState::Stable);
    assert_eq!(alice.factory.created(), 1);
    assert_eq!(bob.factory.created(), 1);
}
