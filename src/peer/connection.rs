use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::MediaSource;
use crate::peer::transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};
use crate::peer::types::{
    IceCandidate, IceState, MediaKind, PeerState, RemoteTrackInfo, SdpType, ServerConfig,
    SessionDescription, SignalingState, TransportStats,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        RTCPeerConnection,
    },
};

/// Создаёт peer connection с медиа-движком и подписками на события
pub async fn new_peer(
    servers: &[ServerConfig],
    events: TransportEvents,
) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(rtc_config(servers)).await?);
    debug!(
        "Peer connection created (generation {})",
        events.generation()
    );

    let ev = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let ev = ev.clone();
        Box::pin(async move {
            let Some(c) = cand else {
                // None означает конец сбора
                debug!("ICE candidate gathering completed (null candidate received)");
                ev.emit(TransportEvent::GatheringComplete);
                return;
            };
            dump_candidate("LOCAL", &c);
            match c.to_json() {
                Ok(init) => {
                    ev.emit(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!("Failed to serialize local candidate: {e}"),
            }
        })
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {state:?}");
        Box::pin(async {})
    }));

    let ev = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        debug!("ICE connection state changed to: {state:?}");
        ev.emit(TransportEvent::IceStateChanged(ice_state_from(state)));
        Box::pin(async {})
    }));

    // слабая ссылка, чтобы обработчик не держал соединение живым
    let weak_pc = Arc::downgrade(&pc);
    let ev = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("Peer connection state changed to: {st:?}");
        if st == RTCPeerConnectionState::Failed {
            if let Some(pc) = weak_pc.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }
        ev.emit(TransportEvent::StateChanged(peer_state_from(st)));
        Box::pin(async {})
    }));

    let ev = events;
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        };
        let info = RemoteTrackInfo {
            id: track.id(),
            stream_id: track.stream_id(),
            kind,
        };
        info!("Remote {kind} track {} arrived", info.id);
        ev.emit(TransportEvent::RemoteTrack(info));

        // вычитываем RTP, иначе буферы приёмника переполнятся
        tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
        Box::pin(async {})
    }));

    Ok(pc)
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = if servers.is_empty() {
        vec![RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            ..Default::default()
        }]
    } else {
        get_user_ice_servers(servers)
    };

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Переводит пользовательские серверы в формат webrtc-rs
pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn peer_state_from(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

fn ice_state_from(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
    }
}

fn signaling_state_from(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(CallError::Transport(format!(
            "unexpected description type {other}"
        ))),
    }
}

/// Транспорт поверх webrtc-rs
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
}

impl RtcTransport {
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            pc,
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    fn sender(&self, kind: MediaKind) -> Option<Arc<RTCRtpSender>> {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    fn signaling_state(&self) -> SignalingState {
        signaling_state_from(self.pc.signaling_state())
    }

    fn ice_state(&self) -> IceState {
        ice_state_from(self.pc.ice_connection_state())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        from_rtc(self.pc.create_offer(options).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let Some(mut desc) = self.pc.local_description().await else {
            return Ok(());
        };
        desc.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn attach_source(&self, source: &MediaSource) -> Result<()> {
        let track: Arc<dyn TrackLocal + Send + Sync> = source.track();
        let sender = self.pc.add_track(track).await?;

        // RTCP нужно вычитывать, чтобы работали интерсепторы
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtcp_sender.read(&mut rtcp_buf).await {}
        });

        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.kind(), sender);
        debug!("Attached {} track {}", source.kind(), source.id());
        Ok(())
    }

    async fn replace_source(&self, kind: MediaKind, source: &MediaSource) -> Result<()> {
        let sender = self
            .sender(kind)
            .ok_or_else(|| CallError::Transport(format!("no {kind} sender to replace")))?;
        let track: Arc<dyn TrackLocal + Send + Sync> = source.track();
        sender.replace_track(Some(track)).await?;
        debug!("Replaced {kind} track with {}", source.id());
        Ok(())
    }

    async fn sender_count(&self) -> usize {
        self.pc.get_senders().await.len()
    }

    async fn stats(&self) -> Result<TransportStats> {
        let report = self.pc.get_stats().await;
        let mut stats = TransportStats::default();
        let mut pair_rtt = None;

        for (_, v) in report.reports {
            match v {
                StatsReportType::InboundRTP(inbound) => {
                    stats.bytes_received += inbound.bytes_received;
                }
                // отчёт собеседника о нашем исходящем потоке
                StatsReportType::RemoteInboundRTP(remote) => {
                    stats.outbound_packets_lost += remote.packets_lost;
                    if let Some(rtt) = remote.round_trip_time {
                        let rtt_ms = rtt * 1000.0;
                        stats.round_trip_ms = Some(stats.round_trip_ms.map_or(rtt_ms, |r| r.max(rtt_ms)));
                    }
                }
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    pair_rtt = Some(pair.current_round_trip_time * 1000.0);
                }
                _ => {}
            }
        }
        if stats.round_trip_ms.is_none() {
            stats.round_trip_ms = pair_rtt;
        }
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Создаёт `RtcTransport` с ICE серверами из конфигурации
pub struct RtcTransportFactory {
    ice_servers: Vec<ServerConfig>,
}

impl RtcTransportFactory {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let pc = new_peer(&self.ice_servers, events).await?;
        Ok(Arc::new(RtcTransport::new(pc)))
    }
}
