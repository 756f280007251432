use crate::error::Result;
use crate::peer::transport::PeerTransport;
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::{
    api::APIBuilder,
    ice_transport::{ice_gatherer_state::RTCIceGathererState, ice_server::RTCIceServer},
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

/// Сколько ждём подходящего кандидата при проверке ICE сервера
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Удалённые кандидаты, пришедшие раньше remote description.
/// Отдаются строго в порядке прихода и ровно один раз.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        debug!(
            "Remote description not set yet, queuing candidate ({} pending)",
            self.pending.len() + 1
        );
        self.pending.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    /// Применяет все отложенные кандидаты после установки remote description.
    /// Ошибка одного кандидата не мешает остальным.
    pub async fn flush(&mut self, transport: &dyn PeerTransport) -> usize {
        let candidates = self.drain();
        let total = candidates.len();
        for candidate in candidates {
            debug!("Applying pending candidate: {}", candidate.candidate);
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("Failed to apply pending candidate: {e}");
            }
        }
        if total > 0 {
            info!("Flushed {total} pending ICE candidates");
        }
        total
    }

    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            debug!("Dropping {} pending candidates", self.pending.len());
        }
        self.pending.clear();
    }
}

/// Разбивка кандидатов по типам
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateBreakdown {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateBreakdown {
    let mut breakdown = CandidateBreakdown::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            breakdown.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            breakdown.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            breakdown.relay += 1;
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        breakdown.host, breakdown.srflx, breakdown.relay
    );

    if breakdown.relay == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
    breakdown
}

/// Подходит ли кандидат для проверки сервера данного типа:
/// STUN даёт srflx, TURN даёт relay
pub fn candidate_matches_server(server_type: &str, candidate: &str) -> bool {
    match server_type {
        "stun" => candidate.contains("srflx"),
        "turn" => candidate.contains("relay"),
        _ => false,
    }
}

/// Проверяет доступность ICE сервера: поднимает одноразовое соединение,
/// запускает сбор кандидатов и ждёт srflx/relay кандидата не дольше `PROBE_TIMEOUT`.
pub async fn probe_ice_server(config: &ServerConfig) -> Result<bool> {
    let url = add_ice_url_scheme(config);
    debug!("Probing ICE server '{}' -> '{}'", config.url, url);

    let ice_server = RTCIceServer {
        urls: vec![url],
        username: config.username.clone().unwrap_or_default(),
        credential: config.credential.clone().unwrap_or_default(),
    };

    let rtc_config = RTCConfiguration {
        ice_servers: vec![ice_server],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);

    let available = check_via_ice_gathering(&peer_connection, &config.r#type).await;
    if let Err(e) = peer_connection.close().await {
        debug!("Failed to close probe connection: {e}");
    }
    available
}

async fn check_via_ice_gathering(
    peer_connection: &Arc<RTCPeerConnection>,
    server_type: &str,
) -> Result<bool> {
    let (state_tx, mut state_rx) = mpsc::channel(10);
    peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
        let tx = state_tx.clone();
        debug!("Probe gathering state changed to: {state:?}");
        Box::pin(async move {
            let _ = tx.send(state).await;
        })
    }));

    let (candidate_tx, mut candidate_rx) = mpsc::channel(10);
    let server_type = server_type.to_owned();
    peer_connection.on_ice_candidate(Box::new(move |candidate| {
        let tx = candidate_tx.clone();
        let server_type = server_type.clone();
        Box::pin(async move {
            let Some(c) = candidate else {
                return;
            };
            match c.to_json() {
                Ok(json) if candidate_matches_server(&server_type, &json.candidate) => {
                    debug!("Found {server_type} candidate: {}", json.candidate);
                    let _ = tx.send(()).await;
                }
                Ok(json) => debug!("Candidate type mismatch for {server_type}: {}", json.candidate),
                Err(e) => debug!("Failed to get candidate JSON: {e}"),
            }
        })
    }));

    // data channel нужен только чтобы offer содержал хоть одну секцию
    peer_connection.create_data_channel("probe", None).await?;
    let offer = peer_connection.create_offer(None).await?;
    peer_connection.set_local_description(offer).await?;

    let matched = tokio::select! {
        result = timeout(PROBE_TIMEOUT, candidate_rx.recv()) => match result {
            Ok(Some(())) => true,
            Ok(None) => false,
            Err(_) => {
                debug!("Timeout waiting for candidate match");
                false
            }
        },
        _ = async {
            while let Some(state) = state_rx.recv().await {
                if state == RTCIceGathererState::Complete {
                    break;
                }
            }
        } => {
            // сбор мог закончиться сразу после нужного кандидата
            candidate_rx.try_recv().is_ok()
        }
    };

    info!("ICE server probe finished: available={matched}");
    Ok(matched)
}
