use crate::peer::transport::PeerTransport;
use crate::peer::types::{IceState, TransportStats};
use crate::session::SessionInput;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QualityBucket {
    Connecting,
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Классификация качества связи, первое совпадение выигрывает
pub fn classify(bitrate_kbps: f64, packet_loss: f64, round_trip_ms: f64, ice: IceState) -> QualityBucket {
    if ice.is_establishing() {
        QualityBucket::Connecting
    } else if bitrate_kbps > 1000.0 && packet_loss < 1.0 && round_trip_ms < 150.0 {
        QualityBucket::Excellent
    } else if bitrate_kbps > 500.0 && packet_loss < 3.0 && round_trip_ms < 200.0 {
        QualityBucket::Good
    } else if bitrate_kbps > 300.0 && packet_loss < 5.0 && round_trip_ms < 300.0 {
        QualityBucket::Fair
    } else {
        QualityBucket::Poor
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionQualitySample {
    pub bitrate_kbps: f64,
    pub packet_loss_count: u64,
    pub jitter_seconds: f64,
    pub round_trip_ms: f64,
    pub ice_state: IceState,
    pub sampled_at: DateTime<Utc>,
}

impl ConnectionQualitySample {
    pub fn bucket(&self) -> QualityBucket {
        classify(
            self.bitrate_kbps,
            self.packet_loss_count as f64,
            self.round_trip_ms,
            self.ice_state,
        )
    }
}

/// Превращает накопительные счётчики в значения за интервал
#[derive(Debug)]
pub struct QualitySampler {
    previous: Option<(TransportStats, Instant)>,
}

impl QualitySampler {
    pub fn new(baseline: TransportStats, at: Instant) -> Self {
        Self {
            previous: Some((baseline, at)),
        }
    }

    pub fn sample(&mut self, stats: TransportStats, ice: IceState, now: Instant) -> ConnectionQualitySample {
        let (bitrate_kbps, lost) = match self.previous {
            Some((prev, at)) => {
                let elapsed = now.saturating_duration_since(at).as_secs_f64();
                let bytes = stats.bytes_received.saturating_sub(prev.bytes_received);
                let bitrate = if elapsed > 0.0 {
                    bytes as f64 * 8.0 / elapsed / 1000.0
                } else {
                    0.0
                };
                // битрейт входящий, потери исходящие: других webrtc не даёт
                let lost = stats
                    .outbound_packets_lost
                    .saturating_sub(prev.outbound_packets_lost)
                    .max(0) as u64;
                (bitrate, lost)
            }
            None => (0.0, 0),
        };
        self.previous = Some((stats, now));

        ConnectionQualitySample {
            bitrate_kbps,
            packet_loss_count: lost,
            jitter_seconds: stats.jitter_seconds,
            // RTT может быть ещё неизвестен
            round_trip_ms: stats.round_trip_ms.unwrap_or(0.0),
            ice_state: ice,
            sampled_at: Utc::now(),
        }
    }
}

/// Периодический опрос статистики, пока соединение в `connected`
#[derive(Default)]
pub struct QualityMonitor {
    task: Option<JoinHandle<()>>,
}

impl QualityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub fn start(
        &mut self,
        transport: Arc<dyn PeerTransport>,
        generation: u64,
        tx: mpsc::UnboundedSender<SessionInput>,
        period: Duration,
    ) {
        self.stop();
        debug!("Quality monitor started ({} ms)", period.as_millis());
        self.task = Some(tokio::spawn(async move {
            let baseline = transport.stats().await.unwrap_or_default();
            let mut sampler = QualitySampler::new(baseline, Instant::now());
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let stats = match transport.stats().await {
                    Ok(stats) => stats,
                    Err(e) => {
                        warn!("Failed to read transport stats: {e}");
                        continue;
                    }
                };
                let sample = sampler.sample(stats, transport.ice_state(), Instant::now());
                if tx.send(SessionInput::Quality { generation, sample }).is_err() {
                    break;
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Quality monitor stopped");
        }
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
