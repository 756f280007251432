use crate::peer::state::CallState;
use crate::peer::types::{IceState, RemoteTrackInfo};
use crate::quality::{ConnectionQualitySample, QualityBucket};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::trace;

const EVENT_CAPACITY: usize = 128;

/// События для UI
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum CallEvent {
    StateChanged { state: CallState },
    IceStateChanged { state: IceState },
    Quality {
        sample: ConnectionQualitySample,
        bucket: QualityBucket,
    },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    RemoteTrack(RemoteTrackInfo),
    RemoteMediaCleared,
    ScreenShare { active: bool },
    AudioToggled { enabled: bool },
    VideoToggled { enabled: bool },
    PeerLocation { from: String, location: Value },
    SessionReset { reason: String },
    /// Неустранимая ошибка: нужен повторный вход в комнату
    Fatal { message: String },
}

/// Текущее состояние звонка целиком
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub state: CallState,
    pub ice_state: IceState,
    pub quality: Option<QualityBucket>,
    pub screen_sharing: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub remote_peer: Option<String>,
    pub remote_tracks: Vec<RemoteTrackInfo>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct EventBus {
    events: broadcast::Sender<CallEvent>,
    snapshot: Arc<watch::Sender<CallSnapshot>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot, _) = watch::channel(CallSnapshot::default());
        Self {
            events,
            snapshot: Arc::new(snapshot),
        }
    }

    /// Без подписчиков событие просто теряется
    pub fn emit(&self, event: CallEvent) {
        trace!("emit {event:?}");
        let _ = self.events.send(event);
    }

    pub fn update(&self, f: impl FnOnce(&mut CallSnapshot)) {
        self.snapshot.send_modify(f);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }
}
