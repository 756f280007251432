use crate::error::Result;
use crate::media::MediaSource;
use crate::peer::types::{
    IceCandidate, IceState, MediaKind, PeerState, RemoteTrackInfo, SessionDescription,
    SignalingState, TransportStats,
};
use crate::session::SessionInput;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Нижележащее peer-to-peer соединение. Сессия общается с ним только через
/// этот трейт, поэтому реализация на webrtc-rs и тестовая взаимозаменяемы.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    fn ice_state(&self) -> IceState;

    async fn has_remote_description(&self) -> bool;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Откатывает неотвеченный локальный offer обратно в `stable`
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Добавляет исходящий трек (новый sender)
    async fn attach_source(&self, source: &MediaSource) -> Result<()>;

    /// Подменяет трек в существующем sender'е без пересогласования
    async fn replace_source(&self, kind: MediaKind, source: &MediaSource) -> Result<()>;

    async fn sender_count(&self) -> usize;

    async fn stats(&self) -> Result<TransportStats>;

    async fn close(&self) -> Result<()>;
}

/// События, которые транспорт генерирует для сессии
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Сгенерирован локальный ICE-кандидат, его нужно отправить пиру
    LocalCandidate(IceCandidate),
    GatheringComplete,
    StateChanged(PeerState),
    IceStateChanged(IceState),
    RemoteTrack(RemoteTrackInfo),
}

/// Отправитель событий транспорта, помеченный поколением транспорта.
/// События от заменённого транспорта сессия отбрасывает.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionInput>,
}

impl TransportEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// false, если сессия уже завершилась
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(SessionInput::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>>;
}
