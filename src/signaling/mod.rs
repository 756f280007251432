pub mod message;
pub mod relay;

use crate::error::SignalingError;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use message::{SignalKind, SignalMessage, SignalPayload};
pub use relay::{LocalRelay, RelayChannel};

/// Комнатный pub/sub канал. Доставляет сообщение всем остальным участникам
/// комнаты хотя бы один раз, порядок между отправителями не гарантирован,
/// собственные сообщения отправителю не возвращаются.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;

    /// Поток входящих сообщений. Нераспознанные сообщения транспорт
    /// логирует и пропускает сам.
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError>;

    async fn close(&self);
}
