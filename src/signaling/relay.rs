use crate::error::SignalingError;
use crate::signaling::{SignalMessage, SignalingTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Frame {
    /// участник, через чей канал отправлено сообщение
    sender: String,
    json: String,
}

/// Ретранслятор внутри процесса: по одному broadcast-каналу на комнату.
/// Сообщения ходят как JSON-строки, как через настоящий relay.
#[derive(Clone, Default)]
pub struct LocalRelay {
    rooms: Arc<Mutex<HashMap<String, broadcast::Sender<Frame>>>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_name(room_id: &str) -> String {
        format!("room-{room_id}")
    }

    /// Подключает участника к комнате
    pub fn channel(&self, room_id: &str, participant: impl Into<String>) -> RelayChannel {
        let name = Self::channel_name(room_id);
        let tx = {
            let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
            rooms
                .entry(name.clone())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone()
        };
        let (closed, _) = watch::channel(false);
        RelayChannel {
            participant: participant.into(),
            name,
            tx,
            closed,
        }
    }

    pub fn subscriber_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms
            .get(&Self::channel_name(room_id))
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

/// Подключение одного участника к комнате
pub struct RelayChannel {
    participant: String,
    name: String,
    tx: broadcast::Sender<Frame>,
    closed: watch::Sender<bool>,
}

impl RelayChannel {
    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Обрывает подключение, как при потере связи с relay
    pub fn disconnect(&self) {
        if !self.closed.send_replace(true) {
            debug!("{} disconnected from {}", self.participant, self.name);
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

#[async_trait]
impl SignalingTransport for RelayChannel {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        let json = message.to_json()?;
        debug!("{} -> {}: {}", self.participant, self.name, message.kind());
        // нет подписчиков: второй участник ещё не подключился, это не ошибка
        let _ = self.tx.send(Frame {
            sender: self.participant.clone(),
            json,
        });
        Ok(())
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        let mut frames = self.tx.subscribe();
        let mut closed = self.closed.subscribe();
        let participant = self.participant.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = wait_closed(&mut closed) => break,
                    frame = frames.recv() => match frame {
                        Ok(frame) if frame.sender == participant => continue,
                        Ok(frame) => match SignalMessage::from_json(&frame.json) {
                            Ok(message) => {
                                if tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Skipping signaling message: {e}"),
                        },
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("{participant} lagged behind by {n} signaling messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Signaling forwarder for {participant} stopped");
        });
        Ok(rx)
    }

    async fn close(&self) {
        self.disconnect();
    }
}
