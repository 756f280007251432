use crate::error::{CallError, Result};
use crate::peer::timers::TimerPurpose;
use crate::peer::transport::TransportEvent;
use crate::quality::ConnectionQualitySample;
use crate::signaling::SignalMessage;
use serde_json::Value;
use tokio::sync::oneshot;

pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Запросы UI к сессии
#[derive(Debug)]
pub enum Command {
    Join(Reply<()>),
    ToggleAudio(Reply<bool>),
    ToggleVideo(Reply<bool>),
    StartScreenShare(Reply<()>),
    StopScreenShare(Reply<()>),
    ShareLocation(Value, Reply<()>),
}

impl Command {
    /// Отвечает ошибкой, не выполняя команду
    pub fn reject(self, error: impl Fn() -> CallError) {
        match self {
            Command::Join(reply)
            | Command::StartScreenShare(reply)
            | Command::StopScreenShare(reply)
            | Command::ShareLocation(_, reply) => {
                let _ = reply.send(Err(error()));
            }
            Command::ToggleAudio(reply) | Command::ToggleVideo(reply) => {
                let _ = reply.send(Err(error()));
            }
        }
    }
}

/// Единственная очередь входов сессии
#[derive(Debug)]
pub enum SessionInput {
    Command(Command),
    Signal(SignalMessage),
    Transport { generation: u64, event: TransportEvent },
    TimerFired { purpose: TimerPurpose, token: u64 },
    /// Захват экрана завершился сам
    CaptureEnded { source_id: String },
    Quality {
        generation: u64,
        sample: ConnectionQualitySample,
    },
    SignalingClosed,
}
