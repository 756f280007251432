use thiserror::Error;

/// Ошибки захвата локальных устройств. Никогда не повторяются автоматически,
/// решение о повторном запросе принимает вызывающая сторона.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("permission to use {0} was denied")]
    PermissionDenied(String),

    #[error("no {0} device found")]
    NotFound(String),

    #[error("{0} device is busy")]
    Busy(String),

    #[error("constraints cannot be satisfied: {0}")]
    ConstraintsUnsatisfiable(String),

    #[error("media capture requires a secure context")]
    InsecureContext,
}

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("signaling channel is closed")]
    Closed,

    #[error("malformed signaling message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unknown signaling message type: {0}")]
    UnknownType(String),
}

#[derive(Error, Debug)]
pub enum CallError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("reconnection failed after {attempts} attempts, rejoin required")]
    ReconnectExhausted { attempts: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session has not joined the room yet")]
    NotJoined,

    #[error("session already joined the room")]
    AlreadyJoined,

    #[error("session is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, CallError>;
