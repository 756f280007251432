pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod quality;
pub mod session;
pub mod signaling;
pub mod utils;

pub use commands::CallHandle;
pub use config::CallConfig;
pub use error::{CallError, DeviceError, Result, SignalingError};
pub use events::{CallEvent, CallSnapshot};
pub use quality::{classify, ConnectionQualitySample, QualityBucket};
pub use session::SessionDeps;
