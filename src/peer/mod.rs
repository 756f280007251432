pub mod connection;
pub mod ice;
pub mod identity;
pub mod negotiator;
pub mod sdp;
pub mod state;
pub mod timers;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use connection::{RtcTransport, RtcTransportFactory};
pub use state::{CallState, RecoveryPolicy};
pub use transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};
pub use types::{IceCandidate, MediaKind, ServerConfig, SessionDescription};
