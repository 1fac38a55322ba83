//! Control connection plumbing: the frame codec and the byte-level
//! transport seam the control channel runs over.

mod frame;

pub use frame::{
    CorrelationId, Frame, FrameError, FrameKind, MAX_HEADERS, PROTOCOL_VERSION, RelayRequest,
    ResponseHead,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed by peer")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] hyper_tungstenite::tungstenite::Error),

    #[error("Transport error: {0}")]
    Other(String),
}

/// Wall-clock milliseconds since the Unix epoch, as carried in frames.
pub fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
