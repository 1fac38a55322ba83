use http::StatusCode;
use thiserror::Error;

use crate::transport::FrameError;

/// Failures surfaced by the relay core.
///
/// Cloneable so a single disconnect reason can be fanned out to every
/// request still waiting on a tunnel.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("Invalid route name: {0:?}")]
    InvalidRoute(String),

    #[error("Route {0} already has a connected tunnel")]
    AlreadyExists(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    #[error("No tunnel connected for route {0}")]
    RouteNotFound(String),

    #[error("Access to this tunnel is forbidden")]
    Forbidden,

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Tunnel disconnected")]
    TunnelDisconnected,

    #[error("Tunnel did not respond in time")]
    TunnelTimeout,

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Tunnel client failed: {0}")]
    Upstream(String),

    #[error("Response body outran the caller")]
    BodyOverflow,
}

impl RelayError {
    /// Gateway-style status reported to public callers.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::InvalidRoute(_) => StatusCode::BAD_REQUEST,
            RelayError::AlreadyExists(_) => StatusCode::CONFLICT,
            RelayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Forbidden => StatusCode::FORBIDDEN,
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::TunnelTimeout => StatusCode::GATEWAY_TIMEOUT,
            RelayError::TunnelDisconnected
            | RelayError::MalformedFrame(_)
            | RelayError::Upstream(_)
            | RelayError::BodyOverflow => StatusCode::BAD_GATEWAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_status_mapping() {
        assert_eq!(
            RelayError::RouteNotFound("demo".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(RelayError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            RelayError::TunnelDisconnected.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RelayError::TunnelTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            RelayError::PayloadTooLarge { limit: 1 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_frame_error_conversion() {
        let err: RelayError = FrameError::UnknownType(42).into();
        assert!(matches!(err, RelayError::MalformedFrame(FrameError::UnknownType(42))));
        assert!(err.to_string().contains("42"));
    }
}
