use mgate_proto::{ErrorCode, ProtoError};
use thiserror::Error;

/// Errors produced by the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("config error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("no route: {0}")]
    Routing(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend timeout")]
    Timeout,

    #[error("send queue full")]
    Backpressure,

    #[error("session closed")]
    SessionClosed,
}

impl GatewayError {
    /// The client-visible code this error maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Proto(e) => e.code(),
            Self::AuthFailed(_) => ErrorCode::AuthFailed,
            Self::Routing(_) => ErrorCode::RoutingFailed,
            Self::Timeout => ErrorCode::Timeout,
            Self::Backpressure => ErrorCode::Backpressure,
            Self::Config(_) | Self::Backend(_) | Self::SessionClosed => ErrorCode::ServerError,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_onto_wire_codes() {
        assert_eq!(
            GatewayError::AuthFailed("bad".into()).code(),
            ErrorCode::AuthFailed
        );
        assert_eq!(
            GatewayError::Routing("cmd 9999".into()).code(),
            ErrorCode::RoutingFailed
        );
        assert_eq!(GatewayError::Timeout.code(), ErrorCode::Timeout);
        assert_eq!(GatewayError::Backpressure.code(), ErrorCode::Backpressure);
        assert_eq!(GatewayError::SessionClosed.code(), ErrorCode::ServerError);
        assert_eq!(
            GatewayError::Config("bind".into()).code(),
            ErrorCode::ServerError
        );
    }
}
