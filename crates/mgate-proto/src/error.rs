use thiserror::Error;

/// Client-visible error taxonomy.
///
/// Every response envelope carries one of these codes; `Backpressure` is
/// local-only and never put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidRequest = 1,
    DecodeFailed = 2,
    RoutingFailed = 3,
    AuthFailed = 4,
    Timeout = 5,
    ServerError = 6,
    Backpressure = 7,
}

impl ErrorCode {
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::InvalidRequest),
            2 => Some(Self::DecodeFailed),
            3 => Some(Self::RoutingFailed),
            4 => Some(Self::AuthFailed),
            5 => Some(Self::Timeout),
            6 => Some(Self::ServerError),
            7 => Some(Self::Backpressure),
            _ => None,
        }
    }

    pub fn wire(self) -> u32 {
        self as u32
    }

    /// HTTP status used when the same error surfaces on the control plane.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::InvalidRequest => 400,
            Self::DecodeFailed => 400,
            Self::RoutingFailed => 404,
            Self::AuthFailed => 401,
            Self::Timeout => 504,
            Self::ServerError => 500,
            // Never sent to clients; mapped defensively if it ever leaks.
            Self::Backpressure => 503,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::InvalidRequest => "invalid request",
            Self::DecodeFailed => "decode failed",
            Self::RoutingFailed => "routing failed",
            Self::AuthFailed => "authentication failed",
            Self::Timeout => "timeout",
            Self::ServerError => "server error",
            Self::Backpressure => "backpressure",
        }
    }
}

/// Errors produced by the mgate protocol layer.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("bad frame type: {0:#04x}")]
    BadFrameType(u8),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("token error: {0}")]
    Token(String),
}

impl ProtoError {
    /// The client-visible code this error maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::FrameTooLarge(_) => ErrorCode::InvalidRequest,
            Self::BadFrameType(_) => ErrorCode::InvalidRequest,
            Self::Codec(_) => ErrorCode::DecodeFailed,
            Self::InvalidEnvelope(_) => ErrorCode::InvalidRequest,
            Self::Token(_) => ErrorCode::AuthFailed,
        }
    }
}

impl From<ciborium::de::Error<std::io::Error>> for ProtoError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        ProtoError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for ProtoError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        ProtoError::Codec(e.to_string())
    }
}

pub type ProtoResult<T> = Result<T, ProtoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::InvalidRequest,
            ErrorCode::DecodeFailed,
            ErrorCode::RoutingFailed,
            ErrorCode::AuthFailed,
            ErrorCode::Timeout,
            ErrorCode::ServerError,
            ErrorCode::Backpressure,
        ] {
            assert_eq!(ErrorCode::from_wire(code.wire()), Some(code));
        }
        assert_eq!(ErrorCode::from_wire(999), None);
    }

    #[test]
    fn http_mapping() {
        assert_eq!(ErrorCode::InvalidRequest.http_status(), 400);
        assert_eq!(ErrorCode::AuthFailed.http_status(), 401);
        assert_eq!(ErrorCode::RoutingFailed.http_status(), 404);
        assert_eq!(ErrorCode::Timeout.http_status(), 504);
        assert_eq!(ErrorCode::ServerError.http_status(), 500);
    }
}
