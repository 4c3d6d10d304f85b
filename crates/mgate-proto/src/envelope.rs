//! The request/response envelope carried inside `Normal` frames.
//!
//! Envelopes are CBOR-encoded. The gateway never interprets bodies; it
//! classifies on `cmd_id` and correlates on `seq`.

use crate::error::{ErrorCode, ProtoError, ProtoResult};
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: &str = "1";

/// Command identifiers consumed by the gateway itself, plus the
/// notification commands it originates. Backend command ranges are
/// declared in the route table, not here.
pub mod cmd {
    /// Login with credentials (user service verifies, gateway mints tokens).
    pub const LOGIN: u32 = 1001;
    /// Revoke the presented token and drop the binding.
    pub const LOGOUT: u32 = 1002;
    /// Exchange a refresh token for a new pair.
    pub const REFRESH_TOKEN: u32 = 1003;
    /// Profile fetch, forwarded to the user service.
    pub const USER_INFO: u32 = 1004;
    /// Bind this connection with an access token.
    pub const AUTH: u32 = 1005;

    /// Server notification: this device was displaced by another login.
    pub const NOTIFY_KICKED: u32 = 5001;
    /// Server notification: unauthenticated grace period expired.
    pub const NOTIFY_AUTH_TIMEOUT: u32 = 5002;
    /// Server notification: gateway is shutting down.
    pub const NOTIFY_SHUTDOWN: u32 = 5003;
    /// Server notification: protocol error on this connection.
    pub const NOTIFY_PROTOCOL_ERROR: u32 = 5004;
}

/// Envelope header plus opaque body.
///
/// `seq` is client-assigned per connection and echoed unmodified in the
/// matching response; `seq = 0` is reserved for unsolicited server
/// notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub seq: u32,
    #[serde(default)]
    pub cmd_id: u32,
    #[serde(default)]
    pub from_uid: String,
    #[serde(default)]
    pub to_uid: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Envelope {
    pub fn decode(payload: &[u8]) -> ProtoResult<Self> {
        let env: Envelope = ciborium::from_reader(Cursor::new(payload))?;
        Ok(env)
    }

    pub fn encode(&self) -> ProtoResult<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)?;
        Ok(out)
    }

    /// Encode into a `Normal` frame ready for the write loop.
    pub fn into_frame(&self) -> ProtoResult<Frame> {
        Ok(Frame::normal(self.encode()?))
    }

    /// Build the response to `request`: same `seq` and `cmd_id`, sender and
    /// receiver swapped, body carrying the `(code, message, data)` triple.
    pub fn response_to(
        request: &Envelope,
        code: ErrorCode,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Envelope {
        Envelope {
            version: PROTOCOL_VERSION.to_string(),
            seq: request.seq,
            cmd_id: request.cmd_id,
            from_uid: request.to_uid.clone(),
            to_uid: request.from_uid.clone(),
            token: String::new(),
            device_id: String::new(),
            platform: String::new(),
            timestamp: now_millis(),
            body: serde_json::json!({
                "code": code.wire(),
                "message": message.into(),
                "data": data,
            }),
        }
    }

    /// Build an unsolicited server notification (`seq = 0`).
    pub fn notification(cmd_id: u32, body: serde_json::Value) -> Envelope {
        Envelope {
            version: PROTOCOL_VERSION.to_string(),
            seq: 0,
            cmd_id,
            from_uid: String::new(),
            to_uid: String::new(),
            token: String::new(),
            device_id: String::new(),
            platform: String::new(),
            timestamp: now_millis(),
            body,
        }
    }

    /// A notification addressed to one user, used by push fan-out.
    pub fn notification_for(cmd_id: u32, to_uid: &str, body: serde_json::Value) -> Envelope {
        let mut env = Self::notification(cmd_id, body);
        env.to_uid = to_uid.to_string();
        env
    }

    pub fn is_notification(&self) -> bool {
        self.seq == 0
    }

    /// Basic well-formedness checks shared by both transports.
    pub fn validate(&self) -> ProtoResult<()> {
        if self.version.is_empty() {
            return Err(ProtoError::InvalidEnvelope("missing version".into()));
        }
        if self.cmd_id == 0 {
            return Err(ProtoError::InvalidEnvelope("missing cmd_id".into()));
        }
        Ok(())
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
