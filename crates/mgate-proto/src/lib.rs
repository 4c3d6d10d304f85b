//! mgate-proto: Shared protocol library for the mgate messaging gateway.
//!
//! Provides the length-prefixed binary frame codec, the CBOR request
//! envelope, the client-visible error taxonomy, and the HMAC token codec.

pub mod envelope;
pub mod error;
pub mod frame;
pub mod token;

// Re-export commonly used items at crate root.
pub use envelope::{cmd, now_millis, Envelope, PROTOCOL_VERSION};
pub use error::{ErrorCode, ProtoError, ProtoResult};
pub use frame::{Frame, FrameDecoder, FrameType, MAX_FRAME_LEN};
