//! Length-prefixed binary framing for the realtime transport.
//!
//! Wire format: `[4-byte big-endian payload length][1-byte type][payload]`

use crate::error::{ProtoError, ProtoResult};

/// Hard cap on a single frame payload.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Frame header size: length prefix plus type byte.
pub const FRAME_HEADER_LEN: usize = 5;

/// Frame type tag carried after the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Normal = 0,
    Ping = 1,
    Pong = 2,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Normal),
            1 => Some(Self::Ping),
            2 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// One wire frame. `Ping`/`Pong` frames carry an empty payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn normal(payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Normal,
            payload,
        }
    }

    pub fn ping() -> Self {
        Self {
            frame_type: FrameType::Ping,
            payload: Vec::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            frame_type: FrameType::Pong,
            payload: Vec::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.frame_type, FrameType::Ping | FrameType::Pong)
    }

    /// Encode into a single contiguous buffer so the write loop can emit
    /// the frame with one write call.
    pub fn encode(&self) -> ProtoResult<Vec<u8>> {
        if self.payload.len() > MAX_FRAME_LEN {
            return Err(ProtoError::FrameTooLarge(self.payload.len()));
        }
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.push(self.frame_type as u8);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// Streaming frame decoder: accumulates bytes and yields complete frames.
///
/// Incomplete input is not an error; `feed` simply returns the frames that
/// are complete so far. The length prefix is validated as soon as the
/// header is available, so an oversized frame is rejected before its
/// payload is buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return all complete frames.
    pub fn feed(&mut self, data: &[u8]) -> ProtoResult<Vec<Frame>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            if self.buffer.len() < FRAME_HEADER_LEN {
                break;
            }
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(ProtoError::FrameTooLarge(len));
            }
            let type_byte = self.buffer[4];
            let frame_type =
                FrameType::from_u8(type_byte).ok_or(ProtoError::BadFrameType(type_byte))?;
            if frame_type != FrameType::Normal && len != 0 {
                return Err(ProtoError::InvalidEnvelope(format!(
                    "{frame_type:?} frame with non-empty payload ({len} bytes)"
                )));
            }

            if self.buffer.len() < FRAME_HEADER_LEN + len {
                break;
            }

            let payload = self.buffer[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
            frames.push(Frame {
                frame_type,
                payload,
            });
            self.buffer.drain(..FRAME_HEADER_LEN + len);
        }

        Ok(frames)
    }

    /// Number of bytes buffered waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single() {
        let frame = Frame::normal(b"hello".to_vec());
        let bytes = frame.encode().unwrap();
        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&bytes).unwrap();
        assert_eq!(decoded, vec![frame]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn round_trip_multiple() {
        let frames = vec![
            Frame::normal(b"a".to_vec()),
            Frame::ping(),
            Frame::normal(b"bb".to_vec()),
            Frame::pong(),
        ];
        let mut combined = Vec::new();
        for f in &frames {
            combined.extend(f.encode().unwrap());
        }
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&combined).unwrap(), frames);
    }

    #[test]
    fn incremental_feed() {
        let frame = Frame::normal(b"incremental".to_vec());
        let bytes = frame.encode().unwrap();
        let mut decoder = FrameDecoder::new();
        for b in &bytes[..bytes.len() - 1] {
            assert!(decoder.feed(std::slice::from_ref(b)).unwrap().is_empty());
        }
        let decoded = decoder.feed(&bytes[bytes.len() - 1..]).unwrap();
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn oversized_rejected_from_header_alone() {
        // 11 MiB declared length; only the header is fed, the payload never
        // arrives, and the decoder must refuse without buffering it.
        let len = (11 * 1024 * 1024u32).to_be_bytes();
        let mut header = len.to_vec();
        header.push(0);
        let mut decoder = FrameDecoder::new();
        match decoder.feed(&header) {
            Err(ProtoError::FrameTooLarge(n)) => assert_eq!(n, 11 * 1024 * 1024),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn bad_type_rejected() {
        let mut bytes = 0u32.to_be_bytes().to_vec();
        bytes.push(9);
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.feed(&bytes),
            Err(ProtoError::BadFrameType(9))
        ));
    }

    #[test]
    fn ping_with_payload_rejected() {
        let mut bytes = 3u32.to_be_bytes().to_vec();
        bytes.push(1);
        bytes.extend_from_slice(b"abc");
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&bytes).is_err());
    }

    #[test]
    fn arbitrary_bytes_never_over_read() {
        // Any byte soup either decodes, errors, or waits for more input.
        let junk: Vec<u8> = (0..64u8).collect();
        let mut decoder = FrameDecoder::new();
        let _ = decoder.feed(&junk);
        assert!(decoder.pending() <= junk.len());
    }
}
