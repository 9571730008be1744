//! Frame codec for the control channel.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 2 bytes: message kind tag (big-endian, see [`MessageKind`])
//! - 4 bytes: body length (big-endian)
//! - N bytes: MessagePack-encoded body
//!
//! The codec is stateless: [`try_decode`] inspects a byte buffer and
//! either yields one complete frame plus the number of bytes it
//! consumed, or reports that more data is needed. Callers own the
//! reassembly buffer.

use crate::error::{ProtocolError, Result};
use crate::messages::{MessageKind, WireMessage};

/// Frame header size: 2 (kind) + 4 (length) = 6 bytes.
pub const FRAME_HEADER_SIZE: usize = 6;

/// Maximum body size (1 MiB). Control messages are small; anything
/// larger indicates a corrupt or hostile peer.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// A decoded frame whose body has not yet been interpreted.
///
/// The kind tag is kept raw so that unknown kinds survive decoding and
/// can be diagnosed (and ignored) by the dispatch layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// The raw kind tag from the wire.
    pub kind: u16,
    /// The undecoded body bytes.
    pub body: Vec<u8>,
}

impl RawFrame {
    /// Returns the parsed kind, or `None` for tags this build does not know.
    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::from_u16(self.kind)
    }

    /// Decodes the body as message type `M`, checking the kind tag first.
    ///
    /// Returns `None` on a kind mismatch or a malformed body.
    pub fn decode<M: WireMessage>(&self) -> Option<M> {
        if self.kind != M::KIND.as_u16() {
            return None;
        }
        M::decode_body(&self.body)
    }
}

/// Encodes a frame from a raw kind tag and body bytes.
pub fn encode_frame(kind: u16, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_BODY_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len() + FRAME_HEADER_SIZE,
            max: MAX_BODY_SIZE + FRAME_HEADER_SIZE,
        });
    }

    let mut output = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    output.extend_from_slice(&kind.to_be_bytes());
    output.extend_from_slice(&(body.len() as u32).to_be_bytes());
    output.extend_from_slice(body);
    Ok(output)
}

/// Serializes a message body and wraps it in a frame.
pub fn encode_message<M: WireMessage>(message: &M) -> Result<Vec<u8>> {
    let body = message.encode_body()?;
    encode_frame(M::KIND.as_u16(), &body)
}

/// Tries to decode one frame from the front of `data`.
///
/// Returns `Ok(None)` when `data` does not yet hold a complete frame,
/// and `Ok(Some((frame, consumed)))` once it does. A length prefix
/// beyond [`MAX_BODY_SIZE`] is an unrecoverable stream error.
pub fn try_decode(data: &[u8]) -> Result<Option<(RawFrame, usize)>> {
    if data.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let kind = u16::from_be_bytes([data[0], data[1]]);
    let body_len = u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;

    if body_len > MAX_BODY_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: FRAME_HEADER_SIZE + body_len,
            max: MAX_BODY_SIZE + FRAME_HEADER_SIZE,
        });
    }

    let total = FRAME_HEADER_SIZE + body_len;
    if data.len() < total {
        return Ok(None);
    }

    let frame = RawFrame {
        kind,
        body: data[FRAME_HEADER_SIZE..total].to_vec(),
    };
    Ok(Some((frame, total)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{request, response};

    #[test]
    fn test_encode_decode_roundtrip() {
        let encoded = encode_message(&response::ClientId { id: 3, nonce: 17 }).unwrap();
        let (frame, consumed) = try_decode(&encoded).unwrap().unwrap();

        assert_eq!(consumed, encoded.len());
        assert_eq!(frame.message_kind(), Some(MessageKind::ClientIdResponse));
        let decoded: response::ClientId = frame.decode().unwrap();
        assert_eq!(decoded, response::ClientId { id: 3, nonce: 17 });
    }

    #[test]
    fn test_header_layout() {
        let encoded = encode_frame(0x1001, &[0xAA, 0xBB]).unwrap();
        assert_eq!(&encoded[0..2], &[0x10, 0x01]);
        assert_eq!(&encoded[2..6], &[0, 0, 0, 2]);
        assert_eq!(&encoded[6..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_try_decode_partial_data() {
        let encoded = encode_message(&request::Attach {
            name: "shell".to_string(),
        })
        .unwrap();

        for i in 0..encoded.len() {
            assert!(
                try_decode(&encoded[..i]).unwrap().is_none(),
                "partial frame of {} bytes should not decode",
                i
            );
        }
        assert!(try_decode(&encoded).unwrap().is_some());
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let first = encode_message(&request::ClientId {}).unwrap();
        let second = encode_message(&request::SessionList {}).unwrap();

        let mut combined = first.clone();
        combined.extend_from_slice(&second);

        let (frame1, used1) = try_decode(&combined).unwrap().unwrap();
        assert_eq!(frame1.message_kind(), Some(MessageKind::ClientIdRequest));
        assert_eq!(used1, first.len());

        let (frame2, used2) = try_decode(&combined[used1..]).unwrap().unwrap();
        assert_eq!(frame2.message_kind(), Some(MessageKind::SessionListRequest));
        assert_eq!(used2, second.len());
    }

    #[test]
    fn test_unknown_kind_survives_framing() {
        let encoded = encode_frame(0x7777, b"opaque").unwrap();
        let (frame, _) = try_decode(&encoded).unwrap().unwrap();
        assert_eq!(frame.kind, 0x7777);
        assert_eq!(frame.message_kind(), None);
        assert_eq!(frame.body, b"opaque");
    }

    #[test]
    fn test_decode_kind_mismatch() {
        let encoded = encode_message(&request::ClientId {}).unwrap();
        let (frame, _) = try_decode(&encoded).unwrap().unwrap();
        assert!(frame.decode::<response::ClientId>().is_none());
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut bad = Vec::new();
        bad.extend_from_slice(&0x0001u16.to_be_bytes());
        bad.extend_from_slice(&((MAX_BODY_SIZE as u32) + 1).to_be_bytes());

        let result = try_decode(&bad);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_encode_oversized_body_rejected() {
        let body = vec![0u8; MAX_BODY_SIZE + 1];
        let result = encode_frame(0x0001, &body);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_empty_body_frame() {
        let encoded = encode_frame(0x0001, &[]).unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE);
        let (frame, consumed) = try_decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, FRAME_HEADER_SIZE);
        assert!(frame.body.is_empty());
    }
}
