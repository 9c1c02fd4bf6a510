// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Frame layer: length-prefixed, versioned frames over a byte stream.
//!
//! Wire format (header fields big-endian):
//!
//! ```text
//! offset size  field
//! 0      4     total_length = u32 BE (excludes this field)
//! 4      1     version      = 1
//! 5      1     opcode
//! 6      2     flags        (reserved, must be zero)
//! 8      8     correlation_id = u64 BE
//! 16     N     payload (compact codec, see crate::codec)
//! ```
//!
//! Decoders reject unknown versions outright — there is no negotiation, a
//! version mismatch is a protocol error surfaced to the peer before close.
//! Frames are capped at 16 MiB, except `PutBlob` frames which may carry up
//! to 256 MiB of blob.

use crate::message::Message;
use crate::WireError;

/// Protocol version carried in every frame.
pub const WIRE_VERSION: u8 = 1;

/// Header bytes after the length prefix.
pub const HEADER_BYTES: usize = 12;

/// Cap for ordinary frames.
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Cap for `PutBlob` frames.
pub const MAX_BLOB_FRAME: u32 = 256 * 1024 * 1024;

/// Opcode of `PutBlob`, which gets the larger size budget.
const OPCODE_PUT_BLOB: u8 = 0x06;

/// A decoded frame, payload still raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version (always [`WIRE_VERSION`] after a successful decode).
    pub version: u8,
    /// Message opcode.
    pub opcode: u8,
    /// Reserved flags (zero).
    pub flags: u16,
    /// Correlates requests with responses.
    pub correlation_id: u64,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Encode `message` into a complete frame.
pub fn encode_message(message: &Message, correlation_id: u64) -> Vec<u8> {
    let payload = message.encode_payload();
    let total = (HEADER_BYTES + payload.len()) as u32;
    let mut out = Vec::with_capacity(4 + total as usize);
    out.extend_from_slice(&total.to_be_bytes());
    out.push(WIRE_VERSION);
    out.push(message.opcode());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&correlation_id.to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame
/// (read more and retry), or `Ok(Some((frame, consumed)))` on success.
///
/// # Errors
///
/// - [`WireError::ProtocolVersion`] on a version byte other than 1;
/// - [`WireError::FrameTooLarge`] past the opcode-dependent cap;
/// - [`WireError::Malformed`] for impossible lengths or nonzero flags.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, WireError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if (total as usize) < HEADER_BYTES {
        return Err(WireError::Malformed {
            detail: format!("frame length {total} below header size"),
        });
    }
    // The version and opcode live in the first two header bytes; enforce the
    // size cap as soon as the opcode is visible so a hostile length prefix
    // cannot make us buffer 4 GiB.
    if buf.len() >= 6 {
        let version = buf[4];
        if version != WIRE_VERSION {
            return Err(WireError::ProtocolVersion { got: version });
        }
        let opcode = buf[5];
        let cap = if opcode == OPCODE_PUT_BLOB {
            MAX_BLOB_FRAME
        } else {
            MAX_FRAME
        };
        if total > cap {
            return Err(WireError::FrameTooLarge { len: total, cap });
        }
    }
    let frame_end = 4 + total as usize;
    if buf.len() < frame_end {
        return Ok(None);
    }

    let version = buf[4];
    if version != WIRE_VERSION {
        return Err(WireError::ProtocolVersion { got: version });
    }
    let opcode = buf[5];
    let flags = u16::from_be_bytes([buf[6], buf[7]]);
    if flags != 0 {
        return Err(WireError::Malformed {
            detail: format!("reserved flags must be zero, got {flags:#06x}"),
        });
    }
    let correlation_id = u64::from_be_bytes([
        buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
    ]);
    let payload = buf[16..frame_end].to_vec();
    Ok(Some((
        Frame {
            version,
            opcode,
            flags,
            correlation_id,
            payload,
        },
        frame_end,
    )))
}

/// Decode one message (frame + payload) from the front of `buf`.
///
/// Returns `Ok(None)` for an incomplete buffer, otherwise the message, its
/// correlation id, and the bytes consumed.
///
/// # Errors
///
/// As [`decode_frame`], plus payload-level [`WireError`]s.
pub fn decode_message(buf: &[u8]) -> Result<Option<(Message, u64, usize)>, WireError> {
    let Some((frame, consumed)) = decode_frame(buf)? else {
        return Ok(None);
    };
    let message = Message::decode_payload(frame.opcode, &frame.payload)?;
    Ok(Some((message, frame.correlation_id, consumed)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_exactly_as_documented() {
        let bytes = encode_message(&Message::Ack, 0xDEAD_BEEF_CAFE_F00D);
        // length(4) + header(12) + empty payload
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &12u32.to_be_bytes());
        assert_eq!(bytes[4], WIRE_VERSION);
        assert_eq!(bytes[5], Message::Ack.opcode());
        assert_eq!(&bytes[6..8], &[0, 0]);
        assert_eq!(&bytes[8..16], &0xDEAD_BEEF_CAFE_F00Du64.to_be_bytes());
    }

    #[test]
    fn incomplete_buffers_ask_for_more() {
        let bytes = encode_message(&Message::Ack, 7);
        for cut in 0..bytes.len() {
            assert!(
                decode_message(&bytes[..cut]).unwrap().is_none(),
                "cut at {cut} must be incomplete, not an error"
            );
        }
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut bytes = encode_message(&Message::Ack, 7);
        bytes[4] = 2;
        assert!(matches!(
            decode_message(&bytes),
            Err(WireError::ProtocolVersion { got: 2 })
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_before_buffering() {
        let mut header = Vec::new();
        header.extend_from_slice(&(MAX_FRAME + 1).to_be_bytes());
        header.push(WIRE_VERSION);
        header.push(Message::Ack.opcode());
        assert!(matches!(
            decode_frame(&header),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn two_frames_in_one_buffer_decode_in_order() {
        let mut buf = encode_message(&Message::Ack, 1);
        buf.extend_from_slice(&encode_message(
            &Message::Error {
                code: 9,
                message: "nope".to_owned(),
            },
            2,
        ));
        let (first, corr1, consumed) = decode_message(&buf).unwrap().unwrap();
        assert_eq!(first, Message::Ack);
        assert_eq!(corr1, 1);
        let (second, corr2, _) = decode_message(&buf[consumed..]).unwrap().unwrap();
        assert_eq!(corr2, 2);
        match second {
            Message::Error { code, message } => {
                assert_eq!(code, 9);
                assert_eq!(message, "nope");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }
}
