use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::frame::AudioFrame;

/// Binary message header length on the wire.
pub const HEADER_LEN: usize = 12;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message kind: raw PCM16 audio.
pub const KIND_AUDIO: u8 = 1;

/// Parsed 12-byte binary header: `{version:u8, kind:u8, reserved:u16,
/// seq:u32, ts_ms:u32}`, numeric fields big-endian, followed by raw PCM16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub kind: u8,
    pub reserved: u16,
    pub seq: u32,
    pub ts_ms: u32,
}

/// Errors produced while encoding or decoding binary audio messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Binary message too short: {0} bytes, need at least {HEADER_LEN}")]
    TooShort(usize),
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("Unsupported message kind {0}")]
    UnsupportedKind(u8),
    #[error("PCM payload is not a whole number of 16-bit samples: {0} bytes")]
    MisalignedPayload(usize),
}

/// Encode an audio frame into a wire message.
pub fn encode_frame(frame: &AudioFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.pcm.len());
    buf.extend_from_slice(&[PROTOCOL_VERSION, KIND_AUDIO]);
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&(frame.seq as u32).to_be_bytes());
    buf.extend_from_slice(&(frame.ts_ms as u32).to_be_bytes());
    buf.extend_from_slice(&frame.pcm);
    buf.freeze()
}

/// Decode a wire message into header and audio frame.
pub fn decode_frame(data: &[u8]) -> Result<(FrameHeader, AudioFrame), CodecError> {
    if data.len() < HEADER_LEN {
        return Err(CodecError::TooShort(data.len()));
    }

    let header = FrameHeader {
        version: data[0],
        kind: data[1],
        reserved: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ts_ms: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
    };

    if header.version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(header.version));
    }
    if header.kind != KIND_AUDIO {
        return Err(CodecError::UnsupportedKind(header.kind));
    }

    let payload = &data[HEADER_LEN..];
    if payload.len() % 2 != 0 {
        return Err(CodecError::MisalignedPayload(payload.len()));
    }

    let frame = AudioFrame::new(
        header.seq as u64,
        header.ts_ms as u64,
        Bytes::copy_from_slice(payload),
    );
    Ok((header, frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::frame::{pcm_from_samples, FRAME_SAMPLES};

    #[test]
    fn test_encode_decode_round_trip() {
        let samples: Vec<i16> = (0..FRAME_SAMPLES as i16).map(|i| i * 3).collect();
        let frame = AudioFrame::new(1234, 98_760, pcm_from_samples(&samples));

        let wire = encode_frame(&frame);
        assert_eq!(wire.len(), HEADER_LEN + FRAME_SAMPLES * 2);

        let (header, decoded) = decode_frame(&wire).unwrap();
        assert_eq!(header.version, PROTOCOL_VERSION);
        assert_eq!(header.kind, KIND_AUDIO);
        assert_eq!(header.reserved, 0);
        assert_eq!(header.seq, 1234);
        assert_eq!(header.ts_ms, 98_760);
        assert_eq!(decoded.samples(), samples);
    }

    #[test]
    fn test_decode_rejects_short_message() {
        let err = decode_frame(&[1, 1, 0]).unwrap_err();
        assert_eq!(err, CodecError::TooShort(3));
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let frame = AudioFrame::silence(0, 0);
        let mut wire = encode_frame(&frame).to_vec();
        wire[0] = 9;
        assert_eq!(decode_frame(&wire).unwrap_err(), CodecError::UnsupportedVersion(9));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let frame = AudioFrame::silence(0, 0);
        let mut wire = encode_frame(&frame).to_vec();
        wire[1] = 7;
        assert_eq!(decode_frame(&wire).unwrap_err(), CodecError::UnsupportedKind(7));
    }

    #[test]
    fn test_decode_rejects_odd_payload() {
        let frame = AudioFrame::silence(0, 0);
        let mut wire = encode_frame(&frame).to_vec();
        wire.push(0xAB);
        assert!(matches!(
            decode_frame(&wire).unwrap_err(),
            CodecError::MisalignedPayload(_)
        ));
    }

    #[test]
    fn test_header_only_message_is_empty_frame() {
        let frame = AudioFrame::new(5, 100, Bytes::new());
        let wire = encode_frame(&frame);
        let (_, decoded) = decode_frame(&wire).unwrap();
        assert_eq!(decoded.sample_count(), 0);
    }
}
