//! Message framing
//!
//! Every tunnel message is wrapped in a fixed 14-byte big-endian envelope:
//!
//! ```text
//! magic:u32 | version:u8 | type:u8 | msg_uid:u32 | payload_len:u32 | payload
//! ```
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Envelope magic code ("NVRT")
pub const MAGIC_CODE: u32 = 0x4E56_5254;

/// Protocol version understood by this implementation
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope size in bytes
pub const HEADER_LEN: usize = 14;

/// Largest payload accepted
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024;

/// Reserved "invalid" message uid
pub const INVALID_MSG_UID: u32 = 0xFFFF_FFFF;

/// Envelope message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Session = 0,
    Control = 1,
    Data = 2,
}

impl TryFrom<u8> for MsgType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MsgType::Session),
            1 => Ok(MsgType::Control),
            2 => Ok(MsgType::Data),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Decoded envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u8,
    pub msg_type: MsgType,
    /// Client-supplied opaque id
    pub msg_uid: u32,
    pub payload_len: u32,
}

/// One complete message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn msg_type(&self) -> MsgType {
        self.header.msg_type
    }

    pub fn msg_uid(&self) -> u32 {
        self.header.msg_uid
    }
}

/// A uid is usable when it is neither zero nor the reserved sentinel
pub fn is_valid_uid(msg_uid: u32) -> bool {
    msg_uid != 0 && msg_uid != INVALID_MSG_UID
}

impl MessageHeader {
    /// Parse and validate the fixed envelope at the start of `buf`
    ///
    /// Does not check the payload length against the buffer; callers decide
    /// whether the buffer must hold exactly one message or may hold more.
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::TooShort(buf.len()));
        }
        let mut cursor = &buf[..HEADER_LEN];
        let magic = cursor.get_u32();
        if magic != MAGIC_CODE {
            return Err(FrameError::BadMagic(magic));
        }
        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let msg_type = MsgType::try_from(cursor.get_u8())?;
        let msg_uid = cursor.get_u32();
        if !is_valid_uid(msg_uid) {
            return Err(FrameError::InvalidUid(msg_uid));
        }
        let payload_len = cursor.get_u32();
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }
        Ok(Self {
            version,
            msg_type,
            msg_uid,
            payload_len,
        })
    }

    /// Total wire size of the message this header announces
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }
}

/// Build a framed message
pub fn encode(msg_type: MsgType, msg_uid: u32, payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_into(msg_type, msg_uid, payload, &mut buf)?;
    Ok(buf.freeze())
}

fn encode_into(
    msg_type: MsgType,
    msg_uid: u32,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<(), FrameError> {
    if !is_valid_uid(msg_uid) {
        return Err(FrameError::InvalidUid(msg_uid));
    }
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| FrameError::PayloadTooLarge(u32::MAX))?;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload_len));
    }
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u32(MAGIC_CODE);
    dst.put_u8(PROTOCOL_VERSION);
    dst.put_u8(msg_type as u8);
    dst.put_u32(msg_uid);
    dst.put_u32(payload_len);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a buffer that must contain exactly one message
pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
    let header = MessageHeader::parse(buf)?;
    let actual = buf.len() - HEADER_LEN;
    if header.payload_len as usize != actual {
        return Err(FrameError::LengthMismatch {
            declared: header.payload_len,
            actual,
        });
    }
    Ok(Frame {
        header,
        payload: Bytes::copy_from_slice(&buf[HEADER_LEN..]),
    })
}

/// Stream codec for the tunnel envelope
///
/// Incomplete messages stay buffered until more bytes arrive. A message
/// with an invalid envelope is dropped by skipping ahead to the next magic
/// code, so one corrupt message does not poison the rest of the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }

    /// Drop bytes up to the next plausible envelope start
    fn resync(src: &mut BytesMut) {
        let magic = MAGIC_CODE.to_be_bytes();
        match src[1..].windows(magic.len()).position(|w| w == magic) {
            Some(pos) => src.advance(pos + 1),
            None => {
                // Keep a tail that could be the start of a split magic code
                let keep = (magic.len() - 1).min(src.len());
                src.advance(src.len() - keep);
            }
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        loop {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            let header = match MessageHeader::parse(src) {
                Ok(header) => header,
                Err(e) => {
                    warn!(error = %e, buffered = src.len(), "Dropping malformed envelope");
                    Self::resync(src);
                    continue;
                }
            };
            if src.len() < header.frame_len() {
                src.reserve(header.frame_len() - src.len());
                return Ok(None);
            }
            let mut frame = src.split_to(header.frame_len());
            frame.advance(HEADER_LEN);
            return Ok(Some(Frame {
                header,
                payload: frame.freeze(),
            }));
        }
    }
}

impl Encoder<(MsgType, u32, Bytes)> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: (MsgType, u32, Bytes), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (msg_type, msg_uid, payload) = item;
        encode_into(msg_type, msg_uid, &payload, dst)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bytes {
        encode(MsgType::Control, 0x1234, b"{GET_CFG|0}").unwrap()
    }

    #[test]
    fn test_round_trip() {
        for (msg_type, uid, payload) in [
            (MsgType::Session, 1u32, &b""[..]),
            (MsgType::Control, 0x7FFF_FFFF, &b"{REQ_LOG|0|admin|secret}"[..]),
            (MsgType::Data, 2, &[0u8, 1, 2, 255][..]),
        ] {
            let bytes = encode(msg_type, uid, payload).unwrap();
            let frame = decode(&bytes).unwrap();
            assert_eq!(frame.msg_type(), msg_type);
            assert_eq!(frame.msg_uid(), uid);
            assert_eq!(&frame.payload[..], payload);
        }
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = sample().to_vec();
        bytes[0] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(FrameError::BadMagic(_))));
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut bytes = sample().to_vec();
        bytes[4] = 2;
        assert_eq!(decode(&bytes), Err(FrameError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut bytes = sample().to_vec();
        bytes[5] = 3;
        assert_eq!(decode(&bytes), Err(FrameError::UnknownType(3)));
    }

    #[test]
    fn test_rejects_reserved_uids() {
        let mut bytes = sample().to_vec();
        bytes[6..10].copy_from_slice(&0u32.to_be_bytes());
        assert_eq!(decode(&bytes), Err(FrameError::InvalidUid(0)));
        bytes[6..10].copy_from_slice(&INVALID_MSG_UID.to_be_bytes());
        assert_eq!(decode(&bytes), Err(FrameError::InvalidUid(INVALID_MSG_UID)));
        assert!(encode(MsgType::Data, 0, b"x").is_err());
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let mut bytes = sample().to_vec();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(FrameError::LengthMismatch { .. })));
        let full = sample();
        assert!(matches!(decode(&full[..HEADER_LEN + 2]), Err(FrameError::LengthMismatch { .. })));
    }

    #[test]
    fn test_codec_waits_for_complete_frame() {
        let bytes = sample();
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&bytes[..HEADER_LEN + 3]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&bytes[HEADER_LEN + 3..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.msg_uid(), 0x1234);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_splits_coalesced_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(MsgType::Session, 1, b"a").unwrap());
        buf.extend_from_slice(&encode(MsgType::Control, 2, b"bb").unwrap());
        let mut codec = FrameCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().msg_uid(), 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().msg_uid(), 2);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_codec_resyncs_after_garbage() {
        let mut buf = BytesMut::from(&b"garbage-bytes-here!"[..]);
        buf.extend_from_slice(&sample());
        let mut codec = FrameCodec::new();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.msg_uid(), 0x1234);
    }

    #[test]
    fn test_encoder_matches_encode() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode((MsgType::Control, 0x1234, Bytes::from_static(b"{GET_CFG|0}")), &mut buf)
            .unwrap();
        assert_eq!(buf.freeze(), sample());
    }
}
