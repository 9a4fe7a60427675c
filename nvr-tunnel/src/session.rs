//! Session messages and session id derivation
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
use crate::frame::HEADER_LEN;
use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

pub const DEVICE_ID_LEN: usize = 32;
pub const SESSION_ID_LEN: usize = 64;
pub const TIMESTAMP_LEN: usize = 24;

/// Encoded size of a session payload
pub const SESSION_PAYLOAD_LEN: usize = 1 + DEVICE_ID_LEN + SESSION_ID_LEN + TIMESTAMP_LEN;

/// Smallest complete session message on the wire (envelope + payload)
pub const SESSION_FRAME_LEN: usize = HEADER_LEN + SESSION_PAYLOAD_LEN;

/// Session message subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionMsgType {
    HeartbeatReq = 0,
    HeartbeatResp = 1,
    HandshakeReq = 2,
    HandshakeResp = 3,
    HandshakeAck = 4,
    HoldReq = 5,
    HoldResp = 6,
    ResumeReq = 7,
    ResumeResp = 8,
    Close = 9,
}

impl TryFrom<u8> for SessionMsgType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use SessionMsgType::*;
        Ok(match value {
            0 => HeartbeatReq,
            1 => HeartbeatResp,
            2 => HandshakeReq,
            3 => HandshakeResp,
            4 => HandshakeAck,
            5 => HoldReq,
            6 => HoldResp,
            7 => ResumeReq,
            8 => ResumeResp,
            9 => Close,
            other => return Err(FrameError::UnknownSessionType(other)),
        })
    }
}

/// Session payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPayload {
    pub msg_type: SessionMsgType,
    pub device_id: String,
    /// Derived session id, see [`SessionKey::session_id`]
    pub session_id: String,
    pub timestamp: String,
}

impl SessionPayload {
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(SESSION_PAYLOAD_LEN);
        buf.put_u8(self.msg_type as u8);
        put_fixed(&mut buf, "device_id", &self.device_id, DEVICE_ID_LEN)?;
        put_fixed(&mut buf, "session_id", &self.session_id, SESSION_ID_LEN)?;
        put_fixed(&mut buf, "timestamp", &self.timestamp, TIMESTAMP_LEN)?;
        Ok(buf.freeze())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() != SESSION_PAYLOAD_LEN {
            return Err(FrameError::LengthMismatch {
                declared: SESSION_PAYLOAD_LEN as u32,
                actual: buf.len(),
            });
        }
        let msg_type = SessionMsgType::try_from(buf[0])?;
        let mut offset = 1;
        let device_id = get_fixed(buf, &mut offset, "device_id", DEVICE_ID_LEN)?;
        let session_id = get_fixed(buf, &mut offset, "session_id", SESSION_ID_LEN)?;
        let timestamp = get_fixed(buf, &mut offset, "timestamp", TIMESTAMP_LEN)?;
        Ok(Self {
            msg_type,
            device_id,
            session_id,
            timestamp,
        })
    }
}

fn put_fixed(
    buf: &mut BytesMut,
    field: &'static str,
    value: &str,
    width: usize,
) -> Result<(), FrameError> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(FrameError::FieldTooLong { field, max: width });
    }
    buf.put_slice(bytes);
    buf.put_bytes(0, width - bytes.len());
    Ok(())
}

fn get_fixed(
    buf: &[u8],
    offset: &mut usize,
    field: &'static str,
    width: usize,
) -> Result<String, FrameError> {
    let raw = &buf[*offset..*offset + width];
    *offset += width;
    let end = raw.iter().position(|b| *b == 0).unwrap_or(width);
    std::str::from_utf8(&raw[..end])
        .map(str::to_owned)
        .map_err(|_| FrameError::BadText(field))
}

/// Inputs binding a session to its endpoints
///
/// On the relay path there are no direct public ports, so both ports are the
/// relay-allocated port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub seed: String,
    pub device_port: u16,
    pub client_port: u16,
    pub timestamp: String,
}

impl SessionKey {
    pub fn new(seed: impl Into<String>, device_port: u16, client_port: u16, timestamp: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            device_port,
            client_port,
            timestamp: timestamp.into(),
        }
    }

    /// Key for a relayed session
    pub fn relayed(seed: impl Into<String>, relay_port: u16, timestamp: impl Into<String>) -> Self {
        Self::new(seed, relay_port, relay_port, timestamp)
    }

    /// Derived session id (64 lowercase hex characters)
    pub fn session_id(&self) -> String {
        derive_session_id(&self.seed, self.device_port, self.client_port, &self.timestamp)
    }

    /// Check an inbound payload against this key
    pub fn matches(&self, payload: &SessionPayload) -> bool {
        payload.timestamp == self.timestamp && payload.session_id == self.session_id()
    }
}

/// Derive a session id from the seed, both public ports and a timestamp
pub fn derive_session_id(seed: &str, device_port: u16, client_port: u16, timestamp: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(b":");
    hasher.update(device_port.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(client_port.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(timestamp.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn payload(msg_type: SessionMsgType) -> SessionPayload {
        SessionPayload {
            msg_type,
            device_id: "NVR-0001".to_string(),
            session_id: derive_session_id("seed", 40000, 50000, "20251019T101500"),
            timestamp: "20251019T101500".to_string(),
        }
    }

    #[test]
    fn test_payload_round_trip() {
        let original = payload(SessionMsgType::HandshakeReq);
        let bytes = original.encode().unwrap();
        assert_eq!(bytes.len(), SESSION_PAYLOAD_LEN);
        assert_eq!(SessionPayload::decode(&bytes).unwrap(), original);
    }

    #[test]
    fn test_payload_rejects_unknown_subtype() {
        let mut bytes = payload(SessionMsgType::Close).encode().unwrap().to_vec();
        bytes[0] = 42;
        assert_eq!(
            SessionPayload::decode(&bytes),
            Err(FrameError::UnknownSessionType(42))
        );
    }

    #[test]
    fn test_payload_rejects_wrong_size() {
        let bytes = payload(SessionMsgType::Close).encode().unwrap();
        assert!(SessionPayload::decode(&bytes[..SESSION_PAYLOAD_LEN - 1]).is_err());
    }

    #[test]
    fn test_payload_rejects_long_field() {
        let mut p = payload(SessionMsgType::HeartbeatReq);
        p.device_id = "x".repeat(DEVICE_ID_LEN + 1);
        assert!(matches!(p.encode(), Err(FrameError::FieldTooLong { .. })));
    }

    #[test]
    fn test_session_id_is_deterministic() {
        let key = SessionKey::new("seed", 40000, 50000, "20251019T101500");
        assert_eq!(key.session_id(), key.session_id());
        assert_eq!(key.session_id().len(), SESSION_ID_LEN);
        assert!(key.matches(&payload(SessionMsgType::HandshakeReq)));
    }

    #[test]
    fn test_session_id_changes_with_every_input() {
        let base = derive_session_id("seed", 40000, 50000, "t1");
        assert_ne!(base, derive_session_id("seed2", 40000, 50000, "t1"));
        assert_ne!(base, derive_session_id("seed", 40001, 50000, "t1"));
        assert_ne!(base, derive_session_id("seed", 40000, 50001, "t1"));
        assert_ne!(base, derive_session_id("seed", 40000, 50000, "t2"));
        // Swapping the ports must not collide either
        assert_ne!(base, derive_session_id("seed", 50000, 40000, "t1"));
    }

    #[test]
    fn test_session_id_no_collisions_in_corpus() {
        let mut seen = HashSet::new();
        for device_port in 40000..40020u16 {
            for client_port in 50000..50020u16 {
                for ts in ["a", "b", "c"] {
                    assert!(seen.insert(derive_session_id("seed", device_port, client_port, ts)));
                }
            }
        }
    }

    #[test]
    fn test_key_rejects_stale_timestamp() {
        let key = SessionKey::new("seed", 40000, 50000, "20251019T101500");
        let mut stale = payload(SessionMsgType::HandshakeReq);
        stale.timestamp = "20251018T101500".to_string();
        stale.session_id = derive_session_id("seed", 40000, 50000, &stale.timestamp);
        assert!(!key.matches(&stale));
    }

    #[test]
    fn test_relayed_key_uses_relay_port_twice() {
        let key = SessionKey::relayed("seed", 49152, "t");
        assert_eq!(key.session_id(), derive_session_id("seed", 49152, 49152, "t"));
    }
}
