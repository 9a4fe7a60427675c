//! Relay (TURN-TCP) protocol codec
//!
//! Builds the four relay control requests (Allocate, CreatePermission,
//! ConnectionBind, Refresh) and parses their responses plus the unsolicited
//! ConnectionAttempt indication. Requests after the first unauthenticated
//! Allocate carry long-term credential MESSAGE-INTEGRITY.
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


use crate::error::TurnError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::debug;

/// STUN magic cookie
pub const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN header size
pub const STUN_HEADER_LEN: usize = 20;

const INTEGRITY_LEN: usize = 20;

pub const ATTR_USERNAME: u16 = 0x0006;
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ATTR_ERROR_CODE: u16 = 0x0009;
pub const ATTR_LIFETIME: u16 = 0x000D;
pub const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
pub const ATTR_REALM: u16 = 0x0014;
pub const ATTR_NONCE: u16 = 0x0015;
pub const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
pub const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_CONNECTION_ID: u16 = 0x002A;
pub const ATTR_SOFTWARE: u16 = 0x8022;

pub const ERROR_UNAUTHORIZED: u16 = 401;
pub const ERROR_STALE_NONCE: u16 = 438;
pub const ERROR_ALLOCATION_QUOTA: u16 = 486;
pub const ERROR_INSUFFICIENT_CAPACITY: u16 = 508;

const TRANSPORT_TCP: u8 = 6;

type HmacSha1 = Hmac<Sha1>;

/// Relay methods used by the fallback path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Method {
    Allocate = 0x003,
    Refresh = 0x004,
    CreatePermission = 0x008,
    ConnectionBind = 0x00B,
    ConnectionAttempt = 0x00C,
}

impl Method {
    fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            0x003 => Some(Method::Allocate),
            0x004 => Some(Method::Refresh),
            0x008 => Some(Method::CreatePermission),
            0x00B => Some(Method::ConnectionBind),
            0x00C => Some(Method::ConnectionAttempt),
            _ => None,
        }
    }
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0b00,
            Class::Indication => 0b01,
            Class::Success => 0b10,
            Class::Error => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Class::Request,
            0b01 => Class::Indication,
            0b10 => Class::Success,
            _ => Class::Error,
        }
    }
}

/// Interleave method and class bits into the 14-bit message type
fn message_type(method: Method, class: Class) -> u16 {
    let m = method as u16;
    let c = class.bits();
    ((m & 0x0F80) << 2) | ((m & 0x0070) << 1) | (m & 0x000F) | ((c & 0b10) << 7) | ((c & 0b01) << 4)
}

fn split_message_type(raw: u16) -> (u16, Class) {
    let method = ((raw & 0x3E00) >> 2) | ((raw & 0x00E0) >> 1) | (raw & 0x000F);
    let class = ((raw & 0x0100) >> 7) | ((raw & 0x0010) >> 4);
    (method, Class::from_bits(class))
}

/// Total size of the STUN message at the start of `buf`, once the header
/// is available
pub fn stun_message_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < STUN_HEADER_LEN {
        return None;
    }
    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    Some(STUN_HEADER_LEN + len)
}

/// Long-term credential key: MD5(username ":" realm ":" password)
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    md5::compute(format!("{}:{}:{}", username, realm, password)).0
}

fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> Result<[u8; INTEGRITY_LEN], TurnError> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| TurnError::IntegrityMismatch)?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; INTEGRITY_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// One raw attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub kind: u16,
    pub value: Bytes,
}

/// Generic STUN message
#[derive(Debug, Clone)]
pub struct StunMessage {
    pub method: Method,
    pub class: Class,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<RawAttribute>,
    /// Offset of MESSAGE-INTEGRITY within the decoded buffer
    integrity_offset: Option<usize>,
}

impl StunMessage {
    pub fn new(method: Method, class: Class, transaction_id: [u8; 12]) -> Self {
        Self {
            method,
            class,
            transaction_id,
            attributes: Vec::new(),
            integrity_offset: None,
        }
    }

    pub fn with_attribute(mut self, kind: u16, value: impl Into<Bytes>) -> Self {
        self.attributes.push(RawAttribute {
            kind,
            value: value.into(),
        });
        self
    }

    pub fn with_xor_address(self, kind: u16, addr: SocketAddr) -> Self {
        let value = encode_xor_address(addr, &self.transaction_id);
        self.with_attribute(kind, value)
    }

    pub fn with_error_code(self, code: u16, reason: &str) -> Self {
        let mut value = BytesMut::with_capacity(4 + reason.len());
        value.put_u16(0);
        value.put_u8((code / 100) as u8 & 0x07);
        value.put_u8((code % 100) as u8);
        value.put_slice(reason.as_bytes());
        self.with_attribute(ATTR_ERROR_CODE, value.freeze())
    }

    pub fn attribute(&self, kind: u16) -> Option<&Bytes> {
        self.attributes
            .iter()
            .find(|attr| attr.kind == kind)
            .map(|attr| &attr.value)
    }

    /// Serialize, appending MESSAGE-INTEGRITY when a key is given
    pub fn encode(&self, integrity_key: Option<&[u8]>) -> Result<Bytes, TurnError> {
        let mut attrs = BytesMut::new();
        for attr in &self.attributes {
            put_attribute(&mut attrs, attr.kind, &attr.value);
        }

        let msg_type = message_type(self.method, self.class);
        if let Some(key) = integrity_key {
            // Length field covers the integrity attribute itself
            let header = self.header_bytes(msg_type, attrs.len() + 4 + INTEGRITY_LEN);
            let mac = hmac_sha1(key, &[&header[..], &attrs[..]])?;
            put_attribute(&mut attrs, ATTR_MESSAGE_INTEGRITY, &mac);
        }

        let mut buf = BytesMut::with_capacity(STUN_HEADER_LEN + attrs.len());
        buf.put_slice(&self.header_bytes(msg_type, attrs.len()));
        buf.put_slice(&attrs);
        Ok(buf.freeze())
    }

    fn header_bytes(&self, msg_type: u16, len: usize) -> [u8; STUN_HEADER_LEN] {
        let mut header = [0u8; STUN_HEADER_LEN];
        header[0..2].copy_from_slice(&msg_type.to_be_bytes());
        header[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        header[4..8].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        header[8..20].copy_from_slice(&self.transaction_id);
        header
    }

    /// Parse exactly one message
    pub fn decode(buf: &[u8]) -> Result<Self, TurnError> {
        if buf.len() < STUN_HEADER_LEN {
            return Err(TurnError::TooShort(buf.len()));
        }
        let mut header = &buf[..STUN_HEADER_LEN];
        let raw_type = header.get_u16();
        let len = header.get_u16() as usize;
        let cookie = header.get_u32();
        if cookie != STUN_MAGIC_COOKIE {
            return Err(TurnError::BadMagicCookie(cookie));
        }
        if raw_type & 0xC000 != 0 {
            return Err(TurnError::UnexpectedType(raw_type));
        }
        if buf.len() < STUN_HEADER_LEN + len {
            return Err(TurnError::TooShort(buf.len()));
        }
        let (method_bits, class) = split_message_type(raw_type);
        let method = Method::from_bits(method_bits).ok_or(TurnError::UnexpectedType(raw_type))?;
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&buf[8..20]);

        let mut message = Self::new(method, class, transaction_id);
        let end = STUN_HEADER_LEN + len;
        let mut offset = STUN_HEADER_LEN;
        while offset + 4 <= end {
            let kind = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let value_start = offset + 4;
            if value_start + attr_len > end {
                return Err(TurnError::BadAttribute(kind));
            }
            if kind == ATTR_MESSAGE_INTEGRITY && message.integrity_offset.is_none() {
                message.integrity_offset = Some(offset);
            }
            message.attributes.push(RawAttribute {
                kind,
                value: Bytes::copy_from_slice(&buf[value_start..value_start + attr_len]),
            });
            offset = value_start + attr_len + (4 - attr_len % 4) % 4;
        }
        Ok(message)
    }

    /// Check MESSAGE-INTEGRITY against the buffer this message was decoded from
    pub fn verify_integrity(&self, buf: &[u8], key: &[u8]) -> Result<(), TurnError> {
        let offset = self
            .integrity_offset
            .ok_or(TurnError::MissingAttribute("MESSAGE-INTEGRITY"))?;
        let received = self
            .attribute(ATTR_MESSAGE_INTEGRITY)
            .filter(|value| value.len() == INTEGRITY_LEN)
            .ok_or(TurnError::BadAttribute(ATTR_MESSAGE_INTEGRITY))?;

        let mut header = [0u8; STUN_HEADER_LEN];
        header.copy_from_slice(&buf[..STUN_HEADER_LEN]);
        let adjusted = (offset - STUN_HEADER_LEN + 4 + INTEGRITY_LEN) as u16;
        header[2..4].copy_from_slice(&adjusted.to_be_bytes());

        let mut mac = HmacSha1::new_from_slice(key).map_err(|_| TurnError::IntegrityMismatch)?;
        mac.update(&header);
        mac.update(&buf[STUN_HEADER_LEN..offset]);
        mac.verify_slice(received).map_err(|_| TurnError::IntegrityMismatch)
    }

    fn xor_address(&self, kind: u16) -> Result<Option<SocketAddr>, TurnError> {
        self.attribute(kind)
            .map(|value| decode_xor_address(kind, value, &self.transaction_id))
            .transpose()
    }

    fn u32_attribute(&self, kind: u16) -> Result<Option<u32>, TurnError> {
        match self.attribute(kind) {
            Some(value) if value.len() >= 4 => {
                Ok(Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]])))
            }
            Some(_) => Err(TurnError::BadAttribute(kind)),
            None => Ok(None),
        }
    }

    fn text_attribute(&self, kind: u16) -> Option<String> {
        self.attribute(kind)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    fn error_code(&self) -> Result<(u16, String), TurnError> {
        let value = self
            .attribute(ATTR_ERROR_CODE)
            .ok_or(TurnError::MissingAttribute("ERROR-CODE"))?;
        if value.len() < 4 {
            return Err(TurnError::BadAttribute(ATTR_ERROR_CODE));
        }
        let code = (value[2] & 0x07) as u16 * 100 + value[3] as u16;
        let reason = String::from_utf8_lossy(&value[4..]).into_owned();
        Ok((code, reason))
    }
}

fn put_attribute(buf: &mut BytesMut, kind: u16, value: &[u8]) {
    buf.put_u16(kind);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
    buf.put_bytes(0, (4 - value.len() % 4) % 4);
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Bytes {
    let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
    let mut buf = BytesMut::with_capacity(20);
    buf.put_u8(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0x01);
            buf.put_u16(addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16);
            let octets = ip.octets();
            for i in 0..4 {
                buf.put_u8(octets[i] ^ cookie[i]);
            }
        }
        IpAddr::V6(ip) => {
            buf.put_u8(0x02);
            buf.put_u16(addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16);
            let octets = ip.octets();
            for i in 0..16 {
                let mask = if i < 4 { cookie[i] } else { transaction_id[i - 4] };
                buf.put_u8(octets[i] ^ mask);
            }
        }
    }
    buf.freeze()
}

fn decode_xor_address(kind: u16, data: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr, TurnError> {
    if data.len() < 8 {
        return Err(TurnError::BadAttribute(kind));
    }
    let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
    let port = u16::from_be_bytes([data[2], data[3]]) ^ (STUN_MAGIC_COOKIE >> 16) as u16;
    let ip = match data[1] {
        0x01 => {
            let mut octets = [0u8; 4];
            for i in 0..4 {
                octets[i] = data[4 + i] ^ cookie[i];
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 if data.len() >= 20 => {
            let mut octets = [0u8; 16];
            for i in 0..16 {
                let mask = if i < 4 { cookie[i] } else { transaction_id[i - 4] };
                octets[i] = data[4 + i] ^ mask;
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(TurnError::BadAttribute(kind)),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Outcome of a relay response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResponse<T> {
    Success(T),
    /// Server asked for (fresh) credentials; realm and nonce were captured
    /// and the same request should be re-issued
    Challenge,
    /// Explicit error response
    ServerError { code: u16, reason: String },
}

/// Result of a successful Allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocateGrant {
    pub relayed_addr: SocketAddr,
    pub mapped_addr: Option<SocketAddr>,
    pub lifetime: u32,
}

/// A third party is ready to bind to the allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub peer_addr: SocketAddr,
    pub connection_id: u32,
}

/// Long-term credentials for one relay server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
    /// SOFTWARE attribute value
    pub software: String,
}

/// State of one relay client session
///
/// Holds the auth triple plus the nonce issued by the server, and what the
/// exchanges so far have taught us about the allocation.
#[derive(Debug, Clone)]
pub struct TurnSession {
    credentials: TurnCredentials,
    realm: Option<String>,
    nonce: Option<Bytes>,
    transaction_id: Option<[u8; 12]>,
    pub error_code: Option<u16>,
    pub error_reason: Option<String>,
    pub lifetime: u32,
    pub connection_id: Option<u32>,
    pub relayed_addr: Option<SocketAddr>,
    pub mapped_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}

impl TurnSession {
    pub fn new(credentials: TurnCredentials) -> Self {
        Self {
            credentials,
            realm: None,
            nonce: None,
            transaction_id: None,
            error_code: None,
            error_reason: None,
            lifetime: 0,
            connection_id: None,
            relayed_addr: None,
            mapped_addr: None,
            peer_addr: None,
        }
    }

    /// Whether a challenge has been answered
    pub fn is_authenticated(&self) -> bool {
        self.nonce.is_some()
    }

    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    /// Clear per-exchange state between a request and the next response
    pub fn reset_exchange(&mut self) {
        self.transaction_id = None;
        self.error_code = None;
        self.error_reason = None;
    }

    fn integrity_key(&self) -> [u8; 16] {
        long_term_key(
            &self.credentials.username,
            self.realm.as_deref().unwrap_or_default(),
            &self.credentials.password,
        )
    }

    fn start_request(&mut self, method: Method) -> StunMessage {
        self.reset_exchange();
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        self.transaction_id = Some(transaction_id);
        StunMessage::new(method, Class::Request, transaction_id)
    }

    fn finish_request(&self, mut message: StunMessage, authenticate: bool) -> Result<Bytes, TurnError> {
        message = message.with_attribute(ATTR_SOFTWARE, Bytes::from(self.credentials.software.clone()));
        if !authenticate {
            return message.encode(None);
        }
        message = message.with_attribute(ATTR_USERNAME, Bytes::from(self.credentials.username.clone()));
        if let Some(realm) = &self.realm {
            message = message.with_attribute(ATTR_REALM, Bytes::from(realm.clone()));
        }
        if let Some(nonce) = &self.nonce {
            message = message.with_attribute(ATTR_NONCE, nonce.clone());
        }
        message.encode(Some(&self.integrity_key()))
    }

    /// Allocate a TCP relay; unauthenticated until a challenge was answered
    pub fn allocate_request(&mut self, lifetime: u32) -> Result<Bytes, TurnError> {
        let message = self
            .start_request(Method::Allocate)
            .with_attribute(ATTR_REQUESTED_TRANSPORT, Bytes::from_static(&[TRANSPORT_TCP, 0, 0, 0]))
            .with_attribute(ATTR_LIFETIME, Bytes::copy_from_slice(&lifetime.to_be_bytes()));
        let authenticate = self.is_authenticated();
        self.finish_request(message, authenticate)
    }

    pub fn create_permission_request(&mut self, peer: SocketAddr) -> Result<Bytes, TurnError> {
        let message = self
            .start_request(Method::CreatePermission)
            .with_xor_address(ATTR_XOR_PEER_ADDRESS, peer);
        self.finish_request(message, true)
    }

    pub fn connection_bind_request(&mut self, connection_id: u32) -> Result<Bytes, TurnError> {
        let message = self
            .start_request(Method::ConnectionBind)
            .with_attribute(ATTR_CONNECTION_ID, Bytes::copy_from_slice(&connection_id.to_be_bytes()));
        self.finish_request(message, true)
    }

    pub fn refresh_request(&mut self, lifetime: u32) -> Result<Bytes, TurnError> {
        let message = self
            .start_request(Method::Refresh)
            .with_attribute(ATTR_LIFETIME, Bytes::copy_from_slice(&lifetime.to_be_bytes()));
        self.finish_request(message, true)
    }

    /// Decode a response and classify it
    ///
    /// Returns the decoded message for success responses so callers can pull
    /// exchange-specific attributes.
    fn classify(
        &mut self,
        buf: &[u8],
        expected: Method,
        allow_challenge: bool,
    ) -> Result<TurnResponse<StunMessage>, TurnError> {
        let message = StunMessage::decode(buf)?;
        if message.method != expected {
            return Err(TurnError::UnexpectedType(message_type(message.method, message.class)));
        }
        if self.transaction_id != Some(message.transaction_id) {
            return Err(TurnError::TransactionMismatch);
        }

        match message.class {
            Class::Success => {
                if self.is_authenticated() {
                    message.verify_integrity(buf, &self.integrity_key())?;
                }
                Ok(TurnResponse::Success(message))
            }
            Class::Error => {
                let (code, reason) = message.error_code()?;
                self.error_code = Some(code);
                self.error_reason = Some(reason.clone());

                let nonce = message.attribute(ATTR_NONCE).cloned();
                let is_challenge = matches!(code, ERROR_UNAUTHORIZED | ERROR_STALE_NONCE);
                if allow_challenge && is_challenge {
                    if let Some(nonce) = nonce {
                        if let Some(realm) = message.text_attribute(ATTR_REALM) {
                            self.realm = Some(realm);
                        }
                        self.nonce = Some(nonce);
                        debug!(code, realm = ?self.realm, "Relay server issued a challenge");
                        return Ok(TurnResponse::Challenge);
                    }
                }
                Ok(TurnResponse::ServerError { code, reason })
            }
            _ => Err(TurnError::UnexpectedType(message_type(message.method, message.class))),
        }
    }

    pub fn parse_allocate_response(&mut self, buf: &[u8]) -> Result<TurnResponse<AllocateGrant>, TurnError> {
        match self.classify(buf, Method::Allocate, true)? {
            TurnResponse::Success(message) => {
                let relayed_addr = message
                    .xor_address(ATTR_XOR_RELAYED_ADDRESS)?
                    .ok_or(TurnError::MissingAttribute("XOR-RELAYED-ADDRESS"))?;
                let mapped_addr = message.xor_address(ATTR_XOR_MAPPED_ADDRESS)?;
                let lifetime = message.u32_attribute(ATTR_LIFETIME)?.unwrap_or(0);
                self.relayed_addr = Some(relayed_addr);
                self.mapped_addr = mapped_addr;
                self.lifetime = lifetime;
                Ok(TurnResponse::Success(AllocateGrant {
                    relayed_addr,
                    mapped_addr,
                    lifetime,
                }))
            }
            TurnResponse::Challenge => Ok(TurnResponse::Challenge),
            TurnResponse::ServerError { code, reason } => Ok(TurnResponse::ServerError { code, reason }),
        }
    }

    pub fn parse_refresh_response(&mut self, buf: &[u8]) -> Result<TurnResponse<u32>, TurnError> {
        match self.classify(buf, Method::Refresh, true)? {
            TurnResponse::Success(message) => {
                let lifetime = message.u32_attribute(ATTR_LIFETIME)?.unwrap_or(self.lifetime);
                self.lifetime = lifetime;
                Ok(TurnResponse::Success(lifetime))
            }
            TurnResponse::Challenge => Ok(TurnResponse::Challenge),
            TurnResponse::ServerError { code, reason } => Ok(TurnResponse::ServerError { code, reason }),
        }
    }

    pub fn parse_create_permission_response(&mut self, buf: &[u8]) -> Result<TurnResponse<()>, TurnError> {
        Ok(match self.classify(buf, Method::CreatePermission, false)? {
            TurnResponse::Success(_) => TurnResponse::Success(()),
            TurnResponse::Challenge => TurnResponse::Challenge,
            TurnResponse::ServerError { code, reason } => TurnResponse::ServerError { code, reason },
        })
    }

    pub fn parse_connection_bind_response(&mut self, buf: &[u8]) -> Result<TurnResponse<()>, TurnError> {
        Ok(match self.classify(buf, Method::ConnectionBind, false)? {
            TurnResponse::Success(_) => TurnResponse::Success(()),
            TurnResponse::Challenge => TurnResponse::Challenge,
            TurnResponse::ServerError { code, reason } => TurnResponse::ServerError { code, reason },
        })
    }

    /// Parse the unsolicited ConnectionAttempt indication
    pub fn parse_connection_attempt(&mut self, buf: &[u8]) -> Result<ConnectionAttempt, TurnError> {
        let message = StunMessage::decode(buf)?;
        if message.method != Method::ConnectionAttempt || message.class != Class::Indication {
            return Err(TurnError::UnexpectedType(message_type(message.method, message.class)));
        }
        let peer_addr = message
            .xor_address(ATTR_XOR_PEER_ADDRESS)?
            .ok_or(TurnError::MissingAttribute("XOR-PEER-ADDRESS"))?;
        let connection_id = message
            .u32_attribute(ATTR_CONNECTION_ID)?
            .ok_or(TurnError::MissingAttribute("CONNECTION-ID"))?;
        self.peer_addr = Some(peer_addr);
        self.connection_id = Some(connection_id);
        Ok(ConnectionAttempt {
            peer_addr,
            connection_id,
        })
    }

    /// Transaction id of the request awaiting a response
    pub fn pending_transaction(&self) -> Option<[u8; 12]> {
        self.transaction_id
    }

    /// Whether `buf` is a response to the request in flight
    ///
    /// Indications, undecodable messages and late responses to earlier
    /// requests all return `false`.
    pub fn answers_pending(&self, buf: &[u8]) -> bool {
        match StunMessage::decode(buf) {
            Ok(message) => {
                matches!(message.class, Class::Success | Class::Error)
                    && self.transaction_id == Some(message.transaction_id)
            }
            Err(_) => false,
        }
    }

    /// Key the server side uses for responses to this session
    pub fn response_key(&self) -> Option<[u8; 16]> {
        self.is_authenticated().then(|| self.integrity_key())
    }
}
