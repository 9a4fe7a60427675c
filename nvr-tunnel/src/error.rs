//! Error types for the NVR tunnel
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


use std::fmt;
use thiserror::Error;

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Envelope and payload validation failures
///
/// All of these are non-fatal to a connection: the offending message is
/// logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Message too short: {0} bytes")]
    TooShort(usize),

    #[error("Bad magic code: {0:#010x}")]
    BadMagic(u32),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message type: {0}")]
    UnknownType(u8),

    #[error("Invalid message uid: {0:#010x}")]
    InvalidUid(u32),

    #[error("Payload length {declared} does not match {actual} received bytes")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(u32),

    #[error("Unknown session message type: {0}")]
    UnknownSessionType(u8),

    #[error("Field '{field}' does not fit in {max} bytes")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("Field '{0}' is not valid UTF-8")]
    BadText(&'static str),

    #[error("Malformed control command: {0}")]
    BadControl(String),
}

/// Relay (TURN) message that could not be used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error("Relay message too short: {0} bytes")]
    TooShort(usize),

    #[error("Bad magic cookie: {0:#010x}")]
    BadMagicCookie(u32),

    #[error("Unexpected relay message type: {0:#06x}")]
    UnexpectedType(u16),

    #[error("Malformed attribute {0:#06x}")]
    BadAttribute(u16),

    #[error("Missing attribute {0}")]
    MissingAttribute(&'static str),

    #[error("Transaction id does not match the request")]
    TransactionMismatch,

    #[error("Message integrity check failed")]
    IntegrityMismatch,
}

/// Session multiplexer failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MsgIdError {
    /// The client uid already has a live local id
    #[error("Client message uid {0:#010x} already in flight")]
    Duplicate(u32),

    #[error("Message id table full")]
    Full,

    /// Stale, freed, foreign or malformed local id
    #[error("Invalid local message id")]
    Invalid,
}

/// Failure reported by an external device service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Classification of a relay fallback that ran out of servers
///
/// Ordered by severity; when several servers fail the worst one is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelayFailure {
    /// Any other failure (unreachable server, timeout, unexpected error)
    Generic,
    /// Server reported insufficient capacity (508)
    Capacity,
    /// Server reported allocation quota reached (486)
    Quota,
}

impl RelayFailure {
    /// Classify a relay server error code
    pub fn from_error_code(code: u16) -> Self {
        match code {
            486 => RelayFailure::Quota,
            508 => RelayFailure::Capacity,
            _ => RelayFailure::Generic,
        }
    }

    /// Keep the more severe of two classifications
    pub fn escalate(self, other: RelayFailure) -> RelayFailure {
        self.max(other)
    }
}

impl fmt::Display for RelayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayFailure::Generic => write!(f, "relay fallback failed"),
            RelayFailure::Capacity => write!(f, "relay capacity reached"),
            RelayFailure::Quota => write!(f, "relay quota reached"),
        }
    }
}

/// Why a client connection was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    HandshakeTimeout,
    HandshakeAckTimeout,
    LoginRejected(String),
    LoginTimeout,
    HeartbeatTimeout,
    HoldTimeout,
    RelayRefreshFailed,
    RelayExhausted(RelayFailure),
    PeerClosed,
    TransportError(String),
    Stopped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::HandshakeTimeout => write!(f, "handshake timed out"),
            CloseReason::HandshakeAckTimeout => write!(f, "handshake ack timed out"),
            CloseReason::LoginRejected(reason) => write!(f, "login rejected: {}", reason),
            CloseReason::LoginTimeout => write!(f, "login timed out"),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timed out"),
            CloseReason::HoldTimeout => write!(f, "hold timed out"),
            CloseReason::RelayRefreshFailed => write!(f, "relay refresh failed"),
            CloseReason::RelayExhausted(failure) => write!(f, "{}", failure),
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::TransportError(e) => write!(f, "transport error: {}", e),
            CloseReason::Stopped => write!(f, "stopped"),
        }
    }
}

/// Tunnel error
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Relay protocol error: {0}")]
    Turn(#[from] TurnError),

    #[error("Message id error: {0}")]
    MsgId(#[from] MsgIdError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// Relay server answered with an error response
    #[error("Relay server error {code}: {reason}")]
    RelayServer { code: u16, reason: String },

    /// Every configured relay server failed
    #[error("Relay fallback exhausted: {0}")]
    RelayExhausted(RelayFailure),

    #[error("No free client slot")]
    PoolFull,

    #[error("Data transfer slot busy")]
    DataSlotBusy,

    #[error("Client slot {0} is not active")]
    NoSuchClient(usize),

    /// Client exists but is not in a state that carries stream data
    #[error("Client slot {0} is not streaming")]
    NotStreaming(usize),

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("Connection closed: {0}")]
    Closed(CloseReason),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nvr_tunnel_config::ConfigError> for TunnelError {
    fn from(err: nvr_tunnel_config::ConfigError) -> Self {
        TunnelError::Config(err.to_string())
    }
}
