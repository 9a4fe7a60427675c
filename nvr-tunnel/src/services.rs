//! Device-side services reached by the tunnel
//!
//! Login, configuration, command and event handlers live outside the tunnel.
//! The tunnel hands them a [`LocalMsgId`] and they answer later through the
//! [`ReplyRouter`](crate::pool::ReplyRouter).
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


use crate::control::ControlCommand;
use crate::error::ServiceError;
use crate::msg_id::LocalMsgId;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

/// How the client reached the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCategory {
    /// Direct hole-punched connection
    Direct,
    /// Relayed through a TURN-TCP server
    Relayed,
}

impl fmt::Display for ClientCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientCategory::Direct => write!(f, "direct"),
            ClientCategory::Relayed => write!(f, "relayed"),
        }
    }
}

/// Logged-in session handle issued by the login service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u32);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginReply {
    pub session: SessionHandle,
    /// Control payload returned to the client
    pub payload: Bytes,
}

/// Handlers the tunnel dispatches Control messages to
///
/// Every call except login answers asynchronously: the handler keeps the
/// local id and later calls `ReplyRouter::reply` (or `abandon`). An `Err`
/// return means no reply will follow and the local id is released at once.
#[async_trait]
pub trait DeviceServices: Send + Sync {
    async fn process_login(
        &self,
        msg: &ControlCommand,
        local_id: LocalMsgId,
        remote_addr: SocketAddr,
        category: ClientCategory,
    ) -> Result<LoginReply, ServiceError>;

    async fn process_get_config(&self, msg: &ControlCommand, local_id: LocalMsgId) -> Result<(), ServiceError>;

    async fn process_set_command(
        &self,
        msg: &ControlCommand,
        session_index: u32,
        local_id: LocalMsgId,
    ) -> Result<(), ServiceError>;

    async fn process_get_events(&self, session_index: u32, local_id: LocalMsgId) -> Result<(), ServiceError>;

    /// Suspend or resume downstream activity for a session
    async fn set_session_hold(&self, session: SessionHandle, held: bool);

    async fn logout(&self, session: SessionHandle);
}
