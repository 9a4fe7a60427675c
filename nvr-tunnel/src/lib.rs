//! NAT traversal tunnel for remote NVR clients
//!
//! Lets a remote client reach a device behind NAT without port forwarding:
//! a direct TCP hole-punch race, or a TURN-TCP relay fallback, followed by a
//! handshake, login and heartbeat/hold protocol over one framed socket per
//! client.
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


pub mod control;
pub mod data_fd;
pub mod error;
pub mod frame;
pub mod machine;
pub mod msg_id;
pub mod pool;
pub mod punch;
pub mod relay;
pub mod services;
pub mod session;
pub mod timer;
pub mod transport;
pub mod turn;
mod worker;

pub use control::{CommandId, ControlCommand};
pub use data_fd::{DataFdBroker, StreamType};
pub use error::{CloseReason, RelayFailure, ServiceError, TunnelError, TunnelResult};
pub use frame::{Frame, FrameCodec, MessageHeader, MsgType};
pub use machine::{SessionMachine, State};
pub use msg_id::{LocalMsgId, MsgIdTable};
pub use pool::{ClientPool, ReplyRouter};
pub use services::{ClientCategory, DeviceServices, LoginReply, SessionHandle};
pub use session::{SessionKey, SessionMsgType, SessionPayload};
pub use worker::{ConnectMode, ConnectRequest};
