//! Data-transfer fd broker
//!
//! Pairs a streaming subsystem (two-way audio, playback) with the client
//! that requested the stream. Each stream type has one process-wide slot
//! holding a pair of connected loopback sockets: the subsystem reads and
//! writes one end, the owning client worker drains the other end into Data
//! frames and feeds inbound Data frames back into it.
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


use crate::error::{TunnelError, TunnelResult};
use crate::msg_id::LocalMsgId;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Largest datagram forwarded in one read
const MAX_DATAGRAM: usize = 64 * 1024;

/// Logical stream carried in Data frames
///
/// The envelope msgUid of a Data frame carries this code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StreamType {
    TwoWayAudio = 1,
    Playback = 2,
}

impl StreamType {
    pub const ALL: [StreamType; 2] = [StreamType::TwoWayAudio, StreamType::Playback];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(StreamType::TwoWayAudio),
            2 => Some(StreamType::Playback),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize - 1
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::TwoWayAudio => write!(f, "two-way-audio"),
            StreamType::Playback => write!(f, "playback"),
        }
    }
}

#[derive(Debug)]
struct Binding {
    client_slot: usize,
    local_id: LocalMsgId,
    socket: UdpSocket,
    // Receive scratch reused by every drain of this slot
    scratch: Box<[u8]>,
}

/// Process-wide table of stream bindings
///
/// Slot locks are leaf locks: nothing else is locked while one is held.
#[derive(Debug)]
pub struct DataFdBroker {
    slots: Vec<Mutex<Option<Binding>>>,
}

impl Default for DataFdBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl DataFdBroker {
    pub fn new() -> Self {
        Self {
            slots: StreamType::ALL.iter().map(|_| Mutex::new(None)).collect(),
        }
    }

    fn slot(&self, stream: StreamType) -> &Mutex<Option<Binding>> {
        &self.slots[stream.index()]
    }

    /// Bind `stream` to the client owning `local_id`
    ///
    /// Returns the subsystem end of the socket pair. Fails with
    /// [`TunnelError::DataSlotBusy`] while another request holds the slot.
    pub async fn acquire(&self, stream: StreamType, local_id: LocalMsgId) -> TunnelResult<UdpSocket> {
        let mut slot = self.slot(stream).lock().await;
        if slot.is_some() {
            return Err(TunnelError::DataSlotBusy);
        }

        let loopback = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let tunnel_end = UdpSocket::bind(loopback).await?;
        let subsystem_end = UdpSocket::bind(loopback).await?;
        tunnel_end.connect(subsystem_end.local_addr()?).await?;
        subsystem_end.connect(tunnel_end.local_addr()?).await?;

        info!(
            stream = %stream,
            client_slot = local_id.client_slot(),
            local_id = %local_id,
            "Data transfer slot acquired"
        );
        *slot = Some(Binding {
            client_slot: local_id.client_slot(),
            local_id,
            socket: tunnel_end,
            scratch: vec![0u8; MAX_DATAGRAM].into_boxed_slice(),
        });
        Ok(subsystem_end)
    }

    /// Close the tunnel end and free the slot
    pub async fn release(&self, stream: StreamType) {
        if let Some(binding) = self.slot(stream).lock().await.take() {
            info!(stream = %stream, client_slot = binding.client_slot, "Data transfer slot released");
        }
    }

    /// Free every slot owned by `client_slot`
    pub async fn release_owned_by(&self, client_slot: usize) -> usize {
        let mut released = 0;
        for stream in StreamType::ALL {
            let mut slot = self.slot(stream).lock().await;
            if slot.as_ref().map(|b| b.client_slot) == Some(client_slot) {
                *slot = None;
                released += 1;
                debug!(stream = %stream, client_slot, "Released data slot on teardown");
            }
        }
        released
    }

    /// Current owner of a stream slot
    pub async fn owner(&self, stream: StreamType) -> Option<LocalMsgId> {
        self.slot(stream).lock().await.as_ref().map(|b| b.local_id)
    }

    /// Hand an inbound Data payload to the subsystem bound to `stream`
    ///
    /// Returns `false` when the slot is busy, owned by someone else, or the
    /// subsystem is not keeping up; the payload is dropped in that case.
    pub fn deliver(&self, client_slot: usize, stream: StreamType, payload: &[u8]) -> bool {
        let Ok(slot) = self.slot(stream).try_lock() else {
            return false;
        };
        match slot.as_ref() {
            Some(binding) if binding.client_slot == client_slot => match binding.socket.try_send(payload) {
                Ok(_) => true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
                Err(e) => {
                    warn!(error = %e, stream = %stream, client_slot, "Data delivery failed");
                    false
                }
            },
            _ => false,
        }
    }

    /// Drain pending subsystem output for `client_slot`
    ///
    /// Never waits: a contended slot or an empty socket yields nothing until
    /// the next tick.
    pub fn drain(&self, client_slot: usize, max: usize) -> Vec<(StreamType, Bytes)> {
        let mut out = Vec::new();
        for stream in StreamType::ALL {
            let Ok(mut slot) = self.slot(stream).try_lock() else {
                continue;
            };
            let Some(binding) = slot.as_mut().filter(|b| b.client_slot == client_slot) else {
                continue;
            };
            while out.len() < max {
                match binding.socket.try_recv(&mut binding.scratch) {
                    Ok(n) => out.push((stream, Bytes::copy_from_slice(&binding.scratch[..n]))),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!(error = %e, stream = %stream, client_slot, "Data read failed");
                        break;
                    }
                }
            }
        }
        out
    }
}
