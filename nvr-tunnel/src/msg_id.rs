//! Local message ids
//!
//! Maps a client-supplied message uid to a process-local [`LocalMsgId`] that
//! downstream services use to address a reply back to the right client and
//! request, without holding references into client state.
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


use crate::error::MsgIdError;
use rand::Rng;
use std::fmt;

/// Opaque handle naming one in-flight client request
///
/// Carries the owning client slot, the table index and a random nonce; a
/// handle is only honoured while the table entry it names still carries the
/// same nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalMsgId {
    client_slot: u16,
    index: u16,
    nonce: u32,
}

impl LocalMsgId {
    /// Pool slot of the client that owns this request
    pub fn client_slot(&self) -> usize {
        self.client_slot as usize
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for LocalMsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{:08x}", self.client_slot, self.index, self.nonce)
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    client_uid: u32,
    nonce: u32,
}

/// Per-client table of in-flight requests
#[derive(Debug)]
pub struct MsgIdTable {
    client_slot: u16,
    entries: Vec<Option<Entry>>,
}

impl MsgIdTable {
    pub fn new(client_slot: usize, capacity: usize) -> Self {
        Self {
            client_slot: client_slot as u16,
            entries: vec![None; capacity.min(u16::MAX as usize)],
        }
    }

    /// Reserve a local id for `client_uid`
    ///
    /// Fails with [`MsgIdError::Duplicate`] while the same uid is still live,
    /// which drops retransmitted requests.
    pub fn allocate(&mut self, client_uid: u32) -> Result<LocalMsgId, MsgIdError> {
        if self
            .entries
            .iter()
            .flatten()
            .any(|entry| entry.client_uid == client_uid)
        {
            return Err(MsgIdError::Duplicate(client_uid));
        }
        let index = self
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(MsgIdError::Full)?;

        let nonce = rand::thread_rng().gen::<u32>();
        self.entries[index] = Some(Entry { client_uid, nonce });
        Ok(LocalMsgId {
            client_slot: self.client_slot,
            index: index as u16,
            nonce,
        })
    }

    /// Client uid behind a live local id
    pub fn resolve(&self, id: LocalMsgId) -> Result<u32, MsgIdError> {
        if id.client_slot != self.client_slot {
            return Err(MsgIdError::Invalid);
        }
        match self.entries.get(id.index()) {
            Some(Some(entry)) if entry.nonce == id.nonce => Ok(entry.client_uid),
            _ => Err(MsgIdError::Invalid),
        }
    }

    /// Release a local id; stale or unknown ids are ignored
    pub fn free(&mut self, id: LocalMsgId) {
        if self.resolve(id).is_ok() {
            self.entries[id.index()] = None;
        }
    }

    /// Release every entry
    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|entry| *entry = None);
    }

    pub fn live_count(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}
