//! Control command payloads
//!
//! Control payloads are text commands such as `{REQ_LOG|0|admin|secret}`:
//! a start marker, `|`-separated fields, an end marker. The first field is
//! the command id and the second the session index.
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
use bytes::Bytes;
use std::fmt;

pub const START_MARKER: char = '{';
pub const FIELD_SEPARATOR: char = '|';
pub const END_MARKER: char = '}';

/// Command ids routed to device services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    Login,
    GetConfig,
    SetCommand,
    GetEvents,
}

impl CommandId {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandId::Login => "REQ_LOG",
            CommandId::GetConfig => "GET_CFG",
            CommandId::SetCommand => "SET_CMD",
            CommandId::GetEvents => "GET_EVT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REQ_LOG" => Some(CommandId::Login),
            "GET_CFG" => Some(CommandId::GetConfig),
            "SET_CMD" => Some(CommandId::SetCommand),
            "GET_EVT" => Some(CommandId::GetEvents),
            _ => None,
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    pub command: CommandId,
    pub session_index: u32,
    /// Command-specific fields after the session index
    pub fields: Vec<String>,
    /// Original payload, handed to services untouched
    pub raw: Bytes,
}

impl ControlCommand {
    pub fn parse(payload: Bytes) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(&payload).map_err(|_| FrameError::BadText("control"))?;
        let body = text
            .trim_end_matches(['\0', '\r', '\n'])
            .strip_prefix(START_MARKER)
            .and_then(|t| t.strip_suffix(END_MARKER))
            .ok_or_else(|| FrameError::BadControl("missing start or end marker".to_string()))?;

        let mut parts = body.split(FIELD_SEPARATOR);
        let command = parts
            .next()
            .and_then(CommandId::parse)
            .ok_or_else(|| FrameError::BadControl(format!("unknown command in '{}'", body)))?;
        let session_index = parts
            .next()
            .ok_or_else(|| FrameError::BadControl("missing session index".to_string()))?
            .trim()
            .parse::<u32>()
            .map_err(|_| FrameError::BadControl("session index is not a number".to_string()))?;
        let fields = parts.map(str::to_owned).collect();

        Ok(Self {
            command,
            session_index,
            fields,
            raw: payload,
        })
    }

    /// Build a command payload
    pub fn format(command: CommandId, session_index: u32, fields: &[&str]) -> Bytes {
        let mut text = String::new();
        text.push(START_MARKER);
        text.push_str(command.as_str());
        text.push(FIELD_SEPARATOR);
        text.push_str(&session_index.to_string());
        for field in fields {
            text.push(FIELD_SEPARATOR);
            text.push_str(field);
        }
        text.push(END_MARKER);
        Bytes::from(text)
    }
}
