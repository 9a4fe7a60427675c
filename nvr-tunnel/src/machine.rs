//! Client connection state machine
//!
//! Sans-IO core of one client connection. Inbound frames, timer expiries,
//! service results and send outcomes all enter through
//! [`SessionMachine::handle`]; the machine answers with [`Action`]s that the
//! worker carries out on real sockets. States advance
//! `Handshake -> HandshakeAck -> Login -> Heartbeat <-> Hold`; any fatal
//! condition yields a single [`Action::Close`].
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


use crate::control::{CommandId, ControlCommand};
use crate::data_fd::StreamType;
use crate::error::{CloseReason, MsgIdError, ServiceError};
use crate::frame::{Frame, MsgType, INVALID_MSG_UID};
use crate::msg_id::{LocalMsgId, MsgIdTable};
use crate::services::{LoginReply, SessionHandle};
use crate::session::{SessionKey, SessionMsgType, SessionPayload};
use crate::timer::{Expiry, Repeat, TimerEvent, TimerSet};
use bytes::Bytes;
use nvr_tunnel_config::TimerConfig;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// First msgUid used for device-initiated pushes
pub const PUSH_UID_BASE: u32 = 0x8000_0000;

/// Consecutive relay refresh failures tolerated before teardown
pub const RELAY_REFRESH_MAX_FAILURES: u32 = 3;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Handshake,
    HandshakeAck,
    Login,
    Heartbeat,
    Hold,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Handshake => "handshake",
            State::HandshakeAck => "handshake-ack",
            State::Login => "login",
            State::Heartbeat => "heartbeat",
            State::Hold => "hold",
        };
        f.write_str(name)
    }
}

/// What an outbound frame was for; reported back with send outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    Handshake,
    Heartbeat,
    Hold,
    Reply,
    Push,
}

/// Input to the machine
#[derive(Debug)]
pub enum Event {
    /// A transport won the race (or the relay was established)
    TransportReady {
        key: SessionKey,
        /// Granted relay lifetime in seconds, when relayed
        relay_lifetime: Option<u32>,
    },
    Frame(Frame),
    Timer(Expiry),
    LoginResult {
        local_id: LocalMsgId,
        result: Result<LoginReply, ServiceError>,
    },
    /// A service answered a request
    Reply { local_id: LocalMsgId, payload: Bytes },
    /// A service dropped a request without answering
    Abandon(LocalMsgId),
    /// Device-initiated notification
    Push(Bytes),
    SendFailed(SendKind),
    Sent(SendKind),
    /// Outcome of a relay refresh: the new lifetime, or `None` on failure
    RelayRefreshed(Option<u32>),
}

/// Output of the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send {
        msg_type: MsgType,
        msg_uid: u32,
        payload: Bytes,
        kind: SendKind,
    },
    /// Re-check the hole-punch attempts for a winner
    CheckProbes,
    Login {
        local_id: LocalMsgId,
        command: ControlCommand,
    },
    /// Hand a non-login control command to its service
    Dispatch {
        local_id: LocalMsgId,
        command: ControlCommand,
    },
    /// Inbound stream data for the data-transfer broker
    DataIn { stream: StreamType, payload: Bytes },
    SetHold { session: SessionHandle, held: bool },
    RefreshRelay,
    Close(CloseReason),
}

/// State machine of one client connection
#[derive(Debug)]
pub struct SessionMachine {
    device_id: String,
    config: TimerConfig,
    state: State,
    timers: TimerSet,
    msg_ids: MsgIdTable,
    key: Option<SessionKey>,
    session_id: String,
    session: Option<SessionHandle>,
    login_pending: Option<LocalMsgId>,
    /// Heartbeat-Resp awaiting a successful send
    pending_heartbeat: Option<(u32, Bytes)>,
    /// Hold-Resp repeated while held
    hold_reply: Option<(u32, Bytes)>,
    /// Control replies that came back while held, sent on resume
    deferred_replies: Vec<(u32, Bytes)>,
    next_push_uid: u32,
    relay_lifetime: Option<u32>,
    refresh_failures: u32,
    closed: Option<CloseReason>,
}

impl SessionMachine {
    /// Start in `Handshake` with the handshake timer armed
    pub fn new(
        client_slot: usize,
        device_id: impl Into<String>,
        config: TimerConfig,
        msg_id_slots: usize,
        now: Instant,
    ) -> Self {
        let mut timers = TimerSet::new();
        timers.arm(
            TimerEvent::HandshakeResend,
            now,
            config.handshake_resend(),
            Repeat::Times(config.handshake_max_retries),
        );
        Self {
            device_id: device_id.into(),
            config,
            state: State::Handshake,
            timers,
            msg_ids: MsgIdTable::new(client_slot, msg_id_slots),
            key: None,
            session_id: String::new(),
            session: None,
            login_pending: None,
            pending_heartbeat: None,
            hold_reply: None,
            deferred_replies: Vec::new(),
            next_push_uid: PUSH_UID_BASE,
            relay_lifetime: None,
            refresh_failures: 0,
            closed: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn session(&self) -> Option<SessionHandle> {
        self.session
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.closed.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn timers(&self) -> &TimerSet {
        &self.timers
    }

    /// Requests handed to services and not yet answered
    pub fn live_requests(&self) -> usize {
        self.msg_ids.live_count()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fire due timers through the same dispatch as every other event
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        for expiry in self.timers.expire(now) {
            actions.extend(self.handle(now, Event::Timer(expiry)));
        }
        actions
    }

    /// Release everything the connection holds; returns the session to log out
    pub fn teardown(&mut self) -> Option<SessionHandle> {
        self.timers.cancel_all();
        self.msg_ids.clear();
        self.login_pending = None;
        self.pending_heartbeat = None;
        self.hold_reply = None;
        self.deferred_replies.clear();
        self.session.take()
    }

    pub fn handle(&mut self, now: Instant, event: Event) -> Vec<Action> {
        if self.closed.is_some() {
            trace!(?event, "Ignoring event after close");
            return Vec::new();
        }
        match event {
            Event::TransportReady { key, relay_lifetime } => self.on_transport_ready(now, key, relay_lifetime),
            Event::Frame(frame) => self.on_frame(now, frame),
            Event::Timer(expiry) => self.on_timer(now, expiry),
            Event::LoginResult { local_id, result } => self.on_login_result(now, local_id, result),
            Event::Reply { local_id, payload } => self.on_reply(local_id, payload),
            Event::Abandon(local_id) => {
                self.msg_ids.free(local_id);
                Vec::new()
            }
            Event::Push(payload) => self.on_push(payload),
            Event::SendFailed(kind) => self.on_send_failed(now, kind),
            Event::Sent(kind) => {
                if kind == SendKind::Heartbeat {
                    self.timers.cancel(TimerEvent::HeartbeatResend);
                    self.pending_heartbeat = None;
                }
                Vec::new()
            }
            Event::RelayRefreshed(lifetime) => self.on_relay_refreshed(now, lifetime),
        }
    }

    fn close(&mut self, reason: CloseReason) -> Vec<Action> {
        info!(state = %self.state, reason = %reason, "Closing connection");
        self.timers.cancel_all();
        self.closed = Some(reason.clone());
        vec![Action::Close(reason)]
    }

    fn transition(&mut self, next: State) {
        debug!(from = %self.state, to = %next, "State transition");
        self.state = next;
    }

    fn on_transport_ready(&mut self, now: Instant, key: SessionKey, relay_lifetime: Option<u32>) -> Vec<Action> {
        if self.state != State::Handshake || self.key.is_some() {
            warn!(state = %self.state, "Transport already established");
            return Vec::new();
        }
        self.session_id = key.session_id();
        self.key = Some(key);
        if let Some(lifetime) = relay_lifetime {
            self.relay_lifetime = Some(lifetime);
            self.arm_relay_refresh(now, lifetime);
        }
        Vec::new()
    }

    fn arm_relay_refresh(&mut self, now: Instant, lifetime: u32) {
        let interval = Duration::from_secs(u64::from((lifetime / 2).max(1)));
        self.timers.arm(TimerEvent::RelayRefresh, now, interval, Repeat::Once);
    }

    fn session_reply(&self, msg_type: SessionMsgType) -> Option<Bytes> {
        let timestamp = self.key.as_ref().map(|k| k.timestamp.clone())?;
        let payload = SessionPayload {
            msg_type,
            device_id: self.device_id.clone(),
            session_id: self.session_id.clone(),
            timestamp,
        };
        match payload.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(error = %e, "Cannot encode session reply");
                None
            }
        }
    }

    fn send_session(&self, msg_type: SessionMsgType, msg_uid: u32, kind: SendKind) -> Vec<Action> {
        self.session_reply(msg_type)
            .map(|payload| Action::Send {
                msg_type: MsgType::Session,
                msg_uid,
                payload,
                kind,
            })
            .into_iter()
            .collect()
    }

    fn on_frame(&mut self, now: Instant, frame: Frame) -> Vec<Action> {
        match frame.msg_type() {
            MsgType::Session => self.on_session_frame(now, frame),
            MsgType::Control => self.on_control_frame(frame),
            MsgType::Data => self.on_data_frame(frame),
        }
    }

    fn on_session_frame(&mut self, now: Instant, frame: Frame) -> Vec<Action> {
        let Some(key) = self.key.as_ref() else {
            debug!("Session message before transport was established");
            return Vec::new();
        };
        let payload = match SessionPayload::decode(&frame.payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, state = %self.state, "Dropping malformed session payload");
                return Vec::new();
            }
        };
        if payload.device_id != self.device_id || !key.matches(&payload) {
            warn!(
                state = %self.state,
                subtype = ?payload.msg_type,
                "Session id mismatch, dropping message"
            );
            return Vec::new();
        }

        let uid = frame.msg_uid();
        match (self.state, payload.msg_type) {
            (_, SessionMsgType::Close) => self.close(CloseReason::PeerClosed),
            (State::Handshake, SessionMsgType::HandshakeReq) => {
                self.timers.cancel(TimerEvent::HandshakeResend);
                self.transition(State::HandshakeAck);
                self.timers
                    .arm(TimerEvent::HandshakeAckWait, now, self.config.ack_wait(), Repeat::Once);
                self.send_session(SessionMsgType::HandshakeResp, uid, SendKind::Handshake)
            }
            (State::HandshakeAck, SessionMsgType::HandshakeReq) => {
                self.timers
                    .arm(TimerEvent::HandshakeAckWait, now, self.config.ack_wait(), Repeat::Once);
                self.send_session(SessionMsgType::HandshakeResp, uid, SendKind::Handshake)
            }
            (State::HandshakeAck, SessionMsgType::HandshakeAck) => {
                self.timers.cancel(TimerEvent::HandshakeAckWait);
                self.transition(State::Login);
                self.timers
                    .arm(TimerEvent::LoginWait, now, self.config.login_wait(), Repeat::Once);
                Vec::new()
            }
            (State::Heartbeat | State::Hold, SessionMsgType::HeartbeatReq) => self.on_heartbeat(now, uid),
            (State::Heartbeat, SessionMsgType::HoldReq) => self.enter_hold(now, uid),
            (State::Hold, SessionMsgType::HoldReq) => self.send_session(SessionMsgType::HoldResp, uid, SendKind::Hold),
            (State::Hold, SessionMsgType::ResumeReq) => self.resume(now, uid),
            (state, subtype) => {
                debug!(state = %state, subtype = ?subtype, "Session message not expected in this state");
                Vec::new()
            }
        }
    }

    fn on_heartbeat(&mut self, now: Instant, uid: u32) -> Vec<Action> {
        self.timers.cancel(TimerEvent::HeartbeatResend);
        if self.state == State::Heartbeat {
            self.timers
                .arm(TimerEvent::HeartbeatWait, now, self.config.heartbeat_wait(), Repeat::Once);
        }
        match self.session_reply(SessionMsgType::HeartbeatResp) {
            Some(payload) => {
                self.pending_heartbeat = Some((uid, payload.clone()));
                vec![Action::Send {
                    msg_type: MsgType::Session,
                    msg_uid: uid,
                    payload,
                    kind: SendKind::Heartbeat,
                }]
            }
            None => Vec::new(),
        }
    }

    fn enter_hold(&mut self, now: Instant, uid: u32) -> Vec<Action> {
        self.timers.cancel(TimerEvent::HeartbeatWait);
        self.timers.cancel(TimerEvent::HeartbeatResend);
        self.pending_heartbeat = None;
        self.transition(State::Hold);
        self.timers.arm(
            TimerEvent::HoldAck,
            now,
            self.config.hold_ack_interval(),
            Repeat::Times(self.config.hold_ack_max),
        );

        let mut actions = Vec::new();
        if let Some(session) = self.session {
            actions.push(Action::SetHold { session, held: true });
        }
        if let Some(payload) = self.session_reply(SessionMsgType::HoldResp) {
            self.hold_reply = Some((uid, payload.clone()));
            actions.push(Action::Send {
                msg_type: MsgType::Session,
                msg_uid: uid,
                payload,
                kind: SendKind::Hold,
            });
        }
        actions
    }

    fn resume(&mut self, now: Instant, uid: u32) -> Vec<Action> {
        self.timers.cancel(TimerEvent::HoldAck);
        self.hold_reply = None;
        self.transition(State::Heartbeat);
        self.timers
            .arm(TimerEvent::HeartbeatWait, now, self.config.heartbeat_wait(), Repeat::Once);

        let mut actions = Vec::new();
        if let Some(session) = self.session {
            actions.push(Action::SetHold { session, held: false });
        }
        actions.extend(self.send_session(SessionMsgType::ResumeResp, uid, SendKind::Hold));
        actions.extend(self.deferred_replies.drain(..).map(|(uid, payload)| Action::Send {
            msg_type: MsgType::Control,
            msg_uid: uid,
            payload,
            kind: SendKind::Reply,
        }));
        actions
    }

    fn allocate_local_id(&mut self, uid: u32) -> Option<LocalMsgId> {
        match self.msg_ids.allocate(uid) {
            Ok(local_id) => Some(local_id),
            Err(MsgIdError::Duplicate(uid)) => {
                debug!(msg_uid = uid, "Retransmitted request already in flight");
                None
            }
            Err(e) => {
                warn!(error = %e, msg_uid = uid, "Cannot track request");
                None
            }
        }
    }

    fn on_control_frame(&mut self, frame: Frame) -> Vec<Action> {
        match self.state {
            State::Login | State::Heartbeat => {}
            State::Hold => {
                trace!("Control message ignored while held");
                return Vec::new();
            }
            state => {
                debug!(state = %state, "Control message before login");
                return Vec::new();
            }
        }

        let uid = frame.msg_uid();
        let command = match ControlCommand::parse(frame.payload) {
            Ok(command) => command,
            Err(e) => {
                debug!(error = %e, "Dropping malformed control command");
                return Vec::new();
            }
        };

        let is_login = command.command == CommandId::Login;
        match self.state {
            State::Login if !is_login => {
                debug!(command = %command.command, "Only login is accepted before login");
                Vec::new()
            }
            State::Login if self.login_pending.is_some() => {
                debug!(msg_uid = uid, "Login already in progress");
                Vec::new()
            }
            State::Login => match self.allocate_local_id(uid) {
                Some(local_id) => {
                    self.login_pending = Some(local_id);
                    vec![Action::Login { local_id, command }]
                }
                None => Vec::new(),
            },
            _ if is_login => {
                debug!("Ignoring repeated login on a logged-in connection");
                Vec::new()
            }
            _ => self
                .allocate_local_id(uid)
                .map(|local_id| Action::Dispatch { local_id, command })
                .into_iter()
                .collect(),
        }
    }

    fn on_data_frame(&mut self, frame: Frame) -> Vec<Action> {
        if self.state != State::Heartbeat {
            trace!(state = %self.state, "Data message ignored");
            return Vec::new();
        }
        match StreamType::from_code(frame.msg_uid()) {
            Some(stream) => vec![Action::DataIn {
                stream,
                payload: frame.payload,
            }],
            None => {
                debug!(msg_uid = frame.msg_uid(), "Data message for unknown stream");
                Vec::new()
            }
        }
    }

    fn on_login_result(
        &mut self,
        now: Instant,
        local_id: LocalMsgId,
        result: Result<LoginReply, ServiceError>,
    ) -> Vec<Action> {
        if self.state != State::Login || self.login_pending != Some(local_id) {
            debug!(local_id = %local_id, "Stale login result");
            self.msg_ids.free(local_id);
            return Vec::new();
        }
        self.login_pending = None;
        self.timers.cancel(TimerEvent::LoginWait);
        let uid = self.msg_ids.resolve(local_id);
        self.msg_ids.free(local_id);

        match (result, uid) {
            (Ok(reply), Ok(uid)) => {
                info!(session = %reply.session, "Client logged in");
                self.session = Some(reply.session);
                self.transition(State::Heartbeat);
                self.timers
                    .arm(TimerEvent::HeartbeatWait, now, self.config.heartbeat_wait(), Repeat::Once);
                vec![Action::Send {
                    msg_type: MsgType::Control,
                    msg_uid: uid,
                    payload: reply.payload,
                    kind: SendKind::Reply,
                }]
            }
            (Ok(_), Err(e)) => self.close(CloseReason::LoginRejected(e.to_string())),
            (Err(e), _) => self.close(CloseReason::LoginRejected(e.to_string())),
        }
    }

    fn on_reply(&mut self, local_id: LocalMsgId, payload: Bytes) -> Vec<Action> {
        match self.msg_ids.resolve(local_id) {
            Ok(uid) => {
                self.msg_ids.free(local_id);
                if self.state == State::Hold {
                    debug!(msg_uid = uid, "Holding reply until resume");
                    self.deferred_replies.push((uid, payload));
                    return Vec::new();
                }
                vec![Action::Send {
                    msg_type: MsgType::Control,
                    msg_uid: uid,
                    payload,
                    kind: SendKind::Reply,
                }]
            }
            Err(e) => {
                debug!(error = %e, local_id = %local_id, "Dropping reply for unknown request");
                Vec::new()
            }
        }
    }

    fn on_push(&mut self, payload: Bytes) -> Vec<Action> {
        if self.state != State::Heartbeat {
            debug!(state = %self.state, "Dropping push outside heartbeat");
            return Vec::new();
        }
        let uid = self.next_push_uid;
        self.next_push_uid = match uid.wrapping_add(1) {
            INVALID_MSG_UID | 0 => PUSH_UID_BASE,
            next => next,
        };
        vec![Action::Send {
            msg_type: MsgType::Control,
            msg_uid: uid,
            payload,
            kind: SendKind::Push,
        }]
    }

    fn on_send_failed(&mut self, now: Instant, kind: SendKind) -> Vec<Action> {
        match kind {
            SendKind::Heartbeat => {
                if self.pending_heartbeat.is_some() && !self.timers.is_armed(TimerEvent::HeartbeatResend) {
                    self.timers.arm(
                        TimerEvent::HeartbeatResend,
                        now,
                        self.config.heartbeat_resend(),
                        Repeat::Times(self.config.heartbeat_resend_max),
                    );
                }
            }
            other => debug!(kind = ?other, "Send failed"),
        }
        Vec::new()
    }

    fn on_timer(&mut self, now: Instant, expiry: Expiry) -> Vec<Action> {
        match (expiry.event, self.state) {
            (TimerEvent::HandshakeResend, State::Handshake) => {
                if expiry.exhausted {
                    self.close(CloseReason::HandshakeTimeout)
                } else if self.key.is_none() {
                    vec![Action::CheckProbes]
                } else {
                    Vec::new()
                }
            }
            (TimerEvent::HandshakeAckWait, State::HandshakeAck) => self.close(CloseReason::HandshakeAckTimeout),
            (TimerEvent::LoginWait, State::Login) => self.close(CloseReason::LoginTimeout),
            (TimerEvent::HeartbeatWait, State::Heartbeat) => self.close(CloseReason::HeartbeatTimeout),
            (TimerEvent::HeartbeatResend, State::Heartbeat | State::Hold) => {
                if expiry.exhausted {
                    debug!(attempts = expiry.fire_count, "Giving up on heartbeat reply");
                    self.pending_heartbeat = None;
                    if self.state == State::Heartbeat {
                        self.timers
                            .arm(TimerEvent::HeartbeatWait, now, self.config.heartbeat_wait(), Repeat::Once);
                    }
                    return Vec::new();
                }
                self.pending_heartbeat
                    .clone()
                    .map(|(uid, payload)| Action::Send {
                        msg_type: MsgType::Session,
                        msg_uid: uid,
                        payload,
                        kind: SendKind::Heartbeat,
                    })
                    .into_iter()
                    .collect()
            }
            (TimerEvent::HoldAck, State::Hold) => {
                if expiry.exhausted {
                    return self.close(CloseReason::HoldTimeout);
                }
                self.hold_reply
                    .clone()
                    .map(|(uid, payload)| Action::Send {
                        msg_type: MsgType::Session,
                        msg_uid: uid,
                        payload,
                        kind: SendKind::Hold,
                    })
                    .into_iter()
                    .collect()
            }
            (TimerEvent::RelayRefresh, _) => vec![Action::RefreshRelay],
            (event, state) => {
                trace!(?event, state = %state, "Stale timer");
                Vec::new()
            }
        }
    }

    fn on_relay_refreshed(&mut self, now: Instant, lifetime: Option<u32>) -> Vec<Action> {
        match lifetime {
            Some(lifetime) => {
                self.refresh_failures = 0;
                self.relay_lifetime = Some(lifetime);
                self.arm_relay_refresh(now, lifetime);
                Vec::new()
            }
            None => {
                self.refresh_failures += 1;
                warn!(failures = self.refresh_failures, "Relay refresh failed");
                if self.refresh_failures >= RELAY_REFRESH_MAX_FAILURES {
                    return self.close(CloseReason::RelayRefreshFailed);
                }
                let lifetime = self.relay_lifetime.unwrap_or(0);
                self.arm_relay_refresh(now, lifetime);
                Vec::new()
            }
        }
    }
}
