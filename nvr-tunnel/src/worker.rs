//! Client worker
//!
//! One task per pool slot. Establishes the transport (hole-punch race or
//! relay fallback), then runs the tick loop: timers, socket reads, commands
//! from services, and execution of the machine's actions. Stopping is
//! cooperative through a cancellation token.
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


use crate::control::CommandId;
use crate::data_fd::DataFdBroker;
use crate::error::{CloseReason, ServiceError, TunnelError};
use crate::frame::MsgType;
use crate::machine::{Action, Event, SendKind, SessionMachine, State};
use crate::msg_id::LocalMsgId;
use crate::pool::ReplyRouter;
use crate::punch::{select_targets, PunchRace};
use crate::relay::{RelayConnector, RelayControl};
use crate::services::{ClientCategory, DeviceServices, LoginReply};
use crate::session::SessionKey;
use crate::transport::{ClientTransport, FrameWriter};
use bytes::{Bytes, BytesMut};
use nvr_tunnel_config::TunnelConfig;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

/// How the device should reach the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Hole-punch race
    Direct,
    /// Relay fallback
    Relay,
}

/// Everything needed to start one client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub mode: ConnectMode,
    /// Device address the punch listener binds to
    pub bind_addr: SocketAddr,
    /// Device public port the client sees
    pub device_public_port: u16,
    /// Endpoints reported by the client
    pub client_local: SocketAddr,
    pub client_public: SocketAddr,
    /// Session timestamp agreed during signalling
    pub timestamp: String,
}

/// Messages delivered to a worker from other tasks
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Reply { local_id: LocalMsgId, payload: Bytes },
    Abandon(LocalMsgId),
    Push(Bytes),
    LoginResult {
        local_id: LocalMsgId,
        result: Result<LoginReply, ServiceError>,
    },
    RelayRefreshed(Option<u32>),
}

impl WorkerCommand {
    fn into_event(self) -> Event {
        match self {
            WorkerCommand::Reply { local_id, payload } => Event::Reply { local_id, payload },
            WorkerCommand::Abandon(local_id) => Event::Abandon(local_id),
            WorkerCommand::Push(payload) => Event::Push(payload),
            WorkerCommand::LoginResult { local_id, result } => Event::LoginResult { local_id, result },
            WorkerCommand::RelayRefreshed(lifetime) => Event::RelayRefreshed(lifetime),
        }
    }
}

struct Connected {
    transport: ClientTransport,
    writer: FrameWriter,
    relay: Option<Arc<Mutex<RelayControl>>>,
}

fn transport_error(err: impl ToString) -> CloseReason {
    CloseReason::TransportError(err.to_string())
}

pub(crate) struct ClientWorker {
    slot: usize,
    config: Arc<TunnelConfig>,
    services: Arc<dyn DeviceServices>,
    broker: Arc<DataFdBroker>,
    router: ReplyRouter,
    commands_tx: mpsc::Sender<WorkerCommand>,
    commands_rx: mpsc::Receiver<WorkerCommand>,
    /// Mirrors "in heartbeat" for writers outside the worker
    streaming: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ClientWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        slot: usize,
        config: Arc<TunnelConfig>,
        services: Arc<dyn DeviceServices>,
        broker: Arc<DataFdBroker>,
        router: ReplyRouter,
        (commands_tx, commands_rx): (mpsc::Sender<WorkerCommand>, mpsc::Receiver<WorkerCommand>),
        streaming: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            slot,
            config,
            services,
            broker,
            router,
            commands_tx,
            commands_rx,
            streaming,
            cancel,
        }
    }

    fn new_machine(&self) -> SessionMachine {
        SessionMachine::new(
            self.slot,
            self.config.device_id.clone(),
            self.config.timers.clone(),
            self.config.msg_id_slots,
            Instant::now(),
        )
    }

    /// Drive the connection to its end and clean up
    pub(crate) async fn run(mut self, request: ConnectRequest) -> CloseReason {
        info!(mode = ?request.mode, client_public = %request.client_public, "Client connection starting");
        let mut machine = self.new_machine();
        let reason = match self.connect(&request, &mut machine).await {
            Ok(mut connected) => {
                self.router.attach_writer(self.slot, connected.writer.clone()).await;
                let reason = self.serve(&mut machine, &mut connected).await;
                connected.writer.shutdown().await;
                reason
            }
            Err(reason) => reason,
        };
        self.teardown(&mut machine).await;
        reason
    }

    async fn connect(&mut self, request: &ConnectRequest, machine: &mut SessionMachine) -> Result<Connected, CloseReason> {
        match request.mode {
            ConnectMode::Direct => self.connect_direct(request, machine).await,
            ConnectMode::Relay => self.connect_relay(request, machine).await,
        }
    }

    async fn connect_direct(
        &mut self,
        request: &ConnectRequest,
        machine: &mut SessionMachine,
    ) -> Result<Connected, CloseReason> {
        let targets = select_targets(request.bind_addr, &[request.client_local, request.client_public]);
        let mut race = PunchRace::start(request.bind_addr, targets).map_err(transport_error)?;
        let mut tick = interval(self.config.timers.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(CloseReason::Stopped),
                _ = tick.tick() => {
                    for action in machine.tick(Instant::now()) {
                        match action {
                            Action::CheckProbes => {
                                let Some(stream) = race.check() else {
                                    trace!(probes = ?race.statuses(), "No punch winner yet");
                                    continue;
                                };
                                let transport = ClientTransport::new(stream, BytesMut::new(), ClientCategory::Direct)
                                    .map_err(transport_error)?;
                                let key = SessionKey::new(
                                    self.config.session_seed.clone(),
                                    request.device_public_port,
                                    request.client_public.port(),
                                    request.timestamp.clone(),
                                );
                                machine.handle(Instant::now(), Event::TransportReady { key, relay_lifetime: None });
                                return Ok(Connected {
                                    writer: transport.writer(),
                                    transport,
                                    relay: None,
                                });
                            }
                            Action::Close(reason) => return Err(reason),
                            other => debug!(action = ?other, "Ignoring action before transport is ready"),
                        }
                    }
                }
            }
        }
    }

    async fn connect_relay(
        &mut self,
        request: &ConnectRequest,
        machine: &mut SessionMachine,
    ) -> Result<Connected, CloseReason> {
        let connector = RelayConnector::from_config(&self.config.relay).map_err(transport_error)?;
        let link = tokio::select! {
            _ = self.cancel.cancelled() => return Err(CloseReason::Stopped),
            result = connector.establish(request.client_public) => match result {
                Ok(link) => link,
                Err(TunnelError::RelayExhausted(failure)) => return Err(CloseReason::RelayExhausted(failure)),
                Err(e) => return Err(transport_error(e)),
            },
        };

        // Handshake clock starts once the relay path exists
        *machine = self.new_machine();
        let transport =
            ClientTransport::new(link.data, link.residual, ClientCategory::Relayed).map_err(transport_error)?;
        let key = SessionKey::relayed(
            self.config.session_seed.clone(),
            link.relayed_addr.port(),
            request.timestamp.clone(),
        );
        machine.handle(
            Instant::now(),
            Event::TransportReady {
                key,
                relay_lifetime: Some(link.lifetime),
            },
        );
        Ok(Connected {
            writer: transport.writer(),
            transport,
            relay: Some(Arc::new(Mutex::new(link.control))),
        })
    }

    async fn serve(&mut self, machine: &mut SessionMachine, connected: &mut Connected) -> CloseReason {
        let max_frames = self.config.timers.max_frames_per_tick.max(1);
        let mut tick = interval(self.config.timers.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut queue = VecDeque::new();

        // Bytes spliced in from the relay bind are already buffered
        if let Err(reason) = read_frames(machine, &mut connected.transport, max_frames, &mut queue) {
            return reason;
        }

        loop {
            let outcome = self.execute(machine, connected, &mut queue).await;
            self.streaming
                .store(outcome.is_none() && machine.state() == State::Heartbeat, Ordering::Release);
            if let Some(reason) = outcome {
                return reason;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return CloseReason::Stopped,
                _ = tick.tick() => {
                    queue.extend(machine.tick(Instant::now()));
                    if machine.state() == State::Heartbeat {
                        for (stream, payload) in self.broker.drain(self.slot, max_frames) {
                            if let Err(e) = connected.writer.send(MsgType::Data, stream.code(), &payload).await {
                                return transport_error(e);
                            }
                        }
                    }
                    if let Err(reason) = read_frames(machine, &mut connected.transport, max_frames, &mut queue) {
                        return reason;
                    }
                }
                ready = connected.transport.readable() => {
                    if let Err(e) = ready {
                        return transport_error(e);
                    }
                    match connected.transport.fill() {
                        Ok(_) => {}
                        Err(TunnelError::Closed(reason)) => return reason,
                        Err(e) => return transport_error(e),
                    }
                    if let Err(reason) = read_frames(machine, &mut connected.transport, max_frames, &mut queue) {
                        return reason;
                    }
                }
                Some(command) = self.commands_rx.recv() => {
                    queue.extend(machine.handle(Instant::now(), command.into_event()));
                }
            }
        }
    }

    async fn execute(
        &self,
        machine: &mut SessionMachine,
        connected: &Connected,
        queue: &mut VecDeque<Action>,
    ) -> Option<CloseReason> {
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send {
                    msg_type,
                    msg_uid,
                    payload,
                    kind,
                } => {
                    // Heartbeat replies never wait on the write lock
                    let outcome = if kind == SendKind::Heartbeat {
                        connected.writer.try_send(msg_type, msg_uid, &payload).await
                    } else {
                        connected.writer.send(msg_type, msg_uid, &payload).await.map(|_| true)
                    };
                    match outcome {
                        Ok(true) => queue.extend(machine.handle(Instant::now(), Event::Sent(kind))),
                        Ok(false) => queue.extend(machine.handle(Instant::now(), Event::SendFailed(kind))),
                        Err(TunnelError::Io(e)) => return Some(transport_error(e)),
                        Err(e) => warn!(error = %e, msg_uid, "Cannot frame outbound message"),
                    }
                }
                Action::CheckProbes => {}
                Action::Login { local_id, command } => {
                    let services = self.services.clone();
                    let tx = self.commands_tx.clone();
                    let remote = connected.transport.remote_addr();
                    let category = connected.transport.category();
                    tokio::spawn(
                        async move {
                            let result = services.process_login(&command, local_id, remote, category).await;
                            let _ = tx.send(WorkerCommand::LoginResult { local_id, result }).await;
                        }
                        .in_current_span(),
                    );
                }
                Action::Dispatch { local_id, command } => {
                    let services = self.services.clone();
                    let tx = self.commands_tx.clone();
                    tokio::spawn(
                        async move {
                            let result = match command.command {
                                CommandId::GetConfig => services.process_get_config(&command, local_id).await,
                                CommandId::SetCommand => {
                                    services
                                        .process_set_command(&command, command.session_index, local_id)
                                        .await
                                }
                                CommandId::GetEvents => {
                                    services.process_get_events(command.session_index, local_id).await
                                }
                                CommandId::Login => Err(ServiceError::Rejected("login outside login state".into())),
                            };
                            if let Err(e) = result {
                                warn!(error = %e, command = %command.command, local_id = %local_id, "Service call failed");
                                let _ = tx.send(WorkerCommand::Abandon(local_id)).await;
                            }
                        }
                        .in_current_span(),
                    );
                }
                Action::DataIn { stream, payload } => {
                    if !self.broker.deliver(self.slot, stream, &payload) {
                        trace!(stream = %stream, bytes = payload.len(), "No consumer for inbound data");
                    }
                }
                Action::SetHold { session, held } => {
                    let services = self.services.clone();
                    tokio::spawn(async move { services.set_session_hold(session, held).await }.in_current_span());
                }
                Action::RefreshRelay => self.spawn_refresh(connected),
                Action::Close(reason) => return Some(reason),
            }
        }
        None
    }

    fn spawn_refresh(&self, connected: &Connected) {
        let Some(control) = connected.relay.clone() else {
            return;
        };
        let lifetime = self.config.relay.requested_lifetime_secs;
        let tx = self.commands_tx.clone();
        tokio::spawn(
            async move {
                let result = control.lock().await.refresh(lifetime).await;
                match &result {
                    Ok(granted) => debug!(lifetime = granted, "Relay allocation refreshed"),
                    Err(e) => warn!(error = %e, "Relay refresh failed"),
                }
                let _ = tx.send(WorkerCommand::RelayRefreshed(result.ok())).await;
            }
            .in_current_span(),
        );
    }

    async fn teardown(&mut self, machine: &mut SessionMachine) {
        self.streaming.store(false, Ordering::Release);
        if let Some(session) = machine.teardown() {
            self.services.logout(session).await;
        }
        let released = self.broker.release_owned_by(self.slot).await;
        if released > 0 {
            debug!(released, "Released data transfer slots");
        }
        self.commands_rx.close();
    }
}

fn read_frames(
    machine: &mut SessionMachine,
    transport: &mut ClientTransport,
    max_frames: usize,
    queue: &mut VecDeque<Action>,
) -> Result<(), CloseReason> {
    for _ in 0..max_frames {
        match transport.next_frame() {
            Ok(Some(frame)) => queue.extend(machine.handle(Instant::now(), Event::Frame(frame))),
            Ok(None) => break,
            Err(e) => return Err(transport_error(e)),
        }
    }
    Ok(())
}
