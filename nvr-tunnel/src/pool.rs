//! Client pool and reply routing
//!
//! A fixed number of client slots, each driven by its own worker task.
//! Services answer requests through [`ReplyRouter`], which finds the owning
//! worker from the local id alone.
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


use crate::data_fd::{DataFdBroker, StreamType};
use crate::error::{TunnelError, TunnelResult};
use crate::frame::MsgType;
use crate::msg_id::LocalMsgId;
use crate::services::DeviceServices;
use crate::transport::FrameWriter;
use crate::worker::{ClientWorker, ConnectRequest, WorkerCommand};
use bytes::Bytes;
use nvr_tunnel_config::{TunnelConfig, MIN_RELAY_SERVERS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Depth of each worker's command queue
const COMMAND_QUEUE: usize = 64;

#[derive(Debug)]
struct Route {
    commands: mpsc::Sender<WorkerCommand>,
    writer: Option<FrameWriter>,
    /// Raised by the worker only while the client is in heartbeat
    streaming: Arc<AtomicBool>,
}

/// Routes service output back to client workers
#[derive(Debug, Clone, Default)]
pub struct ReplyRouter {
    routes: Arc<RwLock<HashMap<usize, Route>>>,
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn register(
        &self,
        slot: usize,
        commands: mpsc::Sender<WorkerCommand>,
        streaming: Arc<AtomicBool>,
    ) {
        self.routes.write().await.insert(
            slot,
            Route {
                commands,
                writer: None,
                streaming,
            },
        );
    }

    pub(crate) async fn attach_writer(&self, slot: usize, writer: FrameWriter) {
        if let Some(route) = self.routes.write().await.get_mut(&slot) {
            route.writer = Some(writer);
        }
    }

    pub(crate) async fn unregister(&self, slot: usize) {
        self.routes.write().await.remove(&slot);
    }

    async fn command(&self, slot: usize, command: WorkerCommand) -> TunnelResult<()> {
        let sender = self
            .routes
            .read()
            .await
            .get(&slot)
            .map(|route| route.commands.clone())
            .ok_or(TunnelError::NoSuchClient(slot))?;
        sender
            .send(command)
            .await
            .map_err(|_| TunnelError::NoSuchClient(slot))
    }

    /// Answer the request behind `local_id`
    pub async fn reply(&self, local_id: LocalMsgId, payload: Bytes) -> TunnelResult<()> {
        self.command(local_id.client_slot(), WorkerCommand::Reply { local_id, payload })
            .await
    }

    /// Release a request that will never be answered
    pub async fn abandon(&self, local_id: LocalMsgId) -> TunnelResult<()> {
        self.command(local_id.client_slot(), WorkerCommand::Abandon(local_id))
            .await
    }

    /// Send a device-initiated Control message to a client
    pub async fn push(&self, client_slot: usize, payload: Bytes) -> TunnelResult<()> {
        self.command(client_slot, WorkerCommand::Push(payload)).await
    }

    /// Write stream data straight to the client socket
    ///
    /// Refused with `NotStreaming` unless the client is logged in and not held.
    pub async fn send_stream(&self, client_slot: usize, stream: StreamType, payload: &[u8]) -> TunnelResult<()> {
        let writer = {
            let routes = self.routes.read().await;
            let route = routes.get(&client_slot).ok_or(TunnelError::NoSuchClient(client_slot))?;
            match &route.writer {
                Some(writer) if route.streaming.load(Ordering::Acquire) => writer.clone(),
                _ => return Err(TunnelError::NotStreaming(client_slot)),
            }
        };
        writer.send(MsgType::Data, stream.code(), payload).await
    }
}

#[derive(Debug)]
struct SlotEntry {
    connection_id: Uuid,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Bounded set of client connections
pub struct ClientPool {
    config: Arc<TunnelConfig>,
    services: Arc<dyn DeviceServices>,
    broker: Arc<DataFdBroker>,
    router: ReplyRouter,
    slots: Arc<Mutex<Vec<Option<SlotEntry>>>>,
}

impl ClientPool {
    /// Create a pool with its own data-transfer broker
    pub fn new(config: TunnelConfig, services: Arc<dyn DeviceServices>) -> TunnelResult<Self> {
        Self::with_broker(config, services, Arc::new(DataFdBroker::new()))
    }

    /// Create a pool sharing a process-wide broker
    pub fn with_broker(
        config: TunnelConfig,
        services: Arc<dyn DeviceServices>,
        broker: Arc<DataFdBroker>,
    ) -> TunnelResult<Self> {
        config.validate()?;
        let relays = config.relay.servers.len();
        if relays < MIN_RELAY_SERVERS {
            warn!(
                configured = relays,
                recommended = MIN_RELAY_SERVERS,
                "Fewer relay servers than recommended"
            );
        }
        info!(
            device_id = %config.device_id,
            max_clients = config.max_clients,
            relays,
            "Client pool ready"
        );

        let slots = (0..config.max_clients).map(|_| None).collect();
        Ok(Self {
            config: Arc::new(config),
            services,
            broker,
            router: ReplyRouter::new(),
            slots: Arc::new(Mutex::new(slots)),
        })
    }

    pub fn router(&self) -> ReplyRouter {
        self.router.clone()
    }

    pub fn broker(&self) -> Arc<DataFdBroker> {
        self.broker.clone()
    }

    /// Start a client connection in the first free slot
    pub async fn start(&self, request: ConnectRequest) -> TunnelResult<usize> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .iter()
            .position(Option::is_none)
            .ok_or(TunnelError::PoolFull)?;

        let connection_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let streaming = Arc::new(AtomicBool::new(false));
        self.router.register(slot, tx.clone(), streaming.clone()).await;

        let worker = ClientWorker::new(
            slot,
            self.config.clone(),
            self.services.clone(),
            self.broker.clone(),
            self.router.clone(),
            (tx, rx),
            streaming,
            cancel.clone(),
        );
        let span = info_span!("client", client_slot = slot, connection_id = %connection_id);
        let router = self.router.clone();
        let slots_ref = self.slots.clone();
        let task = tokio::spawn(
            async move {
                let reason = worker.run(request).await;
                info!(reason = %reason, "Client connection closed");
                router.unregister(slot).await;
                let mut slots = slots_ref.lock().await;
                if slots[slot].as_ref().map(|entry| entry.connection_id) == Some(connection_id) {
                    slots[slot] = None;
                }
            }
            .instrument(span),
        );

        slots[slot] = Some(SlotEntry {
            connection_id,
            cancel,
            task: Some(task),
        });
        Ok(slot)
    }

    /// Ask a client worker to tear down; it finishes on its next iteration
    pub async fn stop(&self, slot: usize) -> TunnelResult<()> {
        let slots = self.slots.lock().await;
        match slots.get(slot).and_then(Option::as_ref) {
            Some(entry) => {
                entry.cancel.cancel();
                Ok(())
            }
            None => Err(TunnelError::NoSuchClient(slot)),
        }
    }

    pub async fn active_clients(&self) -> usize {
        self.slots.lock().await.iter().flatten().count()
    }

    pub async fn is_active(&self, slot: usize) -> bool {
        matches!(self.slots.lock().await.get(slot), Some(Some(_)))
    }

    /// Stop every client and wait for their teardown
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut slots = self.slots.lock().await;
            slots
                .iter_mut()
                .flatten()
                .filter_map(|entry| {
                    entry.cancel.cancel();
                    entry.task.take()
                })
                .collect()
        };
        info!(clients = tasks.len(), "Shutting down client pool");
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Client worker ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlCommand;
    use crate::error::ServiceError;
    use crate::frame::{self, Frame, FrameCodec};
    use crate::relay::fake::{self, Behaviour};
    use crate::services::{ClientCategory, LoginReply, SessionHandle};
    use crate::session::{SessionKey, SessionMsgType, SessionPayload};
    use crate::worker::ConnectMode;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_util::codec::Decoder;

    const DEVICE: &str = "NVR-RELAY";
    const SEED: &str = "seed";
    const TIMESTAMP: &str = "20261019T101500";

    #[derive(Default)]
    struct RecordingServices {
        logins: StdMutex<Vec<(LocalMsgId, SocketAddr, ClientCategory)>>,
        logouts: StdMutex<Vec<SessionHandle>>,
    }

    #[async_trait]
    impl DeviceServices for RecordingServices {
        async fn process_login(
            &self,
            _msg: &ControlCommand,
            local_id: LocalMsgId,
            remote_addr: SocketAddr,
            category: ClientCategory,
        ) -> Result<LoginReply, ServiceError> {
            self.logins.lock().unwrap().push((local_id, remote_addr, category));
            Ok(LoginReply {
                session: SessionHandle(5),
                payload: Bytes::from_static(b"{REQ_LOG|0|OK}"),
            })
        }

        async fn process_get_config(&self, _msg: &ControlCommand, _local_id: LocalMsgId) -> Result<(), ServiceError> {
            Ok(())
        }

        async fn process_set_command(
            &self,
            _msg: &ControlCommand,
            _session_index: u32,
            _local_id: LocalMsgId,
        ) -> Result<(), ServiceError> {
            Err(ServiceError::Unavailable("read-only".into()))
        }

        async fn process_get_events(&self, _session_index: u32, _local_id: LocalMsgId) -> Result<(), ServiceError> {
            Ok(())
        }

        async fn set_session_hold(&self, _session: SessionHandle, _held: bool) {}

        async fn logout(&self, session: SessionHandle) {
            self.logouts.lock().unwrap().push(session);
        }
    }

    fn config(relays: &[SocketAddr]) -> TunnelConfig {
        let mut config = TunnelConfig {
            device_id: DEVICE.to_string(),
            session_seed: SEED.to_string(),
            max_clients: 1,
            relay: fake::relay_config(relays),
            ..TunnelConfig::default()
        };
        config.timers.tick_ms = 10;
        config
    }

    fn request(mode: ConnectMode) -> ConnectRequest {
        ConnectRequest {
            mode,
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            device_public_port: 40000,
            client_local: "127.0.0.1:1".parse().unwrap(),
            client_public: "198.51.100.2:50000".parse().unwrap(),
            timestamp: TIMESTAMP.to_string(),
        }
    }

    fn session_bytes(key: &SessionKey, msg_type: SessionMsgType, uid: u32) -> Bytes {
        let payload = SessionPayload {
            msg_type,
            device_id: DEVICE.to_string(),
            session_id: key.session_id(),
            timestamp: key.timestamp.clone(),
        }
        .encode()
        .unwrap();
        frame::encode(MsgType::Session, uid, &payload).unwrap()
    }

    async fn read_frame(stream: &mut TcpStream, buffer: &mut BytesMut) -> Frame {
        let mut codec = FrameCodec::new();
        loop {
            if let Some(frame) = codec.decode(buffer).unwrap() {
                return frame;
            }
            let n = tokio::time::timeout(Duration::from_secs(2), stream.read_buf(buffer))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "device closed the connection");
        }
    }

    async fn wait_inactive(pool: &ClientPool, slot: usize) {
        for _ in 0..200 {
            if !pool.is_active(slot).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("slot {} still active", slot);
    }

    #[tokio::test]
    async fn test_relayed_client_uses_spliced_handshake() {
        let key = SessionKey::relayed(SEED, 49152, TIMESTAMP);
        // Handshake-Req rides in the same segment as the bind response
        let relay = fake::spawn(Behaviour::Accept {
            peer: "198.51.100.2:50000".parse().unwrap(),
            trailing: session_bytes(&key, SessionMsgType::HandshakeReq, 1),
        })
        .await;

        let services = Arc::new(RecordingServices::default());
        let pool = ClientPool::new(config(&[relay.addr]), services.clone()).unwrap();
        let slot = pool.start(request(ConnectMode::Relay)).await.unwrap();

        let mut peer = tokio::time::timeout(Duration::from_secs(2), relay.data_peer)
            .await
            .unwrap()
            .unwrap();
        let mut buffer = BytesMut::new();
        let resp = read_frame(&mut peer, &mut buffer).await;
        assert_eq!(resp.msg_type(), MsgType::Session);
        let payload = SessionPayload::decode(&resp.payload).unwrap();
        assert_eq!(payload.msg_type, SessionMsgType::HandshakeResp);
        assert_eq!(payload.session_id, key.session_id());

        peer.write_all(&session_bytes(&key, SessionMsgType::HandshakeAck, 2))
            .await
            .unwrap();
        peer.write_all(&frame::encode(MsgType::Control, 3, b"{REQ_LOG|0|admin|pw}").unwrap())
            .await
            .unwrap();
        let login = read_frame(&mut peer, &mut buffer).await;
        assert_eq!(login.msg_uid(), 3);
        assert_eq!(&login.payload[..], b"{REQ_LOG|0|OK}");
        assert_eq!(services.logins.lock().unwrap()[0].2, ClientCategory::Relayed);

        pool.stop(slot).await.unwrap();
        wait_inactive(&pool, slot).await;
        assert_eq!(*services.logouts.lock().unwrap(), vec![SessionHandle(5)]);
    }

    async fn wait_streaming(router: &ReplyRouter, slot: usize, expected: bool) {
        for _ in 0..200 {
            let result = router.send_stream(slot, StreamType::Playback, b"frame").await;
            match (expected, &result) {
                (true, Ok(())) => return,
                (false, Err(TunnelError::NotStreaming(s))) if *s == slot => return,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        panic!("slot {} never reached streaming = {}", slot, expected);
    }

    #[tokio::test]
    async fn test_stream_data_suspended_while_held() {
        let key = SessionKey::relayed(SEED, 49152, TIMESTAMP);
        let relay = fake::spawn(Behaviour::Accept {
            peer: "198.51.100.2:50000".parse().unwrap(),
            trailing: session_bytes(&key, SessionMsgType::HandshakeReq, 1),
        })
        .await;
        let pool = ClientPool::new(config(&[relay.addr]), Arc::new(RecordingServices::default())).unwrap();
        let router = pool.router();
        let slot = pool.start(request(ConnectMode::Relay)).await.unwrap();

        let mut peer = tokio::time::timeout(Duration::from_secs(2), relay.data_peer)
            .await
            .unwrap()
            .unwrap();
        let mut buffer = BytesMut::new();
        read_frame(&mut peer, &mut buffer).await;

        // Nothing streams before login
        assert!(matches!(
            router.send_stream(slot, StreamType::Playback, b"early").await,
            Err(TunnelError::NotStreaming(_))
        ));

        peer.write_all(&session_bytes(&key, SessionMsgType::HandshakeAck, 2))
            .await
            .unwrap();
        peer.write_all(&frame::encode(MsgType::Control, 3, b"{REQ_LOG|0|admin|pw}").unwrap())
            .await
            .unwrap();
        assert_eq!(read_frame(&mut peer, &mut buffer).await.msg_uid(), 3);

        wait_streaming(&router, slot, true).await;
        let data = read_frame(&mut peer, &mut buffer).await;
        assert_eq!(data.msg_type(), MsgType::Data);
        assert_eq!(data.msg_uid(), StreamType::Playback.code());

        peer.write_all(&session_bytes(&key, SessionMsgType::HoldReq, 4))
            .await
            .unwrap();
        let held = read_frame(&mut peer, &mut buffer).await;
        assert_eq!(held.msg_type(), MsgType::Session);
        assert_eq!(
            SessionPayload::decode(&held.payload).unwrap().msg_type,
            SessionMsgType::HoldResp
        );
        wait_streaming(&router, slot, false).await;

        peer.write_all(&session_bytes(&key, SessionMsgType::ResumeReq, 5))
            .await
            .unwrap();
        // Data sent just before the hold took effect may still precede the reply
        let mut resumed = read_frame(&mut peer, &mut buffer).await;
        while resumed.msg_type() == MsgType::Data {
            resumed = read_frame(&mut peer, &mut buffer).await;
        }
        assert_eq!(
            SessionPayload::decode(&resumed.payload).unwrap().msg_type,
            SessionMsgType::ResumeResp
        );
        wait_streaming(&router, slot, true).await;

        pool.stop(slot).await.unwrap();
        wait_inactive(&pool, slot).await;
    }

    #[tokio::test]
    async fn test_pool_full_and_relay_exhaustion() {
        let relay = fake::spawn(Behaviour::Reject(486)).await;
        let pool = ClientPool::new(config(&[relay.addr]), Arc::new(RecordingServices::default())).unwrap();

        let slot = pool.start(request(ConnectMode::Relay)).await.unwrap();
        // Slot stays taken until the worker finishes
        assert!(matches!(
            pool.start(request(ConnectMode::Relay)).await,
            Err(TunnelError::PoolFull)
        ));
        wait_inactive(&pool, slot).await;
        assert_eq!(pool.active_clients().await, 0);
    }

    #[tokio::test]
    async fn test_router_rejects_unknown_clients() {
        let router = ReplyRouter::new();
        assert!(matches!(
            router.push(3, Bytes::from_static(b"{GET_EVT|0}")).await,
            Err(TunnelError::NoSuchClient(3))
        ));
        assert!(matches!(
            router.send_stream(3, StreamType::Playback, b"x").await,
            Err(TunnelError::NoSuchClient(3))
        ));
    }

    #[tokio::test]
    async fn test_stop_unknown_slot() {
        let pool = ClientPool::new(config(&[]), Arc::new(RecordingServices::default())).unwrap();
        assert!(matches!(pool.stop(0).await, Err(TunnelError::NoSuchClient(0))));
        pool.shutdown().await;
    }
}
