//! End-to-end tunnel tests over loopback sockets
//!
//! The test plays the remote client: it listens on its "public" endpoint,
//! lets the device's punch attempt connect, then speaks the framed protocol.

use async_trait::async_trait;
use bytes::BytesMut;
use nvr_tunnel::frame;
use nvr_tunnel::{
    ClientCategory, ClientPool, CommandId, ConnectMode, ConnectRequest, ControlCommand, DeviceServices, Frame,
    FrameCodec, LocalMsgId, LoginReply, MsgType, ReplyRouter, ServiceError, SessionHandle, SessionKey,
    SessionMsgType, SessionPayload, TunnelError,
};
use nvr_tunnel_config::TunnelConfig;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Decoder;

const DEVICE: &str = "NVR-E2E";
const SEED: &str = "e2e-seed";
const TIMESTAMP: &str = "20261019T120000";
const DEVICE_PUBLIC_PORT: u16 = 40000;

/// Services that answer GET_CFG through the router, like a real config service
#[derive(Default)]
struct MockServices {
    router: OnceLock<ReplyRouter>,
    logins: Mutex<Vec<ClientCategory>>,
    logouts: Mutex<Vec<SessionHandle>>,
    reject_login: bool,
}

#[async_trait]
impl DeviceServices for MockServices {
    async fn process_login(
        &self,
        msg: &ControlCommand,
        _local_id: LocalMsgId,
        _remote_addr: SocketAddr,
        category: ClientCategory,
    ) -> Result<LoginReply, ServiceError> {
        self.logins.lock().unwrap().push(category);
        if self.reject_login {
            return Err(ServiceError::Rejected("bad credentials".into()));
        }
        Ok(LoginReply {
            session: SessionHandle(msg.session_index + 100),
            payload: ControlCommand::format(CommandId::Login, msg.session_index, &["OK"]),
        })
    }

    async fn process_get_config(&self, msg: &ControlCommand, local_id: LocalMsgId) -> Result<(), ServiceError> {
        let router = self
            .router
            .get()
            .cloned()
            .ok_or_else(|| ServiceError::Unavailable("router not wired".into()))?;
        let payload = ControlCommand::format(CommandId::GetConfig, msg.session_index, &["resolution=1080p"]);
        tokio::spawn(async move {
            let _ = router.reply(local_id, payload).await;
        });
        Ok(())
    }

    async fn process_set_command(
        &self,
        _msg: &ControlCommand,
        _session_index: u32,
        _local_id: LocalMsgId,
    ) -> Result<(), ServiceError> {
        Err(ServiceError::Unavailable("read-only device".into()))
    }

    async fn process_get_events(&self, _session_index: u32, _local_id: LocalMsgId) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn set_session_hold(&self, _session: SessionHandle, _held: bool) {}

    async fn logout(&self, session: SessionHandle) {
        self.logouts.lock().unwrap().push(session);
    }
}

fn config(max_clients: usize) -> TunnelConfig {
    let mut config = TunnelConfig {
        device_id: DEVICE.to_string(),
        session_seed: SEED.to_string(),
        max_clients,
        ..TunnelConfig::default()
    };
    config.timers.tick_ms = 10;
    config.timers.handshake_resend_ms = 20;
    config.timers.handshake_max_retries = 100;
    config.timers.heartbeat_wait_ms = 300;
    config
}

fn pool_with(services: Arc<MockServices>, max_clients: usize) -> ClientPool {
    pool_from(config(max_clients), services)
}

fn pool_from(config: TunnelConfig, services: Arc<MockServices>) -> ClientPool {
    let pool = ClientPool::new(config, services.clone()).unwrap();
    let _ = services.router.set(pool.router());
    pool
}

fn request(client: SocketAddr) -> ConnectRequest {
    ConnectRequest {
        mode: ConnectMode::Direct,
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        device_public_port: DEVICE_PUBLIC_PORT,
        client_local: client,
        client_public: client,
        timestamp: TIMESTAMP.to_string(),
    }
}

struct Client {
    stream: TcpStream,
    buffer: BytesMut,
    key: SessionKey,
}

impl Client {
    /// Accept the device's punch connection on the client's public endpoint
    async fn accept(listener: &TcpListener) -> Self {
        let port = listener.local_addr().unwrap().port();
        let (stream, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("device never connected")
            .unwrap();
        Self {
            stream,
            buffer: BytesMut::new(),
            key: SessionKey::new(SEED, DEVICE_PUBLIC_PORT, port, TIMESTAMP),
        }
    }

    async fn send_session(&mut self, msg_type: SessionMsgType, uid: u32) {
        let payload = SessionPayload {
            msg_type,
            device_id: DEVICE.to_string(),
            session_id: self.key.session_id(),
            timestamp: self.key.timestamp.clone(),
        }
        .encode()
        .unwrap();
        let bytes = frame::encode(MsgType::Session, uid, &payload).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    async fn send_control(&mut self, text: &str, uid: u32) {
        let bytes = frame::encode(MsgType::Control, uid, text.as_bytes()).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Next frame, or `None` once the device closes the socket
    async fn recv(&mut self) -> Option<Frame> {
        let mut codec = FrameCodec::new();
        loop {
            if let Some(frame) = codec.decode(&mut self.buffer).unwrap() {
                return Some(frame);
            }
            let n = tokio::time::timeout(Duration::from_secs(3), self.stream.read_buf(&mut self.buffer))
                .await
                .expect("device went silent")
                .ok()?;
            if n == 0 {
                return None;
            }
        }
    }

    async fn recv_session(&mut self) -> SessionMsgType {
        let frame = self.recv().await.expect("connection closed");
        assert_eq!(frame.msg_type(), MsgType::Session);
        let payload = SessionPayload::decode(&frame.payload).unwrap();
        assert_eq!(payload.session_id, self.key.session_id());
        payload.msg_type
    }

    /// Handshake, ack and login; returns the login reply
    async fn log_in(&mut self) -> Frame {
        self.send_session(SessionMsgType::HandshakeReq, 1).await;
        assert_eq!(self.recv_session().await, SessionMsgType::HandshakeResp);
        self.send_session(SessionMsgType::HandshakeAck, 2).await;
        self.send_control("{REQ_LOG|0|admin|secret}", 3).await;
        self.recv().await.expect("no login reply")
    }
}

async fn wait_idle(pool: &ClientPool) {
    for _ in 0..300 {
        if pool.active_clients().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("clients still active");
}

#[tokio::test]
async fn test_login_then_silence_closes_socket() {
    nvr_tunnel_logging::init_test_logging();
    let services = Arc::new(MockServices::default());
    let pool = pool_with(services.clone(), 2);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    tokio_test::assert_ok!(pool.start(request(listener.local_addr().unwrap())).await);

    let mut client = Client::accept(&listener).await;
    let login = client.log_in().await;
    assert_eq!(login.msg_type(), MsgType::Control);
    assert_eq!(login.msg_uid(), 3);
    assert_eq!(&login.payload[..], b"{REQ_LOG|0|OK}");
    assert_eq!(*services.logins.lock().unwrap(), vec![ClientCategory::Direct]);

    // No heartbeats: the device gives up and closes
    let started = tokio::time::Instant::now();
    assert!(client.recv().await.is_none());
    assert!(started.elapsed() >= Duration::from_millis(250));

    wait_idle(&pool).await;
    assert_eq!(*services.logouts.lock().unwrap(), vec![SessionHandle(100)]);
}

#[tokio::test]
async fn test_heartbeats_keep_connection_alive() {
    nvr_tunnel_logging::init_test_logging();
    let services = Arc::new(MockServices::default());
    let pool = pool_with(services, 1);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    pool.start(request(listener.local_addr().unwrap())).await.unwrap();

    let mut client = Client::accept(&listener).await;
    client.log_in().await;

    // Twice the wait window, beating every 100 ms
    for uid in 10..16 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.send_session(SessionMsgType::HeartbeatReq, uid).await;
        assert_eq!(client.recv_session().await, SessionMsgType::HeartbeatResp);
    }
    assert_eq!(pool.active_clients().await, 1);

    client.send_session(SessionMsgType::Close, 20).await;
    assert!(client.recv().await.is_none());
    wait_idle(&pool).await;
}

#[tokio::test]
async fn test_control_reply_and_push_routing() -> anyhow::Result<()> {
    nvr_tunnel_logging::init_test_logging();
    let services = Arc::new(MockServices::default());
    let pool = pool_with(services, 1);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let slot = pool.start(request(listener.local_addr()?)).await?;

    let mut client = Client::accept(&listener).await;
    client.log_in().await;

    client.send_control("{GET_CFG|0}", 77).await;
    let reply = client.recv().await.unwrap();
    assert_eq!(reply.msg_uid(), 77);
    assert_eq!(&reply.payload[..], b"{GET_CFG|0|resolution=1080p}");

    pool.router()
        .push(slot, ControlCommand::format(CommandId::GetEvents, 0, &["motion"]))
        .await?;
    let push = client.recv().await.unwrap();
    assert_eq!(push.msg_type(), MsgType::Control);
    assert_eq!(push.msg_uid(), 0x8000_0000);

    pool.shutdown().await;
    assert!(client.recv().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_rejected_login_closes_connection() {
    nvr_tunnel_logging::init_test_logging();
    let services = Arc::new(MockServices {
        reject_login: true,
        ..MockServices::default()
    });
    let pool = pool_with(services.clone(), 1);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    pool.start(request(listener.local_addr().unwrap())).await.unwrap();

    let mut client = Client::accept(&listener).await;
    client.send_session(SessionMsgType::HandshakeReq, 1).await;
    assert_eq!(client.recv_session().await, SessionMsgType::HandshakeResp);
    client.send_session(SessionMsgType::HandshakeAck, 2).await;
    client.send_control("{REQ_LOG|0|admin|wrong}", 3).await;

    assert!(client.recv().await.is_none());
    wait_idle(&pool).await;
    assert!(services.logouts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_pool_is_bounded() {
    nvr_tunnel_logging::init_test_logging();
    let pool = pool_with(Arc::new(MockServices::default()), 1);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = listener.local_addr().unwrap();

    pool.start(request(client)).await.unwrap();
    let second = pool.start(request(client)).await;
    tokio_test::assert_err!(&second);
    assert!(matches!(second, Err(TunnelError::PoolFull)));

    pool.shutdown().await;
    wait_idle(&pool).await;
    tokio_test::assert_ok!(pool.start(request(client)).await);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_silent_client_frees_slot_after_handshake_retries() {
    nvr_tunnel_logging::init_test_logging();
    let mut config = config(1);
    config.timers.handshake_max_retries = 5;
    let services = Arc::new(MockServices::default());
    let pool = pool_from(config, services.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let slot = pool.start(request(listener.local_addr().unwrap())).await.unwrap();

    // The probe connects but the client never sends a handshake
    let _client = Client::accept(&listener).await;
    wait_idle(&pool).await;
    assert!(!pool.is_active(slot).await);
    assert!(services.logins.lock().unwrap().is_empty());
    assert!(services.logouts.lock().unwrap().is_empty());
}
