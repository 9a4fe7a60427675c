//! Relay fallback
//!
//! Walks the configured relay servers in order. For each one: Allocate
//! (answering at most a few challenges), CreatePermission for the client,
//! wait for the ConnectionAttempt indication, then ConnectionBind on a second
//! connection that becomes the client transport. Any failure moves on to the
//! next server; running out of servers reports the worst failure seen.
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


use crate::error::{RelayFailure, TunnelError, TunnelResult};
use crate::turn::{stun_message_len, AllocateGrant, ConnectionAttempt, TurnCredentials, TurnResponse, TurnSession};
use bytes::{Bytes, BytesMut};
use nvr_tunnel_config::{RelayConfig, RelayServerConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Read one complete STUN message, leaving any trailing bytes in `buffer`
pub(crate) async fn read_stun_message(stream: &mut TcpStream, buffer: &mut BytesMut) -> TunnelResult<Bytes> {
    loop {
        if let Some(len) = stun_message_len(buffer) {
            if buffer.len() >= len {
                return Ok(buffer.split_to(len).freeze());
            }
        }
        if stream.read_buf(buffer).await? == 0 {
            return Err(TunnelError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
    }
}

async fn with_timeout<T>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = TunnelResult<T>>,
) -> TunnelResult<T> {
    timeout(limit, fut).await.map_err(|_| TunnelError::Timeout(what))?
}

fn server_error(code: u16, reason: String) -> TunnelError {
    TunnelError::RelayServer { code, reason }
}

/// Long-lived control channel to the relay server
#[derive(Debug)]
pub struct RelayControl {
    stream: TcpStream,
    buffer: BytesMut,
    session: TurnSession,
    auth_retry_max: u32,
    step_timeout: Duration,
    /// Set once a request may have been written partially
    desynced: bool,
}

impl RelayControl {
    fn new(stream: TcpStream, session: TurnSession, auth_retry_max: u32, step_timeout: Duration) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            session,
            auth_retry_max,
            step_timeout,
            desynced: false,
        }
    }

    /// Send a request and wait for its response
    ///
    /// Indications and late responses to earlier requests are skipped. A
    /// write that fails or times out leaves the channel unusable.
    async fn exchange(&mut self, request: Bytes, what: &'static str) -> TunnelResult<Bytes> {
        if self.desynced {
            return Err(TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "relay control channel lost framing",
            )));
        }
        let Self {
            stream,
            buffer,
            session,
            step_timeout,
            desynced,
            ..
        } = self;

        let written = with_timeout(*step_timeout, what, async { Ok(stream.write_all(&request).await?) }).await;
        if let Err(e) = written {
            *desynced = true;
            return Err(e);
        }

        with_timeout(*step_timeout, what, async {
            loop {
                let message = read_stun_message(stream, buffer).await?;
                if session.answers_pending(&message) {
                    return Ok(message);
                }
                debug!(exchange = what, bytes = message.len(), "Skipping relay message that does not answer the request");
            }
        })
        .await
    }

    async fn allocate(&mut self, lifetime: u32) -> TunnelResult<AllocateGrant> {
        let mut challenges = 0;
        loop {
            let request = self.session.allocate_request(lifetime)?;
            let response = self.exchange(request, "allocate").await?;
            match self.session.parse_allocate_response(&response)? {
                TurnResponse::Success(grant) => return Ok(grant),
                TurnResponse::Challenge if challenges < self.auth_retry_max => {
                    challenges += 1;
                    debug!(challenges, "Answering allocate challenge");
                }
                TurnResponse::Challenge => {
                    return Err(server_error(
                        self.session.error_code.unwrap_or(401),
                        "authentication failed".to_string(),
                    ))
                }
                TurnResponse::ServerError { code, reason } => return Err(server_error(code, reason)),
            }
        }
    }

    async fn create_permission(&mut self, peer: SocketAddr) -> TunnelResult<()> {
        let request = self.session.create_permission_request(peer)?;
        let response = self.exchange(request, "create permission").await?;
        match self.session.parse_create_permission_response(&response)? {
            TurnResponse::Success(()) => Ok(()),
            TurnResponse::Challenge => Err(server_error(401, "unexpected challenge".to_string())),
            TurnResponse::ServerError { code, reason } => Err(server_error(code, reason)),
        }
    }

    /// Wait for `peer` to reach the allocation; there is no local deadline
    ///
    /// Permissions cover the peer's IP, so attempts from any other address
    /// are ignored.
    async fn wait_connection_attempt(&mut self, peer: SocketAddr) -> TunnelResult<ConnectionAttempt> {
        loop {
            let message = read_stun_message(&mut self.stream, &mut self.buffer).await?;
            match self.session.parse_connection_attempt(&message) {
                Ok(attempt) if attempt.peer_addr.ip() == peer.ip() => return Ok(attempt),
                Ok(attempt) => warn!(
                    peer = %attempt.peer_addr,
                    expected = %peer,
                    "Ignoring connection attempt from an unexpected peer"
                ),
                Err(e) => debug!(error = %e, "Ignoring relay message while waiting for a connection"),
            }
        }
    }

    /// Renew the allocation; returns the granted lifetime
    pub async fn refresh(&mut self, lifetime: u32) -> TunnelResult<u32> {
        let mut challenges = 0;
        loop {
            let request = self.session.refresh_request(lifetime)?;
            let response = self.exchange(request, "refresh").await?;
            match self.session.parse_refresh_response(&response)? {
                TurnResponse::Success(granted) => return Ok(granted),
                TurnResponse::Challenge if challenges < self.auth_retry_max => challenges += 1,
                TurnResponse::Challenge => {
                    return Err(server_error(
                        self.session.error_code.unwrap_or(438),
                        "refresh authentication failed".to_string(),
                    ))
                }
                TurnResponse::ServerError { code, reason } => return Err(server_error(code, reason)),
            }
        }
    }
}

/// Established relay path for one client
#[derive(Debug)]
pub struct RelayLink {
    /// Data connection carrying tunnelled frames
    pub data: TcpStream,
    /// Application bytes that arrived behind the ConnectionBind response
    pub residual: BytesMut,
    pub control: RelayControl,
    pub relayed_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub lifetime: u32,
}

/// Classify a per-server failure for exhaustion reporting
pub fn classify(err: &TunnelError) -> RelayFailure {
    match err {
        TunnelError::RelayServer { code, .. } => RelayFailure::from_error_code(*code),
        _ => RelayFailure::Generic,
    }
}

/// Relay fallback driver
#[derive(Debug, Clone)]
pub struct RelayConnector {
    servers: Vec<RelayServerConfig>,
    credentials: TurnCredentials,
    auth_retry_max: u32,
    step_timeout: Duration,
    connect_timeout: Duration,
    lifetime: u32,
}

impl RelayConnector {
    pub fn from_config(config: &RelayConfig) -> TunnelResult<Self> {
        Ok(Self {
            servers: config.server_list()?,
            credentials: TurnCredentials {
                username: config.username.clone(),
                password: config.password.clone(),
                software: config.software.clone(),
            },
            auth_retry_max: config.auth_retry_max,
            step_timeout: config.step_timeout(),
            connect_timeout: config.connect_timeout(),
            lifetime: config.requested_lifetime_secs,
        })
    }

    pub fn servers(&self) -> &[RelayServerConfig] {
        &self.servers
    }

    /// Try every server in order until one yields a data connection
    pub async fn establish(&self, client_public: SocketAddr) -> TunnelResult<RelayLink> {
        let mut worst: Option<RelayFailure> = None;
        for (index, server) in self.servers.iter().enumerate() {
            match self.try_server(server, client_public).await {
                Ok(link) => {
                    info!(
                        server = %server.host,
                        port = server.port,
                        relayed = %link.relayed_addr,
                        peer = %link.peer_addr,
                        "Relay path established"
                    );
                    return Ok(link);
                }
                Err(e) => {
                    let failure = classify(&e);
                    worst = Some(worst.map_or(failure, |w| w.escalate(failure)));
                    warn!(
                        server = %server.host,
                        port = server.port,
                        index,
                        error = %e,
                        failure = %failure,
                        "Relay server failed, trying next"
                    );
                }
            }
        }
        Err(TunnelError::RelayExhausted(worst.unwrap_or(RelayFailure::Generic)))
    }

    async fn resolve(&self, server: &RelayServerConfig) -> TunnelResult<SocketAddr> {
        let host = server.host.clone();
        let port = server.port;
        with_timeout(self.connect_timeout, "resolve", async move {
            lookup_host((host.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| TunnelError::Config(format!("relay host '{}' did not resolve", host)))
        })
        .await
    }

    async fn connect(&self, addr: SocketAddr) -> TunnelResult<TcpStream> {
        with_timeout(self.connect_timeout, "connect", async move { Ok(TcpStream::connect(addr).await?) }).await
    }

    async fn try_server(&self, server: &RelayServerConfig, client_public: SocketAddr) -> TunnelResult<RelayLink> {
        let addr = self.resolve(server).await?;
        let stream = self.connect(addr).await?;
        let session = TurnSession::new(self.credentials.clone());
        let mut control = RelayControl::new(stream, session, self.auth_retry_max, self.step_timeout);

        let grant = control.allocate(self.lifetime).await?;
        debug!(relayed = %grant.relayed_addr, lifetime = grant.lifetime, "Relay allocation granted");
        control.create_permission(client_public).await?;
        let attempt = control.wait_connection_attempt(client_public).await?;
        debug!(peer = %attempt.peer_addr, connection_id = attempt.connection_id, "Peer reached relay");

        let mut data = self.connect(addr).await?;
        let mut residual = BytesMut::new();
        let request = control.session.connection_bind_request(attempt.connection_id)?;
        let response = with_timeout(self.step_timeout, "connection bind", async {
            data.write_all(&request).await?;
            read_stun_message(&mut data, &mut residual).await
        })
        .await?;
        match control.session.parse_connection_bind_response(&response)? {
            TurnResponse::Success(()) => {}
            TurnResponse::Challenge => return Err(server_error(401, "unexpected challenge".to_string())),
            TurnResponse::ServerError { code, reason } => return Err(server_error(code, reason)),
        }
        if !residual.is_empty() {
            debug!(bytes = residual.len(), "Client data arrived with the bind response");
        }

        Ok(RelayLink {
            data,
            residual,
            control,
            relayed_addr: grant.relayed_addr,
            peer_addr: attempt.peer_addr,
            lifetime: grant.lifetime,
        })
    }
}
