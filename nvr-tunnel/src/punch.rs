//! Direct hole-punch race
//!
//! Listens on the device address and connects out to the client's reported
//! local and public endpoints from the same port. The first socket holding a
//! complete Session envelope wins; every other attempt is dropped.
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


use crate::frame::{MessageHeader, MsgType};
use crate::session::SESSION_FRAME_LEN;
use futures::FutureExt;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Connectivity of one punch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Unknown,
    InProgress,
    Established,
    Refused,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeStatus::Unknown => "unknown",
            ProbeStatus::InProgress => "in-progress",
            ProbeStatus::Established => "established",
            ProbeStatus::Refused => "refused",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Probe {
    target: SocketAddr,
    status: ProbeStatus,
    connect: Option<JoinHandle<io::Result<TcpStream>>>,
    stream: Option<TcpStream>,
}

/// Racing direct connection attempts for one client
#[derive(Debug)]
pub struct PunchRace {
    local_addr: SocketAddr,
    listener: TcpListener,
    probes: Vec<Probe>,
    accepted: Vec<TcpStream>,
}

/// Pick the endpoints worth probing
///
/// An endpoint equal to the device's own address, or to one already
/// selected, cannot produce a distinct connection.
pub fn select_targets(device_addr: SocketAddr, candidates: &[SocketAddr]) -> Vec<SocketAddr> {
    let mut targets: Vec<SocketAddr> = Vec::with_capacity(candidates.len());
    for &candidate in candidates {
        if candidate == device_addr || candidate.port() == 0 || targets.contains(&candidate) {
            debug!(endpoint = %candidate, "Skipping unreachable punch endpoint");
            continue;
        }
        targets.push(candidate);
    }
    targets
}

fn reusable_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    Ok(socket)
}

/// Connect from the listening port when the OS allows it
fn spawn_connect(local_addr: SocketAddr, target: SocketAddr) -> io::Result<JoinHandle<io::Result<TcpStream>>> {
    let socket = reusable_socket(local_addr)?;
    if let Err(e) = socket.bind(local_addr) {
        debug!(error = %e, local = %local_addr, "Shared port bind refused, using an ephemeral port");
        let ephemeral = reusable_socket(local_addr)?;
        ephemeral.bind(SocketAddr::new(local_addr.ip(), 0))?;
        return Ok(tokio::spawn(ephemeral.connect(target)));
    }
    Ok(tokio::spawn(socket.connect(target)))
}

/// Whether the peeked bytes are exactly one complete Session envelope
fn holds_session_frame(peeked: &[u8]) -> bool {
    if peeked.len() != SESSION_FRAME_LEN {
        return false;
    }
    match MessageHeader::parse(peeked) {
        Ok(header) => header.msg_type == MsgType::Session && header.frame_len() == SESSION_FRAME_LEN,
        Err(_) => false,
    }
}

fn peek_session(stream: &TcpStream) -> bool {
    // One byte past the frame tells a lone handshake from a stream with more behind it
    let mut buf = [0u8; SESSION_FRAME_LEN + 1];
    match stream.peek(&mut buf).now_or_never() {
        Some(Ok(n)) => holds_session_frame(&buf[..n]),
        _ => false,
    }
}

impl PunchRace {
    /// Bind the listener and launch one connect per target
    pub fn start(bind_addr: SocketAddr, targets: Vec<SocketAddr>) -> io::Result<Self> {
        let socket = reusable_socket(bind_addr)?;
        socket.bind(bind_addr)?;
        let listener = socket.listen(8)?;
        let local_addr = listener.local_addr()?;

        let mut probes = Vec::with_capacity(targets.len());
        for target in targets {
            let connect = spawn_connect(local_addr, target)?;
            probes.push(Probe {
                target,
                status: ProbeStatus::InProgress,
                connect: Some(connect),
                stream: None,
            });
        }
        info!(local = %local_addr, probes = probes.len(), "Hole-punch race started");
        Ok(Self {
            local_addr,
            listener,
            probes,
            accepted: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn statuses(&self) -> Vec<(SocketAddr, ProbeStatus)> {
        self.probes.iter().map(|p| (p.target, p.status)).collect()
    }

    /// Collect finished connects and accepted peers
    fn poll_progress(&mut self) {
        while let Some(Ok((stream, peer))) = self.listener.accept().now_or_never() {
            debug!(peer = %peer, "Accepted punch connection");
            self.accepted.push(stream);
        }

        for probe in &mut self.probes {
            let finished = probe.connect.as_ref().map_or(false, |task| task.is_finished());
            if !finished {
                continue;
            }
            let outcome = probe.connect.take().and_then(|task| task.now_or_never());
            match outcome {
                Some(Ok(Ok(stream))) => {
                    debug!(target = %probe.target, "Punch connect established");
                    probe.status = ProbeStatus::Established;
                    probe.stream = Some(stream);
                }
                Some(Ok(Err(e))) => {
                    debug!(target = %probe.target, error = %e, "Punch connect refused, retrying");
                    probe.status = ProbeStatus::Refused;
                    // The peer's outbound attempt may open the path later
                    probe.connect = spawn_connect(self.local_addr, probe.target).ok();
                }
                _ => probe.status = ProbeStatus::Unknown,
            }
        }
    }

    /// Look for a winner; all losing sockets are closed when it is returned
    pub fn check(&mut self) -> Option<TcpStream> {
        self.poll_progress();

        if let Some(pos) = self.accepted.iter().position(peek_session) {
            let winner = self.accepted.swap_remove(pos);
            self.finish(&winner);
            return Some(winner);
        }
        let pos = self
            .probes
            .iter()
            .position(|p| p.stream.as_ref().map_or(false, peek_session))?;
        let winner = self.probes[pos].stream.take()?;
        self.finish(&winner);
        Some(winner)
    }

    fn finish(&mut self, winner: &TcpStream) {
        info!(peer = ?winner.peer_addr().ok(), "Hole-punch race won");
        for probe in &mut self.probes {
            if let Some(task) = probe.connect.take() {
                task.abort();
            }
            probe.stream = None;
        }
        self.accepted.clear();
    }
}

impl Drop for PunchRace {
    fn drop(&mut self) {
        for probe in &mut self.probes {
            if let Some(task) = probe.connect.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::session::{SessionKey, SessionMsgType, SessionPayload};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn handshake_frame() -> bytes::Bytes {
        let key = SessionKey::new("seed", 1, 2, "ts");
        let payload = SessionPayload {
            msg_type: SessionMsgType::HandshakeReq,
            device_id: "NVR".to_string(),
            session_id: key.session_id(),
            timestamp: key.timestamp.clone(),
        }
        .encode()
        .unwrap();
        frame::encode(MsgType::Session, 1, &payload).unwrap()
    }

    async fn check_until_winner(race: &mut PunchRace) -> Option<TcpStream> {
        for _ in 0..100 {
            if let Some(winner) = race.check() {
                return Some(winner);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[test]
    fn test_select_targets_skips_self_and_duplicates() {
        let device: SocketAddr = "192.168.1.10:9000".parse().unwrap();
        let local: SocketAddr = "192.168.1.20:5000".parse().unwrap();
        let public: SocketAddr = "203.0.113.9:61000".parse().unwrap();

        assert_eq!(select_targets(device, &[local, public]), vec![local, public]);
        assert_eq!(select_targets(device, &[device, public]), vec![public]);
        assert_eq!(select_targets(device, &[public, public]), vec![public]);
    }

    #[test]
    fn test_session_frame_detection() {
        let frame = handshake_frame();
        assert_eq!(frame.len(), SESSION_FRAME_LEN);
        assert!(holds_session_frame(&frame));
        assert!(!holds_session_frame(&frame[..SESSION_FRAME_LEN - 1]));
        let mut trailing = frame.to_vec();
        trailing.push(0);
        assert!(!holds_session_frame(&trailing));

        let control = frame::encode(MsgType::Control, 1, &[b'x'; 121]).unwrap();
        assert!(!holds_session_frame(&control));
    }

    #[tokio::test]
    async fn test_outbound_probe_wins_once_handshake_arrives() {
        let client = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = client.local_addr().unwrap();
        let mut race = PunchRace::start("127.0.0.1:0".parse().unwrap(), vec![target]).unwrap();

        let (mut peer, _) = tokio::time::timeout(Duration::from_secs(2), client.accept())
            .await
            .unwrap()
            .unwrap();
        // Connected but silent: no winner yet
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(race.check().is_none());
        assert_eq!(race.statuses(), vec![(target, ProbeStatus::Established)]);

        peer.write_all(&handshake_frame()).await.unwrap();
        let winner = check_until_winner(&mut race).await.unwrap();
        assert_eq!(winner.peer_addr().unwrap(), target);
    }

    #[tokio::test]
    async fn test_handshake_with_trailing_bytes_does_not_win() {
        let mut race = PunchRace::start("127.0.0.1:0".parse().unwrap(), Vec::new()).unwrap();
        let mut peer = TcpStream::connect(race.local_addr()).await.unwrap();
        let mut bytes = handshake_frame().to_vec();
        bytes.extend_from_slice(b"junk");
        peer.write_all(&bytes).await.unwrap();

        assert!(check_until_winner(&mut race).await.is_none());
    }

    #[tokio::test]
    async fn test_inbound_connection_wins() {
        let mut race = PunchRace::start("127.0.0.1:0".parse().unwrap(), Vec::new()).unwrap();
        let mut peer = TcpStream::connect(race.local_addr()).await.unwrap();
        peer.write_all(&handshake_frame()).await.unwrap();

        let winner = check_until_winner(&mut race).await.unwrap();
        assert_eq!(winner.peer_addr().unwrap(), peer.local_addr().unwrap());
    }
}
