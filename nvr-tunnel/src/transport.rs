//! Client transport
//!
//! One TCP stream per client, direct or relayed. Reads are non-blocking and
//! buffered through [`FrameCodec`]; writes go through a mutex-guarded
//! [`FrameWriter`] shared by the worker and the subsystems streaming data
//! from their own tasks.
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


use crate::error::{CloseReason, TunnelError, TunnelResult};
use crate::frame::{self, Frame, FrameCodec, MsgType};
use crate::services::ClientCategory;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Decoder;
use tracing::trace;

/// Upper bound on bytes pulled off the socket per poll
const READ_CHUNK: usize = 64 * 1024;

/// Serialized write path of one client socket
#[derive(Debug, Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<OwnedWriteHalf>>,
}

impl FrameWriter {
    fn new(half: OwnedWriteHalf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(half)),
        }
    }

    /// Frame and write a message, waiting for the write lock
    pub async fn send(&self, msg_type: MsgType, msg_uid: u32, payload: &[u8]) -> TunnelResult<()> {
        let bytes = frame::encode(msg_type, msg_uid, payload)?;
        let mut half = self.inner.lock().await;
        half.write_all(&bytes).await?;
        Ok(())
    }

    /// Frame and write a message unless another writer holds the socket
    ///
    /// Returns `Ok(false)` when the write lock is contended; the caller
    /// decides whether to retry.
    pub async fn try_send(&self, msg_type: MsgType, msg_uid: u32, payload: &[u8]) -> TunnelResult<bool> {
        let bytes = frame::encode(msg_type, msg_uid, payload)?;
        let Ok(mut half) = self.inner.try_lock() else {
            trace!(msg_uid, "Write path busy");
            return Ok(false);
        };
        half.write_all(&bytes).await?;
        Ok(true)
    }

    /// Flush and half-close the socket
    pub async fn shutdown(&self) {
        let mut half = self.inner.lock().await;
        // Peer may already be gone
        let _ = half.shutdown().await;
    }
}

/// Established transport of one client
#[derive(Debug)]
pub struct ClientTransport {
    reader: OwnedReadHalf,
    writer: FrameWriter,
    codec: FrameCodec,
    buffer: BytesMut,
    remote_addr: SocketAddr,
    category: ClientCategory,
    eof: bool,
}

impl ClientTransport {
    /// Wrap a connected stream; `residual` holds bytes already read off it
    pub fn new(stream: TcpStream, residual: BytesMut, category: ClientCategory) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        // Frames are small and latency-bound
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer: FrameWriter::new(writer),
            codec: FrameCodec::new(),
            buffer: residual,
            remote_addr,
            category,
            eof: false,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn category(&self) -> ClientCategory {
        self.category
    }

    pub fn writer(&self) -> FrameWriter {
        self.writer.clone()
    }

    /// Wait until the socket has data (or an error) to report
    pub async fn readable(&self) -> io::Result<()> {
        self.reader.readable().await
    }

    /// Pull whatever the socket holds into the buffer without blocking
    ///
    /// End of stream is reported as a peer close. Bytes that arrived ahead
    /// of it are handed out first and the close follows on the next call.
    pub fn fill(&mut self) -> TunnelResult<usize> {
        if self.eof {
            return Err(TunnelError::Closed(CloseReason::PeerClosed));
        }
        let mut total = 0;
        while total < READ_CHUNK {
            self.buffer.reserve(4096);
            match self.reader.try_read_buf(&mut self.buffer) {
                Ok(0) if total == 0 => return Err(TunnelError::Closed(CloseReason::PeerClosed)),
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Next complete frame from the buffer; malformed envelopes are skipped
    pub fn next_frame(&mut self) -> TunnelResult<Option<Frame>> {
        Ok(self.codec.decode(&mut self.buffer)?)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_residual_bytes_are_decoded_first() {
        let (mut client, device) = pair().await;
        let first = frame::encode(MsgType::Control, 7, b"{GET_CFG|0}").unwrap();
        let second = frame::encode(MsgType::Control, 8, b"{GET_EVT|0}").unwrap();

        let mut transport =
            ClientTransport::new(device, BytesMut::from(&first[..]), ClientCategory::Relayed).unwrap();
        client.write_all(&second).await.unwrap();

        assert_eq!(transport.next_frame().unwrap().unwrap().msg_uid(), 7);
        tokio::time::timeout(Duration::from_secs(1), transport.readable())
            .await
            .unwrap()
            .unwrap();
        transport.fill().unwrap();
        assert_eq!(transport.next_frame().unwrap().unwrap().msg_uid(), 8);
        assert!(transport.next_frame().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_is_peer_close() {
        let (client, device) = pair().await;
        let mut transport = ClientTransport::new(device, BytesMut::new(), ClientCategory::Direct).unwrap();
        drop(client);
        transport.readable().await.unwrap();
        assert!(matches!(
            transport.fill(),
            Err(TunnelError::Closed(CloseReason::PeerClosed))
        ));
    }

    #[tokio::test]
    async fn test_last_frame_before_eof_is_delivered() {
        let (mut client, device) = pair().await;
        let mut transport = ClientTransport::new(device, BytesMut::new(), ClientCategory::Direct).unwrap();
        client
            .write_all(&frame::encode(MsgType::Control, 9, b"{REQ_LOGOUT|0}").unwrap())
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        drop(client);
        // Let the data and the FIN land together
        tokio::time::sleep(Duration::from_millis(50)).await;

        transport.readable().await.unwrap();
        let mut filled = transport.fill();
        if matches!(filled, Ok(0)) {
            transport.readable().await.unwrap();
            filled = transport.fill();
        }
        assert!(filled.unwrap() > 0);
        assert_eq!(transport.next_frame().unwrap().unwrap().msg_uid(), 9);

        transport.readable().await.unwrap();
        assert!(matches!(
            transport.fill(),
            Err(TunnelError::Closed(CloseReason::PeerClosed))
        ));
    }

    #[tokio::test]
    async fn test_writer_frames_messages() {
        let (mut client, device) = pair().await;
        let transport = ClientTransport::new(device, BytesMut::new(), ClientCategory::Direct).unwrap();
        let writer = transport.writer();
        writer.send(MsgType::Data, 1, b"pcm").await.unwrap();
        assert!(writer.try_send(MsgType::Data, 1, b"pcm").await.unwrap());

        let expected = frame::encode(MsgType::Data, 1, b"pcm").unwrap();
        let mut buf = vec![0u8; expected.len() * 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..expected.len()], &expected[..]);
        assert_eq!(&buf[expected.len()..], &expected[..]);
    }
}
