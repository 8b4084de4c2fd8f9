use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;

pub type PeerReader = BufReader<OwnedReadHalf>;

/// The remote end of one established TCP connection.
///
/// The connection task owns the read side for decoding. When it decodes a
/// stream frame it parks on the stream gate, and a consumer takes the reader
/// through [`Peer::open_stream`], drains the body and calls
/// [`Peer::release_stream`]. A consumer that never releases stalls this
/// connection for good.
#[derive(Debug)]
pub struct Peer {
    remote_addr: SocketAddr,
    outbound: bool,
    reader: Mutex<PeerReader>,
    writer: Mutex<OwnedWriteHalf>,
    stream_opened: Notify,
    stream_released: Notify,
    closed: CancellationToken,
}

impl Peer {
    pub fn new(stream: TcpStream, outbound: bool) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            remote_addr,
            outbound,
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            stream_opened: Notify::new(),
            stream_released: Notify::new(),
            closed: CancellationToken::new(),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// True when this side dialed the connection.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Writes `bytes` as-is, with no framing added.
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Exclusive access to the write half, for multi-part writes that must
    /// not interleave with other senders.
    pub async fn writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Waits until the connection has parked on a stream frame, then hands
    /// out the read half positioned at the first body byte.
    pub async fn open_stream(&self) -> io::Result<MutexGuard<'_, PeerReader>> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "peer closed before its stream opened",
            )),
            _ = self.stream_opened.notified() => Ok(self.reader.lock().await),
        }
    }

    /// Lets the connection resume decoding after a stream was drained.
    /// Must be called exactly once per stream.
    pub fn release_stream(&self) {
        self.stream_released.notify_one();
    }

    /// Shuts down the connection. The connection task notices and exits.
    pub async fn close(&self) -> io::Result<()> {
        self.closed.cancel();
        self.writer.lock().await.shutdown().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub(crate) async fn reader(&self) -> MutexGuard<'_, PeerReader> {
        self.reader.lock().await
    }

    /// Called by the connection task once a stream frame has been decoded
    /// and the reader lock dropped. Returns when the consumer releases the
    /// stream or the peer is closed.
    pub(crate) async fn park_on_stream(&self) {
        self.stream_opened.notify_one();
        tokio::select! {
            _ = self.closed.cancelled() => {}
            _ = self.stream_released.notified() => {}
        }
    }
}
