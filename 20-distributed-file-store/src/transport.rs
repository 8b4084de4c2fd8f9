//! TCP transport: one accept loop, one read loop per connection, and a
//! single bounded queue that fans every decoded message in to one consumer.
//!
//! The transport knows nothing about files. It decodes frames with the
//! configured [`Decoder`], hands message payloads to the queue as [`Rpc`]s,
//! and parks a connection whenever a stream frame shows up so the consumer
//! can read the body straight off the socket (see [`Peer::open_stream`]).
//!
//! Connections are admitted through two hooks rather than a peer table of
//! its own, so the owner decides what "connected" means:
//! - `on_peer` runs after the handshake and may reject the peer
//! - `on_disconnect` runs once the connection task exits

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    select,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Decoder, Frame, FramedDecoder};
use crate::handshake::{Handshake, NoHandshake};
use crate::peer::Peer;

/// Capacity of the shared inbound queue before read loops start to wait.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// A decoded message together with the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    pub from: SocketAddr,
    pub payload: Vec<u8>,
}

/// Called after the handshake, before the first message is read. Returning
/// an error rejects the peer.
pub type OnPeer = Arc<dyn Fn(Arc<Peer>) -> anyhow::Result<()> + Send + Sync>;

/// Called when an admitted peer's connection task exits.
pub type OnDisconnect = Arc<dyn Fn(&Arc<Peer>) + Send + Sync>;

#[derive(Clone)]
pub struct TransportConfig {
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    pub decoder: Arc<dyn Decoder>,
    pub queue_capacity: usize,
    pub on_peer: Option<OnPeer>,
    pub on_disconnect: Option<OnDisconnect>,
}

impl TransportConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(NoHandshake),
            decoder: Arc::new(FramedDecoder::default()),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            on_peer: None,
            on_disconnect: None,
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("listen_addr", &self.listen_addr)
            .field("queue_capacity", &self.queue_capacity)
            .field("on_peer", &self.on_peer.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish_non_exhaustive()
    }
}

pub struct TcpTransport {
    shared: Arc<Shared>,
    rpc_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
}

/// State every connection task needs a handle on.
struct Shared {
    config: TransportConfig,
    rpc_tx: mpsc::Sender<Rpc>,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::channel(config.queue_capacity.max(1));

        Self {
            shared: Arc::new(Shared { config, rpc_tx }),
            rpc_rx: Mutex::new(Some(rpc_rx)),
            local_addr: OnceLock::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn decoder(&self) -> &Arc<dyn Decoder> {
        &self.shared.config.decoder
    }

    pub fn listen_addr(&self) -> &str {
        &self.shared.config.listen_addr
    }

    /// The bound address, once [`TcpTransport::listen_and_accept`] succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Binds the listener and spawns the accept loop. Returns as soon as the
    /// socket is bound.
    pub async fn listen_and_accept(&self) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.shared.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);

        info!(%addr, "tcp transport listening");

        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown.clone();
        tokio::spawn(accept_loop(listener, shared, shutdown));

        Ok(addr)
    }

    /// Connects to `addr` and starts serving the connection in the background.
    ///
    /// # Parameters
    /// - `addr`: anything tokio can resolve, e.g. `"127.0.0.1:3000"`
    ///
    /// Returns once the TCP connection is established. The handshake and the
    /// `on_peer` hook run afterwards on the connection task, so a peer that is
    /// rejected there still counts as a successful dial here.
    pub async fn dial(&self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        spawn_connection(stream, true, &self.shared);
        Ok(())
    }

    /// Hands out the inbound queue. There is exactly one consumer, so every
    /// call after the first returns `None`.
    pub fn consume(&self) -> Option<mpsc::Receiver<Rpc>> {
        self.rpc_rx.lock().take()
    }

    /// Stops accepting. Established connections keep running.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        select! {
            _ = shutdown.cancelled() => {
                debug!("tcp transport stopped accepting");
                break;
            }
            accept_result = listener.accept() => match accept_result {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "new incoming connection");
                    spawn_connection(stream, false, &shared);
                }
                Err(err) => warn!(error = ?err, "failed to accept connection"),
            }
        }
    }
}

fn spawn_connection(stream: TcpStream, outbound: bool, shared: &Arc<Shared>) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        handle_connection(stream, outbound, shared).await;
    });
}

async fn handle_connection(stream: TcpStream, outbound: bool, shared: Arc<Shared>) {
    let peer = match Peer::new(stream, outbound) {
        Ok(peer) => Arc::new(peer),
        Err(err) => {
            warn!(error = ?err, "dropping connection without a peer address");
            return;
        }
    };
    let addr = peer.remote_addr();

    if let Err(err) = shared.config.handshake.handshake(&peer).await {
        warn!(peer = %addr, error = ?err, "handshake failed");
        close_quietly(&peer).await;
        return;
    }

    if let Some(on_peer) = &shared.config.on_peer {
        if let Err(err) = on_peer(Arc::clone(&peer)) {
            warn!(peer = %addr, error = ?err, "peer rejected");
            close_quietly(&peer).await;
            return;
        }
    }

    info!(peer = %addr, outbound, "peer connected");

    match read_loop(&peer, &shared).await {
        Ok(()) => debug!(peer = %addr, "connection closed"),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            debug!(peer = %addr, "peer hung up")
        }
        Err(err) => warn!(peer = %addr, error = ?err, "dropping peer connection"),
    }

    close_quietly(&peer).await;
    if let Some(on_disconnect) = &shared.config.on_disconnect {
        on_disconnect(&peer);
    }
}

/// Decodes frames off `peer` until it closes or the queue goes away.
///
/// The reader lock is held only while one frame is being decoded. On a stream
/// frame the lock is released and the loop parks until the consumer calls
/// [`Peer::release_stream`], so the body bytes are never decoded as frames.
/// Returning `Ok` means a clean stop; any decode error ends the connection.
async fn read_loop(peer: &Arc<Peer>, shared: &Shared) -> io::Result<()> {
    let decoder = &shared.config.decoder;

    loop {
        let frame = {
            let mut reader = peer.reader().await;
            select! {
                _ = peer.closed().cancelled() => return Ok(()),
                frame = decoder.decode(&mut *reader) => frame?,
            }
        };

        match frame {
            Frame::Stream => {
                debug!(peer = %peer.remote_addr(), "incoming stream, waiting for release");
                peer.park_on_stream().await;
                debug!(peer = %peer.remote_addr(), "stream released, resuming read loop");
            }
            Frame::Message(payload) => {
                let rpc = Rpc {
                    from: peer.remote_addr(),
                    payload,
                };
                if shared.rpc_tx.send(rpc).await.is_err() {
                    debug!("inbound queue closed, stopping read loop");
                    return Ok(());
                }
            }
        }
    }
}

async fn close_quietly(peer: &Peer) {
    if let Err(err) = peer.close().await {
        if err.kind() != io::ErrorKind::NotConnected {
            debug!(peer = %peer.remote_addr(), error = ?err, "error while closing peer");
        }
    }
}
