//! The file server: owns the peer table, runs the single dispatcher loop and
//! implements replication on top of the transport and the local store.
//!
//! Every inbound message is handled on one task, in arrival order per
//! connection. The peer table is the only state touched from several tasks
//! (the transport's admission and disconnect hooks run on connection tasks)
//! and its lock is never held across network I/O.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf},
    select,
    sync::{broadcast, mpsc, watch},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Decoder, FramedDecoder};
use crate::crypto::{self, EncryptionKey, NONCE_LEN};
use crate::error::{Error, Result};
use crate::handshake::{Handshake, NoHandshake};
use crate::message::Message;
use crate::path::PathTransform;
use crate::peer::Peer;
use crate::store::{DEFAULT_ROOT_DIR, Store, StoreConfig};
use crate::transport::{
    DEFAULT_QUEUE_CAPACITY, OnDisconnect, OnPeer, Rpc, TcpTransport, TransportConfig,
};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct FileServerConfig {
    pub listen_addr: String,
    /// Namespace under the storage root that holds this node's files.
    pub namespace: String,
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    /// Addresses dialed once at startup. Empty entries are skipped.
    pub bootstrap_nodes: Vec<String>,
    /// When set, file bodies travel encrypted between nodes.
    pub encryption_key: Option<EncryptionKey>,
    pub handshake: Arc<dyn Handshake>,
    pub decoder: Arc<dyn Decoder>,
    pub queue_capacity: usize,
    /// Upper bound for receiving one file body from a peer.
    pub stream_timeout: Duration,
    /// Upper bound for a fetch-on-miss round trip.
    pub fetch_timeout: Duration,
}

impl Default for FileServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            namespace: generate_namespace(),
            storage_root: PathBuf::from(DEFAULT_ROOT_DIR),
            path_transform: PathTransform::default(),
            bootstrap_nodes: Vec::new(),
            encryption_key: None,
            handshake: Arc::new(NoHandshake),
            decoder: Arc::new(FramedDecoder::default()),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

impl fmt::Debug for FileServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("namespace", &self.namespace)
            .field("storage_root", &self.storage_root)
            .field("path_transform", &self.path_transform)
            .field("bootstrap_nodes", &self.bootstrap_nodes)
            .field("encrypted", &self.encryption_key.is_some())
            .field("queue_capacity", &self.queue_capacity)
            .field("stream_timeout", &self.stream_timeout)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

/// Random 32 byte hex identifier, used as a namespace when none is given.
pub fn generate_namespace() -> String {
    let mut id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);
    hex::encode(id)
}

/// Lifecycle of a [`FileServer`]. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Idle,
    Listening,
    Bootstrapping,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FetchEvent {
    Found(String),
    Missing(String),
}

pub struct FileServer {
    config: FileServerConfig,
    store: Store,
    transport: TcpTransport,
    peers: Arc<PeerTable>,
    outbound: Outbound,
    state: watch::Sender<ServerState>,
    shutdown: CancellationToken,
    fetches: broadcast::Sender<FetchEvent>,
}

impl FileServer {
    pub fn new(config: FileServerConfig) -> Self {
        let store = Store::new(StoreConfig {
            root: config.storage_root.clone(),
            path_transform: config.path_transform,
        });

        let peers = Arc::new(PeerTable::default());
        let transport = TcpTransport::new(TransportConfig {
            listen_addr: config.listen_addr.clone(),
            handshake: Arc::clone(&config.handshake),
            decoder: Arc::clone(&config.decoder),
            queue_capacity: config.queue_capacity,
            on_peer: Some(admission_hook(&peers)),
            on_disconnect: Some(disconnect_hook(&peers)),
        });

        let outbound = Outbound {
            decoder: Arc::clone(&config.decoder),
            encryption_key: config.encryption_key.clone(),
        };

        let (state, _) = watch::channel(ServerState::Idle);
        // Fetches only care about replies that land while they wait.
        let (fetches, _) = broadcast::channel(128);

        Self {
            config,
            store,
            transport,
            peers,
            outbound,
            state,
            shutdown: CancellationToken::new(),
            fetches,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Remote addresses of every currently connected peer.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.peers.addrs()
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Resolves once the server has reached `target` or any later state.
    pub async fn wait_for_state(&self, target: ServerState) -> ServerState {
        let mut rx = self.state.subscribe();
        let reached = match rx.wait_for(|state| *state >= target).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        reached
    }

    fn set_state(&self, state: ServerState) {
        debug!(?state, "file server state change");
        self.state.send_replace(state);
    }

    /// Listens, dials the bootstrap nodes and then runs the message loop
    /// until [`FileServer::stop`] is called. Only a bind failure is fatal.
    pub async fn start(&self) -> Result<()> {
        let Some(rpc_rx) = self.transport.consume() else {
            return Err(Error::AlreadyStarted);
        };

        let addr = self.transport.listen_and_accept().await?;
        self.set_state(ServerState::Listening);
        info!(%addr, namespace = %self.config.namespace, "file server listening");

        self.set_state(ServerState::Bootstrapping);
        self.bootstrap_network().await;

        self.set_state(ServerState::Running);
        self.run_loop(rpc_rx).await;

        Ok(())
    }

    /// Signals the message loop to exit. Safe to call any number of times.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn bootstrap_network(&self) {
        let dials = self
            .config
            .bootstrap_nodes
            .iter()
            .filter(|addr| !addr.trim().is_empty())
            .map(|addr| async move {
                debug!(%addr, "dialing bootstrap node");
                if let Err(err) = self.transport.dial(addr.as_str()).await {
                    warn!(%addr, error = ?err, "failed to dial bootstrap node");
                }
            });

        join_all(dials).await;
    }

    async fn run_loop(&self, mut rpc_rx: mpsc::Receiver<Rpc>) {
        loop {
            select! {
                _ = self.shutdown.cancelled() => break,
                rpc = rpc_rx.recv() => match rpc {
                    Some(rpc) => {
                        let from = rpc.from;
                        if let Err(err) = self.handle_rpc(rpc).await {
                            warn!(peer = %from, error = %err, "failed to handle message");
                        }
                    }
                    None => break,
                }
            }
        }

        self.transport.close();
        self.set_state(ServerState::Stopped);
        info!(namespace = %self.config.namespace, "file server stopped");
    }

    async fn handle_rpc(&self, rpc: Rpc) -> Result<()> {
        let message = match Message::decode(&rpc.payload) {
            Ok(message) => message,
            Err(err) => {
                // The connection is out of sync with us; nothing after this is trustworthy.
                self.drop_peer(rpc.from).await;
                return Err(err);
            }
        };
        debug!(peer = %rpc.from, ?message, "received message");

        match message {
            Message::StoreFile { key, size } => {
                let written = self.receive_body(rpc.from, &key, size).await?;
                info!(peer = %rpc.from, key = %key, bytes = written, "stored replicated file");
            }
            Message::GetFile { key } => self.serve_file(rpc.from, key)?,
            Message::FileFound { key, size } => {
                let result = self.receive_body(rpc.from, &key, size).await;
                let event = match &result {
                    Ok(_) => FetchEvent::Found(key),
                    Err(_) => FetchEvent::Missing(key),
                };
                // No subscriber just means nobody is waiting on this key.
                let _ = self.fetches.send(event);
                result?;
            }
            Message::FileNotFound { key } => {
                debug!(peer = %rpc.from, key = %key, "peer does not have file");
                let _ = self.fetches.send(FetchEvent::Missing(key));
            }
        }

        Ok(())
    }

    /// Reads exactly `size` body bytes from the sender's stream into the
    /// local store, then lets the sender's connection resume.
    async fn receive_body(&self, from: SocketAddr, key: &str, size: u64) -> Result<u64> {
        let peer = self.peers.get(&from).ok_or(Error::PeerNotFound(from))?;
        let limit = self.config.stream_timeout;

        match timeout(limit, self.drain_stream(&peer, key, size)).await {
            Ok(Ok(written)) => {
                peer.release_stream();
                Ok(written)
            }
            Ok(Err(err)) => {
                close_peer(&peer).await;
                Err(err)
            }
            Err(_) => {
                close_peer(&peer).await;
                Err(Error::StreamTimeout {
                    peer: from,
                    timeout: limit,
                })
            }
        }
    }

    async fn drain_stream(&self, peer: &Peer, key: &str, size: u64) -> Result<u64> {
        let namespace = &self.config.namespace;
        let mut reader = peer.open_stream().await?;
        let mut body = (&mut *reader).take(size);

        let written = match &self.config.encryption_key {
            Some(encryption_key) => {
                self.store
                    .write_decrypt(encryption_key, namespace, key, &mut body)
                    .await?
            }
            None => self.store.write(namespace, key, &mut body).await?,
        };

        let missing = body.limit();
        if missing > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended {missing} bytes short of {size}"),
            )
            .into());
        }

        Ok(written)
    }

    /// Replies to a `GetFile` on its own task so a slow requester never
    /// holds up the message loop.
    fn serve_file(&self, from: SocketAddr, key: String) -> Result<()> {
        let peer = self.peers.get(&from).ok_or(Error::PeerNotFound(from))?;
        let store = self.store.clone();
        let namespace = self.config.namespace.clone();
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            if let Err(err) = outbound.reply_with_file(&peer, &store, &namespace, &key).await {
                warn!(peer = %peer.remote_addr(), key = %key, error = %err, "failed to serve file");
            }
        });

        Ok(())
    }

    async fn drop_peer(&self, addr: SocketAddr) {
        if let Some(peer) = self.peers.get(&addr) {
            close_peer(&peer).await;
        }
    }

    /// Persists `reader` locally, then replicates the same bytes to every
    /// connected peer. Returns the number of bytes stored locally.
    ///
    /// Replication is best effort: a peer that fails to receive the file is
    /// logged and skipped without affecting the others.
    pub async fn store_file<R>(&self, key: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buffer = Vec::new();
        let written = {
            let mut tee = TeeReader::new(reader, &mut buffer);
            self.store
                .write(&self.config.namespace, key, &mut tee)
                .await?
        };

        let peers = self.peers.snapshot();
        if peers.is_empty() {
            debug!(key, bytes = written, "stored file, no peers to replicate to");
            return Ok(written);
        }

        let body = match &self.config.encryption_key {
            Some(encryption_key) => crypto::encrypt_to_vec(encryption_key, &buffer),
            None => buffer,
        };

        let sends = peers
            .iter()
            .map(|peer| self.outbound.send_file(peer, key, &body));
        let results = join_all(sends).await;

        let mut replicated = 0;
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(()) => replicated += 1,
                Err(err) => {
                    warn!(peer = %peer.remote_addr(), key, error = %err, "failed to replicate file")
                }
            }
        }

        info!(key, bytes = written, replicated, peers = peers.len(), "stored file");
        Ok(written)
    }

    /// Opens `key` from the local store, fetching it from the network first
    /// when this node does not have it.
    pub async fn get(&self, key: &str) -> Result<(u64, File)> {
        let namespace = &self.config.namespace;
        if self.store.has(namespace, key).await {
            debug!(key, "serving file from local disk");
            return Ok(self.store.read(namespace, key).await?);
        }

        info!(key, "file not found locally, fetching from network");
        let peers = self.peers.snapshot();
        let mut events = self.fetches.subscribe();

        let request = Message::GetFile {
            key: key.to_string(),
        };
        let results = join_all(
            peers
                .iter()
                .map(|peer| self.outbound.send_message(peer, &request)),
        )
        .await;

        let mut asked = 0;
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(()) => asked += 1,
                Err(err) => {
                    warn!(peer = %peer.remote_addr(), key, error = %err, "failed to request file")
                }
            }
        }
        if asked == 0 {
            return Err(Error::NotFound(key.to_string()));
        }

        let limit = self.config.fetch_timeout;
        match timeout(limit, self.await_fetch(key, asked, &mut events)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::FetchTimeout {
                    key: key.to_string(),
                    timeout: limit,
                });
            }
        }

        Ok(self.store.read(namespace, key).await?)
    }

    async fn await_fetch(
        &self,
        key: &str,
        asked: usize,
        events: &mut broadcast::Receiver<FetchEvent>,
    ) -> Result<()> {
        let mut missing = 0;

        loop {
            match events.recv().await {
                Ok(FetchEvent::Found(found)) if found == key => return Ok(()),
                Ok(FetchEvent::Missing(absent)) if absent == key => {
                    missing += 1;
                    if missing >= asked {
                        return Err(Error::NotFound(key.to_string()));
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(key, skipped, "fetch fell behind on replies");
                    if self.store.has(&self.config.namespace, key).await {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::NotFound(key.to_string()));
                }
            }
        }
    }

    /// Removes `key` from this node's namespace only. Peers keep their copies.
    pub async fn delete_local(&self, key: &str) -> Result<()> {
        self.store.delete(&self.config.namespace, key).await?;
        Ok(())
    }
}

fn admission_hook(peers: &Arc<PeerTable>) -> OnPeer {
    let peers = Arc::clone(peers);
    Arc::new(move |peer: Arc<Peer>| -> anyhow::Result<()> {
        debug!(peer = %peer.remote_addr(), outbound = peer.is_outbound(), "admitting peer");
        peers.admit(peer);
        Ok(())
    })
}

fn disconnect_hook(peers: &Arc<PeerTable>) -> OnDisconnect {
    let peers = Arc::clone(peers);
    Arc::new(move |peer: &Arc<Peer>| {
        if peers.remove(peer) {
            info!(peer = %peer.remote_addr(), "peer disconnected");
        }
    })
}

async fn close_peer(peer: &Peer) {
    if let Err(err) = peer.close().await {
        debug!(peer = %peer.remote_addr(), error = ?err, "error while closing peer");
    }
}

/// Connected peers keyed by remote address.
#[derive(Default)]
struct PeerTable {
    peers: Mutex<HashMap<String, Arc<Peer>>>,
}

impl PeerTable {
    /// Inserts `peer`, replacing any entry with the same address.
    fn admit(&self, peer: Arc<Peer>) {
        let key = peer.remote_addr().to_string();
        self.peers.lock().insert(key, peer);
    }

    /// Removes `peer` unless its address has since been taken by a newer
    /// connection. Returns whether an entry was removed.
    fn remove(&self, peer: &Arc<Peer>) -> bool {
        let key = peer.remote_addr().to_string();
        let mut peers = self.peers.lock();
        match peers.get(&key) {
            Some(existing) if Arc::ptr_eq(existing, peer) => {
                peers.remove(&key);
                true
            }
            _ => false,
        }
    }

    fn get(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        self.peers.lock().get(&addr.to_string()).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    fn addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<_> = self
            .peers
            .lock()
            .values()
            .map(|peer| peer.remote_addr())
            .collect();
        addrs.sort_unstable();
        addrs
    }
}

/// Builds and writes outbound frames. Cheap to clone into reply tasks.
#[derive(Clone)]
struct Outbound {
    decoder: Arc<dyn Decoder>,
    encryption_key: Option<EncryptionKey>,
}

impl Outbound {
    fn message_frame(&self, message: &Message) -> Result<Vec<u8>> {
        Ok(self.decoder.encode_message(&message.encode()?)?)
    }

    /// Message frame immediately followed by the stream marker.
    fn stream_header(&self, message: &Message) -> Result<Vec<u8>> {
        let mut header = self.message_frame(message)?;
        header.extend(self.decoder.encode_stream()?);
        Ok(header)
    }

    fn wire_size(&self, plaintext_len: u64) -> u64 {
        match self.encryption_key {
            Some(_) => plaintext_len + NONCE_LEN as u64,
            None => plaintext_len,
        }
    }

    async fn send_message(&self, peer: &Peer, message: &Message) -> Result<()> {
        let frame = self.message_frame(message)?;
        peer.send(&frame).await?;
        Ok(())
    }

    /// `body` is sent as-is; callers encrypt it beforehand when needed.
    async fn send_file(&self, peer: &Peer, key: &str, body: &[u8]) -> Result<()> {
        let header = self.stream_header(&Message::StoreFile {
            key: key.to_string(),
            size: body.len() as u64,
        })?;

        let mut writer = peer.writer().await;
        writer.write_all(&header).await?;
        writer.write_all(body).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn reply_with_file(
        &self,
        peer: &Peer,
        store: &Store,
        namespace: &str,
        key: &str,
    ) -> Result<()> {
        let not_found = Message::FileNotFound {
            key: key.to_string(),
        };
        let (size, file) = match store.read(namespace, key).await {
            Ok(found) => found,
            Err(err) => {
                self.send_message(peer, &not_found).await?;
                return match err.kind() {
                    io::ErrorKind::NotFound => Ok(()),
                    _ => Err(err.into()),
                };
            }
        };

        // The requester must always get an answer, even one we cannot frame.
        let header = match self.stream_header(&Message::FileFound {
            key: key.to_string(),
            size: self.wire_size(size),
        }) {
            Ok(header) => header,
            Err(err) => {
                self.send_message(peer, &not_found).await?;
                return Err(err);
            }
        };

        // Cap the body at the announced size in case the file grows meanwhile.
        let mut body = file.take(size);
        let mut writer = peer.writer().await;
        writer.write_all(&header).await?;
        match &self.encryption_key {
            Some(encryption_key) => {
                crypto::copy_encrypt(encryption_key, &mut body, &mut *writer).await?;
            }
            None => {
                tokio::io::copy(&mut body, &mut *writer).await?;
            }
        }
        writer.flush().await?;

        debug!(peer = %peer.remote_addr(), key, bytes = size, "served file to peer");
        Ok(())
    }
}

/// Copies everything read through it into a side buffer.
struct TeeReader<'a, R: ?Sized> {
    inner: &'a mut R,
    copy: &'a mut Vec<u8>,
}

impl<'a, R: ?Sized> TeeReader<'a, R> {
    fn new(inner: &'a mut R, copy: &'a mut Vec<u8>) -> Self {
        Self { inner, copy }
    }
}

impl<R> AsyncRead for TeeReader<'_, R>
where
    R: AsyncRead + Unpin + ?Sized,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut *this.inner).poll_read(cx, buf))?;
        this.copy.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}
