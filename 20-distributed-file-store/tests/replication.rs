//! End-to-end tests running real file servers on localhost.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use distributed_file_store::{
    Error, FileServer, FileServerConfig, ServerState, cli::Framing, crypto::EncryptionKey,
};
use tempfile::TempDir;
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(25);

/// A running node plus the temp directory backing its store.
struct TestNode {
    server: Arc<FileServer>,
    task: JoinHandle<distributed_file_store::Result<()>>,
    _root: TempDir,
}

impl TestNode {
    async fn spawn(bootstrap: &[&TestNode], encryption_key: Option<EncryptionKey>) -> Result<Self> {
        Self::spawn_with(bootstrap, encryption_key, Framing::Framed).await
    }

    /// Starts a node on an ephemeral port that dials every node in `bootstrap`.
    ///
    /// # Parameters
    /// - `encryption_key`: shared key for bodies on the wire, if any
    /// - `framing`: wire framing; every node in one test must use the same one
    async fn spawn_with(
        bootstrap: &[&TestNode],
        encryption_key: Option<EncryptionKey>,
        framing: Framing,
    ) -> Result<Self> {
        let root = tempfile::tempdir()?;
        let bootstrap_nodes = bootstrap
            .iter()
            .filter_map(|node| node.server.local_addr())
            .map(|addr| addr.to_string())
            .collect();

        let server = Arc::new(FileServer::new(FileServerConfig {
            listen_addr: "127.0.0.1:0".into(),
            storage_root: root.path().to_path_buf(),
            bootstrap_nodes,
            encryption_key,
            decoder: framing.decoder(),
            fetch_timeout: Duration::from_secs(2),
            ..FileServerConfig::default()
        }));

        let runner = Arc::clone(&server);
        let task = tokio::spawn(async move { runner.start().await });

        let state = timeout(WAIT, server.wait_for_state(ServerState::Running)).await?;
        if state != ServerState::Running {
            bail!("node did not reach running state: {state:?}");
        }

        Ok(Self {
            server,
            task,
            _root: root,
        })
    }

    async fn read_local(&self, key: &str) -> Result<Vec<u8>> {
        let (size, mut file) = self.server.store().read(self.server.namespace(), key).await?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).await?;
        if size as usize != contents.len() {
            bail!("'{key}' is still being written");
        }
        Ok(contents)
    }

    async fn has_local(&self, key: &str) -> bool {
        self.server.store().has(self.server.namespace(), key).await
    }

    /// Waits until this node is connected to exactly `count` peers.
    async fn wait_for_peers(&self, count: usize) -> Result<()> {
        let start = Instant::now();
        while self.server.peers().len() != count {
            if start.elapsed() > WAIT {
                bail!("timeout waiting for {count} peers, have {:?}", self.server.peers());
            }
            sleep(POLL).await;
        }
        Ok(())
    }

    /// Waits until `key` is stored locally with exactly `expected` as content.
    async fn wait_for_file(&self, key: &str, expected: &[u8]) -> Result<()> {
        let start = Instant::now();
        loop {
            if let Ok(contents) = self.read_local(key).await {
                if contents == expected {
                    return Ok(());
                }
            }
            if start.elapsed() > WAIT {
                bail!("timeout waiting for replica of '{key}'");
            }
            sleep(POLL).await;
        }
    }

    fn addr(&self) -> Result<std::net::SocketAddr> {
        self.server.local_addr().context("node is not listening")
    }

    async fn shutdown(self) -> Result<()> {
        self.server.stop();
        timeout(WAIT, self.task).await???;
        assert_eq!(self.server.state(), ServerState::Stopped);
        Ok(())
    }
}

async fn connected_pair(encryption_key: Option<EncryptionKey>) -> Result<(TestNode, TestNode)> {
    connected_pair_with(encryption_key, Framing::Framed).await
}

async fn connected_pair_with(
    encryption_key: Option<EncryptionKey>,
    framing: Framing,
) -> Result<(TestNode, TestNode)> {
    let a = TestNode::spawn_with(&[], encryption_key.clone(), framing).await?;
    let b = TestNode::spawn_with(&[&a], encryption_key, framing).await?;
    a.wait_for_peers(1).await?;
    b.wait_for_peers(1).await?;
    Ok((a, b))
}

#[tokio::test]
async fn stored_file_is_replicated_to_peer() -> Result<()> {
    let (a, b) = connected_pair(None).await?;
    let payload = b"my big data file here!".to_vec();

    let written = a.server.store_file("momsPics", &mut payload.as_slice()).await?;
    assert_eq!(written as usize, payload.len());
    assert_eq!(a.read_local("momsPics").await?, payload);

    b.wait_for_file("momsPics", &payload).await?;

    a.shutdown().await?;
    b.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn store_without_peers_only_writes_locally() -> Result<()> {
    let node = TestNode::spawn(&[], None).await?;
    assert!(node.server.peers().is_empty());

    let written = node.server.store_file("solo", &mut &b"alone"[..]).await?;
    assert_eq!(written, 5);
    assert_eq!(node.read_local("solo").await?, b"alone");

    node.shutdown().await
}

#[tokio::test]
async fn missing_file_is_fetched_from_peer() -> Result<()> {
    let a = TestNode::spawn(&[], None).await?;
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    a.server.store_file("archive", &mut payload.as_slice()).await?;

    // b joins after the write, so it never received a replica.
    let b = TestNode::spawn(&[&a], None).await?;
    a.wait_for_peers(1).await?;
    b.wait_for_peers(1).await?;
    assert!(!b.has_local("archive").await);

    let (size, mut file) = b.server.get("archive").await?;
    let mut fetched = Vec::new();
    file.read_to_end(&mut fetched).await?;
    assert_eq!(size as usize, payload.len());
    assert_eq!(fetched, payload);
    assert!(b.has_local("archive").await);

    a.shutdown().await?;
    b.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn get_of_unknown_key_fails() -> Result<()> {
    let (a, b) = connected_pair(None).await?;

    let err = b.server.get("nobody-has-this").await.expect_err("key is missing");
    assert!(matches!(err, Error::NotFound(ref key) if key == "nobody-has-this"));

    let lonely = TestNode::spawn(&[], None).await?;
    let err = lonely.server.get("nobody-has-this").await.expect_err("no peers");
    assert!(matches!(err, Error::NotFound(_)));

    a.shutdown().await?;
    b.shutdown().await?;
    lonely.shutdown().await
}

#[tokio::test]
async fn encrypted_replicas_are_stored_as_plaintext() -> Result<()> {
    let (a, b) = connected_pair(Some(EncryptionKey::generate())).await?;
    let payload = b"only readable with the shared key".to_vec();

    a.server.store_file("secret", &mut payload.as_slice()).await?;
    b.wait_for_file("secret", &payload).await?;

    // The reverse direction goes through the fetch path.
    b.server.store_file("reply", &mut &b"ack"[..]).await?;
    a.wait_for_file("reply", b"ack").await?;
    a.server.delete_local("reply").await?;
    let (_, mut file) = a.server.get("reply").await?;
    let mut fetched = Vec::new();
    file.read_to_end(&mut fetched).await?;
    assert_eq!(fetched, b"ack");

    a.shutdown().await?;
    b.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn local_delete_leaves_peer_copies() -> Result<()> {
    let (a, b) = connected_pair(None).await?;

    a.server.store_file("shared", &mut &b"keep me"[..]).await?;
    b.wait_for_file("shared", b"keep me").await?;

    a.server.delete_local("shared").await?;
    assert!(!a.has_local("shared").await);
    assert!(b.has_local("shared").await);

    a.shutdown().await?;
    b.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn server_cannot_be_started_twice() -> Result<()> {
    let node = TestNode::spawn(&[], None).await?;
    assert!(matches!(node.server.start().await, Err(Error::AlreadyStarted)));
    node.shutdown().await
}

#[tokio::test]
async fn every_framing_replicates_and_fetches() -> Result<()> {
    for framing in [Framing::Framed, Framing::Bincode, Framing::Peek] {
        for encryption_key in [None, Some(EncryptionKey::generate())] {
            let encrypted = encryption_key.is_some();
            let (a, b) = connected_pair_with(encryption_key, framing).await?;

            a.server.store_file("momsPics", &mut &b"hello world"[..]).await?;
            b.wait_for_file("momsPics", b"hello world")
                .await
                .with_context(|| format!("replication over {framing:?}, encrypted: {encrypted}"))?;

            // Drop b's copy so the next read has to come back from a.
            b.server.delete_local("momsPics").await?;
            let (_, mut file) = b
                .server
                .get("momsPics")
                .await
                .with_context(|| format!("fetch over {framing:?}, encrypted: {encrypted}"))?;
            let mut fetched = Vec::new();
            file.read_to_end(&mut fetched).await?;
            assert_eq!(fetched, b"hello world", "{framing:?}");

            let err = b.server.get("nobody-has-this").await.expect_err("missing key");
            assert!(matches!(err, Error::NotFound(_)), "{framing:?}: {err}");

            a.shutdown().await?;
            b.shutdown().await?;
        }
    }
    Ok(())
}

#[tokio::test]
async fn disconnected_peer_leaves_the_peer_table() -> Result<()> {
    let node = TestNode::spawn(&[], None).await?;

    let client = TcpStream::connect(node.addr()?).await?;
    node.wait_for_peers(1).await?;
    assert_eq!(node.server.peers(), vec![client.local_addr()?]);

    drop(client);
    node.wait_for_peers(0).await?;

    node.shutdown().await
}

#[tokio::test]
async fn dead_peer_does_not_block_replication_to_others() -> Result<()> {
    let (a, b) = connected_pair(None).await?;

    let doomed = TcpStream::connect(a.addr()?).await?;
    // Never reads; stays connected for the whole test.
    let silent = TcpStream::connect(a.addr()?).await?;
    a.wait_for_peers(3).await?;

    drop(doomed);
    let written = a.server.store_file("fanout", &mut &b"still delivered"[..]).await?;
    assert_eq!(written, 15);
    b.wait_for_file("fanout", b"still delivered").await?;

    // A second round goes out after the dead peer has been dropped.
    a.wait_for_peers(2).await?;
    a.server.store_file("fanout-2", &mut &b"again"[..]).await?;
    b.wait_for_file("fanout-2", b"again").await?;

    drop(silent);
    a.shutdown().await?;
    b.shutdown().await?;
    Ok(())
}
