//! Content-addressed blob storage on the local filesystem.
//!
//! Blobs are addressed by `(namespace, key)`. The namespace is the first
//! directory under the storage root, which lets several nodes share one
//! process (and one root) during local testing. Below it, the configured
//! [`PathTransform`] decides where the key lives.
//!
//! The store does no locking of its own. Two writers racing on the same
//! `(namespace, key)` race at the filesystem level.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

use crate::crypto::{self, EncryptionKey};
use crate::path::{PathKey, PathTransform};

/// Root directory used when none is configured.
pub const DEFAULT_ROOT_DIR: &str = "network";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub path_transform: PathTransform,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT_DIR),
            path_transform: PathTransform::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    config: StoreConfig,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn path_key(&self, key: &str) -> PathKey {
        self.config.path_transform.apply(key)
    }

    fn namespace_root(&self, namespace: &str) -> PathBuf {
        self.config.root.join(namespace)
    }

    fn file_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_root(namespace)
            .join(self.path_key(key).full_path())
    }

    /// Persists everything `reader` yields under `(namespace, key)`,
    /// truncating any previous content. Returns the number of bytes written.
    pub async fn write<R>(&self, namespace: &str, key: &str, reader: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = self.create_file(namespace, key).await?;
        let written = tokio::io::copy(reader, &mut file).await?;
        file.flush().await?;

        debug!(namespace, key, bytes = written, "wrote blob to disk");
        Ok(written)
    }

    /// Like [`Store::write`], but `reader` yields an encrypted body which is
    /// decrypted on the way to disk. Returns the plaintext byte count.
    pub async fn write_decrypt<R>(
        &self,
        encryption_key: &EncryptionKey,
        namespace: &str,
        key: &str,
        reader: &mut R,
    ) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = self.create_file(namespace, key).await?;
        let written = crypto::copy_decrypt(encryption_key, reader, &mut file).await?;

        debug!(namespace, key, bytes = written, "wrote decrypted blob to disk");
        Ok(written)
    }

    async fn create_file(&self, namespace: &str, key: &str) -> io::Result<File> {
        let path = self.file_path(namespace, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        File::create(&path).await
    }

    /// Opens the blob for reading. The caller owns the returned handle.
    pub async fn read(&self, namespace: &str, key: &str) -> io::Result<(u64, File)> {
        let file = File::open(self.file_path(namespace, key)).await?;
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    pub async fn has(&self, namespace: &str, key: &str) -> bool {
        fs::metadata(self.file_path(namespace, key)).await.is_ok()
    }

    /// Removes the whole first-level shard directory that holds `key`, which
    /// also evicts any other key sharing that bucket. Keys without a shard
    /// path only lose their own file.
    pub async fn delete(&self, namespace: &str, key: &str) -> io::Result<()> {
        let path_key = self.path_key(key);
        let namespace_root = self.namespace_root(namespace);

        match path_key.first_segment() {
            Some(segment) => fs::remove_dir_all(namespace_root.join(segment)).await?,
            None => fs::remove_file(namespace_root.join(&path_key.filename)).await?,
        }

        debug!(namespace, key, filename = %path_key.filename, "deleted blob from disk");
        Ok(())
    }

    /// Removes the entire storage root. Teardown only.
    pub async fn clear(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.config.root).await {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
