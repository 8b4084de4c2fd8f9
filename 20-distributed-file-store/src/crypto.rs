//! Streaming encryption for file bodies sent between nodes.
//!
//! Bodies are encrypted with ChaCha20. The sender writes a fresh random nonce
//! followed by the keystream-applied bytes, so the receiver can decrypt
//! without any extra negotiation.

use std::fmt;
use std::io;
use std::str::FromStr;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes of nonce that prefix every encrypted body.
pub const NONCE_LEN: usize = 12;

const KEY_LEN: usize = 32;
const CHUNK_SIZE: usize = 32 * 1024;

/// Symmetric key shared by every node that should read replicated bodies.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn cipher(&self, nonce: &[u8; NONCE_LEN]) -> ChaCha20 {
        ChaCha20::new(Key::from_slice(&self.0), Nonce::from_slice(nonce))
    }
}

impl FromStr for EncryptionKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(s.trim(), &mut bytes)?;
        Ok(Self(bytes))
    }
}

// Never print key material.
impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Encrypts `plaintext` in memory, returning `nonce || ciphertext`.
pub fn encrypt_to_vec(key: &EncryptionKey, plaintext: &[u8]) -> Vec<u8> {
    let nonce = random_nonce();
    let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(plaintext);
    key.cipher(&nonce).apply_keystream(&mut out[NONCE_LEN..]);
    out
}

/// Streams `src` into `dst` encrypted. Returns bytes written, nonce included.
pub async fn copy_encrypt<R, W>(key: &EncryptionKey, src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let nonce = random_nonce();
    dst.write_all(&nonce).await?;

    let written = copy_with_keystream(key.cipher(&nonce), src, dst).await?;
    Ok(written + NONCE_LEN as u64)
}

/// Streams an encrypted `src` into `dst` as plaintext. Returns plaintext bytes written.
pub async fn copy_decrypt<R, W>(key: &EncryptionKey, src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut nonce = [0u8; NONCE_LEN];
    src.read_exact(&mut nonce).await?;

    copy_with_keystream(key.cipher(&nonce), src, dst).await
}

async fn copy_with_keystream<R, W>(mut cipher: ChaCha20, src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    dst.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn streaming_decrypt_recovers_plaintext() {
        let key = EncryptionKey::generate();
        // Larger than one chunk so the keystream has to carry across reads.
        let plaintext: Vec<u8> = (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();

        let mut ciphertext = Vec::new();
        let written = copy_encrypt(&key, &mut plaintext.as_slice(), &mut ciphertext)
            .await
            .expect("encrypt");
        assert_eq!(written as usize, plaintext.len() + NONCE_LEN);
        assert_ne!(&ciphertext[NONCE_LEN..], plaintext.as_slice());

        let mut recovered = Vec::new();
        let read = copy_decrypt(&key, &mut ciphertext.as_slice(), &mut recovered)
            .await
            .expect("decrypt");
        assert_eq!(read as usize, plaintext.len());
        assert_eq!(recovered, plaintext);
    }

    #[tokio::test]
    async fn in_memory_encryption_matches_stream_format() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt_to_vec(&key, b"replicated body");

        let mut recovered = Vec::new();
        copy_decrypt(&key, &mut ciphertext.as_slice(), &mut recovered)
            .await
            .expect("decrypt");
        assert_eq!(recovered, b"replicated body");
    }

    #[tokio::test]
    async fn wrong_key_does_not_recover_plaintext() {
        let ciphertext = encrypt_to_vec(&EncryptionKey::generate(), b"secret bytes");

        let mut recovered = Vec::new();
        copy_decrypt(&EncryptionKey::generate(), &mut ciphertext.as_slice(), &mut recovered)
            .await
            .expect("decrypt");
        assert_ne!(recovered, b"secret bytes");
    }

    #[test]
    fn key_parses_from_hex() {
        let key = EncryptionKey::generate();
        let parsed: EncryptionKey = key.to_hex().parse().expect("valid hex");
        assert_eq!(parsed, key);
        assert!("abcd".parse::<EncryptionKey>().is_err());
        assert_eq!(format!("{key:?}"), "EncryptionKey(..)");
    }
}
