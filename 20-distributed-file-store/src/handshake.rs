use async_trait::async_trait;

use crate::peer::Peer;

/// Runs once per connection before any message is decoded. An error drops
/// the connection.
#[async_trait]
pub trait Handshake: Send + Sync {
    async fn handshake(&self, peer: &Peer) -> anyhow::Result<()>;
}

/// Accepts every connection without exchanging any bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHandshake;

#[async_trait]
impl Handshake for NoHandshake {
    async fn handshake(&self, _peer: &Peer) -> anyhow::Result<()> {
        Ok(())
    }
}
