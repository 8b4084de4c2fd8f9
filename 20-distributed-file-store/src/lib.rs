//! Peer-to-peer file storage over a custom TCP protocol.
//!
//! Each node keeps files on local disk under a content-addressed layout and
//! pushes every file it stores to the peers it is connected to. Modules, from
//! the bottom up:
//!
//! - [`path`] maps keys to sharded on-disk paths.
//! - [`store`] reads and writes blobs under `(namespace, key)`.
//! - [`crypto`] encrypts file bodies travelling between nodes.
//! - [`codec`] frames bytes on the wire; [`message`] is the control envelope
//!   carried inside those frames.
//! - [`peer`], [`handshake`] and [`transport`] turn sockets into a single
//!   queue of decoded messages, with a side channel for raw file bodies.
//! - [`server`] runs the dispatcher loop and the replication protocol.
//! - [`cli`], [`console`] and [`shell`] drive a node from the command line.
//!
//! There is no consensus here. Replication is best effort and two nodes can
//! hold different bytes for the same key.

pub mod cli;
pub mod codec;
pub mod console;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod message;
pub mod path;
pub mod peer;
pub mod server;
pub mod shell;
pub mod store;
pub mod transport;

pub use error::{Error, Result};
pub use server::{FileServer, FileServerConfig, ServerState};
