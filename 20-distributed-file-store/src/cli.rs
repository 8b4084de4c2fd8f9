use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::codec::{BincodeDecoder, Decoder, FramedDecoder, PeekDecoder};
use crate::crypto::EncryptionKey;
use crate::server::{
    DEFAULT_FETCH_TIMEOUT, DEFAULT_STREAM_TIMEOUT, FileServerConfig, generate_namespace,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a storage node and drive it from stdin.
    Node(NodeArgs),
    /// Print a fresh random encryption key as hex.
    Keygen,
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Address the node listens on for peers. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub listen: String,

    /// Directory that holds every namespace of stored files.
    #[arg(long, default_value = crate::store::DEFAULT_ROOT_DIR)]
    pub root: PathBuf,

    /// Namespace for this node's files. Random when omitted.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Comma-separated peer addresses to dial at startup.
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    /// Hex-encoded 32 byte key; file bodies are encrypted between nodes when set.
    #[arg(long)]
    pub encryption_key: Option<EncryptionKey>,

    /// Wire framing. Every node in a network must use the same one.
    #[arg(long, value_enum, default_value_t = Framing::Framed)]
    pub framing: Framing,

    #[arg(long, default_value_t = DEFAULT_STREAM_TIMEOUT.as_millis() as u64)]
    pub stream_timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_FETCH_TIMEOUT.as_millis() as u64)]
    pub fetch_timeout_ms: u64,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Tagged, length-prefixed frames.
    Framed,
    /// Length-prefixed bincode frames.
    Bincode,
    /// Sentinel stream marker, small length-flagged messages.
    Peek,
}

impl Framing {
    pub fn decoder(self) -> Arc<dyn Decoder> {
        match self {
            Framing::Framed => Arc::new(FramedDecoder::default()),
            Framing::Bincode => Arc::new(BincodeDecoder::default()),
            Framing::Peek => Arc::new(PeekDecoder),
        }
    }
}

impl NodeArgs {
    pub fn into_config(self) -> FileServerConfig {
        FileServerConfig {
            listen_addr: self.listen,
            namespace: self.namespace.unwrap_or_else(generate_namespace),
            storage_root: self.root,
            bootstrap_nodes: self.bootstrap,
            encryption_key: self.encryption_key,
            decoder: self.framing.decoder(),
            stream_timeout: Duration::from_millis(self.stream_timeout_ms),
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            ..FileServerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_args_map_onto_config() {
        let cli = Cli::parse_from([
            "dfs",
            "node",
            "--listen",
            "127.0.0.1:4000",
            "--namespace",
            "node-a",
            "--bootstrap",
            "127.0.0.1:3000,127.0.0.1:5000",
            "--fetch-timeout-ms",
            "250",
        ]);

        let Command::Node(args) = cli.command else {
            panic!("expected node subcommand");
        };
        let config = args.into_config();

        assert_eq!(config.listen_addr, "127.0.0.1:4000");
        assert_eq!(config.namespace, "node-a");
        assert_eq!(config.bootstrap_nodes, vec!["127.0.0.1:3000", "127.0.0.1:5000"]);
        assert_eq!(config.fetch_timeout, Duration::from_millis(250));
        assert!(config.encryption_key.is_none());
    }

    #[test]
    fn encryption_key_must_be_valid_hex() {
        let key = EncryptionKey::generate();
        let cli = Cli::try_parse_from(["dfs", "node", "--encryption-key", &key.to_hex()])
            .expect("valid key");
        let Command::Node(args) = cli.command else {
            panic!("expected node subcommand");
        };
        assert_eq!(args.encryption_key, Some(key));

        assert!(Cli::try_parse_from(["dfs", "node", "--encryption-key", "zz"]).is_err());
    }
}
