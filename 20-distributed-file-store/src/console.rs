//! Command parsing for the interactive node shell.
//!
//! Lines typed on stdin are parsed into [`ConsoleCommand`]s. Only `PUT`
//! reaches other nodes; `GET` may fetch from them on a local miss, and the
//! rest are local.
//!
//! This is separate from [`crate::message::Message`] because:
//! - `ConsoleCommand` is the operator interface, including local-only commands
//!   like `PEERS` and `EXIT`
//! - `Message` is what actually travels between nodes, and carries sizes and
//!   stream bodies the operator never types

use std::path::PathBuf;

use anyhow::{Result, anyhow};

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    /// Store the file at `path` under `key` and replicate it.
    Put { key: String, path: PathBuf },
    /// Read `key`, optionally copying it to `output` instead of stdout.
    Get { key: String, output: Option<PathBuf> },
    Delete { key: String },
    Peers,
    Help,
    Exit,
}

pub const HELP: &[&str] = &[
    "Commands (case-insensitive):",
    "  PUT <key> <path>        (alias: p)  -- store a file and replicate it",
    "  GET <key> [out-path]    (alias: g)  -- read a file, fetching from peers on a miss",
    "  DEL <key>               (alias: d)  -- delete a file from this node only",
    "  PEERS                   (alias: l)  -- list connected peers",
    "  HELP                    (alias: h)  -- show this message",
    "  EXIT                    (alias: e)  -- stop the node",
];

impl ConsoleCommand {
    /// Parses one line of shell input.
    ///
    /// # Parameters
    /// - `line`: raw input from stdin, trailing newline included or not
    ///
    /// # Syntax
    /// Keywords are case-insensitive and have single-letter aliases. Keys and
    /// paths are taken verbatim, so they cannot contain whitespace.
    /// - `PUT <key> <path>` (alias: `p`) - Store a file and replicate it
    /// - `GET <key> [out-path]` (alias: `g`) - Print a file or copy it to `out-path`
    /// - `DEL <key>` (aliases: `d`, `DELETE`) - Delete from this node only
    /// - `PEERS` (alias: `l`) - List connected peers
    /// - `HELP` (alias: `h`) - Print command reference
    /// - `EXIT` (aliases: `e`, `QUIT`) - Stop the node
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "P" => "PUT",
            "G" => "GET",
            "D" | "DELETE" => "DEL",
            "L" => "PEERS",
            "H" => "HELP",
            "E" | "QUIT" => "EXIT",
            other => other,
        };

        match (normalized_cmd, parts.len()) {
            ("EXIT", 1) => Ok(ConsoleCommand::Exit),
            ("HELP", 1) => Ok(ConsoleCommand::Help),
            ("PEERS", 1) => Ok(ConsoleCommand::Peers),
            ("PUT", 3) => Ok(ConsoleCommand::Put {
                key: parts[1].to_string(),
                path: PathBuf::from(parts[2]),
            }),
            ("GET", 2) => Ok(ConsoleCommand::Get {
                key: parts[1].to_string(),
                output: None,
            }),
            ("GET", 3) => Ok(ConsoleCommand::Get {
                key: parts[1].to_string(),
                output: Some(PathBuf::from(parts[2])),
            }),
            ("DEL", 2) => Ok(ConsoleCommand::Delete {
                key: parts[1].to_string(),
            }),
            ("EXIT" | "HELP" | "PEERS", _) => {
                Err(anyhow!("{normalized_cmd} takes no arguments"))
            }
            ("PUT", _) => Err(anyhow!("PUT requires exactly two arguments: PUT <key> <path>")),
            ("GET", _) => Err(anyhow!("GET requires a key: GET <key> [out-path]")),
            ("DEL", _) => Err(anyhow!("DEL requires exactly one argument: DEL <key>")),
            _ => Err(anyhow!(
                "invalid command. Try: PUT/p <key> <path>, GET/g <key>, DEL/d <key>, PEERS/l, HELP/h, EXIT/e"
            )),
        }
    }
}
