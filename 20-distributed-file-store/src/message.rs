use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Control messages exchanged between file servers.
///
/// `StoreFile` and `FileFound` are always followed on the same connection by
/// a stream frame and exactly `size` raw body bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    StoreFile { key: String, size: u64 },
    GetFile { key: String },
    FileFound { key: String, size: u64 },
    FileNotFound { key: String },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn key(&self) -> &str {
        match self {
            Message::StoreFile { key, .. }
            | Message::GetFile { key }
            | Message::FileFound { key, .. }
            | Message::FileNotFound { key } => key,
        }
    }
}
