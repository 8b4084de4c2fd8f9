//! Wire framing between connected nodes.
//!
//! A connection carries two kinds of units: message frames holding an encoded
//! control message, and stream markers announcing that raw body bytes follow.
//! A [`Decoder`] turns the incoming byte stream into [`Frame`]s and produces
//! the outbound bytes for the same framing, so both ends of a connection must
//! use the same strategy.

use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Tag byte preceding a length-prefixed message frame.
pub const MESSAGE_TAG: u8 = 0x1;
/// Tag byte announcing a raw stream. Doubles as the [`PeekDecoder`] sentinel.
pub const STREAM_TAG: u8 = 0x2;

/// Largest payload accepted in one message frame by default.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Largest payload a [`PeekDecoder`] message may carry.
pub const PEEK_BUFFER_LEN: usize = 1028;

/// One decoded unit read from a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Message(Vec<u8>),
    /// Raw body bytes follow and must be read straight off the connection.
    Stream,
}

pub type DynReader<'a> = dyn AsyncRead + Send + Unpin + 'a;

#[async_trait]
pub trait Decoder: Send + Sync {
    /// Reads exactly one frame. End of input surfaces as `UnexpectedEof`.
    async fn decode(&self, reader: &mut DynReader<'_>) -> io::Result<Frame>;

    /// Bytes announcing a message frame carrying `payload`.
    fn encode_message(&self, payload: &[u8]) -> io::Result<Vec<u8>>;

    /// Bytes announcing that a raw stream follows.
    fn encode_stream(&self) -> io::Result<Vec<u8>>;
}

/// Tagged, length-prefixed framing: `0x01 | u32 BE len | payload` or `0x02`.
#[derive(Debug, Clone)]
pub struct FramedDecoder {
    max_frame_len: usize,
}

impl FramedDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FramedDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

#[async_trait]
impl Decoder for FramedDecoder {
    async fn decode(&self, reader: &mut DynReader<'_>) -> io::Result<Frame> {
        match reader.read_u8().await? {
            STREAM_TAG => Ok(Frame::Stream),
            MESSAGE_TAG => {
                let payload = read_length_prefixed(reader, self.max_frame_len).await?;
                Ok(Frame::Message(payload))
            }
            other => Err(invalid_data(format!("unknown frame tag {other:#04x}"))),
        }
    }

    fn encode_message(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let len = checked_len(payload.len(), self.max_frame_len)?;
        let mut out = Vec::with_capacity(1 + 4 + payload.len());
        out.push(MESSAGE_TAG);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }

    fn encode_stream(&self) -> io::Result<Vec<u8>> {
        Ok(vec![STREAM_TAG])
    }
}

/// Sentinel framing: the first byte of every unit is peeked, and the
/// sentinel on its own means "stream".
///
/// Any other unit is a message whose first two bytes carry the payload
/// length with the high bit of the first byte set, so a message header can
/// never equal the sentinel and payloads may start with any byte. Messages
/// are bounded by [`PEEK_BUFFER_LEN`] and read exactly, never merged with
/// the bytes that follow them.
#[derive(Debug, Clone, Default)]
pub struct PeekDecoder;

impl PeekDecoder {
    const LENGTH_FLAG: u8 = 0x80;
}

#[async_trait]
impl Decoder for PeekDecoder {
    async fn decode(&self, reader: &mut DynReader<'_>) -> io::Result<Frame> {
        let first = reader.read_u8().await?;
        if first == STREAM_TAG {
            return Ok(Frame::Stream);
        }
        if first & Self::LENGTH_FLAG == 0 {
            return Err(invalid_data(format!("unknown peek header {first:#04x}")));
        }

        let low = reader.read_u8().await?;
        let len = (usize::from(first & !Self::LENGTH_FLAG) << 8) | usize::from(low);
        if len > PEEK_BUFFER_LEN {
            return Err(invalid_data(format!(
                "frame of {len} bytes exceeds the {PEEK_BUFFER_LEN} byte read buffer"
            )));
        }

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(Frame::Message(buf))
    }

    fn encode_message(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let len = payload.len();
        if len > PEEK_BUFFER_LEN {
            return Err(invalid_input(format!(
                "payload of {len} bytes exceeds the {PEEK_BUFFER_LEN} byte read buffer"
            )));
        }

        let mut out = Vec::with_capacity(2 + len);
        out.push(Self::LENGTH_FLAG | (len >> 8) as u8);
        out.push((len & 0xff) as u8);
        out.extend_from_slice(payload);
        Ok(out)
    }

    fn encode_stream(&self) -> io::Result<Vec<u8>> {
        Ok(vec![STREAM_TAG])
    }
}

/// Structured framing: a u32 BE length followed by a bincode encoded
/// [`Frame`]. The stream marker is a typed variant rather than a sentinel.
#[derive(Debug, Clone)]
pub struct BincodeDecoder {
    max_frame_len: usize,
}

impl BincodeDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    fn encode_frame(&self, frame: &Frame) -> io::Result<Vec<u8>> {
        let body = bincode::serialize(frame).map_err(to_io_error)?;
        let len = checked_len(body.len(), self.max_frame_len)?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

impl Default for BincodeDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

#[async_trait]
impl Decoder for BincodeDecoder {
    async fn decode(&self, reader: &mut DynReader<'_>) -> io::Result<Frame> {
        let body = read_length_prefixed(reader, self.max_frame_len).await?;
        bincode::deserialize(&body).map_err(to_io_error)
    }

    fn encode_message(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        self.encode_frame(&Frame::Message(payload.to_vec()))
    }

    fn encode_stream(&self) -> io::Result<Vec<u8>> {
        self.encode_frame(&Frame::Stream)
    }
}

async fn read_length_prefixed(reader: &mut DynReader<'_>, max_len: usize) -> io::Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    if len > max_len {
        return Err(invalid_data(format!(
            "frame of {len} bytes exceeds limit of {max_len}"
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

fn checked_len(len: usize, max_len: usize) -> io::Result<u32> {
    if len > max_len {
        return Err(invalid_input(format!(
            "frame of {len} bytes exceeds limit of {max_len}"
        )));
    }
    u32::try_from(len).map_err(|_| invalid_input("frame length does not fit in u32"))
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn invalid_input(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.into())
}

fn to_io_error(err: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
