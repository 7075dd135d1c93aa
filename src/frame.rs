//! # Frames: Envelope, Codecs, and Framing
//!
//! Everything that crosses a [`TransportChannel`](crate::channel::TransportChannel)
//! is a [`Frame`]. The bootstrap core only relies on two properties of a frame:
//! its optional correlation id and its kind. The payload is opaque bytes whose
//! meaning belongs to the layer that produced it (text commands, handshake
//! records, push messages).
//!
//! ## Wire layout
//!
//! ```text
//! +----------------+-------------------------------+
//! | len: u32 (BE)  | frame encoded with FrameCodec |
//! +----------------+-------------------------------+
//! ```
//!
//! Three codecs are supported, the same trio MerkleKV uses for change events:
//! JSON (readable), CBOR (compact, self-describing) and Bincode (smallest,
//! not self-describing). Both ends must agree on the codec.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Frames larger than this are rejected on both read and write
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Version carried in the handshake record
pub const PROTOCOL_VERSION: u16 = 1;

/// What a frame is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Connection establishment request (client → server)
    Handshake,
    /// Command request (client → server)
    Request,
    /// Successful reply, echoes the request id
    Response,
    /// Failed reply, echoes the request id; payload is the error text
    Error,
    /// Server-initiated message with no id
    Push,
}

/// Envelope exchanged over a transport channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Correlation id; `None` for push frames
    pub id: Option<u64>,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(id: Option<u64>, kind: FrameKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            kind,
            payload: payload.into(),
        }
    }

    pub fn handshake(id: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Some(id), FrameKind::Handshake, payload)
    }

    pub fn request(id: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Some(id), FrameKind::Request, payload)
    }

    pub fn response(id: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Some(id), FrameKind::Response, payload)
    }

    pub fn error(id: u64, message: &str) -> Self {
        Self::new(Some(id), FrameKind::Error, message.as_bytes())
    }

    pub fn push(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(None, FrameKind::Push, payload)
    }

    /// Payload interpreted as UTF-8 text
    pub fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| Error::invalid_response(format!("payload is not UTF-8: {}", e)))
    }
}

/// Serialization used for frames and structured payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameCodec {
    #[default]
    Json,
    Cbor,
    Bincode,
}

impl FrameCodec {
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            FrameCodec::Json => serde_json::to_vec(value).map_err(|e| Error::codec(e.to_string())),
            FrameCodec::Cbor => serde_cbor::to_vec(value).map_err(|e| Error::codec(e.to_string())),
            FrameCodec::Bincode => {
                bincode::serialize(value).map_err(|e| Error::codec(e.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            FrameCodec::Json => {
                serde_json::from_slice(bytes).map_err(|e| Error::codec(e.to_string()))
            }
            FrameCodec::Cbor => {
                serde_cbor::from_slice(bytes).map_err(|e| Error::codec(e.to_string()))
            }
            FrameCodec::Bincode => {
                bincode::deserialize(bytes).map_err(|e| Error::codec(e.to_string()))
            }
        }
    }
}

/// Record sent in the payload of a handshake frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u16,
    /// Per-connection identifier (UUID v4)
    pub client_id: String,
    pub client_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database_id: u32,
    /// Channels to subscribe to once the connection is ready
    pub channels: Vec<String>,
    /// Channel patterns to subscribe to once the connection is ready
    pub patterns: Vec<String>,
}

/// Record carried in the payload of a push frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions
    pub pattern: Option<String>,
    pub message: Vec<u8>,
}

impl PushMessage {
    pub fn new(channel: impl Into<String>, message: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            pattern: None,
            message: message.into(),
        }
    }

    /// Message body as text, replacing invalid UTF-8
    pub fn message_lossy(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }
}

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W>(writer: &mut W, codec: FrameCodec, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = codec.encode(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::codec(format!(
            "frame of {} bytes exceeds limit of {}",
            body.len(),
            MAX_FRAME_LEN
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the stream between frames. A
/// stream that ends part way through the length prefix is a `Codec` error.
pub async fn read_frame<R>(reader: &mut R, codec: FrameCodec) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::codec(format!(
                "stream ended inside a frame header ({} of {} bytes)",
                filled,
                header.len()
            )));
        }
        filled += n;
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::codec(format!(
            "incoming frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    codec.decode(&body).map(Some)
}
