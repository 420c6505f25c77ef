//! Wire protocol - length-prefixed binary request/response frames
//!
//! Frame layout (little endian):
//!
//! ```text
//! size: u32 | kind: u8 | uid: u64 | key_len: u32 | key | [data_len: u32 | data]
//! ```
//!
//! `size` counts every byte after itself. The data section is optional: a
//! `GetValue` reply without it means the key is absent. A request the server
//! could not serve is answered with a `Failure` frame carrying the reason.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Bytes of `kind` + `uid` + `key_len`, the fixed part of every frame body
pub const BODY_HEADER_SIZE: usize = 1 + 8 + 4;

/// Frames larger than this are rejected before any allocation
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next request id. Ids are process-wide and strictly increasing.
pub fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

/// Malformed frame contents
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {limit} byte limit", limit = MAX_FRAME_SIZE)]
    FrameTooLarge(u32),

    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown message kind {0}")]
    UnknownKind(u8),
}

/// Message type carried in the header
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    GetValue = 1,
    SetValue = 2,
    /// Reply only: the request failed on the server
    Failure = 3,
}

impl MessageKind {
    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            1 => Ok(Self::GetValue),
            2 => Ok(Self::SetValue),
            3 => Ok(Self::Failure),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// One request or response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    /// Correlation id; a response carries the id of its request
    pub uid: u64,
    pub key: Vec<u8>,
    pub data: Option<Vec<u8>>,
}

impl Message {
    /// Build a new request with a fresh uid
    pub fn request(kind: MessageKind, key: Vec<u8>, data: Option<Vec<u8>>) -> Self {
        Self {
            kind,
            uid: next_uid(),
            key,
            data,
        }
    }

    /// Build the response to this request
    pub fn reply(&self, data: Option<Vec<u8>>) -> Self {
        Self {
            kind: self.kind,
            uid: self.uid,
            key: self.key.clone(),
            data,
        }
    }

    /// Build a failure response to this request
    pub fn fail(&self, reason: &str) -> Self {
        Self {
            kind: MessageKind::Failure,
            uid: self.uid,
            key: self.key.clone(),
            data: Some(reason.as_bytes().to_vec()),
        }
    }

    /// Reason carried by a `Failure` response
    pub fn failure_reason(&self) -> Option<String> {
        if self.kind != MessageKind::Failure {
            return None;
        }
        Some(String::from_utf8_lossy(self.data.as_deref().unwrap_or_default()).into_owned())
    }

    /// Size of the body (everything after the `size` field)
    pub fn body_len(&self) -> usize {
        BODY_HEADER_SIZE
            + self.key.len()
            + self.data.as_ref().map_or(0, |data| 4 + data.len())
    }

    /// Encode the full frame including the size prefix
    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.body_len();
        let mut frame = Vec::with_capacity(4 + body_len);
        frame.extend_from_slice(&(body_len as u32).to_le_bytes());
        frame.push(self.kind as u8);
        frame.extend_from_slice(&self.uid.to_le_bytes());
        frame.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        frame.extend_from_slice(&self.key);
        if let Some(data) = &self.data {
            frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
            frame.extend_from_slice(data);
        }
        frame
    }

    /// Decode a frame body (the bytes following the size prefix)
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < BODY_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                expected: BODY_HEADER_SIZE,
                actual: body.len(),
            });
        }

        let kind = MessageKind::from_byte(body[0])?;
        let mut uid_bytes = [0u8; 8];
        uid_bytes.copy_from_slice(&body[1..9]);
        let uid = u64::from_le_bytes(uid_bytes);
        let key_len = read_len(&body[9..13]);

        let key_end = BODY_HEADER_SIZE + key_len;
        if body.len() < key_end {
            return Err(ProtocolError::Truncated {
                expected: key_end,
                actual: body.len(),
            });
        }
        let key = body[BODY_HEADER_SIZE..key_end].to_vec();

        let rest = &body[key_end..];
        let data = if rest.is_empty() {
            None
        } else {
            if rest.len() < 4 {
                return Err(ProtocolError::Truncated {
                    expected: key_end + 4,
                    actual: body.len(),
                });
            }
            let data_len = read_len(&rest[..4]);
            if rest.len() != 4 + data_len {
                return Err(ProtocolError::Truncated {
                    expected: key_end + 4 + data_len,
                    actual: body.len(),
                });
            }
            Some(rest[4..].to_vec())
        };

        Ok(Self {
            kind,
            uid,
            key,
            data,
        })
    }
}

fn read_len(bytes: &[u8]) -> usize {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream
/// cleanly between frames.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let size = match reader.read_u32_le().await {
        Ok(size) => size,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(size).into());
    }

    let mut body = vec![0u8; size as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(Message::decode(&body)?))
}

/// Write one frame and flush it
pub async fn write_message<W>(writer: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    writer.flush().await
}
