//! Wire frames and length-prefixed framing.
//!
//! Every message on a link is a 4-byte big-endian length prefix followed by a
//! UTF-8 JSON payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::error::{Result, TetherError};
use crate::resource::ResourceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Transport status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Ok,
    NotFound,
    Unavailable,
    Internal,
    InvalidArgument,
    Unknown,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "ok",
            Code::NotFound => "not_found",
            Code::Unavailable => "unavailable",
            Code::Internal => "internal",
            Code::InvalidArgument => "invalid_argument",
            Code::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error status carried by a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Status for a request addressed to an endpoint that is no longer serving.
    pub fn unavailable(endpoint: ResourceId) -> Self {
        Self::new(
            Code::Unavailable,
            format!("resource {} is not serving", endpoint),
        )
    }
}

/// One message on a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Invoke `method` on the peer's endpoint.
    Call {
        seq: u64,
        endpoint: ResourceId,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Ask whether the peer is serving `endpoint`.
    Resolve { seq: u64, endpoint: ResourceId },
    /// Answer to a `call` or `resolve` with the same `seq`.
    Reply {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Status>,
    },
    /// The sender is tearing the link down.
    Goodbye,
}

impl Frame {
    /// Create a success reply.
    pub fn success(seq: u64, result: Value) -> Self {
        Frame::Reply {
            seq,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error reply.
    pub fn failure(seq: u64, status: Status) -> Self {
        Frame::Reply {
            seq,
            result: None,
            error: Some(status),
        }
    }

    /// Create a reply from a handler outcome.
    pub fn reply(seq: u64, outcome: std::result::Result<Value, Status>) -> Self {
        match outcome {
            Ok(value) => Frame::success(seq, value),
            Err(status) => Frame::failure(seq, status),
        }
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed the link).
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(TetherError::Protocol {
            message: format!("frame size {} exceeds maximum {}", len, max_size),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| TetherError::Protocol {
        message: format!("frame size {} does not fit a u32 prefix", payload.len()),
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize one frame, refusing payloads the peer would reject.
pub fn encode_frame(frame: &Frame, max_size: usize) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(frame)?;
    if bytes.len() > max_size {
        return Err(TetherError::Protocol {
            message: format!("frame size {} exceeds maximum {}", bytes.len(), max_size),
        });
    }
    Ok(bytes)
}
