//! Length-prefixed message framing
//!
//! Wire format (all lengths are big-endian u32):
//!
//! ```text
//! +---------+---------------------------------------+
//! | length  | JSON header {"type": .., "data": ..}   |
//! | 4 bytes | `length` bytes                        |
//! +---------+---------------------------------------+
//! ```
//!
//! `file_content` and `upload_file` are followed by a second frame carrying
//! the raw file bytes:
//!
//! ```text
//! +---------+---------------------------------------+
//! | length  | file content                          |
//! | 4 bytes | `length` bytes                        |
//! +---------+---------------------------------------+
//! ```

use crate::error::CodecError;
use crate::protocol::timeouts::{read_deadline_ms, write_deadline_ms};
use crate::protocol::{tag, LENGTH_PREFIX_LEN, MAX_CONTENT_SIZE, MAX_FRAME_SIZE};
use crate::protocol_core::validate_frame_size;
use crate::registry::{FileRecord, Registry};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

/// One protocol message. File bytes live outside the JSON header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    /// Server's full registry, sent once per connection
    FileRegistry(Registry),
    /// Client's full registry, answered with `SyncUpdates`
    ClientRegistry(Registry),
    /// Paths the client should pull
    SyncUpdates { files: Vec<String> },
    RequestFile { path: String },
    FileContent {
        path: String,
        record: FileRecord,
        #[serde(skip)]
        content: Vec<u8>,
    },
    FileNotFound { path: String },
    UploadFile {
        path: String,
        record: FileRecord,
        /// Hash the uploader held before its local change
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_hash: Option<String>,
        #[serde(skip)]
        content: Vec<u8>,
    },
    /// Another client changed `path`
    FileUpdated { path: String, record: FileRecord },
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::FileRegistry(_) => tag::FILE_REGISTRY,
            Message::ClientRegistry(_) => tag::CLIENT_REGISTRY,
            Message::SyncUpdates { .. } => tag::SYNC_UPDATES,
            Message::RequestFile { .. } => tag::REQUEST_FILE,
            Message::FileContent { .. } => tag::FILE_CONTENT,
            Message::FileNotFound { .. } => tag::FILE_NOT_FOUND,
            Message::UploadFile { .. } => tag::UPLOAD_FILE,
            Message::FileUpdated { .. } => tag::FILE_UPDATED,
        }
    }

    /// Raw file bytes for content-carrying messages
    pub fn content(&self) -> Option<&[u8]> {
        match self {
            Message::FileContent { content, .. } | Message::UploadFile { content, .. } => {
                Some(content)
            }
            _ => None,
        }
    }

    fn content_mut(&mut self) -> Option<&mut Vec<u8>> {
        match self {
            Message::FileContent { content, .. } | Message::UploadFile { content, .. } => {
                Some(content)
            }
            _ => None,
        }
    }
}

fn push_frame(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
}

/// Serialize a message into its header frame plus optional content frame
pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let header = serde_json::to_vec(msg)?;
    validate_frame_size(header.len(), MAX_FRAME_SIZE)?;
    let content = msg.content();
    let content_len = content.map_or(0, |c| LENGTH_PREFIX_LEN + c.len());

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + header.len() + content_len);
    push_frame(&mut buf, &header);
    if let Some(content) = content {
        validate_frame_size(content.len(), MAX_CONTENT_SIZE)?;
        push_frame(&mut buf, content);
    }
    Ok(buf)
}

/// Encode and write one message within a size-scaled deadline
pub async fn write_message<W>(w: &mut W, msg: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode(msg)?;
    let ms = write_deadline_ms(buf.len());
    match timeout(Duration::from_millis(ms), async {
        w.write_all(&buf).await?;
        w.flush().await
    })
    .await
    {
        Ok(result) => Ok(result?),
        Err(_) => Err(CodecError::Timeout("frame write", ms)),
    }
}

/// Fill as much of `buf` as the stream delivers before EOF
async fn read_full<R>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn read_exact_timed<R>(r: &mut R, buf: &mut [u8], what: &'static str) -> Result<(), CodecError>
where
    R: AsyncRead + Unpin,
{
    let ms = read_deadline_ms(buf.len());
    let n = match timeout(Duration::from_millis(ms), read_full(r, buf)).await {
        Ok(res) => res?,
        Err(_) => return Err(CodecError::Timeout(what, ms)),
    };
    if n < buf.len() {
        return Err(CodecError::Truncated {
            read: n,
            expected: buf.len(),
        });
    }
    Ok(())
}

async fn read_frame_body<R>(r: &mut R, len: usize, what: &'static str) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; len];
    if len > 0 {
        read_exact_timed(r, &mut payload, what).await?;
    }
    Ok(payload)
}

/// Read the next message.
///
/// `Ok(None)` means the peer closed cleanly between messages. Waiting for a
/// header prefix is unbounded; everything after it runs under deadlines.
pub async fn read_message<R>(r: &mut R) -> Result<Option<Message>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let n = read_full(r, &mut prefix).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < LENGTH_PREFIX_LEN {
        return Err(CodecError::Truncated {
            read: n,
            expected: LENGTH_PREFIX_LEN,
        });
    }
    let len = u32::from_be_bytes(prefix) as usize;
    validate_frame_size(len, MAX_FRAME_SIZE)?;
    let header = read_frame_body(r, len, "header read").await?;
    let mut msg: Message = serde_json::from_slice(&header)?;

    if let Some(content) = msg.content_mut() {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        read_exact_timed(r, &mut prefix, "content prefix read").await?;
        let len = u32::from_be_bytes(prefix) as usize;
        validate_frame_size(len, MAX_CONTENT_SIZE)?;
        *content = read_frame_body(r, len, "content read").await?;
    }
    Ok(Some(msg))
}
