use std::borrow::Cow;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of one transport read. The legacy protocol has no framing beyond
/// this: a frame is whatever a single read returns.
pub const READ_CHUNK: usize = 1024;

/// End-of-transfer marker appended after file payloads in lieu of a length
/// prefix. Must stay bit-for-bit compatible with legacy peers.
pub const SENTINEL: &[u8] = b"EOF";

pub const FILE_PREFIX: &str = "FILE:";
pub const DOWNLOAD_PREFIX: &str = "DOWNLOAD:";
pub const ERROR_PREFIX: &str = "ERROR:";

/// One classified text frame from an active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `FILE:<name>` — the sender is about to stream a file to us.
    Upload { filename: String },
    /// `DOWNLOAD:<name>` — the sender wants a file streamed back.
    Download { filename: String },
    /// `"<name>: bye"` or an empty frame: graceful disconnect.
    Bye,
    /// Anything else is chat text, relayed verbatim.
    Chat(String),
}

/// Classifies one decoded frame from the session named `name`.
///
/// A `FILE:`/`DOWNLOAD:` frame with an empty filename is treated as chat
/// text rather than rejected, keeping the session alive.
pub fn classify(raw: &str, name: &str) -> Frame {
    if let Some(filename) = raw.strip_prefix(FILE_PREFIX) {
        if !filename.is_empty() {
            return Frame::Upload {
                filename: filename.to_string(),
            };
        }
    }

    if let Some(filename) = raw.strip_prefix(DOWNLOAD_PREFIX) {
        if !filename.is_empty() {
            return Frame::Download {
                filename: filename.to_string(),
            };
        }
    }

    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == format!("{name}: bye") {
        return Frame::Bye;
    }

    Frame::Chat(raw.to_string())
}

/// Reads one frame: up to [`READ_CHUNK`] bytes, whatever the transport
/// delivers. Returns `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(buf[..n].to_vec()))
}

/// Writes one frame and flushes so peers see it promptly.
pub async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Decodes frame bytes as text. The protocol is UTF-8-ish at best, so
/// invalid sequences are replaced rather than rejected.
pub fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}
