//! Sentinel-delimited file transfer.
//!
//! Payloads are raw bytes followed by the literal [`SENTINEL`] marker;
//! there is no length prefix and no escaping. The sentinel is matched only
//! against the tail of each read chunk, so a marker that straddles two
//! reads, or legitimate payload bytes that happen to end a chunk with the
//! marker, corrupt the transfer. Legacy peers expect exactly this
//! behavior.

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

use crate::frame::{READ_CHUNK, SENTINEL};

/// Error frame sent to a download requester when the file cannot be
/// opened. Byte-for-byte the legacy wire value, sentinel included.
pub const ERROR_NOT_FOUND: &[u8] = b"ERROR: File not found.\nEOF";
/// Error frame for any other failure while serving a download.
pub const ERROR_SEND_FAILED: &[u8] = b"ERROR: Unable to send file.\nEOF";

/// Resolves a transfer name inside the serve directory.
///
/// Names are confined to a single normal path component: anything with
/// separators, parent components, or an empty name is refused. The
/// original protocol joined names to the working directory unchecked;
/// this restriction is a deliberate behavior change.
pub fn resolve_name(files_dir: &Path, name: &str) -> Option<PathBuf> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(files_dir.join(name)),
        _ => None,
    }
}

/// Reads a sentinel-terminated payload from `reader`, writing it to `out`.
///
/// A clean end of stream mid-transfer is an error: the peer vanished
/// before the sentinel arrived.
pub async fn receive<R, W>(reader: &mut R, out: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-transfer",
            ));
        }
        let data = &chunk[..n];
        if data.ends_with(SENTINEL) {
            out.write_all(&data[..n - SENTINEL.len()]).await?;
            return out.flush().await;
        }
        out.write_all(data).await?;
    }
}

/// Receives a sentinel-terminated payload into a freshly created file.
pub async fn receive_to_file<R>(reader: &mut R, path: &Path) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut file = File::create(path).await?;
    receive(reader, &mut file).await
}

/// Streams the file at `path` to `writer` in read-sized chunks and appends
/// the sentinel. An empty file sends just the sentinel.
pub async fn send<W>(writer: &mut W, path: &Path) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut file = File::open(path).await?;
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&chunk[..n]).await?;
    }
    writer.write_all(SENTINEL).await?;
    writer.flush().await
}
