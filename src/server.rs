use std::{
    future::Future,
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use anyhow::Result;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    select,
};
use tracing::{info, warn};

use crate::{
    chatlog::ChatLog,
    frame::{self, Frame},
    registry::{Registry, Session},
    transfer,
};

/// Server configuration beyond the listener itself.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Append-only chat transcript path.
    pub log_path: PathBuf,
    /// Directory served for uploads and downloads.
    pub files_dir: PathBuf,
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    /// Opens the chat log and wraps the listener. Fails if the log file
    /// cannot be created.
    pub async fn new(listener: TcpListener, config: ServerConfig) -> Result<Self> {
        let chat_log = ChatLog::open(&config.log_path).await?;
        info!(log = %config.log_path.display(), "chat transcript will be appended");
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                registry: Arc::new(Registry::new()),
                chat_log,
                files_dir: config.files_dir,
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared session registry, kept reachable for tests that inspect
    /// membership while the server runs.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    /// Accepts connections until `shutdown` completes.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

struct ServerState {
    registry: Arc<Registry>,
    chat_log: ChatLog,
    files_dir: PathBuf,
}

async fn handle_shutdown(state: &Arc<ServerState>) {
    info!("server shutting down");
    // Best effort; sessions observe the closed socket right after.
    state.registry.broadcast("", b"ERROR: Server shutting down.").await;
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_session_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, state).await {
            warn!(peer = %peer, error = ?err, "session closed with error");
        }
    });
}

/// Drives one session through handshake, the active relay loop, and
/// cleanup. Registry removal and socket shutdown run on every exit path.
async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (mut reader, writer) = stream.into_split();

    // Handshake: the first frame is the display name, taken verbatim. No
    // validation; duplicate names are allowed.
    let name = match frame::read_frame(&mut reader).await? {
        Some(raw) => frame::decode_text(&raw).into_owned(),
        None => anyhow::bail!("connection closed before name handshake"),
    };

    let session = state.registry.add(name, writer).await;
    info!(?peer, name = %session.name, "client joined");

    let joined = format!("{} has joined the chat!", session.name);
    state.chat_log.append(&joined).await;
    state.registry.broadcast(&session.name, joined.as_bytes()).await;

    let result = run_session(&state, &mut reader, &session).await;
    cleanup_session(&state, &session, peer).await;
    result
}

/// The active state: read one frame at a time and classify it. Returns
/// `Ok(())` on graceful disconnect; a read error propagates and skips the
/// leave notice (best effort only).
async fn run_session(
    state: &ServerState,
    reader: &mut OwnedReadHalf,
    session: &Session,
) -> Result<()> {
    loop {
        let raw = match frame::read_frame(reader).await? {
            Some(raw) => raw,
            // A clean end of stream takes the same graceful path as an
            // explicit bye.
            None => {
                announce_departure(state, session).await;
                return Ok(());
            }
        };

        let text = frame::decode_text(&raw).into_owned();
        match frame::classify(&text, &session.name) {
            Frame::Upload { filename } => {
                handle_upload(state, reader, session, &filename).await?;
            }
            Frame::Download { filename } => {
                handle_download(state, session, &filename).await?;
            }
            Frame::Bye => {
                let farewell = text.trim();
                if !farewell.is_empty() {
                    state.chat_log.append(farewell).await;
                }
                announce_departure(state, session).await;
                return Ok(());
            }
            Frame::Chat(message) => {
                state.chat_log.append(message.trim()).await;
                state.registry.broadcast(&session.name, message.as_bytes()).await;
            }
        }
    }
}

async fn announce_departure(state: &ServerState, session: &Session) {
    let notice = format!("{} has left the chat!", session.name);
    state.chat_log.append(&notice).await;
    state.registry.broadcast(&session.name, notice.as_bytes()).await;
}

/// File-receive sub-protocol: drain this session's stream to the sentinel,
/// into the serve directory when the name is acceptable, into the void
/// otherwise. Refused uploads must still be drained or their payload bytes
/// would be misread as chat frames.
async fn handle_upload(
    state: &ServerState,
    reader: &mut OwnedReadHalf,
    session: &Session,
    filename: &str,
) -> io::Result<()> {
    match transfer::resolve_name(&state.files_dir, filename) {
        Some(path) => {
            transfer::receive_to_file(reader, &path).await?;
            info!(name = %session.name, file = %filename, "file received");
        }
        None => {
            transfer::receive(reader, &mut tokio::io::sink()).await?;
            warn!(name = %session.name, file = %filename, "refused upload outside serve directory");
        }
    }
    Ok(())
}

/// File-send sub-protocol. The write half stays locked for the whole
/// transfer so concurrent broadcasts cannot interleave with the payload.
/// Failures are reported to the requester with the legacy `ERROR:` frames
/// and keep the session alive.
async fn handle_download(
    state: &ServerState,
    session: &Session,
    filename: &str,
) -> io::Result<()> {
    let path = transfer::resolve_name(&state.files_dir, filename);
    let mut writer = session.lock_writer().await;

    let result = match &path {
        Some(path) => transfer::send(&mut *writer, path).await,
        None => Err(io::Error::new(io::ErrorKind::NotFound, "name refused")),
    };

    match result {
        Ok(()) => {
            info!(name = %session.name, file = %filename, "file sent");
            Ok(())
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            warn!(name = %session.name, file = %filename, "requested file not found");
            writer.write_all(transfer::ERROR_NOT_FOUND).await?;
            writer.flush().await
        }
        Err(error) => {
            warn!(name = %session.name, file = %filename, ?error, "failed to send file");
            writer.write_all(transfer::ERROR_SEND_FAILED).await?;
            writer.flush().await
        }
    }
}

async fn cleanup_session(state: &ServerState, session: &Session, peer: Option<SocketAddr>) {
    state.registry.remove(session.id).await;
    session.shutdown().await;
    info!(?peer, name = %session.name, "client disconnected");
}
