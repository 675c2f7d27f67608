use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::{
    io::AsyncWriteExt,
    net::tcp::OwnedWriteHalf,
    sync::{Mutex, MutexGuard},
};
use tracing::warn;

pub type SessionId = u64;

/// One connected participant: a display name plus the writable half of its
/// socket. Cloning is cheap; all clones share the same write half.
///
/// Names are not unique. Identity for removal is the numeric id, never the
/// name.
#[derive(Clone)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl Session {
    /// Writes one frame to this session's socket.
    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Takes the write half for an extended transfer. While the guard is
    /// held, broadcasts to this session queue behind it instead of
    /// interleaving with the payload.
    pub async fn lock_writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Best-effort socket shutdown on session close.
    pub async fn shutdown(&self) {
        if let Err(error) = self.writer.lock().await.shutdown().await {
            warn!(name = %self.name, ?error, "failed to shut down session socket");
        }
    }
}

/// The shared set of live sessions. Membership changes and broadcast
/// snapshots serialize through a single lock; the lock is never held
/// across a network write.
pub struct Registry {
    sessions: Mutex<Vec<Session>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a new session. Duplicate names are permitted and not
    /// detected.
    pub async fn add(&self, name: String, writer: OwnedWriteHalf) -> Session {
        let session = Session {
            id: self.next_id(),
            name,
            writer: Arc::new(Mutex::new(writer)),
        };
        self.sessions.lock().await.push(session.clone());
        session
    }

    /// Removes a session by identity. Idempotent: the graceful and error
    /// disconnect paths may both call it.
    pub async fn remove(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|session| session.id != id);
        sessions.len() != before
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions
            .lock()
            .await
            .iter()
            .any(|session| session.id == id)
    }

    /// Copies the current session list under the lock.
    pub async fn snapshot(&self) -> Vec<Session> {
        self.sessions.lock().await.clone()
    }

    /// Sends `message` to every session whose name differs from
    /// `sender_name`; the sender already rendered the message locally.
    ///
    /// The peer list is snapshotted under the lock and the writes happen
    /// outside it, so one slow peer cannot stall the registry. A write may
    /// reach a peer that has since disconnected; that write fails and is
    /// logged, and delivery continues to the remaining peers.
    pub async fn broadcast(&self, sender_name: &str, message: &[u8]) {
        let peers = self.snapshot().await;
        for peer in peers.iter().filter(|peer| peer.name != sender_name) {
            if let Err(error) = peer.send(message).await {
                warn!(peer = %peer.name, ?error, "failed to deliver broadcast");
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::{
        io::AsyncReadExt,
        net::{TcpListener, TcpStream},
        time::timeout,
    };

    /// Connects a loopback socket pair and returns the server-side write
    /// half together with the client stream observing it.
    async fn socket_pair() -> (OwnedWriteHalf, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, _) = listener.accept().await.expect("accept");
        let (_, server_writer) = server.into_split();
        (server_writer, client)
    }

    async fn read_some(reader: &mut TcpStream) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let n = timeout(Duration::from_secs(1), reader.read(&mut buf))
            .await
            .expect("read should not time out")
            .expect("read");
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = Registry::new();
        let (writer, _reader) = socket_pair().await;
        let session = registry.add("alice".into(), writer).await;

        assert!(registry.remove(session.id).await);
        assert!(!registry.remove(session.id).await);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn duplicate_names_are_allowed() {
        let registry = Registry::new();
        let (writer_a, _reader_a) = socket_pair().await;
        let (writer_b, _reader_b) = socket_pair().await;

        let first = registry.add("alice".into(), writer_a).await;
        let second = registry.add("alice".into(), writer_b).await;

        assert_ne!(first.id, second.id);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let registry = Registry::new();
        let (alice_writer, mut alice_reader) = socket_pair().await;
        let (bob_writer, mut bob_reader) = socket_pair().await;
        registry.add("alice".into(), alice_writer).await;
        registry.add("bob".into(), bob_writer).await;

        registry.broadcast("alice", b"alice: hello").await;

        assert_eq!(read_some(&mut bob_reader).await, b"alice: hello");
        let echo = timeout(Duration::from_millis(200), async {
            let mut buf = [0u8; 16];
            alice_reader.read(&mut buf).await
        })
        .await;
        assert!(echo.is_err(), "sender must not receive its own broadcast");
    }

    #[tokio::test]
    async fn broadcast_survives_a_dead_peer() {
        let registry = Registry::new();
        let (dead_writer, dead_reader) = socket_pair().await;
        let (bob_writer, mut bob_reader) = socket_pair().await;
        registry.add("ghost".into(), dead_writer).await;
        registry.add("bob".into(), bob_writer).await;

        // Tear down the ghost's socket so writes to it fail.
        drop(dead_reader);
        for session in registry.snapshot().await {
            if session.name == "ghost" {
                session.shutdown().await;
            }
        }

        registry.broadcast("alice", b"alice: still here").await;
        assert_eq!(read_some(&mut bob_reader).await, b"alice: still here");
    }
}
