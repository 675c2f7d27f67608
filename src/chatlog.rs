use std::path::Path;

use anyhow::{Context, Result};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::warn;

/// Append-only chat transcript: one line per chat message or join/leave
/// notice. Handlers append concurrently, so writes serialize through a
/// lock to keep lines whole.
pub struct ChatLog {
    file: Mutex<File>,
}

impl ChatLog {
    /// Opens (creating if needed) the log file in append mode.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open chat log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Appends one line. A failed append loses that line but never takes
    /// the relay down.
    pub async fn append(&self, line: &str) {
        let mut file = self.file.lock().await;
        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        if let Err(error) = result {
            warn!(?error, "failed to append to chat log");
        }
    }
}
