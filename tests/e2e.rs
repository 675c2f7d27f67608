use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_chat_and_file_transfer_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat-relay");

    let server_dir = tempfile::tempdir()?;
    let (mut server_child, mut server_stdout) = spawn_server(&binary, server_dir.path()).await?;
    let addr = read_server_addr(&mut server_stdout).await?;

    // Drain further server logs in the background so the pipe never fills.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    let alice_dir = tempfile::tempdir()?;
    let bob_dir = tempfile::tempdir()?;
    let mut alice = spawn_client(&binary, "alice", &addr, alice_dir.path()).await?;
    let mut bob = spawn_client(&binary, "bob", &addr, bob_dir.path()).await?;

    // Alice was already registered when Bob joined, so she gets the notice.
    let alice_sees_bob =
        read_line_expect(&mut alice.stdout, "waiting for alice join notice").await?;
    assert_eq!(alice_sees_bob, "bob has joined the chat!");

    // Chat is relayed to Bob; Alice renders her own line locally.
    alice
        .send_line("Hello from Alice")
        .await
        .context("alice send line")?;
    let alice_echo = read_line_expect(&mut alice.stdout, "waiting for alice local echo").await?;
    assert_eq!(alice_echo, "alice: Hello from Alice");
    let bob_hears_alice =
        read_line_expect(&mut bob.stdout, "waiting for bob to hear alice").await?;
    assert_eq!(bob_hears_alice, "alice: Hello from Alice");

    bob.send_line("Hi Alice!").await.context("bob send line")?;
    let bob_echo = read_line_expect(&mut bob.stdout, "waiting for bob local echo").await?;
    assert_eq!(bob_echo, "bob: Hi Alice!");
    let alice_hears_bob =
        read_line_expect(&mut alice.stdout, "waiting for alice to hear bob").await?;
    assert_eq!(alice_hears_bob, "bob: Hi Alice!");

    // Alice uploads a file; it lands in the server's serve directory.
    let payload = b"shared notes\nsecond line\n";
    let upload_path = alice_dir.path().join("notes.txt");
    tokio::fs::write(&upload_path, payload).await?;
    alice
        .send_line(&format!("/send {}", upload_path.display()))
        .await
        .context("alice send file")?;
    let alice_sent = read_line_expect(&mut alice.stdout, "waiting for alice upload ack").await?;
    assert_eq!(alice_sent, "*** sent 'notes.txt'");
    wait_for_file(&server_dir.path().join("notes.txt"), payload).await?;

    // Bob downloads it by name into his own directory.
    bob.send_line("/get notes.txt")
        .await
        .context("bob get file")?;
    let bob_downloaded =
        read_line_expect(&mut bob.stdout, "waiting for bob download ack").await?;
    assert_eq!(bob_downloaded, "*** downloaded 'notes.txt'");
    let fetched = tokio::fs::read(bob_dir.path().join("notes.txt")).await?;
    assert_eq!(fetched, payload);

    // Alice quits; Bob receives the departure notice.
    alice.send_line("/quit").await.context("alice send quit")?;
    let alice_quit =
        read_line_expect(&mut alice.stdout, "waiting for alice quit confirmation").await?;
    assert_eq!(alice_quit, "*** leaving chat");
    let bob_sees_departure =
        read_line_expect(&mut bob.stdout, "waiting for bob to see alice leave").await?;
    assert_eq!(bob_sees_departure, "alice has left the chat!");

    bob.send_line("/quit").await.context("bob send quit")?;
    let bob_quit = read_line_expect(&mut bob.stdout, "waiting for bob quit confirmation").await?;
    assert_eq!(bob_quit, "*** leaving chat");

    ensure_success(&mut alice.child, "alice client").await?;
    ensure_success(&mut bob.child, "bob client").await?;

    // The server stays up after clients disconnect; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    // The transcript recorded the session.
    let transcript = tokio::fs::read_to_string(server_dir.path().join("chat_log.txt")).await?;
    assert!(transcript.contains("alice: Hello from Alice"));
    assert!(transcript.contains("alice has left the chat!"));

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_server(binary: &Path, dir: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("server")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--log-path")
        .arg(dir.join("chat_log.txt"))
        .arg("--files-dir")
        .arg(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_server_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    loop {
        let line = read_line(reader)
            .await?
            .context("server exited before emitting its listening address")?;
        if !line.contains("listening on") {
            continue;
        }
        let addr = line
            .split_whitespace()
            .last()
            .context("unexpected server banner format")?;
        if !addr.contains(':') {
            return Err(anyhow!("server banner missing socket: {line}"));
        }
        return Ok(addr.to_string());
    }
}

async fn spawn_client(
    binary: &Path,
    name: &str,
    addr: &str,
    files_dir: &Path,
) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--name")
        .arg(name)
        .arg("--server")
        .arg(addr)
        .arg("--files-dir")
        .arg(files_dir)
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {name}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    let banner = read_line_expect(&mut process.stdout, "waiting for connect banner").await?;
    if banner != format!("*** connected as {name}") {
        return Err(anyhow!(
            "expected connect banner for {name}, got '{banner}'"
        ));
    }

    Ok(process)
}

/// Uploads land asynchronously; poll the server's directory until the file
/// matches or a deadline passes.
async fn wait_for_file(path: &Path, expected: &[u8]) -> Result<()> {
    for _ in 0..30 {
        if let Ok(contents) = tokio::fs::read(path).await {
            if contents == expected {
                return Ok(());
            }
        }
        sleep(Duration::from_millis(100)).await;
    }
    Err(anyhow!("file {} never matched upload", path.display()))
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
