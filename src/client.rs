use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{
    fs::File,
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    frame::{self, DOWNLOAD_PREFIX, ERROR_PREFIX, FILE_PREFIX, SENTINEL},
    transfer,
};

/// Pause between a control frame and the payload that follows it, so the
/// control frame gets its own read on the server side. The wire format has
/// no framing to keep them apart.
const CONTROL_FRAME_PAUSE: Duration = Duration::from_millis(50);

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    send_handshake(&mut writer, &args.name).await?;
    write_stdout(&format!("*** connected as {}", args.name)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&args, &mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);
    Ok(stream.into_split())
}

/// The handshake is just the name, verbatim, as the first frame.
async fn send_handshake(writer: &mut OwnedWriteHalf, name: &str) -> Result<()> {
    frame::write_frame(writer, name.as_bytes()).await?;
    Ok(())
}

enum Event {
    Server(io::Result<Option<Vec<u8>>>),
    Stdin(io::Result<usize>),
    CtrlC,
}

async fn run_client_loop(
    args: &ClientArgs,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        // Resolve the next event first; the handlers below need the reader
        // again for modal download reads.
        let event = select! {
            server_frame = frame::read_frame(reader) => Event::Server(server_frame),
            bytes_read = stdin.read_line(input) => Event::Stdin(bytes_read),
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                Event::CtrlC
            }
        };

        match event {
            Event::Server(server_frame) => {
                if !handle_server_frame(server_frame?).await? {
                    break;
                }
            }
            Event::Stdin(bytes_read) => {
                if !handle_stdin_input(args, bytes_read?, input, reader, writer).await? {
                    break;
                }
            }
            Event::CtrlC => {
                send_bye(writer, &args.name).await;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(server_frame: Option<Vec<u8>>) -> Result<bool> {
    let Some(raw) = server_frame else {
        write_stdout("*** server closed the connection").await?;
        return Ok(false);
    };

    let text = frame::decode_text(&raw);
    let text = text.trim_end();
    if text.starts_with(ERROR_PREFIX) {
        write_stderr(&format!("!!! {text}")).await?;
    } else {
        write_stdout(text).await?;
    }
    Ok(true)
}

async fn handle_stdin_input(
    args: &ClientArgs,
    bytes_read: usize,
    input: &str,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    if bytes_read == 0 {
        send_bye(writer, &args.name).await;
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        send_bye(writer, &args.name).await;
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if let Some(path) = text.strip_prefix("/send ") {
        upload(writer, Path::new(path.trim())).await?;
        return Ok(true);
    }

    if let Some(name) = text.strip_prefix("/get ") {
        download(reader, writer, &args.files_dir, name.trim()).await?;
        return Ok(true);
    }

    // Ordinary chat: render locally, then relay. The server never echoes a
    // sender's own message back.
    let message = format!("{}: {}", args.name, text);
    write_stdout(&message).await?;
    frame::write_frame(writer, message.as_bytes()).await?;
    Ok(true)
}

/// `FILE:<name>` then the raw bytes then the sentinel. The file is opened
/// before the control frame goes out, so a bad path never leaves the
/// server waiting for a payload.
async fn upload(writer: &mut OwnedWriteHalf, path: &Path) -> Result<()> {
    let filename = match path.file_name().and_then(|name| name.to_str()) {
        Some(filename) => filename.to_string(),
        None => {
            write_stderr(&format!("!!! cannot send '{}'", path.display())).await?;
            return Ok(());
        }
    };
    if File::open(path).await.is_err() {
        write_stderr(&format!("!!! cannot open '{}'", path.display())).await?;
        return Ok(());
    }

    frame::write_frame(writer, format!("{FILE_PREFIX}{filename}").as_bytes()).await?;
    tokio::time::sleep(CONTROL_FRAME_PAUSE).await;
    transfer::send(writer, path).await?;
    write_stdout(&format!("*** sent '{filename}'")).await?;
    Ok(())
}

/// `DOWNLOAD:<name>`, then read the sentinel-terminated reply modally. An
/// `ERROR:`-prefixed reply is rendered instead of saved.
async fn download(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    files_dir: &Path,
    filename: &str,
) -> Result<()> {
    let Some(path) = transfer::resolve_name(files_dir, filename) else {
        write_stderr(&format!("!!! invalid file name '{filename}'")).await?;
        return Ok(());
    };

    frame::write_frame(writer, format!("{DOWNLOAD_PREFIX}{filename}").as_bytes()).await?;

    let first = frame::read_frame(reader)
        .await?
        .context("server closed during download")?;

    if first.starts_with(ERROR_PREFIX.as_bytes()) {
        let report = collect_error_reply(reader, first).await?;
        write_stderr(&format!("!!! {}", report.trim_end())).await?;
        return Ok(());
    }

    let mut file = File::create(&path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    if first.ends_with(SENTINEL) {
        file.write_all(&first[..first.len() - SENTINEL.len()])
            .await?;
        file.flush().await?;
    } else {
        file.write_all(&first).await?;
        transfer::receive(reader, &mut file).await?;
    }

    write_stdout(&format!("*** downloaded '{filename}'")).await?;
    Ok(())
}

/// Error replies are short but still sentinel-terminated; keep reading
/// until the marker shows up, then strip it.
async fn collect_error_reply(reader: &mut OwnedReadHalf, first: Vec<u8>) -> Result<String> {
    let mut reply = first;
    while !reply.ends_with(SENTINEL) {
        let next = frame::read_frame(reader)
            .await?
            .context("server closed during download")?;
        reply.extend_from_slice(&next);
    }
    reply.truncate(reply.len() - SENTINEL.len());
    Ok(frame::decode_text(&reply).into_owned())
}

/// Graceful goodbye, best effort: the server treats `"<name>: bye"` as the
/// disconnect frame.
async fn send_bye(writer: &mut OwnedWriteHalf, name: &str) {
    let farewell = format!("{name}: bye");
    if let Err(error) = frame::write_frame(writer, farewell.as_bytes()).await {
        warn!(?error, "failed to send goodbye");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
