use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat relay server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an
    /// ephemeral port.
    #[arg(long, default_value = "127.0.0.1:12000")]
    pub listen: SocketAddr,

    /// File the chat transcript is appended to.
    #[arg(long, default_value = "chat_log.txt")]
    pub log_path: PathBuf,

    /// Directory uploaded files land in and downloads are served from.
    #[arg(long, default_value = ".")]
    pub files_dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name used when joining the chat.
    #[arg(long)]
    pub name: String,

    /// Address of the relay server to connect to.
    #[arg(long, default_value = "127.0.0.1:12000")]
    pub server: SocketAddr,

    /// Directory files are sent from and downloads are saved to.
    #[arg(long, default_value = ".")]
    pub files_dir: PathBuf,
}
