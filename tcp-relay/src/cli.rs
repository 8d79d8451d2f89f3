use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::frame::DEFAULT_MAX_FRAME_LEN;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, forwarding every message to all other connected clients.
    Serve(ServeArgs),
    /// Connect to a relay and exchange lines of text with the other clients.
    Client(ClientArgs),
    /// Send one file to a `receive-files` server.
    SendFile(SendFileArgs),
    /// Accept files over TCP and save them into a directory.
    ReceiveFiles(ReceiveFilesArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:65432")]
    pub listen: SocketAddr,

    /// Largest message payload accepted, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,

    /// Give up on a client whose send takes longer than this. 0 disables the limit.
    #[arg(long, default_value_t = 10_000)]
    pub write_timeout_ms: u64,

    /// Disconnect clients that stay silent for this many seconds.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:65432")]
    pub server: SocketAddr,

    /// Largest message payload accepted, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,
}

#[derive(Args, Debug, Clone)]
pub struct SendFileArgs {
    /// Address of the file receiver.
    #[arg(long, default_value = "127.0.0.1:65432")]
    pub server: SocketAddr,

    /// File to send. Only its base name is transmitted.
    pub path: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ReceiveFilesArgs {
    /// Socket address to accept uploads on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:65432")]
    pub listen: SocketAddr,

    /// Directory received files are written to; created if missing.
    #[arg(long, default_value = "received_files")]
    pub dir: PathBuf,
}
