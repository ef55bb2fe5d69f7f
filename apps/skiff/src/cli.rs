use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "skiff")]
#[command(about = "Peer-to-peer file handoff over WebRTC data channels")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a file, minting a room if none is given
    Send(SendArgs),
    /// Receive a file from an existing room
    Receive(ReceiveArgs),
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// File to send
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Room id or full room URL (supports #k=…); omitted = create one
    #[arg(value_name = "ROOM_ID_OR_URL")]
    pub room: Option<String>,

    /// Override the rendezvous endpoint
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Disable end-to-end encryption (default: enabled)
    #[arg(long)]
    pub no_encrypt: bool,

    /// Keep serving receivers after the first successful send
    #[arg(long)]
    pub stay_open: bool,
}

#[derive(Args, Debug)]
pub struct ReceiveArgs {
    /// Room id or full room URL (supports #k=…)
    #[arg(value_name = "ROOM_ID_OR_URL")]
    pub room: String,

    /// Output directory
    #[arg(long, default_value = ".", value_name = "DIR")]
    pub output_dir: PathBuf,

    /// Override the rendezvous endpoint
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Base64url decryption key (overrides the #k=… fragment)
    #[arg(long, value_name = "KEY")]
    pub key: Option<String>,

    /// Keep receiving after the first completed transfer
    #[arg(long)]
    pub stay_open: bool,
}
