mod answerer;
mod cli;
mod crypto;
mod endpoint;
mod offerer;
mod peer;
mod signaling;
mod transfer;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "skiff=info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Send(args) => offerer::run_send(args).await,
        Command::Receive(args) => answerer::run_receive(args).await,
    }
}
