use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "mailkeep", version, about = "IMAP mailbox backup tool")]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long = "config", default_value = "config.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose logging
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mirror the configured IMAP account into local storage
    Sync(SyncArgs),
    /// Serve the stored mail corpus for read-only browsing
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Disable the per-mailbox progress counter
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub addr: String,
}
