use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime::Runtime;
use tracing::{error, info, warn};

use mailkeep_core::{CancelToken, SqliteStore, is_cancellation};
use mailkeep_imap::{ConnectOptions, ImapClient};
use mailkeep_sync::Syncer;

mod cli;
mod config;
mod mime;
mod progress;
mod server;

use crate::cli::{Cli, Command, ServeArgs, SyncArgs};
use crate::config::Config;
use crate::progress::TerminalProgress;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli) {
        if is_cancellation(&err) {
            info!("cancelled by user");
            return;
        }
        error!(error = ?err, "command failed");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    let runtime = Runtime::new().context("failed to start async runtime")?;

    match cli.command {
        Command::Sync(args) => run_sync(&runtime, &config, &args),
        Command::Serve(args) => run_serve(&runtime, &config, &args),
    }
}

fn run_sync(runtime: &Runtime, config: &Config, args: &SyncArgs) -> Result<()> {
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, shutting down gracefully");
                cancel.cancel();
            }
        });
    }

    info!(host = %config.imap.host, port = config.imap.port, "connecting to IMAP server");
    let mut client = ImapClient::connect(ConnectOptions {
        host: config.imap.host.clone(),
        port: config.imap.port,
        username: config.imap.username.clone(),
        password: config.imap.password.clone(),
        tls: config.imap.tls,
    })
    .context("failed to connect to IMAP server")?;

    let is_gmail = client.is_gmail_server(&cancel)?;
    if is_gmail {
        info!("detected Gmail server");
    }

    let store = runtime
        .block_on(SqliteStore::open(&config.storage.path, false))
        .context("failed to open storage")?;
    info!(path = %config.storage.path, "opened storage");

    let mut syncer = Syncer::new(client, store, runtime.handle().clone())
        .with_gmail_config(config.gmail.clone(), is_gmail);
    if !args.no_progress {
        syncer = syncer.with_progress(Box::new(TerminalProgress::new()));
    }

    info!("starting email sync");
    let result = syncer.sync_all(&cancel);

    let mut client = syncer.into_client();
    client.close();

    match result {
        Ok(_) => {
            info!("email sync completed");
            Ok(())
        }
        Err(err) if is_cancellation(&err) => {
            info!("sync cancelled by user");
            Ok(())
        }
        Err(err) => Err(err.context("sync failed")),
    }
}

fn run_serve(runtime: &Runtime, config: &Config, args: &ServeArgs) -> Result<()> {
    let store = runtime
        .block_on(SqliteStore::open(&config.storage.path, true))
        .context("failed to open storage read-only")?;
    info!(path = %config.storage.path, "opened storage (read-only)");

    let addr: SocketAddr = args
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", args.addr))?;

    runtime.block_on(server::run(store, addr))
}
