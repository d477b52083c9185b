//! WSN testbed control server: UDP heartbeat listener plus TCP command server.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use wsn_server::{logging, AppState, CommandServer, Config, FtpTransfer, HeartbeatListener, Store};

#[derive(Debug, Parser)]
#[command(name = "wsn-server", version, about = "WSN testbed control server")]
struct Args {
    /// Configuration file (defaults to ./wsn-server.toml when present).
    #[arg(short, long, env = "WSN_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())
        .map_err(|e| format!("Failed to load configuration: {}", e))?;

    logging::init(&config.logging.level);
    tracing::info!("Starting WSN server");

    let store = Arc::new(Store::open(&config.database.url)?);
    tracing::info!("Opened database {}", config.database.url);

    let transfer = Arc::new(FtpTransfer::new(&config.ftp));
    let addr = config.server.addr();
    let state = Arc::new(AppState::new(config, store, transfer));

    // Failing to bind either socket is fatal.
    let heartbeat = HeartbeatListener::bind(&addr, state.clone()).await?;
    let commands = CommandServer::bind(&addr, state.clone()).await?;
    tracing::info!("Listening on {} (UDP heartbeats, TCP commands)", addr);

    let cancel = CancellationToken::new();
    let heartbeat_task = tokio::spawn(heartbeat.run(cancel.clone()));
    let command_task = tokio::spawn(commands.run(cancel.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    cancel.cancel();

    let (heartbeat_result, command_result) = tokio::join!(heartbeat_task, command_task);
    if let Err(e) = heartbeat_result {
        tracing::error!("Heartbeat listener panicked: {}", e);
    }
    if let Err(e) = command_result {
        tracing::error!("Command server panicked: {}", e);
    }
    Ok(())
}
