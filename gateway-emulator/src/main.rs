use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wsn_common::Heartbeat;

use gateway_emulator::{telemetry, CommandResponder, Config, HeartbeatSender};

#[derive(Debug, Parser)]
#[command(name = "gateway-emulator", version, about = "WSN gateway emulator")]
struct Args {
    /// Configuration file (defaults to ./gateway-emulator.toml when present).
    #[arg(short, long, env = "EMU_CONFIG")]
    config: Option<String>,

    /// Node ids to emit telemetry for.
    #[arg(long, value_delimiter = ',')]
    telemetry_nodes: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(args.config.as_deref())
        .map_err(|e| format!("Failed to load configuration: {}", e))?;
    tracing::info!(gateway_id = %config.gateway.id, "Starting gateway emulator");

    let responder = CommandResponder::bind(
        &format!("0.0.0.0:{}", config.gateway.port),
        config.behavior.fail_nodes.clone(),
        Duration::from_millis(config.behavior.reply_delay_ms),
    )
    .await?;
    tracing::info!("Answering node operations on {}", responder.local_addr()?);

    let heartbeat = Heartbeat {
        gateway_id: config.gateway.id.clone(),
        ip: config.gateway.ip.clone(),
        port: config.gateway.port,
        sequence: config.gateway.sequence,
    };
    let sender = HeartbeatSender::new(
        config.server.addr(),
        heartbeat,
        Duration::from_secs(config.heartbeat_interval_secs),
    );

    let cancel = CancellationToken::new();
    let responder_task = tokio::spawn(responder.run(cancel.clone()));
    let heartbeat_task = tokio::spawn(sender.run(cancel.clone()));
    let telemetry_task = match config.behavior.telemetry_interval_secs {
        Some(secs) if !args.telemetry_nodes.is_empty() => Some(tokio::spawn(telemetry::run(
            config.server.addr(),
            args.telemetry_nodes.clone(),
            Duration::from_secs(secs),
            cancel.clone(),
        ))),
        _ => None,
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    cancel.cancel();

    let _ = responder_task.await;
    match heartbeat_task.await {
        Ok(Err(e)) => tracing::error!("Heartbeat sender failed: {}", e),
        Err(e) => tracing::error!("Heartbeat sender panicked: {}", e),
        Ok(Ok(())) => {}
    }
    if let Some(task) = telemetry_task {
        let _ = task.await;
    }
    Ok(())
}
