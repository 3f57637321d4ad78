use std::time::Duration;

use airwave_client::{
    AirwaveClient, ClientConfig, HeadlessDevice, NullSink, ReconnectPolicy, UiEvent,
};
use airwave_common::{init_logging, LogOutput};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "airwave-listen", about = "Headless Airwave listener")]
struct Args {
    /// Gateway signaling endpoint
    #[arg(long, env = "AIRWAVE_SIGNALING_URL", default_value = "ws://127.0.0.1:3001/ws")]
    url: String,
    /// Stream id to start once the device is ready; omit to only list streams
    #[arg(long)]
    stream: Option<String>,
    #[arg(long, default_value_t = 5)]
    max_reconnects: u32,
    #[arg(long, default_value_t = 3000)]
    reconnect_delay_ms: u64,
    #[arg(long, default_value_t = 1000)]
    stats_interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the event stream
    init_logging("info", LogOutput::Stderr);

    let args = Args::parse();
    let mut config = ClientConfig::new(&args.url)?;
    config.reconnect = ReconnectPolicy {
        max_attempts: args.max_reconnects,
        delay: Duration::from_millis(args.reconnect_delay_ms),
    };
    config.stats_interval = Duration::from_millis(args.stats_interval_ms);

    let client = AirwaveClient::new(
        config,
        Box::new(HeadlessDevice::new()),
        Box::new(NullSink::new()),
    );
    let mut events = client.subscribe();
    client.connect().await?;
    info!("connected to {}", args.url);

    let mut wanted = args.stream;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if event == UiEvent::DeviceReady {
                        if let Some(stream_id) = wanted.take() {
                            client.start_consuming(stream_id);
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("dropped {} ui events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    client.disconnect().await;
    Ok(())
}
