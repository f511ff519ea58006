use clap::Parser;
use relay_common::logging::init_logging;
use relay_http_client::{ClientClosed, UpstreamHandler, handle_client};
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Backend half of the HTTP relay.
///
/// Dials the relay, registers under the session name in `--relay-url` and forwards
/// every relayed request to `--upstream`. Reconnects with exponential backoff
/// whenever the session ends.
#[derive(Parser, Debug)]
#[command(name = "relay_backend")]
#[command(version, about)]
struct Args {
    /// Relay session endpoint, e.g. ws://relay.example:3000/ws/svc-1
    #[arg(long)]
    relay_url: String,

    /// Origin header sent with the WebSocket handshake.
    #[arg(long, default_value = "http://localhost")]
    origin: String,

    /// Local HTTP origin that serves relayed requests.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    upstream: String,

    /// First delay before reconnecting, in seconds.
    #[arg(long, default_value_t = 1)]
    reconnect_delay_secs: u64,

    /// Upper bound for the reconnect delay, in seconds.
    #[arg(long, default_value_t = 60)]
    reconnect_max_delay_secs: u64,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs to a daily rolling file instead of stderr.
    #[arg(long)]
    log_to_file: bool,
}

/// Doubling reconnect delay with an upper bound.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following one is twice as long.
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_to_file)?;

    let handler = Arc::new(UpstreamHandler::new(&args.upstream)?);
    let mut backoff = Backoff::new(
        Duration::from_secs(args.reconnect_delay_secs),
        Duration::from_secs(args.reconnect_max_delay_secs),
    );

    info!(relay = %args.relay_url, upstream = %args.upstream, "Starting relay backend");

    loop {
        let (closed_tx, closed_rx) = oneshot::channel();
        match handle_client(
            &args.relay_url,
            &args.origin,
            handler.clone(),
            Some(closed_tx),
            None,
        )
        .await
        {
            Ok(client) => {
                backoff.reset();
                info!("Connected to relay");
                tokio::select! {
                    reason = closed_rx => {
                        match reason {
                            Ok(ClientClosed::Shutdown) => return Ok(()),
                            Ok(ClientClosed::ConnectionLost(e)) => warn!("Relay session lost: {}", e),
                            Err(_) => warn!("Relay session ended without a reason"),
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutting down");
                        client.shutdown();
                        client.closed().await;
                        return Ok(());
                    }
                }
            }
            Err(e) => error!("Failed to connect to relay: {}", e),
        }

        let delay = backoff.next_delay();
        info!("Reconnecting in {}s", delay.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
