use clap::Parser;
use relay_common::logging::init_logging;
use relay_http_bridge::{RelayConfig, start_relay};
use std::net::SocketAddr;

/// HTTP-over-WebSocket relay.
///
/// Backends dial in at `/ws/{name}`; HTTP requests to `/r/{name}/...` are
/// tunnelled to them and their responses replayed to the caller.
#[derive(Parser, Debug)]
#[command(name = "relay_http_bridge")]
#[command(version, about)]
struct Args {
    /// Address to bind the HTTP server.
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind_addr: SocketAddr,

    /// Seconds between heartbeat pings. Falls back to RELAY_HEARTBEAT_INTERVAL_SECS, then 60.
    #[arg(long)]
    heartbeat_interval_secs: Option<u64>,

    /// Refuse relayed responses whose body is larger than this many bytes.
    #[arg(long)]
    max_response_bytes: Option<usize>,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs to a daily rolling file instead of stderr.
    #[arg(long)]
    log_to_file: bool,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        let defaults = RelayConfig::default();
        RelayConfig {
            bind_addr: self.bind_addr,
            heartbeat_interval_secs: self
                .heartbeat_interval_secs
                .unwrap_or(defaults.heartbeat_interval_secs),
            max_response_bytes: self.max_response_bytes,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_to_file)?;

    let config = args.into_config();
    tracing::info!("Starting relay on {}", config.bind_addr);

    start_relay(config).await?;
    Ok(())
}
