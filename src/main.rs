use jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use lazy_static::lazy_static;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod bridge;
mod config;
mod ingress;
mod node;
mod shared;

/// Max length of a single line received from a miner.
const MAX_LEN_DOWN_MSG: u32 = 10000;
/// Lines buffered between the ingress and a session worker, and pending connections.
const DOWNSTREAM_BUFFER_SIZE: usize = 32;
/// Jobs buffered per session before the registry drops it as stalled.
const JOB_QUEUE_SIZE: usize = 16;
const TEMPLATE_QUEUE_SIZE: usize = 8;
const WRITE_TIMEOUT_SECS: u64 = 10;
const NETWORK_STATS_INTERVAL_SECS: u64 = 30;
const STATS_PRINT_INTERVAL_SECS: u64 = 10;
const DEFAULT_LOCAL_NETWORK_DIFFICULTY: f64 = 1_000_000.0;

lazy_static! {
    static ref BRIDGE_CONFIG_PATH: Option<String> = std::env::var("BRIDGE_CONFIG").ok();
    static ref LOCAL_NETWORK_DIFFICULTY: f64 = std::env::var("LOCAL_NETWORK_DIFFICULTY")
        .ok()
        .and_then(|d| d.parse().ok())
        .unwrap_or(DEFAULT_LOCAL_NETWORK_DIFFICULTY);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match config::BridgeConfig::load(BRIDGE_CONFIG_PATH.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    config.log_summary();

    let node = Arc::new(node::local::LocalNode::new(*LOCAL_NETWORK_DIFFICULTY));
    let stats = Arc::new(bridge::stats::WorkerStats::new());
    let shutdown = CancellationToken::new();

    let bridge = match bridge::start(config, node, stats, shutdown.clone()).await {
        Ok(bridge) => {
            info!("Bridge listening on {}", bridge.local_addr);
            bridge
        }
        Err(e) => {
            error!("Impossible to start bridge: {}", e);
            std::process::exit(1);
        }
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received, shutting down"),
        Err(e) => error!("Unable to listen for shutdown signal: {}", e),
    }
    shutdown.cancel();
    bridge.stop().await;
}
