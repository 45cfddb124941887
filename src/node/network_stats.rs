use super::NodeApi;
use crate::bridge::stats::{format_hashrate, StatsSink};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Polls the node for network hashrate, block count and difficulty every `interval` and pushes
/// each snapshot to the stats sink. A failed poll is logged and skipped.
pub async fn run(
    node: Arc<dyn NodeApi>,
    stats: Arc<dyn StatsSink>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match node.network_stats().await {
                    Ok(network) => {
                        debug!(
                            "Network hashrate {}, difficulty {}, block count {}",
                            format_hashrate(network.hashrate),
                            network.difficulty,
                            network.block_count
                        );
                        stats.network_stats(network);
                    }
                    Err(e) => warn!("Failed to fetch network stats: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{bridge::stats::WorkerStats, node::local::LocalNode};

    #[tokio::test]
    async fn first_poll_is_pushed_to_the_sink() {
        let node = Arc::new(LocalNode::new(3.0));
        let stats = Arc::new(WorkerStats::new());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(
            node,
            stats.clone(),
            Duration::from_secs(3600),
            shutdown.clone(),
        ));
        for _ in 0..100 {
            if stats.network().difficulty == 3.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.network().difficulty, 3.0);
        shutdown.cancel();
        task.await.unwrap();
    }
}
