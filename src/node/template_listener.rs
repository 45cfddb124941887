use super::{BlockTemplate, NodeApi};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Delay between sync checks while the node reports it is not synced.
const SYNC_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TemplateListenerConfig {
    /// Fallback poll interval used when no push notification arrives.
    pub block_wait_time: Duration,
    pub payout_address: String,
    pub client_tag: String,
}

/// Blocks until the node reports it is synced. Returns `false` if shutdown was requested first.
pub async fn wait_for_sync(node: &dyn NodeApi, shutdown: &CancellationToken) -> bool {
    let mut warned = false;
    loop {
        match node.is_synced().await {
            Ok(true) => {
                if warned {
                    info!("Node synced, resuming job distribution");
                }
                return true;
            }
            Ok(false) => {
                if !warned {
                    warn!("Node is not synced, withholding jobs until it is");
                    warned = true;
                }
            }
            Err(e) => {
                error!("Error checking node sync state, attempting reconnect: {}", e);
                warned = true;
                if let Err(e) = node.reconnect().await {
                    error!("Error reconnecting to node, waiting before retry: {}", e);
                }
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep(SYNC_RETRY_INTERVAL) => {}
        }
    }
}

enum Trigger {
    /// `false` once the push channel has closed.
    Push(bool),
    Timer,
}

async fn next_push(push: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match push {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// Merges the node's push notifications and a fallback timer into a single "template
/// available" event, fetches a template for each event and forwards it to the job manager.
pub async fn run(
    node: Arc<dyn NodeApi>,
    templates: mpsc::Sender<BlockTemplate>,
    config: TemplateListenerConfig,
    shutdown: CancellationToken,
) {
    let mut push = Some(node.subscribe_new_templates());
    let mut ticker = interval(config.block_wait_time);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Starting block template listener");
    loop {
        let trigger = tokio::select! {
            _ = shutdown.cancelled() => None,
            event = next_push(&mut push) => Some(Trigger::Push(event.is_some())),
            _ = ticker.tick() => Some(Trigger::Timer),
        };
        match trigger {
            None => {
                warn!("Shutdown requested, stopping block template listener");
                return;
            }
            Some(Trigger::Push(false)) => {
                warn!(
                    "Node template notifications closed, polling every {:?}",
                    config.block_wait_time
                );
                push = None;
                continue;
            }
            Some(Trigger::Push(true)) => ticker.reset(),
            Some(Trigger::Timer) => {}
        }

        if !wait_for_sync(node.as_ref(), &shutdown).await {
            return;
        }
        match node
            .get_template(&config.payout_address, &config.client_tag)
            .await
        {
            Ok(template) => {
                if templates.send(template).await.is_err() {
                    warn!("Job manager dropped, stopping block template listener");
                    return;
                }
            }
            Err(e) => warn!("{}", e),
        }
    }
}
