use super::{BlockCandidate, BlockTemplate, NetworkStats, NodeApi, NodeError};
use crate::shared::utils::Mutex;
use async_trait::async_trait;
use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::mpsc;
use tracing::{debug, info};

const PUSH_CHANNEL_SIZE: usize = 4;

/// In-process node producing templates on demand, for running the bridge without a chain
/// (regtest style setups) and for tests.
///
/// Each template gets a fresh random pre-PoW hash. Submitted blocks are recorded and advance
/// the height, which also announces a new template to subscribers.
#[derive(Debug)]
pub struct LocalNode {
    network_difficulty: Mutex<f64>,
    synced: AtomicBool,
    height: AtomicU64,
    submitted: Mutex<Vec<BlockCandidate>>,
    subscribers: Mutex<Vec<mpsc::Sender<()>>>,
}

impl LocalNode {
    pub fn new(network_difficulty: f64) -> Self {
        Self {
            network_difficulty: Mutex::new(network_difficulty),
            synced: AtomicBool::new(true),
            height: AtomicU64::new(0),
            submitted: Mutex::new(vec![]),
            subscribers: Mutex::new(vec![]),
        }
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    pub fn set_network_difficulty(&self, difficulty: f64) {
        let _ = self.network_difficulty.safe_lock(|d| *d = difficulty);
        self.announce_new_template();
    }

    pub fn submitted_blocks(&self) -> Vec<BlockCandidate> {
        self.submitted
            .safe_lock(|s| s.clone())
            .unwrap_or_default()
    }

    /// Pushes a "template available" event to every live subscriber. A full queue already holds
    /// a pending event, so nothing is lost by skipping it.
    pub fn announce_new_template(&self) {
        let _ = self.subscribers.safe_lock(|subs| {
            subs.retain(|s| match s.try_send(()) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            })
        });
    }
}

#[async_trait]
impl NodeApi for LocalNode {
    async fn get_template(
        &self,
        payout_address: &str,
        client_tag: &str,
    ) -> Result<BlockTemplate, NodeError> {
        if !self.synced.load(Ordering::SeqCst) {
            return Err(NodeError::NotSynced);
        }
        let network_difficulty = self
            .network_difficulty
            .safe_lock(|d| *d)
            .map_err(|e| NodeError::TemplateFetch(e.to_string()))?;
        let height = self.height.load(Ordering::SeqCst) + 1;
        let pre_pow_hash: [u8; 32] = rand::random();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| NodeError::TemplateFetch(e.to_string()))?
            .as_millis() as u64;
        let mut block = Vec::with_capacity(40 + payout_address.len() + client_tag.len());
        block.extend_from_slice(&height.to_le_bytes());
        block.extend_from_slice(&pre_pow_hash);
        block.extend_from_slice(payout_address.as_bytes());
        block.extend_from_slice(client_tag.as_bytes());
        debug!("Local node built template at height {}", height);
        Ok(BlockTemplate {
            pre_pow_hash,
            timestamp,
            network_difficulty,
            height,
            block,
        })
    }

    async fn submit_block(&self, candidate: BlockCandidate) -> Result<(), NodeError> {
        let current = self.height.load(Ordering::SeqCst);
        if candidate.height != current + 1 {
            return Err(NodeError::Submit(format!(
                "block at height {} is not on the tip (tip is {})",
                candidate.height, current
            )));
        }
        self.height.store(candidate.height, Ordering::SeqCst);
        info!(
            "Local node accepted block at height {} (job {})",
            candidate.height, candidate.job_id
        );
        self.submitted
            .safe_lock(|s| s.push(candidate))
            .map_err(|e| NodeError::Submit(e.to_string()))?;
        self.announce_new_template();
        Ok(())
    }

    async fn is_synced(&self) -> Result<bool, NodeError> {
        Ok(self.synced.load(Ordering::SeqCst))
    }

    async fn reconnect(&self) -> Result<(), NodeError> {
        Ok(())
    }

    async fn network_stats(&self) -> Result<NetworkStats, NodeError> {
        let difficulty = self
            .network_difficulty
            .safe_lock(|d| *d)
            .map_err(|e| NodeError::Connection(e.to_string()))?;
        Ok(NetworkStats {
            // one block per second
            hashrate: difficulty * 4_294_967_296.0,
            block_count: self.height.load(Ordering::SeqCst),
            difficulty,
        })
    }

    fn subscribe_new_templates(&self) -> mpsc::Receiver<()> {
        let (sender, receiver) = mpsc::channel(PUSH_CHANNEL_SIZE);
        let _ = self.subscribers.safe_lock(|subs| subs.push(sender));
        receiver
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn submitted_block_advances_height_and_announces() {
        let node = LocalNode::new(1.0);
        let mut push = node.subscribe_new_templates();
        let template = node.get_template("addr", "tag").await.unwrap();
        assert_eq!(template.height, 1);

        let candidate = BlockCandidate {
            job_id: 1,
            height: template.height,
            nonce: 42,
            pow_hash: [0; 32],
            block: template.block.clone(),
        };
        node.submit_block(candidate.clone()).await.unwrap();
        assert_eq!(node.submitted_blocks(), vec![candidate.clone()]);
        assert!(push.try_recv().is_ok());

        // same height again is no longer on the tip
        assert!(node.submit_block(candidate).await.is_err());
        assert_eq!(node.get_template("addr", "tag").await.unwrap().height, 2);
    }

    #[tokio::test]
    async fn unsynced_node_refuses_templates() {
        let node = LocalNode::new(1.0);
        node.set_synced(false);
        assert!(!node.is_synced().await.unwrap());
        assert_eq!(
            node.get_template("addr", "tag").await,
            Err(NodeError::NotSynced)
        );
        node.set_synced(true);
        assert!(node.get_template("addr", "tag").await.is_ok());
    }
}
