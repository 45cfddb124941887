//! Interface to the blockchain node the bridge mines against.
//!
//! The node's own RPC wire format lives behind [`NodeApi`]; the bridge only sees block
//! templates going in and solved blocks going out.

pub mod local;
pub mod network_stats;
pub mod template_listener;

use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Block construction data handed out by the node.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockTemplate {
    /// Hash of the header with nonce and timestamp zeroed.
    pub pre_pow_hash: [u8; 32],
    /// Header timestamp in milliseconds.
    pub timestamp: u64,
    pub network_difficulty: f64,
    pub height: u64,
    /// Serialized block, opaque to the bridge, returned verbatim on submission.
    pub block: Vec<u8>,
}

/// A block whose proof of work clears the network target.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockCandidate {
    pub job_id: u64,
    pub height: u64,
    pub nonce: u64,
    pub pow_hash: [u8; 32],
    pub block: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkStats {
    pub hashrate: f64,
    pub block_count: u64,
    pub difficulty: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeError {
    TemplateFetch(String),
    Submit(String),
    NotSynced,
    Connection(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::TemplateFetch(e) => write!(f, "failed fetching new block template: {}", e),
            NodeError::Submit(e) => write!(f, "block submission failed: {}", e),
            NodeError::NotSynced => write!(f, "node is not synced"),
            NodeError::Connection(e) => write!(f, "node connection error: {}", e),
        }
    }
}

impl std::error::Error for NodeError {}

#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn get_template(
        &self,
        payout_address: &str,
        client_tag: &str,
    ) -> Result<BlockTemplate, NodeError>;

    async fn submit_block(&self, candidate: BlockCandidate) -> Result<(), NodeError>;

    async fn is_synced(&self) -> Result<bool, NodeError>;

    async fn reconnect(&self) -> Result<(), NodeError>;

    async fn network_stats(&self) -> Result<NetworkStats, NodeError>;

    /// Channel ticking whenever the node has a new template available.
    fn subscribe_new_templates(&self) -> mpsc::Receiver<()>;
}
