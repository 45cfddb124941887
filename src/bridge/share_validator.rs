//! Classification of `mining.submit` shares.
//!
//! Checks run in a fixed order: job lookup, proof of work against the session difficulty,
//! duplicate detection, and finally the network target. Only shares clearing the network target
//! reach the node.

use super::{
    error::BridgeResult,
    job_manager::{Job, JobLookup, JobManager},
    pow::{hash_difficulty, hash_to_uint, PowHasher},
};
use crate::{
    config::NONCE_SIZE,
    node::{BlockCandidate, NodeApi, NodeError},
};
use bitcoin::util::uint::Uint256;
use std::{collections::HashSet, sync::Arc};
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub job_id: String,
    /// Full nonce, extranonce prefix included.
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockSubmission {
    Submitted { height: u64 },
    Rejected { height: u64, error: NodeError },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShareOutcome {
    /// `block` is set when the share also cleared the network target.
    Accepted { block: Option<BlockSubmission> },
    Stale,
    Invalid,
    Duplicate,
    LowDifficulty,
}

/// (job id, nonce) pairs already accepted on one session.
#[derive(Debug, Default)]
pub struct SeenShares(HashSet<(u64, u64)>);

impl SeenShares {
    /// Returns `false` if the pair was already present.
    pub fn insert(&mut self, job_id: u64, nonce: u64) -> bool {
        self.0.insert((job_id, nonce))
    }

    /// Forgets shares of jobs that can no longer be looked up.
    pub fn prune_below(&mut self, oldest_job_id: u64) {
        self.0.retain(|(job_id, _)| *job_id >= oldest_job_id);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Rebuilds the 64 bit nonce from the hex digits a miner submitted. Miners with an extranonce
/// only send the remaining digits, which are left padded and prefixed with the extranonce.
pub fn nonce_from_submission(extranonce: &[u8], submitted: &str) -> Option<u64> {
    let digits = submitted.trim_start_matches("0x");
    let available = NONCE_SIZE * 2 - extranonce.len() * 2;
    if digits.is_empty() || digits.len() > available {
        return None;
    }
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let full = format!(
        "{}{:0>width$}",
        hex::encode(extranonce),
        digits,
        width = available
    );
    u64::from_str_radix(&full, 16).ok()
}

pub struct ShareValidator {
    jobs: Arc<JobManager>,
    node: Arc<dyn NodeApi>,
    hasher: Arc<dyn PowHasher>,
}

impl ShareValidator {
    pub fn new(jobs: Arc<JobManager>, node: Arc<dyn NodeApi>, hasher: Arc<dyn PowHasher>) -> Self {
        Self {
            jobs,
            node,
            hasher,
        }
    }

    pub async fn validate(
        &self,
        share: &Share,
        session_target: &Uint256,
        seen: &mut SeenShares,
    ) -> BridgeResult<ShareOutcome> {
        let job = match self.jobs.lookup(&share.job_id)? {
            JobLookup::Found(job) => job,
            JobLookup::Stale => return Ok(ShareOutcome::Stale),
            JobLookup::NotFound => return Ok(ShareOutcome::Invalid),
        };

        let pow_hash =
            self.hasher
                .hash(&job.template.pre_pow_hash, job.template.timestamp, share.nonce);
        let pow_value = hash_to_uint(&pow_hash);
        if pow_value > *session_target {
            return Ok(ShareOutcome::LowDifficulty);
        }

        if !seen.insert(job.id, share.nonce) {
            return Ok(ShareOutcome::Duplicate);
        }

        if pow_value > job.network_target {
            return Ok(ShareOutcome::Accepted { block: None });
        }
        let block = self.submit_block(&job, share.nonce, pow_hash).await;
        Ok(ShareOutcome::Accepted { block: Some(block) })
    }

    async fn submit_block(&self, job: &Job, nonce: u64, pow_hash: [u8; 32]) -> BlockSubmission {
        let height = job.template.height;
        info!(
            "Share for job {} clears network target (difficulty {:.3}), submitting block at height {}",
            job.id,
            hash_difficulty(&pow_hash),
            height
        );
        let candidate = BlockCandidate {
            job_id: job.id,
            height,
            nonce,
            pow_hash,
            block: job.template.block.clone(),
        };
        match self.node.submit_block(candidate).await {
            Ok(()) => {
                info!("Block at height {} accepted by node", height);
                BlockSubmission::Submitted { height }
            }
            Err(error) => {
                error!("Block at height {} rejected by node: {}", height, error);
                BlockSubmission::Rejected { height, error }
            }
        }
    }
}
