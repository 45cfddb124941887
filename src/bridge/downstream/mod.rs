use super::codec::{Message, Response};
use serde_json::Value;
use std::fmt;

pub mod diff_management;
#[allow(clippy::module_inception)]
pub mod downstream;
pub use downstream::Downstream;
mod accept_connection;
mod notify;
mod receive_from_downstream;
mod send_to_downstream;
mod task_manager;

/// This constant is used as a check to ensure clients
/// do not connect and never send a mining.authorize
/// since they will take up a tcp connection but never be allowed to
/// receive jobs. Without the timeout the bridge can be exploited by incoming
/// connections that never authorize and take up compute
const SUBSCRIBE_TIMEOUT_SECS: u64 = 10;

/// Protocol level rejections, sent back to the miner as `[code, message, null]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratumError {
    Other(String),
    JobNotFound,
    StaleJob,
    DuplicateShare,
    LowDifficultyShare,
    Unauthorized,
    NotSubscribed,
    AlreadySubscribed,
    InvalidAddress,
}

impl StratumError {
    pub fn code(&self) -> i32 {
        match self {
            StratumError::Other(_) => 20,
            StratumError::JobNotFound | StratumError::StaleJob => 21,
            StratumError::DuplicateShare => 22,
            StratumError::LowDifficultyShare => 23,
            StratumError::Unauthorized => 24,
            StratumError::NotSubscribed => 25,
            StratumError::AlreadySubscribed => 26,
            StratumError::InvalidAddress => 27,
        }
    }

    pub fn response(&self, id: Value) -> Message {
        Response::error(id, self.code(), &self.to_string()).into()
    }
}

impl fmt::Display for StratumError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StratumError::Other(e) => write!(f, "{}", e),
            StratumError::JobNotFound => write!(f, "Job not found"),
            StratumError::StaleJob => write!(f, "Stale job"),
            StratumError::DuplicateShare => write!(f, "Duplicate share"),
            StratumError::LowDifficultyShare => write!(f, "Low difficulty share"),
            StratumError::Unauthorized => write!(f, "Unauthorized worker"),
            StratumError::NotSubscribed => write!(f, "Not subscribed"),
            StratumError::AlreadySubscribed => write!(f, "Already subscribed"),
            StratumError::InvalidAddress => write!(f, "Invalid wallet address"),
        }
    }
}

pub fn new_subscription_id(connection_id: u32) -> String {
    format!("{:08x}", connection_id)
}
