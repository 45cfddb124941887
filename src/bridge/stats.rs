//! Share and hashrate accounting.
//!
//! The core only pushes events into a [`StatsSink`]; nothing it does depends on the sink
//! succeeding.

use crate::{node::NetworkStats, shared::utils::Mutex};
use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Hashes needed on average to find a difficulty 1 share.
const HASHES_PER_DIFF1: f64 = 4_294_967_296.0;

/// How long a worker without sessions stays in the table.
const OFFLINE_RETENTION: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Stale,
    Invalid,
    Duplicate,
    LowDifficulty,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RejectReason::Stale => write!(f, "stale"),
            RejectReason::Invalid => write!(f, "invalid"),
            RejectReason::Duplicate => write!(f, "duplicate"),
            RejectReason::LowDifficulty => write!(f, "low difficulty"),
        }
    }
}

pub trait StatsSink: Send + Sync {
    /// A session authorized as `worker`. Paired with [`StatsSink::session_closed`].
    fn session_opened(&self, worker: &str);
    fn share_accepted(&self, worker: &str, difficulty: f64);
    fn share_rejected(&self, worker: &str, reason: RejectReason);
    fn block_found(&self, worker: &str, height: u64);
    fn difficulty_changed(&self, worker: &str, difficulty: f64);
    fn network_stats(&self, stats: NetworkStats);
    fn session_closed(&self, worker: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSnapshot {
    pub worker: String,
    pub accepted: u64,
    pub stale: u64,
    pub invalid: u64,
    pub duplicate: u64,
    pub low_difficulty: u64,
    pub blocks: u64,
    pub difficulty: f64,
    /// Hashes per second estimated from accepted work since the worker was first seen.
    pub hashrate: f64,
    pub online: bool,
}

#[derive(Debug)]
struct WorkerCounters {
    accepted: u64,
    stale: u64,
    invalid: u64,
    duplicate: u64,
    low_difficulty: u64,
    blocks: u64,
    difficulty: f64,
    accepted_difficulty: f64,
    first_seen: Instant,
    /// Live sessions authorized under this name.
    sessions: u32,
    offline_since: Option<Instant>,
}

impl WorkerCounters {
    fn new(now: Instant) -> Self {
        Self {
            accepted: 0,
            stale: 0,
            invalid: 0,
            duplicate: 0,
            low_difficulty: 0,
            blocks: 0,
            difficulty: 0.0,
            accepted_difficulty: 0.0,
            first_seen: now,
            sessions: 0,
            offline_since: Some(now),
        }
    }

    fn expired(&self, now: Instant, retention: Duration) -> bool {
        match self.offline_since {
            Some(since) if self.sessions == 0 => now.saturating_duration_since(since) >= retention,
            _ => false,
        }
    }

    fn snapshot(&self, worker: &str, now: Instant) -> WorkerSnapshot {
        let elapsed = now.duration_since(self.first_seen).as_secs_f64();
        let hashrate = if elapsed > 0.0 {
            self.accepted_difficulty * HASHES_PER_DIFF1 / elapsed
        } else {
            0.0
        };
        WorkerSnapshot {
            worker: worker.to_string(),
            accepted: self.accepted,
            stale: self.stale,
            invalid: self.invalid,
            duplicate: self.duplicate,
            low_difficulty: self.low_difficulty,
            blocks: self.blocks,
            difficulty: self.difficulty,
            hashrate,
            online: self.sessions > 0,
        }
    }
}

/// In memory [`StatsSink`] keyed by worker name. Several sessions may share a name, a worker
/// is online while at least one of them is open. Workers offline for longer than the retention
/// period are forgotten.
#[derive(Debug)]
pub struct WorkerStats {
    workers: Mutex<HashMap<String, WorkerCounters>>,
    network: Mutex<NetworkStats>,
    retention: Duration,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::with_retention(OFFLINE_RETENTION)
    }
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            network: Mutex::new(NetworkStats::default()),
            retention,
        }
    }

    fn update<F: FnOnce(&mut WorkerCounters)>(&self, worker: &str, f: F) {
        let now = Instant::now();
        let res = self.workers.safe_lock(|workers| {
            let counters = workers
                .entry(worker.to_string())
                .or_insert_with(|| WorkerCounters::new(now));
            f(counters)
        });
        if res.is_err() {
            warn!("Worker stats lock poisoned, dropping update for {}", worker);
        }
    }

    /// Drops workers that have had no session for the whole retention period.
    pub fn evict_offline(&self) {
        let now = Instant::now();
        let retention = self.retention;
        let res = self.workers.safe_lock(|workers| {
            workers.retain(|_, counters| !counters.expired(now, retention))
        });
        if res.is_err() {
            warn!("Worker stats lock poisoned, skipping eviction");
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let now = Instant::now();
        let mut snapshot = self
            .workers
            .safe_lock(|workers| {
                workers
                    .iter()
                    .map(|(name, counters)| counters.snapshot(name, now))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        snapshot.sort_by(|a, b| a.worker.cmp(&b.worker));
        snapshot
    }

    pub fn network(&self) -> NetworkStats {
        self.network.safe_lock(|n| *n).unwrap_or_default()
    }

    fn log_summary(&self) {
        self.evict_offline();
        let workers = self.snapshot();
        let network = self.network();
        info!("===============================================================================");
        info!(
            "  {:<24} | {:>12} | {:>8} | {:>6} | {:>6} | {:>6}",
            "worker", "hashrate", "diff", "acc", "rej", "blocks"
        );
        let mut total_hashrate = 0.0;
        for w in workers.iter().filter(|w| w.online) {
            total_hashrate += w.hashrate;
            info!(
                "  {:<24} | {:>12} | {:>8.3} | {:>6} | {:>6} | {:>6}",
                w.worker,
                format_hashrate(w.hashrate),
                w.difficulty,
                w.accepted,
                w.stale + w.invalid + w.duplicate + w.low_difficulty,
                w.blocks
            );
        }
        info!(
            "  bridge total {} | network {} at difficulty {:.3}, {} blocks",
            format_hashrate(total_hashrate),
            format_hashrate(network.hashrate),
            network.difficulty,
            network.block_count
        );
        info!("===============================================================================");
    }
}

impl StatsSink for WorkerStats {
    fn session_opened(&self, worker: &str) {
        self.evict_offline();
        self.update(worker, |c| {
            c.sessions += 1;
            c.offline_since = None;
        });
    }

    fn share_accepted(&self, worker: &str, difficulty: f64) {
        self.update(worker, |c| {
            c.accepted += 1;
            c.accepted_difficulty += difficulty;
        });
    }

    fn share_rejected(&self, worker: &str, reason: RejectReason) {
        self.update(worker, |c| match reason {
            RejectReason::Stale => c.stale += 1,
            RejectReason::Invalid => c.invalid += 1,
            RejectReason::Duplicate => c.duplicate += 1,
            RejectReason::LowDifficulty => c.low_difficulty += 1,
        });
    }

    fn block_found(&self, worker: &str, _height: u64) {
        self.update(worker, |c| c.blocks += 1);
    }

    fn difficulty_changed(&self, worker: &str, difficulty: f64) {
        self.update(worker, |c| c.difficulty = difficulty);
    }

    fn network_stats(&self, stats: NetworkStats) {
        let _ = self.network.safe_lock(|n| *n = stats);
    }

    fn session_closed(&self, worker: &str) {
        let now = Instant::now();
        self.update(worker, |c| {
            c.sessions = c.sessions.saturating_sub(1);
            if c.sessions == 0 {
                c.offline_since = Some(now);
            }
        });
    }
}

pub fn format_hashrate(hashrate: f64) -> String {
    const UNITS: [&str; 7] = ["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s", "EH/s"];
    let mut value = hashrate;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.2}{}", value, UNITS[unit])
}

/// Logs the worker table every `interval` until shutdown.
pub async fn run_reporter(stats: Arc<WorkerStats>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // first tick is immediate, nothing to report yet
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => stats.log_summary(),
        }
    }
}
