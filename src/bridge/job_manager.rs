use super::{
    codec::{Notification, NOTIFY},
    error::BridgeResult,
    pow::target_from_difficulty,
    registry::SessionRegistry,
};
use crate::{node::BlockTemplate, shared::utils::Mutex};
use bitcoin::util::uint::Uint256;
use serde_json::Value;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work derived from one block template. Immutable once broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: u64,
    pub template: BlockTemplate,
    pub network_target: Uint256,
    /// The template builds on a different parent than the previous job.
    pub clean_jobs: bool,
}

impl Job {
    pub fn notify(&self) -> Notification {
        Notification::new(
            NOTIFY,
            vec![
                Value::from(self.id.to_string()),
                Value::from(hex::encode(self.template.pre_pow_hash)),
                Value::from(self.template.timestamp),
                Value::from(self.clean_jobs),
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobLookup {
    Found(Arc<Job>),
    /// Existed but has been evicted from the window.
    Stale,
    /// Never issued, or not a job id at all.
    NotFound,
}

#[derive(Debug)]
struct JobWindow {
    next_id: u64,
    jobs: VecDeque<Arc<Job>>,
    capacity: usize,
}

impl JobWindow {
    fn push(&mut self, template: BlockTemplate) -> Arc<Job> {
        let clean_jobs = self
            .jobs
            .back()
            .map(|last| last.template.height != template.height)
            .unwrap_or(true);
        let job = Arc::new(Job {
            id: self.next_id,
            network_target: target_from_difficulty(template.network_difficulty),
            template,
            clean_jobs,
        });
        self.next_id += 1;
        self.jobs.push_back(job.clone());
        while self.jobs.len() > self.capacity {
            self.jobs.pop_front();
        }
        job
    }

    fn oldest_id(&self) -> u64 {
        self.jobs.front().map(|j| j.id).unwrap_or(self.next_id)
    }

    fn lookup(&self, job_id: &str) -> JobLookup {
        let id = match job_id.parse::<u64>() {
            Ok(id) => id,
            Err(_) => return JobLookup::NotFound,
        };
        if id == 0 || id >= self.next_id {
            return JobLookup::NotFound;
        }
        if id < self.oldest_id() {
            return JobLookup::Stale;
        }
        // ids in the window are contiguous
        match self.jobs.get((id - self.oldest_id()) as usize) {
            Some(job) => JobLookup::Found(job.clone()),
            None => JobLookup::NotFound,
        }
    }
}

/// Turns templates into jobs, keeps the last `capacity` of them and fans each new one out to
/// the active sessions.
#[derive(Debug)]
pub struct JobManager {
    window: Mutex<JobWindow>,
    registry: Arc<SessionRegistry>,
}

impl JobManager {
    pub fn new(capacity: usize, registry: Arc<SessionRegistry>) -> Self {
        Self {
            window: Mutex::new(JobWindow {
                next_id: 1,
                jobs: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
            }),
            registry,
        }
    }

    pub fn submit(&self, template: BlockTemplate) -> BridgeResult<Arc<Job>> {
        let job = self.window.safe_lock(|w| w.push(template))?;
        let delivered = self.registry.broadcast(&job)?;
        debug!(
            "New job {} at height {} sent to {} sessions",
            job.id, job.template.height, delivered
        );
        Ok(job)
    }

    pub fn lookup(&self, job_id: &str) -> BridgeResult<JobLookup> {
        Ok(self.window.safe_lock(|w| w.lookup(job_id))?)
    }

    pub fn latest(&self) -> BridgeResult<Option<Arc<Job>>> {
        Ok(self.window.safe_lock(|w| w.jobs.back().cloned())?)
    }

    /// Lowest job id still accepted for shares.
    pub fn oldest_retained_id(&self) -> BridgeResult<u64> {
        Ok(self.window.safe_lock(|w| w.oldest_id())?)
    }

    /// Consumes templates from the template listener until shutdown or until the listener is
    /// gone.
    pub async fn run(
        self: Arc<Self>,
        mut templates: mpsc::Receiver<BlockTemplate>,
        shutdown: CancellationToken,
    ) {
        loop {
            let template = tokio::select! {
                _ = shutdown.cancelled() => break,
                template = templates.recv() => template,
            };
            let Some(template) = template else {
                warn!("Template listener dropped, job manager stopping");
                break;
            };
            let height = template.height;
            match self.submit(template) {
                Ok(job) if job.clean_jobs => info!("New block template at height {}", height),
                Ok(_) => (),
                Err(e) => {
                    error!("Impossible to create job from template: {}", e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn template(height: u64) -> BlockTemplate {
        BlockTemplate {
            pre_pow_hash: [height as u8; 32],
            timestamp: 1_700_000_000_000 + height,
            network_difficulty: 2.0,
            height,
            block: vec![height as u8],
        }
    }

    fn manager(capacity: usize) -> (Arc<SessionRegistry>, JobManager) {
        let registry = Arc::new(SessionRegistry::new(0, 16));
        (registry.clone(), JobManager::new(capacity, registry))
    }

    #[test]
    fn ids_increase_and_old_jobs_become_stale() {
        let (_, jobs) = manager(3);
        for height in 1..=5 {
            jobs.submit(template(height)).unwrap();
        }
        assert_eq!(jobs.latest().unwrap().unwrap().id, 5);
        assert_eq!(jobs.oldest_retained_id().unwrap(), 3);
        match jobs.lookup("4").unwrap() {
            JobLookup::Found(job) => assert_eq!(job.template.height, 4),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(jobs.lookup("2").unwrap(), JobLookup::Stale);
        assert_eq!(jobs.lookup("1").unwrap(), JobLookup::Stale);
        assert_eq!(jobs.lookup("6").unwrap(), JobLookup::NotFound);
        assert_eq!(jobs.lookup("0").unwrap(), JobLookup::NotFound);
        assert_eq!(jobs.lookup("deadbeef").unwrap(), JobLookup::NotFound);
    }

    #[test]
    fn clean_jobs_only_on_new_height() {
        let (_, jobs) = manager(4);
        assert!(jobs.submit(template(1)).unwrap().clean_jobs);
        assert!(!jobs.submit(template(1)).unwrap().clean_jobs);
        assert!(jobs.submit(template(2)).unwrap().clean_jobs);
    }

    #[test]
    fn notify_params() {
        let (_, jobs) = manager(4);
        let job = jobs.submit(template(1)).unwrap();
        let notify = job.notify();
        assert_eq!(notify.method, NOTIFY);
        assert_eq!(notify.params[0], Value::from("1"));
        assert_eq!(notify.params[1], Value::from(hex::encode([1u8; 32])));
        assert_eq!(notify.params[2], Value::from(1_700_000_000_001u64));
        assert_eq!(notify.params[3], Value::from(true));
    }

    #[tokio::test]
    async fn run_broadcasts_to_active_sessions() {
        let (registry, jobs) = manager(4);
        let jobs = Arc::new(jobs);
        let (id, _, mut session_rx) = registry
            .register("127.0.0.1:1".parse().unwrap())
            .unwrap();
        registry.activate(id).unwrap();

        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(jobs.clone().run(rx, shutdown.clone()));
        tx.send(template(1)).await.unwrap();
        let job = session_rx.recv().await.unwrap();
        assert_eq!(job.id, 1);
        assert_eq!(jobs.latest().unwrap(), Some(job));

        shutdown.cancel();
        task.await.unwrap();
    }
}
