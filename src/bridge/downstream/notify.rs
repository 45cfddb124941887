use super::Downstream;
use crate::bridge::{
    codec::{Message, Notification},
    error::BridgeResult,
    job_manager::Job,
};
use std::sync::Arc;
use tracing::debug;

impl Downstream {
    /// Difficulty and current job sent right after a successful authorize.
    pub(super) fn initial_work(&mut self) -> BridgeResult<Vec<Message>> {
        let latest = self.ctx.jobs.latest()?;
        if self.vardiff.is_none() {
            if let Some(job) = &latest {
                self.difficulty = job.template.network_difficulty;
            }
        }
        self.set_difficulty(self.difficulty);
        let mut messages = vec![Notification::set_difficulty(self.difficulty).into()];
        if let Some(job) = latest {
            self.last_job_sent = job.id;
            messages.push(job.notify().into());
        }
        Ok(messages)
    }

    /// Turns a job broadcast into the messages for this miner. In network difficulty mode a
    /// `mining.set_difficulty` precedes the notify whenever the job's difficulty differs.
    pub(super) fn on_new_job(&mut self, job: Arc<Job>) -> BridgeResult<Vec<Message>> {
        if job.id <= self.last_job_sent {
            debug!(
                "Downstream {}: job {} already sent",
                self.connection_id, job.id
            );
            return Ok(vec![]);
        }
        self.last_job_sent = job.id;
        self.seen_shares
            .prune_below(self.ctx.jobs.oldest_retained_id()?);
        debug!(
            "Downstream {}: job {}, {} shares tracked",
            self.connection_id,
            job.id,
            self.seen_shares.len()
        );

        let mut messages = Vec::with_capacity(2);
        if self.vardiff.is_none() && job.template.network_difficulty != self.difficulty {
            self.set_difficulty(job.template.network_difficulty);
            messages.push(Notification::set_difficulty(self.difficulty).into());
        }
        messages.push(job.notify().into());
        Ok(messages)
    }
}
