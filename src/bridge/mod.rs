//! The stratum side of the bridge: sessions, jobs, difficulty and share validation.

pub mod codec;
pub mod downstream;
pub mod error;
pub mod job_manager;
pub mod pow;
pub mod registry;
pub mod share_validator;
pub mod stats;
mod task_manager;

use crate::{
    config::BridgeConfig,
    ingress,
    node::{network_stats, template_listener, NodeApi},
    shared::utils::{abort_all, AbortOnDrop},
};
use error::{BridgeResult, Error};
use job_manager::JobManager;
use pow::Sha256dHasher;
use registry::SessionRegistry;
use share_validator::ShareValidator;
use stats::{StatsSink, WorkerStats};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use task_manager::TaskManager;
use tokio::sync::mpsc::channel;
use tokio_util::sync::CancellationToken;

/// Shared tables every session worker reaches into.
pub struct BridgeContext {
    pub config: BridgeConfig,
    pub jobs: Arc<JobManager>,
    pub registry: Arc<SessionRegistry>,
    pub validator: ShareValidator,
    pub stats: Arc<dyn StatsSink>,
}

impl BridgeContext {
    pub fn new(
        config: BridgeConfig,
        node: Arc<dyn NodeApi>,
        stats: Arc<dyn StatsSink>,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new(
            config.extranonce_size,
            crate::JOB_QUEUE_SIZE,
        ));
        let jobs = Arc::new(JobManager::new(config.job_window, registry.clone()));
        let validator = ShareValidator::new(jobs.clone(), node, Arc::new(Sha256dHasher));
        Arc::new(Self {
            config,
            jobs,
            registry,
            validator,
            stats,
        })
    }
}

/// A running bridge. Dropping it aborts every task it started.
pub struct Bridge {
    pub ctx: Arc<BridgeContext>,
    pub local_addr: SocketAddr,
    aborter: AbortOnDrop,
}

impl Bridge {
    /// Aborts every bridge task and waits for them to finish.
    pub async fn stop(self) {
        abort_all(vec![self.aborter]).await;
    }
}

/// Wires the template listener, job manager, stratum listener and stats tasks together.
pub async fn start(
    config: BridgeConfig,
    node: Arc<dyn NodeApi>,
    stats: Arc<WorkerStats>,
    shutdown: CancellationToken,
) -> BridgeResult<Bridge> {
    let task_manager = TaskManager::initialize();
    let abortable = task_manager
        .safe_lock(|t| t.get_aborter())?
        .ok_or(Error::ChannelClosed)?;

    let listen_address = config.listen_socket_addr()?;
    let listener_config = template_listener::TemplateListenerConfig {
        block_wait_time: config.block_wait_time,
        payout_address: config.payout_address.clone(),
        client_tag: config.client_tag.clone(),
    };
    let print_stats = config.print_stats;
    let ctx = BridgeContext::new(config, node.clone(), stats.clone());

    let (templates_tx, templates_rx) = channel(crate::TEMPLATE_QUEUE_SIZE);
    let job_manager = tokio::spawn(ctx.jobs.clone().run(templates_rx, shutdown.clone()));
    TaskManager::add_job_manager(task_manager.clone(), job_manager.into()).await?;

    let template_listener = tokio::spawn(template_listener::run(
        node.clone(),
        templates_tx,
        listener_config,
        shutdown.clone(),
    ));
    TaskManager::add_template_listener(task_manager.clone(), template_listener.into()).await?;

    let network_stats = tokio::spawn(network_stats::run(
        node,
        stats.clone(),
        Duration::from_secs(crate::NETWORK_STATS_INTERVAL_SECS),
        shutdown.clone(),
    ));
    TaskManager::add_network_stats(task_manager.clone(), network_stats.into()).await?;

    if print_stats {
        let reporter = tokio::spawn(stats::run_reporter(
            stats,
            Duration::from_secs(crate::STATS_PRINT_INTERVAL_SECS),
            shutdown.clone(),
        ));
        TaskManager::add_stats_reporter(task_manager.clone(), reporter.into()).await?;
    }

    let (downstreams_tx, downstreams_rx) = channel(crate::DOWNSTREAM_BUFFER_SIZE);
    let downstream_aborter =
        downstream::Downstream::accept_connections(ctx.clone(), downstreams_rx, shutdown.clone())
            .await?;
    TaskManager::add_downstream_listener(task_manager.clone(), downstream_aborter).await?;

    let (local_addr, ingress_aborter) =
        ingress::sv1_ingress::start(listen_address, downstreams_tx, shutdown).await?;
    TaskManager::add_ingress(task_manager, ingress_aborter).await?;

    Ok(Bridge {
        ctx,
        local_addr,
        aborter: abortable,
    })
}
