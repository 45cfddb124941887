use std::sync::Arc;

use super::error::{BridgeResult, Error};
use crate::shared::utils::{AbortOnDrop, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

#[allow(dead_code)]
enum Task {
    Ingress(AbortOnDrop),
    DownstreamListener(AbortOnDrop),
    JobManager(AbortOnDrop),
    TemplateListener(AbortOnDrop),
    NetworkStats(AbortOnDrop),
    StatsReporter(AbortOnDrop),
}

pub struct TaskManager {
    send_task: mpsc::Sender<Task>,
    abort: Option<AbortOnDrop>,
}

impl TaskManager {
    pub fn initialize() -> Arc<Mutex<Self>> {
        let (sender, mut receiver) = mpsc::channel(10);
        let handle = tokio::task::spawn(async move {
            let mut tasks = vec![];
            while let Some(task) = receiver.recv().await {
                tasks.push(task);
            }
            warn!("Bridge main task manager stopped, keep alive tasks");
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(1000)).await;
            }
        });
        Arc::new(Mutex::new(Self {
            send_task: sender,
            abort: Some(handle.into()),
        }))
    }

    pub fn get_aborter(&mut self) -> Option<AbortOnDrop> {
        self.abort.take()
    }

    async fn add(self_: Arc<Mutex<Self>>, task: Task) -> BridgeResult<()> {
        let send_task = self_.safe_lock(|s| s.send_task.clone())?;
        send_task.send(task).await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn add_ingress(self_: Arc<Mutex<Self>>, abortable: AbortOnDrop) -> BridgeResult<()> {
        Self::add(self_, Task::Ingress(abortable)).await
    }
    pub async fn add_downstream_listener(
        self_: Arc<Mutex<Self>>,
        abortable: AbortOnDrop,
    ) -> BridgeResult<()> {
        Self::add(self_, Task::DownstreamListener(abortable)).await
    }
    pub async fn add_job_manager(
        self_: Arc<Mutex<Self>>,
        abortable: AbortOnDrop,
    ) -> BridgeResult<()> {
        Self::add(self_, Task::JobManager(abortable)).await
    }
    pub async fn add_template_listener(
        self_: Arc<Mutex<Self>>,
        abortable: AbortOnDrop,
    ) -> BridgeResult<()> {
        Self::add(self_, Task::TemplateListener(abortable)).await
    }
    pub async fn add_network_stats(
        self_: Arc<Mutex<Self>>,
        abortable: AbortOnDrop,
    ) -> BridgeResult<()> {
        Self::add(self_, Task::NetworkStats(abortable)).await
    }
    pub async fn add_stats_reporter(
        self_: Arc<Mutex<Self>>,
        abortable: AbortOnDrop,
    ) -> BridgeResult<()> {
        Self::add(self_, Task::StatsReporter(abortable)).await
    }
}
