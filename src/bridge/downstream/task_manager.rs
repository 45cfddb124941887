use std::sync::Arc;

use crate::{
    bridge::error::{BridgeResult, Error},
    shared::utils::{AbortOnDrop, Mutex},
};
use tokio::sync::mpsc;
use tracing::warn;

enum Task {
    AcceptConnection(AbortOnDrop),
    Session(AbortOnDrop),
}

impl Task {
    fn is_finished(&self) -> bool {
        match self {
            Task::AcceptConnection(t) | Task::Session(t) => t.is_finished(),
        }
    }
}

/// Keeps the accept loop and every session worker alive, aborting all of them when the aborter
/// is dropped. Finished sessions are forgotten as new ones come in.
pub struct TaskManager {
    send_task: mpsc::Sender<Task>,
    abort: Option<AbortOnDrop>,
}

impl TaskManager {
    pub fn initialize() -> Arc<Mutex<Self>> {
        let (sender, mut receiver) = mpsc::channel(10);
        let handle = tokio::task::spawn(async move {
            let mut tasks: Vec<Task> = vec![];
            while let Some(task) = receiver.recv().await {
                tasks.retain(|t| !t.is_finished());
                tasks.push(task);
            }
            warn!("Bridge downstream task manager stopped, keep alive tasks");
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

    pub async fn add_session(self_: Arc<Mutex<Self>>, abortable: AbortOnDrop) -> BridgeResult<()> {
        Self::add(self_, Task::Session(abortable)).await
    }

    pub async fn add_accept_connection(
        self_: Arc<Mutex<Self>>,
        abortable: AbortOnDrop,
    ) -> BridgeResult<()> {
        Self::add(self_, Task::AcceptConnection(abortable)).await
    }
}
