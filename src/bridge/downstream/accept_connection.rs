use super::{downstream::Downstream, task_manager::TaskManager};
use crate::{
    bridge::{error::BridgeResult, BridgeContext},
    shared::utils::Mutex,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub async fn start_accept_connection(
    task_manager: Arc<Mutex<TaskManager>>,
    ctx: Arc<BridgeContext>,
    mut downstreams: Receiver<(Sender<String>, Receiver<String>, SocketAddr)>,
    shutdown: CancellationToken,
) -> BridgeResult<()> {
    let handle = {
        let task_manager = task_manager.clone();
        task::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = downstreams.recv() => next,
                };
                let Some((send, recv, addr)) = next else {
                    warn!("Ingress dropped, no more connections will be accepted");
                    break;
                };
                info!("Bridge opening connection for ip {}", addr);
                if let Err(e) = Downstream::new_downstream(
                    ctx.clone(),
                    task_manager.clone(),
                    send,
                    recv,
                    addr,
                    shutdown.clone(),
                )
                .await
                {
                    error!("Impossible to open connection for {}: {}", addr, e);
                }
            }
        })
    };
    TaskManager::add_accept_connection(task_manager, handle.into()).await
}
