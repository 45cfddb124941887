use super::{
    diff_management::VARDIFF_TICK, downstream::Downstream,
    send_to_downstream::send_to_downstream, task_manager::TaskManager, SUBSCRIBE_TIMEOUT_SECS,
};
use crate::{
    bridge::{
        codec::decode,
        error::{BridgeResult, Error},
        job_manager::Job,
    },
    shared::utils::Mutex,
};
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task,
    time::{interval_at, sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a session worker stopped.
#[derive(Debug)]
enum Teardown {
    Shutdown,
    MinerDisconnected,
    DroppedByRegistry,
    IdleTimeout,
    AuthorizeTimeout,
    Failed(Error),
}

impl fmt::Display for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Teardown::Shutdown => write!(f, "shutdown"),
            Teardown::MinerDisconnected => write!(f, "miner disconnected"),
            Teardown::DroppedByRegistry => write!(f, "job queue overflow"),
            Teardown::IdleTimeout => write!(f, "idle timeout"),
            Teardown::AuthorizeTimeout => write!(f, "mining.subscribe/mining.authorize timeout"),
            Teardown::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Spawns the worker of one session. It handles the miner's lines one at a time and, in the
/// same loop, the jobs pushed by the registry, so both reach the miner in the order they were
/// produced.
pub(super) async fn start_receive_downstream(
    task_manager: Arc<Mutex<TaskManager>>,
    mut downstream: Downstream,
    mut recv_from_down: mpsc::Receiver<String>,
    send_to_down: mpsc::Sender<String>,
    mut jobs: mpsc::Receiver<Arc<Job>>,
    shutdown: CancellationToken,
) -> BridgeResult<()> {
    let handle = task::spawn(async move {
        let reason = run_session(
            &mut downstream,
            &mut recv_from_down,
            &send_to_down,
            &mut jobs,
            &shutdown,
        )
        .await;
        downstream.ctx.registry.deregister(downstream.connection_id);
        debug!(
            "{} sessions still connected",
            downstream.ctx.registry.len()
        );
        if downstream.is_authorized() {
            downstream
                .ctx
                .stats
                .session_closed(&downstream.worker_name());
        }
        match reason {
            Teardown::Shutdown | Teardown::MinerDisconnected => info!(
                "Downstream: Shutting down sv1 downstream {} ({}): {}",
                downstream.connection_id, downstream.host, reason
            ),
            _ => warn!(
                "Downstream: Shutting down sv1 downstream {} ({}): {}",
                downstream.connection_id, downstream.host, reason
            ),
        }
    });
    TaskManager::add_session(task_manager, handle.into()).await
}

async fn run_session(
    downstream: &mut Downstream,
    recv_from_down: &mut mpsc::Receiver<String>,
    send_to_down: &mpsc::Sender<String>,
    jobs: &mut mpsc::Receiver<Arc<Job>>,
    shutdown: &CancellationToken,
) -> Teardown {
    let connection_id = downstream.connection_id;
    let idle_timeout = downstream.ctx.config.idle_timeout;
    let var_diff_stats = downstream.ctx.config.var_diff_stats;
    let authorize_deadline =
        downstream.connected_at + Duration::from_secs(SUBSCRIBE_TIMEOUT_SECS);
    let mut vardiff_tick = interval_at(Instant::now() + VARDIFF_TICK, VARDIFF_TICK);

    loop {
        let idle_deadline = downstream.last_activity + idle_timeout;
        let authorized = downstream.is_authorized();
        let outgoing = tokio::select! {
            _ = shutdown.cancelled() => return Teardown::Shutdown,
            line = recv_from_down.recv() => {
                let Some(line) = line else {
                    return Teardown::MinerDisconnected;
                };
                downstream.last_activity = Instant::now();
                let message = match decode(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Downstream {}: malformed message `{}`", connection_id, line);
                        return Teardown::Failed(e.into());
                    }
                };
                downstream.handle_message(message).await
            }
            job = jobs.recv() => match job {
                Some(job) => downstream.on_new_job(job),
                None => return Teardown::DroppedByRegistry,
            },
            _ = sleep_until(idle_deadline) => return Teardown::IdleTimeout,
            _ = sleep_until(authorize_deadline), if !authorized => {
                return Teardown::AuthorizeTimeout
            }
            _ = vardiff_tick.tick() => {
                let now = Instant::now();
                if var_diff_stats && authorized {
                    downstream.log_vardiff_stats(now);
                }
                Ok(downstream.try_update_difficulty(now).into_iter().collect())
            }
        };
        let result = match outgoing {
            Ok(messages) => send_to_downstream(send_to_down, messages, connection_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            return Teardown::Failed(e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bridge::{stats::WorkerStats, BridgeContext},
        config::BridgeConfig,
        node::{local::LocalNode, NodeApi},
        shared::utils::AbortOnDrop,
    };
    use serde_json::Value;
    use std::net::SocketAddr;

    struct Session {
        ctx: Arc<BridgeContext>,
        node: Arc<LocalNode>,
        to_session: mpsc::Sender<String>,
        from_session: mpsc::Receiver<String>,
        _aborter: AbortOnDrop,
    }

    async fn spawn_session(config: BridgeConfig) -> Session {
        let node = Arc::new(LocalNode::new(1e12));
        let ctx = BridgeContext::new(config, node.clone(), Arc::new(WorkerStats::new()));
        let host: SocketAddr = "127.0.0.1:3333".parse().unwrap();
        let (connection_id, extranonce, jobs) = ctx.registry.register(host).unwrap();
        let downstream = Downstream::new(ctx.clone(), connection_id, extranonce, host);
        let (to_session, recv_from_down) = mpsc::channel(64);
        let (send_to_down, from_session) = mpsc::channel(64);
        let task_manager = TaskManager::initialize();
        let aborter = task_manager
            .safe_lock(|t| t.get_aborter())
            .unwrap()
            .unwrap();
        start_receive_downstream(
            task_manager,
            downstream,
            recv_from_down,
            send_to_down,
            jobs,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        Session {
            ctx,
            node,
            to_session,
            from_session,
            _aborter: aborter,
        }
    }

    async fn next_json(session: &mut Session) -> Value {
        let line = session.from_session.recv().await.expect("session closed");
        serde_json::from_str(&line).unwrap()
    }

    /// Waits for the worker to drop its end of the line channel.
    async fn closed_after(session: &mut Session) -> Duration {
        let start = Instant::now();
        while session.from_session.recv().await.is_some() {}
        start.elapsed()
    }

    async fn authorize(session: &mut Session) {
        session
            .to_session
            .send(r#"{"id":1,"method":"mining.authorize","params":["wallet.rig",""]}"#.to_string())
            .await
            .unwrap();
        assert_eq!(next_json(session).await["result"], Value::Bool(true));
        assert_eq!(
            next_json(session).await["method"],
            Value::from("mining.set_difficulty")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_closed() {
        let config = BridgeConfig {
            idle_timeout: Duration::from_secs(300),
            ..Default::default()
        };
        let mut session = spawn_session(config).await;
        authorize(&mut session).await;
        assert_eq!(session.ctx.registry.active_count(), 1);

        let elapsed = closed_after(&mut session).await;
        assert!(
            elapsed >= Duration::from_secs(299) && elapsed <= Duration::from_secs(301),
            "closed after {:?}",
            elapsed
        );
        assert_eq!(session.ctx.registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_session_is_closed_after_subscribe_timeout() {
        let mut session = spawn_session(BridgeConfig::default()).await;
        session
            .to_session
            .send(r#"{"id":1,"method":"mining.subscribe","params":[]}"#.to_string())
            .await
            .unwrap();
        assert!(next_json(&mut session).await["error"].is_null());

        let elapsed = closed_after(&mut session).await;
        assert!(
            elapsed <= Duration::from_secs(SUBSCRIBE_TIMEOUT_SECS + 1),
            "closed after {:?}",
            elapsed
        );
        assert!(elapsed >= Duration::from_secs(SUBSCRIBE_TIMEOUT_SECS - 1));
        assert_eq!(session.ctx.registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retarget_and_job_reach_the_miner_in_issue_order() {
        let config = BridgeConfig {
            min_share_diff: 1e6,
            shares_per_min: 20,
            ..Default::default()
        };
        let mut session = spawn_session(config).await;
        let template = session.node.get_template("addr", "tag").await.unwrap();
        let job = session.ctx.jobs.submit(template).unwrap();
        authorize(&mut session).await;
        assert_eq!(next_json(&mut session).await["method"], Value::from("mining.notify"));

        // far below difficulty 1e6, still counted as work done at that difficulty
        for nonce in 0..40u64 {
            let submit = format!(
                r#"{{"id":{},"method":"mining.submit","params":["wallet.rig","{}","{:016x}"]}}"#,
                nonce + 2,
                job.id,
                nonce
            );
            session.to_session.send(submit).await.unwrap();
            assert_eq!(next_json(&mut session).await["error"][0], Value::from(23));
        }

        // the vardiff tick at 30 s sees 80 shares/min and doubles the difficulty
        let retarget = next_json(&mut session).await;
        assert_eq!(retarget["method"], Value::from("mining.set_difficulty"));
        assert_eq!(retarget["params"][0].as_f64(), Some(2e6));

        let template = session.node.get_template("addr", "tag").await.unwrap();
        let next = session.ctx.jobs.submit(template).unwrap();
        let notify = next_json(&mut session).await;
        assert_eq!(notify["method"], Value::from("mining.notify"));
        assert_eq!(notify["params"][0], Value::from(next.id.to_string()));
    }
}
