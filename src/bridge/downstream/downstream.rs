use super::{
    accept_connection::start_accept_connection, diff_management::VarDiff,
    receive_from_downstream::start_receive_downstream, task_manager::TaskManager, StratumError,
};
use crate::{
    bridge::{
        codec::{Message, Notification, Request, Response, NOTIFY, SET_DIFFICULTY, SET_EXTRANONCE},
        error::{BridgeResult, Error},
        pow::target_from_difficulty,
        share_validator::{nonce_from_submission, BlockSubmission, SeenShares, Share, ShareOutcome},
        stats::RejectReason,
        BridgeContext,
    },
    config::{DifficultyMode, NONCE_SIZE},
    shared::utils::{AbortOnDrop, Mutex},
};
use bitcoin::util::uint::Uint256;
use serde_json::{json, Value};
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::{
    sync::mpsc::{Receiver, Sender},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connected,
    Subscribed,
    /// Authorized sessions receive jobs.
    Authorized,
}

/// `<address>.<worker>` as sent in `mining.authorize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerName {
    pub address: String,
    pub worker: String,
}

impl WorkerName {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (address, worker) = match raw.split_once('.') {
            Some((address, worker)) => (address, worker),
            None => (raw, ""),
        };
        // bech32 style addresses carry a network prefix before the colon
        let body = match address.split_once(':') {
            Some((prefix, body)) if !prefix.is_empty() => body,
            Some(_) => return None,
            None => address,
        };
        let valid_char = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';
        if body.is_empty() || !body.chars().all(valid_char) {
            return None;
        }
        let worker = if worker.is_empty() { "default" } else { worker };
        Some(Self {
            address: address.to_string(),
            worker: worker.to_string(),
        })
    }
}

impl fmt::Display for WorkerName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.address, self.worker)
    }
}

/// State of one miner connection. Owned by the connection's worker task, only shared tables are
/// reached through the [`BridgeContext`].
pub struct Downstream {
    pub(super) connection_id: u32,
    pub(super) host: SocketAddr,
    pub(super) state: SessionState,
    subscribed: bool,
    extranonce: Vec<u8>,
    worker: Option<WorkerName>,
    /// Software name/version the miner declared on subscribe.
    remote_app: String,
    pub(super) difficulty: f64,
    target: Uint256,
    pub(super) vardiff: Option<VarDiff>,
    pub(super) seen_shares: SeenShares,
    /// Id of the last job notified, jobs are only ever sent once and in order.
    pub(super) last_job_sent: u64,
    pub(super) connected_at: Instant,
    pub(super) last_activity: Instant,
    pub(super) ctx: Arc<BridgeContext>,
}

impl Downstream {
    pub fn new(
        ctx: Arc<BridgeContext>,
        connection_id: u32,
        extranonce: Vec<u8>,
        host: SocketAddr,
    ) -> Self {
        let now = Instant::now();
        let vardiff = match ctx.config.difficulty_mode() {
            DifficultyMode::VarDiff => Some(VarDiff::new(&ctx.config, now)),
            DifficultyMode::Network => None,
        };
        let difficulty = vardiff
            .as_ref()
            .map(|v| v.difficulty())
            .unwrap_or(ctx.config.min_share_diff);
        Downstream {
            connection_id,
            host,
            state: SessionState::Connected,
            subscribed: false,
            extranonce,
            worker: None,
            remote_app: String::new(),
            difficulty,
            target: target_from_difficulty(difficulty),
            vardiff,
            seen_shares: SeenShares::default(),
            last_job_sent: 0,
            connected_at: now,
            last_activity: now,
            ctx,
        }
    }

    /// Registers a connection handed over by the ingress and starts its worker.
    pub(super) async fn new_downstream(
        ctx: Arc<BridgeContext>,
        task_manager: Arc<Mutex<TaskManager>>,
        send_to_down: Sender<String>,
        recv_from_down: Receiver<String>,
        host: SocketAddr,
        shutdown: CancellationToken,
    ) -> BridgeResult<()> {
        let (connection_id, extranonce, jobs) = ctx.registry.register(host)?;
        info!(
            "Opening connection {} for {} with extranonce `{}`",
            connection_id,
            host,
            hex::encode(&extranonce)
        );
        let downstream = Downstream::new(ctx, connection_id, extranonce, host);
        start_receive_downstream(
            task_manager,
            downstream,
            recv_from_down,
            send_to_down,
            jobs,
            shutdown,
        )
        .await
    }

    /// Accept connections from the ingress and create a new `Downstream` for each of them.
    pub async fn accept_connections(
        ctx: Arc<BridgeContext>,
        downstreams: Receiver<(Sender<String>, Receiver<String>, SocketAddr)>,
        shutdown: CancellationToken,
    ) -> BridgeResult<AbortOnDrop> {
        let task_manager = TaskManager::initialize();
        let abortable = task_manager
            .safe_lock(|t| t.get_aborter())?
            .ok_or(Error::ChannelClosed)?;
        start_accept_connection(task_manager, ctx, downstreams, shutdown).await?;
        Ok(abortable)
    }

    pub fn is_authorized(&self) -> bool {
        self.state == SessionState::Authorized
    }

    pub fn worker_name(&self) -> String {
        match &self.worker {
            Some(name) => name.to_string(),
            None => format!("<unauthorized {}>", self.host),
        }
    }

    pub(super) fn set_difficulty(&mut self, difficulty: f64) {
        self.difficulty = difficulty;
        self.target = target_from_difficulty(difficulty);
        self.ctx
            .stats
            .difficulty_changed(&self.worker_name(), difficulty);
    }

    /// Handles one decoded line and returns what has to be written back, in order.
    pub async fn handle_message(&mut self, message: Message) -> BridgeResult<Vec<Message>> {
        match message {
            Message::Request(request) => self.handle_request(request).await,
            Message::Notification(notification) => {
                debug!(
                    "Downstream {}: ignoring notification {}",
                    self.connection_id, notification.method
                );
                Ok(vec![])
            }
            Message::Response(response) => {
                debug!(
                    "Downstream {}: ignoring response to {}",
                    self.connection_id, response.id
                );
                Ok(vec![])
            }
        }
    }

    async fn handle_request(&mut self, request: Request) -> BridgeResult<Vec<Message>> {
        let Request { id, method, params } = request;
        match method.as_str() {
            "mining.subscribe" => Ok(self.handle_subscribe(id, &params)),
            "mining.authorize" => self.handle_authorize(id, &params),
            "mining.submit" => self.handle_submit(id, &params).await,
            "mining.extranonce.subscribe" => Ok(vec![Response::ok(id, Value::Bool(true)).into()]),
            other => {
                warn!(
                    "Downstream {}: unknown method {}",
                    self.connection_id, other
                );
                Ok(vec![
                    StratumError::Other("Unknown method".to_string()).response(id)
                ])
            }
        }
    }

    fn handle_subscribe(&mut self, id: Value, params: &[Value]) -> Vec<Message> {
        if self.subscribed {
            return vec![StratumError::AlreadySubscribed.response(id)];
        }
        self.remote_app = params
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.subscribed = true;
        if self.state == SessionState::Connected {
            self.state = SessionState::Subscribed;
        }
        info!(
            "Downstream {}: subscribed from {} running `{}`",
            self.connection_id, self.host, self.remote_app
        );
        let subscription_id = super::new_subscription_id(self.connection_id);
        let result = json!([
            [
                [SET_DIFFICULTY, subscription_id],
                [NOTIFY, subscription_id]
            ],
            hex::encode(&self.extranonce),
            NONCE_SIZE - self.extranonce.len(),
        ]);
        vec![Response::ok(id, result).into()]
    }

    fn handle_authorize(&mut self, id: Value, params: &[Value]) -> BridgeResult<Vec<Message>> {
        match self.state {
            SessionState::Authorized => {
                // Answering true would let the miner think a second identity is mining here.
                warn!(
                    "Downstream {} is trying to authorize again, this should not happen",
                    self.connection_id
                );
                return Ok(vec![Response::ok(id, Value::Bool(false)).into()]);
            }
            SessionState::Connected if !self.ctx.config.subscribe_optional => {
                return Ok(vec![StratumError::NotSubscribed.response(id)]);
            }
            _ => (),
        }
        let name = match params.first().and_then(Value::as_str).and_then(WorkerName::parse) {
            Some(name) => name,
            None => {
                warn!(
                    "Downstream {}: invalid address in authorize {:?}",
                    self.connection_id,
                    params.first()
                );
                return Ok(vec![StratumError::InvalidAddress.response(id)]);
            }
        };
        self.ctx.registry.activate(self.connection_id)?;
        info!(
            "Downstream {}: authorized {} from {}",
            self.connection_id, name, self.host
        );
        self.worker = Some(name);
        self.state = SessionState::Authorized;
        self.ctx.stats.session_opened(&self.worker_name());

        let mut messages = vec![Response::ok(id, Value::Bool(true)).into()];
        if !self.extranonce.is_empty() {
            messages.push(
                Notification::new(
                    SET_EXTRANONCE,
                    vec![
                        Value::from(hex::encode(&self.extranonce)),
                        Value::from(NONCE_SIZE - self.extranonce.len()),
                    ],
                )
                .into(),
            );
        }
        messages.extend(self.initial_work()?);
        Ok(messages)
    }

    async fn handle_submit(&mut self, id: Value, params: &[Value]) -> BridgeResult<Vec<Message>> {
        if !self.is_authorized() {
            let error = if self.state == SessionState::Connected
                && !self.ctx.config.subscribe_optional
            {
                StratumError::NotSubscribed
            } else {
                StratumError::Unauthorized
            };
            return Ok(vec![error.response(id)]);
        }
        let job_id = match params.get(1) {
            Some(Value::String(job_id)) => job_id.clone(),
            Some(Value::Number(job_id)) => job_id.to_string(),
            _ => {
                return Ok(vec![
                    StratumError::Other("Invalid job id".to_string()).response(id)
                ])
            }
        };
        let nonce = match params
            .get(2)
            .and_then(Value::as_str)
            .and_then(|nonce| nonce_from_submission(&self.extranonce, nonce))
        {
            Some(nonce) => nonce,
            None => {
                self.ctx
                    .stats
                    .share_rejected(&self.worker_name(), RejectReason::Invalid);
                return Ok(vec![
                    StratumError::Other("Invalid nonce".to_string()).response(id)
                ]);
            }
        };
        let share = Share { job_id, nonce };
        let outcome = self
            .ctx
            .validator
            .validate(&share, &self.target, &mut self.seen_shares)
            .await?;
        Ok(vec![self.on_share_outcome(id, &share, outcome)])
    }

    fn on_share_outcome(&mut self, id: Value, share: &Share, outcome: ShareOutcome) -> Message {
        match outcome {
            ShareOutcome::Accepted { block } => {
                let worker = self.worker_name();
                if let Some(vardiff) = self.vardiff.as_mut() {
                    vardiff.record_share();
                }
                self.ctx.stats.share_accepted(&worker, self.difficulty);
                if let Some(BlockSubmission::Submitted { height }) = block {
                    info!("Block found by {} at height {}", worker, height);
                    self.ctx.stats.block_found(&worker, height);
                }
                Response::ok(id, Value::Bool(true)).into()
            }
            ShareOutcome::LowDifficulty => {
                // the miner still did work at its assigned difficulty
                if let Some(vardiff) = self.vardiff.as_mut() {
                    vardiff.record_share();
                }
                self.reject(
                    id,
                    share,
                    RejectReason::LowDifficulty,
                    StratumError::LowDifficultyShare,
                )
            }
            ShareOutcome::Duplicate => self.reject(
                id,
                share,
                RejectReason::Duplicate,
                StratumError::DuplicateShare,
            ),
            ShareOutcome::Stale => {
                self.reject(id, share, RejectReason::Stale, StratumError::StaleJob)
            }
            ShareOutcome::Invalid => {
                self.reject(id, share, RejectReason::Invalid, StratumError::JobNotFound)
            }
        }
    }

    fn reject(
        &self,
        id: Value,
        share: &Share,
        reason: RejectReason,
        error: StratumError,
    ) -> Message {
        let worker = self.worker_name();
        debug!(
            "Downstream {}: {} share for job {} nonce {:016x}",
            worker, reason, share.job_id, share.nonce
        );
        self.ctx.stats.share_rejected(&worker, reason);
        error.response(id)
    }
}
