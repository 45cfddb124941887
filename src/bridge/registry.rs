use super::{
    error::{BridgeResult, Error},
    job_manager::Job,
};
use crate::shared::utils::Mutex;
use nohash_hasher::IntMap;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Low `size` bytes of `value`, big endian, and whether `value` just started a new cycle of the
/// `size` byte space.
fn extranonce_from_counter(value: u32, size: u8) -> (Vec<u8>, bool) {
    let bytes = value.to_be_bytes();
    let extranonce = bytes[bytes.len() - size as usize..].to_vec();
    let space = 1u64 << (8 * size as u64);
    let wrapped = value != 0 && (value as u64) % space == 0;
    (extranonce, wrapped)
}

#[derive(Debug)]
struct SessionHandle {
    sender: mpsc::Sender<Arc<Job>>,
    /// Authorized sessions receive job broadcasts, the others are only tracked.
    active: bool,
    addr: SocketAddr,
}

/// Every connected session, indexed by connection id.
///
/// A session whose job queue is full when a broadcast happens is removed, which closes its
/// queue and makes its worker disconnect the miner.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<IntMap<u32, SessionHandle>>,
    next_connection_id: AtomicU32,
    next_extranonce: AtomicU32,
    extranonce_size: u8,
    queue_size: usize,
}

impl SessionRegistry {
    pub fn new(extranonce_size: u8, queue_size: usize) -> Self {
        Self {
            sessions: Mutex::new(IntMap::default()),
            next_connection_id: AtomicU32::new(1),
            next_extranonce: AtomicU32::new(0),
            extranonce_size,
            queue_size,
        }
    }

    fn new_extranonce(&self) -> Vec<u8> {
        if self.extranonce_size == 0 {
            return vec![];
        }
        let value = self.next_extranonce.fetch_add(1, Ordering::Relaxed);
        let (extranonce, wrapped) = extranonce_from_counter(value, self.extranonce_size);
        if wrapped {
            warn!(
                "Wrapped extranonce! New miners share nonce space with older ones (size {})",
                self.extranonce_size
            );
        }
        extranonce
    }

    /// Tracks a new connection. Returns its id, its extranonce and the queue it receives jobs
    /// on once activated.
    pub fn register(&self, addr: SocketAddr) -> BridgeResult<(u32, Vec<u8>, mpsc::Receiver<Arc<Job>>)> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let extranonce = self.new_extranonce();
        let (sender, receiver) = mpsc::channel(self.queue_size);
        self.sessions.safe_lock(|sessions| {
            sessions.insert(
                connection_id,
                SessionHandle {
                    sender,
                    active: false,
                    addr,
                },
            )
        })?;
        debug!(
            "Registered connection {} from {} with extranonce {}",
            connection_id,
            addr,
            hex::encode(&extranonce)
        );
        Ok((connection_id, extranonce, receiver))
    }

    /// Makes an authorized session eligible for job broadcasts.
    pub fn activate(&self, connection_id: u32) -> BridgeResult<()> {
        let found = self.sessions.safe_lock(|sessions| {
            sessions
                .get_mut(&connection_id)
                .map(|handle| handle.active = true)
                .is_some()
        })?;
        if found {
            Ok(())
        } else {
            Err(Error::ChannelClosed)
        }
    }

    pub fn deregister(&self, connection_id: u32) {
        if self
            .sessions
            .safe_lock(|sessions| sessions.remove(&connection_id))
            .is_err()
        {
            warn!("Session registry lock poisoned removing {}", connection_id);
        }
    }

    /// Queues `job` to every active session and returns how many sessions got it. Senders are
    /// cloned under the lock, delivery happens after it is released.
    pub fn broadcast(&self, job: &Arc<Job>) -> BridgeResult<usize> {
        let targets: Vec<(u32, mpsc::Sender<Arc<Job>>)> = self.sessions.safe_lock(|sessions| {
            sessions
                .iter()
                .filter(|(_, handle)| handle.active)
                .map(|(id, handle)| (*id, handle.sender.clone()))
                .collect()
        })?;
        let mut delivered = 0;
        let mut overflowed = vec![];
        for (connection_id, sender) in targets {
            match sender.try_send(job.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => overflowed.push(connection_id),
                Err(TrySendError::Closed(_)) => overflowed.push(connection_id),
            }
        }
        if !overflowed.is_empty() {
            let dropped = self.sessions.safe_lock(|sessions| {
                overflowed
                    .iter()
                    .filter_map(|id| sessions.remove(id).map(|h| (*id, h.addr)))
                    .collect::<Vec<_>>()
            })?;
            for (connection_id, addr) in dropped {
                warn!(
                    "Dropping connection {} from {}: job queue full or closed",
                    connection_id, addr
                );
            }
        }
        Ok(delivered)
    }

    pub fn len(&self) -> usize {
        self.sessions.safe_lock(|s| s.len()).unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .safe_lock(|s| s.values().filter(|h| h.active).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bridge::pow::target_from_difficulty;
    use crate::node::BlockTemplate;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn job(id: u64) -> Arc<Job> {
        Arc::new(Job {
            id,
            template: BlockTemplate {
                pre_pow_hash: [1; 32],
                timestamp: 0,
                network_difficulty: 1.0,
                height: id,
                block: vec![],
            },
            network_target: target_from_difficulty(1.0),
            clean_jobs: true,
        })
    }

    #[test]
    fn extranonces_are_distinct_and_sized() {
        let registry = SessionRegistry::new(2, 4);
        let (id_a, en_a, _rx_a) = registry.register(addr()).unwrap();
        let (id_b, en_b, _rx_b) = registry.register(addr()).unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(en_a.len(), 2);
        assert_ne!(en_a, en_b);

        let registry = SessionRegistry::new(0, 4);
        let (_, en, _rx) = registry.register(addr()).unwrap();
        assert!(en.is_empty());
    }

    #[test]
    fn extranonce_counter_wraps_at_size_boundary() {
        assert_eq!(extranonce_from_counter(0, 1), (vec![0], false));
        assert_eq!(extranonce_from_counter(255, 1), (vec![255], false));
        assert_eq!(extranonce_from_counter(256, 1), (vec![0], true));
        assert_eq!(extranonce_from_counter(257, 1), (vec![1], false));
        assert_eq!(extranonce_from_counter(0xffff, 2), (vec![0xff, 0xff], false));
        assert_eq!(extranonce_from_counter(0x1_0000, 2), (vec![0, 0], true));
        assert_eq!(extranonce_from_counter(0x100_0000, 3), (vec![0, 0, 0], true));

        let registry = SessionRegistry::new(1, 4);
        let mut receivers = vec![];
        let mut first = None;
        for i in 0..257 {
            let (_, extranonce, rx) = registry.register(addr()).unwrap();
            if i == 0 {
                first = Some(extranonce.clone());
            }
            receivers.push(rx);
            if i == 256 {
                assert_eq!(Some(extranonce), first);
            }
        }
    }

    #[test]
    fn broadcast_reaches_only_active_sessions() {
        let registry = SessionRegistry::new(0, 4);
        let (active, _, mut active_rx) = registry.register(addr()).unwrap();
        let (_subscribed, _, mut subscribed_rx) = registry.register(addr()).unwrap();
        registry.activate(active).unwrap();

        assert_eq!(registry.broadcast(&job(1)).unwrap(), 1);
        assert_eq!(active_rx.try_recv().unwrap().id, 1);
        assert!(subscribed_rx.try_recv().is_err());
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn full_or_closed_sessions_are_dropped_without_blocking_others() {
        let registry = SessionRegistry::new(0, 1);
        let (slow, _, mut slow_rx) = registry.register(addr()).unwrap();
        let (gone, _, gone_rx) = registry.register(addr()).unwrap();
        let (healthy, _, mut healthy_rx) = registry.register(addr()).unwrap();
        for id in [slow, gone, healthy] {
            registry.activate(id).unwrap();
        }
        drop(gone_rx);

        assert_eq!(registry.broadcast(&job(1)).unwrap(), 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(healthy_rx.try_recv().unwrap().id, 1);

        // slow session never drained its queue
        assert_eq!(registry.broadcast(&job(2)).unwrap(), 1);
        assert_eq!(healthy_rx.try_recv().unwrap().id, 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(slow_rx.try_recv().unwrap().id, 1);
        assert!(matches!(
            slow_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(registry.activate(slow).is_err());
    }

    #[test]
    fn deregistered_session_gets_nothing() {
        let registry = SessionRegistry::new(0, 4);
        let (id, _, mut rx) = registry.register(addr()).unwrap();
        registry.activate(id).unwrap();
        registry.deregister(id);
        assert_eq!(registry.broadcast(&job(1)).unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }
}
