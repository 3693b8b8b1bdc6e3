//! Manages peer connections on behalf of the service fabric: tracks activity,
//! enforces the connection cap, and evicts peers that have gone quiet.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::conf::PeerServiceConf;
use crate::error::Result;
use crate::service::{HealthCheck, Service, ServiceHealth};

/// A single tracked peer connection and its running statistics.
#[derive(Clone, Debug)]
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub pieces_downloaded: u64,
    pub pieces_uploaded: u64,
    pub connection_quality: f64,
}

impl PeerConnection {
    fn new(addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            addr,
            connected_at: now,
            last_activity: now,
            bytes_sent: 0,
            bytes_received: 0,
            pieces_downloaded: 0,
            pieces_uploaded: 0,
            connection_quality: 1.0,
        }
    }
}

#[derive(Default)]
struct Stats {
    total_connections: u64,
    failed_connections: u64,
    total_bytes_sent: u64,
    total_bytes_received: u64,
    total_pieces_downloaded: u64,
    total_pieces_uploaded: u64,
}

struct Shared {
    peers: RwLock<HashMap<SocketAddr, PeerConnection>>,
    stats: Mutex<Stats>,
}

async fn disconnect_locked(shared: &Shared, addr: SocketAddr) {
    let removed = shared.peers.write().await.remove(&addr);
    if let Some(conn) = removed {
        let mut stats = shared.stats.lock().await;
        stats.total_bytes_sent += conn.bytes_sent;
        stats.total_bytes_received += conn.bytes_received;
        stats.total_pieces_downloaded += conn.pieces_downloaded;
        stats.total_pieces_uploaded += conn.pieces_uploaded;
        log::info!("disconnected peer: {}", addr);
    }
}

/// Service for managing peer connections.
pub struct PeerService {
    conf: PeerServiceConf,
    health: Arc<ServiceHealth>,
    shared: Arc<Shared>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerService {
    pub fn new(conf: PeerServiceConf, health: Arc<ServiceHealth>) -> Arc<Self> {
        Arc::new(Self {
            conf,
            health,
            shared: Arc::new(Shared {
                peers: RwLock::new(HashMap::new()),
                stats: Mutex::new(Stats::default()),
            }),
            monitor_task: Mutex::new(None),
        })
    }

    pub async fn connect_peer(&self, addr: SocketAddr) -> bool {
        let mut peers = self.shared.peers.write().await;
        if peers.contains_key(&addr) {
            log::warn!("already connected to peer: {}", addr);
            return true;
        }
        if peers.len() >= self.conf.max_peers {
            log::warn!("peer connection limit reached: {}", self.conf.max_peers);
            return false;
        }
        peers.insert(addr, PeerConnection::new(addr));
        drop(peers);
        self.shared.stats.lock().await.total_connections += 1;
        log::info!("connected to peer: {}", addr);
        true
    }

    pub async fn disconnect_peer(&self, addr: SocketAddr) {
        disconnect_locked(&self.shared, addr).await;
    }

    pub async fn update_activity(
        &self,
        addr: SocketAddr,
        bytes_sent: u64,
        bytes_received: u64,
        pieces_downloaded: u64,
        pieces_uploaded: u64,
    ) {
        if let Some(conn) = self.shared.peers.write().await.get_mut(&addr) {
            conn.last_activity = Instant::now();
            conn.bytes_sent += bytes_sent;
            conn.bytes_received += bytes_received;
            conn.pieces_downloaded += pieces_downloaded;
            conn.pieces_uploaded += pieces_uploaded;
        }
    }

    pub async fn list_peers(&self) -> Vec<PeerConnection> {
        self.shared.peers.read().await.values().cloned().collect()
    }

    pub async fn best_peers(&self, limit: usize) -> Vec<PeerConnection> {
        let mut peers: Vec<PeerConnection> =
            self.shared.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| {
            b.connection_quality
                .partial_cmp(&a.connection_quality)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    (b.pieces_downloaded + b.pieces_uploaded)
                        .cmp(&(a.pieces_downloaded + a.pieces_uploaded))
                })
                .then_with(|| b.last_activity.cmp(&a.last_activity))
        });
        peers.truncate(limit);
        peers
    }
}

impl Service for PeerService {
    fn name(&self) -> &str {
        "peer_service"
    }

    fn health(&self) -> &Arc<ServiceHealth> {
        &self.health
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            log::info!("starting peer service");
            let shared = self.shared.clone();
            let interval = self.conf.monitor_interval;
            let inactivity_timeout = self.conf.inactivity_timeout;
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let stale: Vec<SocketAddr> = shared
                        .peers
                        .read()
                        .await
                        .values()
                        .filter(|c| c.last_activity.elapsed() > inactivity_timeout)
                        .map(|c| c.addr)
                        .collect();
                    for addr in &stale {
                        disconnect_locked(&shared, *addr).await;
                    }
                    log::debug!(
                        "peer monitoring: {} active peers",
                        shared.peers.read().await.len()
                    );
                }
            });
            *self.monitor_task.lock().await = Some(handle);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            log::info!("stopping peer service");
            if let Some(task) = self.monitor_task.lock().await.take() {
                task.abort();
            }
            let addrs: Vec<SocketAddr> = self.shared.peers.read().await.keys().copied().collect();
            for addr in addrs {
                self.disconnect_peer(addr).await;
            }
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFuture<'_, HealthCheck> {
        Box::pin(async move {
            let start = Instant::now();
            let active = self.shared.peers.read().await.len() as f64;
            let stats = self.shared.stats.lock().await;
            let max_peers = self.conf.max_peers.max(1) as f64;
            let healthy =
                active <= max_peers && (stats.failed_connections as f64) < max_peers * 0.5;
            let connection_ratio = active / max_peers;
            let failure_ratio =
                stats.failed_connections as f64 / (stats.total_connections.max(1) as f64);
            let score = (1.0 - connection_ratio - failure_ratio).max(0.0);
            HealthCheck {
                service_name: self.name().to_string(),
                healthy,
                score,
                message: format!(
                    "active: {}, failed: {}",
                    active as u64, stats.failed_connections
                ),
                timestamp: Instant::now(),
                response_time: start.elapsed(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn conf() -> PeerServiceConf {
        PeerServiceConf {
            max_peers: 2,
            connection_timeout: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn connect_peer_respects_max_peers() {
        let svc = PeerService::new(conf(), ServiceHealth::new(5, Duration::from_secs(60)));
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        let c: SocketAddr = "127.0.0.1:3".parse().unwrap();
        assert!(svc.connect_peer(a).await);
        assert!(svc.connect_peer(b).await);
        assert!(!svc.connect_peer(c).await);
    }

    #[tokio::test]
    async fn reconnecting_same_peer_is_a_no_op_success() {
        let svc = PeerService::new(conf(), ServiceHealth::new(5, Duration::from_secs(60)));
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(svc.connect_peer(a).await);
        assert!(svc.connect_peer(a).await);
        assert_eq!(svc.list_peers().await.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_removes_peer() {
        let svc = PeerService::new(conf(), ServiceHealth::new(5, Duration::from_secs(60)));
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        svc.connect_peer(a).await;
        svc.disconnect_peer(a).await;
        assert!(svc.list_peers().await.is_empty());
    }

    #[tokio::test]
    async fn health_check_reflects_connection_count() {
        let svc = PeerService::new(conf(), ServiceHealth::new(5, Duration::from_secs(60)));
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        svc.connect_peer(a).await;
        let check = svc.health_check().await;
        assert!(check.healthy);
        assert!(check.message.contains("active: 1"));
    }
}
