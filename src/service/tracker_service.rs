//! Manages announces to the set of trackers configured for a torrent,
//! marking trackers unhealthy after repeated announce failures.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::conf::TrackerServiceConf;
use crate::error::Result;
use crate::service::{HealthCheck, Service, ServiceHealth};

/// Announce event, mirroring the BitTorrent tracker protocol's `event` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
    None,
}

/// Tracked state for one tracker URL.
#[derive(Clone, Debug)]
pub struct TrackerConnection {
    pub url: String,
    pub last_announce: Option<Instant>,
    pub last_success: Option<Instant>,
    pub failure_count: u32,
    pub is_healthy: bool,
}

impl TrackerConnection {
    fn new(url: String) -> Self {
        Self {
            url,
            last_announce: None,
            last_success: None,
            failure_count: 0,
            is_healthy: true,
        }
    }
}

#[derive(Default)]
struct Stats {
    total_announces: u64,
    successful_announces: u64,
    failed_announces: u64,
    total_peers_discovered: u64,
}

struct Shared {
    trackers: RwLock<HashMap<String, TrackerConnection>>,
    stats: Mutex<Stats>,
}

/// Service for managing tracker communication.
pub struct TrackerService {
    conf: TrackerServiceConf,
    health: Arc<ServiceHealth>,
    shared: Arc<Shared>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl TrackerService {
    pub fn new(conf: TrackerServiceConf, health: Arc<ServiceHealth>) -> Arc<Self> {
        Arc::new(Self {
            conf,
            health,
            shared: Arc::new(Shared {
                trackers: RwLock::new(HashMap::new()),
                stats: Mutex::new(Stats::default()),
            }),
            monitor_task: Mutex::new(None),
        })
    }

    pub async fn add_tracker(&self, url: String) -> bool {
        let mut trackers = self.shared.trackers.write().await;
        if trackers.contains_key(&url) {
            log::warn!("tracker already exists: {}", url);
            return true;
        }
        if trackers.len() >= self.conf.max_trackers {
            log::warn!("tracker limit reached: {}", self.conf.max_trackers);
            return false;
        }
        trackers.insert(url.clone(), TrackerConnection::new(url.clone()));
        log::info!("added tracker: {}", url);
        true
    }

    pub async fn remove_tracker(&self, url: &str) {
        if self.shared.trackers.write().await.remove(url).is_some() {
            log::info!("removed tracker: {}", url);
        }
    }

    pub async fn healthy_trackers(&self) -> Vec<String> {
        self.shared
            .trackers
            .read()
            .await
            .values()
            .filter(|t| t.is_healthy)
            .map(|t| t.url.clone())
            .collect()
    }

    pub async fn tracker_info(&self, url: &str) -> Option<TrackerConnection> {
        self.shared.trackers.read().await.get(url).cloned()
    }

    /// Announces to every healthy tracker and merges the discovered peers.
    ///
    /// `announce_one` performs the actual network exchange for a single
    /// tracker URL and is supplied by the caller so this service stays
    /// transport-agnostic.
    pub async fn announce<F, Fut>(
        &self,
        event: AnnounceEvent,
        announce_one: F,
    ) -> Vec<SocketAddr>
    where
        F: Fn(String, AnnounceEvent) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<SocketAddr>>>,
    {
        let urls: Vec<String> = {
            let trackers = self.shared.trackers.read().await;
            trackers
                .values()
                .filter(|t| t.is_healthy)
                .map(|t| t.url.clone())
                .collect()
        };

        let mut discovered = Vec::new();
        for url in urls {
            let mut stats = self.shared.stats.lock().await;
            stats.total_announces += 1;
            drop(stats);

            match announce_one(url.clone(), event).await {
                Ok(peers) => {
                    let mut trackers = self.shared.trackers.write().await;
                    if let Some(conn) = trackers.get_mut(&url) {
                        let now = Instant::now();
                        conn.last_announce = Some(now);
                        conn.last_success = Some(now);
                        conn.failure_count = 0;
                        conn.is_healthy = true;
                    }
                    drop(trackers);
                    let mut stats = self.shared.stats.lock().await;
                    stats.successful_announces += 1;
                    stats.total_peers_discovered += peers.len() as u64;
                    discovered.extend(peers);
                }
                Err(e) => {
                    log::warn!("announce to {} failed: {}", url, e);
                    let mut trackers = self.shared.trackers.write().await;
                    if let Some(conn) = trackers.get_mut(&url) {
                        conn.last_announce = Some(Instant::now());
                        conn.failure_count += 1;
                        if conn.failure_count >= self.conf.max_failure_count {
                            conn.is_healthy = false;
                        }
                    }
                    drop(trackers);
                    self.shared.stats.lock().await.failed_announces += 1;
                }
            }
        }
        discovered
    }
}

impl Service for TrackerService {
    fn name(&self) -> &str {
        "tracker_service"
    }

    fn health(&self) -> &Arc<ServiceHealth> {
        &self.health
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            log::info!("starting tracker service");
            let shared = self.shared.clone();
            let interval = self.conf.health_check_interval;
            let stale_after = self.conf.default_announce_interval * 2;
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let mut trackers = shared.trackers.write().await;
                    for (url, conn) in trackers.iter_mut() {
                        let stale = match conn.last_success {
                            Some(t) => t.elapsed() > stale_after,
                            None => false,
                        };
                        if stale && conn.is_healthy {
                            conn.is_healthy = false;
                            log::warn!("tracker marked unhealthy: {}", url);
                        }
                    }
                    log::debug!("tracker monitoring: {} trackers", trackers.len());
                }
            });
            *self.monitor_task.lock().await = Some(handle);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            log::info!("stopping tracker service");
            if let Some(task) = self.monitor_task.lock().await.take() {
                task.abort();
            }
            self.shared.trackers.write().await.clear();
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFuture<'_, HealthCheck> {
        Box::pin(async move {
            let start = Instant::now();
            let trackers = self.shared.trackers.read().await;
            let total = trackers.len();
            let healthy_count = trackers.values().filter(|t| t.is_healthy).count();
            drop(trackers);
            let stats = self.shared.stats.lock().await;
            let healthy = total > 0
                && healthy_count > 0
                && (stats.failed_announces as f64) < stats.total_announces as f64 * 0.5;
            let score = if total == 0 {
                0.0
            } else {
                healthy_count as f64 / total as f64
            };
            HealthCheck {
                service_name: self.name().to_string(),
                healthy,
                score,
                message: format!(
                    "trackers: {}/{}, success: {}/{}",
                    healthy_count, total, stats.successful_announces, stats.total_announces
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

    fn conf() -> TrackerServiceConf {
        TrackerServiceConf {
            max_trackers: 2,
            max_failure_count: 2,
            health_check_interval: Duration::from_secs(60),
            default_announce_interval: Duration::from_secs(1800),
        }
    }

    #[tokio::test]
    async fn add_tracker_respects_max_trackers() {
        let svc = TrackerService::new(conf(), ServiceHealth::new(5, Duration::from_secs(60)));
        assert!(svc.add_tracker("http://a".to_string()).await);
        assert!(svc.add_tracker("http://b".to_string()).await);
        assert!(!svc.add_tracker("http://c".to_string()).await);
    }

    #[tokio::test]
    async fn repeated_failures_mark_tracker_unhealthy() {
        let svc = TrackerService::new(conf(), ServiceHealth::new(5, Duration::from_secs(60)));
        svc.add_tracker("http://a".to_string()).await;
        let peers = svc
            .announce(AnnounceEvent::Started, |_url, _event| async move {
                Err(crate::error::ServiceError::Failed {
                    name: "tracker_service".to_string(),
                    message: "unreachable".to_string(),
                }
                .into())
            })
            .await;
        assert!(peers.is_empty());
        svc.announce(AnnounceEvent::Started, |_url, _event| async move {
            Err(crate::error::ServiceError::Failed {
                name: "tracker_service".to_string(),
                message: "unreachable".to_string(),
            }
            .into())
        })
        .await;
        assert!(svc.healthy_trackers().await.is_empty());
    }

    #[tokio::test]
    async fn successful_announce_resets_failure_count() {
        let svc = TrackerService::new(conf(), ServiceHealth::new(5, Duration::from_secs(60)));
        svc.add_tracker("http://a".to_string()).await;
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let peers = svc
            .announce(AnnounceEvent::Started, move |_url, _event| {
                let addr = addr;
                async move { Ok(vec![addr]) }
            })
            .await;
        assert_eq!(peers, vec![addr]);
        let info = svc.tracker_info("http://a").await.unwrap();
        assert_eq!(info.failure_count, 0);
        assert!(info.is_healthy);
    }
}
