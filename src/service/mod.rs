//! Service fabric: a small supervisor for long-running subsystems, each with
//! a health score, a circuit breaker, and a periodic health check.
//!
//! [`Service`] is the trait concrete services (peer, storage, tracker)
//! implement. [`ServiceManager`] owns their lifecycle state and runs the
//! health-check loop; circuit breaker bookkeeping lives on [`ServiceHealth`],
//! shared between a service's own operations and the manager's poller.

pub mod peer_service;
pub mod storage_service;
pub mod tracker_service;

pub use peer_service::PeerService;
pub use storage_service::StorageService;
pub use tracker_service::TrackerService;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{Result, ServiceError};

/// Lifecycle state of a registered service, supervised exclusively by
/// [`ServiceManager`] — individual services never set their own state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Degraded,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
            Self::Degraded => "degraded",
        };
        write!(f, "{}", s)
    }
}

/// A snapshot of a registered service's supervision state, as surfaced to
/// embedding code through [`ServiceManager::get_service_info`].
#[derive(Clone, Debug)]
pub struct ServiceInfo {
    pub name: String,
    pub state: ServiceState,
    pub health_score: f64,
}

/// The result of a single health probe.
#[derive(Clone, Debug)]
pub struct HealthCheck {
    pub service_name: String,
    pub healthy: bool,
    pub score: f64,
    pub message: String,
    pub timestamp: Instant,
    pub response_time: Duration,
}

struct HealthInner {
    score: f64,
    success_count: u64,
    error_count: u64,
    circuit_breaker_failures: u32,
    circuit_breaker_last_failure: Option<Instant>,
    circuit_breaker_open: bool,
}

/// Health score and circuit breaker state for one service.
///
/// `score` is written from two independent places: `record_success`/
/// `record_error` nudge it by ±0.1 as the service performs its own work, and
/// the manager's periodic [`Service::health_check`] poll overwrites it wholesale
/// with `set_score`. Both write the same field; whichever runs last wins.
pub struct ServiceHealth {
    inner: Mutex<HealthInner>,
    circuit_breaker_threshold: u32,
    circuit_breaker_timeout: Duration,
}

impl ServiceHealth {
    pub fn new(circuit_breaker_threshold: u32, circuit_breaker_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HealthInner {
                score: 1.0,
                success_count: 0,
                error_count: 0,
                circuit_breaker_failures: 0,
                circuit_breaker_last_failure: None,
                circuit_breaker_open: false,
            }),
            circuit_breaker_threshold,
            circuit_breaker_timeout,
        })
    }

    pub async fn score(&self) -> f64 {
        self.inner.lock().await.score
    }

    /// Overwrites the score directly; used by the manager's health-check loop.
    pub async fn set_score(&self, score: f64) {
        self.inner.lock().await.score = score.clamp(0.0, 1.0);
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.success_count += 1;
        inner.score = (inner.score + 0.1).min(1.0);
        if inner.circuit_breaker_failures > 0 {
            inner.circuit_breaker_failures = 0;
            inner.circuit_breaker_open = false;
        }
    }

    pub async fn record_error(&self) {
        let mut inner = self.inner.lock().await;
        inner.error_count += 1;
        inner.score = (inner.score - 0.1).max(0.0);
        inner.circuit_breaker_failures += 1;
        inner.circuit_breaker_last_failure = Some(Instant::now());
        if inner.circuit_breaker_failures >= self.circuit_breaker_threshold {
            inner.circuit_breaker_open = true;
        }
    }

    /// `true` if the breaker is open and its timeout has not yet elapsed.
    /// Once the timeout elapses the breaker transitions to closed: the
    /// failure count resets to zero so a subsequent failure has to
    /// accumulate `circuit_breaker_threshold` fresh failures to reopen it,
    /// rather than immediately re-tripping on the first one.
    pub async fn is_circuit_breaker_open(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.circuit_breaker_open {
            return false;
        }
        let still_open = match inner.circuit_breaker_last_failure {
            Some(last) => last.elapsed() < self.circuit_breaker_timeout,
            None => false,
        };
        if !still_open {
            inner.circuit_breaker_open = false;
            inner.circuit_breaker_failures = 0;
            inner.circuit_breaker_last_failure = None;
        }
        still_open
    }

    pub async fn counts(&self) -> (u64, u64) {
        let inner = self.inner.lock().await;
        (inner.success_count, inner.error_count)
    }

    /// Runs `f` unless the breaker is open, recording the outcome.
    pub async fn call_with_circuit_breaker<F, Fut, T>(
        &self,
        service_name: &str,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.is_circuit_breaker_open().await {
            return Err(ServiceError::CircuitBreakerOpen(service_name.to_string()).into());
        }
        match f().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_error().await;
                Err(e)
            }
        }
    }
}

/// A supervised subsystem. Implementors hold their own `ServiceHealth` handle
/// so that internal operations can record successes/failures through
/// [`ServiceHealth::call_with_circuit_breaker`]; [`ServiceManager`] drives
/// `start`/`stop`/`health_check` and owns the externally-visible [`ServiceState`].
pub trait Service: Send + Sync {
    fn name(&self) -> &str;
    fn health(&self) -> &Arc<ServiceHealth>;
    fn start(&self) -> BoxFuture<'_, Result<()>>;
    fn stop(&self) -> BoxFuture<'_, Result<()>>;
    fn health_check(&self) -> BoxFuture<'_, HealthCheck>;
}

struct Registered {
    service: Arc<dyn Service>,
    state: ServiceState,
}

/// Supervises a set of named services: registration, start/stop, and a
/// background health-check poll per running service.
pub struct ServiceManager {
    services: Arc<RwLock<HashMap<String, Registered>>>,
    health_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    health_check_interval: Duration,
}

impl ServiceManager {
    pub fn new(health_check_interval: Duration) -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            health_tasks: Mutex::new(HashMap::new()),
            health_check_interval,
        }
    }

    pub async fn register_service(&self, service: Arc<dyn Service>) -> Result<()> {
        let name = service.name().to_string();
        let mut services = self.services.write().await;
        if services.contains_key(&name) {
            return Err(ServiceError::AlreadyRegistered(name).into());
        }
        services.insert(
            name,
            Registered {
                service,
                state: ServiceState::Stopped,
            },
        );
        Ok(())
    }

    pub async fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.services.read().await.get(name).map(|r| r.state)
    }

    /// Removes a stopped service's registration so the name can be reused.
    pub async fn unregister_service(&self, name: &str) -> Result<()> {
        let mut services = self.services.write().await;
        let entry = services
            .get(name)
            .ok_or_else(|| ServiceError::NotRegistered(name.to_string()))?;
        if entry.state != ServiceState::Stopped {
            return Err(ServiceError::InvalidState {
                name: name.to_string(),
                state: entry.state,
                required: ServiceState::Stopped,
            }
            .into());
        }
        services.remove(name);
        Ok(())
    }

    pub async fn list_services(&self) -> Vec<(String, ServiceState)> {
        self.services
            .read()
            .await
            .iter()
            .map(|(name, r)| (name.clone(), r.state))
            .collect()
    }

    pub async fn get_service_info(&self, name: &str) -> Option<ServiceInfo> {
        let services = self.services.read().await;
        let entry = services.get(name)?;
        let health_score = entry.service.health().score().await;
        Some(ServiceInfo {
            name: name.to_string(),
            state: entry.state,
            health_score,
        })
    }

    /// Names of every service currently `Running` with a health score above
    /// the degraded threshold.
    pub async fn get_healthy_services(&self) -> Vec<String> {
        let services = self.services.read().await;
        let mut healthy = Vec::new();
        for (name, entry) in services.iter() {
            if entry.state == ServiceState::Running && entry.service.health().score().await > 0.5
            {
                healthy.push(name.clone());
            }
        }
        healthy
    }

    pub async fn start_service(&self, name: &str) -> Result<()> {
        let service = {
            let mut services = self.services.write().await;
            let entry = services
                .get_mut(name)
                .ok_or_else(|| ServiceError::NotRegistered(name.to_string()))?;
            if entry.state != ServiceState::Stopped {
                return Err(ServiceError::InvalidState {
                    name: name.to_string(),
                    state: entry.state,
                    required: ServiceState::Stopped,
                }
                .into());
            }
            entry.state = ServiceState::Starting;
            entry.service.clone()
        };

        let result = service.start().await;
        let mut services = self.services.write().await;
        let entry = services
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotRegistered(name.to_string()))?;
        match result {
            Ok(()) => {
                entry.state = ServiceState::Running;
                log::info!("service '{}' started", name);
            }
            Err(e) => {
                entry.state = ServiceState::Error;
                log::error!("service '{}' failed to start: {}", name, e);
                return Err(ServiceError::Failed {
                    name: name.to_string(),
                    message: e.to_string(),
                }
                .into());
            }
        }
        drop(services);

        let handle = spawn_health_monitor(
            name.to_string(),
            service,
            self.services.clone(),
            self.health_check_interval,
        );
        self.health_tasks.lock().await.insert(name.to_string(), handle);
        Ok(())
    }

    pub async fn stop_service(&self, name: &str) -> Result<()> {
        let service = {
            let mut services = self.services.write().await;
            let entry = services
                .get_mut(name)
                .ok_or_else(|| ServiceError::NotRegistered(name.to_string()))?;
            if entry.state != ServiceState::Running && entry.state != ServiceState::Degraded {
                return Err(ServiceError::InvalidState {
                    name: name.to_string(),
                    state: entry.state,
                    required: ServiceState::Running,
                }
                .into());
            }
            entry.state = ServiceState::Stopping;
            entry.service.clone()
        };

        if let Some(handle) = self.health_tasks.lock().await.remove(name) {
            handle.abort();
        }

        let result = service.stop().await;
        let mut services = self.services.write().await;
        let entry = services
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotRegistered(name.to_string()))?;
        match result {
            Ok(()) => {
                entry.state = ServiceState::Stopped;
                log::info!("service '{}' stopped", name);
                Ok(())
            }
            Err(e) => {
                entry.state = ServiceState::Error;
                log::error!("service '{}' failed to stop cleanly: {}", name, e);
                Err(ServiceError::Failed {
                    name: name.to_string(),
                    message: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Stops every running (or degraded) service, logging but not
    /// propagating individual failures so one stuck service can't block the
    /// rest from shutting down.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self
            .services
            .read()
            .await
            .iter()
            .filter(|(_, r)| matches!(r.state, ServiceState::Running | ServiceState::Degraded))
            .map(|(name, _)| name.clone())
            .collect();

        for name in names {
            if let Err(e) = self.stop_service(&name).await {
                log::warn!("error stopping service '{}' during shutdown: {}", name, e);
            }
        }
    }
}

fn spawn_health_monitor(
    name: String,
    service: Arc<dyn Service>,
    services: Arc<RwLock<HashMap<String, Registered>>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            {
                let guard = services.read().await;
                match guard.get(&name) {
                    Some(entry) if entry.state == ServiceState::Running => {}
                    _ => break,
                }
            }

            let check = service.health_check().await;
            service.health().set_score(check.score).await;

            let mut guard = services.write().await;
            if let Some(entry) = guard.get_mut(&name) {
                if entry.state == ServiceState::Running {
                    entry.state = if check.healthy {
                        ServiceState::Running
                    } else {
                        ServiceState::Degraded
                    };
                }
            }
            if !check.healthy {
                log::warn!(
                    "service '{}' health check: {} (score {:.2})",
                    name,
                    check.message,
                    check.score
                );
            }
        }
        log::debug!("health monitor for '{}' exiting", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_error_opens_circuit_breaker_at_threshold() {
        let health = ServiceHealth::new(3, Duration::from_secs(60));
        assert!(!health.is_circuit_breaker_open().await);
        health.record_error().await;
        health.record_error().await;
        assert!(!health.is_circuit_breaker_open().await);
        health.record_error().await;
        assert!(health.is_circuit_breaker_open().await);
    }

    #[tokio::test]
    async fn record_success_resets_circuit_breaker() {
        let health = ServiceHealth::new(2, Duration::from_secs(60));
        health.record_error().await;
        health.record_error().await;
        assert!(health.is_circuit_breaker_open().await);
        health.record_success().await;
        assert!(!health.is_circuit_breaker_open().await);
    }

    #[tokio::test]
    async fn circuit_breaker_closes_and_resets_failure_count_after_timeout() {
        let health = ServiceHealth::new(3, Duration::from_millis(20));
        health.record_error().await;
        health.record_error().await;
        health.record_error().await;
        assert!(health.is_circuit_breaker_open().await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!health.is_circuit_breaker_open().await);

        // A single fresh failure must not reopen the breaker immediately;
        // the failure count was reset to zero on close.
        health.record_error().await;
        assert!(!health.is_circuit_breaker_open().await);
    }

    #[tokio::test]
    async fn score_clamped_to_unit_range() {
        let health = ServiceHealth::new(5, Duration::from_secs(60));
        for _ in 0..20 {
            health.record_success().await;
        }
        assert_eq!(health.score().await, 1.0);
        for _ in 0..20 {
            health.record_error().await;
        }
        assert_eq!(health.score().await, 0.0);
    }

    #[tokio::test]
    async fn set_score_overwrites_incremental_adjustments() {
        let health = ServiceHealth::new(5, Duration::from_secs(60));
        health.record_success().await;
        health.record_success().await;
        health.set_score(0.42).await;
        assert_eq!(health.score().await, 0.42);
    }

    struct StubService {
        name: &'static str,
        health: Arc<ServiceHealth>,
        fail_start: bool,
    }

    impl Service for StubService {
        fn name(&self) -> &str {
            self.name
        }

        fn health(&self) -> &Arc<ServiceHealth> {
            &self.health
        }

        fn start(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                if self.fail_start {
                    Err(ServiceError::Failed {
                        name: self.name.to_string(),
                        message: "boom".to_string(),
                    }
                    .into())
                } else {
                    Ok(())
                }
            })
        }

        fn stop(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn health_check(&self) -> BoxFuture<'_, HealthCheck> {
            Box::pin(async move {
                HealthCheck {
                    service_name: self.name.to_string(),
                    healthy: true,
                    score: 1.0,
                    message: "ok".to_string(),
                    timestamp: Instant::now(),
                    response_time: Duration::from_millis(0),
                }
            })
        }
    }

    #[tokio::test]
    async fn register_twice_fails() {
        let manager = ServiceManager::new(Duration::from_secs(30));
        let svc = Arc::new(StubService {
            name: "x",
            health: ServiceHealth::new(5, Duration::from_secs(60)),
            fail_start: false,
        });
        manager.register_service(svc.clone()).await.unwrap();
        assert!(manager.register_service(svc).await.is_err());
    }

    #[tokio::test]
    async fn start_stop_round_trip_transitions_state() {
        let manager = ServiceManager::new(Duration::from_secs(30));
        let svc = Arc::new(StubService {
            name: "x",
            health: ServiceHealth::new(5, Duration::from_secs(60)),
            fail_start: false,
        });
        manager.register_service(svc).await.unwrap();
        manager.start_service("x").await.unwrap();
        assert_eq!(manager.state_of("x").await, Some(ServiceState::Running));
        manager.stop_service("x").await.unwrap();
        assert_eq!(manager.state_of("x").await, Some(ServiceState::Stopped));
    }

    #[tokio::test]
    async fn start_failure_sets_error_state() {
        let manager = ServiceManager::new(Duration::from_secs(30));
        let svc = Arc::new(StubService {
            name: "x",
            health: ServiceHealth::new(5, Duration::from_secs(60)),
            fail_start: true,
        });
        manager.register_service(svc).await.unwrap();
        assert!(manager.start_service("x").await.is_err());
        assert_eq!(manager.state_of("x").await, Some(ServiceState::Error));
    }

    #[tokio::test]
    async fn unregister_then_register_same_name_succeeds() {
        let manager = ServiceManager::new(Duration::from_secs(30));
        let svc = Arc::new(StubService {
            name: "x",
            health: ServiceHealth::new(5, Duration::from_secs(60)),
            fail_start: false,
        });
        manager.register_service(svc.clone()).await.unwrap();
        manager.unregister_service("x").await.unwrap();
        manager.register_service(svc).await.unwrap();
    }

    #[tokio::test]
    async fn get_healthy_services_excludes_non_running() {
        let manager = ServiceManager::new(Duration::from_secs(30));
        let svc = Arc::new(StubService {
            name: "x",
            health: ServiceHealth::new(5, Duration::from_secs(60)),
            fail_start: false,
        });
        manager.register_service(svc).await.unwrap();
        assert!(manager.get_healthy_services().await.is_empty());
        manager.start_service("x").await.unwrap();
        assert_eq!(manager.get_healthy_services().await, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn stop_requires_running_state() {
        let manager = ServiceManager::new(Duration::from_secs(30));
        let svc = Arc::new(StubService {
            name: "x",
            health: ServiceHealth::new(5, Duration::from_secs(60)),
            fail_start: false,
        });
        manager.register_service(svc).await.unwrap();
        assert!(manager.stop_service("x").await.is_err());
    }
}
