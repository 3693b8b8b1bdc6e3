//! Unified NAT traversal facade: tries NAT-PMP then UPnP, maintains the
//! mapping table, and drives renewal.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::conf::NatConf;
use crate::error::{NatPmpError, UpnpError};
use crate::nat::natpmp::NatPmpClient;
use crate::nat::port_mapping::{PortMapping, PortMappingManager};
use crate::nat::upnp::UpnpClient;
use crate::nat::{NatProtocolSource, Protocol};

/// A point-in-time snapshot of the manager's state, for diagnostics.
#[derive(Clone, Debug)]
pub struct NatStatus {
    pub active_protocol: Option<NatProtocolSource>,
    pub external_ip: Option<Ipv4Addr>,
    pub mappings: Vec<PortMapping>,
}

enum Command {
    Shutdown,
}

struct Inner {
    conf: NatConf,
    natpmp: Mutex<NatPmpClient>,
    upnp: Mutex<UpnpClient>,
    mappings: RwLock<PortMappingManager>,
    active_protocol: RwLock<Option<NatProtocolSource>>,
    external_ip: RwLock<Option<Ipv4Addr>>,
    discovery_attempted: Mutex<bool>,
}

impl Inner {
    /// Tries NAT-PMP first, then UPnP; 2 attempts with a 2s backoff between
    /// them. A discovery already in flight is not duplicated unless
    /// `force`.
    async fn discover(&self, force: bool) -> Result<NatProtocolSource, crate::error::Error> {
        {
            let mut attempted = self.discovery_attempted.lock().await;
            if *attempted && !force {
                if let Some(proto) = *self.active_protocol.read().await {
                    return Ok(proto);
                }
            }
            *attempted = true;
        }

        const BACKOFFS: [Duration; 1] = [Duration::from_secs(2)];
        let mut last_err: Option<crate::error::Error> = None;

        for attempt in 0..=BACKOFFS.len() {
            match self.try_discover_once().await {
                Ok(proto) => {
                    *self.active_protocol.write().await = Some(proto);
                    return Ok(proto);
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt < BACKOFFS.len() {
                        tokio::time::sleep(BACKOFFS[attempt] * (attempt as u32 + 1)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(crate::error::Error::NatPmp(NatPmpError::NoGateway)))
    }

    async fn try_discover_once(&self) -> Result<NatProtocolSource, crate::error::Error> {
        if self.conf.enable_natpmp {
            let mut natpmp = self.natpmp.lock().await;
            if let Ok(ip) = natpmp.get_external_ip().await {
                *self.external_ip.write().await = Some(ip);
                return Ok(NatProtocolSource::NatPmp);
            }
        }
        if self.conf.enable_upnp {
            let mut upnp = self.upnp.lock().await;
            if upnp.discover().await.is_ok() {
                if let Ok(ip) = upnp.get_external_ip().await {
                    *self.external_ip.write().await = Some(ip);
                    return Ok(NatProtocolSource::Upnp);
                }
            }
        }
        Err(crate::error::Error::Upnp(UpnpError::NoDevice))
    }

    /// Maps a port via the active protocol, retrying transient failures up
    /// to `mapping_max_attempts` times with 5s/10s/20s backoff. UPnP 606
    /// (authorization) is treated as non-retryable after one extra
    /// attempt.
    async fn map_port(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<(), crate::error::Error> {
        if self.mappings.read().await.contains(protocol, external_port) {
            return Err(crate::error::Error::DuplicateMapping {
                protocol,
                external_port,
            });
        }

        let active = match *self.active_protocol.read().await {
            Some(p) => p,
            None => self.discover(false).await?,
        };

        const BACKOFFS: [Duration; 3] = [
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(20),
        ];

        let mut last_err: Option<crate::error::Error> = None;
        for attempt in 0..self.conf.mapping_max_attempts {
            match self.try_map_once(active, internal_port, external_port, protocol).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let non_retryable = matches!(
                        &e,
                        crate::error::Error::Upnp(UpnpError::Soap { code, .. }) if code.is_authorization_error()
                    );
                    last_err = Some(e);
                    if non_retryable && attempt >= 1 {
                        break;
                    }
                    let idx = (attempt as usize).min(BACKOFFS.len() - 1);
                    if attempt + 1 < self.conf.mapping_max_attempts {
                        tokio::time::sleep(BACKOFFS[idx]).await;
                    }
                }
            }
        }

        let err = last_err.unwrap_or(crate::error::Error::Upnp(UpnpError::NoDevice));
        log::warn!(
            "failed to map {} port {} -> {}: {} (suggestion: configure manual port forwarding on your router)",
            protocol,
            internal_port,
            external_port,
            err
        );
        Err(err)
    }

    async fn try_map_once(
        &self,
        active: NatProtocolSource,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<(), crate::error::Error> {
        let lease = self.conf.port_mapping_lease_time;
        match active {
            NatProtocolSource::NatPmp => {
                let mut natpmp = self.natpmp.lock().await;
                let mapping = natpmp
                    .add_port_mapping(internal_port, external_port, lease.as_secs() as u32, protocol)
                    .await?;
                self.mappings.write().await.insert(PortMapping::new(
                    mapping.internal_port,
                    mapping.external_port,
                    protocol,
                    NatProtocolSource::NatPmp,
                    Some(Duration::from_secs(mapping.lifetime as u64)),
                ));
            }
            NatProtocolSource::Upnp => {
                let upnp = self.upnp.lock().await;
                upnp.add_port_mapping(
                    internal_port,
                    external_port,
                    protocol,
                    &self.conf.description,
                    lease.as_secs() as u32,
                )
                .await?;
                // The configured lease time is authoritative for scheduling
                // UPnP renewal, regardless of what the router actually
                // granted.
                self.mappings.write().await.insert(PortMapping::new(
                    internal_port,
                    external_port,
                    protocol,
                    NatProtocolSource::Upnp,
                    Some(lease),
                ));
            }
        }
        Ok(())
    }

    async fn unmap_port(&self, protocol: Protocol, external_port: u16) -> Result<(), crate::error::Error> {
        let mapping = self.mappings.write().await.remove(protocol, external_port);
        let mapping = match mapping {
            Some(m) => m,
            None => return Ok(()),
        };
        match mapping.source {
            NatProtocolSource::NatPmp => {
                let mut natpmp = self.natpmp.lock().await;
                natpmp.delete_port_mapping(external_port, protocol).await?;
            }
            NatProtocolSource::Upnp => {
                let upnp = self.upnp.lock().await;
                upnp.delete_port_mapping(external_port, protocol).await?;
            }
        }
        Ok(())
    }

    /// Renews a single mapping, reusing the initial add-mapping call. Up to
    /// `renewal_max_retries` retries with 60s gaps on failure; all failing
    /// leaves the mapping in place but logs an error. If the mapping was
    /// removed in the meantime, the renewal is aborted silently.
    async fn renew_mapping(&self, protocol: Protocol, external_port: u16) -> Result<(), crate::error::Error> {
        let mapping = {
            let mappings = self.mappings.read().await;
            match mappings.get(protocol, external_port) {
                Some(m) => m.clone(),
                None => return Ok(()),
            }
        };

        for attempt in 0..self.conf.renewal_max_retries {
            match self.try_map_once(mapping.source, mapping.internal_port, external_port, protocol).await {
                Ok(()) => {
                    log::info!("renewed {} mapping {}->{}", protocol, mapping.internal_port, external_port);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("renewal attempt {} for {}:{} failed: {}", attempt + 1, protocol, external_port, e);
                    if attempt + 1 < self.conf.renewal_max_retries {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                }
            }
        }
        log::error!("all renewal attempts for {}:{} failed; leaving mapping in place", protocol, external_port);
        Ok(())
    }

    fn mappings_due_for_renewal(&self, mappings: &PortMappingManager) -> Vec<(Protocol, u16)> {
        let now = std::time::Instant::now();
        mappings
            .all()
            .filter(|m| m.renewal_due_at().map(|due| due <= now).unwrap_or(false))
            .map(|m| (m.protocol, m.external_port))
            .collect()
    }
}

/// Facade binding NAT-PMP and UPnP behind one API, per §4.7.
pub struct NatManager {
    inner: Arc<Inner>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
}

impl NatManager {
    pub fn new(conf: NatConf) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            natpmp: Mutex::new(NatPmpClient::new(
                None,
                conf.natpmp_socket_timeout,
                conf.natpmp_max_retries,
            )),
            upnp: Mutex::new(UpnpClient::new()),
            mappings: RwLock::new(PortMappingManager::new()),
            active_protocol: RwLock::new(None),
            external_ip: RwLock::new(None),
            discovery_attempted: Mutex::new(false),
            conf,
        });
        Self {
            inner,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
        }
    }

    /// No-op unless `auto_map_ports` is enabled. Otherwise clears UPnP
    /// client state, resets the discovery-attempted guard, runs
    /// `discover()`, optionally clears stale mappings, and spawns the
    /// periodic re-discovery/renewal task if a re-discovery interval is
    /// configured.
    pub async fn start(&mut self) {
        if !self.inner.conf.auto_map_ports {
            log::debug!("NAT auto-mapping disabled; NatManager::start is a no-op");
            return;
        }

        {
            let mut upnp = self.inner.upnp.lock().await;
            upnp.clear_cache();
        }
        *self.inner.discovery_attempted.lock().await = false;

        if let Err(e) = self.inner.discover(false).await {
            log::warn!("NAT discovery failed at startup: {}", e);
        }

        {
            let upnp = self.inner.upnp.lock().await;
            if upnp.is_discovered() {
                match upnp.clear_all_mappings(&self.inner.conf.description).await {
                    Ok(count) if count > 0 => {
                        log::info!("cleared {} stale UPnP mappings from a previous run", count)
                    }
                    Ok(_) => {}
                    Err(e) => log::debug!("failed to clear stale UPnP mappings: {}", e),
                }
            }
        }

        if self.inner.conf.nat_discovery_interval > Duration::from_secs(0) {
            let cmd_rx = self.cmd_rx.take().expect("NatManager::start called more than once");
            tokio::spawn(run_background_tasks(self.inner.clone(), cmd_rx));
        }
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    /// Shuts down the manager: unmaps every live mapping (tolerating
    /// per-mapping failure) and closes protocol clients.
    pub async fn shutdown(&self) {
        self.stop();
        let keys: Vec<(Protocol, u16)> = {
            let mappings = self.inner.mappings.read().await;
            mappings.all().map(|m| (m.protocol, m.external_port)).collect()
        };
        for (protocol, external_port) in keys {
            if let Err(e) = self.unmap_port(protocol, external_port).await {
                log::warn!("failed to unmap {}:{} during shutdown: {}", protocol, external_port, e);
            }
        }
    }

    pub async fn discover(&self, force: bool) -> Result<NatProtocolSource, crate::error::Error> {
        self.inner.discover(force).await
    }

    pub async fn map_port(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<(), crate::error::Error> {
        self.inner.map_port(internal_port, external_port, protocol).await
    }

    pub async fn unmap_port(&self, protocol: Protocol, external_port: u16) -> Result<(), crate::error::Error> {
        self.inner.unmap_port(protocol, external_port).await
    }

    pub async fn renew_mapping(&self, protocol: Protocol, external_port: u16) -> Result<(), crate::error::Error> {
        self.inner.renew_mapping(protocol, external_port).await
    }

    /// Polls the internal mapping table every 200ms until `(protocol,
    /// external_port)` appears or `timeout` elapses.
    pub async fn wait_for_mapping(&self, protocol: Protocol, external_port: u16, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.mappings.read().await.contains(protocol, external_port) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    pub async fn get_external_port(&self, internal_port: u16, protocol: Protocol) -> Option<u16> {
        self.inner.mappings.read().await.external_port_for(internal_port, protocol)
    }

    pub async fn get_external_ip(&self) -> Option<Ipv4Addr> {
        *self.inner.external_ip.read().await
    }

    pub async fn get_status(&self) -> NatStatus {
        NatStatus {
            active_protocol: *self.inner.active_protocol.read().await,
            external_ip: *self.inner.external_ip.read().await,
            mappings: self.inner.mappings.read().await.all().cloned().collect(),
        }
    }
}

async fn run_background_tasks(inner: Arc<Inner>, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let mut rediscovery = tokio::time::interval(inner.conf.nat_discovery_interval);
    let mut renewal_check = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = rediscovery.tick() => {
                if let Err(e) = inner.discover(true).await {
                    log::warn!("periodic NAT re-discovery failed: {}", e);
                }
            }
            _ = renewal_check.tick() => {
                let due = {
                    let mappings = inner.mappings.read().await;
                    inner.mappings_due_for_renewal(&mappings)
                };
                for (protocol, external_port) in due {
                    if let Err(e) = inner.renew_mapping(protocol, external_port).await {
                        log::warn!("renewal dispatch failed for {}:{}: {}", protocol, external_port, e);
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Shutdown) | None => {
                        log::info!("NAT manager background tasks shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_manager_has_no_active_protocol() {
        let manager = NatManager::new(NatConf::default());
        assert!(manager.cmd_rx.is_some());
    }
}
