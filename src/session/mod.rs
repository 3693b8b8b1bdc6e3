//! The session orchestrator (L4): binds the protocol codecs (L1), NAT
//! manager (L2), and PEX engine / service fabric (L3) to one running
//! torrent, fanning events out to the external piece/file managers.
//!
//! Peer connections are tracked in an arena keyed by small integer
//! [`PeerHandle`]s rather than shared-owned references, so that callbacks
//! (PEX sends, event-sink notifications) carry a handle instead of a pointer
//! back into the session — see the callback-graph design note this crate
//! follows throughout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::conf::Conf;
use crate::error::{HandshakeError, Result};
use crate::nat::NatManager;
use crate::pex::{PexBus, PexEngine};
use crate::protocol::{ConnectionState, ExpectedInfoHash, PeerIdentity, ProtocolVersion};
use crate::service::peer_service::PeerService;
use crate::service::storage_service::{DiskWriter, StorageService};
use crate::service::tracker_service::TrackerService;
use crate::service::ServiceManager;
use crate::Bitfield;

/// A small integer handle into the session's peer-connection arena. Cheap to
/// copy, carries no lifetime, and safe to hand to callbacks and background
/// tasks without creating a reference cycle back into the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerHandle(u32);

/// A single peer connection's negotiated state, per the data model's
/// `{INITIATED → CONNECTING → HANDSHAKING → ACTIVE → DISCONNECTED}` machine.
pub struct PeerConnectionRecord {
    pub identity: PeerIdentity,
    pub state: ConnectionState,
    pub version: Option<ProtocolVersion>,
    pub bitfield: Option<Bitfield>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub pieces_downloaded: u64,
    pub pieces_uploaded: u64,
    pub last_activity: Instant,
    pub pipeline_depth: u32,
    pub error: Option<String>,
}

impl PeerConnectionRecord {
    fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            state: ConnectionState::Initiated,
            version: None,
            bitfield: None,
            bytes_sent: 0,
            bytes_received: 0,
            pieces_downloaded: 0,
            pieces_uploaded: 0,
            last_activity: Instant::now(),
            pipeline_depth: 0,
            error: None,
        }
    }
}

/// The peer-connection arena. A slot is `None` once freed; freed indices are
/// reused via `free`, so handles stay dense without ever reallocating the
/// backing `Vec` on churn.
#[derive(Default)]
struct Peers {
    slots: Vec<Option<PeerConnectionRecord>>,
    free: Vec<u32>,
    by_addr: HashMap<SocketAddr, PeerHandle>,
}

impl Peers {
    fn insert(&mut self, record: PeerConnectionRecord) -> PeerHandle {
        let addr = record.identity.addr;
        let handle = if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(record);
            PeerHandle(idx)
        } else {
            self.slots.push(Some(record));
            PeerHandle((self.slots.len() - 1) as u32)
        };
        self.by_addr.insert(addr, handle);
        handle
    }

    fn remove(&mut self, handle: PeerHandle) -> Option<PeerConnectionRecord> {
        let slot = self.slots.get_mut(handle.0 as usize)?;
        let record = slot.take()?;
        self.by_addr.remove(&record.identity.addr);
        self.free.push(handle.0);
        Some(record)
    }

    fn get(&self, handle: PeerHandle) -> Option<&PeerConnectionRecord> {
        self.slots.get(handle.0 as usize)?.as_ref()
    }

    fn get_mut(&mut self, handle: PeerHandle) -> Option<&mut PeerConnectionRecord> {
        self.slots.get_mut(handle.0 as usize)?.as_mut()
    }

    fn handle_for(&self, addr: SocketAddr) -> Option<PeerHandle> {
        self.by_addr.get(&addr).copied()
    }

    fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.slots
            .iter()
            .flatten()
            .filter(|r| r.state == ConnectionState::Active)
            .map(|r| r.identity.addr)
            .collect()
    }
}

/// Sink for events a peer connection raises once active. Implemented by the
/// embedder (e.g. the piece manager); the session holds only this trait
/// object, never a reference back to the embedder's own state.
pub trait PeerEventSink: Send + Sync {
    fn on_peer_connected(&self, handle: PeerHandle, identity: PeerIdentity) -> BoxFuture<'_, ()>;
    fn on_bitfield_received(&self, handle: PeerHandle, bitfield: Bitfield) -> BoxFuture<'_, ()>;
    fn on_piece_received(&self, handle: PeerHandle, piece_index: u32, data: Vec<u8>)
        -> BoxFuture<'_, ()>;
    fn on_peer_disconnected(&self, handle: PeerHandle, reason: String) -> BoxFuture<'_, ()>;
    /// Hands a BEP 10 extension-message payload to the peer's outbound
    /// writer. Returns whether the send succeeded.
    fn send_extension_message(&self, addr: SocketAddr, payload: Vec<u8>) -> BoxFuture<'_, bool>;
}

/// Bridges the session's peer arena and event sink to the `PexBus` contract
/// the PEX engine expects, without the PEX engine ever holding a reference
/// back to the session itself.
struct PexBusAdapter {
    peers: Arc<RwLock<Peers>>,
    sink: Arc<dyn PeerEventSink>,
}

impl PexBus for PexBusAdapter {
    fn send(&self, peer_key: SocketAddr, payload: Vec<u8>, _is_added: bool) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.sink.send_extension_message(peer_key, payload).await })
    }

    fn connected_peers(&self) -> BoxFuture<'_, Vec<SocketAddr>> {
        Box::pin(async move { self.peers.read().await.connected_addrs() })
    }
}

/// Binds the protocol, NAT, PEX, and service-fabric layers to one torrent.
///
/// `nat`/`pex` are wrapped in their own async mutex because both engines'
/// `start()` takes `&mut self` to hand off their one-shot shutdown-channel
/// receiver to the spawned background task; everything else on them takes
/// `&self` and is reachable through the lock just as easily.
pub struct Session {
    peers: Arc<RwLock<Peers>>,
    sink: Arc<dyn PeerEventSink>,
    supported_versions: Vec<ProtocolVersion>,
    expected_hash: ExpectedInfoHash,
    nat: tokio::sync::Mutex<NatManager>,
    pex: tokio::sync::Mutex<PexEngine>,
    pub services: Arc<ServiceManager>,
    pub peer_service: Arc<PeerService>,
    pub tracker_service: Arc<TrackerService>,
    pub storage_service: Arc<StorageService>,
}

impl Session {
    pub fn new(
        conf: &Conf,
        expected_hash: ExpectedInfoHash,
        supported_versions: Vec<ProtocolVersion>,
        sink: Arc<dyn PeerEventSink>,
        disk: Arc<dyn DiskWriter>,
    ) -> Self {
        let peers = Arc::new(RwLock::new(Peers::default()));

        let bus: Arc<dyn PexBus> = Arc::new(PexBusAdapter {
            peers: peers.clone(),
            sink: sink.clone(),
        });
        let pex = tokio::sync::Mutex::new(PexEngine::new(conf.pex.clone(), bus));
        let nat = tokio::sync::Mutex::new(NatManager::new(conf.nat.clone()));

        let services = Arc::new(ServiceManager::new(conf.service.health_check_interval));
        let peer_service = PeerService::new(
            conf.service.peer.clone(),
            crate::service::ServiceHealth::new(
                conf.service.circuit_breaker_threshold,
                conf.service.circuit_breaker_timeout,
            ),
        );
        let tracker_service = TrackerService::new(
            conf.service.tracker.clone(),
            crate::service::ServiceHealth::new(
                conf.service.circuit_breaker_threshold,
                conf.service.circuit_breaker_timeout,
            ),
        );
        let storage_service = StorageService::new(
            conf.service.storage.clone(),
            crate::service::ServiceHealth::new(
                conf.service.circuit_breaker_threshold,
                conf.service.circuit_breaker_timeout,
            ),
            disk,
        );

        Self {
            peers,
            sink,
            supported_versions,
            expected_hash,
            nat,
            pex,
            services,
            peer_service,
            tracker_service,
            storage_service,
        }
    }

    /// Registers the three core services with the supervisor and starts
    /// everything (NAT discovery, PEX loops, service health monitors).
    pub async fn start(&self) -> Result<()> {
        self.services.register_service(self.peer_service.clone()).await?;
        self.services
            .register_service(self.tracker_service.clone())
            .await?;
        self.services
            .register_service(self.storage_service.clone())
            .await?;

        self.services.start_service(self.peer_service.name()).await?;
        self.services
            .start_service(self.tracker_service.name())
            .await?;
        self.services
            .start_service(self.storage_service.name())
            .await?;

        self.nat.lock().await.start().await;
        self.pex.lock().await.start();
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.pex.lock().await.stop();
        self.nat.lock().await.shutdown().await;
        self.services.shutdown().await;
    }

    pub async fn pex_known_peer_count(&self) -> usize {
        self.pex.lock().await.known_peer_count().await
    }

    pub async fn nat_status(&self) -> crate::nat::NatStatus {
        self.nat.lock().await.get_status().await
    }

    /// Admits a newly connected TCP peer into the arena at `Initiated`. PEX
    /// session registration happens once the handshake reveals whether the
    /// peer supports `ut_pex` (see [`Self::complete_handshake`]).
    pub async fn register_peer(&self, addr: SocketAddr) -> PeerHandle {
        self.peers
            .write()
            .await
            .insert(PeerConnectionRecord::new(PeerIdentity { addr, peer_id: None }))
    }

    pub async fn remove_peer(&self, handle: PeerHandle, reason: String) {
        let record = self.peers.write().await.remove(handle);
        if let Some(record) = record {
            self.pex.lock().await.remove_session(record.identity.addr).await;
            self.sink.on_peer_disconnected(handle, reason).await;
        }
    }

    /// Classifies, validates, and negotiates a handshake read off the wire,
    /// transitioning the peer to `Active` on success or `Disconnected` (with
    /// the error recorded) on failure.
    pub async fn complete_handshake(
        &self,
        handle: PeerHandle,
        raw: &[u8],
    ) -> std::result::Result<ProtocolVersion, HandshakeError> {
        let (handshake, peer_version) = crate::protocol::handshake::classify_and_parse(raw)?;
        let negotiated = crate::protocol::negotiate_version(peer_version, &self.supported_versions)
            .ok_or(HandshakeError::NoCompatibleVersion)?;
        crate::protocol::handshake::validate_info_hash(
            &handshake,
            &self.expected_hash,
            negotiated,
        )?;

        let mut peers = self.peers.write().await;
        if let Some(record) = peers.get_mut(handle) {
            record.identity.peer_id = Some(handshake.peer_id);
            record.version = Some(negotiated);
            record.state = ConnectionState::Active;
            record.last_activity = Instant::now();
            let identity = record.identity;
            drop(peers);
            self.sink.on_peer_connected(handle, identity).await;
        }
        Ok(negotiated)
    }

    /// Enables PEX gossip for a peer once the BEP 10 extension handshake
    /// dictionary (exchanged separately, after the base handshake) has
    /// revealed the peer's `ut_pex` message id. `is_private_torrent` suppresses
    /// registration entirely, per BEP 11.
    pub async fn register_pex_support(
        &self,
        handle: PeerHandle,
        ut_pex_id: u8,
        is_private_torrent: bool,
    ) {
        let addr = match self.peers.read().await.get(handle) {
            Some(record) => record.identity.addr,
            None => return,
        };
        self.pex
            .lock()
            .await
            .register_session(addr, Some(ut_pex_id), is_private_torrent)
            .await;
    }

    pub async fn record_bitfield(&self, handle: PeerHandle, bitfield: Bitfield) {
        let mut peers = self.peers.write().await;
        if let Some(record) = peers.get_mut(handle) {
            record.bitfield = Some(bitfield.clone());
            record.last_activity = Instant::now();
        }
        drop(peers);
        self.sink.on_bitfield_received(handle, bitfield).await;
    }

    pub async fn record_piece_received(&self, handle: PeerHandle, piece_index: u32, data: Vec<u8>) {
        {
            let mut peers = self.peers.write().await;
            if let Some(record) = peers.get_mut(handle) {
                record.pieces_downloaded += 1;
                record.bytes_received += data.len() as u64;
                record.last_activity = Instant::now();
            }
        }
        self.sink.on_piece_received(handle, piece_index, data).await;
    }

    pub async fn handle_for_addr(&self, addr: SocketAddr) -> Option<PeerHandle> {
        self.peers.read().await.handle_for(addr)
    }

    pub async fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.peers.read().await.connected_addrs()
    }

    pub async fn connection_count(&self) -> usize {
        self.peers
            .read()
            .await
            .slots
            .iter()
            .filter(|s| s.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_reuses_freed_slots() {
        let mut peers = Peers::default();
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        let h1 = peers.insert(PeerConnectionRecord::new(PeerIdentity { addr: a, peer_id: None }));
        peers.remove(h1);
        let h2 = peers.insert(PeerConnectionRecord::new(PeerIdentity { addr: b, peer_id: None }));
        assert_eq!(h1, h2);
        assert_eq!(peers.handle_for(b), Some(h2));
        assert_eq!(peers.handle_for(a), None);
    }

    #[test]
    fn connected_addrs_only_includes_active_peers() {
        let mut peers = Peers::default();
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let handle = peers.insert(PeerConnectionRecord::new(PeerIdentity { addr: a, peer_id: None }));
        assert!(peers.connected_addrs().is_empty());
        peers.get_mut(handle).unwrap().state = ConnectionState::Active;
        assert_eq!(peers.connected_addrs(), vec![a]);
    }
}
