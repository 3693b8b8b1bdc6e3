//! Peer exchange (ut_pex, BEP 11): gossip-based peer discovery with delta
//! tracking, deduplication, throttling, and reliability scoring.
//!
//! The session composing this engine owns a [`PexBus`] rather than handing
//! the engine a back-reference to itself, so sends and connected-peer lookups
//! go through a trait object instead of a reference cycle back into the
//! session.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, RwLock};

use crate::conf::PexConf;

/// Where a known peer was learned from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSource {
    Pex,
    Tracker,
    Dht,
}

/// A peer known to the PEX engine, independent of any particular session.
#[derive(Clone, Debug)]
pub struct KnownPeer {
    pub addr: SocketAddr,
    pub peer_id: Option<crate::PeerId>,
    pub added_time: Instant,
    pub source: PeerSource,
    pub reliability_score: f64,
}

/// Per-connected-peer PEX bookkeeping.
#[derive(Debug)]
struct Session {
    peer_key: SocketAddr,
    ut_pex_id: Option<u8>,
    last_send: Instant,
    pex_interval: Duration,
    supports_pex: bool,
    reliability_score: f64,
    consecutive_failures: u32,
    /// Addresses already told to this peer, suppressing duplicates until
    /// explicitly evicted (they are never re-sent as "added" again).
    already_sent: HashSet<SocketAddr>,
    /// The peer set this session believed was connected as of the last
    /// delta computation, used to derive the next added/dropped split.
    previously_connected: HashSet<SocketAddr>,
}

impl Session {
    fn new(peer_key: SocketAddr, ut_pex_id: Option<u8>, pex_interval: Duration) -> Self {
        Self {
            peer_key,
            ut_pex_id,
            // force an immediate first send
            last_send: Instant::now() - pex_interval - Duration::from_secs(1),
            pex_interval,
            supports_pex: ut_pex_id.is_some(),
            reliability_score: 1.0,
            consecutive_failures: 0,
            already_sent: HashSet::new(),
            previously_connected: HashSet::new(),
        }
    }

    /// Only a successful transmission of a non-empty added or dropped list
    /// resets the failure counter; an empty round (nothing to report) leaves
    /// it untouched rather than counting as either a success or a failure.
    /// Each of `added`/`dropped` is only considered for success/failure if it
    /// was actually attempted (its list was non-empty), so a round that only
    /// sends one of the two lists is judged solely on that list's outcome.
    fn record_send_outcome(
        &mut self,
        added_attempted: bool,
        added_ok: bool,
        dropped_attempted: bool,
        dropped_ok: bool,
    ) {
        if !added_attempted && !dropped_attempted {
            return;
        }
        let any_success = (added_attempted && added_ok) || (dropped_attempted && dropped_ok);
        if any_success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        if self.consecutive_failures > 0 {
            self.reliability_score = (1.0 - (self.consecutive_failures as f64) * 0.1).max(0.0);
        }
    }
}

/// The delta a session should transmit this round: peers newly connected
/// since the last send, and peers that dropped off.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delta {
    pub added: Vec<SocketAddr>,
    pub dropped: Vec<SocketAddr>,
}

/// Computes the added/dropped delta for one session, per the PEX delta
/// algorithm: `added = (C - P) - already_sent[K]`, `dropped = P - C`, both
/// truncated to `max_peers_per_interval`.
fn compute_delta(
    session: &mut Session,
    current_connected: &HashSet<SocketAddr>,
    max_per_interval: usize,
) -> Delta {
    let mut current = current_connected.clone();
    current.remove(&session.peer_key);

    let mut added: Vec<SocketAddr> = current
        .difference(&session.previously_connected)
        .filter(|a| !session.already_sent.contains(*a))
        .copied()
        .collect();
    added.truncate(max_per_interval);

    let mut dropped: Vec<SocketAddr> = session
        .previously_connected
        .difference(&current)
        .copied()
        .collect();
    dropped.truncate(max_per_interval);

    for addr in &added {
        session.already_sent.insert(*addr);
    }
    session.previously_connected = current;

    Delta { added, dropped }
}

/// The session-side abstraction the PEX engine sends through and reads
/// connectivity from. Owning a trait object here, rather than a reference
/// back to the session, avoids an ownership cycle between the two.
pub trait PexBus: Send + Sync {
    /// Sends one ut_pex extension message; returns whether the peer
    /// acknowledged (or at least accepted) the write.
    fn send(&self, peer_key: SocketAddr, payload: Vec<u8>, is_added: bool) -> BoxFuture<'_, bool>;
    /// Returns the addresses of all currently connected peers.
    fn connected_peers(&self) -> BoxFuture<'_, Vec<SocketAddr>>;
}

enum Command {
    Shutdown,
}

pub struct PexEngine {
    conf: PexConf,
    sessions: Arc<RwLock<HashMap<SocketAddr, Session>>>,
    known_peers: Arc<RwLock<HashMap<SocketAddr, KnownPeer>>>,
    bus: Arc<dyn PexBus>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
}

impl PexEngine {
    pub fn new(conf: PexConf, bus: Arc<dyn PexBus>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            conf,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            known_peers: Arc::new(RwLock::new(HashMap::new())),
            bus,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
        }
    }

    /// Registers a PEX session for a newly active, ut_pex-supporting peer.
    /// No-op (and no session is created) for peers on private torrents.
    pub async fn register_session(
        &self,
        peer_key: SocketAddr,
        ut_pex_id: Option<u8>,
        is_private_torrent: bool,
    ) {
        if is_private_torrent || ut_pex_id.is_none() {
            log::debug!(
                "Not enabling PEX for {} (private={}, ut_pex_id={:?})",
                peer_key,
                is_private_torrent,
                ut_pex_id
            );
            return;
        }
        let session = Session::new(peer_key, ut_pex_id, self.conf.pex_interval);
        self.sessions.write().await.insert(peer_key, session);
        log::info!("PEX session registered for {}", peer_key);
    }

    pub async fn remove_session(&self, peer_key: SocketAddr) {
        self.sessions.write().await.remove(&peer_key);
    }

    /// Sends deltas to every session whose `pex_interval` has elapsed.
    pub async fn send_due_sessions(&self) {
        send_due_sessions(&self.conf, &self.sessions, &self.bus).await;
    }

    /// Removes known peers last added more than `known_peer_ttl` ago.
    pub async fn cleanup_old_peers(&self) {
        cleanup_old_peers(&self.conf, &self.known_peers).await;
    }

    /// Forces an immediate send cycle to every supported session.
    pub async fn refresh(&self) {
        let mut sessions = self.sessions.write().await;
        let mut refreshed = 0usize;
        for session in sessions.values_mut() {
            if session.supports_pex {
                session.last_send =
                    Instant::now() - session.pex_interval - Duration::from_secs(1);
                refreshed += 1;
            }
        }
        drop(sessions);
        log::info!("PEX refresh triggered for {} peers", refreshed);
        self.send_due_sessions().await;
    }

    pub async fn known_peer_count(&self) -> usize {
        self.known_peers.read().await.len()
    }

    pub async fn add_known_peer(&self, addr: SocketAddr, source: PeerSource) {
        let mut known = self.known_peers.write().await;
        known
            .entry(addr)
            .and_modify(|p| p.added_time = Instant::now())
            .or_insert(KnownPeer {
                addr,
                peer_id: None,
                added_time: Instant::now(),
                source,
                reliability_score: 1.0,
            });
    }

    /// Spawns the background gossip and cleanup loops, returning a handle
    /// that stops them when sent [`Command::Shutdown`] via [`Self::stop`].
    pub fn start(&mut self) {
        let cmd_rx = self
            .cmd_rx
            .take()
            .expect("PexEngine::start called more than once");
        let sessions = self.sessions.clone();
        let known_peers = self.known_peers.clone();
        let bus = self.bus.clone();
        let conf = self.conf.clone();

        tokio::spawn(run_background_loops(conf, sessions, known_peers, bus, cmd_rx));
    }

    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

fn encode_addrs(ut_pex_id: u8, addrs: &[SocketAddr], added: bool) -> Vec<u8> {
    use std::net::SocketAddrV4;
    let v4: Vec<SocketAddrV4> = addrs
        .iter()
        .filter_map(|a| match a {
            SocketAddr::V4(v4) => Some(*v4),
            SocketAddr::V6(_) => None,
        })
        .collect();
    crate::protocol::extension::build_ut_pex_message(ut_pex_id, added, &v4)
}

async fn run_background_loops(
    conf: PexConf,
    sessions: Arc<RwLock<HashMap<SocketAddr, Session>>>,
    known_peers: Arc<RwLock<HashMap<SocketAddr, KnownPeer>>>,
    bus: Arc<dyn PexBus>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut tick = tokio::time::interval(conf.tick);
    let mut cleanup_tick = tokio::time::interval(conf.cleanup_interval);
    loop {
        futures::select! {
            _ = tick.tick().fuse() => {
                send_due_sessions(&conf, &sessions, &bus).await;
            }
            _ = cleanup_tick.tick().fuse() => {
                cleanup_old_peers(&conf, &known_peers).await;
            }
            cmd = cmd_rx.recv().fuse() => {
                match cmd {
                    Some(Command::Shutdown) | None => {
                        log::info!("PEX engine background loops shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn send_due_sessions(
    conf: &PexConf,
    sessions: &Arc<RwLock<HashMap<SocketAddr, Session>>>,
    bus: &Arc<dyn PexBus>,
) {
    let connected = bus.connected_peers().await;
    let connected_set: HashSet<SocketAddr> = connected.into_iter().collect();

    let due: Vec<SocketAddr> = {
        let guard = sessions.read().await;
        guard
            .values()
            .filter(|s| s.supports_pex && s.last_send.elapsed() >= s.pex_interval)
            .map(|s| s.peer_key)
            .collect()
    };

    for peer_key in due {
        send_to_peer(conf, sessions, bus, peer_key, &connected_set).await;
    }
}

async fn send_to_peer(
    conf: &PexConf,
    sessions: &Arc<RwLock<HashMap<SocketAddr, Session>>>,
    bus: &Arc<dyn PexBus>,
    peer_key: SocketAddr,
    connected: &HashSet<SocketAddr>,
) {
    let (ut_pex_id, delta) = {
        let mut guard = sessions.write().await;
        let session = match guard.get_mut(&peer_key) {
            Some(s) => s,
            None => return,
        };
        if !session.supports_pex {
            return;
        }
        let delta = compute_delta(session, connected, conf.max_peers_per_interval);
        (session.ut_pex_id, delta)
    };
    let ut_pex_id = match ut_pex_id {
        Some(id) => id,
        None => return,
    };

    let added_attempted = !delta.added.is_empty();
    let dropped_attempted = !delta.dropped.is_empty();
    let mut added_ok = false;
    let mut dropped_ok = false;

    if added_attempted {
        added_ok = bus.send(peer_key, encode_addrs(ut_pex_id, &delta.added, true), true).await;
        if !added_ok {
            log::warn!("PEX: failed to send added peers to {}", peer_key);
        }
    }
    if dropped_attempted {
        dropped_ok = bus
            .send(peer_key, encode_addrs(ut_pex_id, &delta.dropped, false), false)
            .await;
        if !dropped_ok {
            log::warn!("PEX: failed to send dropped peers to {}", peer_key);
        }
    }

    let mut guard = sessions.write().await;
    if let Some(session) = guard.get_mut(&peer_key) {
        session.last_send = Instant::now();
        session.record_send_outcome(added_attempted, added_ok, dropped_attempted, dropped_ok);
    }
}

async fn cleanup_old_peers(conf: &PexConf, known_peers: &Arc<RwLock<HashMap<SocketAddr, KnownPeer>>>) {
    let cutoff = Instant::now()
        .checked_sub(conf.known_peer_ttl)
        .unwrap_or_else(Instant::now);
    let mut guard = known_peers.write().await;
    guard.retain(|_, peer| peer.added_time >= cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(a: u8, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, a), port))
    }

    #[test]
    fn delta_computation_matches_spec_scenario() {
        let k = addr(4, 6881); // "1.2.3.4:6881"
        let a = addr(1, 1);
        let b = addr(2, 2);
        let c = addr(3, 3);

        let mut session = Session::new(k, Some(1), Duration::from_secs(30));
        session.previously_connected = [a, b].into_iter().collect();

        let current: HashSet<SocketAddr> = [a, b, c, k].into_iter().collect();
        let delta = compute_delta(&mut session, &current, 50);

        assert_eq!(delta.added, vec![c]);
        assert!(delta.dropped.is_empty());
        assert!(session.already_sent.contains(&c));

        // a second call with the same current set should yield nothing new
        let delta2 = compute_delta(&mut session, &current, 50);
        assert!(delta2.added.is_empty());
        assert!(delta2.dropped.is_empty());
    }

    #[test]
    fn dropped_peers_are_detected() {
        let k = addr(4, 6881);
        let a = addr(1, 1);
        let b = addr(2, 2);

        let mut session = Session::new(k, Some(1), Duration::from_secs(30));
        session.previously_connected = [a, b].into_iter().collect();

        let current: HashSet<SocketAddr> = [a].into_iter().collect();
        let delta = compute_delta(&mut session, &current, 50);
        assert!(delta.added.is_empty());
        assert_eq!(delta.dropped, vec![b]);
    }

    #[test]
    fn empty_send_does_not_reset_consecutive_failures() {
        let mut session = Session::new(addr(4, 1), Some(1), Duration::from_secs(30));
        session.consecutive_failures = 3;
        session.record_send_outcome(false, false, false, false);
        assert_eq!(session.consecutive_failures, 3);
    }

    #[test]
    fn successful_non_empty_send_resets_consecutive_failures() {
        let mut session = Session::new(addr(4, 1), Some(1), Duration::from_secs(30));
        session.consecutive_failures = 3;
        session.record_send_outcome(true, true, false, false);
        assert_eq!(session.consecutive_failures, 0);
    }

    #[test]
    fn failed_send_increments_consecutive_failures() {
        let mut session = Session::new(addr(4, 1), Some(1), Duration::from_secs(30));
        session.record_send_outcome(true, false, false, false);
        assert_eq!(session.consecutive_failures, 1);
    }

    #[test]
    fn failed_added_only_send_increments_even_though_dropped_was_not_attempted() {
        let mut session = Session::new(addr(4, 1), Some(1), Duration::from_secs(30));
        session.record_send_outcome(true, false, false, true);
        assert_eq!(session.consecutive_failures, 1);
    }

    #[test]
    fn max_peers_per_interval_truncates_added_list() {
        let k = addr(4, 6881);
        let mut session = Session::new(k, Some(1), Duration::from_secs(30));
        let current: HashSet<SocketAddr> = (0..100).map(|i| addr((i % 250) as u8, i as u16)).collect();
        let delta = compute_delta(&mut session, &current, 10);
        assert_eq!(delta.added.len(), 10);
    }
}
