//! Onion-relay circuit chains.
//!
//! A chain is an ordered list of hop identities; traffic enters at the
//! head and exits toward the target. Chains are usable once they hold at
//! least two hops. Rotation cyclically shifts the list so the head hop an
//! outside observer sees keeps changing without tearing the circuit down;
//! a global timer rotates every chain on an interval.

use crate::error::{Error, Result};
use libp2p::Multiaddr;
use libp2p_identity::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

/// Minimum hops for a usable circuit.
pub const MIN_CHAIN_LENGTH: usize = 2;

/// Default rotation interval (5 minutes).
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// An ordered list of relay hops.
#[derive(Debug, Clone, Default)]
pub struct CircuitChain {
    hops: Vec<PeerId>,
}

impl CircuitChain {
    /// Build a chain from explicit hops.
    pub fn new(hops: Vec<PeerId>) -> Self {
        Self { hops }
    }

    /// Current hops, head first.
    pub fn hops(&self) -> &[PeerId] {
        &self.hops
    }

    /// Whether the chain can carry traffic.
    pub fn is_usable(&self) -> bool {
        self.hops.len() >= MIN_CHAIN_LENGTH
    }

    /// Full path through the chain toward `target`.
    pub fn build_path(&self, target: PeerId) -> Result<Vec<PeerId>> {
        if !self.is_usable() {
            return Err(Error::Protocol(format!(
                "relay chain needs at least {} hops",
                MIN_CHAIN_LENGTH
            )));
        }
        let mut path = Vec::with_capacity(self.hops.len() + 1);
        path.extend_from_slice(&self.hops);
        path.push(target);
        Ok(path)
    }

    /// Cyclically shift: the head hop moves to the tail.
    ///
    /// The hop multiset is preserved; only the entry point changes.
    pub fn rotate(&mut self) {
        if self.hops.is_empty() {
            return;
        }
        self.hops.rotate_left(1);
    }

    /// Append a hop.
    pub fn add_relay(&mut self, hop: PeerId) {
        self.hops.push(hop);
    }

    /// Remove a hop. Removing the last hop is permitted; the chain simply
    /// becomes unusable until refilled.
    pub fn remove_relay(&mut self, hop: &PeerId) -> bool {
        let before = self.hops.len();
        self.hops.retain(|h| h != hop);
        self.hops.len() != before
    }
}

/// Dialable view of one relay hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAddrInfo {
    /// Hop identity.
    pub peer: PeerId,
    /// Known addresses for the hop; empty for self-hosted ephemeral hops.
    pub addrs: Vec<Multiaddr>,
}

/// Named relay chains with periodic rotation.
pub struct RelayManager {
    chains: Arc<RwLock<HashMap<String, CircuitChain>>>,
    /// Pool of configured relay identities used when constructing chains.
    candidates: Vec<PeerId>,
    /// Known addresses per relay identity, from configuration.
    addresses: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
}

impl RelayManager {
    /// Create a manager over a pool of candidate relay identities.
    ///
    /// An empty pool still works: chains are then built from freshly
    /// generated identities, the way a node runs self-hosted hops.
    pub fn new(candidates: Vec<PeerId>) -> Self {
        Self {
            chains: Arc::new(RwLock::new(HashMap::new())),
            candidates,
            addresses: RwLock::new(HashMap::new()),
        }
    }

    /// Record a dialable address for a relay identity.
    pub async fn register_relay_addr(&self, peer: PeerId, addr: Multiaddr) {
        let mut addresses = self.addresses.write().await;
        let addrs = addresses.entry(peer).or_default();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    /// Create (or replace) a chain of `hop_count` hops.
    pub async fn create_chain(&self, id: &str, hop_count: usize) -> Result<()> {
        let mut hops = Vec::with_capacity(hop_count);
        for i in 0..hop_count {
            let hop = self
                .candidates
                .get(i)
                .copied()
                .unwrap_or_else(generate_hop_identity);
            hops.push(hop);
        }

        self.chains
            .write()
            .await
            .insert(id.to_string(), CircuitChain::new(hops));
        info!(chain = id, hop_count, "created relay chain");
        Ok(())
    }

    /// Path through a chain toward `target`.
    pub async fn build_path(&self, chain_id: &str, target: PeerId) -> Result<Vec<PeerId>> {
        let chains = self.chains.read().await;
        let chain = chains.get(chain_id).ok_or(Error::NotFound)?;
        chain.build_path(target)
    }

    /// Dialable addresses for a chain's hops, head first.
    ///
    /// Hops without a registered address (self-hosted ephemeral
    /// identities) are reported with an empty address list.
    pub async fn get_relay_addrs(&self, chain_id: &str) -> Result<Vec<RelayAddrInfo>> {
        let hops = {
            let chains = self.chains.read().await;
            chains.get(chain_id).ok_or(Error::NotFound)?.hops().to_vec()
        };

        let addresses = self.addresses.read().await;
        Ok(hops
            .into_iter()
            .map(|peer| RelayAddrInfo {
                peer,
                addrs: addresses.get(&peer).cloned().unwrap_or_default(),
            })
            .collect())
    }

    /// Append a hop to a chain.
    pub async fn add_relay(&self, chain_id: &str, hop: PeerId) -> Result<()> {
        let mut chains = self.chains.write().await;
        let chain = chains.get_mut(chain_id).ok_or(Error::NotFound)?;
        chain.add_relay(hop);
        Ok(())
    }

    /// Remove a hop from a chain.
    pub async fn remove_relay(&self, chain_id: &str, hop: &PeerId) -> Result<bool> {
        let mut chains = self.chains.write().await;
        let chain = chains.get_mut(chain_id).ok_or(Error::NotFound)?;
        Ok(chain.remove_relay(hop))
    }

    /// Rotate every chain once.
    pub async fn rotate_all(&self) {
        let mut chains = self.chains.write().await;
        for (id, chain) in chains.iter_mut() {
            chain.rotate();
            debug!(chain = %id, "rotated relay chain");
        }
    }

    /// Snapshot of all chains.
    pub async fn get_chains(&self) -> HashMap<String, Vec<PeerId>> {
        self.chains
            .read()
            .await
            .iter()
            .map(|(id, chain)| (id.clone(), chain.hops().to_vec()))
            .collect()
    }

    /// Drop every chain.
    pub async fn close(&self) {
        self.chains.write().await.clear();
    }

    /// Spawn the global rotation timer.
    pub fn start_rotation(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let chains = Arc::clone(&self.chains);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the first
            // rotation happens one interval after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut chains = chains.write().await;
                        for (id, chain) in chains.iter_mut() {
                            chain.rotate();
                            debug!(chain = %id, "rotated relay chain");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

fn generate_hop_identity() -> PeerId {
    libp2p_identity::Keypair::generate_ed25519()
        .public()
        .to_peer_id()
}

/// Parse a configured relay entry of the form `<multiaddr>/p2p/<peer-id>`.
pub fn parse_relay_addr(entry: &str) -> Result<(PeerId, Multiaddr)> {
    let addr: Multiaddr = entry
        .parse()
        .map_err(|_| Error::Config(format!("invalid relay multiaddr: {}", entry)))?;

    let peer = addr.iter().find_map(|p| match p {
        libp2p::multiaddr::Protocol::P2p(peer) => Some(peer),
        _ => None,
    });
    let peer = peer.ok_or_else(|| Error::Config("relay addr missing /p2p/<id>".into()))?;
    Ok((peer, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop() -> PeerId {
        generate_hop_identity()
    }

    #[test]
    fn test_rotation_preserves_hop_multiset() {
        let hops = vec![hop(), hop(), hop()];
        let mut chain = CircuitChain::new(hops.clone());

        chain.rotate();
        assert_eq!(chain.hops(), &[hops[1], hops[2], hops[0]]);

        let mut sorted_before: Vec<_> = hops.iter().map(|h| h.to_bytes()).collect();
        let mut sorted_after: Vec<_> = chain.hops().iter().map(|h| h.to_bytes()).collect();
        sorted_before.sort();
        sorted_after.sort();
        assert_eq!(sorted_before, sorted_after);

        // A full cycle returns to the original order.
        chain.rotate();
        chain.rotate();
        assert_eq!(chain.hops(), hops.as_slice());
    }

    #[test]
    fn test_build_path_appends_target() {
        let hops = vec![hop(), hop()];
        let chain = CircuitChain::new(hops.clone());
        let target = hop();

        let path = chain.build_path(target).expect("path");
        assert_eq!(path, vec![hops[0], hops[1], target]);
    }

    #[test]
    fn test_short_chain_is_unusable() {
        let chain = CircuitChain::new(vec![hop()]);
        assert!(!chain.is_usable());
        assert!(chain.build_path(hop()).is_err());
    }

    #[test]
    fn test_remove_last_relay_permitted() {
        let only = hop();
        let mut chain = CircuitChain::new(vec![only]);
        assert!(chain.remove_relay(&only));
        assert!(chain.hops().is_empty());
        assert!(!chain.remove_relay(&only));

        // Refilling restores usability.
        chain.add_relay(hop());
        chain.add_relay(hop());
        assert!(chain.is_usable());
    }

    #[tokio::test]
    async fn test_manager_lifecycle() {
        let manager = RelayManager::new(Vec::new());
        manager.create_chain("main", 3).await.expect("create");

        let chains = manager.get_chains().await;
        assert_eq!(chains.get("main").map(|h| h.len()), Some(3));

        let target = hop();
        let path = manager.build_path("main", target).await.expect("path");
        assert_eq!(path.len(), 4);
        assert_eq!(path[3], target);

        assert!(matches!(
            manager.build_path("missing", target).await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_rotate_all_shifts_heads() {
        let manager = RelayManager::new(Vec::new());
        manager.create_chain("a", 3).await.expect("create");
        manager.create_chain("b", 2).await.expect("create");

        let before = manager.get_chains().await;
        manager.rotate_all().await;
        let after = manager.get_chains().await;

        for id in ["a", "b"] {
            let old = &before[id];
            let new = &after[id];
            assert_ne!(old[0], new[0]);
            assert_eq!(new[new.len() - 1], old[0]);
        }
    }

    #[tokio::test]
    async fn test_candidates_seed_chains() {
        let pool = vec![hop(), hop()];
        let manager = RelayManager::new(pool.clone());
        manager.create_chain("c", 2).await.expect("create");

        let chains = manager.get_chains().await;
        assert_eq!(chains["c"], pool);
    }

    #[tokio::test]
    async fn test_get_relay_addrs() {
        let first = hop();
        let second = hop();
        let manager = RelayManager::new(vec![first, second]);

        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/4100".parse().expect("multiaddr");
        manager.register_relay_addr(first, addr.clone()).await;
        // Registering the same address twice does not duplicate it.
        manager.register_relay_addr(first, addr.clone()).await;

        manager.create_chain("c", 2).await.expect("create");

        let infos = manager.get_relay_addrs("c").await.expect("addrs");
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].peer, first);
        assert_eq!(infos[0].addrs, vec![addr]);
        // No address registered for the second hop.
        assert_eq!(infos[1].peer, second);
        assert!(infos[1].addrs.is_empty());

        // Rotation is reflected in the head-first ordering.
        manager.rotate_all().await;
        let infos = manager.get_relay_addrs("c").await.expect("addrs");
        assert_eq!(infos[0].peer, second);

        assert!(matches!(
            manager.get_relay_addrs("missing").await,
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_parse_relay_addr() {
        let peer = hop();
        let entry = format!("/ip4/10.0.0.1/tcp/4100/p2p/{}", peer);

        let (parsed_peer, addr) = parse_relay_addr(&entry).expect("parse");
        assert_eq!(parsed_peer, peer);
        assert!(addr.to_string().starts_with("/ip4/10.0.0.1/tcp/4100"));

        assert!(parse_relay_addr("/ip4/10.0.0.1/tcp/4100").is_err());
        assert!(parse_relay_addr("not a multiaddr").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_timer() {
        let manager = Arc::new(RelayManager::new(Vec::new()));
        manager.create_chain("t", 3).await.expect("create");
        let before = manager.get_chains().await["t"].clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = manager.start_rotation(Duration::from_secs(300), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(301)).await;
        let after = manager.get_chains().await["t"].clone();
        assert_ne!(before[0], after[0]);

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }
}
