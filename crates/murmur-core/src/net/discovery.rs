//! Peer discovery.
//!
//! Two sources feed the user→peer cache: a Kademlia DHT where a node
//! advertises the rendezvous namespace `user:<user_id>` as a provider
//! record, and local mDNS, whose discoveries are cached and dialed in the
//! background. Lookups serve fresh cache entries (30 s) and fall back to
//! a live DHT provider query. Self-advertisement repeats periodically.
//!
//! The swarm runs in one background task; the rest of the node talks to
//! it through a command channel.

use crate::error::{Error, Result as CrateResult};
use futures::StreamExt;
use libp2p::{
    identify, identity,
    kad::{self, store::MemoryStore, RecordKey},
    mdns, noise,
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use libp2p_stream as stream;
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Cache entries fresher than this are served without a DHT query.
pub const CACHE_FRESHNESS: Duration = Duration::from_secs(30);

/// Re-announce period for advertised users.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// User→peer cache capacity.
const CACHE_CAPACITY: usize = 1024;

/// Identify protocol version string.
const IDENTIFY_PROTOCOL: &str = "/murmur/id/1.0.0";

#[derive(NetworkBehaviour)]
struct NodeBehaviour {
    kad: kad::Behaviour<MemoryStore>,
    mdns: mdns::tokio::Behaviour,
    identify: identify::Behaviour,
    stream: stream::Behaviour,
}

/// Discovery configuration.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryConfig {
    /// Listen multiaddrs; defaults to an ephemeral TCP port on all
    /// interfaces when empty.
    pub listen_addrs: Vec<String>,
    /// Bootstrap peers as `<multiaddr>/p2p/<peer-id>` strings.
    pub bootstrap_nodes: Vec<String>,
    /// Enable local mDNS discovery.
    pub enable_mdns: bool,
}

enum Command {
    AnnounceUser {
        user_id: String,
    },
    FindPeers {
        user_id: String,
        reply: oneshot::Sender<CrateResult<Vec<PeerId>>>,
    },
    Dial {
        addr: Multiaddr,
    },
    ActivePeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
}

/// Handle to the discovery task.
#[derive(Clone)]
pub struct Discovery {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    stream_control: stream::Control,
}

impl Discovery {
    /// Build the swarm and spawn the discovery task.
    pub fn spawn(config: DiscoveryConfig) -> CrateResult<Self> {
        let keypair = identity::Keypair::generate_ed25519();
        let local_peer_id = keypair.public().to_peer_id();

        let mut swarm = build_swarm(keypair, config.enable_mdns)?;

        let listen_addrs = if config.listen_addrs.is_empty() {
            vec!["/ip4/0.0.0.0/tcp/0".to_string()]
        } else {
            config.listen_addrs.clone()
        };
        for addr in &listen_addrs {
            let addr: Multiaddr = addr
                .parse()
                .map_err(|_| Error::Config(format!("invalid listen addr: {}", addr)))?;
            swarm
                .listen_on(addr)
                .map_err(|e| Error::Unavailable(format!("listen: {}", e)))?;
        }

        for node in &config.bootstrap_nodes {
            match parse_bootstrap(node) {
                Ok((peer, addr)) => {
                    swarm.behaviour_mut().kad.add_address(&peer, addr.clone());
                    if let Err(e) = swarm.dial(addr) {
                        debug!(%peer, error = %e, "bootstrap dial failed");
                    }
                }
                Err(e) => warn!(node = %node, error = %e, "skipping bootstrap node"),
            }
        }
        if !config.bootstrap_nodes.is_empty() {
            if let Err(e) = swarm.behaviour_mut().kad.bootstrap() {
                warn!(error = %e, "kademlia bootstrap failed");
            }
        }

        let stream_control = swarm.behaviour_mut().stream.new_control();
        let (command_tx, command_rx) = mpsc::channel(64);
        tokio::spawn(drive_swarm(swarm, command_rx));

        Ok(Self {
            local_peer_id,
            commands: command_tx,
            stream_control,
        })
    }

    /// Our peer id.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Control handle for opening peer message streams.
    pub fn stream_control(&self) -> stream::Control {
        self.stream_control.clone()
    }

    /// Advertise this node as a rendezvous provider for a user.
    pub async fn announce_user(&self, user_id: &str) -> CrateResult<()> {
        self.commands
            .send(Command::AnnounceUser {
                user_id: user_id.to_string(),
            })
            .await
            .map_err(|_| Error::Unavailable("discovery task stopped".into()))
    }

    /// Peers serving a user, from cache when fresh, else a live search.
    pub async fn find_peers_for_user(&self, user_id: &str) -> CrateResult<Vec<PeerId>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::FindPeers {
                user_id: user_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Unavailable("discovery task stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Unavailable("discovery task stopped".into()))?
    }

    /// Dial a multiaddr.
    pub async fn dial(&self, addr: Multiaddr) -> CrateResult<()> {
        self.commands
            .send(Command::Dial { addr })
            .await
            .map_err(|_| Error::Unavailable("discovery task stopped".into()))
    }

    /// Currently connected peers.
    pub async fn active_peers(&self) -> CrateResult<Vec<PeerId>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::ActivePeers { reply: reply_tx })
            .await
            .map_err(|_| Error::Unavailable("discovery task stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Unavailable("discovery task stopped".into()))
    }
}

fn build_swarm(keypair: identity::Keypair, enable_mdns: bool) -> CrateResult<Swarm<NodeBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| Error::Unavailable(format!("tcp transport: {}", e)))?
        .with_quic()
        .with_behaviour(|key| {
            let peer_id = key.public().to_peer_id();

            let mut kad_config = kad::Config::new(kad::PROTOCOL_NAME);
            kad_config.set_provider_record_ttl(Some(Duration::from_secs(48 * 3600)));
            let mut kad =
                kad::Behaviour::with_config(peer_id, MemoryStore::new(peer_id), kad_config);
            kad.set_mode(Some(kad::Mode::Server));

            let mdns_config = if enable_mdns {
                mdns::Config::default()
            } else {
                // Disabled mDNS still needs a behaviour instance; a very
                // long query interval keeps it quiet.
                mdns::Config {
                    query_interval: Duration::from_secs(24 * 3600),
                    ..Default::default()
                }
            };
            let mdns = mdns::tokio::Behaviour::new(mdns_config, peer_id)?;

            let identify = identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTOCOL.to_string(),
                key.public(),
            ));

            Ok(NodeBehaviour {
                kad,
                mdns,
                identify,
                stream: stream::Behaviour::new(),
            })
        })
        .map_err(|e| Error::Unavailable(format!("behaviour: {}", e)))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(120)))
        .build();
    Ok(swarm)
}

struct DriverState {
    cache: LruCache<String, (Vec<PeerId>, Instant)>,
    pending_queries: HashMap<kad::QueryId, PendingQuery>,
    announced: HashSet<String>,
    connected: HashSet<PeerId>,
}

struct PendingQuery {
    user_id: String,
    providers: HashSet<PeerId>,
    reply: oneshot::Sender<CrateResult<Vec<PeerId>>>,
}

async fn drive_swarm(mut swarm: Swarm<NodeBehaviour>, mut commands: mpsc::Receiver<Command>) {
    let cap = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
    let mut state = DriverState {
        cache: LruCache::new(cap),
        pending_queries: HashMap::new(),
        announced: HashSet::new(),
        connected: HashSet::new(),
    };
    let mut announce_ticker = tokio::time::interval(ANNOUNCE_INTERVAL);

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => handle_command(&mut swarm, &mut state, command),
                    None => {
                        debug!("discovery handle dropped; stopping task");
                        return;
                    }
                }
            }
            event = swarm.select_next_some() => {
                handle_swarm_event(&mut swarm, &mut state, event);
            }
            _ = announce_ticker.tick() => {
                for user_id in state.announced.clone() {
                    start_providing(&mut swarm, &user_id);
                }
            }
        }
    }
}

fn handle_command(swarm: &mut Swarm<NodeBehaviour>, state: &mut DriverState, command: Command) {
    match command {
        Command::AnnounceUser { user_id } => {
            state.announced.insert(user_id.clone());
            start_providing(swarm, &user_id);
        }
        Command::FindPeers { user_id, reply } => {
            if let Some((peers, at)) = state.cache.get(&user_id) {
                if at.elapsed() < CACHE_FRESHNESS {
                    let _ = reply.send(Ok(peers.clone()));
                    return;
                }
            }

            let key = RecordKey::new(&rendezvous_namespace(&user_id));
            let query_id = swarm.behaviour_mut().kad.get_providers(key);
            state.pending_queries.insert(
                query_id,
                PendingQuery {
                    user_id,
                    providers: HashSet::new(),
                    reply,
                },
            );
        }
        Command::Dial { addr } => {
            if let Err(e) = swarm.dial(addr) {
                debug!(error = %e, "dial failed");
            }
        }
        Command::ActivePeers { reply } => {
            let _ = reply.send(state.connected.iter().copied().collect());
        }
    }
}

fn handle_swarm_event(
    swarm: &mut Swarm<NodeBehaviour>,
    state: &mut DriverState,
    event: SwarmEvent<NodeBehaviourEvent>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            info!(%address, "listening");
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            state.connected.insert(peer_id);
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            ..
        } => {
            if num_established == 0 {
                state.connected.remove(&peer_id);
            }
        }
        SwarmEvent::Behaviour(NodeBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
            for (peer_id, addr) in peers {
                debug!(%peer_id, %addr, "mdns discovered peer");
                swarm.behaviour_mut().kad.add_address(&peer_id, addr.clone());
                // Background connection attempt at low priority.
                let opts = libp2p::swarm::dial_opts::DialOpts::peer_id(peer_id)
                    .addresses(vec![addr])
                    .build();
                if let Err(e) = swarm.dial(opts) {
                    debug!(%peer_id, error = %e, "mdns dial failed");
                }
            }
        }
        SwarmEvent::Behaviour(NodeBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
            for (peer_id, addr) in peers {
                swarm.behaviour_mut().kad.remove_address(&peer_id, &addr);
            }
        }
        SwarmEvent::Behaviour(NodeBehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
            id,
            result,
            ..
        })) => match result {
            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                providers,
                ..
            })) => {
                if let Some(pending) = state.pending_queries.get_mut(&id) {
                    let local = *swarm.local_peer_id();
                    pending
                        .providers
                        .extend(providers.into_iter().filter(|p| *p != local));
                }
            }
            kad::QueryResult::GetProviders(Ok(
                kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
            )) => {
                finish_query(state, id, None);
            }
            kad::QueryResult::GetProviders(Err(e)) => {
                finish_query(state, id, Some(Error::Unavailable(e.to_string())));
            }
            kad::QueryResult::StartProviding(Err(e)) => {
                warn!(error = %e, "provider announcement failed");
            }
            _ => {}
        },
        SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            for addr in info.listen_addrs {
                swarm.behaviour_mut().kad.add_address(&peer_id, addr);
            }
        }
        _ => {}
    }
}

fn finish_query(state: &mut DriverState, id: kad::QueryId, error: Option<Error>) {
    let Some(pending) = state.pending_queries.remove(&id) else {
        return;
    };
    match error {
        Some(e) if pending.providers.is_empty() => {
            let _ = pending.reply.send(Err(e));
        }
        _ => {
            let peers: Vec<PeerId> = pending.providers.into_iter().collect();
            state
                .cache
                .put(pending.user_id.clone(), (peers.clone(), Instant::now()));
            debug!(user = %pending.user_id, count = peers.len(), "provider query finished");
            let _ = pending.reply.send(Ok(peers));
        }
    }
}

fn start_providing(swarm: &mut Swarm<NodeBehaviour>, user_id: &str) {
    let key = RecordKey::new(&rendezvous_namespace(user_id));
    if let Err(e) = swarm.behaviour_mut().kad.start_providing(key) {
        warn!(user = user_id, error = %e, "start_providing failed");
    }
}

/// Rendezvous namespace for a user id.
pub fn rendezvous_namespace(user_id: &str) -> Vec<u8> {
    format!("user:{}", user_id).into_bytes()
}

fn parse_bootstrap(node: &str) -> CrateResult<(PeerId, Multiaddr)> {
    let addr: Multiaddr = node
        .parse()
        .map_err(|_| Error::Config(format!("invalid multiaddr: {}", node)))?;

    let peer = addr.iter().find_map(|p| match p {
        libp2p::multiaddr::Protocol::P2p(peer) => Some(peer),
        _ => None,
    });
    let peer = peer.ok_or_else(|| Error::Config("bootstrap addr missing /p2p/<id>".into()))?;
    Ok((peer, addr))
}
