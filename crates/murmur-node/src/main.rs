//! Murmur node daemon.
//!
//! Loads configuration, opens the database, wires the subsystems, and
//! runs the background loops (transport probing, relay rotation, peer
//! discovery) until interrupted. The RPC front end attaches to the
//! services constructed here.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use murmur_core::auth::{AuthService, SecondFactor, TokenIssuer};
use murmur_core::config::Config;
use murmur_core::crypto::password::PasswordHasher;
use murmur_core::groups::GroupService;
use murmur_core::messaging::MessagingService;
use murmur_core::net::{
    AdaptiveRouter, Discovery, DiscoveryConfig, ProbeLoop, QuicTransport, RelayManager,
    StreamManager, Transport, TransportDescriptor, TransportKind, TransportManager,
    DEFAULT_ROTATION_INTERVAL,
};
use murmur_core::storage::{Database, DatabaseConfig};

/// Murmur - decentralized end-to-end encrypted messaging node
#[derive(Parser)]
#[command(name = "murmur-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config))?;
    info!(version = murmur_core::VERSION, "starting murmur node");

    let db = Database::open(&DatabaseConfig {
        dsn: config.database.dsn.clone(),
    })
    .context("opening database")?;
    let db = Arc::new(Mutex::new(db));

    // Services.
    let token_key = if config.security.token.symmetric_key_base64.is_empty() {
        warn!("no token key configured; generating an ephemeral one (tokens die with this process)");
        murmur_core::crypto::random_bytes::<32>()
    } else {
        config.token_key().context("token key")?
    };
    let auth = Arc::new(AuthService::new(
        db.clone(),
        PasswordHasher::new(
            config.security.kdf.time,
            config.security.kdf.memory_mb,
            config.security.kdf.threads,
            config.security.kdf.key_len,
        ),
        TokenIssuer::new(
            token_key,
            config.security.token.issuer.clone(),
            config.access_token_ttl(),
        )
        .with_allowed_skew(Duration::from_secs(
            config.security.secondary_key.allowed_clock_skew_sec,
        )),
        SecondFactor::new(
            config.security.secondary_key.length,
            config.security.secondary_key.rotate_minutes,
        ),
        config.refresh_token_ttl(),
    ));
    let messaging = Arc::new(MessagingService::new(db.clone()));
    let groups = Arc::new(GroupService::new(db.clone()));
    let _ = (auth, messaging, groups); // handed to the RPC front end

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Peer-to-peer discovery and message streams.
    let discovery = Discovery::spawn(DiscoveryConfig {
        listen_addrs: Vec::new(),
        bootstrap_nodes: config.routing.bootstrap_nodes.clone(),
        enable_mdns: true,
    })
    .context("starting discovery")?;
    info!(peer_id = %discovery.local_peer_id(), "peer-to-peer identity ready");

    let (stream_manager, mut inbound_frames) =
        StreamManager::new(discovery.stream_control()).context("starting stream layer")?;
    let stream_manager = Arc::new(stream_manager);
    let messaging_for_frames = Arc::new(MessagingService::new(db.clone()));
    tokio::spawn(async move {
        while let Some(frame) = inbound_frames.recv().await {
            if let Err(e) = messaging_for_frames.send(&frame.payload).await {
                warn!(peer = %frame.peer, error = %e, "dropping peer frame");
            }
        }
    });

    // Transports and adaptive routing.
    let transport_manager = Arc::new(TransportManager::new());
    transport_manager.add_transport(Transport::Tcp).await;
    match QuicTransport::new() {
        Ok(quic) => transport_manager.add_transport(Transport::Quic(quic)).await,
        Err(e) => warn!(error = %e, "quic transport unavailable"),
    }
    if config.server.transports.enable_wss {
        transport_manager.add_transport(Transport::Wss).await;
    }

    let router = Arc::new(AdaptiveRouter::new(
        config.metrics_window(),
        config.switch_threshold(),
    ));
    if !config.server.listen.tcp.is_empty() {
        router.add_transport(TransportDescriptor {
            id: "tcp".to_string(),
            kind: TransportKind::Tcp,
            endpoint: config.server.listen.tcp.clone(),
            priority: 3,
        });
    }
    if !config.server.listen.quic.is_empty() {
        router.add_transport(TransportDescriptor {
            id: "quic".to_string(),
            kind: TransportKind::Quic,
            endpoint: config.server.listen.quic.clone(),
            priority: 1,
        });
    }

    let (migration_tx, mut migration_rx) = mpsc::unbounded_channel();
    let probe = ProbeLoop::new(router.clone(), transport_manager.clone());
    tokio::spawn(probe.run(migration_tx, shutdown_rx.clone()));

    let manager_for_migrations = transport_manager.clone();
    tokio::spawn(async move {
        while let Some(event) = migration_rx.recv().await {
            info!(from = ?event.from, to = %event.to, "active transport migrated");
            let kind = match event.to.as_str() {
                "quic" => TransportKind::Quic,
                "wss" => TransportKind::Wss,
                "p2p" => TransportKind::P2p,
                _ => TransportKind::Tcp,
            };
            if let Err(e) = manager_for_migrations.set_active(kind).await {
                warn!(error = %e, "failed to switch active transport");
            }
        }
    });

    // Relay chains.
    let mut relay_hops = Vec::new();
    for entry in &config.routing.relays {
        match murmur_core::net::parse_relay_addr(entry) {
            Ok(hop) => relay_hops.push(hop),
            Err(e) => warn!(relay = %entry, error = %e, "skipping relay entry"),
        }
    }
    let relay_manager = Arc::new(RelayManager::new(
        relay_hops.iter().map(|(peer, _)| *peer).collect(),
    ));
    for (peer, addr) in relay_hops.iter().cloned() {
        relay_manager.register_relay_addr(peer, addr).await;
    }
    if !relay_hops.is_empty() {
        relay_manager
            .create_chain("default", relay_hops.len().max(2))
            .await
            .context("creating default relay chain")?;
    }
    let rotation = relay_manager.start_rotation(DEFAULT_ROTATION_INTERVAL, shutdown_rx.clone());

    info!("node is up");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    stream_manager.shutdown().await;
    relay_manager.close().await;
    let _ = rotation.await;

    Ok(())
}
