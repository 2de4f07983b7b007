//! Networking: peer streams, discovery, relay circuits, and adaptive
//! transport routing.
//!
//! The stream table, discovery cache, relay chain map, and router are
//! separate registries keyed by ids (peer id, user id, transport id);
//! components look each other up through these registries rather than
//! holding mutual references.

pub mod discovery;
pub mod relay;
pub mod router;
pub mod streams;
pub mod transport;

pub use discovery::{Discovery, DiscoveryConfig};
pub use relay::{
    parse_relay_addr, CircuitChain, RelayAddrInfo, RelayManager, DEFAULT_ROTATION_INTERVAL,
    MIN_CHAIN_LENGTH,
};
pub use router::{
    AdaptiveRouter, MigrationEvent, ProbeLoop, RouteMetrics, RouteMetricsEntry, ScoreWeights,
};
pub use streams::{InboundFrame, StreamManager, MESSAGE_PROTOCOL};
pub use transport::{
    PeerLink, QuicTransport, Transport, TransportDescriptor, TransportKind, TransportManager,
};
