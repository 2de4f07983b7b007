//! Pluggable client-facing transports.
//!
//! Each transport is a value with a dial/listen capability and a kind tag;
//! the manager owns one per kind plus a fallback order. The peer-to-peer
//! transport is handled by the libp2p stack in `net::discovery`, so the
//! manager treats `p2p` as a registered-or-absent kind like the others.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Transport kinds, in default fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// libp2p overlay.
    P2p,
    /// QUIC.
    Quic,
    /// WebSocket over TLS.
    Wss,
    /// Plain TCP.
    Tcp,
}

impl TransportKind {
    /// Stable string tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::P2p => "p2p",
            TransportKind::Quic => "quic",
            TransportKind::Wss => "wss",
            TransportKind::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered transport endpoint.
#[derive(Debug, Clone)]
pub struct TransportDescriptor {
    /// Unique transport id.
    pub id: String,
    /// Kind tag.
    pub kind: TransportKind,
    /// Dial endpoint.
    pub endpoint: String,
    /// Static priority; lower wins ties.
    pub priority: u32,
}

/// An established connection on some transport.
pub enum PeerLink {
    /// TCP stream.
    Tcp(TcpStream),
    /// QUIC connection.
    Quic(quinn::Connection),
    /// WebSocket stream.
    Wss(Box<WebSocketStream<MaybeTlsStream<TcpStream>>>),
}

impl PeerLink {
    /// The kind of transport carrying this link.
    pub fn kind(&self) -> TransportKind {
        match self {
            PeerLink::Tcp(_) => TransportKind::Tcp,
            PeerLink::Quic(_) => TransportKind::Quic,
            PeerLink::Wss(_) => TransportKind::Wss,
        }
    }
}

/// A listening socket on some transport.
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
}

/// A dialer/listener for one transport kind.
pub enum Transport {
    /// Plain TCP.
    Tcp,
    /// QUIC with a shared client endpoint.
    Quic(QuicTransport),
    /// WebSocket over TLS (dial only).
    Wss,
}

impl Transport {
    /// Kind tag of this transport.
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Tcp => TransportKind::Tcp,
            Transport::Quic(_) => TransportKind::Quic,
            Transport::Wss => TransportKind::Wss,
        }
    }

    /// Dial `addr` within `deadline`.
    pub async fn dial(&self, addr: &str, deadline: Duration) -> Result<PeerLink> {
        let attempt = async {
            match self {
                Transport::Tcp => {
                    let stream = TcpStream::connect(addr)
                        .await
                        .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
                    Ok(PeerLink::Tcp(stream))
                }
                Transport::Quic(quic) => quic.dial(addr).await,
                Transport::Wss => {
                    let url = format!("wss://{}/ws", addr);
                    let (stream, _response) = tokio_tungstenite::connect_async(&url)
                        .await
                        .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
                    Ok(PeerLink::Wss(Box::new(stream)))
                }
            }
        };

        tokio::time::timeout(deadline, attempt)
            .await
            .map_err(|_| Error::TransportUnavailable(format!("dial timeout ({})", self.kind())))?
    }

    /// Open a listener on `addr`.
    ///
    /// QUIC and WSS listening require the node's TLS termination and are
    /// handled by the outer server; only TCP listens here.
    pub async fn listen(&self, addr: &str) -> Result<Listener> {
        match self {
            Transport::Tcp => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
                Ok(Listener::Tcp(listener))
            }
            other => Err(Error::TransportUnavailable(format!(
                "{} listen is handled by the node front end",
                other.kind()
            ))),
        }
    }
}

/// QUIC dialer sharing one client endpoint.
pub struct QuicTransport {
    endpoint: quinn::Endpoint,
}

impl QuicTransport {
    /// Build a client endpoint trusting the WebPKI roots.
    pub fn new() -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let client_config = quinn::ClientConfig::with_root_certificates(Arc::new(roots))
            .map_err(|e| Error::TransportUnavailable(format!("quic tls: {}", e)))?;

        let bind: SocketAddr = "0.0.0.0:0"
            .parse()
            .map_err(|_| Error::Internal("quic bind addr".into()))?;
        let mut endpoint =
            quinn::Endpoint::client(bind).map_err(|e| Error::TransportUnavailable(e.to_string()))?;
        endpoint.set_default_client_config(client_config);

        Ok(Self { endpoint })
    }

    async fn dial(&self, addr: &str) -> Result<PeerLink> {
        let (host, _port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::TransportUnavailable("quic addr missing port".into()))?;
        let socket_addr: SocketAddr = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?
            .next()
            .ok_or_else(|| Error::TransportUnavailable("quic addr did not resolve".into()))?;

        let connecting = self
            .endpoint
            .connect(socket_addr, host)
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
        let connection = connecting
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
        Ok(PeerLink::Quic(connection))
    }
}

/// Owns one transport per kind and the fallback order.
pub struct TransportManager {
    transports: RwLock<HashMap<TransportKind, Arc<Transport>>>,
    active: RwLock<Option<TransportKind>>,
    fallbacks: Vec<TransportKind>,
    dial_deadline: Duration,
}

impl TransportManager {
    /// Create an empty manager with the default fallback order.
    pub fn new() -> Self {
        Self {
            transports: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            fallbacks: vec![
                TransportKind::P2p,
                TransportKind::Quic,
                TransportKind::Wss,
                TransportKind::Tcp,
            ],
            dial_deadline: Duration::from_secs(10),
        }
    }

    /// Override the per-dial deadline (default 10 s).
    pub fn with_dial_deadline(mut self, deadline: Duration) -> Self {
        self.dial_deadline = deadline;
        self
    }

    /// Register a transport. The first registered becomes active.
    pub async fn add_transport(&self, transport: Transport) {
        let kind = transport.kind();
        self.transports.write().await.insert(kind, Arc::new(transport));

        let mut active = self.active.write().await;
        if active.is_none() {
            *active = Some(kind);
        }
    }

    /// The currently active transport kind.
    pub async fn active(&self) -> Option<TransportKind> {
        *self.active.read().await
    }

    /// Switch the active transport.
    pub async fn set_active(&self, kind: TransportKind) -> Result<()> {
        if !self.transports.read().await.contains_key(&kind) {
            return Err(Error::TransportUnavailable(format!(
                "{} not registered",
                kind
            )));
        }
        *self.active.write().await = Some(kind);
        Ok(())
    }

    /// Dial on a specific transport kind.
    pub async fn dial(&self, kind: TransportKind, addr: &str) -> Result<PeerLink> {
        // Clone the handle out so the lock never spans the dial.
        let transport = self
            .transports
            .read()
            .await
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::TransportUnavailable(format!("{} not registered", kind)))?;
        transport.dial(addr, self.dial_deadline).await
    }

    /// Dial `addr`, preferring the active transport, then walking the
    /// fallback order. Fails with [`Error::AllTransportsFailed`] only when
    /// every registered transport failed.
    pub async fn dial_with_fallback(&self, addr: &str) -> Result<PeerLink> {
        let mut order = Vec::with_capacity(1 + self.fallbacks.len());
        if let Some(active) = *self.active.read().await {
            order.push(active);
        }
        for kind in &self.fallbacks {
            if !order.contains(kind) {
                order.push(*kind);
            }
        }

        let mut last_error = None;
        for kind in order {
            let Some(transport) = self.transports.read().await.get(&kind).cloned() else {
                continue;
            };
            match transport.dial(addr, self.dial_deadline).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    tracing::debug!(%kind, error = %e, "fallback dial failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(Error::AllTransportsFailed))
    }
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_registered_becomes_active() {
        let manager = TransportManager::new();
        assert_eq!(manager.active().await, None);

        manager.add_transport(Transport::Tcp).await;
        assert_eq!(manager.active().await, Some(TransportKind::Tcp));

        manager.add_transport(Transport::Wss).await;
        assert_eq!(manager.active().await, Some(TransportKind::Tcp));
    }

    #[tokio::test]
    async fn test_set_active_requires_registration() {
        let manager = TransportManager::new();
        manager.add_transport(Transport::Tcp).await;

        assert!(manager.set_active(TransportKind::Quic).await.is_err());
        manager.set_active(TransportKind::Tcp).await.expect("set");
        assert_eq!(manager.active().await, Some(TransportKind::Tcp));
    }

    #[tokio::test]
    async fn test_tcp_dial_and_listen() {
        let manager = TransportManager::new();
        manager.add_transport(Transport::Tcp).await;

        let transports = manager.transports.read().await;
        let tcp = transports.get(&TransportKind::Tcp).expect("registered");
        let Listener::Tcp(listener) = tcp.listen("127.0.0.1:0").await.expect("listen");
        let addr = listener.local_addr().expect("addr");
        drop(transports);

        let accept = tokio::spawn(async move { listener.accept().await });
        let link = manager
            .dial(TransportKind::Tcp, &addr.to_string())
            .await
            .expect("dial");
        assert_eq!(link.kind(), TransportKind::Tcp);
        accept.await.expect("join").expect("accept");
    }

    #[tokio::test]
    async fn test_fallback_walks_to_working_transport() {
        let manager = TransportManager::new().with_dial_deadline(Duration::from_millis(500));
        manager.add_transport(Transport::Tcp).await;
        manager.add_transport(Transport::Wss).await;
        manager.set_active(TransportKind::Wss).await.expect("set");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accept_loop = tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        // WSS against a raw TCP listener stalls in its handshake until the
        // deadline; the manager falls back to TCP.
        let link = manager
            .dial_with_fallback(&addr.to_string())
            .await
            .expect("fallback dial");
        assert_eq!(link.kind(), TransportKind::Tcp);
        accept_loop.abort();
    }

    #[tokio::test]
    async fn test_unregistered_dial_fails() {
        let manager = TransportManager::new();
        assert!(matches!(
            manager.dial(TransportKind::Tcp, "127.0.0.1:1").await,
            Err(Error::TransportUnavailable(_))
        ));
        assert!(matches!(
            manager.dial_with_fallback("127.0.0.1:1").await,
            Err(Error::AllTransportsFailed)
        ));
    }
}
