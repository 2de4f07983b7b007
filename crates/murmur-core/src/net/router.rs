//! Adaptive transport routing.
//!
//! The router keeps the latest metrics per transport and scores them with
//! fixed weights over normalized latency, loss, jitter, stability,
//! blocking risk, and load. Metrics older than the staleness window score
//! zero. A background prober refreshes metrics on an interval and emits a
//! migration event whenever the best transport changes; in-flight traffic
//! finishes on the old transport.

use super::transport::{TransportDescriptor, TransportKind, TransportManager};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Live quality metrics for one transport.
#[derive(Debug, Clone)]
pub struct RouteMetrics {
    /// Round-trip latency.
    pub latency: Duration,
    /// Packet loss fraction in [0, 1].
    pub packet_loss: f64,
    /// Latency jitter.
    pub jitter: Duration,
    /// Stability estimate in [0, 1].
    pub stability: f64,
    /// Censorship/blocking risk in [0, 1].
    pub blocking_risk: f64,
    /// Utilization in [0, 1].
    pub load: f64,
}

/// A metrics entry plus its age, as reported by introspection.
#[derive(Debug, Clone)]
pub struct RouteMetricsEntry {
    /// The transport these metrics belong to.
    pub descriptor: TransportDescriptor,
    /// Latest metrics, if any probe has completed.
    pub metrics: Option<RouteMetrics>,
    /// Time since the last update.
    pub age: Option<Duration>,
    /// Current score.
    pub score: f64,
}

/// Scoring weights; non-negative, summing to 1.
#[derive(Debug, Clone)]
pub struct ScoreWeights {
    /// Weight of the latency term.
    pub latency: f64,
    /// Weight of the loss term.
    pub loss: f64,
    /// Weight of the jitter term.
    pub jitter: f64,
    /// Weight of the stability term.
    pub stability: f64,
    /// Weight of the blocking-risk term.
    pub blocking: f64,
    /// Weight of the load term.
    pub load: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            latency: 0.30,
            loss: 0.25,
            jitter: 0.15,
            stability: 0.15,
            blocking: 0.10,
            load: 0.05,
        }
    }
}

/// Emitted when the probe cycle selects a new best transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationEvent {
    /// Previously active transport id, if any.
    pub from: Option<String>,
    /// Newly active transport id.
    pub to: String,
}

struct RouterState {
    transports: Vec<TransportDescriptor>,
    metrics: HashMap<String, (RouteMetrics, Instant)>,
    active: Option<String>,
}

/// Scoring engine and active-transport tracker.
pub struct AdaptiveRouter {
    state: RwLock<RouterState>,
    weights: ScoreWeights,
    window: Duration,
    threshold: Duration,
}

impl AdaptiveRouter {
    /// Create a router with a staleness window and latency threshold.
    pub fn new(window: Duration, threshold: Duration) -> Self {
        Self {
            state: RwLock::new(RouterState {
                transports: Vec::new(),
                metrics: HashMap::new(),
                active: None,
            }),
            weights: ScoreWeights::default(),
            window,
            threshold,
        }
    }

    fn state_read(&self) -> std::sync::RwLockReadGuard<'_, RouterState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state_write(&self) -> std::sync::RwLockWriteGuard<'_, RouterState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register or replace a transport descriptor.
    pub fn add_transport(&self, descriptor: TransportDescriptor) {
        let mut state = self.state_write();
        if let Some(existing) = state.transports.iter_mut().find(|t| t.id == descriptor.id) {
            *existing = descriptor;
            return;
        }
        state.transports.push(descriptor);
    }

    /// Remove a transport and its metrics.
    pub fn remove_transport(&self, id: &str) {
        let mut state = self.state_write();
        state.transports.retain(|t| t.id != id);
        state.metrics.remove(id);
        if state.active.as_deref() == Some(id) {
            state.active = None;
        }
    }

    /// Record fresh metrics for a transport.
    pub fn update_metrics(&self, id: &str, metrics: RouteMetrics) {
        self.update_metrics_at(id, metrics, Instant::now());
    }

    fn update_metrics_at(&self, id: &str, metrics: RouteMetrics, when: Instant) {
        self.state_write()
            .metrics
            .insert(id.to_string(), (metrics, when));
    }

    /// Score a transport as of now.
    pub fn score(&self, id: &str) -> f64 {
        self.score_at(id, Instant::now())
    }

    fn score_at(&self, id: &str, now: Instant) -> f64 {
        let state = self.state_read();
        self.score_inner(&state, id, now)
    }

    /// The transport with the highest score.
    ///
    /// Ties break by static priority (lower wins), then id. Deterministic
    /// for a fixed metrics snapshot.
    pub fn select_best_transport(&self) -> Option<TransportDescriptor> {
        self.select_best_at(Instant::now())
    }

    fn select_best_at(&self, now: Instant) -> Option<TransportDescriptor> {
        let candidates: Vec<(TransportDescriptor, f64)> = {
            let state = self.state_read();
            state
                .transports
                .iter()
                .cloned()
                .map(|t| {
                    let score = self.score_inner(&state, &t.id, now);
                    (t, score)
                })
                .collect()
        };

        candidates
            .into_iter()
            .max_by(|(a, score_a), (b, score_b)| {
                score_a
                    .partial_cmp(score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Lower priority value is better, so invert for max_by.
                    .then_with(|| b.priority.cmp(&a.priority))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|(t, _)| t)
    }

    fn score_inner(&self, state: &RouterState, id: &str, now: Instant) -> f64 {
        let Some((metrics, updated)) = state.metrics.get(id) else {
            return 0.0;
        };
        if now.duration_since(*updated) > self.window {
            return 0.0;
        }

        let threshold = self.threshold.as_secs_f64().max(f64::EPSILON);
        let latency_s = 1.0 - (metrics.latency.as_secs_f64() / threshold).min(1.0);
        let loss_s = 1.0 - metrics.packet_loss;
        let jitter_s = 1.0 - (metrics.jitter.as_secs_f64() / (threshold * 0.5)).min(1.0);
        let stability_s = metrics.stability;
        let blocking_s = 1.0 - metrics.blocking_risk;
        let load_s = 1.0 - metrics.load;

        self.weights.latency * latency_s
            + self.weights.loss * loss_s
            + self.weights.jitter * jitter_s
            + self.weights.stability * stability_s
            + self.weights.blocking * blocking_s
            + self.weights.load * load_s
    }

    /// The currently active transport id.
    pub fn active(&self) -> Option<String> {
        self.state_read().active.clone()
    }

    /// Force the active transport.
    pub fn set_active(&self, id: &str) {
        self.state_write().active = Some(id.to_string());
    }

    /// Re-select after a probe cycle.
    ///
    /// When the winner differs from the active transport, the active
    /// transport switches and a [`MigrationEvent`] is returned. Already
    /// established sessions keep draining on their old transport.
    pub fn migrate_if_better(&self) -> Option<MigrationEvent> {
        let winner = self.select_best_transport()?;
        let mut state = self.state_write();
        if state.active.as_deref() == Some(winner.id.as_str()) {
            return None;
        }
        let event = MigrationEvent {
            from: state.active.clone(),
            to: winner.id.clone(),
        };
        state.active = Some(winner.id);
        Some(event)
    }

    /// Snapshot of all transports with their metrics and scores.
    pub fn metrics_snapshot(&self) -> Vec<RouteMetricsEntry> {
        let now = Instant::now();
        let state = self.state_read();
        state
            .transports
            .iter()
            .map(|t| {
                let entry = state.metrics.get(&t.id);
                RouteMetricsEntry {
                    descriptor: t.clone(),
                    metrics: entry.map(|(m, _)| m.clone()),
                    age: entry.map(|(_, at)| now.duration_since(*at)),
                    score: self.score_inner(&state, &t.id, now),
                }
            })
            .collect()
    }

    /// Registered transports.
    pub fn transports(&self) -> Vec<TransportDescriptor> {
        self.state_read().transports.clone()
    }
}

/// Background prober driving router metrics and migrations.
///
/// Every cycle it dials each registered transport's endpoint, measures the
/// round trip, and updates metrics. A failed probe leaves the previous
/// metrics to age into staleness rather than removing the transport.
pub struct ProbeLoop {
    router: Arc<AdaptiveRouter>,
    manager: Arc<TransportManager>,
    interval: Duration,
    probe_deadline: Duration,
}

impl ProbeLoop {
    /// Create a probe loop with the default 30 s cycle.
    pub fn new(router: Arc<AdaptiveRouter>, manager: Arc<TransportManager>) -> Self {
        Self {
            router,
            manager,
            interval: Duration::from_secs(30),
            probe_deadline: Duration::from_secs(5),
        }
    }

    /// Override the probe cycle interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until the shutdown signal flips. Emits migration events on
    /// `events`.
    pub async fn run(
        self,
        events: mpsc::UnboundedSender<MigrationEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_cycle().await;
                    if let Some(event) = self.router.migrate_if_better() {
                        info!(from = ?event.from, to = %event.to, "migrating active transport");
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One probe pass over every registered transport.
    pub async fn probe_cycle(&self) {
        for descriptor in self.router.transports() {
            match self.probe_one(&descriptor).await {
                Ok(metrics) => {
                    debug!(id = %descriptor.id, latency = ?metrics.latency, "probe ok");
                    self.router.update_metrics(&descriptor.id, metrics);
                }
                Err(e) => {
                    // Keep the transport; stale metrics already score zero.
                    warn!(id = %descriptor.id, error = %e, "probe failed");
                }
            }
        }
    }

    async fn probe_one(&self, descriptor: &TransportDescriptor) -> Result<RouteMetrics> {
        let started = Instant::now();
        let link = tokio::time::timeout(
            self.probe_deadline,
            self.manager.dial(descriptor.kind, &descriptor.endpoint),
        )
        .await
        .map_err(|_| crate::error::Error::TransportUnavailable("probe timeout".into()))??;
        let latency = started.elapsed();
        drop(link);

        Ok(RouteMetrics {
            latency,
            packet_loss: 0.0,
            jitter: latency / 10,
            stability: 0.95,
            blocking_risk: default_blocking_risk(descriptor.kind),
            load: 0.0,
        })
    }
}

/// Static blocking-risk prior per transport kind.
fn default_blocking_risk(kind: TransportKind) -> f64 {
    match kind {
        TransportKind::P2p => 0.3,
        TransportKind::Quic => 0.2,
        TransportKind::Wss => 0.1,
        TransportKind::Tcp => 0.1,
    }
}
