//! Node lifecycle orchestration.
//!
//! The orchestrator owns the session's view of the fleet. The control plane is the only
//! source of truth: mutations are requested, never applied locally, and a node's new status
//! becomes visible only once a later refresh reports it. A failed refresh keeps serving the
//! last good snapshot.

use crate::control::ControlPlane;
use crate::countries;
use crate::error::ControlError;
use crate::events::{SessionEvent, SessionObserver};
use crate::model::{Node, NodeLogs, ProxyEndpoint, SpeedTestResult, StatusResponse};
use crate::proxy;
use crate::store::SessionStore;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

type RefreshOutcome = Result<Arc<Vec<Node>>, ControlError>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum FlightKey {
    Country(String),
    Node(String),
}

impl fmt::Display for FlightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlightKey::Country(code) => write!(f, "country {}", code),
            FlightKey::Node(id) => write!(f, "node {}", id),
        }
    }
}

/// Releases a single-flight key when the mutation finishes or is dropped.
struct FlightGuard<'a> {
    busy: &'a Mutex<HashSet<FlightKey>>,
    key: FlightKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self.busy.lock().unwrap_or_else(|err| err.into_inner());
        busy.remove(&self.key);
    }
}

/// Outcome of one fetch, tagged with the generation it was started under.
type Published = Option<(u64, RefreshOutcome)>;

/// Clears the in-flight flag and wakes coalesced waiters, even if the leading refresh is
/// dropped before it completes.
struct RefreshGuard<'a> {
    generation: u64,
    in_flight: &'a AtomicBool,
    closed: &'a AtomicBool,
    outcome_tx: &'a watch::Sender<Published>,
    outcome: Option<RefreshOutcome>,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            if self.closed.load(Ordering::Acquire) {
                Err(ControlError::SessionClosed)
            } else {
                Err(ControlError::Transport("refresh cancelled".to_string()))
            }
        });
        self.in_flight.store(false, Ordering::Release);
        self.outcome_tx.send_replace(Some((self.generation, outcome)));
    }
}

#[derive(Default)]
struct Snapshot {
    nodes: Arc<Vec<Node>>,
    fetched_at: Option<OffsetDateTime>,
    last_error: Option<ControlError>,
}

pub struct NodeOrchestrator<C> {
    client: Arc<C>,
    store: Option<SessionStore>,
    observer: Arc<dyn SessionObserver>,
    poll_interval: Duration,
    snapshot: RwLock<Snapshot>,
    refresh_in_flight: AtomicBool,
    refresh_generation: AtomicU64,
    refresh_outcome: watch::Sender<Published>,
    busy: Mutex<HashSet<FlightKey>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl<C: ControlPlane + 'static> NodeOrchestrator<C> {
    pub fn new(
        client: Arc<C>,
        store: Option<SessionStore>,
        observer: Arc<dyn SessionObserver>,
        poll_interval: Duration,
    ) -> Self {
        let poll_interval = if poll_interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            poll_interval
        };
        Self {
            client,
            store,
            observer,
            poll_interval,
            snapshot: RwLock::new(Snapshot::default()),
            refresh_in_flight: AtomicBool::new(false),
            refresh_generation: AtomicU64::new(0),
            refresh_outcome: watch::Sender::new(None),
            busy: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            shutdown: watch::Sender::new(false),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.observer.on_event(&event);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), ControlError> {
        if self.is_closed() {
            Err(ControlError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn read_snapshot<T>(&self, read: impl FnOnce(&Snapshot) -> T) -> T {
        let snapshot = self.snapshot.read().unwrap_or_else(|err| err.into_inner());
        read(&snapshot)
    }

    pub fn snapshot(&self) -> Arc<Vec<Node>> {
        self.read_snapshot(|snapshot| Arc::clone(&snapshot.nodes))
    }

    /// Running nodes first, then by country code.
    pub fn sorted_snapshot(&self) -> Vec<Node> {
        let mut nodes = self.snapshot().as_ref().clone();
        nodes.sort_by(|a, b| {
            b.is_running()
                .cmp(&a.is_running())
                .then_with(|| a.country.cmp(&b.country))
        });
        nodes
    }

    pub fn running_count(&self) -> usize {
        self.snapshot().iter().filter(|node| node.is_running()).count()
    }

    pub fn node_for_country(&self, country: &str) -> Option<Node> {
        self.snapshot()
            .iter()
            .find(|node| node.country == country)
            .cloned()
    }

    pub fn last_error(&self) -> Option<ControlError> {
        self.read_snapshot(|snapshot| snapshot.last_error.clone())
    }

    pub fn last_fetched_at(&self) -> Option<OffsetDateTime> {
        self.read_snapshot(|snapshot| snapshot.fetched_at)
    }

    pub fn proxy_endpoints(&self, countries: &[String]) -> Vec<ProxyEndpoint> {
        proxy::derive_endpoints(&self.snapshot(), countries)
    }

    /// Fetches the node list and swaps it in whole.
    ///
    /// A call made while another refresh is in flight waits for that fetch and shares its
    /// outcome. On failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.refresh_since(0).await
    }

    /// Like [`refresh`](Self::refresh), but only accepts the outcome of a fetch started at or
    /// after `min_generation`. An older in-flight fetch is waited out, then a new one is sent.
    async fn refresh_since(&self, min_generation: u64) -> RefreshOutcome {
        loop {
            self.ensure_open()?;
            let mut outcome_rx = self.refresh_outcome.subscribe();
            if self
                .refresh_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let generation = self.refresh_generation.fetch_add(1, Ordering::AcqRel) + 1;
                let mut guard = RefreshGuard {
                    generation,
                    in_flight: &self.refresh_in_flight,
                    closed: &self.closed,
                    outcome_tx: &self.refresh_outcome,
                    outcome: None,
                };
                let outcome = self.fetch().await;
                guard.outcome = Some(outcome.clone());
                return outcome;
            }

            log::trace!("joining in-flight refresh");
            if outcome_rx.changed().await.is_err() {
                return Err(ControlError::SessionClosed);
            }
            let published = outcome_rx.borrow_and_update().clone();
            match published {
                Some((generation, outcome)) if generation >= min_generation => return outcome,
                Some((generation, _)) => {
                    log::trace!("fetch {} predates the request, fetching again", generation);
                }
                None => return Err(ControlError::SessionClosed),
            }
        }
    }

    async fn fetch(&self) -> RefreshOutcome {
        let result = self.client.list_nodes().await;
        if self.is_closed() {
            return Err(ControlError::SessionClosed);
        }
        let mut snapshot = self.snapshot.write().unwrap_or_else(|err| err.into_inner());
        match result {
            Ok(nodes) => {
                let nodes = Arc::new(nodes);
                snapshot.nodes = Arc::clone(&nodes);
                snapshot.fetched_at = Some(OffsetDateTime::now_utc());
                snapshot.last_error = None;
                drop(snapshot);
                log::debug!("refreshed {} node(s)", nodes.len());
                Ok(nodes)
            }
            Err(err) => {
                snapshot.last_error = Some(err.clone());
                drop(snapshot);
                log::warn!("node refresh failed: {}", err);
                self.emit(SessionEvent::failure("Failed to load nodes", err.to_string()));
                Err(err)
            }
        }
    }

    fn begin(&self, key: FlightKey) -> Result<FlightGuard<'_>, ControlError> {
        let mut busy = self.busy.lock().unwrap_or_else(|err| err.into_inner());
        if !busy.insert(key.clone()) {
            return Err(ControlError::Busy(key.to_string()));
        }
        Ok(FlightGuard {
            busy: &self.busy,
            key,
        })
    }

    /// Refreshes with a fetch sent after the mutation completed, never one already in flight.
    async fn refresh_after_mutation(&self) {
        let next = self.refresh_generation.load(Ordering::Acquire) + 1;
        if let Err(err) = self.refresh_since(next).await {
            log::debug!("refresh after mutation failed: {}", err);
        }
    }

    fn remember_start(&self, country: &str, server: Option<&str>) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if let Err(err) = store.add_recent_country(country) {
            log::warn!("failed to record recent country {}: {}", country, err);
        }
        if let Some(server) = server {
            if let Err(err) = store.set_last_used_server(country, server) {
                log::warn!("failed to record last server for {}: {}", country, err);
            }
        }
    }

    pub async fn start(&self, country: &str, server: Option<&str>) -> Result<Node, ControlError> {
        self.ensure_open()?;
        let country = country.trim().to_lowercase();
        let country = country.as_str();
        let flight = self.begin(FlightKey::Country(country.to_string()))?;
        let display = countries::display(country);
        self.emit(SessionEvent::progress(format!("Starting {}", display)));

        let result = self.client.start_node(country, server).await;
        drop(flight);
        if self.is_closed() {
            log::debug!("discarding start result for {}: session closed", country);
            return Err(ControlError::SessionClosed);
        }
        match result {
            Ok(node) => {
                log::info!("started node {} for {}", node.id, country);
                self.remember_start(country, server);
                self.emit(SessionEvent::success(
                    "Node Started",
                    Some(format!("Connected to {}", display)),
                ));
                self.refresh_after_mutation().await;
                Ok(node)
            }
            Err(err) => {
                self.emit(SessionEvent::failure("Failed to start node", err.to_string()));
                Err(err)
            }
        }
    }

    pub async fn stop(&self, node: &Node) -> Result<StatusResponse, ControlError> {
        self.ensure_open()?;
        let flight = self.begin(FlightKey::Node(node.id.clone()))?;
        let display = countries::display(&node.country);
        self.emit(SessionEvent::progress(format!("Stopping {}", display)));

        let result = self.client.stop_node(&node.id).await;
        drop(flight);
        if self.is_closed() {
            log::debug!("discarding stop result for {}: session closed", node.id);
            return Err(ControlError::SessionClosed);
        }
        match result {
            Ok(status) => {
                log::info!("stopped node {} ({})", node.id, status.status);
                self.emit(SessionEvent::success(
                    "Node Stopped",
                    Some(format!("{} disconnected", display)),
                ));
                self.refresh_after_mutation().await;
                Ok(status)
            }
            Err(err) => {
                self.emit(SessionEvent::failure("Failed to stop node", err.to_string()));
                Err(err)
            }
        }
    }

    pub async fn restart(&self, node: &Node) -> Result<StatusResponse, ControlError> {
        self.ensure_open()?;
        let flight = self.begin(FlightKey::Node(node.id.clone()))?;
        let display = countries::display(&node.country);
        self.emit(SessionEvent::progress(format!("Restarting {}", display)));

        let result = self.client.restart_node(&node.id).await;
        drop(flight);
        if self.is_closed() {
            log::debug!("discarding restart result for {}: session closed", node.id);
            return Err(ControlError::SessionClosed);
        }
        match result {
            Ok(status) => {
                log::info!("restarted node {} ({})", node.id, status.status);
                self.emit(SessionEvent::success("Node Restarted", None));
                self.refresh_after_mutation().await;
                Ok(status)
            }
            Err(err) => {
                self.emit(SessionEvent::failure("Failed to restart node", err.to_string()));
                Err(err)
            }
        }
    }

    pub async fn logs(&self, node: &Node, lines: u32) -> Result<NodeLogs, ControlError> {
        self.ensure_open()?;
        self.client.node_logs(&node.id, lines).await.map_err(|err| {
            self.emit(SessionEvent::failure("Failed to load logs", err.to_string()));
            err
        })
    }

    pub async fn speed_test(&self, node: &Node) -> Result<SpeedTestResult, ControlError> {
        self.ensure_open()?;
        self.emit(SessionEvent::progress("Running speed test..."));
        match self.client.run_speed_test(&node.id).await {
            Ok(result) => {
                self.emit(SessionEvent::success(
                    "Speed Test Complete",
                    Some(format!(
                        "↓ {:.1} Mbps | ↑ {:.1} Mbps | {}ms",
                        result.download_mbps, result.upload_mbps, result.latency_ms
                    )),
                ));
                Ok(result)
            }
            Err(err) => {
                self.emit(SessionEvent::failure("Speed test failed", err.to_string()));
                Err(err)
            }
        }
    }

    /// Spawns the periodic refresh task. It exits once [`shutdown`](Self::shutdown) is called.
    pub fn spawn_polling(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let period = this.poll_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::debug!("node polling every {:?}", period);
            loop {
                if this.is_closed() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            result = this.refresh() => {
                                if let Err(err) = result {
                                    log::debug!("poll refresh failed: {}", err);
                                }
                            }
                        }
                    }
                }
            }
            log::debug!("node polling stopped");
        })
    }

    /// Tears the session down: polling stops and late mutation results are discarded.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("orchestrator shutting down");
        }
        self.shutdown.send_replace(true);
    }
}
