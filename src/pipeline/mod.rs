//! The running monitor: per-interface ingest lanes feeding an evaluation
//! cycle.
//!
//! ```text
//! ingest() / attach() ──► records queue ──► lane (FlowTracker) ──► work queue
//!                            per interface                           │
//!                                                                    ▼
//!   snapshot() / compare() / bottleneck() ◄── MetricsStore ◄── evaluator
//!                                                                    │
//!                                              alert listeners ◄─────┘
//! ```
//!
//! Both queues drop their oldest entry when full, so a slow stage never
//! stalls the one in front of it.

mod evaluator;
mod feed;
mod lane;
pub mod queue;

pub use evaluator::InterfaceSnapshot;
pub use feed::{CaptureMessage, FeedStatus};
pub use lane::Work;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alert::{ActiveAlert, AlertManager, AlertRecord, AlertSummary, ListenerId};
use crate::analysis::{
    BottleneckDetector, BottleneckVerdict, ComparisonReport, InterfaceComparator,
    InterfaceCounters,
};
use crate::config::Config;
use crate::error::{IngestError, MonitorError};
use crate::packet::{InterfaceId, PacketRecord};
use crate::state::MetricsStore;
use crate::trace::{FlowSummary, FlowTracker, TrackerConfig, TrackerStats};
use evaluator::Evaluator;
use lane::Lane;
use queue::Pushed;

/// Flows listed in each top-N view
const TOP_FLOWS: usize = 10;

/// Counters shared by the monitor and its lanes
#[derive(Debug, Default)]
pub(crate) struct Counters {
    accepted: AtomicU64,
    rejected: Mutex<BTreeMap<&'static str, u64>>,
    dropped_analysis: AtomicU64,
}

impl Counters {
    fn accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reject(&self, error: &IngestError) {
        *self.rejected.lock().entry(error.class()).or_default() += 1;
    }

    pub(crate) fn dropped_analysis(&self) {
        self.dropped_analysis.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected(&self) -> BTreeMap<&'static str, u64> {
        self.rejected.lock().clone()
    }
}

/// Pipeline-wide counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub accepted: u64,
    /// Rejections by error class
    pub rejected: BTreeMap<String, u64>,
    pub clock_anomalies: u64,
    pub late_after_close: u64,
    /// Records discarded because an ingest queue was full
    pub dropped_ingest: u64,
    /// Tracker output discarded because an analysis queue was full
    pub dropped_analysis: u64,
    /// Samples pushed out of full store rings
    pub store_evicted: u64,
    pub active_flows: usize,
    pub interfaces: usize,
}

/// Flow table view of one interface
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowTableView {
    pub interface: InterfaceId,
    pub active: usize,
    pub open_probes: usize,
    pub stats: TrackerStats,
    pub top_by_bytes: Vec<FlowSummary>,
    pub top_by_retransmissions: Vec<FlowSummary>,
    /// Most recently closed first
    pub recent_closed: Vec<FlowSummary>,
}

/// What [`Monitor::stop`] left behind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopReport {
    /// Flows closed by the shutdown flush
    pub flushed_flows: usize,
    pub stats: PipelineStats,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
}

/// State reachable from the monitor, its feeds and its evaluator
pub(crate) struct Shared {
    pub config: Config,
    runtime: Handle,
    pub store: MetricsStore,
    pub lanes: RwLock<HashMap<InterfaceId, Lane>>,
    lane_tasks: Mutex<Vec<(InterfaceId, JoinHandle<Result<usize>>)>>,
    feed_tasks: Mutex<Vec<JoinHandle<()>>>,
    pub comparator: InterfaceComparator,
    pub bottleneck: Mutex<BottleneckDetector>,
    pub alerts: Mutex<AlertManager>,
    pub snapshots: RwLock<HashMap<InterfaceId, InterfaceSnapshot>>,
    counters: Arc<Counters>,
    pub work_ready: Arc<Notify>,
    /// Stops lanes and feeds
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl Shared {
    fn lane(&self, interface: &InterfaceId) -> Result<Lane, IngestError> {
        if let Some(lane) = self.lanes.read().get(interface) {
            return Ok(lane.clone());
        }

        let mut lanes = self.lanes.write();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(IngestError::Stopped);
        }
        let lane = match lanes.entry(interface.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => v
                .insert(Lane {
                    interface: interface.clone(),
                    records: Arc::new(queue::DropOldestQueue::new(
                        self.config.ingest_queue_capacity,
                    )),
                    work: Arc::new(queue::DropOldestQueue::new(
                        self.config.analysis_queue_capacity,
                    )),
                    tracker: Arc::new(Mutex::new(FlowTracker::new(
                        interface.clone(),
                        TrackerConfig::from(&self.config),
                    ))),
                })
                .clone(),
        };

        let task = self.runtime.spawn(lane::run_lane(
            lane.clone(),
            Arc::clone(&self.counters),
            Arc::clone(&self.work_ready),
            self.cancel.clone(),
        ));
        self.lane_tasks.lock().push((interface.clone(), task));
        Ok(lane)
    }

    fn ingest(&self, interface: &InterfaceId, record: PacketRecord) -> Result<(), IngestError> {
        let result = self.admit(interface, record);
        if let Err(e) = &result {
            self.counters.reject(e);
            debug!(interface = %interface, error = %e, "record rejected");
        }
        result
    }

    fn admit(&self, interface: &InterfaceId, record: PacketRecord) -> Result<(), IngestError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(IngestError::Stopped);
        }
        if &record.interface != interface {
            return Err(IngestError::InterfaceMismatch {
                record: record.interface.clone(),
                submitted: interface.clone(),
            });
        }
        record.validate()?;

        let lane = self.lane(interface)?;
        if let Pushed::DroppedOldest { burst_start: true } = lane.records.push(record) {
            warn!(
                interface = %interface,
                capacity = lane.records.capacity(),
                "ingest queue full, dropping oldest records"
            );
        }
        self.counters.accept();
        Ok(())
    }

    fn stats(&self) -> PipelineStats {
        let mut stats = PipelineStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self
                .counters
                .rejected()
                .into_iter()
                .map(|(class, n)| (class.to_string(), n))
                .collect(),
            dropped_analysis: self.counters.dropped_analysis.load(Ordering::Relaxed),
            store_evicted: self.store.evicted(),
            ..PipelineStats::default()
        };

        let lanes = self.lanes.read();
        stats.interfaces = lanes.len();
        for lane in lanes.values() {
            stats.dropped_ingest += lane.records.dropped();
            let tracker = lane.tracker.lock();
            stats.clock_anomalies += tracker.stats().clock_anomalies;
            stats.late_after_close += tracker.stats().late_after_close;
            stats.active_flows += tracker.active_flows();
        }
        stats
    }
}

/// Live diagnostics over any number of interfaces.
///
/// Must be started inside a tokio runtime. Everything except [`Monitor::stop`]
/// is synchronous and callable from any thread.
pub struct Monitor {
    shared: Arc<Shared>,
    evaluator: Mutex<Option<JoinHandle<Result<()>>>>,
    /// Stops the evaluator once the lanes have flushed
    evaluator_cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

impl Monitor {
    pub fn start(config: Config) -> Result<Self, MonitorError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| MonitorError::NoRuntime)?;

        let shared = Arc::new(Shared {
            store: MetricsStore::new(config.ring_capacity),
            comparator: InterfaceComparator::new(
                config.thresholds,
                config.health_weights,
                config.tie_epsilon,
            ),
            bottleneck: Mutex::new(BottleneckDetector::new(config.thresholds)),
            alerts: Mutex::new(AlertManager::new(config.thresholds, config.consecutive_cycles)),
            lanes: RwLock::new(HashMap::new()),
            lane_tasks: Mutex::new(Vec::new()),
            feed_tasks: Mutex::new(Vec::new()),
            snapshots: RwLock::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
            work_ready: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            runtime: runtime.clone(),
            config,
        });

        let evaluator_cancel = CancellationToken::new();
        let evaluator = runtime.spawn(Evaluator::new(Arc::clone(&shared)).run(evaluator_cancel.clone()));
        info!(
            period_ms = shared.config.evaluation_period.as_millis() as u64,
            "monitor started"
        );

        Ok(Self {
            shared,
            evaluator: Mutex::new(Some(evaluator)),
            evaluator_cancel,
            started_at: Utc::now(),
        })
    }

    /// Feed one decoded frame captured on `interface`
    pub fn ingest(&self, interface: &InterfaceId, record: PacketRecord) -> Result<(), IngestError> {
        self.shared.ingest(interface, record)
    }

    /// Pump a capture channel into the monitor; the returned receiver tells
    /// a paused feed from an ended or lost one
    pub fn attach(
        &self,
        interface: InterfaceId,
        frames: mpsc::Receiver<CaptureMessage>,
    ) -> watch::Receiver<FeedStatus> {
        if self.is_stopped() {
            return watch::channel(FeedStatus::Stopped).1;
        }
        let (status, receiver) = watch::channel(FeedStatus::Active);
        let task = self.shared.runtime.spawn(feed::run_feed(
            Arc::clone(&self.shared),
            interface,
            frames,
            status,
            self.shared.cancel.clone(),
        ));
        self.shared.feed_tasks.lock().push(task);
        receiver
    }

    /// Hand over a cumulative reading of the interface's drop and error counters
    pub fn record_counters(&self, interface: &InterfaceId, counters: InterfaceCounters) {
        let Ok(lane) = self.shared.lane(interface) else {
            return;
        };
        let at = lane.tracker.lock().clock();
        lane.forward(vec![Work::Counters { at, counters }], &self.shared.counters);
        self.shared.work_ready.notify_one();
    }

    /// Latest evaluated view of an interface
    pub fn snapshot(&self, interface: &InterfaceId) -> Option<InterfaceSnapshot> {
        self.shared.snapshots.read().get(interface).cloned()
    }

    /// Rank the given interfaces and compare every pair
    pub fn compare(&self, interfaces: &[InterfaceId]) -> ComparisonReport {
        self.shared
            .comparator
            .compare_all(&self.shared.store, interfaces)
    }

    pub fn bottleneck(&self, interface: &InterfaceId) -> Option<BottleneckVerdict> {
        self.shared.bottleneck.lock().verdict(interface).cloned()
    }

    /// Register a callback for alert transitions.
    ///
    /// Listeners run on the evaluation task while the alert state is locked;
    /// they must return promptly and must not call back into alert methods
    /// of this monitor.
    pub fn subscribe_alerts<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AlertRecord) + Send + Sync + 'static,
    {
        self.shared.alerts.lock().subscribe(Box::new(listener))
    }

    pub fn unsubscribe_alerts(&self, id: ListenerId) -> bool {
        self.shared.alerts.lock().unsubscribe(id)
    }

    pub fn active_alerts(&self) -> Vec<ActiveAlert> {
        self.shared.alerts.lock().active()
    }

    /// Oldest first
    pub fn alert_history(&self) -> Vec<AlertRecord> {
        self.shared.alerts.lock().history().cloned().collect()
    }

    pub fn alert_summary(&self) -> BTreeMap<InterfaceId, AlertSummary> {
        self.shared.alerts.lock().summary()
    }

    pub fn flows(&self, interface: &InterfaceId) -> Option<FlowTableView> {
        let lane = self.shared.lanes.read().get(interface).cloned()?;
        let tracker = lane.tracker.lock();
        let mut recent_closed: Vec<FlowSummary> = tracker.recent_closed().cloned().collect();
        recent_closed.reverse();
        Some(FlowTableView {
            interface: interface.clone(),
            active: tracker.active_flows(),
            open_probes: tracker.open_probes(),
            stats: tracker.stats().clone(),
            top_by_bytes: tracker.top_flows_by_bytes(TOP_FLOWS),
            top_by_retransmissions: tracker.top_flows_by_retransmissions(TOP_FLOWS),
            recent_closed,
        })
    }

    /// Interfaces that have received at least one record, sorted
    pub fn interfaces(&self) -> Vec<InterfaceId> {
        let mut ids: Vec<InterfaceId> = self.shared.lanes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats()
    }

    pub fn store(&self) -> &MetricsStore {
        &self.shared.store
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Stop every worker, flush open flows through the analyzers and run a
    /// final evaluation cycle. Queries keep working afterwards.
    pub async fn stop(&self) -> StopReport {
        let first = !self.shared.stopped.swap(true, Ordering::SeqCst);
        // No lane can be created past this point
        drop(self.shared.lanes.write());
        self.shared.cancel.cancel();

        let feeds = std::mem::take(&mut *self.shared.feed_tasks.lock());
        for task in feeds {
            if let Err(e) = task.await {
                warn!(error = %e, "capture feed task failed");
            }
        }

        let lanes = std::mem::take(&mut *self.shared.lane_tasks.lock());
        let mut flushed_flows = 0;
        for (interface, task) in lanes {
            match task.await {
                Ok(Ok(n)) => flushed_flows += n,
                Ok(Err(e)) => warn!(interface = %interface, error = %e, "ingest lane failed"),
                Err(e) => warn!(interface = %interface, error = %e, "ingest lane task failed"),
            }
        }

        self.evaluator_cancel.cancel();
        let evaluator = self.evaluator.lock().take();
        if let Some(task) = evaluator {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "evaluator failed"),
                Err(e) => warn!(error = %e, "evaluator task failed"),
            }
        }

        if first {
            info!(flushed_flows, "monitor stopped");
        }
        StopReport {
            flushed_flows,
            stats: self.stats(),
            started_at: self.started_at,
            stopped_at: Utc::now(),
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
        self.evaluator_cancel.cancel();
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("interfaces", &self.interfaces())
            .field("stopped", &self.is_stopped())
            .field("started_at", &self.started_at)
            .finish()
    }
}
