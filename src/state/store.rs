use dashmap::DashMap;
use dashmap::mapref::one::Ref;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::packet::InterfaceId;

/// Fixed names of the series the analyzers publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Metric {
    /// Composite estimated loss, percent
    LossPct,
    /// Retransmission-only loss, percent
    RetransmitLossPct,
    /// Probe-timeout-only loss, percent
    ProbeLossPct,
    LatencyP50,
    LatencyP95,
    LatencyP99,
    LatencyMean,
    /// Interface jitter over the jitter window, milliseconds
    Jitter,
    BandwidthMbps,
    PacketRate,
    /// Packets seen in the bandwidth window
    Packets,
    /// Link utilization, percent
    Utilization,
    /// Weighted health score in [0, 100]
    HealthScore,
}

impl Metric {
    pub const ALL: [Metric; 13] = [
        Metric::LossPct,
        Metric::RetransmitLossPct,
        Metric::ProbeLossPct,
        Metric::LatencyP50,
        Metric::LatencyP95,
        Metric::LatencyP99,
        Metric::LatencyMean,
        Metric::Jitter,
        Metric::BandwidthMbps,
        Metric::PacketRate,
        Metric::Packets,
        Metric::Utilization,
        Metric::HealthScore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LossPct => "loss_pct",
            Self::RetransmitLossPct => "retransmit_loss_pct",
            Self::ProbeLossPct => "probe_loss_pct",
            Self::LatencyP50 => "latency_p50_ms",
            Self::LatencyP95 => "latency_p95_ms",
            Self::LatencyP99 => "latency_p99_ms",
            Self::LatencyMean => "latency_mean_ms",
            Self::Jitter => "jitter_ms",
            Self::BandwidthMbps => "bandwidth_mbps",
            Self::PacketRate => "packet_rate_pps",
            Self::Packets => "packets",
            Self::Utilization => "utilization_pct",
            Self::HealthScore => "health_score",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A retained point of one series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Duration,
    pub value: f64,
}

/// A sample together with the series it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub interface: InterfaceId,
    pub metric: Metric,
    pub timestamp: Duration,
    pub value: f64,
}

type SeriesKey = (InterfaceId, Metric);

/// Bounded ring of samples for one (interface, metric) pair
#[derive(Debug)]
struct Series {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl Series {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append, evicting from the front once full. Returns whether a sample was evicted.
    fn push(&mut self, sample: Sample) -> bool {
        let evicted = if self.samples.len() >= self.capacity {
            self.samples.pop_front();
            true
        } else {
            false
        };
        self.samples.push_back(sample);
        evicted
    }
}

/// Thread-safe time-series store keyed by interface and metric.
///
/// Each key is its own ring behind a sharded lock: writers to one key are
/// serialized, readers of different keys never contend with each other, and
/// a reader never observes a half-appended sample.
#[derive(Debug)]
pub struct MetricsStore {
    series: DashMap<SeriesKey, Series>,
    capacity: usize,
    evicted: AtomicU64,
}

impl MetricsStore {
    /// Create a store retaining at most `capacity` samples per key
    pub fn new(capacity: usize) -> Self {
        Self {
            series: DashMap::new(),
            capacity: capacity.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a sample to the ring for `(interface, metric)`
    pub fn record(&self, interface: &InterfaceId, metric: Metric, timestamp: Duration, value: f64) {
        let key = (interface.clone(), metric);
        let mut series = self
            .series
            .entry(key)
            .or_insert_with(|| Series::new(self.capacity));
        if series.push(Sample { timestamp, value }) {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Most recent sample for a key, or `None` if nothing was recorded
    pub fn latest(&self, interface: &InterfaceId, metric: Metric) -> Option<MetricSample> {
        let series = self.series.get(&(interface.clone(), metric))?;
        let sample = series.samples.back()?;
        Some(MetricSample {
            interface: interface.clone(),
            metric,
            timestamp: sample.timestamp,
            value: sample.value,
        })
    }

    /// Latest value only
    pub fn latest_value(&self, interface: &InterfaceId, metric: Metric) -> Option<f64> {
        self.series
            .get(&(interface.clone(), metric))
            .and_then(|s| s.samples.back().map(|p| p.value))
    }

    /// Samples within the trailing `duration` of the newest sample of the key.
    ///
    /// The returned view borrows the series: it holds a shared lock on the
    /// key's shard until dropped, so writers to that shard wait for it. Do not
    /// record into the store while holding a window.
    pub fn window(&self, interface: &InterfaceId, metric: Metric, duration: Duration) -> Window<'_> {
        let series = self.series.get(&(interface.clone(), metric));
        let cutoff = series
            .as_ref()
            .and_then(|s| s.samples.back())
            .map(|newest| newest.timestamp.saturating_sub(duration))
            .unwrap_or_default();
        Window { series, cutoff }
    }

    /// Number of samples currently retained for a key
    pub fn len(&self, interface: &InterfaceId, metric: Metric) -> usize {
        self.series
            .get(&(interface.clone(), metric))
            .map(|s| s.samples.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Interfaces with at least one recorded series, sorted
    pub fn interfaces(&self) -> Vec<InterfaceId> {
        let mut ids: Vec<InterfaceId> = self.series.iter().map(|e| e.key().0.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Samples evicted from full rings since creation
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Non-owning, lazily filtered view over one series
pub struct Window<'a> {
    series: Option<Ref<'a, SeriesKey, Series>>,
    cutoff: Duration,
}

impl Window<'_> {
    /// Samples in arrival order
    pub fn iter(&self) -> impl Iterator<Item = &Sample> + '_ {
        let cutoff = self.cutoff;
        self.series
            .iter()
            .flat_map(|s| s.samples.iter())
            .filter(move |s| s.timestamp >= cutoff)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.iter().map(|s| s.value)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Mean of the values in the window
    pub fn mean(&self) -> Option<f64> {
        let (sum, n) = self.values().fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        (n > 0).then(|| sum / n as f64)
    }

    pub fn max(&self) -> Option<f64> {
        self.values().reduce(f64::max)
    }
}
