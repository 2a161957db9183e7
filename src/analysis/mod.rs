//! Analyzers fed by the flow tracker and judges fed by the metrics store.
//!
//! Loss, latency, jitter and throughput analyzers only ever write to the
//! [`MetricsStore`]; the bottleneck detector and the interface comparator
//! only ever read from it.

pub mod bottleneck;
pub mod compare;
pub mod jitter;
pub mod latency;
pub mod loss;
pub mod throughput;

pub use bottleneck::*;
pub use compare::*;
pub use jitter::*;
pub use latency::*;
pub use loss::*;
pub use throughput::*;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::packet::InterfaceId;
use crate::state::{Metric, MetricsStore};

/// Coarse quality label for a latency or jitter figure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quality {
    Excellent,
    Good,
    Acceptable,
    Poor,
    Critical,
}

impl Quality {
    /// Grade `value` against ascending upper bounds for excellent, good,
    /// acceptable and poor
    pub fn grade(value: f64, bounds: [f64; 4]) -> Self {
        if value <= bounds[0] {
            Self::Excellent
        } else if value <= bounds[1] {
            Self::Good
        } else if value <= bounds[2] {
            Self::Acceptable
        } else if value <= bounds[3] {
            Self::Poor
        } else {
            Self::Critical
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Acceptable => "acceptable",
            Self::Poor => "poor",
            Self::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Latest published value of every metric the judges look at.
///
/// A metric that was never published is `None` and counts as not breaching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathMetrics {
    pub loss_pct: Option<f64>,
    pub localization: Option<LossLocalization>,
    pub latency_p95: Option<f64>,
    pub jitter: Option<f64>,
    pub utilization: Option<f64>,
    pub bandwidth_mbps: Option<f64>,
    pub packets: Option<f64>,
}

impl PathMetrics {
    /// Read the latest values of an interface from the store.
    ///
    /// Localization is not a scalar series; callers pass the one from the
    /// most recent loss snapshot.
    pub fn from_store(
        store: &MetricsStore,
        interface: &InterfaceId,
        localization: Option<LossLocalization>,
    ) -> Self {
        Self {
            loss_pct: store.latest_value(interface, Metric::LossPct),
            localization,
            latency_p95: store.latest_value(interface, Metric::LatencyP95),
            jitter: store.latest_value(interface, Metric::Jitter),
            utilization: store.latest_value(interface, Metric::Utilization),
            bandwidth_mbps: store.latest_value(interface, Metric::BandwidthMbps),
            packets: store.latest_value(interface, Metric::Packets),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.loss_pct.is_none()
            && self.latency_p95.is_none()
            && self.jitter.is_none()
            && self.utilization.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_quality_bounds_are_inclusive() {
        let bounds = [50.0, 100.0, 150.0, 400.0];
        assert_eq!(Quality::grade(50.0, bounds), Quality::Excellent);
        assert_eq!(Quality::grade(50.1, bounds), Quality::Good);
        assert_eq!(Quality::grade(401.0, bounds), Quality::Critical);
    }

    #[test]
    fn test_path_metrics_from_store() {
        let store = MetricsStore::new(16);
        let eth0 = InterfaceId::from("eth0");
        store.record(&eth0, Metric::LossPct, Duration::ZERO, 0.5);
        store.record(&eth0, Metric::LatencyP95, Duration::ZERO, 40.0);
        let m = PathMetrics::from_store(&store, &eth0, Some(LossLocalization::Path));
        assert_eq!(m.loss_pct, Some(0.5));
        assert_eq!(m.latency_p95, Some(40.0));
        assert!(m.jitter.is_none());
        assert!(!m.is_empty());
        assert!(PathMetrics::default().is_empty());
    }
}
