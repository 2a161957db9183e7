use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::info;

use crate::alert::fsm::{AlertFsm, AlertState, Severity};
use crate::analysis::PathMetrics;
use crate::config::{Threshold, ThresholdSet};
use crate::packet::InterfaceId;
use crate::state::Metric;

/// Alert records kept for queries
const HISTORY_LIMIT: usize = 1000;

/// One severity transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub interface: InterfaceId,
    pub metric: Metric,
    pub from: Severity,
    pub to: Severity,
    /// Value that triggered the transition
    pub value: f64,
    /// Capture time of the evaluation cycle
    pub at: Duration,
    pub raised_at: DateTime<Utc>,
}

/// Callback for alert transitions
pub type AlertListener = Box<dyn Fn(&AlertRecord) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An (interface, metric) currently above Normal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub interface: InterfaceId,
    pub metric: Metric,
    pub severity: Severity,
    pub since: Duration,
}

/// Per-interface count of metrics in each alerting severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSummary {
    pub warning: usize,
    pub critical: usize,
}

/// Metrics the manager judges, in evaluation order
const JUDGED: [Metric; 4] = [
    Metric::LossPct,
    Metric::LatencyP95,
    Metric::Jitter,
    Metric::Utilization,
];

/// Hysteresis alerting across every (interface, metric).
///
/// Listeners run synchronously, in registration order, on the thread that
/// evaluates. They must not call back into the manager.
pub struct AlertManager {
    thresholds: ThresholdSet,
    required: u32,
    machines: HashMap<(InterfaceId, Metric), AlertFsm>,
    listeners: Vec<(ListenerId, AlertListener)>,
    next_listener: u64,
    history: VecDeque<AlertRecord>,
}

impl AlertManager {
    pub fn new(thresholds: ThresholdSet, consecutive_cycles: u32) -> Self {
        Self {
            thresholds,
            required: consecutive_cycles,
            machines: HashMap::new(),
            listeners: Vec::new(),
            next_listener: 0,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    pub fn subscribe(&mut self, listener: AlertListener) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _)| *l != id);
        self.listeners.len() != before
    }

    /// Threshold the manager applies to a metric, if it judges it at all
    pub fn threshold_for(&self, metric: Metric) -> Option<Threshold> {
        match metric {
            Metric::LossPct => Some(self.thresholds.loss),
            Metric::LatencyP95 => Some(self.thresholds.latency),
            Metric::Jitter => Some(self.thresholds.jitter),
            Metric::Utilization => Some(self.thresholds.utilization),
            _ => None,
        }
    }

    /// Run one cycle for one (interface, metric); returns the transition, if any
    pub fn evaluate(
        &mut self,
        interface: &InterfaceId,
        metric: Metric,
        value: f64,
        at: Duration,
    ) -> Option<AlertRecord> {
        let threshold = self.threshold_for(metric)?;
        let required = self.required;
        let fsm = self
            .machines
            .entry((interface.clone(), metric))
            .or_insert_with(|| AlertFsm::new(required, at));
        let transition = fsm.observe(value, &threshold, at)?;

        let record = AlertRecord {
            interface: interface.clone(),
            metric,
            from: transition.from,
            to: transition.to,
            value,
            at,
            raised_at: Utc::now(),
        };
        info!(
            interface = %interface,
            metric = %metric,
            from = %record.from,
            to = %record.to,
            value,
            "alert transition"
        );

        if self.history.len() >= HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());

        for (_, listener) in &self.listeners {
            listener(&record);
        }
        Some(record)
    }

    /// Run one cycle for every judged metric an interface has a value for
    pub fn evaluate_metrics(
        &mut self,
        interface: &InterfaceId,
        metrics: &PathMetrics,
        at: Duration,
    ) -> Vec<AlertRecord> {
        JUDGED
            .iter()
            .filter_map(|metric| {
                let value = match metric {
                    Metric::LossPct => metrics.loss_pct,
                    Metric::LatencyP95 => metrics.latency_p95,
                    Metric::Jitter => metrics.jitter,
                    Metric::Utilization => metrics.utilization,
                    _ => None,
                }?;
                self.evaluate(interface, *metric, value, at)
            })
            .collect()
    }

    pub fn state(&self, interface: &InterfaceId, metric: Metric) -> Option<AlertState> {
        self.machines
            .get(&(interface.clone(), metric))
            .map(|fsm| fsm.state())
    }

    /// Everything currently at Warning or Critical
    pub fn active(&self) -> Vec<ActiveAlert> {
        let mut active: Vec<ActiveAlert> = self
            .machines
            .iter()
            .filter(|(_, fsm)| fsm.severity() > Severity::Normal)
            .map(|((interface, metric), fsm)| {
                let state = fsm.state();
                ActiveAlert {
                    interface: interface.clone(),
                    metric: *metric,
                    severity: state.severity,
                    since: state.since,
                }
            })
            .collect();
        active.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.interface.cmp(&b.interface))
                .then_with(|| a.metric.cmp(&b.metric))
        });
        active
    }

    /// Oldest first
    pub fn history(&self) -> impl Iterator<Item = &AlertRecord> {
        self.history.iter()
    }

    pub fn summary(&self) -> BTreeMap<InterfaceId, AlertSummary> {
        let mut summary: BTreeMap<InterfaceId, AlertSummary> = BTreeMap::new();
        for ((interface, _), fsm) in &self.machines {
            let entry = summary.entry(interface.clone()).or_default();
            match fsm.severity() {
                Severity::Warning => entry.warning += 1,
                Severity::Critical => entry.critical += 1,
                Severity::Normal => {}
            }
        }
        summary
    }
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("thresholds", &self.thresholds)
            .field("required", &self.required)
            .field("machines", &self.machines.len())
            .field("listeners", &self.listeners.len())
            .field("history", &self.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn eth0() -> InterfaceId {
        InterfaceId::from("eth0")
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_unjudged_metric_is_ignored() {
        let mut m = AlertManager::new(ThresholdSet::default(), 1);
        assert!(m.evaluate(&eth0(), Metric::PacketRate, 1e9, secs(0)).is_none());
        assert!(m.state(&eth0(), Metric::PacketRate).is_none());
    }

    #[test]
    fn test_listeners_called_in_order() {
        let mut m = AlertManager::new(ThresholdSet::default(), 2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            m.subscribe(Box::new(move |r: &AlertRecord| {
                seen.lock().push((tag, r.to));
            }));
        }

        m.evaluate(&eth0(), Metric::Jitter, 35.0, secs(0));
        assert!(seen.lock().is_empty());
        let record = m.evaluate(&eth0(), Metric::Jitter, 35.0, secs(1)).unwrap();
        assert_eq!(record.from, Severity::Normal);
        assert_eq!(record.to, Severity::Warning);
        assert_eq!(record.value, 35.0);
        assert_eq!(
            *seen.lock(),
            vec![("first", Severity::Warning), ("second", Severity::Warning)]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let mut m = AlertManager::new(ThresholdSet::default(), 1);
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let id = m.subscribe(Box::new(move |_| *counter.lock() += 1));
        assert!(m.unsubscribe(id));
        assert!(!m.unsubscribe(id));
        m.evaluate(&eth0(), Metric::LossPct, 10.0, secs(0));
        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn test_active_summary_and_history() {
        let mut m = AlertManager::new(ThresholdSet::default(), 1);
        let metrics = PathMetrics {
            loss_pct: Some(5.0),
            latency_p95: Some(150.0),
            jitter: Some(1.0),
            ..PathMetrics::default()
        };
        let records = m.evaluate_metrics(&eth0(), &metrics, secs(3));
        assert_eq!(records.len(), 2);

        let active = m.active();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].metric, Metric::LossPct);
        assert_eq!(active[0].severity, Severity::Critical);
        assert_eq!(active[1].severity, Severity::Warning);

        let summary = m.summary();
        assert_eq!(
            summary[&eth0()],
            AlertSummary {
                warning: 1,
                critical: 1
            }
        );
        assert_eq!(m.history().count(), 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut m = AlertManager::new(ThresholdSet::default(), 1);
        for i in 0..(HISTORY_LIMIT as u64 + 10) {
            let value = if i % 2 == 0 { 10.0 } else { 0.0 };
            m.evaluate(&eth0(), Metric::LossPct, value, secs(i));
        }
        assert_eq!(m.history().count(), HISTORY_LIMIT);
    }
}
