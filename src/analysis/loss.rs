//! Packet loss estimation and localization.
//!
//! Loss is estimated from what the flow tracker saw on the wire:
//! retransmitted data (congestion on the path), handshake probes nobody
//! answered (one-way or asymmetric failure), and out-of-order arrivals
//! (reordering near an endpoint). Interface drop counters supplied by the
//! capture side catch frames that never reached the flow layer at all.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use crate::config::LossWeights;
use crate::packet::FlowKey;
use crate::trace::{FlowEvent, RetransmitKind};

/// Capture-level counters of one interface, as cumulative totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    /// Ring buffer overflow
    pub rx_fifo_errors: u64,
    pub rx_missed: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

impl InterfaceCounters {
    /// Growth since `earlier`; a counter that went down (reset) counts as zero
    pub fn delta(&self, earlier: &Self) -> Self {
        Self {
            rx_dropped: self.rx_dropped.saturating_sub(earlier.rx_dropped),
            tx_dropped: self.tx_dropped.saturating_sub(earlier.tx_dropped),
            rx_fifo_errors: self.rx_fifo_errors.saturating_sub(earlier.rx_fifo_errors),
            rx_missed: self.rx_missed.saturating_sub(earlier.rx_missed),
            rx_errors: self.rx_errors.saturating_sub(earlier.rx_errors),
            tx_errors: self.tx_errors.saturating_sub(earlier.tx_errors),
        }
    }

    /// Frames discarded before reaching the flow layer
    pub fn drops(&self) -> u64 {
        self.rx_dropped + self.tx_dropped + self.rx_fifo_errors + self.rx_missed
    }

    pub fn errors(&self) -> u64 {
        self.rx_errors + self.tx_errors
    }
}

/// Where loss appears to happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossLocalization {
    /// Drops visible in capture-level counters
    Interface,
    /// Retransmissions and unanswered probes dominate
    Path,
    /// Reordering dominates with little retransmission
    Endpoint,
}

impl fmt::Display for LossLocalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interface => write!(f, "interface"),
            Self::Path => write!(f, "path"),
            Self::Endpoint => write!(f, "endpoint"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LossSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl LossSeverity {
    fn from_loss(pct: f64) -> Option<Self> {
        if pct > 5.0 {
            Some(Self::Critical)
        } else if pct > 2.0 {
            Some(Self::High)
        } else if pct > 1.0 {
            Some(Self::Medium)
        } else if pct > 0.0 {
            Some(Self::Low)
        } else {
            None
        }
    }

    fn from_drops(drops: u64) -> Option<Self> {
        match drops {
            0 => None,
            1..=10 => Some(Self::Medium),
            11..=100 => Some(Self::High),
            _ => Some(Self::Critical),
        }
    }
}

/// Loss picture of one interface over the trailing window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossSnapshot {
    pub at: Duration,
    pub window: Duration,
    /// Data segments and opening SYNs sent
    pub segments: u64,
    pub retransmissions: u64,
    pub fast_retransmits: u64,
    pub timeout_retransmits: u64,
    pub probe_timeouts: u64,
    pub likely_losses: u64,
    pub out_of_order: u64,
    pub affected_flows: usize,
    pub interface_drops: u64,
    pub interface_errors: u64,
    /// Weighted composite, percent
    pub loss_pct: f64,
    pub retransmit_loss_pct: f64,
    pub probe_loss_pct: f64,
    pub localization: Option<LossLocalization>,
    pub severity: Option<LossSeverity>,
    pub evidence: Vec<String>,
}

#[derive(Debug, Default)]
struct Bucket {
    segments: u64,
    retransmissions: u64,
    fast: u64,
    timeout: u64,
    probe_timeouts: u64,
    likely_losses: u64,
    out_of_order: u64,
    drops: u64,
    errors: u64,
    affected: HashSet<FlowKey>,
}

/// Windowed loss estimator for one interface
#[derive(Debug)]
pub struct LossDetector {
    window: Duration,
    weights: LossWeights,
    /// Per-second buckets keyed by capture second
    buckets: BTreeMap<u64, Bucket>,
    baseline: Option<InterfaceCounters>,
    last_counters: Option<InterfaceCounters>,
}

impl LossDetector {
    pub fn new(window: Duration, weights: LossWeights) -> Self {
        Self {
            window,
            weights,
            buckets: BTreeMap::new(),
            baseline: None,
            last_counters: None,
        }
    }

    fn bucket(&mut self, at: Duration) -> &mut Bucket {
        self.buckets.entry(at.as_secs()).or_default()
    }

    /// Count one sent segment (data-bearing or opening SYN)
    pub fn record_segment(&mut self, at: Duration) {
        self.bucket(at).segments += 1;
    }

    /// Fold in a flow tracker event; events unrelated to loss are ignored
    pub fn observe(&mut self, event: &FlowEvent) {
        match event {
            FlowEvent::Retransmission { key, at, kind, .. } => {
                let b = self.bucket(*at);
                b.retransmissions += 1;
                match kind {
                    RetransmitKind::Fast => b.fast += 1,
                    RetransmitKind::Timeout => b.timeout += 1,
                }
                b.affected.insert(*key);
            }
            FlowEvent::ProbeTimeout { key, at } => {
                let b = self.bucket(*at);
                b.probe_timeouts += 1;
                b.affected.insert(*key);
            }
            FlowEvent::LikelyLoss { key, at, .. } => {
                let b = self.bucket(*at);
                b.likely_losses += 1;
                b.affected.insert(*key);
            }
            FlowEvent::OutOfOrder { at, .. } => {
                self.bucket(*at).out_of_order += 1;
            }
            _ => {}
        }
    }

    /// Take a cumulative counter reading; growth since the previous reading
    /// is attributed to `at`
    pub fn record_counters(&mut self, at: Duration, counters: InterfaceCounters) {
        if self.baseline.is_none() {
            self.baseline = Some(counters);
        }
        if let Some(previous) = self.last_counters {
            let delta = counters.delta(&previous);
            if delta.drops() > 0 || delta.errors() > 0 {
                let b = self.bucket(at);
                b.drops += delta.drops();
                b.errors += delta.errors();
            }
        }
        self.last_counters = Some(counters);
    }

    /// Growth of every counter since the first reading
    pub fn counters_since_baseline(&self) -> Option<InterfaceCounters> {
        Some(self.last_counters?.delta(&self.baseline?))
    }

    /// Drop buckets that fell out of the window ending at `now`
    pub fn prune(&mut self, now: Duration) {
        let cutoff = now.saturating_sub(self.window).as_secs();
        self.buckets = self.buckets.split_off(&cutoff);
    }

    /// Loss over the window ending at `now`
    pub fn snapshot(&mut self, now: Duration) -> LossSnapshot {
        self.prune(now);

        let mut total = Bucket::default();
        for b in self.buckets.values() {
            total.segments += b.segments;
            total.retransmissions += b.retransmissions;
            total.fast += b.fast;
            total.timeout += b.timeout;
            total.probe_timeouts += b.probe_timeouts;
            total.likely_losses += b.likely_losses;
            total.out_of_order += b.out_of_order;
            total.drops += b.drops;
            total.errors += b.errors;
            total.affected.extend(b.affected.iter().copied());
        }

        let pct = |n: f64| {
            if total.segments == 0 {
                if n > 0.0 { 100.0 } else { 0.0 }
            } else {
                (n / total.segments as f64 * 100.0).min(100.0)
            }
        };
        let retransmit_loss_pct = pct(total.retransmissions as f64);
        let probe_loss_pct = pct(total.probe_timeouts as f64);
        let loss_pct = pct(self.weights.retransmission * total.retransmissions as f64
            + self.weights.probe_timeout * total.probe_timeouts as f64);

        let path_signals = total.retransmissions + total.probe_timeouts;
        let localization = if total.drops > 0 {
            Some(LossLocalization::Interface)
        } else if path_signals > 0 && path_signals >= total.out_of_order {
            Some(LossLocalization::Path)
        } else if total.out_of_order > 0 {
            Some(LossLocalization::Endpoint)
        } else {
            None
        };

        let severity = LossSeverity::from_loss(loss_pct).max(LossSeverity::from_drops(total.drops));
        let evidence = evidence(&total, retransmit_loss_pct);

        LossSnapshot {
            at: now,
            window: self.window,
            segments: total.segments,
            retransmissions: total.retransmissions,
            fast_retransmits: total.fast,
            timeout_retransmits: total.timeout,
            probe_timeouts: total.probe_timeouts,
            likely_losses: total.likely_losses,
            out_of_order: total.out_of_order,
            affected_flows: total.affected.len(),
            interface_drops: total.drops,
            interface_errors: total.errors,
            loss_pct,
            retransmit_loss_pct,
            probe_loss_pct,
            localization,
            severity,
            evidence,
        }
    }
}

fn evidence(total: &Bucket, retransmit_loss_pct: f64) -> Vec<String> {
    let mut lines = Vec::new();
    if total.drops > 0 {
        lines.push(format!("{} frames dropped at the interface", total.drops));
    }
    if total.errors > 0 {
        lines.push(format!("{} interface errors", total.errors));
    }
    if total.retransmissions > 0 {
        lines.push(format!(
            "{} retransmissions in {} segments ({:.2}%)",
            total.retransmissions, total.segments, retransmit_loss_pct
        ));
        if total.fast > total.timeout {
            lines.push("fast retransmits dominate (congestion likely)".into());
        } else {
            lines.push("timeout retransmits dominate (path issue likely)".into());
        }
    }
    if total.likely_losses > 0 {
        lines.push(format!(
            "{} retransmissions without forward progress",
            total.likely_losses
        ));
    }
    if total.probe_timeouts > 0 {
        lines.push(format!("{} handshakes unanswered", total.probe_timeouts));
    }
    if total.out_of_order > 0 {
        lines.push(format!("{} out-of-order segments", total.out_of_order));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Direction, Endpoint, Protocol};

    fn key(port: u16) -> FlowKey {
        FlowKey::normalize(
            Protocol::Tcp,
            Endpoint {
                addr: "10.0.0.1".parse().unwrap(),
                port,
            },
            Endpoint {
                addr: "10.0.0.2".parse().unwrap(),
                port: 443,
            },
        )
        .0
    }

    fn retx(port: u16, at: Duration, kind: RetransmitKind) -> FlowEvent {
        FlowEvent::Retransmission {
            key: key(port),
            direction: Direction::Forward,
            at,
            kind,
        }
    }

    fn detector() -> LossDetector {
        LossDetector::new(Duration::from_secs(10), LossWeights::default())
    }

    #[test]
    fn test_no_traffic_no_loss() {
        let snap = detector().snapshot(Duration::from_secs(5));
        assert_eq!(snap.loss_pct, 0.0);
        assert!(snap.localization.is_none());
        assert!(snap.severity.is_none());
    }

    #[test]
    fn test_retransmissions_localize_to_path() {
        let mut d = detector();
        let at = Duration::from_secs(1);
        for _ in 0..100 {
            d.record_segment(at);
        }
        for i in 0..3 {
            d.observe(&retx(i, at, RetransmitKind::Fast));
        }
        let snap = d.snapshot(Duration::from_secs(2));
        assert!((snap.loss_pct - 3.0).abs() < 1e-9);
        assert_eq!(snap.localization, Some(LossLocalization::Path));
        assert_eq!(snap.severity, Some(LossSeverity::High));
        assert_eq!(snap.affected_flows, 3);
        assert_eq!(snap.fast_retransmits, 3);
    }

    #[test]
    fn test_weights_apply_per_term() {
        let weights = LossWeights {
            retransmission: 1.0,
            probe_timeout: 0.5,
        };
        let mut d = LossDetector::new(Duration::from_secs(10), weights);
        let at = Duration::from_secs(1);
        for _ in 0..100 {
            d.record_segment(at);
        }
        d.observe(&retx(1, at, RetransmitKind::Timeout));
        d.observe(&FlowEvent::ProbeTimeout { key: key(2), at });
        d.observe(&FlowEvent::ProbeTimeout { key: key(3), at });
        let snap = d.snapshot(at);
        assert!((snap.loss_pct - 2.0).abs() < 1e-9);
        assert!((snap.retransmit_loss_pct - 1.0).abs() < 1e-9);
        assert!((snap.probe_loss_pct - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_interface_drops_take_precedence() {
        let mut d = detector();
        let at = Duration::from_secs(1);
        d.record_counters(at, InterfaceCounters::default());
        d.record_counters(
            at,
            InterfaceCounters {
                rx_fifo_errors: 25,
                ..Default::default()
            },
        );
        d.observe(&retx(1, at, RetransmitKind::Fast));
        let snap = d.snapshot(at);
        assert_eq!(snap.localization, Some(LossLocalization::Interface));
        assert_eq!(snap.interface_drops, 25);
        assert_eq!(snap.severity, Some(LossSeverity::Critical));
        assert_eq!(d.counters_since_baseline().unwrap().rx_fifo_errors, 25);
    }

    #[test]
    fn test_reordering_localizes_to_endpoint() {
        let mut d = detector();
        let at = Duration::from_secs(1);
        for _ in 0..50 {
            d.record_segment(at);
        }
        for _ in 0..5 {
            d.observe(&FlowEvent::OutOfOrder {
                key: key(1),
                direction: Direction::Forward,
                at,
            });
        }
        d.observe(&retx(1, at, RetransmitKind::Fast));
        let snap = d.snapshot(at);
        assert_eq!(snap.localization, Some(LossLocalization::Endpoint));
    }

    #[test]
    fn test_old_buckets_leave_the_window() {
        let mut d = detector();
        d.record_segment(Duration::from_secs(1));
        d.observe(&retx(1, Duration::from_secs(1), RetransmitKind::Fast));
        d.record_segment(Duration::from_secs(20));
        let snap = d.snapshot(Duration::from_secs(20));
        assert_eq!(snap.retransmissions, 0);
        assert_eq!(snap.segments, 1);
    }

    #[test]
    fn test_counter_reset_is_not_negative() {
        let before = InterfaceCounters {
            rx_dropped: 10,
            ..Default::default()
        };
        let after = InterfaceCounters::default();
        assert_eq!(after.delta(&before).drops(), 0);
    }
}
