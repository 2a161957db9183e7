use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::analysis::{
    InterfaceHealth, JitterAnalyzer, JitterSnapshot, LatencyAnalyzer, LatencySnapshot,
    LossDetector, LossSnapshot, PathMetrics, ThroughputMeter, ThroughputSnapshot,
};
use crate::config::Config;
use crate::packet::InterfaceId;
use crate::pipeline::Shared;
use crate::pipeline::lane::Work;
use crate::state::{Metric, MetricsStore};
use crate::trace::FlowEvent;

/// Work items applied per queue before moving to the next interface
const MAX_DRAIN_BATCH: usize = 4096;

/// Point-in-time view of one interface, refreshed every evaluation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    pub interface: InterfaceId,
    /// Capture time the snapshot describes
    pub at: Duration,
    pub evaluated_at: DateTime<Utc>,
    pub loss_pct: Option<f64>,
    pub latency_p50: Option<f64>,
    pub latency_p95: Option<f64>,
    pub latency_p99: Option<f64>,
    pub jitter: Option<f64>,
    pub bandwidth_mbps: Option<f64>,
    pub health_score: f64,
    pub loss: Option<LossSnapshot>,
    pub latency: Option<LatencySnapshot>,
    pub jitter_detail: Option<JitterSnapshot>,
    pub throughput: Option<ThroughputSnapshot>,
    pub health: InterfaceHealth,
}

/// Loss, latency, jitter and throughput state of one interface
#[derive(Debug)]
struct Analyzers {
    loss: LossDetector,
    latency: LatencyAnalyzer,
    jitter: JitterAnalyzer,
    throughput: ThroughputMeter,
    /// Latest capture time seen in this interface's work
    clock: Duration,
    /// Loss is published once the interface carried TCP traffic or drops
    loss_seen: bool,
}

impl Analyzers {
    fn new(config: &Config, interface: &InterfaceId) -> Self {
        Self {
            loss: LossDetector::new(config.loss_window, config.loss_weights),
            latency: LatencyAnalyzer::new(config.latency_reservoir),
            jitter: JitterAnalyzer::new(config.jitter_window),
            throughput: ThroughputMeter::new(config.bandwidth_window, config.link_speed(interface)),
            clock: Duration::ZERO,
            loss_seen: false,
        }
    }

    fn apply(&mut self, work: Work) {
        match work {
            Work::Packet {
                key,
                direction,
                at,
                frame_len,
                sent_segment,
                arrival,
            } => {
                self.clock = self.clock.max(at);
                self.throughput.record(at, frame_len);
                if sent_segment {
                    self.loss.record_segment(at);
                }
                if let Some(arrival) = arrival {
                    self.jitter.record_arrival(key, direction, arrival);
                }
            }
            Work::Event(event) => {
                match &event {
                    FlowEvent::RttSample { rtt, .. } => self.latency.record(*rtt),
                    FlowEvent::Closed(summary) => self.jitter.forget(&summary.key),
                    _ => {}
                }
                self.loss.observe(&event);
            }
            Work::Counters { at, counters } => {
                self.clock = self.clock.max(at);
                self.loss.record_counters(at, counters);
            }
        }
    }

    /// Compute every analyzer's view as of the interface clock and publish it
    fn publish(&mut self, store: &MetricsStore, interface: &InterfaceId) -> Published {
        let now = self.clock;

        let loss = self.loss.snapshot(now);
        self.loss_seen |= loss.segments > 0
            || loss.retransmissions > 0
            || loss.probe_timeouts > 0
            || loss.out_of_order > 0
            || loss.interface_drops > 0;
        let loss = self.loss_seen.then_some(loss);
        if let Some(loss) = &loss {
            store.record(interface, Metric::LossPct, now, loss.loss_pct);
            store.record(interface, Metric::RetransmitLossPct, now, loss.retransmit_loss_pct);
            store.record(interface, Metric::ProbeLossPct, now, loss.probe_loss_pct);
        }

        let latency = self.latency.snapshot();
        if let Some(latency) = &latency {
            store.record(interface, Metric::LatencyP50, now, latency.p50);
            store.record(interface, Metric::LatencyP95, now, latency.p95);
            store.record(interface, Metric::LatencyP99, now, latency.p99);
            store.record(interface, Metric::LatencyMean, now, latency.mean);
        }

        let jitter = self.jitter.snapshot(now);
        if let Some(jitter) = &jitter {
            store.record(interface, Metric::Jitter, now, jitter.mean);
        }

        let throughput = self.throughput.snapshot(now);
        if let Some(throughput) = &throughput {
            store.record(interface, Metric::BandwidthMbps, now, throughput.mbps);
            store.record(interface, Metric::PacketRate, now, throughput.packets_per_sec);
            store.record(interface, Metric::Packets, now, throughput.packets as f64);
            if let Some(utilization) = throughput.utilization {
                store.record(interface, Metric::Utilization, now, utilization);
            }
        }

        Published {
            at: now,
            loss,
            latency,
            jitter,
            throughput,
        }
    }
}

struct Published {
    at: Duration,
    loss: Option<LossSnapshot>,
    latency: Option<LatencySnapshot>,
    jitter: Option<JitterSnapshot>,
    throughput: Option<ThroughputSnapshot>,
}

/// Drains the analysis queues and runs the evaluation cycle.
pub(crate) struct Evaluator {
    shared: Arc<Shared>,
    analyzers: HashMap<InterfaceId, Analyzers>,
}

impl Evaluator {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            analyzers: HashMap::new(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let work_ready = Arc::clone(&self.shared.work_ready);
        let mut interval = tokio::time::interval(self.shared.config.evaluation_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.drain();
                    self.cycle();
                }
                _ = work_ready.notified() => {
                    self.drain();
                }
            }
        }

        // Lanes have flushed by now; fold in their last output
        let applied = self.drain();
        self.cycle();
        info!(applied, "evaluator stopped");
        Ok(())
    }

    /// Apply everything queued so far; returns the number of items applied
    fn drain(&mut self) -> usize {
        let queues: Vec<_> = self
            .shared
            .lanes
            .read()
            .values()
            .map(|lane| (lane.interface.clone(), Arc::clone(&lane.work)))
            .collect();

        let mut applied = 0;
        for (interface, queue) in queues {
            let analyzers = self
                .analyzers
                .entry(interface.clone())
                .or_insert_with(|| Analyzers::new(&self.shared.config, &interface));
            loop {
                let batch = queue.drain(MAX_DRAIN_BATCH);
                if batch.is_empty() {
                    break;
                }
                applied += batch.len();
                for work in batch {
                    analyzers.apply(work);
                }
            }
        }
        applied
    }

    /// One evaluation cycle over every interface seen so far
    fn cycle(&mut self) {
        let shared = &self.shared;
        let mut interfaces: Vec<&InterfaceId> = self.analyzers.keys().collect();
        interfaces.sort();
        let interfaces: Vec<InterfaceId> = interfaces.into_iter().cloned().collect();

        for interface in interfaces {
            let Some(analyzers) = self.analyzers.get_mut(&interface) else {
                continue;
            };
            let published = analyzers.publish(&shared.store, &interface);
            let localization = published.loss.as_ref().and_then(|l| l.localization);
            let metrics = PathMetrics::from_store(&shared.store, &interface, localization);
            if metrics.is_empty() && published.throughput.is_none() {
                continue;
            }

            let health = shared.comparator.score(&interface, metrics.clone());
            shared
                .store
                .record(&interface, Metric::HealthScore, published.at, health.score);

            shared
                .bottleneck
                .lock()
                .evaluate(&interface, metrics.clone(), published.at);
            let transitions = shared
                .alerts
                .lock()
                .evaluate_metrics(&interface, &metrics, published.at);
            if !transitions.is_empty() {
                debug!(interface = %interface, transitions = transitions.len(), "alerts changed");
            }

            let snapshot = InterfaceSnapshot {
                interface: interface.clone(),
                at: published.at,
                evaluated_at: Utc::now(),
                loss_pct: metrics.loss_pct,
                latency_p50: published.latency.as_ref().map(|l| l.p50),
                latency_p95: metrics.latency_p95,
                latency_p99: published.latency.as_ref().map(|l| l.p99),
                jitter: metrics.jitter,
                bandwidth_mbps: metrics.bandwidth_mbps,
                health_score: health.score,
                loss: published.loss,
                latency: published.latency,
                jitter_detail: published.jitter,
                throughput: published.throughput,
                health,
            };
            shared.snapshots.write().insert(interface, snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Direction, Endpoint, FlowKey, Protocol};

    fn key() -> FlowKey {
        FlowKey::normalize(
            Protocol::Tcp,
            Endpoint {
                addr: "10.0.0.1".parse().unwrap(),
                port: 40000,
            },
            Endpoint {
                addr: "10.0.0.2".parse().unwrap(),
                port: 443,
            },
        )
        .0
    }

    fn packet(ms: u64, sent_segment: bool) -> Work {
        Work::Packet {
            key: key(),
            direction: Direction::Forward,
            at: Duration::from_millis(ms),
            frame_len: 1000,
            sent_segment,
            arrival: Some(Duration::from_millis(ms)),
        }
    }

    #[test]
    fn test_udp_only_interface_publishes_no_loss() {
        let config = Config::default();
        let eth0 = InterfaceId::from("eth0");
        let store = MetricsStore::new(16);
        let mut a = Analyzers::new(&config, &eth0);
        for i in 0..10 {
            a.apply(packet(i * 10, false));
        }
        let published = a.publish(&store, &eth0);
        assert!(published.loss.is_none());
        assert!(store.latest(&eth0, Metric::LossPct).is_none());
        assert!(store.latest(&eth0, Metric::BandwidthMbps).is_some());
        assert_eq!(store.latest_value(&eth0, Metric::Packets), Some(10.0));
    }

    #[test]
    fn test_rtt_and_retransmission_reach_store() {
        let config = Config::default();
        let eth0 = InterfaceId::from("eth0");
        let store = MetricsStore::new(16);
        let mut a = Analyzers::new(&config, &eth0);
        for i in 0..4 {
            a.apply(packet(i * 10, true));
        }
        a.apply(Work::Event(FlowEvent::RttSample {
            key: key(),
            rtt: Duration::from_millis(40),
            at: Duration::from_millis(40),
        }));
        a.apply(Work::Event(FlowEvent::Retransmission {
            key: key(),
            direction: Direction::Forward,
            at: Duration::from_millis(30),
            kind: crate::trace::RetransmitKind::Fast,
        }));

        let published = a.publish(&store, &eth0);
        assert_eq!(published.at, Duration::from_millis(30));
        assert_eq!(store.latest_value(&eth0, Metric::LossPct), Some(25.0));
        let p95 = store.latest_value(&eth0, Metric::LatencyP95).unwrap();
        assert!((p95 - 40.0).abs() < 1e-9);
        assert_eq!(store.latest_value(&eth0, Metric::Jitter), Some(0.0));
    }
}
