use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::analysis::Quality;

/// Latency label boundaries (ms): excellent, good, acceptable, poor
const LATENCY_QUALITY: [f64; 4] = [50.0, 100.0, 150.0, 400.0];

/// Point-in-time latency statistics of one interface, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    /// Samples seen since start (the percentile reservoir holds fewer)
    pub samples: u64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
    pub current: f64,
    pub quality: Quality,
}

/// Rolling RTT percentiles for one interface.
///
/// Percentiles come from a bounded reservoir of the most recent samples
/// using the nearest-rank method, so a given sample sequence always yields
/// the same values. Mean and deviation cover every sample (Welford).
#[derive(Debug, Clone)]
pub struct LatencyAnalyzer {
    reservoir: VecDeque<Duration>,
    capacity: usize,

    count: u64,
    mean_ms: f64,
    m2: f64,
    min: Duration,
    max: Duration,
    last: Option<Duration>,
}

impl LatencyAnalyzer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            reservoir: VecDeque::with_capacity(capacity),
            capacity,
            count: 0,
            mean_ms: 0.0,
            m2: 0.0,
            min: Duration::MAX,
            max: Duration::ZERO,
            last: None,
        }
    }

    /// Add one RTT sample
    pub fn record(&mut self, rtt: Duration) {
        self.count += 1;

        if rtt < self.min {
            self.min = rtt;
        }
        if rtt > self.max {
            self.max = rtt;
        }

        // Welford's online algorithm for mean and variance
        let ms = to_ms(rtt);
        let delta = ms - self.mean_ms;
        self.mean_ms += delta / self.count as f64;
        let delta2 = ms - self.mean_ms;
        self.m2 += delta * delta2;

        self.last = Some(rtt);

        if self.reservoir.len() >= self.capacity {
            self.reservoir.pop_front();
        }
        self.reservoir.push_back(rtt);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Nearest-rank percentile over the reservoir, in milliseconds
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let mut sorted: Vec<Duration> = self.reservoir.iter().copied().collect();
        sorted.sort_unstable();
        percentile_of_sorted(&sorted, p)
    }

    pub fn snapshot(&self) -> Option<LatencySnapshot> {
        let current = self.last?;
        let mut sorted: Vec<Duration> = self.reservoir.iter().copied().collect();
        sorted.sort_unstable();

        let p50 = percentile_of_sorted(&sorted, 50.0)?;
        let p95 = percentile_of_sorted(&sorted, 95.0)?;
        let p99 = percentile_of_sorted(&sorted, 99.0)?;
        let stddev = if self.count < 2 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        };

        Some(LatencySnapshot {
            samples: self.count,
            p50,
            p95,
            p99,
            mean: self.mean_ms,
            min: to_ms(self.min),
            max: to_ms(self.max),
            stddev,
            current: to_ms(current),
            quality: Quality::grade(self.mean_ms, LATENCY_QUALITY),
        })
    }
}

fn percentile_of_sorted(sorted: &[Duration], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.clamp(1, sorted.len()) - 1;
    Some(to_ms(sorted[idx]))
}

fn to_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_has_no_snapshot() {
        assert!(LatencyAnalyzer::new(16).snapshot().is_none());
    }

    #[test]
    fn test_nearest_rank_percentiles() {
        let mut a = LatencyAnalyzer::new(1024);
        for ms in 1..=100 {
            a.record(Duration::from_millis(ms));
        }
        let snap = a.snapshot().unwrap();
        assert!((snap.p50 - 50.0).abs() < 1e-9);
        assert!((snap.p95 - 95.0).abs() < 1e-9);
        assert!((snap.p99 - 99.0).abs() < 1e-9);
        assert!((snap.mean - 50.5).abs() < 1e-9);
        assert_eq!(snap.min, 1.0);
        assert_eq!(snap.max, 100.0);
        assert_eq!(snap.quality, Quality::Good);
    }

    #[test]
    fn test_reservoir_forgets_old_samples() {
        let mut a = LatencyAnalyzer::new(10);
        for _ in 0..10 {
            a.record(Duration::from_millis(500));
        }
        for _ in 0..10 {
            a.record(Duration::from_millis(20));
        }
        assert_eq!(a.percentile(99.0), Some(20.0));
        // Lifetime stats still remember
        assert_eq!(a.snapshot().unwrap().max, 500.0);
        assert_eq!(a.count(), 20);
    }

    #[test]
    fn test_constant_samples_have_zero_stddev() {
        let mut a = LatencyAnalyzer::new(64);
        for _ in 0..20 {
            a.record(Duration::from_millis(120));
        }
        let snap = a.snapshot().unwrap();
        assert!((snap.p95 - 120.0).abs() < 1e-9);
        assert!(snap.stddev.abs() < 1e-9);
        assert_eq!(snap.quality, Quality::Acceptable);
    }

    proptest! {
        #[test]
        fn test_percentiles_are_deterministic(samples in proptest::collection::vec(0u64..10_000, 1..500)) {
            let mut a = LatencyAnalyzer::new(256);
            let mut b = LatencyAnalyzer::new(256);
            for s in &samples {
                a.record(Duration::from_micros(*s));
                b.record(Duration::from_micros(*s));
            }
            let (sa, sb) = (a.snapshot().unwrap(), b.snapshot().unwrap());
            prop_assert_eq!(sa.p50, sb.p50);
            prop_assert_eq!(sa.p95, sb.p95);
            prop_assert!(sa.p50 <= sa.p95 && sa.p95 <= sa.p99);
        }
    }
}
