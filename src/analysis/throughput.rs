use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Traffic volume of one interface over the trailing window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSnapshot {
    pub bytes: u64,
    pub packets: u64,
    pub bytes_per_sec: f64,
    pub packets_per_sec: f64,
    pub mbps: f64,
    /// Percent of the configured link speed, if one is known
    pub utilization: Option<f64>,
}

/// Byte and packet rates from every accepted frame of an interface
#[derive(Debug)]
pub struct ThroughputMeter {
    window: Duration,
    link_speed_mbps: Option<f64>,
    /// `(bytes, packets)` per capture second
    buckets: BTreeMap<u64, (u64, u64)>,
    first_seen: Option<Duration>,
}

impl ThroughputMeter {
    pub fn new(window: Duration, link_speed_mbps: Option<f64>) -> Self {
        Self {
            window,
            link_speed_mbps,
            buckets: BTreeMap::new(),
            first_seen: None,
        }
    }

    pub fn record(&mut self, at: Duration, frame_len: u32) {
        self.first_seen.get_or_insert(at);
        let bucket = self.buckets.entry(at.as_secs()).or_default();
        bucket.0 += u64::from(frame_len);
        bucket.1 += 1;
    }

    pub fn snapshot(&mut self, now: Duration) -> Option<ThroughputSnapshot> {
        let first = self.first_seen?;
        let cutoff = now.saturating_sub(self.window).as_secs();
        self.buckets = self.buckets.split_off(&cutoff);

        let (bytes, packets) = self
            .buckets
            .values()
            .fold((0u64, 0u64), |(b, p), (bb, pp)| (b + bb, p + pp));

        // A capture younger than the window is averaged over its age
        let span = self
            .window
            .min(now.saturating_sub(first))
            .max(Duration::from_secs(1))
            .as_secs_f64();
        let bytes_per_sec = bytes as f64 / span;
        let mbps = bytes_per_sec * 8.0 / 1_000_000.0;
        let utilization = self
            .link_speed_mbps
            .filter(|speed| *speed > 0.0)
            .map(|speed| (mbps / speed * 100.0).min(100.0));

        Some(ThroughputSnapshot {
            bytes,
            packets,
            bytes_per_sec,
            packets_per_sec: packets as f64 / span,
            mbps,
            utilization,
        })
    }
}
