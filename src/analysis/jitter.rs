use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::analysis::Quality;
use crate::packet::{Direction, FlowKey};

/// Jitter label boundaries (ms): excellent, good, acceptable, poor
const JITTER_QUALITY: [f64; 4] = [10.0, 20.0, 30.0, 50.0];
/// Deviation samples retained per interface regardless of window length
const MAX_WINDOW_SAMPLES: usize = 65_536;

/// Interface jitter over the trailing window, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitterSnapshot {
    /// Mean |IAT(i) - IAT(i-1)| across all flows of the interface
    pub mean: f64,
    pub max: f64,
    pub samples: usize,
    pub flows: usize,
    pub voip_ok: bool,
    pub video_ok: bool,
    pub quality: Quality,
}

#[derive(Debug, Clone)]
struct FlowJitter {
    last_arrival: Duration,
    last_iat: Option<Duration>,
    /// RFC 3550 smoothed estimate, milliseconds
    smoothed: f64,
}

/// Inter-arrival jitter per flow direction, aggregated per interface
#[derive(Debug)]
pub struct JitterAnalyzer {
    window: Duration,
    flows: HashMap<(FlowKey, Direction), FlowJitter>,
    /// `(arrival, |ΔIAT| in ms)` in arrival order
    deviations: VecDeque<(Duration, f64)>,
}

impl JitterAnalyzer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            flows: HashMap::new(),
            deviations: VecDeque::new(),
        }
    }

    /// Record an arrival of a packet of one flow direction
    pub fn record_arrival(&mut self, key: FlowKey, direction: Direction, at: Duration) {
        let Some(flow) = self.flows.get_mut(&(key, direction)) else {
            self.flows.insert(
                (key, direction),
                FlowJitter {
                    last_arrival: at,
                    last_iat: None,
                    smoothed: 0.0,
                },
            );
            return;
        };
        if at < flow.last_arrival {
            return;
        }

        let iat = at - flow.last_arrival;
        if let Some(prev) = flow.last_iat {
            let deviation = (to_ms(iat) - to_ms(prev)).abs();
            flow.smoothed += (deviation - flow.smoothed) / 16.0;
            if self.deviations.len() >= MAX_WINDOW_SAMPLES {
                self.deviations.pop_front();
            }
            self.deviations.push_back((at, deviation));
        }
        flow.last_iat = Some(iat);
        flow.last_arrival = at;
    }

    /// Drop per-flow state once a flow is closed
    pub fn forget(&mut self, key: &FlowKey) {
        self.flows.remove(&(*key, Direction::Forward));
        self.flows.remove(&(*key, Direction::Reverse));
    }

    /// Smoothed jitter of one flow direction, milliseconds
    pub fn flow_jitter(&self, key: &FlowKey, direction: Direction) -> Option<f64> {
        let flow = self.flows.get(&(*key, direction))?;
        flow.last_iat.map(|_| flow.smoothed)
    }

    pub fn tracked_flows(&self) -> usize {
        self.flows.len()
    }

    /// Jitter over the window ending at `now`; `None` until two
    /// inter-arrival times were seen on some flow
    pub fn snapshot(&mut self, now: Duration) -> Option<JitterSnapshot> {
        let cutoff = now.saturating_sub(self.window);
        while let Some(&(at, _)) = self.deviations.front() {
            if at >= cutoff {
                break;
            }
            self.deviations.pop_front();
        }

        let n = self.deviations.len();
        if n == 0 {
            return None;
        }
        let sum: f64 = self.deviations.iter().map(|(_, d)| d).sum();
        let max = self.deviations.iter().map(|(_, d)| *d).fold(0.0, f64::max);
        let mean = sum / n as f64;

        Some(JitterSnapshot {
            mean,
            max,
            samples: n,
            flows: self.flows.len(),
            voip_ok: mean < 30.0,
            video_ok: mean < 50.0,
            quality: Quality::grade(mean, JITTER_QUALITY),
        })
    }
}

fn to_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
