//! Root-cause classification of a degraded interface.
//!
//! Causes are decided by an ordered rule list: the first rule whose predicate
//! holds wins. Loss is checked first, so an interface breaching both loss and
//! latency is reported by where its loss happens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::analysis::{LossLocalization, PathMetrics};
use crate::config::ThresholdSet;
use crate::packet::InterfaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BottleneckCause {
    Healthy,
    InterfaceSaturation,
    PathCongestion,
    LatencyDominant,
    JitterDominant,
    Indeterminate,
}

impl fmt::Display for BottleneckCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Healthy => "healthy",
            Self::InterfaceSaturation => "interface saturation",
            Self::PathCongestion => "path congestion",
            Self::LatencyDominant => "latency dominant",
            Self::JitterDominant => "jitter dominant",
            Self::Indeterminate => "indeterminate",
        };
        f.write_str(label)
    }
}

/// One entry of the precedence list: returns a confidence when it matches
pub struct Rule {
    pub cause: BottleneckCause,
    pub matches: fn(&PathMetrics, &ThresholdSet) -> Option<f64>,
}

/// Rules in precedence order; the last one always matches
pub const RULES: [Rule; 6] = [
    Rule {
        cause: BottleneckCause::InterfaceSaturation,
        matches: |m, t| {
            let loss = m.loss_pct?;
            (loss > t.loss.critical && m.localization == Some(LossLocalization::Interface))
                .then(|| margin_above(loss, t.loss.critical))
        },
    },
    Rule {
        cause: BottleneckCause::PathCongestion,
        matches: |m, t| {
            let loss = m.loss_pct?;
            (loss > t.loss.critical && m.localization == Some(LossLocalization::Path))
                .then(|| margin_above(loss, t.loss.critical))
        },
    },
    Rule {
        cause: BottleneckCause::LatencyDominant,
        matches: |m, t| {
            let p95 = m.latency_p95?;
            (p95 > t.latency.critical && loss_within_warning(m, t))
                .then(|| margin_above(p95, t.latency.critical))
        },
    },
    Rule {
        cause: BottleneckCause::JitterDominant,
        matches: |m, t| {
            let jitter = m.jitter?;
            (jitter > t.jitter.critical && loss_within_warning(m, t))
                .then(|| margin_above(jitter, t.jitter.critical))
        },
    },
    Rule {
        cause: BottleneckCause::Healthy,
        matches: |m, t| {
            if m.is_empty() {
                return None;
            }
            let checks = [
                (m.loss_pct, t.loss.warning),
                (m.latency_p95, t.latency.warning),
                (m.jitter, t.jitter.warning),
                (m.utilization, t.utilization.warning),
            ];
            let mut confidence: f64 = 1.0;
            for (value, warning) in checks {
                if let Some(v) = value {
                    if v > warning {
                        return None;
                    }
                    confidence = confidence.min(margin_below(v, warning));
                }
            }
            Some(confidence)
        },
    },
    Rule {
        cause: BottleneckCause::Indeterminate,
        matches: |_, _| Some(0.0),
    },
];

fn loss_within_warning(m: &PathMetrics, t: &ThresholdSet) -> bool {
    m.loss_pct.is_none_or(|loss| loss <= t.loss.warning)
}

/// Normalized distance of `value` above `threshold`, capped at 1
fn margin_above(value: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        return 1.0;
    }
    ((value - threshold) / threshold).clamp(0.0, 1.0)
}

/// Normalized distance of `value` below `threshold`, capped at 1
fn margin_below(value: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        return 1.0;
    }
    ((threshold - value) / threshold).clamp(0.0, 1.0)
}

/// Classify one set of metrics
pub fn classify(metrics: &PathMetrics, thresholds: &ThresholdSet) -> (BottleneckCause, f64) {
    RULES
        .iter()
        .find_map(|rule| (rule.matches)(metrics, thresholds).map(|c| (rule.cause, c)))
        .unwrap_or((BottleneckCause::Indeterminate, 0.0))
}

/// Verdict for one interface at one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckVerdict {
    pub interface: InterfaceId,
    pub cause: BottleneckCause,
    /// In [0, 1]
    pub confidence: f64,
    /// Metric values the verdict was computed from
    pub metrics: PathMetrics,
    /// Capture time of the evaluation
    pub at: Duration,
    pub evaluated_at: DateTime<Utc>,
}

/// Latest verdict per interface; each evaluation replaces the previous one
#[derive(Debug)]
pub struct BottleneckDetector {
    thresholds: ThresholdSet,
    verdicts: HashMap<InterfaceId, BottleneckVerdict>,
}

impl BottleneckDetector {
    pub fn new(thresholds: ThresholdSet) -> Self {
        Self {
            thresholds,
            verdicts: HashMap::new(),
        }
    }

    pub fn evaluate(
        &mut self,
        interface: &InterfaceId,
        metrics: PathMetrics,
        at: Duration,
    ) -> &BottleneckVerdict {
        let (cause, confidence) = classify(&metrics, &self.thresholds);
        let verdict = BottleneckVerdict {
            interface: interface.clone(),
            cause,
            confidence,
            metrics,
            at,
            evaluated_at: Utc::now(),
        };

        let previous = self.verdicts.insert(interface.clone(), verdict);
        if previous.as_ref().map(|v| v.cause) != Some(cause) {
            debug!(
                interface = %interface,
                from = ?previous.map(|v| v.cause),
                to = %cause,
                confidence,
                "bottleneck verdict changed"
            );
        }
        &self.verdicts[interface]
    }

    pub fn verdict(&self, interface: &InterfaceId) -> Option<&BottleneckVerdict> {
        self.verdicts.get(interface)
    }

    pub fn verdicts(&self) -> impl Iterator<Item = &BottleneckVerdict> {
        self.verdicts.values()
    }
}
