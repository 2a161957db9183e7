//! Cross-interface health comparison.
//!
//! Each interface gets a health score in [0, 100]: every metric is inverted
//! against its critical threshold (0 at or beyond critical, 100 at zero) and
//! the sub-scores are combined with the configured weights. Any number of
//! interfaces can be ranked; every pair gets a signed delta.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::analysis::PathMetrics;
use crate::config::{HealthWeights, ThresholdSet};
use crate::packet::InterfaceId;
use crate::state::MetricsStore;

/// Score breakdown of one interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceHealth {
    pub interface: InterfaceId,
    pub score: f64,
    pub loss_score: f64,
    pub latency_score: f64,
    pub jitter_score: f64,
    pub metrics: PathMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    FirstHealthier,
    SecondHealthier,
    /// Scores within the tie epsilon
    Equivalent,
}

/// Per-category winner; `None` is a tie or missing data on both sides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryWinners {
    pub loss: Option<InterfaceId>,
    pub latency: Option<InterfaceId>,
    pub jitter: Option<InterfaceId>,
    pub bandwidth: Option<InterfaceId>,
}

impl CategoryWinners {
    fn wins(&self, id: &InterfaceId) -> usize {
        [&self.loss, &self.latency, &self.jitter, &self.bandwidth]
            .into_iter()
            .filter(|w| w.as_ref() == Some(id))
            .count()
    }
}

/// Outcome of comparing two interfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub first: InterfaceHealth,
    pub second: InterfaceHealth,
    /// `first.score - second.score`
    pub delta: f64,
    pub verdict: Verdict,
    pub winners: CategoryWinners,
    /// In [0, 1]; lower with little traffic or close scores
    pub confidence: f64,
    pub recommendation: String,
}

impl ComparisonResult {
    /// Interface with the higher score, `None` when equivalent
    pub fn healthier(&self) -> Option<&InterfaceId> {
        match self.verdict {
            Verdict::FirstHealthier => Some(&self.first.interface),
            Verdict::SecondHealthier => Some(&self.second.interface),
            Verdict::Equivalent => None,
        }
    }
}

impl fmt::Display for ComparisonResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.1} vs {} {:.1} (delta {:+.1}, confidence {:.0}%)",
            self.first.interface,
            self.first.score,
            self.second.interface,
            self.second.score,
            self.delta,
            self.confidence * 100.0
        )
    }
}

/// Ranking of a set of interfaces plus every pairwise comparison
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    /// Healthiest first; equal scores ordered by interface name
    pub ranking: Vec<InterfaceHealth>,
    /// One entry per unordered pair, in input order
    pub pairs: Vec<ComparisonResult>,
}

impl ComparisonReport {
    pub fn pair(&self, a: &InterfaceId, b: &InterfaceId) -> Option<&ComparisonResult> {
        self.pairs
            .iter()
            .find(|p| &p.first.interface == a && &p.second.interface == b)
    }
}

#[derive(Debug, Clone)]
pub struct InterfaceComparator {
    thresholds: ThresholdSet,
    weights: HealthWeights,
    epsilon: f64,
}

impl InterfaceComparator {
    pub fn new(thresholds: ThresholdSet, weights: HealthWeights, epsilon: f64) -> Self {
        Self {
            thresholds,
            weights,
            epsilon,
        }
    }

    /// Health score from a set of metric values
    pub fn score(&self, interface: &InterfaceId, metrics: PathMetrics) -> InterfaceHealth {
        let loss_score = inverted(metrics.loss_pct, self.thresholds.loss.critical);
        let latency_score = inverted(metrics.latency_p95, self.thresholds.latency.critical);
        let jitter_score = inverted(metrics.jitter, self.thresholds.jitter.critical);

        let w = &self.weights;
        let total = w.loss + w.latency + w.jitter;
        let score = if total > 0.0 {
            (w.loss * loss_score + w.latency * latency_score + w.jitter * jitter_score) / total
        } else {
            100.0
        };

        InterfaceHealth {
            interface: interface.clone(),
            score: score.clamp(0.0, 100.0),
            loss_score,
            latency_score,
            jitter_score,
            metrics,
        }
    }

    /// Health of one interface from the latest values in the store
    pub fn health(&self, store: &MetricsStore, interface: &InterfaceId) -> InterfaceHealth {
        self.score(interface, PathMetrics::from_store(store, interface, None))
    }

    pub fn compare(
        &self,
        store: &MetricsStore,
        a: &InterfaceId,
        b: &InterfaceId,
    ) -> ComparisonResult {
        self.compare_health(self.health(store, a), self.health(store, b))
    }

    /// Rank any number of interfaces and compare every pair
    pub fn compare_all(&self, store: &MetricsStore, interfaces: &[InterfaceId]) -> ComparisonReport {
        let mut seen: Vec<&InterfaceId> = Vec::with_capacity(interfaces.len());
        for id in interfaces {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        let healths: Vec<InterfaceHealth> = seen.iter().map(|id| self.health(store, id)).collect();

        let mut pairs = Vec::new();
        for (i, a) in healths.iter().enumerate() {
            for b in &healths[i + 1..] {
                pairs.push(self.compare_health(a.clone(), b.clone()));
            }
        }

        let mut ranking = healths;
        ranking.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.interface.cmp(&b.interface))
        });

        ComparisonReport { ranking, pairs }
    }

    fn compare_health(&self, first: InterfaceHealth, second: InterfaceHealth) -> ComparisonResult {
        let delta = first.score - second.score;
        let verdict = if delta.abs() <= self.epsilon {
            Verdict::Equivalent
        } else if delta > 0.0 {
            Verdict::FirstHealthier
        } else {
            Verdict::SecondHealthier
        };

        let a = &first.metrics;
        let b = &second.metrics;
        let winners = CategoryWinners {
            loss: lower_wins(a.loss_pct, b.loss_pct, &first, &second),
            latency: lower_wins(a.latency_p95, b.latency_p95, &first, &second),
            jitter: lower_wins(a.jitter, b.jitter, &first, &second),
            bandwidth: lower_wins(
                b.bandwidth_mbps,
                a.bandwidth_mbps,
                &second,
                &first,
            ),
        };

        let confidence = confidence(&first, &second, delta);
        let recommendation = self.recommend(&first, &second, verdict, &winners);

        ComparisonResult {
            first,
            second,
            delta,
            verdict,
            winners,
            confidence,
            recommendation,
        }
    }

    fn recommend(
        &self,
        first: &InterfaceHealth,
        second: &InterfaceHealth,
        verdict: Verdict,
        winners: &CategoryWinners,
    ) -> String {
        let (winner, loser) = match verdict {
            Verdict::Equivalent => {
                return format!(
                    "{} and {} perform alike; balance traffic across both for redundancy",
                    first.interface, second.interface
                );
            }
            Verdict::FirstHealthier => (first, second),
            Verdict::SecondHealthier => (second, first),
        };

        let t = &self.thresholds;
        let m = &loser.metrics;
        let mut issues = Vec::new();
        if let Some(loss) = m.loss_pct
            && loss > t.loss.warning
        {
            issues.push(format!("high packet loss ({:.2}%)", loss));
        }
        if let Some(p95) = m.latency_p95
            && p95 > t.latency.warning
        {
            issues.push(format!("high latency ({:.1} ms p95)", p95));
        }
        if let Some(jitter) = m.jitter
            && jitter > t.jitter.warning
        {
            issues.push(format!("high jitter ({:.1} ms)", jitter));
        }

        if issues.is_empty() {
            format!(
                "{} performs better overall (won {}/4 categories); route critical traffic through it",
                winner.interface,
                winners.wins(&winner.interface)
            )
        } else {
            format!(
                "Use {} for critical traffic; {} shows {}",
                winner.interface,
                loser.interface,
                issues.join(", ")
            )
        }
    }
}

/// 100 at zero, 0 at or beyond `ceiling`; missing values are a perfect score
fn inverted(value: Option<f64>, ceiling: f64) -> f64 {
    match value {
        Some(v) if ceiling > 0.0 => 100.0 * (1.0 - (v.max(0.0) / ceiling).min(1.0)),
        Some(v) if v > 0.0 => 0.0,
        _ => 100.0,
    }
}

/// Interface whose value is lower, `None` on ties or missing data
fn lower_wins(
    a: Option<f64>,
    b: Option<f64>,
    ha: &InterfaceHealth,
    hb: &InterfaceHealth,
) -> Option<InterfaceId> {
    match (a, b) {
        (Some(x), Some(y)) if x < y => Some(ha.interface.clone()),
        (Some(x), Some(y)) if y < x => Some(hb.interface.clone()),
        (Some(_), None) => Some(ha.interface.clone()),
        (None, Some(_)) => Some(hb.interface.clone()),
        _ => None,
    }
}

fn confidence(a: &InterfaceHealth, b: &InterfaceHealth, delta: f64) -> f64 {
    let mut confidence: f64 = 1.0;

    let packets = a
        .metrics
        .packets
        .unwrap_or(0.0)
        .min(b.metrics.packets.unwrap_or(0.0));
    if packets < 100.0 {
        confidence *= 0.5;
    } else if packets < 1000.0 {
        confidence *= 0.8;
    }

    let gap = delta.abs();
    if gap < 5.0 {
        confidence *= 0.7;
    } else if gap < 10.0 {
        confidence *= 0.85;
    }

    (confidence * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Metric;
    use proptest::prelude::*;
    use std::time::Duration;

    fn comparator() -> InterfaceComparator {
        InterfaceComparator::new(ThresholdSet::default(), HealthWeights::default(), 1.0)
    }

    fn publish(store: &MetricsStore, id: &str, loss: f64, p95: f64, jitter: f64, packets: f64) {
        let id = InterfaceId::from(id);
        store.record(&id, Metric::LossPct, Duration::ZERO, loss);
        store.record(&id, Metric::LatencyP95, Duration::ZERO, p95);
        store.record(&id, Metric::Jitter, Duration::ZERO, jitter);
        store.record(&id, Metric::Packets, Duration::ZERO, packets);
    }

    #[test]
    fn test_weighted_score() {
        let store = MetricsStore::new(8);
        publish(&store, "eth0", 1.25, 100.0, 0.0, 5000.0);
        let h = comparator().health(&store, &InterfaceId::from("eth0"));
        assert!((h.loss_score - 50.0).abs() < 1e-9);
        assert!((h.latency_score - 50.0).abs() < 1e-9);
        assert!((h.jitter_score - 100.0).abs() < 1e-9);
        // 0.5*50 + 0.3*50 + 0.2*100
        assert!((h.score - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_beyond_critical_clamps_to_zero() {
        let h = comparator().score(
            &InterfaceId::from("eth0"),
            PathMetrics {
                loss_pct: Some(50.0),
                latency_p95: Some(5000.0),
                jitter: Some(900.0),
                ..PathMetrics::default()
            },
        );
        assert_eq!(h.score, 0.0);
    }

    #[test]
    fn test_healthier_interface_and_winners() {
        let store = MetricsStore::new(8);
        publish(&store, "eth0", 3.0, 120.0, 2.0, 5000.0);
        publish(&store, "eth1", 0.1, 20.0, 2.0, 5000.0);
        let result = comparator().compare(&store, &InterfaceId::from("eth0"), &InterfaceId::from("eth1"));
        assert_eq!(result.verdict, Verdict::SecondHealthier);
        assert_eq!(result.healthier(), Some(&InterfaceId::from("eth1")));
        assert_eq!(result.winners.loss, Some(InterfaceId::from("eth1")));
        assert_eq!(result.winners.jitter, None);
        assert!(result.delta < 0.0);
        assert!(result.recommendation.contains("Use eth1"));
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_close_scores_are_equivalent() {
        let store = MetricsStore::new(8);
        publish(&store, "eth0", 0.10, 20.0, 2.0, 5000.0);
        publish(&store, "eth1", 0.11, 20.0, 2.0, 5000.0);
        let result = comparator().compare(&store, &InterfaceId::from("eth0"), &InterfaceId::from("eth1"));
        assert_eq!(result.verdict, Verdict::Equivalent);
        assert!(result.healthier().is_none());
        assert!(result.confidence < 1.0);
    }

    #[test]
    fn test_single_interface_ranks_alone() {
        let store = MetricsStore::new(8);
        publish(&store, "wlan0", 0.0, 10.0, 1.0, 10.0);
        let report = comparator().compare_all(&store, &[InterfaceId::from("wlan0")]);
        assert_eq!(report.ranking.len(), 1);
        assert!(report.pairs.is_empty());
    }

    #[test]
    fn test_three_interfaces_ranked() {
        let store = MetricsStore::new(8);
        publish(&store, "a", 2.0, 150.0, 10.0, 5000.0);
        publish(&store, "b", 0.0, 10.0, 1.0, 5000.0);
        publish(&store, "c", 0.5, 80.0, 5.0, 5000.0);
        let ids: Vec<InterfaceId> = ["a", "b", "c"].into_iter().map(InterfaceId::from).collect();
        let report = comparator().compare_all(&store, &ids);
        let order: Vec<&str> = report.ranking.iter().map(|h| h.interface.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert_eq!(report.pairs.len(), 3);
        assert!(report.pair(&ids[0], &ids[2]).is_some());
    }

    proptest! {
        #[test]
        fn test_compare_is_antisymmetric(
            la in 0.0f64..10.0, pa in 0.0f64..400.0, ja in 0.0f64..100.0,
            lb in 0.0f64..10.0, pb in 0.0f64..400.0, jb in 0.0f64..100.0,
        ) {
            let store = MetricsStore::new(8);
            publish(&store, "a", la, pa, ja, 1000.0);
            publish(&store, "b", lb, pb, jb, 1000.0);
            let (a, b) = (InterfaceId::from("a"), InterfaceId::from("b"));
            let c = comparator();
            let ab = c.compare(&store, &a, &b);
            let ba = c.compare(&store, &b, &a);
            prop_assert_eq!(ab.delta, -ba.delta);
            prop_assert_eq!(ab.healthier(), ba.healthier());
        }
    }
}
