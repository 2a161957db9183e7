use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;
use crate::packet::InterfaceId;

/// Warning/critical pair for one metric, with the margin a value must fall
/// below a threshold before an alert steps down.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
    pub hysteresis: f64,
}

impl Threshold {
    pub const fn new(warning: f64, critical: f64, hysteresis: f64) -> Self {
        Self {
            warning,
            critical,
            hysteresis,
        }
    }

    fn validate(&self, metric: &'static str) -> Result<(), ConfigError> {
        if !(self.warning.is_finite() && self.critical.is_finite()) || self.warning >= self.critical
        {
            return Err(ConfigError::ThresholdOrder {
                metric,
                warning: self.warning,
                critical: self.critical,
            });
        }
        if !self.hysteresis.is_finite() || self.hysteresis < 0.0 {
            return Err(ConfigError::Hysteresis {
                metric,
                margin: self.hysteresis,
            });
        }
        Ok(())
    }
}

/// Thresholds for every metric the alert manager and bottleneck detector judge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    /// Estimated loss, percent
    pub loss: Threshold,
    /// p95 round-trip time, milliseconds
    pub latency: Threshold,
    /// Interface jitter, milliseconds
    pub jitter: Threshold,
    /// Link utilization, percent (only judged when a link speed is known)
    pub utilization: Threshold,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            loss: Threshold::new(1.0, 2.5, 0.5),
            latency: Threshold::new(100.0, 200.0, 10.0),
            jitter: Threshold::new(30.0, 50.0, 5.0),
            utilization: Threshold::new(80.0, 95.0, 5.0),
        }
    }
}

/// Weights of the two loss numerator terms.
///
/// Retransmission-driven loss points at congestion on the path, probe
/// timeouts at one-way or asymmetric failure. How much each counts is policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub retransmission: f64,
    pub probe_timeout: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            retransmission: 1.0,
            probe_timeout: 1.0,
        }
    }
}

/// Weights of the inverted sub-scores that make up an interface health score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthWeights {
    pub loss: f64,
    pub latency: f64,
    pub jitter: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            loss: 0.5,
            latency: 0.3,
            jitter: 0.2,
        }
    }
}

/// Runtime configuration of the diagnostics pipeline.
///
/// Hosts build this from whatever source they like; the pipeline only
/// consumes the values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub thresholds: ThresholdSet,
    /// Consecutive evaluation cycles above a threshold before an alert escalates
    pub consecutive_cycles: u32,
    /// Inactivity after which a flow is closed
    #[serde(with = "duration_serde")]
    pub flow_idle_timeout: Duration,
    /// Time a handshake RTT probe may stay unanswered
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,
    /// Cadence of bottleneck, comparator and alert evaluation
    #[serde(with = "duration_serde")]
    pub evaluation_period: Duration,
    /// Samples retained per (interface, metric) in the metrics store
    pub ring_capacity: usize,
    /// Flow table bound per interface
    pub max_flows: usize,
    #[serde(with = "duration_serde")]
    pub loss_window: Duration,
    #[serde(with = "duration_serde")]
    pub jitter_window: Duration,
    #[serde(with = "duration_serde")]
    pub bandwidth_window: Duration,
    /// Most recent RTT samples kept per interface for percentiles
    pub latency_reservoir: usize,
    pub loss_weights: LossWeights,
    pub health_weights: HealthWeights,
    /// Health scores closer than this are reported as equivalent
    pub tie_epsilon: f64,
    /// Multiple of the smoothed RTT a retransmission waits for forward progress
    pub retransmit_rtt_scale: f64,
    /// RTT assumed for the likely-loss window before any RTT is measured
    #[serde(with = "duration_serde")]
    pub default_rtt: Duration,
    /// Records buffered per interface ahead of flow tracking
    pub ingest_queue_capacity: usize,
    /// Flow outputs buffered per interface ahead of the analyzers
    pub analysis_queue_capacity: usize,
    /// Link speed in Mbps, per interface, for utilization
    pub link_speeds: HashMap<InterfaceId, f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thresholds: ThresholdSet::default(),
            consecutive_cycles: 2,
            flow_idle_timeout: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(3),
            evaluation_period: Duration::from_secs(1),
            ring_capacity: 3600,
            max_flows: 10_000,
            loss_window: Duration::from_secs(10),
            jitter_window: Duration::from_secs(10),
            bandwidth_window: Duration::from_secs(10),
            latency_reservoir: 1024,
            loss_weights: LossWeights::default(),
            health_weights: HealthWeights::default(),
            tie_epsilon: 1.0,
            retransmit_rtt_scale: 2.0,
            default_rtt: Duration::from_millis(200),
            ingest_queue_capacity: 65_536,
            analysis_queue_capacity: 65_536,
            link_speeds: HashMap::new(),
        }
    }
}

impl Config {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.loss.validate("loss")?;
        self.thresholds.latency.validate("latency")?;
        self.thresholds.jitter.validate("jitter")?;
        self.thresholds.utilization.validate("utilization")?;

        let counts = [
            ("consecutive_cycles", self.consecutive_cycles as usize),
            ("ring_capacity", self.ring_capacity),
            ("max_flows", self.max_flows),
            ("latency_reservoir", self.latency_reservoir),
            ("ingest_queue_capacity", self.ingest_queue_capacity),
            ("analysis_queue_capacity", self.analysis_queue_capacity),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        let durations = [
            ("flow_idle_timeout", self.flow_idle_timeout),
            ("probe_timeout", self.probe_timeout),
            ("evaluation_period", self.evaluation_period),
            ("loss_window", self.loss_window),
            ("jitter_window", self.jitter_window),
            ("bandwidth_window", self.bandwidth_window),
            ("default_rtt", self.default_rtt),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }

        if !(self.retransmit_rtt_scale.is_finite() && self.retransmit_rtt_scale > 0.0) {
            return Err(ConfigError::Zero("retransmit_rtt_scale"));
        }

        let loss = [self.loss_weights.retransmission, self.loss_weights.probe_timeout];
        if !weights_ok(&loss) {
            return Err(ConfigError::Weights("loss"));
        }
        let health = [
            self.health_weights.loss,
            self.health_weights.latency,
            self.health_weights.jitter,
        ];
        if !weights_ok(&health) {
            return Err(ConfigError::Weights("health"));
        }

        Ok(())
    }

    /// Link speed configured for an interface, in Mbps
    pub fn link_speed(&self, interface: &InterfaceId) -> Option<f64> {
        self.link_speeds.get(interface).copied().filter(|s| *s > 0.0)
    }
}

fn weights_ok(weights: &[f64]) -> bool {
    weights.iter().all(|w| w.is_finite() && *w >= 0.0) && weights.iter().any(|w| *w > 0.0)
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = Config::default();
        config.thresholds.jitter = Threshold::new(50.0, 30.0, 1.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOrder { metric: "jitter", .. })
        ));
    }

    #[test]
    fn test_negative_hysteresis_rejected() {
        let mut config = Config::default();
        config.thresholds.loss.hysteresis = -0.1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Hysteresis { metric: "loss", .. })
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = Config {
            ring_capacity: 0,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("ring_capacity")));
    }

    #[test]
    fn test_all_zero_weights_rejected() {
        let config = Config {
            health_weights: HealthWeights {
                loss: 0.0,
                latency: 0.0,
                jitter: 0.0,
            },
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Weights("health")));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = Config::default();
        config.link_speeds.insert(InterfaceId::from("eth0"), 1000.0);
        config.evaluation_period = Duration::from_millis(250);

        let json = serde_json::to_string(&config).unwrap();
        let restored: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.evaluation_period, Duration::from_millis(250));
        assert_eq!(restored.link_speed(&InterfaceId::from("eth0")), Some(1000.0));
        assert_eq!(restored.thresholds, config.thresholds);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let restored: Config = serde_json::from_str(r#"{"consecutive_cycles": 3}"#).unwrap();
        assert_eq!(restored.consecutive_cycles, 3);
        assert_eq!(restored.flow_idle_timeout, Duration::from_secs(120));
    }
}
