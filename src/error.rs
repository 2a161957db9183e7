use thiserror::Error;

use crate::packet::{InterfaceId, Protocol};

/// Why a packet record was refused at ingest.
///
/// Every variant is recoverable: the record is counted and dropped, the
/// pipeline keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("{protocol} record is missing required field `{field}`")]
    MissingField {
        protocol: Protocol,
        field: &'static str,
    },
    #[error("payload length {payload} exceeds frame length {frame}")]
    LengthMismatch { payload: u32, frame: u32 },
    #[error("record captured on {record} was submitted for {submitted}")]
    InterfaceMismatch {
        record: InterfaceId,
        submitted: InterfaceId,
    },
    #[error("monitor is stopped")]
    Stopped,
}

impl IngestError {
    /// Short stable label used for per-class rejection counters
    pub fn class(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "missing_field",
            Self::LengthMismatch { .. } => "length_mismatch",
            Self::InterfaceMismatch { .. } => "interface_mismatch",
            Self::Stopped => "stopped",
        }
    }
}

/// Configuration values that cannot drive a working pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{metric}: warning threshold {warning} must be below critical threshold {critical}")]
    ThresholdOrder {
        metric: &'static str,
        warning: f64,
        critical: f64,
    },
    #[error("{metric}: hysteresis margin {margin} must be finite and non-negative")]
    Hysteresis { metric: &'static str, margin: f64 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0} weights must be non-negative and not all zero")]
    Weights(&'static str),
}

/// Failures starting the asynchronous monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor must be started from within a tokio runtime")]
    NoRuntime,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_error_display() {
        let err = IngestError::MissingField {
            protocol: Protocol::Tcp,
            field: "seq",
        };
        assert_eq!(err.to_string(), "TCP record is missing required field `seq`");
        assert_eq!(err.class(), "missing_field");
    }

    #[test]
    fn test_config_error_converts_into_monitor_error() {
        let err: MonitorError = ConfigError::Zero("ring_capacity").into();
        assert!(err.to_string().contains("ring_capacity"));
    }
}
