use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::packet::{Direction, FlowKey};
use crate::state::TcpState;

/// Resent data seen this soon after the original counts as a fast retransmit
pub const FAST_RETRANSMIT_THRESHOLD: Duration = Duration::from_millis(200);

/// Why a flow left the flow table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Fin,
    Rst,
    Idle,
    /// Oldest-idle eviction when the flow table was full
    Evicted,
    /// Pipeline stop
    Flush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetransmitKind {
    /// Resent within [`FAST_RETRANSMIT_THRESHOLD`] of the original
    Fast,
    /// Resent later, or the original was not seen
    Timeout,
}

/// Terminal (or live) summary of one flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub key: FlowKey,
    pub tcp_state: Option<TcpState>,
    pub created: Duration,
    pub last_seen: Duration,
    pub duration: Duration,
    /// Indexed by [`Direction::index`]
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub in_order: u64,
    pub out_of_order: u64,
    pub retransmissions: u64,
    pub fast_retransmits: u64,
    pub timeout_retransmits: u64,
    pub ece: u64,
    pub handshake_rtt: Option<Duration>,
    pub handshake_time: Option<Duration>,
    pub avg_window: [Option<f64>; 2],
    /// `None` while the flow is still open
    pub reason: Option<CloseReason>,
}

impl FlowSummary {
    pub fn total_bytes(&self) -> u64 {
        self.bytes.iter().sum()
    }
}

/// Something the flow tracker observed that downstream analyzers care about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowEvent {
    NewFlow {
        key: FlowKey,
        at: Duration,
    },
    Retransmission {
        key: FlowKey,
        direction: Direction,
        at: Duration,
        kind: RetransmitKind,
    },
    OutOfOrder {
        key: FlowKey,
        direction: Direction,
        at: Duration,
    },
    /// Handshake round trip: SYN to the SYN-ACK that acknowledges it
    RttSample {
        key: FlowKey,
        rtt: Duration,
        at: Duration,
    },
    /// A retransmission was not followed by forward progress in time
    LikelyLoss {
        key: FlowKey,
        direction: Direction,
        at: Duration,
    },
    /// A SYN went unanswered for the probe timeout
    ProbeTimeout {
        key: FlowKey,
        at: Duration,
    },
    Closed(FlowSummary),
}

impl FlowEvent {
    pub fn key(&self) -> &FlowKey {
        match self {
            Self::NewFlow { key, .. }
            | Self::Retransmission { key, .. }
            | Self::OutOfOrder { key, .. }
            | Self::RttSample { key, .. }
            | Self::LikelyLoss { key, .. }
            | Self::ProbeTimeout { key, .. } => key,
            Self::Closed(summary) => &summary.key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewFlow { .. } => "new_flow",
            Self::Retransmission { .. } => "retransmission",
            Self::OutOfOrder { .. } => "out_of_order",
            Self::RttSample { .. } => "rtt_sample",
            Self::LikelyLoss { .. } => "likely_loss",
            Self::ProbeTimeout { .. } => "probe_timeout",
            Self::Closed(_) => "closed",
        }
    }
}
