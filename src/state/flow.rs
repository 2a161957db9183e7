use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::packet::{Direction, FlowKey};
use crate::trace::{CloseReason, FlowSummary};

/// Out-of-order ranges remembered per direction
const MAX_BUFFERED_RANGES: usize = 32;
/// Recently advanced segments remembered per direction, for retransmit timing
const MAX_RECENT_SEGMENTS: usize = 64;

/// `a` precedes `b` in 32-bit sequence space (RFC 1982 serial arithmetic)
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// Later of two sequence numbers
pub fn seq_max(a: u32, b: u32) -> u32 {
    if seq_lt(a, b) { b } else { a }
}

/// How one segment relates to what its direction has already sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentClass {
    /// Starts at the expected sequence number
    InOrder,
    /// Starts beyond the expected sequence number (a gap)
    OutOfOrder,
    /// Carries payload that was already sent
    Retransmission,
    /// Repeats a SYN/FIN without payload; not counted as a retransmission
    Duplicate,
    /// Consumes no sequence space (pure ACK, window update)
    Control,
}

/// Expected-next-sequence bookkeeping for one direction of a TCP flow
#[derive(Debug, Clone, Default)]
pub struct SequenceState {
    next: Option<u32>,
    highest: Option<u32>,
    /// `[start, end)` ranges received beyond `next`
    buffered: VecDeque<(u32, u32)>,
    pub in_order: u64,
    pub out_of_order: u64,
    pub retransmissions: u64,
}

impl SequenceState {
    /// Next sequence number this direction is expected to send
    pub fn expected(&self) -> Option<u32> {
        self.next
    }

    /// End of the highest segment seen; only moves forward in sequence space
    pub fn highest(&self) -> Option<u32> {
        self.highest
    }

    /// Classify a segment and update the expectation.
    ///
    /// `len` is the sequence space the segment consumes (payload plus SYN/FIN),
    /// `payload` its data bytes.
    pub fn classify(&mut self, seq: u32, len: u32, payload: u32) -> SegmentClass {
        if len == 0 {
            if self.next.is_none() {
                self.next = Some(seq);
                self.highest = Some(seq);
            }
            return SegmentClass::Control;
        }

        let end = seq.wrapping_add(len);
        self.highest = Some(match self.highest {
            Some(h) => seq_max(h, end),
            None => end,
        });

        let Some(next) = self.next else {
            self.next = Some(end);
            self.in_order += 1;
            return SegmentClass::InOrder;
        };

        if seq == next {
            self.next = Some(end);
            self.absorb_buffered();
            self.in_order += 1;
            return SegmentClass::InOrder;
        }

        if seq_lt(seq, next) {
            if seq_gt(end, next) {
                // Overlaps the edge: resent data plus new data
                self.next = Some(end);
                self.absorb_buffered();
            }
            return self.repeat(payload);
        }

        if self
            .buffered
            .iter()
            .any(|&(start, stop)| seq_le(start, seq) && seq_le(end, stop))
        {
            return self.repeat(payload);
        }

        if self.buffered.len() >= MAX_BUFFERED_RANGES {
            self.buffered.pop_front();
        }
        self.buffered.push_back((seq, end));
        self.out_of_order += 1;
        SegmentClass::OutOfOrder
    }

    fn repeat(&mut self, payload: u32) -> SegmentClass {
        if payload > 0 {
            self.retransmissions += 1;
            SegmentClass::Retransmission
        } else {
            SegmentClass::Duplicate
        }
    }

    /// Fold buffered ranges that now touch the expectation
    fn absorb_buffered(&mut self) {
        let Some(mut next) = self.next else {
            return;
        };
        loop {
            let Some(pos) = self
                .buffered
                .iter()
                .position(|&(start, _)| seq_le(start, next))
            else {
                break;
            };
            if let Some((_, stop)) = self.buffered.remove(pos) {
                next = seq_max(next, stop);
            }
        }
        self.next = Some(next);
    }
}

/// TCP connection state as seen from the capture point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TcpState {
    SynSent,
    SynReceived,
    Established,
    FinWait,
    Closed,
    /// Picked up mid-stream, handshake never observed
    Unknown,
}

/// Per-direction traffic counters
#[derive(Debug, Clone, Default)]
pub struct DirectionStats {
    pub packets: u64,
    pub bytes: u64,
    pub seq: SequenceState,
    pub fast_retransmits: u64,
    pub timeout_retransmits: u64,
    pub ece: u64,
    pub fin: bool,
    window_sum: u64,
    window_samples: u64,
    /// `(start, end, first seen)` of recently advanced segments
    recent: VecDeque<(u32, u32, Duration)>,
}

impl DirectionStats {
    pub fn record_window(&mut self, window: u16) {
        self.window_sum += u64::from(window);
        self.window_samples += 1;
    }

    pub fn avg_window(&self) -> Option<f64> {
        (self.window_samples > 0).then(|| self.window_sum as f64 / self.window_samples as f64)
    }

    pub fn remember_segment(&mut self, seq: u32, len: u32, at: Duration) {
        if self.recent.len() >= MAX_RECENT_SEGMENTS {
            self.recent.pop_front();
        }
        self.recent.push_back((seq, seq.wrapping_add(len), at));
    }

    /// When the data at `seq` was first seen, if still remembered
    pub fn first_sent(&self, seq: u32) -> Option<Duration> {
        self.recent
            .iter()
            .rev()
            .find(|&&(start, end, _)| seq_le(start, seq) && seq_lt(seq, end))
            .map(|&(_, _, at)| at)
    }
}

/// A retransmission waiting for forward progress
#[derive(Debug, Clone, Copy)]
pub struct RetransmitWatch {
    pub at: Duration,
    /// Expectation when the retransmission was seen
    pub mark: Option<u32>,
}

/// Mutable state of one conversation, owned by the flow tracker
#[derive(Debug, Clone)]
pub struct Flow {
    pub key: FlowKey,
    pub created: Duration,
    pub last_seen: Duration,
    /// `None` for UDP flows
    pub tcp_state: Option<TcpState>,
    /// Direction that sent the opening SYN
    pub initiator: Option<Direction>,
    pub dirs: [DirectionStats; 2],
    pub handshake_rtt: Option<Duration>,
    pub handshake_time: Option<Duration>,
    /// RTT probes currently open for this flow
    pub open_probes: u32,
    pub watches: [Option<RetransmitWatch>; 2],
}

impl Flow {
    pub fn new(key: FlowKey, now: Duration) -> Self {
        Self {
            key,
            created: now,
            last_seen: now,
            tcp_state: None,
            initiator: None,
            dirs: Default::default(),
            handshake_rtt: None,
            handshake_time: None,
            open_probes: 0,
            watches: [None, None],
        }
    }

    pub fn dir(&self, direction: Direction) -> &DirectionStats {
        &self.dirs[direction.index()]
    }

    pub fn dir_mut(&mut self, direction: Direction) -> &mut DirectionStats {
        &mut self.dirs[direction.index()]
    }

    pub fn total_bytes(&self) -> u64 {
        self.dirs.iter().map(|d| d.bytes).sum()
    }

    pub fn total_packets(&self) -> u64 {
        self.dirs.iter().map(|d| d.packets).sum()
    }

    pub fn retransmissions(&self) -> u64 {
        self.dirs.iter().map(|d| d.seq.retransmissions).sum()
    }

    /// Record a FIN from one side; the flow is closed once both sides sent one
    pub fn record_fin(&mut self, direction: Direction) -> bool {
        self.dir_mut(direction).fin = true;
        self.tcp_state = Some(TcpState::FinWait);
        if self.dirs.iter().all(|d| d.fin) {
            self.tcp_state = Some(TcpState::Closed);
            return true;
        }
        false
    }

    /// Point-in-time summary of the flow
    pub fn summary(&self, reason: Option<CloseReason>) -> FlowSummary {
        let fwd = self.dir(Direction::Forward);
        let rev = self.dir(Direction::Reverse);
        FlowSummary {
            key: self.key,
            tcp_state: self.tcp_state,
            created: self.created,
            last_seen: self.last_seen,
            duration: self.last_seen.saturating_sub(self.created),
            packets: [fwd.packets, rev.packets],
            bytes: [fwd.bytes, rev.bytes],
            in_order: fwd.seq.in_order + rev.seq.in_order,
            out_of_order: fwd.seq.out_of_order + rev.seq.out_of_order,
            retransmissions: self.retransmissions(),
            fast_retransmits: fwd.fast_retransmits + rev.fast_retransmits,
            timeout_retransmits: fwd.timeout_retransmits + rev.timeout_retransmits,
            ece: fwd.ece + rev.ece,
            handshake_rtt: self.handshake_rtt,
            handshake_time: self.handshake_time,
            avg_window: [fwd.avg_window(), rev.avg_window()],
            reason,
        }
    }
}
