use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::IngestError;
use crate::packet::{Direction, FlowKey, InterfaceId, PacketRecord, Protocol};
use crate::state::{Flow, RetransmitWatch, SegmentClass, TcpState, seq_gt};
use crate::trace::events::{CloseReason, FAST_RETRANSMIT_THRESHOLD, FlowEvent, FlowSummary, RetransmitKind};
use crate::trace::pending::PendingMap;

/// How long a FIN/RST-closed key keeps absorbing late packets
const CLOSED_LINGER: Duration = Duration::from_secs(30);
/// Closed flow summaries kept for queries
const RECENT_CLOSED: usize = 256;

/// Flow tracker settings, taken from [`Config`]
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub idle_timeout: Duration,
    pub probe_timeout: Duration,
    pub max_flows: usize,
    pub retransmit_rtt_scale: f64,
    pub default_rtt: Duration,
}

impl From<&Config> for TrackerConfig {
    fn from(config: &Config) -> Self {
        Self {
            idle_timeout: config.flow_idle_timeout,
            probe_timeout: config.probe_timeout,
            max_flows: config.max_flows,
            retransmit_rtt_scale: config.retransmit_rtt_scale,
            default_rtt: config.default_rtt,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Lifetime counters of one tracker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub flows_opened: u64,
    pub flows_closed: u64,
    pub evicted: u64,
    pub clock_anomalies: u64,
    pub late_after_close: u64,
    pub rtt_samples: u64,
    pub probe_timeouts: u64,
    pub likely_losses: u64,
    pub retransmissions: u64,
    pub out_of_order: u64,
}

/// Outcome of feeding one record to the tracker
#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    pub key: FlowKey,
    pub direction: Direction,
    /// Sequence classification, TCP only
    pub class: Option<SegmentClass>,
    pub event: Option<FlowEvent>,
    /// Arrival time for inter-arrival analysis; absent when the timestamp went backwards
    pub arrival: Option<Duration>,
}

/// Stateful flow reconstruction for one interface.
///
/// Owns every [`Flow`] of its interface: nothing else mutates flow state.
/// Packet-driven events come back from [`FlowTracker::ingest`], timer-driven
/// ones (probe timeouts, likely loss, idle closure, evictions) from
/// [`FlowTracker::sweep`].
#[derive(Debug)]
pub struct FlowTracker {
    interface: InterfaceId,
    config: TrackerConfig,
    flows: HashMap<FlowKey, Flow>,
    /// FIN/RST-closed keys and when they closed
    tombstones: HashMap<FlowKey, Duration>,
    pending: PendingMap,
    deferred: Vec<FlowEvent>,
    recent_closed: VecDeque<FlowSummary>,
    stats: TrackerStats,
    clock: Duration,
}

impl FlowTracker {
    pub fn new(interface: InterfaceId, config: TrackerConfig) -> Self {
        Self {
            interface,
            config,
            flows: HashMap::new(),
            tombstones: HashMap::new(),
            pending: PendingMap::new(),
            deferred: Vec::new(),
            recent_closed: VecDeque::with_capacity(RECENT_CLOSED),
            stats: TrackerStats::default(),
            clock: Duration::ZERO,
        }
    }

    pub fn interface(&self) -> &InterfaceId {
        &self.interface
    }

    /// Newest capture timestamp seen
    pub fn clock(&self) -> Duration {
        self.clock
    }

    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    pub fn open_probes(&self) -> usize {
        self.pending.len()
    }

    pub fn flow(&self, key: &FlowKey) -> Option<&Flow> {
        self.flows.get(key)
    }

    /// Most recently closed flows, oldest first
    pub fn recent_closed(&self) -> impl Iterator<Item = &FlowSummary> {
        self.recent_closed.iter()
    }

    /// Live flows with the most bytes
    pub fn top_flows_by_bytes(&self, n: usize) -> Vec<FlowSummary> {
        self.top_flows(n, |f| f.total_bytes())
    }

    /// Live flows with the most retransmissions
    pub fn top_flows_by_retransmissions(&self, n: usize) -> Vec<FlowSummary> {
        self.top_flows(n, |f| f.retransmissions())
    }

    fn top_flows(&self, n: usize, rank: impl Fn(&Flow) -> u64) -> Vec<FlowSummary> {
        let mut flows: Vec<&Flow> = self.flows.values().collect();
        flows.sort_by(|a, b| rank(b).cmp(&rank(a)).then(a.key.cmp(&b.key)));
        flows.into_iter().take(n).map(|f| f.summary(None)).collect()
    }

    /// Feed one record
    pub fn ingest(&mut self, record: &PacketRecord) -> Result<Ingested, IngestError> {
        record.validate()?;
        let (key, direction) = FlowKey::from_record(record);
        let now = record.timestamp;
        self.clock = self.clock.max(now);
        let flags = record.tcp_flags();
        let opening_syn = key.protocol == Protocol::Tcp && flags.syn() && !flags.ack();

        if self.tombstones.contains_key(&key) {
            if opening_syn {
                self.tombstones.remove(&key);
            } else {
                self.stats.late_after_close += 1;
                trace!(interface = %self.interface, flow = %key, "packet after close");
                return Ok(Ingested {
                    key,
                    direction,
                    class: None,
                    event: None,
                    arrival: None,
                });
            }
        }

        let is_new = !self.flows.contains_key(&key);
        if is_new && self.flows.len() >= self.config.max_flows {
            self.evict_oldest();
        }

        let mut event = None;
        let mut close = None;

        let flow = match self.flows.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                let mut flow = Flow::new(key, now);
                if key.protocol == Protocol::Tcp {
                    flow.tcp_state = Some(if opening_syn {
                        TcpState::SynSent
                    } else {
                        TcpState::Unknown
                    });
                }
                self.stats.flows_opened += 1;
                event = Some(FlowEvent::NewFlow { key, at: now });
                v.insert(flow)
            }
        };

        let anomalous = !is_new && now < flow.last_seen;
        if anomalous {
            self.stats.clock_anomalies += 1;
            debug!(
                interface = %self.interface,
                flow = %key,
                behind_us = (flow.last_seen - now).as_micros() as u64,
                "capture timestamp went backwards"
            );
        } else {
            flow.last_seen = now;
        }

        let dir = flow.dir_mut(direction);
        dir.packets += 1;
        dir.bytes += u64::from(record.frame_len);

        if key.protocol != Protocol::Tcp {
            return Ok(Ingested {
                key,
                direction,
                class: None,
                event,
                arrival: (!anomalous).then_some(now),
            });
        }

        let seq = record.seq.unwrap_or_default();
        let seg_len = record.segment_len();
        if let Some(window) = record.window {
            dir.record_window(window);
        }
        if flags.ece() {
            dir.ece += 1;
        }

        let class = dir.seq.classify(seq, seg_len, record.payload_len);
        let expected = dir.seq.expected();
        match class {
            SegmentClass::InOrder | SegmentClass::OutOfOrder if record.payload_len > 0 => {
                dir.remember_segment(seq, seg_len, now);
            }
            _ => {}
        }

        // Forward progress inside the window resolves an earlier retransmission
        let loss_window = likely_loss_window(&self.config, flow.handshake_rtt);
        if let Some(watch) = flow.watches[direction.index()]
            && let (Some(mark), Some(exp)) = (watch.mark, expected)
            && seq_gt(exp, mark)
            && now.saturating_sub(watch.at) <= loss_window
        {
            flow.watches[direction.index()] = None;
        }

        match class {
            SegmentClass::Retransmission => {
                let dir = flow.dir_mut(direction);
                let kind = match dir.first_sent(seq) {
                    Some(first) if now.saturating_sub(first) < FAST_RETRANSMIT_THRESHOLD => {
                        dir.fast_retransmits += 1;
                        RetransmitKind::Fast
                    }
                    _ => {
                        dir.timeout_retransmits += 1;
                        RetransmitKind::Timeout
                    }
                };
                self.stats.retransmissions += 1;
                if flow.watches[direction.index()].is_none() {
                    flow.watches[direction.index()] = Some(RetransmitWatch {
                        at: now,
                        mark: expected,
                    });
                }
                emit(
                    &mut event,
                    &mut self.deferred,
                    FlowEvent::Retransmission {
                        key,
                        direction,
                        at: now,
                        kind,
                    },
                );
            }
            SegmentClass::OutOfOrder => {
                self.stats.out_of_order += 1;
                emit(
                    &mut event,
                    &mut self.deferred,
                    FlowEvent::OutOfOrder {
                        key,
                        direction,
                        at: now,
                    },
                );
            }
            _ => {}
        }

        if !anomalous {
            if opening_syn {
                flow.initiator.get_or_insert(direction);
                if self.pending.open((key, seq.wrapping_add(1)), direction, now) {
                    flow.open_probes += 1;
                }
            } else if flags.syn() && flags.ack() {
                let ack = record.ack.unwrap_or_default();
                if let Some(probe) = self.pending.close(&(key, ack)) {
                    flow.open_probes = flow.open_probes.saturating_sub(1);
                    flow.tcp_state = Some(TcpState::SynReceived);
                    if !probe.retried {
                        let rtt = now.saturating_sub(probe.sent_at);
                        flow.handshake_rtt = Some(rtt);
                        self.stats.rtt_samples += 1;
                        trace!(interface = %self.interface, flow = %key, rtt_us = rtt.as_micros() as u64, "handshake rtt");
                        emit(
                            &mut event,
                            &mut self.deferred,
                            FlowEvent::RttSample { key, rtt, at: now },
                        );
                    }
                }
            } else if flags.ack()
                && flow.tcp_state == Some(TcpState::SynReceived)
                && flow.initiator == Some(direction)
            {
                flow.tcp_state = Some(TcpState::Established);
                flow.handshake_time = Some(now.saturating_sub(flow.created));
            }
        }

        if flags.rst() {
            flow.tcp_state = Some(TcpState::Closed);
            close = Some(CloseReason::Rst);
        } else if flags.fin() && flow.record_fin(direction) {
            close = Some(CloseReason::Fin);
        }

        if let Some(reason) = close
            && let Some(closed) = self.close_flow(&key, reason)
        {
            emit(&mut event, &mut self.deferred, closed);
        }

        Ok(Ingested {
            key,
            direction,
            class: Some(class),
            event,
            arrival: (!anomalous).then_some(now),
        })
    }

    /// Timer-driven work as of capture time `now`: probe timeouts, likely-loss
    /// flags, idle closure, plus anything deferred by earlier calls.
    pub fn sweep(&mut self, now: Duration) -> Vec<FlowEvent> {
        let mut events = std::mem::take(&mut self.deferred);

        for ((key, _), probe) in self.pending.expire(now, self.config.probe_timeout) {
            self.stats.probe_timeouts += 1;
            if let Some(flow) = self.flows.get_mut(&key) {
                flow.open_probes = flow.open_probes.saturating_sub(1);
            }
            debug!(interface = %self.interface, flow = %key, "handshake probe timed out");
            events.push(FlowEvent::ProbeTimeout {
                key,
                at: probe.sent_at + self.config.probe_timeout,
            });
        }

        let mut flagged = Vec::new();
        for flow in self.flows.values_mut() {
            let window = likely_loss_window(&self.config, flow.handshake_rtt);
            for direction in [Direction::Forward, Direction::Reverse] {
                let slot = &mut flow.watches[direction.index()];
                if let Some(watch) = *slot
                    && now.saturating_sub(watch.at) > window
                {
                    *slot = None;
                    flagged.push(FlowEvent::LikelyLoss {
                        key: flow.key,
                        direction,
                        at: watch.at + window,
                    });
                }
            }
        }
        flagged.sort_by_key(|e| *e.key());
        self.stats.likely_losses += flagged.len() as u64;
        events.extend(flagged);

        let mut idle: Vec<FlowKey> = self
            .flows
            .values()
            .filter(|f| now.saturating_sub(f.last_seen) > self.config.idle_timeout)
            .map(|f| f.key)
            .collect();
        idle.sort();
        for key in idle {
            if let Some(closed) = self.close_flow(&key, CloseReason::Idle) {
                events.push(closed);
            }
        }

        self.tombstones
            .retain(|_, closed_at| now.saturating_sub(*closed_at) <= CLOSED_LINGER);

        events
    }

    /// Close every flow, returning their terminal summaries. Handshakes
    /// still unanswered are reported as probe timeouts first.
    pub fn flush(&mut self) -> Vec<FlowEvent> {
        let mut events = std::mem::take(&mut self.deferred);
        for ((key, _), probe) in self.pending.drain() {
            self.stats.probe_timeouts += 1;
            if let Some(flow) = self.flows.get_mut(&key) {
                flow.open_probes = flow.open_probes.saturating_sub(1);
            }
            debug!(interface = %self.interface, flow = %key, "handshake unanswered at shutdown");
            events.push(FlowEvent::ProbeTimeout {
                key,
                at: self.clock.max(probe.sent_at),
            });
        }
        let mut keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        keys.sort();
        for key in keys {
            if let Some(closed) = self.close_flow(&key, CloseReason::Flush) {
                events.push(closed);
            }
        }
        events
    }

    fn close_flow(&mut self, key: &FlowKey, reason: CloseReason) -> Option<FlowEvent> {
        let flow = self.flows.remove(key)?;
        self.pending.discard_flow(key);
        if matches!(reason, CloseReason::Fin | CloseReason::Rst)
            && self.tombstones.len() < self.config.max_flows
        {
            self.tombstones.insert(*key, flow.last_seen);
        }
        self.stats.flows_closed += 1;

        let summary = flow.summary(Some(reason));
        trace!(
            interface = %self.interface,
            flow = %key,
            reason = ?reason,
            retransmissions = summary.retransmissions,
            "flow closed"
        );
        if self.recent_closed.len() >= RECENT_CLOSED {
            self.recent_closed.pop_front();
        }
        self.recent_closed.push_back(summary.clone());
        Some(FlowEvent::Closed(summary))
    }

    /// Drop the oldest-idle tenth of the table
    fn evict_oldest(&mut self) {
        let count = (self.flows.len() / 10).max(1);
        let mut by_age: Vec<(Duration, FlowKey)> =
            self.flows.values().map(|f| (f.last_seen, f.key)).collect();
        by_age.sort();
        for (_, key) in by_age.into_iter().take(count) {
            if let Some(closed) = self.close_flow(&key, CloseReason::Evicted) {
                self.deferred.push(closed);
            }
        }
        self.stats.evicted += count as u64;
        debug!(interface = %self.interface, evicted = count, "flow table full");
    }
}

fn likely_loss_window(config: &TrackerConfig, rtt: Option<Duration>) -> Duration {
    rtt.unwrap_or(config.default_rtt)
        .mul_f64(config.retransmit_rtt_scale)
}

/// Keep the first event of a packet inline, defer the rest to the next sweep
fn emit(slot: &mut Option<FlowEvent>, deferred: &mut Vec<FlowEvent>, event: FlowEvent) {
    if slot.is_none() {
        *slot = Some(event);
    } else {
        deferred.push(event);
    }
}
