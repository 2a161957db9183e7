use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analysis::InterfaceCounters;
use crate::packet::{Direction, FlowKey, InterfaceId, PacketRecord, Protocol};
use crate::pipeline::Counters;
use crate::pipeline::queue::{DropOldestQueue, Pushed};
use crate::trace::{FlowEvent, FlowTracker};

/// Records handled per wake-up before sweeping and yielding
const MAX_DRAIN_BATCH: usize = 1024;
/// Sweep cadence while the interface is quiet
const SWEEP_PERIOD: Duration = Duration::from_millis(250);

/// Flow tracker output handed to the analyzers
#[derive(Debug, Clone, PartialEq)]
pub enum Work {
    Packet {
        key: FlowKey,
        direction: Direction,
        at: Duration,
        frame_len: u32,
        /// Data-bearing TCP segment or opening SYN
        sent_segment: bool,
        /// Absent when the capture clock went backwards
        arrival: Option<Duration>,
    },
    Event(FlowEvent),
    Counters {
        at: Duration,
        counters: InterfaceCounters,
    },
}

/// Capture time the lane sweeps at.
///
/// Follows the newest capture timestamp while records arrive and runs on by
/// wall time once the interface goes quiet, so probe and idle timers still
/// fire without traffic.
#[derive(Debug)]
struct SweepClock {
    capture: Duration,
    seen_at: Instant,
}

impl SweepClock {
    fn new() -> Self {
        Self {
            capture: Duration::ZERO,
            seen_at: Instant::now(),
        }
    }

    /// A batch was just tracked; `capture` is the tracker clock after it
    fn observe(&mut self, capture: Duration) {
        self.capture = self.capture.max(capture);
        self.seen_at = Instant::now();
    }

    fn now(&self) -> Duration {
        self.capture + self.seen_at.elapsed()
    }
}

/// Everything one interface's ingest worker shares with the monitor
#[derive(Debug, Clone)]
pub(crate) struct Lane {
    pub interface: InterfaceId,
    pub records: Arc<DropOldestQueue<PacketRecord>>,
    pub work: Arc<DropOldestQueue<Work>>,
    pub tracker: Arc<Mutex<FlowTracker>>,
}

impl Lane {
    /// Hand work to the analyzers, counting overflow
    pub fn forward(&self, work: Vec<Work>, counters: &Counters) {
        for item in work {
            if let Pushed::DroppedOldest { burst_start } = self.work.push(item) {
                counters.dropped_analysis();
                if burst_start {
                    warn!(
                        interface = %self.interface,
                        capacity = self.work.capacity(),
                        "analysis queue full, dropping oldest work"
                    );
                }
            }
        }
    }
}

/// Ingest worker for one interface.
///
/// Sole mutator of the interface's flow table. Returns the number of flows
/// flushed on shutdown.
pub(crate) async fn run_lane(
    lane: Lane,
    counters: Arc<Counters>,
    work_ready: Arc<Notify>,
    cancel: CancellationToken,
) -> Result<usize> {
    info!(interface = %lane.interface, "ingest lane started");
    let mut sweep = tokio::time::interval(SWEEP_PERIOD);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut clock = SweepClock::new();

    loop {
        if lane.records.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = lane.records.wait() => {}
                _ = sweep.tick() => {}
            }
        } else if cancel.is_cancelled() {
            break;
        }

        let batch = lane.records.drain(MAX_DRAIN_BATCH);
        let mut work = process_batch(&lane, &batch, &counters);
        if !batch.is_empty() {
            clock.observe(lane.tracker.lock().clock());
        }
        work.extend(sweep_flows(&lane, clock.now()));
        if !work.is_empty() {
            lane.forward(work, &counters);
            work_ready.notify_one();
        }
        tokio::task::yield_now().await;
    }

    // Whatever was queued before the stop still gets tracked
    loop {
        let batch = lane.records.drain(MAX_DRAIN_BATCH);
        if batch.is_empty() {
            break;
        }
        let work = process_batch(&lane, &batch, &counters);
        lane.forward(work, &counters);
        clock.observe(lane.tracker.lock().clock());
    }

    let flushed = {
        let mut tracker = lane.tracker.lock();
        let now = clock.now().max(tracker.clock());
        let mut events = tracker.sweep(now);
        let closing = tracker.flush();
        let flushed = closing
            .iter()
            .filter(|e| matches!(e, FlowEvent::Closed(_)))
            .count();
        events.extend(closing);
        lane.forward(events.into_iter().map(Work::Event).collect(), &counters);
        flushed
    };
    work_ready.notify_one();

    info!(interface = %lane.interface, flushed, "ingest lane stopped");
    Ok(flushed)
}

fn process_batch(lane: &Lane, batch: &[PacketRecord], counters: &Counters) -> Vec<Work> {
    let mut work = Vec::with_capacity(batch.len() * 2);
    let mut tracker = lane.tracker.lock();

    for record in batch {
        let ingested = match tracker.ingest(record) {
            Ok(ingested) => ingested,
            Err(e) => {
                counters.reject(&e);
                debug!(interface = %lane.interface, error = %e, "record rejected by flow tracker");
                continue;
            }
        };

        let flags = record.tcp_flags();
        let sent_segment = record.protocol == Protocol::Tcp
            && (record.payload_len > 0 || (flags.syn() && !flags.ack()));
        work.push(Work::Packet {
            key: ingested.key,
            direction: ingested.direction,
            at: record.timestamp,
            frame_len: record.frame_len,
            sent_segment,
            arrival: ingested.arrival,
        });
        if let Some(event) = ingested.event {
            work.push(Work::Event(event));
        }
    }
    work
}

fn sweep_flows(lane: &Lane, now: Duration) -> Vec<Work> {
    let mut tracker = lane.tracker.lock();
    let now = now.max(tracker.clock());
    tracker.sweep(now).into_iter().map(Work::Event).collect()
}
