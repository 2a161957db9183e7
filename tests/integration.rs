//! End-to-end tests for ingest→flow tracking→analysis→evaluation
//!
//! Traffic is synthesized as decoded packet records, so no capture device
//! or network access is needed.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use pathlens::analysis::{LossLocalization, Verdict};
use pathlens::{
    BottleneckCause, CaptureMessage, Config, FeedStatus, InterfaceId, Metric, Monitor,
    PacketRecord, Severity, TcpFlags,
};

const ISN: u32 = 1_000;
const SEGMENT: u32 = 100;
/// SYN plus data segments per synthetic flow
const SEGMENTS_PER_FLOW: usize = 100;
const FLOWS: u16 = 10;

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// One TCP connection: handshake with the given RTT, then data every 10 ms.
/// Data slots listed in `retransmit_at` resend the previous segment instead
/// of sending new data.
fn flow_traffic(
    interface: &InterfaceId,
    flow: u16,
    start_ms: u64,
    rtt_ms: u64,
    retransmit_at: &[usize],
) -> Vec<PacketRecord> {
    let client = SocketAddr::new(addr("10.0.0.1:0").ip(), 40_000 + flow);
    let server = addr("10.9.9.9:443");
    let tcp = |at: u64, src, dst, seq, ack, flags, payload| {
        PacketRecord::tcp(interface.clone(), ms(at), src, dst, seq, ack, flags, payload)
    };

    let mut records = vec![
        tcp(start_ms, client, server, ISN, 0, TcpFlags::SYN, 0),
        tcp(
            start_ms + rtt_ms,
            server,
            client,
            5_000,
            ISN + 1,
            TcpFlags::SYN | TcpFlags::ACK,
            0,
        ),
        tcp(start_ms + rtt_ms + 1, client, server, ISN + 1, 5_001, TcpFlags::ACK, 0),
    ];

    let mut next_seq = ISN + 1;
    for slot in 0..SEGMENTS_PER_FLOW - 1 {
        let at = start_ms + rtt_ms + 10 * (slot as u64 + 1);
        let seq = if retransmit_at.contains(&slot) {
            next_seq - SEGMENT
        } else {
            let seq = next_seq;
            next_seq += SEGMENT;
            seq
        };
        records.push(tcp(at, client, server, seq, 5_001, TcpFlags::ACK, SEGMENT));
    }
    records
}

/// `FLOWS` connections on one interface; `retransmits[i]` lists the
/// retransmitted data slots of flow `i`
fn interface_traffic(
    interface: &InterfaceId,
    rtt_ms: u64,
    retransmits: &[&[usize]],
) -> Vec<PacketRecord> {
    let mut records: Vec<PacketRecord> = (0..FLOWS)
        .flat_map(|flow| {
            let retx = retransmits.get(flow as usize).copied().unwrap_or(&[]);
            flow_traffic(interface, flow, u64::from(flow) * 100, rtt_ms, retx)
        })
        .collect();
    records.sort_by_key(|r| r.timestamp);
    records
}

fn ingest_all(monitor: &Monitor, records: Vec<PacketRecord>) {
    for record in records {
        let interface = record.interface.clone();
        monitor.ingest(&interface, record).unwrap();
    }
}

/// Health score computed straight from the weighted formula
fn expected_score(monitor: &Monitor, interface: &InterfaceId) -> f64 {
    let config = monitor.config();
    let t = &config.thresholds;
    let w = &config.health_weights;
    let store = monitor.store();
    let inverted = |metric: Metric, ceiling: f64| {
        let v = store.latest_value(interface, metric).unwrap();
        100.0 * (1.0 - (v / ceiling).min(1.0))
    };
    (w.loss * inverted(Metric::LossPct, t.loss.critical)
        + w.latency * inverted(Metric::LatencyP95, t.latency.critical)
        + w.jitter * inverted(Metric::Jitter, t.jitter.critical))
        / (w.loss + w.latency + w.jitter)
}

#[tokio::test]
async fn test_two_interfaces_end_to_end() {
    let monitor = Monitor::start(Config::default()).unwrap();
    let eth0 = InterfaceId::from("eth0");
    let eth1 = InterfaceId::from("eth1");

    // 3 retransmissions per 100 segments on every eth0 flow
    let lossy: &[usize] = &[20, 50, 80];
    ingest_all(&monitor, interface_traffic(&eth0, 120, &[lossy; FLOWS as usize]));
    // A single retransmission across all of eth1
    ingest_all(&monitor, interface_traffic(&eth1, 20, &[&[40]]));

    let report = monitor.stop().await;
    assert_eq!(report.flushed_flows, 2 * FLOWS as usize);
    assert_eq!(report.stats.accepted, 2 * FLOWS as u64 * 102);
    assert!(report.stats.rejected.is_empty());

    let s0 = monitor.snapshot(&eth0).unwrap();
    let s1 = monitor.snapshot(&eth1).unwrap();
    assert!((s0.loss_pct.unwrap() - 3.0).abs() < 1e-9);
    assert!((s1.loss_pct.unwrap() - 0.1).abs() < 1e-9);
    assert!((s0.latency_p95.unwrap() - 120.0).abs() < 1e-6);
    assert!((s1.latency_p95.unwrap() - 20.0).abs() < 1e-6);
    assert!(s0.jitter.unwrap() < monitor.config().thresholds.jitter.warning);
    assert!(s1.jitter.unwrap() < monitor.config().thresholds.jitter.warning);

    let loss = s0.loss.as_ref().unwrap();
    assert_eq!(loss.segments, 1000);
    assert_eq!(loss.retransmissions, 30);
    assert_eq!(loss.affected_flows, FLOWS as usize);
    assert_eq!(loss.localization, Some(LossLocalization::Path));

    assert_eq!(
        monitor.bottleneck(&eth0).unwrap().cause,
        BottleneckCause::PathCongestion
    );
    assert_eq!(monitor.bottleneck(&eth1).unwrap().cause, BottleneckCause::Healthy);

    let comparison = monitor.compare(&[eth0.clone(), eth1.clone()]);
    assert_eq!(comparison.ranking[0].interface, eth1);
    let pair = comparison.pair(&eth0, &eth1).unwrap();
    assert_eq!(pair.verdict, Verdict::SecondHealthier);
    assert_eq!(pair.healthier(), Some(&eth1));
    let expected = expected_score(&monitor, &eth0) - expected_score(&monitor, &eth1);
    assert!((pair.delta - expected).abs() < 1e-9);
    assert!(pair.delta < -50.0);

    // Same comparison the other way round
    let reversed = monitor.compare(&[eth1.clone(), eth0.clone()]);
    let pair_rev = reversed.pair(&eth1, &eth0).unwrap();
    assert!((pair_rev.delta + pair.delta).abs() < 1e-9);
    assert_eq!(pair_rev.verdict, Verdict::FirstHealthier);
}

#[tokio::test(start_paused = true)]
async fn test_sustained_loss_raises_alert() {
    let monitor = Monitor::start(Config::default()).unwrap();
    let eth0 = InterfaceId::from("eth0");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    monitor.subscribe_alerts(move |record| sink.lock().push(record.clone()));

    let lossy: &[usize] = &[20, 50, 80];
    ingest_all(&monitor, interface_traffic(&eth0, 120, &[lossy; FLOWS as usize]));

    // Several evaluation cycles on the paused clock
    tokio::time::sleep(Duration::from_secs(5)).await;

    let records = seen.lock().clone();
    let loss = records
        .iter()
        .find(|r| r.metric == Metric::LossPct)
        .expect("loss alert");
    assert_eq!(loss.interface, eth0);
    assert_eq!(loss.from, Severity::Normal);
    assert_eq!(loss.to, Severity::Critical);

    let latency = records
        .iter()
        .find(|r| r.metric == Metric::LatencyP95)
        .expect("latency alert");
    assert_eq!(latency.to, Severity::Warning);

    let summary = monitor.alert_summary();
    assert_eq!(summary[&eth0].critical, 1);
    assert_eq!(summary[&eth0].warning, 1);
    assert_eq!(monitor.alert_history().len(), records.len());

    monitor.stop().await;
}

#[tokio::test]
async fn test_feed_end_and_loss_are_distinguished() {
    let monitor = Monitor::start(Config::default()).unwrap();
    let eth0 = InterfaceId::from("eth0");
    let eth1 = InterfaceId::from("eth1");

    let (tx0, rx0) = mpsc::channel(64);
    let mut status0 = monitor.attach(eth0.clone(), rx0);
    for record in flow_traffic(&eth0, 1, 0, 10, &[]).into_iter().take(10) {
        tx0.send(CaptureMessage::Frame(record)).await.unwrap();
    }
    tx0.send(CaptureMessage::Paused).await.unwrap();
    status0
        .wait_for(|s| *s == FeedStatus::Paused)
        .await
        .unwrap();
    tx0.send(CaptureMessage::Ended).await.unwrap();
    let ended = *status0.wait_for(|s| s.is_terminal()).await.unwrap();
    assert_eq!(ended, FeedStatus::Ended);

    let (tx1, rx1) = mpsc::channel(64);
    let mut status1 = monitor.attach(eth1.clone(), rx1);
    for record in flow_traffic(&eth1, 1, 0, 10, &[]).into_iter().take(5) {
        tx1.send(CaptureMessage::Frame(record)).await.unwrap();
    }
    drop(tx1);
    let lost = *status1.wait_for(|s| s.is_terminal()).await.unwrap();
    assert_eq!(lost, FeedStatus::Lost);

    let report = monitor.stop().await;
    assert_eq!(report.stats.accepted, 15);
    assert_eq!(report.flushed_flows, 2);
}

#[tokio::test]
async fn test_stop_marks_open_feeds_stopped() {
    let monitor = Monitor::start(Config::default()).unwrap();
    let (_tx, rx) = mpsc::channel::<CaptureMessage>(8);
    let status = monitor.attach(InterfaceId::from("eth0"), rx);
    monitor.stop().await;
    assert_eq!(*status.borrow(), FeedStatus::Stopped);

    let (_tx, rx) = mpsc::channel::<CaptureMessage>(8);
    let late = monitor.attach(InterfaceId::from("eth0"), rx);
    assert_eq!(*late.borrow(), FeedStatus::Stopped);
}

#[tokio::test]
async fn test_stop_flushes_flow_summaries() {
    let monitor = Monitor::start(Config::default()).unwrap();
    let eth0 = InterfaceId::from("eth0");
    ingest_all(&monitor, interface_traffic(&eth0, 30, &[&[10]]));

    let report = monitor.stop().await;
    assert_eq!(report.flushed_flows, FLOWS as usize);
    assert_eq!(report.stats.active_flows, 0);

    let flows = monitor.flows(&eth0).unwrap();
    assert_eq!(flows.active, 0);
    assert_eq!(flows.recent_closed.len(), FLOWS as usize);
    assert_eq!(flows.stats.rtt_samples, FLOWS as u64);
    assert_eq!(flows.stats.retransmissions, 1);
    let retransmitted: Vec<_> = flows
        .recent_closed
        .iter()
        .filter(|s| s.retransmissions > 0)
        .collect();
    assert_eq!(retransmitted.len(), 1);
    assert_eq!(retransmitted[0].fast_retransmits, 1);
}

#[tokio::test]
async fn test_clock_anomaly_is_counted_not_fatal() {
    let monitor = Monitor::start(Config::default()).unwrap();
    let eth0 = InterfaceId::from("eth0");
    let client = addr("10.0.0.1:40000");
    let server = addr("10.9.9.9:443");
    let at = |t: u64, seq: u32| {
        PacketRecord::tcp(eth0.clone(), ms(t), client, server, seq, 1, TcpFlags::ACK, SEGMENT)
    };

    monitor.ingest(&eth0, at(100, 1)).unwrap();
    monitor.ingest(&eth0, at(50, 101)).unwrap();
    monitor.ingest(&eth0, at(150, 201)).unwrap();

    let report = monitor.stop().await;
    assert_eq!(report.stats.clock_anomalies, 1);
    assert_eq!(report.stats.accepted, 3);
    assert_eq!(monitor.flows(&eth0).unwrap().recent_closed[0].retransmissions, 0);
}

#[tokio::test]
async fn test_malformed_records_do_not_halt_pipeline() {
    let monitor = Monitor::start(Config::default()).unwrap();
    let eth0 = InterfaceId::from("eth0");
    let mut records = interface_traffic(&eth0, 20, &[]);
    records[5].seq = None;
    records[9].payload_len = records[9].frame_len + 1;

    let mut rejected = 0;
    for record in records {
        if monitor.ingest(&eth0, record).is_err() {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 2);

    let report = monitor.stop().await;
    assert_eq!(report.stats.rejected.get("missing_field"), Some(&1));
    assert_eq!(report.stats.rejected.get("length_mismatch"), Some(&1));
    assert!(monitor.snapshot(&eth0).is_some());
}

fn lone_syn(interface: &InterfaceId, port: u16) -> PacketRecord {
    PacketRecord::tcp(
        interface.clone(),
        ms(0),
        SocketAddr::new(addr("10.0.0.1:0").ip(), port),
        addr("10.9.9.9:443"),
        ISN,
        0,
        TcpFlags::SYN,
        0,
    )
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_handshake_times_out_without_traffic() {
    let monitor = Monitor::start(Config::default()).unwrap();
    let eth0 = InterfaceId::from("eth0");
    monitor.ingest(&eth0, lone_syn(&eth0, 40_000)).unwrap();

    // Nothing else arrives; the probe timeout is 3 s
    tokio::time::sleep(Duration::from_secs(5)).await;

    let flows = monitor.flows(&eth0).unwrap();
    assert_eq!(flows.open_probes, 0);
    assert_eq!(flows.stats.probe_timeouts, 1);
    let loss = monitor.snapshot(&eth0).unwrap().loss.unwrap();
    assert_eq!(loss.probe_timeouts, 1);
    assert_eq!(loss.localization, Some(LossLocalization::Path));

    monitor.stop().await;
    let loss = monitor.snapshot(&eth0).unwrap().loss.unwrap();
    assert_eq!(loss.probe_timeouts, 1);
}

#[tokio::test]
async fn test_stop_reports_unanswered_handshakes() {
    let monitor = Monitor::start(Config::default()).unwrap();
    let eth0 = InterfaceId::from("eth0");
    monitor.ingest(&eth0, lone_syn(&eth0, 40_000)).unwrap();
    monitor.ingest(&eth0, lone_syn(&eth0, 40_001)).unwrap();

    let report = monitor.stop().await;
    assert_eq!(report.flushed_flows, 2);

    let loss = monitor.snapshot(&eth0).unwrap().loss.unwrap();
    assert_eq!(loss.segments, 2);
    assert_eq!(loss.probe_timeouts, 2);
    assert!((loss.loss_pct - 100.0).abs() < 1e-9);
    assert_eq!(monitor.flows(&eth0).unwrap().stats.probe_timeouts, 2);
}
