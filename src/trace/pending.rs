//! Open handshake RTT probes.
//!
//! The tracker opens an entry when it sees a SYN and closes it when the
//! SYN-ACK acknowledging that SYN arrives. Entries nobody answers are swept
//! out after the probe timeout and reported as a loss signal.

use std::collections::HashMap;
use std::time::Duration;

use crate::packet::{Direction, FlowKey};

/// A SYN that has been seen and is awaiting its SYN-ACK
#[derive(Debug, Clone)]
pub struct PendingProbe {
    pub sent_at: Duration,
    /// Direction the SYN travelled
    pub direction: Direction,
    /// The SYN was seen more than once; its RTT would be ambiguous
    pub retried: bool,
}

/// Key for pending probe lookup: (flow, acknowledgment number that closes it)
///
/// The acknowledgment is the SYN's sequence number plus one, so a flow that
/// reuses its 4-tuple with a fresh ISN never matches a stale probe.
pub type PendingKey = (FlowKey, u32);

/// Map of open probes keyed by (FlowKey, expected ack)
#[derive(Debug, Default)]
pub struct PendingMap {
    probes: HashMap<PendingKey, PendingProbe>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a probe, or mark an already-open one as retried
    pub fn open(&mut self, key: PendingKey, direction: Direction, sent_at: Duration) -> bool {
        match self.probes.get_mut(&key) {
            Some(probe) => {
                probe.retried = true;
                false
            }
            None => {
                self.probes.insert(
                    key,
                    PendingProbe {
                        sent_at,
                        direction,
                        retried: false,
                    },
                );
                true
            }
        }
    }

    /// Close the probe the given ack answers
    pub fn close(&mut self, key: &PendingKey) -> Option<PendingProbe> {
        self.probes.remove(key)
    }

    /// Drop every probe of a flow
    pub fn discard_flow(&mut self, flow: &FlowKey) -> usize {
        let before = self.probes.len();
        self.probes.retain(|(key, _), _| key != flow);
        before - self.probes.len()
    }

    /// Remove probes older than `timeout` as of `now` and return their keys
    pub fn expire(&mut self, now: Duration, timeout: Duration) -> Vec<(PendingKey, PendingProbe)> {
        let mut expired = Vec::new();
        self.probes.retain(|key, probe| {
            if now.saturating_sub(probe.sent_at) > timeout {
                expired.push((*key, probe.clone()));
                false
            } else {
                true
            }
        });
        // HashMap order is arbitrary; keep the output stable
        expired.sort_by_key(|(key, probe)| (probe.sent_at, *key));
        expired
    }

    /// Remove every open probe, oldest first
    pub fn drain(&mut self) -> Vec<(PendingKey, PendingProbe)> {
        let mut open: Vec<_> = self.probes.drain().collect();
        open.sort_by_key(|(key, probe)| (probe.sent_at, *key));
        open
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Endpoint, Protocol};

    fn key(port: u16) -> FlowKey {
        FlowKey::normalize(
            Protocol::Tcp,
            Endpoint {
                addr: "10.0.0.1".parse().unwrap(),
                port,
            },
            Endpoint {
                addr: "10.0.0.2".parse().unwrap(),
                port: 80,
            },
        )
        .0
    }

    #[test]
    fn test_open_close() {
        let mut pending = PendingMap::new();
        assert!(pending.open((key(1), 101), Direction::Forward, Duration::ZERO));
        assert!(pending.close(&(key(1), 100)).is_none());
        let probe = pending.close(&(key(1), 101)).unwrap();
        assert!(!probe.retried);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_reopen_marks_retried() {
        let mut pending = PendingMap::new();
        pending.open((key(1), 101), Direction::Forward, Duration::ZERO);
        assert!(!pending.open((key(1), 101), Direction::Forward, Duration::from_secs(1)));
        let probe = pending.close(&(key(1), 101)).unwrap();
        assert!(probe.retried);
        assert_eq!(probe.sent_at, Duration::ZERO);
    }

    #[test]
    fn test_expire_only_old_probes() {
        let mut pending = PendingMap::new();
        pending.open((key(1), 1), Direction::Forward, Duration::from_secs(0));
        pending.open((key(2), 1), Direction::Forward, Duration::from_secs(2));
        let expired = pending.expire(Duration::from_secs(4), Duration::from_secs(3));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0.0, key(1));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_drain_empties_in_send_order() {
        let mut pending = PendingMap::new();
        pending.open((key(2), 1), Direction::Forward, Duration::from_secs(2));
        pending.open((key(1), 1), Direction::Forward, Duration::from_secs(1));
        let open = pending.drain();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].0.0, key(1));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_discard_flow() {
        let mut pending = PendingMap::new();
        pending.open((key(1), 1), Direction::Forward, Duration::ZERO);
        pending.open((key(1), 9), Direction::Reverse, Duration::ZERO);
        pending.open((key(2), 1), Direction::Forward, Duration::ZERO);
        assert_eq!(pending.discard_flow(&key(1)), 2);
        assert_eq!(pending.len(), 1);
    }
}
