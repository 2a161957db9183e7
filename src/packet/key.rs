use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::packet::{PacketRecord, Protocol};

/// Name of a capture interface (e.g. `eth0`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterfaceId(String);

impl InterfaceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InterfaceId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for InterfaceId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One side of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(a) => write!(f, "{}:{}", a, self.port),
            IpAddr::V6(a) => write!(f, "[{}]:{}", a, self.port),
        }
    }
}

/// Which way a packet travels relative to the normalized flow key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// From `FlowKey::lower` to `FlowKey::upper`
    Forward,
    /// From `FlowKey::upper` to `FlowKey::lower`
    Reverse,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Self::Forward => Self::Reverse,
            Self::Reverse => Self::Forward,
        }
    }

    /// Index into per-direction arrays
    pub fn index(self) -> usize {
        match self {
            Self::Forward => 0,
            Self::Reverse => 1,
        }
    }
}

/// Normalized 5-tuple: both directions of a conversation map to the same key.
///
/// The numerically smaller endpoint is always stored in `lower`; the direction
/// of an individual packet is reported separately by [`FlowKey::from_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub lower: Endpoint,
    pub upper: Endpoint,
}

impl FlowKey {
    /// Normalize a pair of endpoints into a key and the direction `src -> dst` takes
    pub fn normalize(protocol: Protocol, src: Endpoint, dst: Endpoint) -> (Self, Direction) {
        if src <= dst {
            (
                Self {
                    protocol,
                    lower: src,
                    upper: dst,
                },
                Direction::Forward,
            )
        } else {
            (
                Self {
                    protocol,
                    lower: dst,
                    upper: src,
                },
                Direction::Reverse,
            )
        }
    }

    /// Key and direction for a record.
    ///
    /// Protocols without ports (ICMP and the like) key on the address pair
    /// alone, with both ports set to 0.
    pub fn from_record(record: &PacketRecord) -> (Self, Direction) {
        let port = |port: Option<u16>| {
            if record.protocol.has_ports() {
                port.unwrap_or(0)
            } else {
                0
            }
        };
        let src = Endpoint {
            addr: record.src,
            port: port(record.src_port),
        };
        let dst = Endpoint {
            addr: record.dst,
            port: port(record.dst_port),
        };
        Self::normalize(record.protocol, src, dst)
    }

    /// Sender endpoint for a given direction
    pub fn source(&self, direction: Direction) -> Endpoint {
        match direction {
            Direction::Forward => self.lower,
            Direction::Reverse => self.upper,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {} ({})", self.lower, self.upper, self.protocol)
    }
}
