use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::IngestError;
use crate::packet::InterfaceId;

/// Transport protocol of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    /// Any other IP protocol, by protocol number
    Other(u8),
}

impl Protocol {
    /// Whether records of this protocol carry ports
    pub fn has_ports(&self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Other(n) => write!(f, "IP/{}", n),
        }
    }
}

/// TCP control bits, as they appear in byte 13 of the TCP header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn syn(self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn ack(self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn fin(self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn rst(self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn ece(self) -> bool {
        self.0 & Self::ECE != 0
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u8, &str); 8] = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::URG, "URG"),
            (TcpFlags::ECE, "ECE"),
            (TcpFlags::CWR, "CWR"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", set.join(","))
        }
    }
}

/// One decoded frame handed over by the capture collaborator.
///
/// `timestamp` is the capture clock: monotonic, nanosecond resolution, with an
/// arbitrary epoch shared by all interfaces of one capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub timestamp: Duration,
    pub interface: InterfaceId,
    pub protocol: Protocol,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    /// TCP sequence number
    pub seq: Option<u32>,
    /// TCP acknowledgment number (meaningful when the ACK flag is set)
    pub ack: Option<u32>,
    pub flags: Option<TcpFlags>,
    /// Advertised TCP receive window
    pub window: Option<u16>,
    pub payload_len: u32,
    pub frame_len: u32,
}

/// Ethernet + IPv4 + TCP header bytes used when a caller does not give a frame length
const TCP_OVERHEAD: u32 = 14 + 20 + 20;
/// Ethernet + IPv4 + UDP header bytes
const UDP_OVERHEAD: u32 = 14 + 20 + 8;

impl PacketRecord {
    /// Build a TCP record. Frame length is derived from the payload.
    #[allow(clippy::too_many_arguments)]
    pub fn tcp(
        interface: InterfaceId,
        timestamp: Duration,
        src: SocketAddr,
        dst: SocketAddr,
        seq: u32,
        ack: u32,
        flags: u8,
        payload_len: u32,
    ) -> Self {
        Self {
            timestamp,
            interface,
            protocol: Protocol::Tcp,
            src: src.ip(),
            dst: dst.ip(),
            src_port: Some(src.port()),
            dst_port: Some(dst.port()),
            seq: Some(seq),
            ack: Some(ack),
            flags: Some(TcpFlags::new(flags)),
            window: None,
            payload_len,
            frame_len: payload_len.saturating_add(TCP_OVERHEAD),
        }
    }

    /// Build a UDP record. Frame length is derived from the payload.
    pub fn udp(
        interface: InterfaceId,
        timestamp: Duration,
        src: SocketAddr,
        dst: SocketAddr,
        payload_len: u32,
    ) -> Self {
        Self {
            timestamp,
            interface,
            protocol: Protocol::Udp,
            src: src.ip(),
            dst: dst.ip(),
            src_port: Some(src.port()),
            dst_port: Some(dst.port()),
            seq: None,
            ack: None,
            flags: None,
            window: None,
            payload_len,
            frame_len: payload_len.saturating_add(UDP_OVERHEAD),
        }
    }

    /// Build a record for an IP protocol without ports, by protocol number
    /// (ICMP is 1). The whole frame counts as overhead.
    pub fn other(
        interface: InterfaceId,
        timestamp: Duration,
        number: u8,
        src: IpAddr,
        dst: IpAddr,
        frame_len: u32,
    ) -> Self {
        Self {
            timestamp,
            interface,
            protocol: Protocol::Other(number),
            src,
            dst,
            src_port: None,
            dst_port: None,
            seq: None,
            ack: None,
            flags: None,
            window: None,
            payload_len: 0,
            frame_len,
        }
    }

    /// Check that every field the declared protocol needs is present
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.payload_len > self.frame_len {
            return Err(IngestError::LengthMismatch {
                payload: self.payload_len,
                frame: self.frame_len,
            });
        }

        let missing = |field| IngestError::MissingField {
            protocol: self.protocol,
            field,
        };

        match self.protocol {
            Protocol::Tcp => {
                self.src_port.ok_or_else(|| missing("src_port"))?;
                self.dst_port.ok_or_else(|| missing("dst_port"))?;
                self.seq.ok_or_else(|| missing("seq"))?;
                let flags = self.flags.ok_or_else(|| missing("flags"))?;
                if flags.ack() && self.ack.is_none() {
                    return Err(missing("ack"));
                }
            }
            Protocol::Udp => {
                self.src_port.ok_or_else(|| missing("src_port"))?;
                self.dst_port.ok_or_else(|| missing("dst_port"))?;
            }
            Protocol::Other(_) => {}
        }

        Ok(())
    }

    /// TCP flags, or empty flags for non-TCP records
    pub fn tcp_flags(&self) -> TcpFlags {
        self.flags.unwrap_or_default()
    }

    /// Sequence space consumed by this segment (payload plus SYN and FIN)
    pub fn segment_len(&self) -> u32 {
        let flags = self.tcp_flags();
        self.payload_len
            .saturating_add(u32::from(flags.syn()))
            .saturating_add(u32::from(flags.fin()))
    }
}
