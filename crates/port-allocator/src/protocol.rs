//! Allocation unit value types.

use std::fmt;
use std::str::FromStr;

use crate::error::AllocError;

/// Listener protocol requested by a port binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// Plain TCP listener
    Tcp,
    /// Plain UDP listener
    Udp,
    /// One TCP and one UDP listener on the same port
    TcpUdp,
    /// TCP listener terminating TLS (shares TCP quota)
    TcpSsl,
    /// QUIC listener (shares UDP quota)
    Quic,
}

impl Protocol {
    /// Wire representation used in CRDs and provider calls.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::TcpUdp => "TCPUDP",
            Protocol::TcpSsl => "TCP_SSL",
            Protocol::Quic => "QUIC",
        }
    }

    /// Protocol whose port space this protocol occupies.
    pub fn quota_key(self) -> Protocol {
        match self {
            Protocol::TcpSsl => Protocol::Tcp,
            Protocol::Quic => Protocol::Udp,
            other => other,
        }
    }

    /// Splits paired protocols into the listeners they need.
    pub fn expand(self) -> Vec<Protocol> {
        match self {
            Protocol::TcpUdp => vec![Protocol::Tcp, Protocol::Udp],
            other => vec![other],
        }
    }

    /// Whether listeners of this protocol need a certificate.
    pub fn needs_certificate(self) -> bool {
        matches!(self, Protocol::TcpSsl | Protocol::Quic)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = AllocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "TCPUDP" => Ok(Protocol::TcpUdp),
            "TCP_SSL" => Ok(Protocol::TcpSsl),
            "QUIC" => Ok(Protocol::Quic),
            _ => Err(AllocError::UnknownProtocol(s.to_string())),
        }
    }
}

/// A single port, or a segment of ports, for one protocol.
///
/// `end_port == 0` means a single port. The cache stores the
/// [`key`](ProtocolPort::key) form; allocations hand back the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolPort {
    /// First port
    pub port: u16,
    /// Last port of a segment, 0 for single-port units
    pub end_port: u16,
    /// Requested protocol
    pub protocol: Protocol,
}

impl ProtocolPort {
    /// Single-port unit.
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, end_port: 0, protocol }
    }

    /// Segment unit covering `port..=end_port`.
    pub fn segment(port: u16, end_port: u16, protocol: Protocol) -> Self {
        Self { port, end_port, protocol }
    }

    /// Units needed to serve `protocol` at this port; TCPUDP yields two.
    pub fn expand(port: u16, end_port: u16, protocol: Protocol) -> Vec<ProtocolPort> {
        protocol
            .expand()
            .into_iter()
            .map(|p| ProtocolPort::segment(port, end_port, p))
            .collect()
    }

    /// Canonical key used for quota accounting and collision checks.
    pub fn key(&self) -> ProtocolPort {
        ProtocolPort {
            protocol: self.protocol.quota_key(),
            ..*self
        }
    }

    /// Whether this unit covers a port range.
    pub fn is_segment(&self) -> bool {
        self.end_port > 0
    }
}

impl fmt::Display for ProtocolPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_segment() {
            write!(f, "{}-{}/{}", self.port, self.end_port, self.protocol)
        } else {
            write!(f, "{}/{}", self.port, self.protocol)
        }
    }
}

/// Identifies one load balancer instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LbKey {
    /// Provider load balancer ID
    pub lb_id: String,
    /// Region the load balancer lives in
    pub region: String,
}

impl LbKey {
    /// Creates a key from an LB ID and region.
    pub fn new(lb_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            lb_id: lb_id.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for LbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.lb_id)
    }
}

/// Allocation units in `start..=end`, stepping by `segment_length`.
///
/// Yields `(port, end_port)`; `end_port` is 0 in single-port mode. A segment
/// that would extend past `end` is not yielded.
pub fn port_units(start: u16, end: u16, segment_length: u16) -> impl Iterator<Item = (u16, u16)> {
    let step = u32::from(segment_length.max(1));
    let end = u32::from(end);
    (u32::from(start)..=end)
        .step_by(step as usize)
        .filter(move |p| p + step - 1 <= end)
        .filter_map(move |p| {
            let port = u16::try_from(p).ok()?;
            if step > 1 {
                Some((port, u16::try_from(p + step - 1).ok()?))
            } else {
                Some((port, 0))
            }
        })
}
