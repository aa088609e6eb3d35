// src/candidate.rs
//! ICE candidate representation (RFC 8445 Section 5.1)
//!
//! A candidate is one addressable transport endpoint. Local candidates own
//! their bound socket through a [`CandidateConn`] handle; closing the
//! candidate releases the handle exactly once. Candidates are shared as
//! `Arc<Candidate>` between the checklist, the candidate maps and the
//! published selected pair, so the mutable parts (address after mDNS
//! resolution, the conn slot, activity timestamps) use interior mutability.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::clock::AtomicInstant;
use crate::error::{IceError, IceResult};
use crate::foundation;
use crate::priority;
use crate::transport::CandidateConn;

/// Component ID for RTP
pub const COMPONENT_RTP: u16 = 1;

/// Component ID for RTCP
pub const COMPONENT_RTCP: u16 = 2;

/// ICE candidate type (RFC 8445 Section 5.1.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CandidateType {
    /// Host candidate (local interface address)
    Host,
    /// Server reflexive (observed by a STUN server)
    ServerReflexive,
    /// Peer reflexive (learned from a peer's binding request)
    PeerReflexive,
    /// Relayed candidate (TURN allocation)
    Relay,
}

impl CandidateType {
    /// String representation used in SDP
    pub fn to_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }

    /// Type preference value (RFC 8445 Section 5.1.2.2)
    pub fn preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay => 0,
        }
    }

    /// Whether this type carries a related address
    pub fn has_related_address(self) -> bool {
        matches!(self, Self::ServerReflexive | Self::PeerReflexive | Self::Relay)
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

/// Network type of a candidate: transport protocol plus IP family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Udp4,
    Udp6,
    Tcp4,
    Tcp6,
}

impl NetworkType {
    /// All supported network types
    pub fn all() -> [NetworkType; 4] {
        [Self::Udp4, Self::Udp6, Self::Tcp4, Self::Tcp6]
    }

    /// Derive the network type from a transport flag and an address
    pub fn from_ip(tcp: bool, ip: &IpAddr) -> Self {
        match (tcp, ip.is_ipv4()) {
            (false, true) => Self::Udp4,
            (false, false) => Self::Udp6,
            (true, true) => Self::Tcp4,
            (true, false) => Self::Tcp6,
        }
    }

    pub fn to_str(self) -> &'static str {
        match self {
            Self::Udp4 => "udp4",
            Self::Udp6 => "udp6",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
        }
    }

    pub fn is_udp(self) -> bool {
        matches!(self, Self::Udp4 | Self::Udp6)
    }

    pub fn is_tcp(self) -> bool {
        matches!(self, Self::Tcp4 | Self::Tcp6)
    }

    pub fn is_ipv4(self) -> bool {
        matches!(self, Self::Udp4 | Self::Tcp4)
    }

    pub fn is_ipv6(self) -> bool {
        !self.is_ipv4()
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

/// TCP candidate type (RFC 6544)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpType {
    /// Initiates outbound TCP connections
    Active,
    /// Accepts inbound TCP connections
    Passive,
    /// Simultaneous-open
    SimultaneousOpen,
}

impl TcpType {
    pub fn to_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Passive => "passive",
            Self::SimultaneousOpen => "so",
        }
    }
}

impl fmt::Display for TcpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

/// Candidate address: a resolved IP endpoint, or an mDNS name awaiting
/// resolution (RFC 8445 Section 5.1.1.4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateAddress {
    Ip(SocketAddr),
    MDns { hostname: String, port: u16 },
}

impl CandidateAddress {
    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::MDns { port, .. } => *port,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Ip(addr) => Some(addr.ip()),
            Self::MDns { .. } => None,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Ip(addr) => Some(*addr),
            Self::MDns { .. } => None,
        }
    }

    pub fn is_mdns(&self) -> bool {
        matches!(self, Self::MDns { .. })
    }

    pub fn mdns_hostname(&self) -> Option<&str> {
        match self {
            Self::Ip(_) => None,
            Self::MDns { hostname, .. } => Some(hostname),
        }
    }
}

impl fmt::Display for CandidateAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{}", addr),
            Self::MDns { hostname, port } => write!(f, "{}:{}", hostname, port),
        }
    }
}

/// Default local preference for candidate priority. TCP candidates rank
/// below UDP ones per RFC 6544, with simultaneous-open ahead of active and
/// passive.
fn default_local_preference(network: NetworkType, tcp_type: Option<TcpType>) -> u32 {
    if !network.is_tcp() {
        return 65535;
    }

    match tcp_type {
        Some(TcpType::SimultaneousOpen) => 1 << 13,
        Some(TcpType::Active) => (1 << 13) - 1,
        _ => (1 << 13) - 2,
    }
}

/// One addressable ICE endpoint
pub struct Candidate {
    candidate_type: CandidateType,
    network_type: NetworkType,
    component: u16,
    foundation: String,
    priority: u32,
    address: RwLock<CandidateAddress>,
    related_address: Option<SocketAddr>,
    tcp_type: Option<TcpType>,

    conn: RwLock<Option<Arc<dyn CandidateConn>>>,
    closed: AtomicBool,

    last_sent: AtomicInstant,
    last_received: AtomicInstant,
}

impl Candidate {
    /// Create a host candidate
    pub fn new_host(
        addr: SocketAddr,
        network: NetworkType,
        component: u16,
        tcp_type: Option<TcpType>,
    ) -> Self {
        let foundation =
            foundation::calculate_foundation(CandidateType::Host, &addr.ip(), network, None);
        Self::build(
            CandidateType::Host,
            network,
            component,
            foundation,
            CandidateAddress::Ip(addr),
            None,
            tcp_type,
        )
    }

    /// Create a host candidate that carries an unresolved mDNS name
    pub fn new_mdns_host(hostname: String, port: u16, network: NetworkType, component: u16) -> Self {
        let foundation = format!("mdns_{}", hostname.replace('.', "_"));
        Self::build(
            CandidateType::Host,
            network,
            component,
            foundation,
            CandidateAddress::MDns { hostname, port },
            None,
            None,
        )
    }

    /// Create a server reflexive candidate
    pub fn new_server_reflexive(
        addr: SocketAddr,
        base: SocketAddr,
        network: NetworkType,
        component: u16,
        stun_server: SocketAddr,
    ) -> Self {
        let foundation = foundation::calculate_foundation(
            CandidateType::ServerReflexive,
            &base.ip(),
            network,
            Some(&stun_server),
        );
        Self::build(
            CandidateType::ServerReflexive,
            network,
            component,
            foundation,
            CandidateAddress::Ip(addr),
            Some(base),
            None,
        )
    }

    /// Create a peer reflexive candidate from an observed source address
    pub fn new_peer_reflexive(
        addr: SocketAddr,
        network: NetworkType,
        component: u16,
        related: Option<SocketAddr>,
    ) -> Self {
        let foundation = foundation::calculate_foundation(
            CandidateType::PeerReflexive,
            &addr.ip(),
            network,
            None,
        );
        Self::build(
            CandidateType::PeerReflexive,
            network,
            component,
            foundation,
            CandidateAddress::Ip(addr),
            related,
            None,
        )
    }

    /// Create a relay candidate
    pub fn new_relay(
        addr: SocketAddr,
        base: SocketAddr,
        network: NetworkType,
        component: u16,
        turn_server: SocketAddr,
    ) -> Self {
        let foundation = foundation::calculate_foundation(
            CandidateType::Relay,
            &base.ip(),
            network,
            Some(&turn_server),
        );
        Self::build(
            CandidateType::Relay,
            network,
            component,
            foundation,
            CandidateAddress::Ip(addr),
            Some(base),
            None,
        )
    }

    fn build(
        candidate_type: CandidateType,
        network: NetworkType,
        component: u16,
        foundation: String,
        address: CandidateAddress,
        related_address: Option<SocketAddr>,
        tcp_type: Option<TcpType>,
    ) -> Self {
        let priority = priority::calculate_priority(
            candidate_type,
            default_local_preference(network, tcp_type),
            component,
        );

        Self {
            candidate_type,
            network_type: network,
            component,
            foundation,
            priority,
            address: RwLock::new(address),
            related_address,
            tcp_type,
            conn: RwLock::new(None),
            closed: AtomicBool::new(false),
            last_sent: AtomicInstant::now(),
            last_received: AtomicInstant::now(),
        }
    }

    /// Override the computed priority (remote candidates carry the priority
    /// the peer signaled)
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the computed foundation (remote candidates carry the
    /// foundation the peer signaled)
    pub fn with_foundation(mut self, foundation: String) -> Self {
        self.foundation = foundation;
        self
    }

    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    pub fn component(&self) -> u16 {
        self.component
    }

    pub fn foundation(&self) -> String {
        self.foundation.clone()
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Current address value
    pub fn address(&self) -> CandidateAddress {
        self.address.read().clone()
    }

    /// Resolved socket address, if any
    pub fn addr(&self) -> Option<SocketAddr> {
        self.address.read().socket_addr()
    }

    pub fn port(&self) -> u16 {
        self.address.read().port()
    }

    pub fn related_address(&self) -> Option<SocketAddr> {
        self.related_address
    }

    pub fn tcp_type(&self) -> Option<TcpType> {
        self.tcp_type
    }

    /// Replace an mDNS hostname with its resolved IP
    pub fn set_resolved_ip(&self, ip: IpAddr) -> IceResult<()> {
        let mut address = self.address.write();
        match &*address {
            CandidateAddress::MDns { port, .. } => {
                *address = CandidateAddress::Ip(SocketAddr::new(ip, *port));
                Ok(())
            }
            CandidateAddress::Ip(addr) => Err(IceError::address(format!(
                "candidate {} is already resolved",
                addr
            ))),
        }
    }

    /// Wire the candidate to its transport handle
    pub fn set_conn(&self, conn: Arc<dyn CandidateConn>) {
        *self.conn.write() = Some(conn);
    }

    pub fn conn(&self) -> Option<Arc<dyn CandidateConn>> {
        self.conn.read().clone()
    }

    /// Write a frame to the candidate's transport, stamping last-sent
    pub fn write_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        let conn = self
            .conn
            .read()
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "candidate has no conn"))?;

        let n = conn.send_to(data, target)?;
        self.last_sent.set_now();
        Ok(n)
    }

    /// Record inbound or outbound activity
    pub fn seen(&self, outbound: bool) {
        if outbound {
            self.last_sent.set_now();
        } else {
            self.last_received.set_now();
        }
    }

    pub fn last_sent(&self) -> std::time::Instant {
        self.last_sent.get()
    }

    pub fn last_received(&self) -> std::time::Instant {
        self.last_received.get()
    }

    /// Close the candidate, releasing the transport handle exactly once
    pub fn close(&self) -> IceResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(conn) = self.conn.write().take() {
            if let Err(err) = conn.close() {
                warn!("Failed to close conn for candidate {}: {}", self, err);
            }
        }
        Ok(())
    }

    /// Candidates are equal when foundation, address, port and component all
    /// match
    pub fn equal(&self, other: &Candidate) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        self.foundation == other.foundation
            && self.component == other.component
            && *self.address.read() == *other.address.read()
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("type", &self.candidate_type)
            .field("network", &self.network_type)
            .field("address", &*self.address.read())
            .field("component", &self.component)
            .field("priority", &self.priority)
            .finish()
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.candidate_type.to_str(),
            self.foundation,
            self.network_type,
            self.address.read(),
            self.priority,
        )
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl Eq for Candidate {}
