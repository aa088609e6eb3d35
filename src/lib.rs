//! Interactive Connectivity Establishment (ICE) agent core (RFC 8445)
//!
//! This crate implements the peer-side ICE state machine: candidate and
//! pair bookkeeping, role-specific nomination, authenticated connectivity
//! checks, keepalive/consent refresh and the serialized event loop that
//! ties them together. Candidate gathering, mDNS resolution and transport
//! multiplexing are collaborators behind the traits in [`transport`].

pub mod agent;
pub mod buffer;
pub mod candidate;
pub mod clock;
pub mod config;
pub mod error;
pub mod external_ip_mapper;
pub mod foundation;
pub mod notifier;
pub mod pair;
pub mod priority;
mod selector;
pub mod stun;
pub mod transport;

// Re-export main types for convenience
pub use agent::{Agent, ConnectionState, GatheringState};
pub use candidate::{
    Candidate, CandidateAddress, CandidateType, NetworkType, TcpType, COMPONENT_RTCP,
    COMPONENT_RTP,
};
pub use config::{AgentConfig, MulticastDnsMode};
pub use error::{IceError, IceResult, StunError};
pub use external_ip_mapper::ExternalIpMapper;
pub use pair::{CandidatePair, CandidatePairState};
pub use transport::{CandidateConn, MdnsResolver, Net, TcpMux, UdpConn, UdpMux, UniversalUdpMux};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level))
        .add_directive("tokio=warn".parse().unwrap())
        .add_directive("runtime=warn".parse().unwrap());

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(filter)
        .init();
}
