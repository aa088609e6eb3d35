// src/foundation.rs
//! ICE foundation calculation (RFC 8445 Section 5.1.1.3)

use std::net::{IpAddr, SocketAddr};

use sha2::{Digest, Sha256};

use crate::candidate::{CandidateType, NetworkType};

/// Calculate the foundation for a candidate.
///
/// Candidates with the same type, base address, transport and server share a
/// foundation, which lets the checklist freeze redundant pairs.
pub fn calculate_foundation(
    typ: CandidateType,
    base_ip: &IpAddr,
    network: NetworkType,
    server: Option<&SocketAddr>,
) -> String {
    let mut hasher = Sha256::new();

    hasher.update(typ.to_str().as_bytes());
    hasher.update(b":");
    hasher.update(base_ip.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(network.to_str().as_bytes());

    if let Some(server) = server {
        hasher.update(b":");
        hasher.update(server.to_string().as_bytes());
    }

    let digest = hasher.finalize();

    // First 4 bytes as hex (8 characters)
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_foundation_deterministic() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100));

        let f1 = calculate_foundation(CandidateType::Host, &ip, NetworkType::Udp4, None);
        let f2 = calculate_foundation(CandidateType::Host, &ip, NetworkType::Udp4, None);

        assert_eq!(f1, f2);
        assert_eq!(f1.len(), 8);
    }

    #[test]
    fn test_foundation_differs_by_type() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100));
        let server: SocketAddr = "203.0.113.1:3478".parse().unwrap();

        let host = calculate_foundation(CandidateType::Host, &ip, NetworkType::Udp4, None);
        let srflx = calculate_foundation(
            CandidateType::ServerReflexive,
            &ip,
            NetworkType::Udp4,
            Some(&server),
        );

        assert_ne!(host, srflx);
    }

    #[test]
    fn test_foundation_differs_by_transport() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        let udp = calculate_foundation(CandidateType::Host, &ip, NetworkType::Udp4, None);
        let tcp = calculate_foundation(CandidateType::Host, &ip, NetworkType::Tcp4, None);

        assert_ne!(udp, tcp);
    }
}
