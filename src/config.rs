// src/config.rs
//! Agent configuration (RFC 8445 timers, policies and collaborator hooks)

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::candidate::{Candidate, CandidateType, NetworkType};
use crate::error::{IceError, IceResult};
use crate::pair::CandidatePair;
use crate::stun::Message;
use crate::transport::{MdnsResolver, Net, TcpMux, UdpMux, UniversalUdpMux};

/// How often connectivity checks run while connecting
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Consent refresh cadence once connected (RFC 7675); 0 disables
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// Silence on the selected pair before the agent reports Disconnected
pub const DEFAULT_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(5);

/// Additional silence before the agent reports Failed
pub const DEFAULT_FAILED_TIMEOUT: Duration = Duration::from_secs(25);

/// Binding requests per pair before it is marked Failed (RFC 8445 Rc)
pub const DEFAULT_MAX_BINDING_REQUESTS: u16 = 7;

/// Outstanding binding requests older than this are expired
pub const DEFAULT_MAX_BINDING_REQUEST_TIMEOUT: Duration = Duration::from_secs(4);

/// Minimum delay before candidates are considered for nomination, by type
pub const DEFAULT_HOST_ACCEPTANCE_MIN_WAIT: Duration = Duration::ZERO;
pub const DEFAULT_SRFLX_ACCEPTANCE_MIN_WAIT: Duration = Duration::from_millis(500);
pub const DEFAULT_PRFLX_ACCEPTANCE_MIN_WAIT: Duration = Duration::from_secs(1);
pub const DEFAULT_RELAY_ACCEPTANCE_MIN_WAIT: Duration = Duration::from_secs(2);

/// Minimum credential entropy (RFC 8445 Section 5.3), counted at 8 bits per
/// character
pub const MIN_UFRAG_BITS: usize = 24;
pub const MIN_PWD_BITS: usize = 128;

const UFRAG_LEN: usize = 16;
const PWD_LEN: usize = 32;

const CREDENTIAL_CHARS: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789+/";

/// Generate a random ufrag with comfortable entropy headroom
pub fn generate_ufrag() -> String {
    random_credential_string(UFRAG_LEN)
}

/// Generate a random password with comfortable entropy headroom
pub fn generate_pwd() -> String {
    random_credential_string(PWD_LEN)
}

fn random_credential_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CREDENTIAL_CHARS[rng.gen_range(0..CREDENTIAL_CHARS.len())] as char)
        .collect()
}

/// Validate an mDNS hostname: exactly two dot-separated labels, the second
/// being `local`
pub fn validate_mdns_hostname(name: &str) -> IceResult<()> {
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() != 2 || labels[1] != "local" || labels[0].is_empty() {
        return Err(IceError::config(format!(
            "invalid mDNS hostname: {:?}",
            name
        )));
    }
    Ok(())
}

/// Multicast DNS behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MulticastDnsMode {
    /// Neither query nor gather mDNS candidates
    Disabled,
    /// Resolve remote `.local` candidates only
    #[default]
    QueryOnly,
    /// Resolve remote candidates and advertise local ones via mDNS
    QueryAndGather,
}

/// User hook observing inbound binding requests. Returning `true` swallows
/// the request: the default selector handling is skipped.
pub type BindingRequestHandler = Arc<
    dyn Fn(&Message, &Arc<Candidate>, &Arc<Candidate>, Option<&CandidatePair>) -> bool
        + Send
        + Sync,
>;

/// Interface name filter used during gathering and active-TCP synthesis
pub type InterfaceFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// IP filter used during gathering and active-TCP synthesis
pub type IpFilter = Arc<dyn Fn(IpAddr) -> bool + Send + Sync>;

/// ICE agent configuration
#[derive(Clone, Default)]
pub struct AgentConfig {
    /// Force the lite selector; only host candidates are permitted
    pub lite: bool,

    /// Network types the agent may use; empty means UDP4 + UDP6
    pub network_types: Vec<NetworkType>,

    /// Candidate types the agent may use; empty means host + srflx + relay
    pub candidate_types: Vec<CandidateType>,

    /// STUN/TURN server URLs handed to the gatherer
    pub urls: Vec<String>,

    /// Bind range for gathered host candidates (0 = unrestricted)
    pub port_min: u16,
    pub port_max: u16,

    /// Initial local credentials; generated when empty
    pub local_ufrag: String,
    pub local_pwd: String,

    /// mDNS behavior and advertised hostname
    pub multicast_dns_mode: MulticastDnsMode,
    pub multicast_dns_host_name: Option<String>,

    /// Timer overrides; `None` keeps the default, `Some(ZERO)` disables
    /// the timer where zero is meaningful (keepalive, timeouts)
    pub check_interval: Option<Duration>,
    pub keepalive_interval: Option<Duration>,
    pub disconnected_timeout: Option<Duration>,
    pub failed_timeout: Option<Duration>,

    pub host_acceptance_min_wait: Option<Duration>,
    pub srflx_acceptance_min_wait: Option<Duration>,
    pub prflx_acceptance_min_wait: Option<Duration>,
    pub relay_acceptance_min_wait: Option<Duration>,

    pub max_binding_requests: Option<u16>,
    pub max_binding_request_timeout: Option<Duration>,

    /// Skip TLS verification when talking to TURN over TLS
    pub insecure_skip_verify: bool,

    /// Gathering filters
    pub interface_filter: Option<InterfaceFilter>,
    pub ip_filter: Option<IpFilter>,
    pub include_loopback: bool,

    /// Suppress synthesis of active-TCP local candidates
    pub disable_active_tcp: bool,

    /// Static 1:1 NAT mapping entries and the candidate type they surface as
    pub nat_1to1_ips: Vec<String>,
    pub nat_1to1_ip_candidate_type: Option<CandidateType>,

    /// Apply the priority gate to USE-CANDIDATE even for lite agents
    pub enable_use_candidate_check_priority: bool,

    /// Observe/override inbound binding request handling
    pub binding_request_handler: Option<BindingRequestHandler>,

    /// Collaborators
    pub mdns_resolver: Option<Arc<dyn MdnsResolver>>,
    pub net: Option<Arc<dyn Net>>,
    pub tcp_mux: Option<Arc<dyn TcpMux>>,
    pub udp_mux: Option<Arc<dyn UdpMux>>,
    pub udp_mux_srflx: Option<Arc<dyn UniversalUdpMux>>,
}

impl AgentConfig {
    /// Validate configuration invariants that do not depend on agent state
    pub(crate) fn validate(&self) -> IceResult<()> {
        if self.port_max < self.port_min {
            return Err(IceError::config(format!(
                "invalid port range: max {} < min {}",
                self.port_max, self.port_min
            )));
        }

        if let Some(name) = &self.multicast_dns_host_name {
            validate_mdns_hostname(name)?;
        }

        let candidate_types = self.effective_candidate_types();
        if self.lite
            && (candidate_types.len() != 1 || candidate_types[0] != CandidateType::Host)
        {
            return Err(IceError::config(
                "lite agents must only use host candidates",
            ));
        }

        if !self.urls.is_empty()
            && !candidate_types.contains(&CandidateType::ServerReflexive)
            && !candidate_types.contains(&CandidateType::Relay)
        {
            return Err(IceError::config(
                "URLs provided but neither srflx nor relay candidates are enabled",
            ));
        }

        Ok(())
    }

    pub(crate) fn effective_network_types(&self) -> Vec<NetworkType> {
        if self.network_types.is_empty() {
            vec![NetworkType::Udp4, NetworkType::Udp6]
        } else {
            self.network_types.clone()
        }
    }

    pub(crate) fn effective_candidate_types(&self) -> Vec<CandidateType> {
        if self.candidate_types.is_empty() {
            vec![
                CandidateType::Host,
                CandidateType::ServerReflexive,
                CandidateType::Relay,
            ]
        } else {
            self.candidate_types.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_credentials_have_entropy() {
        let ufrag = generate_ufrag();
        let pwd = generate_pwd();

        assert!(ufrag.len() * 8 >= MIN_UFRAG_BITS);
        assert!(pwd.len() * 8 >= MIN_PWD_BITS);
        assert_ne!(generate_ufrag(), ufrag);
    }

    #[test]
    fn test_mdns_hostname_validation() {
        assert!(validate_mdns_hostname("x").is_err());
        assert!(validate_mdns_hostname("x.local").is_ok());
        assert!(validate_mdns_hostname("a.b.local").is_err());
        assert!(validate_mdns_hostname(".local").is_err());
    }

    #[test]
    fn test_port_range_validation() {
        let config = AgentConfig {
            port_min: 5000,
            port_max: 4000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            port_min: 4000,
            port_max: 5000,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lite_requires_host_only() {
        let config = AgentConfig {
            lite: true,
            candidate_types: vec![CandidateType::Host, CandidateType::Relay],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            lite: true,
            candidate_types: vec![CandidateType::Host],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_useless_urls_rejected() {
        let config = AgentConfig {
            urls: vec!["stun:stun.example.org:3478".to_string()],
            candidate_types: vec![CandidateType::Host],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_types() {
        let config = AgentConfig::default();
        assert_eq!(
            config.effective_network_types(),
            vec![NetworkType::Udp4, NetworkType::Udp6]
        );
        assert!(config
            .effective_candidate_types()
            .contains(&CandidateType::Host));
    }
}
