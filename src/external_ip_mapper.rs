// src/external_ip_mapper.rs
//! Static 1:1 NAT (D-NAT) address mapping.
//!
//! Deployments behind a 1:1 NAT know their public addresses ahead of time,
//! so instead of querying a STUN server the agent can remap gathered host
//! addresses through a fixed table. Each configuration entry is either
//! `"ExtIP"` (the sole external IP for that address family) or
//! `"ExtIP/LocIP"` (an explicit local-to-external mapping).

use std::collections::HashMap;
use std::net::IpAddr;

use crate::candidate::CandidateType;
use crate::error::{IceError, IceResult};

fn parse_ip(s: &str) -> IceResult<IpAddr> {
    s.parse::<IpAddr>()
        .map_err(|_| IceError::config(format!("invalid NAT 1:1 IP mapping: {:?}", s)))
}

/// Mapping for a single address family
#[derive(Debug, Default)]
struct IpMapping {
    /// When set, the sole external IP assumed for every local IP
    ip_sole: Option<IpAddr>,
    /// Local-to-external table
    ip_map: HashMap<IpAddr, IpAddr>,
}

impl IpMapping {
    fn set_sole_ip(&mut self, ip: IpAddr) -> IceResult<()> {
        if self.ip_sole.is_some() || !self.ip_map.is_empty() {
            return Err(IceError::config(
                "invalid NAT 1:1 IP mapping: cannot mix sole and explicit forms",
            ));
        }
        self.ip_sole = Some(ip);
        Ok(())
    }

    fn add_ip_mapping(&mut self, local: IpAddr, external: IpAddr) -> IceResult<()> {
        if self.ip_sole.is_some() {
            return Err(IceError::config(
                "invalid NAT 1:1 IP mapping: cannot mix sole and explicit forms",
            ));
        }
        if self.ip_map.contains_key(&local) {
            return Err(IceError::config(format!(
                "invalid NAT 1:1 IP mapping: duplicate local IP {}",
                local
            )));
        }
        self.ip_map.insert(local, external);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.ip_sole.is_some() || !self.ip_map.is_empty()
    }

    fn find_external_ip(&self, local: IpAddr) -> IceResult<IpAddr> {
        if !self.is_valid() {
            return Ok(local);
        }

        if let Some(sole) = self.ip_sole {
            return Ok(sole);
        }

        self.ip_map.get(&local).copied().ok_or_else(|| {
            IceError::address(format!("no external mapping found for local IP {}", local))
        })
    }
}

/// 1:1 NAT remap table for both address families
#[derive(Debug)]
pub struct ExternalIpMapper {
    ipv4: IpMapping,
    ipv6: IpMapping,
    candidate_type: CandidateType,
}

impl ExternalIpMapper {
    /// Build a mapper from configuration strings. Returns `Ok(None)` when no
    /// entries are configured.
    pub fn new(candidate_type: Option<CandidateType>, ips: &[String]) -> IceResult<Option<Self>> {
        if ips.is_empty() {
            return Ok(None);
        }

        let candidate_type = candidate_type.unwrap_or(CandidateType::Host);
        if !matches!(
            candidate_type,
            CandidateType::Host | CandidateType::ServerReflexive
        ) {
            return Err(IceError::config(format!(
                "unsupported NAT 1:1 candidate type: {}",
                candidate_type
            )));
        }

        let mut mapper = Self {
            ipv4: IpMapping::default(),
            ipv6: IpMapping::default(),
            candidate_type,
        };

        for entry in ips {
            let mut parts = entry.splitn(2, '/');
            let ext = parse_ip(parts.next().unwrap_or_default())?;

            match parts.next() {
                None => {
                    if ext.is_ipv4() {
                        mapper.ipv4.set_sole_ip(ext)?;
                    } else {
                        mapper.ipv6.set_sole_ip(ext)?;
                    }
                }
                Some(loc_str) => {
                    let loc = parse_ip(loc_str)?;
                    if ext.is_ipv4() != loc.is_ipv4() {
                        return Err(IceError::config(format!(
                            "invalid NAT 1:1 IP mapping: family mismatch in {:?}",
                            entry
                        )));
                    }
                    if ext.is_ipv4() {
                        mapper.ipv4.add_ip_mapping(loc, ext)?;
                    } else {
                        mapper.ipv6.add_ip_mapping(loc, ext)?;
                    }
                }
            }
        }

        Ok(Some(mapper))
    }

    /// Candidate type the remapped addresses are surfaced as
    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    /// Look up the external IP for a local one
    pub fn find_external_ip(&self, local: IpAddr) -> IceResult<IpAddr> {
        if local.is_ipv4() {
            self.ipv4.find_external_ip(local)
        } else {
            self.ipv6.find_external_ip(local)
        }
    }
}
