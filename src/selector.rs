// src/selector.rs
//! Pair nomination policy (RFC 8445 Section 8)
//!
//! The selector decides which pairs get probed and which succeeded pair is
//! promoted to selected. Controlling agents nominate with USE-CANDIDATE;
//! controlled agents answer checks and accept (or defer) nominations; lite
//! agents never initiate checks at all. Every method runs inside the event
//! loop with exclusive access to the agent state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::agent::{AgentInternal, ConnectionState};
use crate::candidate::{Candidate, CandidateType};
use crate::pair::CandidatePairState;
use crate::stun::{Attribute, AttributeType, AttributeValue, Message};

/// Role-specific nomination policy driven by the event loop
pub(crate) trait PairSelector: Send {
    /// Called when checks start and after every restart
    fn start(&mut self, agent: &mut AgentInternal);

    /// Called on every check-loop tick
    fn contact_candidates(&mut self, agent: &mut AgentInternal);

    /// Send one binding request on the given pair
    fn ping_candidate(
        &mut self,
        agent: &mut AgentInternal,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    );

    /// Handle an authenticated Binding success response
    fn handle_success_response(
        &mut self,
        agent: &mut AgentInternal,
        msg: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
        remote_addr: SocketAddr,
    );

    /// Handle an authenticated Binding request
    fn handle_binding_request(
        &mut self,
        agent: &mut AgentInternal,
        msg: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    );
}

/// Shared helper: mark the pair for (local, remote) succeeded after a
/// validated success response. Returns the checklist index.
fn record_pair_success(
    agent: &mut AgentInternal,
    local: &Arc<Candidate>,
    remote: &Arc<Candidate>,
) -> Option<usize> {
    let idx = agent.find_pair_index(local, remote)?;
    agent.checklist[idx].state = CandidatePairState::Succeeded;
    trace!("Found valid candidate pair: {}", agent.checklist[idx]);
    Some(idx)
}

/// Controlling-side selector: probes, then nominates the best valid pair
pub(crate) struct ControllingSelector {
    start_time: Instant,
    nominated_pair: Option<(Arc<Candidate>, Arc<Candidate>)>,
    nomination_request_count: u16,
}

impl ControllingSelector {
    pub(crate) fn new() -> Self {
        Self {
            start_time: Instant::now(),
            nominated_pair: None,
            nomination_request_count: 0,
        }
    }

    /// Acceptance gating: a pair only becomes nominatable once its local
    /// candidate type has been allowed to settle
    fn is_nominatable(&self, agent: &AgentInternal, idx: usize) -> bool {
        let elapsed = self.start_time.elapsed();
        let wait = match agent.checklist[idx].local.candidate_type() {
            CandidateType::Host => agent.host_acceptance_min_wait,
            CandidateType::ServerReflexive => agent.srflx_acceptance_min_wait,
            CandidateType::PeerReflexive => agent.prflx_acceptance_min_wait,
            CandidateType::Relay => agent.relay_acceptance_min_wait,
        };
        elapsed > wait
    }

    fn nominate_pair(
        &mut self,
        agent: &mut AgentInternal,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    ) {
        // The controlling agent includes USE-CANDIDATE to nominate
        // (RFC 8445 Section 8.1.1)
        let mut msg = Message::binding_request();
        msg.add_attribute(Attribute::new(
            AttributeType::Username,
            AttributeValue::Username(format!("{}:{}", agent.remote_ufrag, agent.local_ufrag)),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::UseCandidate,
            AttributeValue::UseCandidate,
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::IceControlling,
            AttributeValue::IceControlling(agent.tie_breaker),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::Priority,
            AttributeValue::Priority(local.priority()),
        ));

        self.nomination_request_count += 1;
        agent.send_binding_request(&msg, local, remote);
    }
}

impl PairSelector for ControllingSelector {
    fn start(&mut self, _agent: &mut AgentInternal) {
        self.start_time = Instant::now();
        self.nominated_pair = None;
        self.nomination_request_count = 0;
    }

    fn contact_candidates(&mut self, agent: &mut AgentInternal) {
        if agent.get_selected_pair().is_some() {
            if agent.validate_selected_pair() {
                trace!("Checking keepalive");
                if let Some((local, remote)) = agent.keepalive_pair() {
                    self.ping_candidate(agent, &local, &remote);
                }
            }
        } else if let Some((local, remote)) = self.nominated_pair.clone() {
            if self.nomination_request_count > agent.max_binding_requests {
                trace!("Max nomination requests reached, setting the connection state to failed");
                agent.update_connection_state(ConnectionState::Failed);
                return;
            }
            self.nominate_pair(agent, &local, &remote);
        } else {
            if let Some(idx) = agent.best_valid_pair_index() {
                if self.is_nominatable(agent, idx) {
                    trace!(
                        "Nominatable pair found, nominating ({})",
                        agent.checklist[idx]
                    );
                    agent.checklist[idx].nominated = true;
                    let local = agent.checklist[idx].local.clone();
                    let remote = agent.checklist[idx].remote.clone();
                    self.nominated_pair = Some((local.clone(), remote.clone()));
                    self.nominate_pair(agent, &local, &remote);
                    return;
                }
            }

            for (local, remote) in agent.take_pairs_to_ping() {
                self.ping_candidate(agent, &local, &remote);
            }
        }
    }

    fn ping_candidate(
        &mut self,
        agent: &mut AgentInternal,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    ) {
        let mut msg = Message::binding_request();
        msg.add_attribute(Attribute::new(
            AttributeType::Username,
            AttributeValue::Username(format!("{}:{}", agent.remote_ufrag, agent.local_ufrag)),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::IceControlling,
            AttributeValue::IceControlling(agent.tie_breaker),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::Priority,
            AttributeValue::Priority(local.priority()),
        ));

        agent.send_binding_request(&msg, local, remote);
    }

    fn handle_success_response(
        &mut self,
        agent: &mut AgentInternal,
        msg: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
        remote_addr: SocketAddr,
    ) {
        let Some((pending, rtt)) = agent.handle_inbound_binding_success(msg.transaction_id) else {
            warn!(
                "Discard message from ({}), unknown transaction {}",
                remote, msg.transaction_id
            );
            return;
        };

        // Assert the response came back from where the request went
        // (RFC 8445 Section 7.2.5.2.1)
        if pending.destination != remote_addr {
            debug!(
                "Discard message: transaction destination {} does not match source {}",
                pending.destination, remote_addr
            );
            return;
        }

        trace!(
            "Inbound STUN (SuccessResponse) from {} to {}, rtt {:?}",
            remote,
            local,
            rtt
        );

        let Some(idx) = record_pair_success(agent, local, remote) else {
            warn!("Success response from invalid candidate pair");
            return;
        };

        if pending.is_use_candidate && agent.get_selected_pair().is_none() {
            agent.set_selected_pair(idx);
        }
    }

    fn handle_binding_request(
        &mut self,
        agent: &mut AgentInternal,
        msg: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    ) {
        agent.send_binding_success(msg, local, remote);

        let Some(idx) = agent.find_pair_index(local, remote) else {
            agent.add_pair(local.clone(), remote.clone());
            return;
        };

        // A triggered nomination: the peer reached us on a pair we already
        // validated and nothing has been nominated yet
        if agent.checklist[idx].state == CandidatePairState::Succeeded
            && self.nominated_pair.is_none()
            && agent.get_selected_pair().is_none()
        {
            if let Some(best_idx) = agent.best_available_pair_index() {
                if best_idx == idx && self.is_nominatable(agent, idx) {
                    trace!(
                        "The candidate pair {} is the best available, marking it as nominated",
                        agent.checklist[idx]
                    );
                    agent.checklist[idx].nominated = true;
                    self.nominated_pair = Some((local.clone(), remote.clone()));
                    self.nominate_pair(agent, local, remote);
                }
            }
        }
    }
}

/// Controlled-side selector: answers checks and accepts nominations
pub(crate) struct ControlledSelector;

impl ControlledSelector {
    pub(crate) fn new() -> Self {
        Self
    }

    /// Promote the pair at `idx` to selected, honoring the USE-CANDIDATE
    /// priority gate (RFC 8445 Section 7.2.1.5 clarification)
    fn try_select(&mut self, agent: &mut AgentInternal, idx: usize) {
        match agent.get_selected_pair() {
            None => agent.set_selected_pair(idx),
            Some(selected) => {
                let pair = &agent.checklist[idx];
                if selected.same_endpoints(&pair.local, &pair.remote) {
                    return;
                }
                if agent.nomination_priority_acceptable(idx) {
                    agent.set_selected_pair(idx);
                } else {
                    trace!(
                        "Ignore nominated pair {}, already selected {}",
                        agent.checklist[idx],
                        selected
                    );
                }
            }
        }
    }
}

impl PairSelector for ControlledSelector {
    fn start(&mut self, _agent: &mut AgentInternal) {}

    fn contact_candidates(&mut self, agent: &mut AgentInternal) {
        if agent.get_selected_pair().is_some() {
            if agent.validate_selected_pair() {
                trace!("Checking keepalive");
                if let Some((local, remote)) = agent.keepalive_pair() {
                    self.ping_candidate(agent, &local, &remote);
                }
            }
        } else {
            // Regular checks let the controlling side learn peer-reflexive
            // candidates and produce valid pairs to nominate
            for (local, remote) in agent.take_pairs_to_ping() {
                self.ping_candidate(agent, &local, &remote);
            }
        }
    }

    fn ping_candidate(
        &mut self,
        agent: &mut AgentInternal,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    ) {
        let mut msg = Message::binding_request();
        msg.add_attribute(Attribute::new(
            AttributeType::Username,
            AttributeValue::Username(format!("{}:{}", agent.remote_ufrag, agent.local_ufrag)),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::IceControlled,
            AttributeValue::IceControlled(agent.tie_breaker),
        ));
        msg.add_attribute(Attribute::new(
            AttributeType::Priority,
            AttributeValue::Priority(local.priority()),
        ));

        agent.send_binding_request(&msg, local, remote);
    }

    fn handle_success_response(
        &mut self,
        agent: &mut AgentInternal,
        msg: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
        remote_addr: SocketAddr,
    ) {
        let Some((pending, rtt)) = agent.handle_inbound_binding_success(msg.transaction_id) else {
            warn!(
                "Discard message from ({}), unknown transaction {}",
                remote, msg.transaction_id
            );
            return;
        };

        if pending.destination != remote_addr {
            debug!(
                "Discard message: transaction destination {} does not match source {}",
                pending.destination, remote_addr
            );
            return;
        }

        trace!(
            "Inbound STUN (SuccessResponse) from {} to {}, rtt {:?}",
            remote,
            local,
            rtt
        );

        let Some(idx) = record_pair_success(agent, local, remote) else {
            warn!("Success response from invalid candidate pair");
            return;
        };

        if agent.checklist[idx].nominate_on_success {
            self.try_select(agent, idx);
        }
    }

    fn handle_binding_request(
        &mut self,
        agent: &mut AgentInternal,
        msg: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    ) {
        let use_candidate = msg.contains(AttributeType::UseCandidate);

        let idx = match agent.find_pair_index(local, remote) {
            Some(idx) => idx,
            None => agent.add_pair(local.clone(), remote.clone()),
        };

        if use_candidate {
            // RFC 8445 Section 7.3.1.5
            if agent.checklist[idx].state == CandidatePairState::Succeeded {
                // The pair already produced a valid response, nominate now
                self.try_select(agent, idx);
            } else {
                // Promote once the triggered check below succeeds
                agent.checklist[idx].nominate_on_success = true;
            }
        }

        agent.send_binding_success(msg, local, remote);

        // Triggered check (RFC 8445 Section 7.3.1.4). Lite agents only
        // respond, and an already-succeeded pair needs no further checks.
        if !agent.lite && agent.checklist[idx].state != CandidatePairState::Succeeded {
            let pair_local = agent.checklist[idx].local.clone();
            let pair_remote = agent.checklist[idx].remote.clone();
            self.ping_candidate(agent, &pair_local, &pair_remote);
        }
    }
}

/// Lite wrapper: responds but never initiates checks (RFC 8445 Section 2.7)
pub(crate) struct LiteSelector {
    inner: Box<dyn PairSelector>,
}

impl LiteSelector {
    pub(crate) fn new(inner: Box<dyn PairSelector>) -> Self {
        Self { inner }
    }
}

impl PairSelector for LiteSelector {
    fn start(&mut self, agent: &mut AgentInternal) {
        self.inner.start(agent);
    }

    fn contact_candidates(&mut self, agent: &mut AgentInternal) {
        // Only re-evaluate the selected pair timers; checks are never
        // initiated regardless of role
        agent.validate_selected_pair();
    }

    fn ping_candidate(
        &mut self,
        _agent: &mut AgentInternal,
        _local: &Arc<Candidate>,
        _remote: &Arc<Candidate>,
    ) {
        // Lite agents only respond
    }

    fn handle_success_response(
        &mut self,
        agent: &mut AgentInternal,
        msg: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
        remote_addr: SocketAddr,
    ) {
        self.inner
            .handle_success_response(agent, msg, local, remote, remote_addr);
    }

    fn handle_binding_request(
        &mut self,
        agent: &mut AgentInternal,
        msg: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    ) {
        self.inner.handle_binding_request(agent, msg, local, remote);
    }
}
