// src/agent.rs
//! The ICE agent (RFC 8445)
//!
//! All mutable agent state is confined to a single event-loop task. Every
//! entry point, including inbound packet dispatch, posts a closure onto the
//! task channel and waits for it to finish, which serializes mutation
//! without a lock around every field. The only state readable from outside
//! the loop is the published selected-pair snapshot and the candidates'
//! activity timestamps.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::buffer::PacketBuffer;
use crate::candidate::{Candidate, CandidateType, NetworkType, TcpType};
use crate::config::{
    generate_pwd, generate_ufrag, AgentConfig, BindingRequestHandler, IpFilter, MulticastDnsMode,
    DEFAULT_CHECK_INTERVAL, DEFAULT_DISCONNECTED_TIMEOUT, DEFAULT_FAILED_TIMEOUT,
    DEFAULT_HOST_ACCEPTANCE_MIN_WAIT, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_MAX_BINDING_REQUESTS,
    DEFAULT_MAX_BINDING_REQUEST_TIMEOUT, DEFAULT_PRFLX_ACCEPTANCE_MIN_WAIT,
    DEFAULT_RELAY_ACCEPTANCE_MIN_WAIT, DEFAULT_SRFLX_ACCEPTANCE_MIN_WAIT, MIN_PWD_BITS,
    MIN_UFRAG_BITS,
};
use crate::error::{IceError, IceResult};
use crate::external_ip_mapper::ExternalIpMapper;
use crate::notifier::Notifier;
use crate::pair::{CandidatePair, CandidatePairState};
use crate::selector::{ControlledSelector, ControllingSelector, LiteSelector, PairSelector};
use crate::stun::{self, Attribute, AttributeType, AttributeValue, Message, MessageClass,
    TransactionId};
use crate::transport::{CandidateConn, MdnsResolver, Net, TcpMux, UdpMux, UniversalUdpMux};

/// Agent connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Freshly constructed, checks not started
    New,
    /// Connectivity checks are running
    Checking,
    /// A nominated pair is working
    Connected,
    /// The selected pair went quiet; may recover
    Disconnected,
    /// Checks exhausted or the selected pair timed out
    Failed,
    /// The agent has been shut down; terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Candidate gathering state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

impl fmt::Display for GatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Gathering => "gathering",
            Self::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// One outstanding Binding request awaiting its success response
#[derive(Debug, Clone)]
pub(crate) struct BindingRequest {
    pub(crate) timestamp: Instant,
    pub(crate) transaction_id: TransactionId,
    pub(crate) destination: SocketAddr,
    pub(crate) is_use_candidate: bool,
}

type TaskFn = Box<dyn FnOnce(&mut AgentInternal) + Send>;

struct Task {
    f: TaskFn,
    done: oneshot::Sender<()>,
}

type AfterRunFn = Box<dyn FnOnce(&mut AgentInternal) + Send>;

/// State owned by the event loop. Only loop tasks ever touch it.
pub(crate) struct AgentInternal {
    pub(crate) lite: bool,
    pub(crate) tie_breaker: u64,
    pub(crate) is_controlling: bool,

    pub(crate) connection_state: ConnectionState,
    pub(crate) gathering_state: GatheringState,
    pub(crate) checking_start: Option<Instant>,

    pub(crate) local_ufrag: String,
    pub(crate) local_pwd: String,
    pub(crate) remote_ufrag: String,
    pub(crate) remote_pwd: String,

    pub(crate) local_candidates: HashMap<NetworkType, Vec<Arc<Candidate>>>,
    pub(crate) remote_candidates: HashMap<NetworkType, Vec<Arc<Candidate>>>,
    pub(crate) checklist: Vec<CandidatePair>,
    pub(crate) pending_binding_requests: Vec<BindingRequest>,

    selector: Option<Box<dyn PairSelector>>,

    selected_pair_slot: Arc<RwLock<Option<Arc<CandidatePair>>>>,
    connected_tx: watch::Sender<bool>,
    force_contact_tx: mpsc::Sender<()>,
    after_run: Vec<AfterRunFn>,
    pub(crate) gather_cancel: Option<Box<dyn FnOnce() + Send>>,

    buffer: Arc<PacketBuffer>,
    mdns_resolver: Option<Arc<dyn MdnsResolver>>,

    connection_state_notifier: Arc<Notifier<ConnectionState>>,
    pub(crate) candidate_notifier: Arc<Notifier<Option<Arc<Candidate>>>>,
    selected_pair_notifier: Arc<Notifier<Arc<CandidatePair>>>,

    // Configuration snapshot
    pub(crate) network_types: Vec<NetworkType>,
    pub(crate) max_binding_requests: u16,
    pub(crate) max_binding_request_timeout: Duration,
    pub(crate) keepalive_interval: Duration,
    pub(crate) disconnected_timeout: Duration,
    pub(crate) failed_timeout: Duration,
    pub(crate) host_acceptance_min_wait: Duration,
    pub(crate) srflx_acceptance_min_wait: Duration,
    pub(crate) prflx_acceptance_min_wait: Duration,
    pub(crate) relay_acceptance_min_wait: Duration,
    pub(crate) enable_use_candidate_check_priority: bool,
    disable_active_tcp: bool,
    include_loopback: bool,
    ip_filter: Option<IpFilter>,
    net: Option<Arc<dyn Net>>,
    tcp_mux: Option<Arc<dyn TcpMux>>,
    udp_mux: Option<Arc<dyn UdpMux>>,
    udp_mux_srflx: Option<Arc<dyn UniversalUdpMux>>,
    binding_request_handler: Option<BindingRequestHandler>,
}

impl AgentInternal {
    /// Register a function to run after the current task completes
    pub(crate) fn register_after_run(&mut self, f: AfterRunFn) {
        self.after_run.push(f);
    }

    fn drain_after_run(&mut self) {
        loop {
            let fns = std::mem::take(&mut self.after_run);
            if fns.is_empty() {
                break;
            }
            for f in fns {
                f(self);
            }
        }
    }

    /// Dispatch through the selector without fighting the borrow checker:
    /// the selector is moved out for the duration of the call.
    pub(crate) fn with_selector(
        &mut self,
        f: impl FnOnce(&mut Box<dyn PairSelector>, &mut AgentInternal),
    ) {
        if let Some(mut selector) = self.selector.take() {
            f(&mut selector, self);
            // A restart may have installed a fresh selector meanwhile
            if self.selector.is_none() {
                self.selector = Some(selector);
            }
        }
    }

    pub(crate) fn contact_candidates(&mut self) {
        self.with_selector(|selector, agent| selector.contact_candidates(agent));
    }

    pub(crate) fn update_connection_state(&mut self, new_state: ConnectionState) {
        if self.connection_state == new_state {
            return;
        }

        // Failure releases every gathered resource; a later restart starts
        // from a clean slate
        if new_state == ConnectionState::Failed {
            self.remove_ufrag_from_mux();
            self.checklist.clear();
            self.pending_binding_requests.clear();
            self.clear_selected_pair();
            self.delete_all_candidates();
        }

        if new_state == ConnectionState::Checking {
            self.checking_start = Some(Instant::now());
        }

        info!("Setting new connection state: {}", new_state);
        self.connection_state = new_state;
        self.connection_state_notifier.enqueue(new_state);
    }

    pub(crate) fn get_selected_pair(&self) -> Option<Arc<CandidatePair>> {
        self.selected_pair_slot.read().clone()
    }

    /// Nominate and publish the checklist pair at `idx`
    pub(crate) fn set_selected_pair(&mut self, idx: usize) {
        self.checklist[idx].nominated = true;
        let snapshot = Arc::new(self.checklist[idx].clone());
        trace!("Set selected candidate pair: {}", snapshot);

        *self.selected_pair_slot.write() = Some(snapshot.clone());
        self.update_connection_state(ConnectionState::Connected);
        self.selected_pair_notifier.enqueue(snapshot);

        // One-shot connected gate; later selections are no-ops for waiters
        let _ = self.connected_tx.send(true);
    }

    pub(crate) fn clear_selected_pair(&mut self) {
        if self.selected_pair_slot.write().take().is_some() {
            trace!("Unset selected candidate pair");
        }
    }

    /// Re-evaluate the selected pair against the disconnect/failure timers.
    /// Returns false when there is no selected pair.
    pub(crate) fn validate_selected_pair(&mut self) -> bool {
        let Some(selected) = self.get_selected_pair() else {
            return false;
        };

        let disconnected_time = selected.remote.last_received().elapsed();

        // Only transition to failed when a failed timeout is configured
        let mut total_time_to_failure = self.failed_timeout;
        if !total_time_to_failure.is_zero() {
            total_time_to_failure += self.disconnected_timeout;
        }

        if !total_time_to_failure.is_zero() && disconnected_time > total_time_to_failure {
            self.update_connection_state(ConnectionState::Failed);
        } else if !self.disconnected_timeout.is_zero()
            && disconnected_time > self.disconnected_timeout
        {
            self.update_connection_state(ConnectionState::Disconnected);
        } else {
            self.update_connection_state(ConnectionState::Connected);
        }

        true
    }

    /// Endpoints of the selected pair when a consent-refresh ping is due.
    /// Binding requests are used instead of indications (RFC 7675).
    pub(crate) fn keepalive_pair(&self) -> Option<(Arc<Candidate>, Arc<Candidate>)> {
        let selected = self.get_selected_pair()?;

        if !self.keepalive_interval.is_zero()
            && (selected.local.last_sent().elapsed() > self.keepalive_interval
                || selected.remote.last_received().elapsed() > self.keepalive_interval)
        {
            Some((selected.local.clone(), selected.remote.clone()))
        } else {
            None
        }
    }

    /// Advance Waiting pairs to In-Progress and collect the endpoints that
    /// should be probed this tick. Pairs over the request budget fail.
    pub(crate) fn take_pairs_to_ping(&mut self) -> Vec<(Arc<Candidate>, Arc<Candidate>)> {
        if self.checklist.is_empty() {
            warn!("Failed to ping without candidate pairs. Connection is not possible yet.");
        }

        let mut to_ping = Vec::new();
        for pair in &mut self.checklist {
            match pair.state {
                CandidatePairState::Waiting => pair.state = CandidatePairState::InProgress,
                CandidatePairState::InProgress => {}
                _ => continue,
            }

            if pair.binding_request_count > self.max_binding_requests {
                trace!("Maximum requests reached for pair {}, marking it as failed", pair);
                pair.state = CandidatePairState::Failed;
            } else {
                pair.binding_request_count += 1;
                to_ping.push((pair.local.clone(), pair.remote.clone()));
            }
        }
        to_ping
    }

    /// Highest-priority pair that has not failed
    pub(crate) fn best_available_pair_index(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, pair) in self.checklist.iter().enumerate() {
            if pair.state == CandidatePairState::Failed {
                continue;
            }
            match best {
                Some(b) if self.checklist[b].priority() >= pair.priority() => {}
                _ => best = Some(i),
            }
        }
        best
    }

    /// Highest-priority succeeded pair
    pub(crate) fn best_valid_pair_index(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, pair) in self.checklist.iter().enumerate() {
            if pair.state != CandidatePairState::Succeeded {
                continue;
            }
            match best {
                Some(b) if self.checklist[b].priority() >= pair.priority() => {}
                _ => best = Some(i),
            }
        }
        best
    }

    fn max_succeeded_pair_priority(&self) -> u64 {
        self.checklist
            .iter()
            .filter(|p| p.state == CandidatePairState::Succeeded)
            .map(|p| p.priority())
            .max()
            .unwrap_or(0)
    }

    fn needs_to_check_priority_on_nominated(&self) -> bool {
        !self.lite || self.enable_use_candidate_check_priority
    }

    /// USE-CANDIDATE priority gate: the nominated pair must rank at least as
    /// high as every pair that has already succeeded
    pub(crate) fn nomination_priority_acceptable(&self, idx: usize) -> bool {
        if !self.needs_to_check_priority_on_nominated() {
            return true;
        }
        self.checklist[idx].priority() >= self.max_succeeded_pair_priority()
    }

    pub(crate) fn add_pair(&mut self, local: Arc<Candidate>, remote: Arc<Candidate>) -> usize {
        self.checklist
            .push(CandidatePair::new(local, remote, self.is_controlling));
        self.checklist.len() - 1
    }

    pub(crate) fn find_pair_index(&self, local: &Candidate, remote: &Candidate) -> Option<usize> {
        self.checklist
            .iter()
            .position(|p| p.same_endpoints(local, remote))
    }

    pub(crate) fn find_remote_candidate(
        &self,
        network: NetworkType,
        addr: SocketAddr,
    ) -> Option<Arc<Candidate>> {
        self.remote_candidates
            .get(&network)?
            .iter()
            .find(|c| c.addr() == Some(addr))
            .cloned()
    }

    /// Record and transmit a Binding request, signing with the remote
    /// password
    pub(crate) fn send_binding_request(
        &mut self,
        msg: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    ) {
        let Some(destination) = remote.addr() else {
            warn!("Cannot send binding request to unresolved candidate {}", remote);
            return;
        };

        trace!("Ping STUN from {} to {}", local, remote);

        self.invalidate_pending_binding_requests(Instant::now());
        self.pending_binding_requests.push(BindingRequest {
            timestamp: Instant::now(),
            transaction_id: msg.transaction_id,
            destination,
            is_use_candidate: msg.contains(AttributeType::UseCandidate),
        });

        let data = msg.encode(Some(self.remote_pwd.as_bytes()), true);
        self.send_stun(&data, local, destination);
    }

    /// Answer a Binding request with a success response carrying the peer's
    /// reflexive address, signed with the local password
    pub(crate) fn send_binding_success(
        &mut self,
        request: &Message,
        local: &Arc<Candidate>,
        remote: &Arc<Candidate>,
    ) {
        let Some(base) = remote.addr() else {
            warn!("Cannot send binding success to unresolved candidate {}", remote);
            return;
        };

        let mut response = Message::binding_success(request.transaction_id);
        response.add_attribute(Attribute::new(
            AttributeType::XorMappedAddress,
            AttributeValue::XorMappedAddress(base),
        ));

        let data = response.encode(Some(self.local_pwd.as_bytes()), true);
        self.send_stun(&data, local, base);
    }

    fn send_stun(&self, data: &[u8], local: &Arc<Candidate>, destination: SocketAddr) {
        if let Err(err) = local.write_to(data, destination) {
            warn!("Failed to send STUN from {} to {}: {}", local, destination, err);
        }
    }

    /// Expire binding requests older than the transaction timeout
    /// (RFC 8445 Appendix B.1)
    fn invalidate_pending_binding_requests(&mut self, filter_time: Instant) {
        let initial_size = self.pending_binding_requests.len();
        let timeout = self.max_binding_request_timeout;
        self.pending_binding_requests
            .retain(|req| filter_time.duration_since(req.timestamp) < timeout);

        let removed = initial_size - self.pending_binding_requests.len();
        if removed > 0 {
            trace!("Discarded {} binding requests because they expired", removed);
        }
    }

    /// Match a success response to its outstanding request. A matched
    /// request is consumed; the round-trip time is returned with it.
    pub(crate) fn handle_inbound_binding_success(
        &mut self,
        id: TransactionId,
    ) -> Option<(BindingRequest, Duration)> {
        self.invalidate_pending_binding_requests(Instant::now());

        let pos = self
            .pending_binding_requests
            .iter()
            .position(|req| req.transaction_id == id)?;
        let request = self.pending_binding_requests.remove(pos);
        let rtt = request.timestamp.elapsed();
        Some((request, rtt))
    }

    /// Process one inbound STUN message from a remote address
    pub(crate) fn handle_inbound(
        &mut self,
        msg: &Message,
        local: &Arc<Candidate>,
        remote: SocketAddr,
    ) {
        let class = msg.message_type.class();
        if !matches!(
            class,
            MessageClass::Request | MessageClass::SuccessResponse | MessageClass::Indication
        ) {
            trace!(
                "Unhandled STUN from {} to {}: {}",
                remote,
                local,
                msg.message_type
            );
            return;
        }

        // Role conflict checks (RFC 8445 Section 7.3.1.1); the tie-breaker
        // role switch is intentionally not implemented, conflicting
        // messages are dropped
        if self.is_controlling {
            if msg.contains(AttributeType::IceControlling) {
                debug!("Inbound STUN message: ICE-CONTROLLING while we are controlling");
                return;
            }
            if msg.contains(AttributeType::UseCandidate) {
                debug!("Inbound STUN message: USE-CANDIDATE while we are controlling");
                return;
            }
        } else if msg.contains(AttributeType::IceControlled) {
            debug!("Inbound STUN message: ICE-CONTROLLED while we are controlled");
            return;
        }

        let mut remote_candidate = self.find_remote_candidate(local.network_type(), remote);

        if class == MessageClass::SuccessResponse {
            if let Err(err) = msg.verify_integrity(self.remote_pwd.as_bytes()) {
                warn!("Discard message from ({}): {}", remote, err);
                return;
            }

            let Some(remote_candidate) = remote_candidate.clone() else {
                warn!("Discard success message from ({}), no such remote candidate", remote);
                return;
            };

            let local = local.clone();
            self.with_selector(|selector, agent| {
                selector.handle_success_response(agent, msg, &local, &remote_candidate, remote);
            });
        } else if class == MessageClass::Request {
            trace!(
                "Inbound STUN (Request) from {} to {}, use-candidate: {}",
                remote,
                local,
                msg.contains(AttributeType::UseCandidate)
            );

            let expected_username = format!("{}:{}", self.local_ufrag, self.remote_ufrag);
            if msg.username() != Some(expected_username.as_str()) {
                warn!(
                    "Discard message from ({}): USERNAME mismatch, got {:?}",
                    remote,
                    msg.username()
                );
                return;
            }
            if let Err(err) = msg.verify_integrity(self.local_pwd.as_bytes()) {
                warn!("Discard message from ({}): {}", remote, err);
                return;
            }

            let request_candidate = match remote_candidate.clone() {
                Some(candidate) => candidate,
                None => {
                    // Learn a peer-reflexive candidate from the source
                    // address (RFC 8445 Section 7.3.1.3)
                    let prflx = Arc::new(Candidate::new_peer_reflexive(
                        remote,
                        local.network_type(),
                        local.component(),
                        None,
                    ));
                    debug!("Adding a new peer-reflexive candidate: {}", remote);
                    self.add_remote_candidate(prflx.clone());
                    prflx
                }
            };
            remote_candidate = Some(request_candidate.clone());

            if let Some(handler) = self.binding_request_handler.clone() {
                let pair = self
                    .find_pair_index(local, &request_candidate)
                    .map(|i| self.checklist[i].clone());
                if handler(msg, local, &request_candidate, pair.as_ref()) {
                    return;
                }
            }

            let local = local.clone();
            self.with_selector(|selector, agent| {
                selector.handle_binding_request(agent, msg, &local, &request_candidate);
            });
        }

        if let Some(remote_candidate) = remote_candidate {
            remote_candidate.seen(false);
        }
    }

    /// Insert a remote candidate, deduplicating and pairing it with every
    /// matching local candidate
    pub(crate) fn add_remote_candidate(&mut self, c: Arc<Candidate>) {
        let network = c.network_type();

        if let Some(set) = self.remote_candidates.get(&network) {
            if set.iter().any(|existing| existing.equal(&c)) {
                return;
            }
        }

        let tcp_network_configured = self.network_types.iter().any(|nt| nt.is_tcp());
        if !self.disable_active_tcp
            && tcp_network_configured
            && c.tcp_type() == Some(TcpType::Passive)
        {
            self.add_remote_passive_tcp_candidate(&c);
        }

        self.remote_candidates
            .entry(network)
            .or_default()
            .push(c.clone());

        if c.tcp_type() != Some(TcpType::Passive) {
            if let Some(locals) = self.local_candidates.get(&network).cloned() {
                for local in locals {
                    self.add_pair(local, c.clone());
                }
            }
        }

        self.request_connectivity_check();
    }

    /// For a remote passive-TCP candidate, synthesize a dialing active-TCP
    /// local candidate per eligible interface and pair them
    fn add_remote_passive_tcp_candidate(&mut self, remote: &Arc<Candidate>) {
        let Some(net) = self.net.clone() else {
            warn!("No network provider configured, active TCP candidates will not be created");
            return;
        };
        let Some(remote_addr) = remote.addr() else {
            return;
        };

        let local_ips = match net.local_ips(remote.network_type()) {
            Ok(ips) => ips,
            Err(err) => {
                warn!("Failed to iterate local interfaces for active TCP: {}", err);
                return;
            }
        };

        for ip in local_ips {
            if !self.include_loopback && ip.is_loopback() {
                continue;
            }
            if let Some(filter) = &self.ip_filter {
                if !filter(ip) {
                    continue;
                }
            }

            let conn = match net.dial_active_tcp(ip, remote_addr) {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("Failed to create active TCP connection from {}: {}", ip, err);
                    continue;
                }
            };
            let local_addr = match conn.local_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    warn!("Failed to resolve active TCP local address: {}", err);
                    let _ = conn.close();
                    continue;
                }
            };

            let local = Arc::new(Candidate::new_host(
                local_addr,
                remote.network_type(),
                remote.component(),
                Some(TcpType::Active),
            ));
            local.set_conn(conn);

            self.local_candidates
                .entry(local.network_type())
                .or_default()
                .push(local.clone());
            self.candidate_notifier.enqueue(Some(local.clone()));

            self.add_pair(local, remote.clone());
        }
    }

    /// Wake the check loop without waiting for the next tick
    pub(crate) fn request_connectivity_check(&self) {
        let _ = self.force_contact_tx.try_send(());
    }

    /// Close and forget every candidate on both sides. Used for restarts,
    /// failures and shutdown.
    fn delete_all_candidates(&mut self) {
        for (_, candidates) in self.local_candidates.drain() {
            for c in candidates {
                if let Err(err) = c.close() {
                    warn!("Failed to close candidate {}: {}", c, err);
                }
            }
        }
        for (_, candidates) in self.remote_candidates.drain() {
            for c in candidates {
                if let Err(err) = c.close() {
                    warn!("Failed to close candidate {}: {}", c, err);
                }
            }
        }
    }

    fn remove_ufrag_from_mux(&self) {
        if let Some(mux) = &self.tcp_mux {
            mux.remove_conn_by_ufrag(&self.local_ufrag);
        }
        if let Some(mux) = &self.udp_mux {
            mux.remove_conn_by_ufrag(&self.local_ufrag);
        }
        if let Some(mux) = &self.udp_mux_srflx {
            mux.remove_conn_by_ufrag(&self.local_ufrag);
        }
    }
}

/// The event loop: tasks in arrival order, then teardown on shutdown
async fn task_loop(
    mut inner: AgentInternal,
    mut task_rx: mpsc::Receiver<Task>,
    mut done_rx: watch::Receiver<bool>,
    loop_done_tx: oneshot::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = done_rx.changed() => break,
            task = task_rx.recv() => match task {
                Some(task) => {
                    (task.f)(&mut inner);
                    let _ = task.done.send(());
                    inner.drain_after_run();
                }
                None => break,
            },
        }
    }

    // Shutdown sequence: release candidates, close the receive buffer and
    // mDNS, publish the terminal state, then drain any remaining hooks
    inner.delete_all_candidates();
    inner.buffer.close();
    if let Some(mdns) = inner.mdns_resolver.take() {
        mdns.close().await;
    }
    inner.update_connection_state(ConnectionState::Closed);
    inner.remove_ufrag_from_mux();
    inner.drain_after_run();

    let _ = loop_done_tx.send(());
    // Dropping `inner` drops connected_tx, unblocking any connect waiters
}

/// ICE agent handle. All methods are safe to call from any task.
pub struct Agent {
    task_tx: mpsc::Sender<Task>,
    closed: AtomicBool,
    started: AtomicBool,

    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    task_loop_done: Mutex<Option<oneshot::Receiver<()>>>,

    selected_pair_slot: Arc<RwLock<Option<Arc<CandidatePair>>>>,
    connected_rx: watch::Receiver<bool>,
    force_contact_rx: Mutex<Option<mpsc::Receiver<()>>>,

    buffer: Arc<PacketBuffer>,

    connection_state_notifier: Arc<Notifier<ConnectionState>>,
    candidate_notifier: Arc<Notifier<Option<Arc<Candidate>>>>,
    selected_pair_notifier: Arc<Notifier<Arc<CandidatePair>>>,

    mdns_mode: MulticastDnsMode,
    mdns_resolver: Option<Arc<dyn MdnsResolver>>,
    ext_ip_mapper: Option<Arc<ExternalIpMapper>>,

    // Check-loop timer inputs
    check_interval: Duration,
    keepalive_interval: Duration,
    disconnected_timeout: Duration,
    failed_timeout: Duration,
}

impl Agent {
    /// Create a new agent. The initial `Restart` rotates in the configured
    /// or generated credentials.
    pub async fn new(config: AgentConfig) -> IceResult<Arc<Self>> {
        config.validate()?;

        let ext_ip_mapper =
            ExternalIpMapper::new(config.nat_1to1_ip_candidate_type, &config.nat_1to1_ips)?
                .map(Arc::new);

        let mut mdns_mode = config.multicast_dns_mode;
        if mdns_mode != MulticastDnsMode::Disabled && config.mdns_resolver.is_none() {
            if config.multicast_dns_host_name.is_some() {
                warn!("mDNS requested but no resolver provided, disabling");
            }
            mdns_mode = MulticastDnsMode::Disabled;
        }

        let check_interval = config.check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL);
        let keepalive_interval = config
            .keepalive_interval
            .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL);
        let disconnected_timeout = config
            .disconnected_timeout
            .unwrap_or(DEFAULT_DISCONNECTED_TIMEOUT);
        let failed_timeout = config.failed_timeout.unwrap_or(DEFAULT_FAILED_TIMEOUT);

        let (task_tx, task_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = watch::channel(false);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (force_contact_tx, force_contact_rx) = mpsc::channel(1);
        let (loop_done_tx, loop_done_rx) = oneshot::channel();

        let selected_pair_slot: Arc<RwLock<Option<Arc<CandidatePair>>>> =
            Arc::new(RwLock::new(None));
        let buffer = Arc::new(PacketBuffer::new());

        let connection_state_notifier = Arc::new(Notifier::new());
        let candidate_notifier = Arc::new(Notifier::new());
        let selected_pair_notifier = Arc::new(Notifier::new());

        let internal = AgentInternal {
            lite: config.lite,
            tie_breaker: rand::random(),
            is_controlling: false,
            connection_state: ConnectionState::New,
            gathering_state: GatheringState::New,
            checking_start: None,
            local_ufrag: String::new(),
            local_pwd: String::new(),
            remote_ufrag: String::new(),
            remote_pwd: String::new(),
            local_candidates: HashMap::new(),
            remote_candidates: HashMap::new(),
            checklist: Vec::new(),
            pending_binding_requests: Vec::new(),
            selector: None,
            selected_pair_slot: selected_pair_slot.clone(),
            connected_tx,
            force_contact_tx,
            after_run: Vec::new(),
            gather_cancel: None,
            buffer: buffer.clone(),
            mdns_resolver: config.mdns_resolver.clone(),
            connection_state_notifier: connection_state_notifier.clone(),
            candidate_notifier: candidate_notifier.clone(),
            selected_pair_notifier: selected_pair_notifier.clone(),
            network_types: config.effective_network_types(),
            max_binding_requests: config
                .max_binding_requests
                .unwrap_or(DEFAULT_MAX_BINDING_REQUESTS),
            max_binding_request_timeout: config
                .max_binding_request_timeout
                .unwrap_or(DEFAULT_MAX_BINDING_REQUEST_TIMEOUT),
            keepalive_interval,
            disconnected_timeout,
            failed_timeout,
            host_acceptance_min_wait: config
                .host_acceptance_min_wait
                .unwrap_or(DEFAULT_HOST_ACCEPTANCE_MIN_WAIT),
            srflx_acceptance_min_wait: config
                .srflx_acceptance_min_wait
                .unwrap_or(DEFAULT_SRFLX_ACCEPTANCE_MIN_WAIT),
            prflx_acceptance_min_wait: config
                .prflx_acceptance_min_wait
                .unwrap_or(DEFAULT_PRFLX_ACCEPTANCE_MIN_WAIT),
            relay_acceptance_min_wait: config
                .relay_acceptance_min_wait
                .unwrap_or(DEFAULT_RELAY_ACCEPTANCE_MIN_WAIT),
            enable_use_candidate_check_priority: config.enable_use_candidate_check_priority,
            disable_active_tcp: config.disable_active_tcp,
            include_loopback: config.include_loopback,
            ip_filter: config.ip_filter.clone(),
            net: config.net.clone(),
            tcp_mux: config.tcp_mux.clone(),
            udp_mux: config.udp_mux.clone(),
            udp_mux_srflx: config.udp_mux_srflx.clone(),
            binding_request_handler: config.binding_request_handler.clone(),
        };

        tokio::spawn(task_loop(internal, task_rx, done_rx.clone(), loop_done_tx));

        let agent = Arc::new(Self {
            task_tx,
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            done_tx,
            done_rx,
            task_loop_done: Mutex::new(Some(loop_done_rx)),
            selected_pair_slot,
            connected_rx,
            force_contact_rx: Mutex::new(Some(force_contact_rx)),
            buffer,
            connection_state_notifier,
            candidate_notifier,
            selected_pair_notifier,
            mdns_mode,
            mdns_resolver: config.mdns_resolver.clone(),
            ext_ip_mapper,
            check_interval,
            keepalive_interval,
            disconnected_timeout,
            failed_timeout,
        });

        // Restart doubles as first-time initialization
        if let Err(err) = agent
            .restart(config.local_ufrag.clone(), config.local_pwd.clone())
            .await
        {
            let _ = agent.close().await;
            return Err(err);
        }

        Ok(agent)
    }

    /// Enqueue a task and wait for the loop to run it
    async fn run<F>(&self, f: F) -> IceResult<()>
    where
        F: FnOnce(&mut AgentInternal) + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(IceError::Closed);
        }
        self.run_internal(f).await
    }

    async fn run_internal<F>(&self, f: F) -> IceResult<()>
    where
        F: FnOnce(&mut AgentInternal) + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.task_tx
            .send(Task {
                f: Box::new(f),
                done: done_tx,
            })
            .await
            .map_err(|_| IceError::Closed)?;
        done_rx.await.map_err(|_| IceError::Closed)
    }

    /// Run a task and return a value computed inside the loop
    async fn query<T, F>(&self, f: F) -> IceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut AgentInternal) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.run(move |agent| {
            let _ = tx.send(f(agent));
        })
        .await?;
        rx.await.map_err(|_| IceError::Closed)
    }

    /// Watch channel that flips to true when the agent closes
    pub fn done_signal(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Start connectivity checks with the given role and remote credentials.
    /// May only be called once per agent lifetime.
    pub async fn start_connectivity_checks(
        self: &Arc<Self>,
        is_controlling: bool,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> IceResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(IceError::credentials("connectivity checks already started"));
        }

        self.set_remote_credentials(remote_ufrag.clone(), remote_pwd.clone())
            .await?;

        debug!(
            "Started agent: is_controlling? {}, remote_ufrag: {:?}",
            is_controlling, remote_ufrag
        );

        self.run(move |agent| {
            agent.is_controlling = is_controlling;

            let role_selector: Box<dyn PairSelector> = if is_controlling {
                Box::new(ControllingSelector::new())
            } else {
                Box::new(ControlledSelector::new())
            };
            let selector: Box<dyn PairSelector> = if agent.lite {
                Box::new(LiteSelector::new(role_selector))
            } else {
                role_selector
            };
            agent.selector = Some(selector);
            agent.with_selector(|selector, agent| selector.start(agent));

            agent.update_connection_state(ConnectionState::Checking);
            agent.request_connectivity_check();
        })
        .await?;

        // The check loop runs until the agent closes
        if let Some(force_rx) = self.force_contact_rx.lock().take() {
            let agent = self.clone();
            tokio::spawn(agent.connectivity_checks(force_rx));
        }

        Ok(())
    }

    /// Timer-driven connectivity check loop. Each pass submits one task that
    /// walks the checklist through the selector.
    async fn connectivity_checks(self: Arc<Self>, mut force_rx: mpsc::Receiver<()>) {
        fn shrink(interval: &mut Duration, candidate: Duration) {
            if !candidate.is_zero() && (interval.is_zero() || *interval > candidate) {
                *interval = candidate;
            }
        }

        let observed_state = Arc::new(Mutex::new(ConnectionState::New));
        let mut done_rx = self.done_signal();

        loop {
            // Tick as fast as the tightest relevant timer
            let mut interval = DEFAULT_KEEPALIVE_INTERVAL;
            match *observed_state.lock() {
                ConnectionState::New | ConnectionState::Checking => {
                    shrink(&mut interval, self.check_interval)
                }
                ConnectionState::Connected | ConnectionState::Disconnected => {
                    shrink(&mut interval, self.keepalive_interval)
                }
                _ => {}
            }
            shrink(&mut interval, self.disconnected_timeout);
            shrink(&mut interval, self.failed_timeout);

            tokio::select! {
                _ = done_rx.changed() => return,
                _ = force_rx.recv() => {
                    if self.contact(&observed_state).await.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    if self.contact(&observed_state).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn contact(&self, observed_state: &Arc<Mutex<ConnectionState>>) -> IceResult<()> {
        let observed_state = observed_state.clone();
        self.run(move |agent| {
            let proceed = match agent.connection_state {
                // Failed connections send no checks until a restart
                ConnectionState::Failed => false,
                ConnectionState::Checking => match agent.checking_start {
                    Some(start)
                        if start.elapsed()
                            > agent.disconnected_timeout + agent.failed_timeout =>
                    {
                        agent.update_connection_state(ConnectionState::Failed);
                        false
                    }
                    _ => true,
                },
                _ => true,
            };

            if proceed {
                agent.contact_candidates();
            }
            *observed_state.lock() = agent.connection_state;
        })
        .await
    }

    /// Feed one inbound frame from a candidate's transport into the agent
    pub async fn handle_read(&self, local: &Arc<Candidate>, data: &[u8], from: SocketAddr) {
        if stun::is_stun(data) {
            match Message::decode(data) {
                Ok(msg) => {
                    let local = local.clone();
                    if let Err(err) = self.run(move |agent| agent.handle_inbound(&msg, &local, from)).await
                    {
                        warn!("Failed to handle inbound STUN from {}: {}", from, err);
                    }
                }
                Err(err) => warn!("Failed to decode STUN message from {}: {}", from, err),
            }
            return;
        }

        // Non-STUN traffic only flows once its source is a known remote
        let local = local.clone();
        let known = self
            .query(move |agent| {
                match agent.find_remote_candidate(local.network_type(), from) {
                    Some(remote) => {
                        remote.seen(false);
                        true
                    }
                    None => false,
                }
            })
            .await
            .unwrap_or(false);

        if known {
            self.buffer.push(data);
        } else {
            warn!("Discarded traffic from unknown remote {}", from);
        }
    }

    /// Receive the next application packet from the selected path
    pub async fn recv(&self) -> IceResult<Vec<u8>> {
        self.buffer.recv().await
    }

    /// Send application data on the selected pair
    pub fn send(&self, data: &[u8]) -> IceResult<usize> {
        let selected = self
            .selected_pair_slot
            .read()
            .clone()
            .ok_or_else(|| IceError::address("no selected candidate pair"))?;
        let destination = selected
            .remote
            .addr()
            .ok_or_else(|| IceError::address("selected remote candidate is unresolved"))?;

        selected
            .local
            .write_to(data, destination)
            .map_err(IceError::from)
    }

    /// Register a local candidate together with its transport handle. The
    /// caller keeps feeding inbound frames through [`Agent::handle_read`].
    pub async fn add_local_candidate(
        &self,
        c: Arc<Candidate>,
        conn: Arc<dyn CandidateConn>,
    ) -> IceResult<()> {
        self.run(move |agent| {
            let set = agent.local_candidates.entry(c.network_type()).or_default();
            if set.iter().any(|existing| existing.equal(&c)) {
                debug!("Ignore duplicate candidate: {}", c);
                if let Err(err) = conn.close() {
                    warn!("Failed to close duplicate candidate connection: {}", err);
                }
                let _ = c.close();
                return;
            }

            c.set_conn(conn);
            set.push(c.clone());

            if let Some(remotes) = agent.remote_candidates.get(&c.network_type()).cloned() {
                for remote in remotes {
                    agent.add_pair(c.clone(), remote);
                }
            }

            agent.request_connectivity_check();
            agent.candidate_notifier.enqueue(Some(c.clone()));
        })
        .await
    }

    /// Add a candidate learned from the remote peer. mDNS names are resolved
    /// asynchronously before insertion; active-TCP remotes are ignored since
    /// we only dial passive ones.
    pub fn add_remote_candidate(self: &Arc<Self>, c: Arc<Candidate>) -> IceResult<()> {
        if c.tcp_type() == Some(TcpType::Active) {
            info!("Ignoring remote candidate with tcpType active: {}", c);
            return Ok(());
        }

        if c.candidate_type() == CandidateType::Host && c.address().is_mdns() {
            if self.mdns_mode == MulticastDnsMode::Disabled {
                warn!("Remote mDNS candidate added, but mDNS is disabled: ({})", c.address());
                return Ok(());
            }
            let Some(resolver) = self.mdns_resolver.clone() else {
                warn!(
                    "Remote mDNS candidate added, but no resolver is available: ({})",
                    c.address()
                );
                return Ok(());
            };

            let agent = self.clone();
            tokio::spawn(async move {
                let Some(hostname) = c.address().mdns_hostname().map(str::to_owned) else {
                    return;
                };
                match resolver.resolve(&hostname).await {
                    Ok(ip) => {
                        if let Err(err) = c.set_resolved_ip(ip) {
                            warn!("Failed to set resolved mDNS address: {}", err);
                            return;
                        }
                        if let Err(err) =
                            agent.run(move |a| a.add_remote_candidate(c)).await
                        {
                            warn!("Failed to add mDNS candidate: {}", err);
                        }
                    }
                    Err(err) => {
                        warn!("Failed to discover mDNS candidate {}: {}", hostname, err)
                    }
                }
            });
            return Ok(());
        }

        let agent = self.clone();
        tokio::spawn(async move {
            if let Err(err) = agent.run(move |a| a.add_remote_candidate(c)).await {
                warn!("Failed to add remote candidate: {}", err);
            }
        });
        Ok(())
    }

    /// Set the remote short-term credentials
    pub async fn set_remote_credentials(
        &self,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> IceResult<()> {
        if remote_ufrag.is_empty() {
            return Err(IceError::credentials("remote ufrag is empty"));
        }
        if remote_pwd.is_empty() {
            return Err(IceError::credentials("remote pwd is empty"));
        }

        self.run(move |agent| {
            agent.remote_ufrag = remote_ufrag;
            agent.remote_pwd = remote_pwd;
        })
        .await
    }

    /// Restart the session with new credentials (generated when empty).
    /// Clears the checklist, the binding cache, the selected pair and every
    /// candidate.
    pub async fn restart(&self, mut ufrag: String, mut pwd: String) -> IceResult<()> {
        if ufrag.is_empty() {
            ufrag = generate_ufrag();
        }
        if pwd.is_empty() {
            pwd = generate_pwd();
        }

        if ufrag.chars().count() * 8 < MIN_UFRAG_BITS {
            return Err(IceError::credentials(format!(
                "local ufrag needs at least {} bits of entropy",
                MIN_UFRAG_BITS
            )));
        }
        if pwd.chars().count() * 8 < MIN_PWD_BITS {
            return Err(IceError::credentials(format!(
                "local pwd needs at least {} bits of entropy",
                MIN_PWD_BITS
            )));
        }

        self.run(move |agent| {
            if agent.gathering_state == GatheringState::Gathering {
                if let Some(cancel) = agent.gather_cancel.take() {
                    cancel();
                }
            }

            // Back to a fresh session
            agent.remove_ufrag_from_mux();
            agent.local_ufrag = ufrag;
            agent.local_pwd = pwd;
            agent.remote_ufrag = String::new();
            agent.remote_pwd = String::new();
            agent.gathering_state = GatheringState::New;
            agent.checklist.clear();
            agent.pending_binding_requests.clear();
            agent.clear_selected_pair();
            agent.delete_all_candidates();
            agent.with_selector(|selector, agent| selector.start(agent));

            // A restart before checks started leaves the agent in New
            if agent.connection_state != ConnectionState::New {
                agent.update_connection_state(ConnectionState::Checking);
            }
        })
        .await
    }

    /// Update the gathering state; completion emits the end-of-candidates
    /// event
    pub async fn set_gathering_state(&self, new_state: GatheringState) -> IceResult<()> {
        self.run(move |agent| {
            if agent.gathering_state != new_state && new_state == GatheringState::Complete {
                agent.candidate_notifier.enqueue(None);
            }
            agent.gathering_state = new_state;
        })
        .await
    }

    /// Register the cancel hook for an in-flight gathering session; it runs
    /// on restart and close
    pub async fn set_gather_cancel(&self, cancel: Box<dyn FnOnce() + Send>) -> IceResult<()> {
        self.run(move |agent| {
            agent.gathering_state = GatheringState::Gathering;
            agent.gather_cancel = Some(cancel);
        })
        .await
    }

    pub async fn get_local_user_credentials(&self) -> IceResult<(String, String)> {
        self.query(|agent| (agent.local_ufrag.clone(), agent.local_pwd.clone()))
            .await
    }

    pub async fn get_remote_user_credentials(&self) -> IceResult<(String, String)> {
        self.query(|agent| (agent.remote_ufrag.clone(), agent.remote_pwd.clone()))
            .await
    }

    pub async fn get_local_candidates(&self) -> IceResult<Vec<Arc<Candidate>>> {
        self.query(|agent| {
            agent
                .local_candidates
                .values()
                .flatten()
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn get_remote_candidates(&self) -> IceResult<Vec<Arc<Candidate>>> {
        self.query(|agent| {
            agent
                .remote_candidates
                .values()
                .flatten()
                .cloned()
                .collect()
        })
        .await
    }

    /// Copy of the selected pair, readable from any thread without touching
    /// the loop
    pub fn get_selected_candidate_pair(&self) -> Option<CandidatePair> {
        self.selected_pair_slot
            .read()
            .as_ref()
            .map(|pair| (**pair).clone())
    }

    pub async fn get_connection_state(&self) -> IceResult<ConnectionState> {
        self.query(|agent| agent.connection_state).await
    }

    pub async fn get_gathering_state(&self) -> IceResult<GatheringState> {
        self.query(|agent| agent.gathering_state).await
    }

    /// The configured 1:1 NAT mapper, if any (used by gatherers)
    pub fn external_ip_mapper(&self) -> Option<Arc<ExternalIpMapper>> {
        self.ext_ip_mapper.clone()
    }

    /// Wait until a pair has been selected. Returns `Closed` if the agent
    /// shuts down first.
    pub async fn wait_until_connected(&self) -> IceResult<()> {
        let mut rx = self.connected_rx.clone();
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            rx.changed().await.map_err(|_| IceError::Closed)?;
        }
    }

    /// Register the connection-state handler
    pub fn on_connection_state_change(
        &self,
        handler: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) {
        self.connection_state_notifier.set_handler(Arc::new(handler));
    }

    /// Register the candidate handler; `None` marks the end of gathering
    pub fn on_candidate(&self, handler: impl Fn(Option<Arc<Candidate>>) + Send + Sync + 'static) {
        self.candidate_notifier.set_handler(Arc::new(handler));
    }

    /// Register the selected-pair-change handler
    pub fn on_selected_candidate_pair_change(
        &self,
        handler: impl Fn(Arc<CandidatePair>) + Send + Sync + 'static,
    ) {
        self.selected_pair_notifier.set_handler(Arc::new(handler));
    }

    /// Close the agent, releasing candidates and stopping the loop. Queued
    /// handler callbacks may be dropped; see [`Agent::graceful_close`].
    pub async fn close(&self) -> IceResult<()> {
        self.close_with(false).await
    }

    /// Close the agent after delivering every queued handler callback.
    /// Must not be called from inside a handler callback: the drain would
    /// wait on the very callback that is blocked on it.
    pub async fn graceful_close(&self) -> IceResult<()> {
        self.close_with(true).await
    }

    async fn close_with(&self, graceful: bool) -> IceResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Cancel any in-flight gather once the current task finishes
        let _ = self
            .run_internal(|agent| {
                agent.register_after_run(Box::new(|agent: &mut AgentInternal| {
                    if let Some(cancel) = agent.gather_cancel.take() {
                        cancel();
                    }
                }));
            })
            .await;

        let _ = self.done_tx.send(true);

        let loop_done = self.task_loop_done.lock().take();
        if let Some(loop_done) = loop_done {
            let _ = loop_done.await;
        }

        self.connection_state_notifier.close(graceful).await;
        self.candidate_notifier.close(graceful).await;
        self.selected_pair_notifier.close(graceful).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::COMPONENT_RTP;

    fn host(addr: &str) -> Arc<Candidate> {
        Arc::new(Candidate::new_host(
            addr.parse().unwrap(),
            NetworkType::Udp4,
            COMPONENT_RTP,
            None,
        ))
    }

    #[tokio::test]
    async fn test_new_agent_initial_state() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();

        assert_eq!(
            agent.get_connection_state().await.unwrap(),
            ConnectionState::New
        );
        assert_eq!(
            agent.get_gathering_state().await.unwrap(),
            GatheringState::New
        );

        let (ufrag, pwd) = agent.get_local_user_credentials().await.unwrap();
        assert!(ufrag.len() * 8 >= MIN_UFRAG_BITS);
        assert!(pwd.len() * 8 >= MIN_PWD_BITS);

        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_credential_entropy_bounds() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();

        // 2 chars = 16 bits rejected, 3 chars = 24 bits accepted
        assert!(agent
            .restart("ab".to_string(), "0123456789abcdef".to_string())
            .await
            .is_err());
        assert!(agent
            .restart("abc".to_string(), "0123456789abcdef".to_string())
            .await
            .is_ok());

        // 15 chars = 120 bits rejected, 16 chars = 128 bits accepted
        assert!(agent
            .restart("abc".to_string(), "0123456789abcde".to_string())
            .await
            .is_err());

        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_credentials_must_not_be_empty() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();

        assert!(agent
            .set_remote_credentials(String::new(), "pwd".to_string())
            .await
            .is_err());
        assert!(agent
            .set_remote_credentials("ufrag".to_string(), String::new())
            .await
            .is_err());
        assert!(agent
            .set_remote_credentials("ufrag".to_string(), "pwd".to_string())
            .await
            .is_ok());

        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_multiple_start_rejected() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();

        agent
            .start_connectivity_checks(true, "rufrag".to_string(), "rpwd".to_string())
            .await
            .unwrap();
        assert!(agent
            .start_connectivity_checks(true, "rufrag".to_string(), "rpwd".to_string())
            .await
            .is_err());

        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_after_close_return_closed() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();
        agent.close().await.unwrap();
        // A second close is a no-op
        agent.close().await.unwrap();

        assert!(matches!(
            agent.get_local_candidates().await,
            Err(IceError::Closed)
        ));
        assert!(matches!(
            agent.restart(String::new(), String::new()).await,
            Err(IceError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_binding_request_cache_roundtrip() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();

        agent
            .run(|a| {
                a.remote_pwd = "remote-password".to_string();
                let local = host("10.0.0.1:1000");
                let remote = host("10.0.0.2:2000");

                let msg = Message::binding_request();
                let id = msg.transaction_id;
                a.send_binding_request(&msg, &local, &remote);
                assert_eq!(a.pending_binding_requests.len(), 1);

                // Matched exactly once, never thereafter
                let hit = a.handle_inbound_binding_success(id);
                assert!(hit.is_some());
                let (request, _rtt) = hit.unwrap();
                assert_eq!(request.destination, "10.0.0.2:2000".parse().unwrap());
                assert!(!request.is_use_candidate);
                assert!(a.handle_inbound_binding_success(id).is_none());
            })
            .await
            .unwrap();

        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_binding_request_cache_expiry() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();

        agent
            .run(|a| {
                a.remote_pwd = "remote-password".to_string();
                // With a zero timeout every entry expires immediately
                a.max_binding_request_timeout = Duration::ZERO;

                let local = host("10.0.0.1:1000");
                let remote = host("10.0.0.2:2000");
                let msg = Message::binding_request();
                let id = msg.transaction_id;
                a.send_binding_request(&msg, &local, &remote);

                assert!(a.handle_inbound_binding_success(id).is_none());
                assert!(a.pending_binding_requests.is_empty());
            })
            .await
            .unwrap();

        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_role_conflict_messages_dropped() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();
        agent
            .start_connectivity_checks(true, "rufrag".to_string(), "rpwd".to_string())
            .await
            .unwrap();

        agent
            .run(|a| {
                let local = host("10.0.0.1:1000");

                // Authenticated request carrying ICE-CONTROLLING while we
                // are controlling must be dropped before any state change
                let mut msg = Message::binding_request();
                msg.add_attribute(Attribute::new(
                    AttributeType::Username,
                    AttributeValue::Username(format!("{}:{}", a.local_ufrag, a.remote_ufrag)),
                ));
                msg.add_attribute(Attribute::new(
                    AttributeType::IceControlling,
                    AttributeValue::IceControlling(1),
                ));
                let encoded = msg.encode(Some(a.local_pwd.as_bytes()), true);
                let decoded = Message::decode(&encoded).unwrap();

                a.handle_inbound(&decoded, &local, "203.0.113.5:40000".parse().unwrap());

                assert!(a.checklist.is_empty());
                assert!(a.remote_candidates.is_empty());
            })
            .await
            .unwrap();

        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_reflexive_learning() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();
        agent
            .start_connectivity_checks(false, "rufrag".to_string(), "rpwd".to_string())
            .await
            .unwrap();

        agent
            .run(|a| {
                let local = host("10.0.0.1:1000");
                a.local_candidates
                    .entry(NetworkType::Udp4)
                    .or_default()
                    .push(local.clone());

                let source: SocketAddr = "203.0.113.5:40000".parse().unwrap();

                let mut msg = Message::binding_request();
                msg.add_attribute(Attribute::new(
                    AttributeType::Username,
                    AttributeValue::Username(format!("{}:{}", a.local_ufrag, a.remote_ufrag)),
                ));
                msg.add_attribute(Attribute::new(
                    AttributeType::IceControlling,
                    AttributeValue::IceControlling(7),
                ));
                let encoded = msg.encode(Some(a.local_pwd.as_bytes()), true);
                let decoded = Message::decode(&encoded).unwrap();

                a.handle_inbound(&decoded, &local, source);

                let learned = a
                    .find_remote_candidate(NetworkType::Udp4, source)
                    .expect("peer-reflexive candidate should have been learned");
                assert_eq!(learned.candidate_type(), CandidateType::PeerReflexive);
                assert!(a.find_pair_index(&local, &learned).is_some());
            })
            .await
            .unwrap();

        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_with_bad_integrity_dropped() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();
        agent
            .start_connectivity_checks(false, "rufrag".to_string(), "rpwd".to_string())
            .await
            .unwrap();

        agent
            .run(|a| {
                let local = host("10.0.0.1:1000");
                let source: SocketAddr = "203.0.113.5:40000".parse().unwrap();

                let mut msg = Message::binding_request();
                msg.add_attribute(Attribute::new(
                    AttributeType::Username,
                    AttributeValue::Username(format!("{}:{}", a.local_ufrag, a.remote_ufrag)),
                ));
                msg.add_attribute(Attribute::new(
                    AttributeType::IceControlling,
                    AttributeValue::IceControlling(7),
                ));
                let encoded = msg.encode(Some(b"not-the-local-password"), true);
                let decoded = Message::decode(&encoded).unwrap();

                a.handle_inbound(&decoded, &local, source);

                assert!(a.remote_candidates.is_empty());
                assert!(a.checklist.is_empty());
            })
            .await
            .unwrap();

        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_clears_session_state() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();
        agent
            .start_connectivity_checks(true, "rufrag".to_string(), "rpwd".to_string())
            .await
            .unwrap();

        agent
            .run(|a| {
                let local = host("10.0.0.1:1000");
                let remote = host("10.0.0.2:2000");
                a.local_candidates
                    .entry(NetworkType::Udp4)
                    .or_default()
                    .push(local.clone());
                a.remote_candidates
                    .entry(NetworkType::Udp4)
                    .or_default()
                    .push(remote.clone());
                let idx = a.add_pair(local, remote);
                a.checklist[idx].state = CandidatePairState::Succeeded;
                a.set_selected_pair(idx);
                a.pending_binding_requests.push(BindingRequest {
                    timestamp: Instant::now(),
                    transaction_id: TransactionId::new(),
                    destination: "10.0.0.2:2000".parse().unwrap(),
                    is_use_candidate: false,
                });
            })
            .await
            .unwrap();

        let (old_ufrag, _) = agent.get_local_user_credentials().await.unwrap();
        assert!(agent.get_selected_candidate_pair().is_some());

        agent.restart(String::new(), String::new()).await.unwrap();

        let (new_ufrag, _) = agent.get_local_user_credentials().await.unwrap();
        assert_ne!(old_ufrag, new_ufrag);
        assert!(agent.get_selected_candidate_pair().is_none());
        assert!(agent.get_local_candidates().await.unwrap().is_empty());
        assert!(agent.get_remote_candidates().await.unwrap().is_empty());
        assert_eq!(
            agent.get_connection_state().await.unwrap(),
            ConnectionState::Checking
        );

        agent
            .run(|a| {
                assert!(a.checklist.is_empty());
                assert!(a.pending_binding_requests.is_empty());
                assert!(a.remote_ufrag.is_empty());
                assert!(a.remote_pwd.is_empty());
            })
            .await
            .unwrap();

        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_selected_pair_snapshot_is_a_copy() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();

        agent
            .run(|a| {
                let local = host("10.0.0.1:1000");
                let remote = host("10.0.0.2:2000");
                let idx = a.add_pair(local, remote);
                a.checklist[idx].state = CandidatePairState::Succeeded;
                a.set_selected_pair(idx);
            })
            .await
            .unwrap();

        let copy = agent.get_selected_candidate_pair().unwrap();
        assert!(copy.nominated);
        assert_eq!(
            agent.get_connection_state().await.unwrap(),
            ConnectionState::Connected
        );

        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_transition_clears_everything() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();

        agent
            .run(|a| {
                let local = host("10.0.0.1:1000");
                let remote = host("10.0.0.2:2000");
                a.local_candidates
                    .entry(NetworkType::Udp4)
                    .or_default()
                    .push(local.clone());
                a.remote_candidates
                    .entry(NetworkType::Udp4)
                    .or_default()
                    .push(remote.clone());
                let idx = a.add_pair(local, remote);
                a.checklist[idx].state = CandidatePairState::Succeeded;
                a.set_selected_pair(idx);

                a.update_connection_state(ConnectionState::Failed);

                assert!(a.checklist.is_empty());
                assert!(a.pending_binding_requests.is_empty());
                assert!(a.get_selected_pair().is_none());
                assert!(a.local_candidates.is_empty());
                assert!(a.remote_candidates.is_empty());
            })
            .await
            .unwrap();

        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_after_run_hooks_drain_in_order() {
        let agent = Agent::new(AgentConfig::default()).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_in_task = order.clone();
        agent
            .run(move |a| {
                let first = order_in_task.clone();
                let second = order_in_task.clone();
                a.register_after_run(Box::new(move |_| first.lock().push(1)));
                a.register_after_run(Box::new(move |_| second.lock().push(2)));
                order_in_task.lock().push(0);
            })
            .await
            .unwrap();

        // Hooks ran after the task body, in registration order
        agent.run(|_| {}).await.unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2]);

        agent.close().await.unwrap();
    }
}
