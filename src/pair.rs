// src/pair.rs
//! Candidate pairs and their check states (RFC 8445 Section 6.1.2)

use std::fmt;
use std::sync::Arc;

use crate::candidate::Candidate;
use crate::priority;

/// Candidate pair state (RFC 8445 Section 6.1.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePairState {
    /// Will not be checked until unfrozen
    Frozen,
    /// Waiting for its turn in the checklist
    Waiting,
    /// A check is in flight
    InProgress,
    /// A check produced a valid response
    Succeeded,
    /// Checks exhausted without success
    Failed,
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Frozen => "frozen",
            Self::Waiting => "waiting",
            Self::InProgress => "in-progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Ordered (local, remote) candidate pair
#[derive(Clone)]
pub struct CandidatePair {
    pub local: Arc<Candidate>,
    pub remote: Arc<Candidate>,

    /// Current check state
    pub state: CandidatePairState,

    /// Set once the pair has been nominated
    pub nominated: bool,

    /// Controlled side: promote to selected when the triggered check that a
    /// USE-CANDIDATE request started later succeeds
    pub(crate) nominate_on_success: bool,

    /// Binding requests sent on this pair
    pub(crate) binding_request_count: u16,

    controlling: bool,
}

impl CandidatePair {
    /// Create a new pair in the Waiting state
    pub fn new(local: Arc<Candidate>, remote: Arc<Candidate>, controlling: bool) -> Self {
        Self {
            local,
            remote,
            state: CandidatePairState::Waiting,
            nominated: false,
            nominate_on_success: false,
            binding_request_count: 0,
            controlling,
        }
    }

    /// Pair priority (RFC 8445 Section 6.1.2.3)
    pub fn priority(&self) -> u64 {
        priority::calculate_pair_priority(
            self.controlling,
            self.local.priority(),
            self.remote.priority(),
        )
    }

    /// Pairs are identified by their endpoints
    pub fn same_endpoints(&self, local: &Candidate, remote: &Candidate) -> bool {
        self.local.equal(local) && self.remote.equal(remote)
    }
}

impl fmt::Debug for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidatePair")
            .field("local", &self.local.address())
            .field("remote", &self.remote.address())
            .field("state", &self.state)
            .field("nominated", &self.nominated)
            .field("priority", &self.priority())
            .finish()
    }
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prio {} (local, prio {}) {} <-> {} (remote, prio {})",
            self.priority(),
            self.local.priority(),
            self.local.address(),
            self.remote.address(),
            self.remote.priority(),
        )
    }
}
