//! The physical task model and its state machine vocabulary.
//!
//! [`TaskState`] is a tagged variant: each state carries only the fields that
//! are legal in it, so "assigned node present iff MATCHED/ACTIVE/
//! PENDING_VERIFICATION/SETTLED(success)" holds by construction.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::amount::Sats;
use crate::geo::Geofence;
use crate::ids::{InvoiceId, NodeId, Nonce, TaskId, VerifierId};
use crate::state::Tier;
use crate::time::Timestamp;

/// A verifier's verdict on a submitted proof.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Pass,
    Fail,
    Retry,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Retry => "RETRY",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a settled task ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementOutcome {
    /// Verified; escrow paid to the node.
    Success { node_id: NodeId },
    /// A verifier failed the proof; escrow refunded to the principal.
    Disputed,
}

/// Why a task was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// The principal withdrew the task before it was matched.
    PrincipalCancelled,
    /// An operator stopped the task.
    OperatorIntervention,
    /// Every offer round lapsed without an acceptance.
    MatchExhausted,
    /// The task stayed OPEN past its time-to-live.
    TtlExpired,
    /// No verdict arrived inside the verification window.
    VerificationTimeout,
}

/// The state of a task, carrying only the fields legal in that state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Open,
    Matched {
        node_id: NodeId,
    },
    Active {
        node_id: NodeId,
        started_at: Timestamp,
        /// RETRY verdicts already consumed by earlier submissions.
        retries: u8,
    },
    PendingVerification {
        node_id: NodeId,
        /// Blake2b-256 of the opaque proof blob.
        proof_ref: [u8; 32],
        /// RETRY verdicts already consumed.
        retries: u8,
        /// Verifiers asked for a verdict, in request order.
        requested: Vec<VerifierId>,
        /// Verifiers that returned PASS.
        passes: Vec<VerifierId>,
    },
    Settled(SettlementOutcome),
    Cancelled(CancelReason),
}

/// Discriminant of [`TaskState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStateKind {
    Open,
    Matched,
    Active,
    PendingVerification,
    Settled,
    Cancelled,
}

/// Every legal `(from, to)` pair of the task state machine.
const TRANSITIONS: &[(TaskStateKind, TaskStateKind)] = &[
    (TaskStateKind::Open, TaskStateKind::Matched),
    (TaskStateKind::Open, TaskStateKind::Cancelled),
    (TaskStateKind::Matched, TaskStateKind::Active),
    (TaskStateKind::Matched, TaskStateKind::Open),
    (TaskStateKind::Matched, TaskStateKind::Cancelled),
    (TaskStateKind::Active, TaskStateKind::PendingVerification),
    (TaskStateKind::Active, TaskStateKind::Open),
    (TaskStateKind::Active, TaskStateKind::Cancelled),
    (TaskStateKind::PendingVerification, TaskStateKind::Settled),
    (TaskStateKind::PendingVerification, TaskStateKind::Active),
    (TaskStateKind::PendingVerification, TaskStateKind::Cancelled),
];

impl TaskStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Matched => "MATCHED",
            Self::Active => "ACTIVE",
            Self::PendingVerification => "PENDING_VERIFICATION",
            Self::Settled => "SETTLED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Cancelled)
    }

    /// Whether `self -> to` is a row of the transition table.
    pub fn can_transition_to(&self, to: TaskStateKind) -> bool {
        TRANSITIONS.contains(&(*self, to))
    }
}

impl fmt::Display for TaskStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TaskState {
    pub fn kind(&self) -> TaskStateKind {
        match self {
            Self::Open => TaskStateKind::Open,
            Self::Matched { .. } => TaskStateKind::Matched,
            Self::Active { .. } => TaskStateKind::Active,
            Self::PendingVerification { .. } => TaskStateKind::PendingVerification,
            Self::Settled(_) => TaskStateKind::Settled,
            Self::Cancelled(_) => TaskStateKind::Cancelled,
        }
    }

    /// The node currently holding the task, if any.
    pub fn assigned_node(&self) -> Option<NodeId> {
        match self {
            Self::Matched { node_id }
            | Self::Active { node_id, .. }
            | Self::PendingVerification { node_id, .. }
            | Self::Settled(SettlementOutcome::Success { node_id }) => Some(*node_id),
            Self::Open | Self::Settled(SettlementOutcome::Disputed) | Self::Cancelled(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

/// Progress of the matcher's offer rounds for one task.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchProgress {
    /// Rounds started so far (persists across MATCHED -> OPEN releases).
    pub rounds_started: u8,
    /// Every node ever offered or assigned this task.
    pub offered: Vec<NodeId>,
    /// Offers of the current round, each with the nonce the node must attest.
    pub current_offers: Vec<(NodeId, Nonce)>,
    /// End of the current round's acceptance window.
    pub window_ends_at: Option<Timestamp>,
}

impl MatchProgress {
    /// The nonce offered to `node_id` in the current round.
    pub fn offer_for(&self, node_id: &NodeId) -> Option<Nonce> {
        self.current_offers
            .iter()
            .find(|(n, _)| n == node_id)
            .map(|(_, nonce)| *nonce)
    }

    pub fn clear_round(&mut self) {
        self.current_offers.clear();
        self.window_ends_at = None;
    }
}

/// A physical-world task posted by an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhysicalTask {
    pub task_id: TaskId,
    pub principal_agent_id: String,
    pub task_type: String,
    pub bid_amount_sats: Sats,
    pub required_tier: Tier,
    pub geofence: Option<Geofence>,
    /// Opaque encrypted payload, never inspected.
    pub metadata: Vec<u8>,
    pub state: TaskState,
    pub escrow_invoice_id: Option<InvoiceId>,
    pub created_at: Timestamp,
    pub matched_at: Option<Timestamp>,
    pub active_at: Option<Timestamp>,
    /// Next SLA deadline for the current state.
    pub deadline_at: Option<Timestamp>,
    pub settled_at: Option<Timestamp>,
    /// Execution deadline of this task's type, seconds.
    pub execution_deadline_secs: u64,
    /// Assigned to a PROBATION node: settlement needs two PASS verdicts.
    pub double_verification: bool,
    pub match_progress: MatchProgress,
    /// Nonce the assigned node must attest for its next step.
    pub challenge_nonce: Option<Nonce>,
    /// Bumped on every persisted change.
    pub version: u64,
}

impl PhysicalTask {
    pub fn assigned_node_id(&self) -> Option<NodeId> {
        self.state.assigned_node()
    }

    /// Structural invariants that must hold after every transition.
    pub fn check_invariants(&self) -> Result<(), String> {
        if !self.state.is_terminal() && self.escrow_invoice_id.is_none() {
            return Err(format!(
                "task {} in {} has no escrow invoice",
                self.task_id,
                self.state.kind()
            ));
        }
        if self.bid_amount_sats.is_zero() {
            return Err(format!("task {} has a zero bid", self.task_id));
        }
        match self.state.kind() {
            TaskStateKind::Matched | TaskStateKind::Active | TaskStateKind::PendingVerification
                if self.deadline_at.is_none() =>
            {
                Err(format!(
                    "task {} in {} has no deadline",
                    self.task_id,
                    self.state.kind()
                ))
            }
            TaskStateKind::Settled | TaskStateKind::Cancelled if self.deadline_at.is_some() => {
                Err(format!("terminal task {} still has a deadline", self.task_id))
            }
            _ => Ok(()),
        }
    }
}
