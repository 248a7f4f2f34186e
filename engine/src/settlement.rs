//! Terminal transitions and journal replay.
//!
//! Settling or cancelling a task takes the task's settlement claim,
//! journals the intent, calls the escrow backend with no lock held, and
//! only then moves the task to its terminal state. If the backend stays
//! down the task is left untouched and the journal entry pending; the task
//! stays frozen against every other transition until the next replay
//! finishes it. An invoice that turns out to be terminal already is
//! accepted when its status matches the intended outcome.

use proxy_escrow::{EscrowError, HoldStatus};
use proxy_reputation::ReputationEvent;
use proxy_store::{JournalOp, RefundTarget};
use proxy_types::{
    CancelReason, ErrorKind, InvoiceId, NodeId, PhysicalTask, SettlementOutcome, TaskId,
    TaskState, TaskStateKind,
};

use crate::journal::JournalGuard;
use crate::lifecycle::LifecycleEngine;
use crate::taskbook::TaskClaim;
use crate::EngineError;

/// How a task leaves the lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminal {
    /// Verified: pay the node.
    Pay { node_id: NodeId },
    /// Failed verification: refund the principal.
    Dispute,
    Cancel(CancelReason),
}

impl Terminal {
    pub fn kind(&self) -> TaskStateKind {
        match self {
            Self::Pay { .. } | Self::Dispute => TaskStateKind::Settled,
            Self::Cancel(_) => TaskStateKind::Cancelled,
        }
    }

    fn state(&self) -> TaskState {
        match *self {
            Self::Pay { node_id } => TaskState::Settled(SettlementOutcome::Success { node_id }),
            Self::Dispute => TaskState::Settled(SettlementOutcome::Disputed),
            Self::Cancel(reason) => TaskState::Cancelled(reason),
        }
    }

    fn journal_op(&self, task_id: TaskId, invoice: InvoiceId) -> JournalOp {
        match *self {
            Self::Pay { node_id } => JournalOp::Settle {
                task_id,
                invoice,
                payee: node_id,
            },
            Self::Dispute => JournalOp::Refund {
                task_id,
                invoice,
                target: RefundTarget::Disputed,
            },
            Self::Cancel(reason) => JournalOp::Refund {
                task_id,
                invoice,
                target: RefundTarget::Cancelled(reason),
            },
        }
    }

    fn from_op(op: &JournalOp) -> Option<(Self, InvoiceId)> {
        match op {
            JournalOp::Post { .. } => None,
            JournalOp::Settle { invoice, payee, .. } => {
                Some((Self::Pay { node_id: *payee }, invoice.clone()))
            }
            JournalOp::Refund {
                invoice,
                target: RefundTarget::Disputed,
                ..
            } => Some((Self::Dispute, invoice.clone())),
            JournalOp::Refund {
                invoice,
                target: RefundTarget::Cancelled(reason),
                ..
            } => Some((Self::Cancel(*reason), invoice.clone())),
        }
    }

    /// Whether a terminal invoice status is the one this outcome produces.
    fn matches(&self, status: HoldStatus) -> bool {
        match self {
            Self::Pay { .. } => status == HoldStatus::Settled,
            Self::Dispute | Self::Cancel(_) => {
                matches!(status, HoldStatus::Cancelled | HoldStatus::Expired)
            }
        }
    }
}

impl LifecycleEngine {
    /// Move a task to a terminal state, settling or cancelling its invoice.
    ///
    /// `validate` runs on the task as read under the settlement claim and
    /// can refuse the transition (e.g. because the task changed since the
    /// caller looked at it).
    pub(crate) async fn finish(
        &self,
        task_id: &TaskId,
        terminal: Terminal,
        validate: impl Fn(&PhysicalTask) -> Result<(), EngineError> + Send,
    ) -> Result<PhysicalTask, EngineError> {
        let claim = self.tasks.claim(task_id)?;
        let task = self
            .tasks
            .get(task_id)
            .ok_or(EngineError::UnknownTask(*task_id))?;
        validate(&task)?;
        let from = task.state.kind();
        if !from.can_transition_to(terminal.kind()) {
            return Err(EngineError::illegal(*task_id, from, terminal.kind()));
        }
        if self.journal.has_pending_for(task_id)? {
            return Err(EngineError::Busy(*task_id));
        }
        let invoice = task.escrow_invoice_id.clone().ok_or_else(|| {
            EngineError::Invariant(format!("task {task_id} has no escrow invoice"))
        })?;
        let intent = self.journal.begin(terminal.journal_op(*task_id, invoice.clone()))?;
        self.tasks.mark_settling(task_id);
        self.execute(claim, intent, terminal, invoice).await
    }

    /// Carry out a journalled settlement under its task's claim.
    async fn execute(
        &self,
        claim: TaskClaim<'_>,
        intent: JournalGuard<'_>,
        terminal: Terminal,
        invoice: InvoiceId,
    ) -> Result<PhysicalTask, EngineError> {
        let task_id = claim.task_id();
        let result = match terminal {
            Terminal::Pay { node_id } => {
                self.escrow_call("settle", || self.escrow.settle(&invoice, &node_id))
                    .await
            }
            Terminal::Dispute | Terminal::Cancel(_) => {
                self.escrow_call("cancel", || self.escrow.cancel(&invoice))
                    .await
            }
        };
        match result {
            Ok(()) => {}
            Err(EscrowError::AlreadyTerminal(_)) => {
                let status = self.escrow.status(&invoice).await?;
                if !terminal.matches(status) {
                    return Err(EngineError::Invariant(format!(
                        "invoice {invoice} of task {task_id} is {status}, expected {:?}",
                        terminal
                    )));
                }
                tracing::warn!(task_id = %task_id, invoice = %invoice, status = %status, "invoice already terminal");
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %task_id,
                    invoice = %invoice,
                    seq = intent.seq(),
                    error = %e,
                    "escrow call failed, intent left for replay"
                );
                return Err(e.into());
            }
        }

        let now = self.clock.now();
        let updated = self.tasks.update_claimed(&claim, |t| {
            if t.state.is_terminal() {
                return Ok(None);
            }
            let assigned = t.assigned_node_id();
            t.state = terminal.state();
            t.settled_at = Some(now);
            t.deadline_at = None;
            t.challenge_nonce = None;
            t.match_progress.clear_round();
            Ok(Some(assigned))
        })?;
        drop(claim);

        if let Some(assigned) = updated.value {
            match terminal {
                Terminal::Pay { node_id } => {
                    let bid = updated.task.bid_amount_sats;
                    self.registry
                        .update_reputation(&node_id, ReputationEvent::Pass { bid }, now)?;
                    self.metrics.tasks_settled.inc();
                }
                Terminal::Dispute => {
                    if let Some(node_id) = assigned {
                        self.registry
                            .update_reputation(&node_id, ReputationEvent::Fail, now)?;
                    }
                    self.metrics.tasks_disputed.inc();
                }
                Terminal::Cancel(_) => self.metrics.tasks_cancelled.inc(),
            }
            tracing::info!(
                task_id = %task_id,
                invoice = %invoice,
                outcome = ?terminal,
                "task reached terminal state"
            );
            self.transitioned(&updated);
        }
        intent.complete()?;
        self.tasks.clear_settling(&task_id);
        Ok(updated.task)
    }

    /// Complete or compensate every journal entry no running operation
    /// owns. Returns the number of settlements finished by replay.
    pub async fn replay_journal(&self) -> Result<usize, EngineError> {
        let mut replayed = 0;
        for entry in self.journal.pending()? {
            let Some(intent) = self.journal.resume(entry) else {
                continue;
            };
            let op = intent.op().clone();
            let task_id = op.task_id();
            match op {
                JournalOp::Post { invoice: None, .. } => intent.complete()?,
                JournalOp::Post {
                    invoice: Some(invoice),
                    ..
                } => {
                    if self.tasks.get(&task_id).is_none() {
                        match self
                            .escrow_call("cancel", || self.escrow.cancel(&invoice))
                            .await
                        {
                            Ok(()) | Err(EscrowError::AlreadyTerminal(_)) => {
                                tracing::info!(task_id = %task_id, invoice = %invoice, "cancelled orphaned hold");
                            }
                            Err(e) => {
                                tracing::warn!(invoice = %invoice, error = %e, "orphaned hold not cancelled yet");
                                continue;
                            }
                        }
                    }
                    intent.complete()?;
                    self.metrics.journal_replays.inc();
                }
                JournalOp::Settle { .. } | JournalOp::Refund { .. } => {
                    let claim = match self.tasks.claim(&task_id) {
                        Ok(claim) => claim,
                        Err(EngineError::Busy(_)) => continue,
                        Err(e) => return Err(e),
                    };
                    match self.tasks.get(&task_id) {
                        Some(task) if !task.state.is_terminal() => {
                            self.tasks.mark_settling(&task_id);
                        }
                        Some(_) => {
                            intent.complete()?;
                            self.tasks.clear_settling(&task_id);
                            continue;
                        }
                        None => {
                            return Err(EngineError::Invariant(format!(
                                "journal names unknown task {task_id}"
                            )));
                        }
                    }
                    let Some((terminal, invoice)) = Terminal::from_op(intent.op()) else {
                        continue;
                    };
                    match self.execute(claim, intent, terminal, invoice).await {
                        Ok(_) => {
                            replayed += 1;
                            self.metrics.journal_replays.inc();
                            tracing::info!(task_id = %task_id, "journal entry replayed");
                        }
                        Err(e) if e.kind() == ErrorKind::InternalInvariantViolated => return Err(e),
                        Err(e) => {
                            tracing::debug!(task_id = %task_id, error = %e, "journal replay deferred");
                        }
                    }
                }
            }
        }
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_types::NodeId;

    #[test]
    fn outcomes_match_invoice_status() {
        let pay = Terminal::Pay {
            node_id: NodeId::new([1; 16]),
        };
        assert!(pay.matches(HoldStatus::Settled));
        assert!(!pay.matches(HoldStatus::Cancelled));
        assert!(Terminal::Dispute.matches(HoldStatus::Expired));
        assert!(Terminal::Cancel(CancelReason::TtlExpired).matches(HoldStatus::Cancelled));
        assert!(!Terminal::Dispute.matches(HoldStatus::Settled));
    }

    #[test]
    fn journal_ops_round_trip() {
        let task_id = TaskId::new([3; 16]);
        for terminal in [
            Terminal::Pay {
                node_id: NodeId::new([1; 16]),
            },
            Terminal::Dispute,
            Terminal::Cancel(CancelReason::VerificationTimeout),
        ] {
            let op = terminal.journal_op(task_id, InvoiceId::new("inv-9"));
            let (back, invoice) = Terminal::from_op(&op).unwrap();
            assert_eq!(back, terminal);
            assert_eq!(invoice, InvoiceId::new("inv-9"));
        }
        assert!(Terminal::from_op(&JournalOp::Post {
            task_id,
            invoice: None
        })
        .is_none());
    }
}
