//! The task lifecycle engine.
//!
//! Drives every task through OPEN -> MATCHED -> ACTIVE ->
//! PENDING_VERIFICATION -> SETTLED, plus the release and cancellation
//! edges, from API calls and from the deadline tick. Task mutations go
//! through [`TaskBook::update`], which checks each change against the
//! transition table. No task or node lock is held across an attestor or
//! escrow call: state is read, the lock released, the external call made,
//! and the change applied only if the task's `version` is still the one
//! that was read.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;

use proxy_attestation::Attestor;
use proxy_crypto::{proof_ref, verify_verdict};
use proxy_escrow::{EscrowBackend, EscrowError, RetryPolicy};
use proxy_reputation::ReputationEvent;
use proxy_types::{
    CancelReason, Clock, Decision, ErrorKind, IdSource, MatchProgress, NodeId, NodeStatus,
    PhysicalTask, ProtocolParams, TaskId, TaskState, TaskStateKind,
};

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::journal::Journal;
use crate::matcher::Matcher;
use crate::metrics::EngineMetrics;
use crate::registry::NodeRegistry;
use crate::requests::{
    AttestedStep, CancelTaskRequest, DeclineTaskRequest, PostTaskRequest, PostTaskResponse,
    SubmitProofRequest, TaskStatus, VerifyCallbackRequest,
};
use crate::settlement::Terminal;
use crate::taskbook::{TaskBook, Updated};
use crate::verifiers::VerifierPool;
use crate::EngineError;

pub struct LifecycleEngine {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) params: ProtocolParams,
    pub(crate) tasks: Arc<TaskBook>,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) matcher: Matcher,
    pub(crate) verifiers: VerifierPool,
    pub(crate) journal: Journal,
    pub(crate) escrow: Arc<dyn EscrowBackend>,
    pub(crate) retry: RetryPolicy,
    pub(crate) attestor: Arc<dyn Attestor>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdSource>,
    pub(crate) events: EventBus,
    pub(crate) metrics: Arc<EngineMetrics>,
}

impl LifecycleEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<EngineConfig>,
        tasks: Arc<TaskBook>,
        registry: Arc<NodeRegistry>,
        verifiers: VerifierPool,
        journal: Journal,
        escrow: Arc<dyn EscrowBackend>,
        attestor: Arc<dyn Attestor>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
        events: EventBus,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let params = config.params.clone();
        Self {
            retry: config.escrow_retry,
            matcher: Matcher::new(params.clone()),
            params,
            config,
            tasks,
            registry,
            verifiers,
            journal,
            escrow,
            attestor,
            clock,
            ids,
            events,
            metrics,
        }
    }

    pub fn tasks(&self) -> &TaskBook {
        &self.tasks
    }

    // ── Posting and matching ───────────────────────────────────────────

    /// Lock the bid in escrow and open the task for matching.
    pub async fn post_task(&self, req: PostTaskRequest) -> Result<PostTaskResponse, EngineError> {
        if req.bid_amount_sats.is_zero() {
            return Err(EngineError::NotEligible("bid must be positive".into()));
        }
        if req.principal_agent_id.is_empty() {
            return Err(EngineError::NotEligible("principal_agent_id is empty".into()));
        }
        if req.geofence.as_ref().is_some_and(|g| !g.is_valid()) {
            return Err(EngineError::NotEligible("geofence is out of range".into()));
        }

        let now = self.clock.now();
        let (min_tier, deadline_secs) = self.config.policy_for(&req.task_type);
        let task_id = self.ids.next_task_id();
        let expires_at = now.plus(
            self.params
                .max_task_lifetime_secs(deadline_secs)
                .saturating_add(self.params.escrow_expiry_margin_secs),
        );

        let mut intent = self.journal.begin(proxy_store::JournalOp::Post {
            task_id,
            invoice: None,
        })?;
        let amount = req.bid_amount_sats;
        let invoice = match self
            .escrow_call("create_hold", || self.escrow.create_hold(amount, expires_at))
            .await
        {
            Ok(invoice) => invoice,
            Err(e) => {
                intent.complete()?;
                return Err(e.into());
            }
        };
        intent.record(proxy_store::JournalOp::Post {
            task_id,
            invoice: Some(invoice.clone()),
        })?;

        let task = PhysicalTask {
            task_id,
            principal_agent_id: req.principal_agent_id,
            task_type: req.task_type,
            bid_amount_sats: req.bid_amount_sats,
            required_tier: req.required_tier.max(min_tier),
            geofence: req.geofence,
            metadata: req.metadata,
            state: TaskState::Open,
            escrow_invoice_id: Some(invoice.clone()),
            created_at: now,
            matched_at: None,
            active_at: None,
            // Due immediately: the first round starts below, or on the next tick.
            deadline_at: Some(now),
            settled_at: None,
            execution_deadline_secs: deadline_secs,
            double_verification: false,
            match_progress: MatchProgress::default(),
            challenge_nonce: None,
            version: 0,
        };
        self.tasks.insert(task)?;
        intent.complete()?;

        self.metrics.tasks_posted.inc();
        tracing::info!(
            task_id = %task_id,
            invoice = %invoice,
            bid = %amount,
            "task posted"
        );
        self.events.emit(EngineEvent::TaskTransitioned {
            task_id,
            from: None,
            to: TaskStateKind::Open,
        });

        if let Err(e) = self.advance_open(&task_id).await {
            if e.kind() == ErrorKind::InternalInvariantViolated {
                return Err(e);
            }
            tracing::warn!(task_id = %task_id, error = %e, "first offer round deferred to the tick");
        }

        Ok(PostTaskResponse {
            task_id,
            escrow_invoice_id: invoice,
            state: TaskStateKind::Open,
        })
    }

    /// Move an OPEN task forward: cancel it past its TTL or after the last
    /// round, or start the next offer round once the current window lapsed.
    pub async fn advance_open(&self, task_id: &TaskId) -> Result<(), EngineError> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or(EngineError::UnknownTask(*task_id))?;
        if task.state != TaskState::Open {
            return Ok(());
        }
        let now = self.clock.now();
        let ttl_end = task.created_at.plus(self.params.task_ttl_secs);
        if now >= ttl_end {
            return self.cancel_open(task_id, CancelReason::TtlExpired).await;
        }
        if task
            .match_progress
            .window_ends_at
            .is_some_and(|end| now < end)
        {
            return Ok(());
        }
        if task.match_progress.rounds_started >= self.params.max_offer_rounds {
            return self.cancel_open(task_id, CancelReason::MatchExhausted).await;
        }

        let nodes = self.registry.snapshot_all();
        let busy = self.tasks.busy_nodes();
        let batch: Vec<NodeId> = self
            .matcher
            .next_round(&task, &nodes, &busy, now)
            .iter()
            .map(|n| n.node_id)
            .collect();

        if batch.is_empty() {
            if !task.match_progress.offered.is_empty() {
                return self.cancel_open(task_id, CancelReason::MatchExhausted).await;
            }
            // Nobody has qualified yet; look again after one window.
            let retry_at = now.plus(self.params.offer_window_secs).min(ttl_end);
            self.tasks.update(task_id, |t| {
                if t.version == task.version {
                    t.match_progress.clear_round();
                    t.deadline_at = Some(retry_at);
                }
                Ok(())
            })?;
            return Ok(());
        }

        let window = self.params.offer_window_secs;
        let mut offers = Vec::with_capacity(batch.len());
        for node_id in batch {
            offers.push((node_id, self.attestor.issue_nonce_for(&node_id, window)?));
        }
        let window_ends_at = now.plus(window);
        let started = self.tasks.update(task_id, |t| {
            if t.version != task.version || t.state != TaskState::Open {
                return Ok(false);
            }
            let progress = &mut t.match_progress;
            progress.rounds_started += 1;
            progress.offered.extend(offers.iter().map(|(n, _)| *n));
            progress.current_offers = offers.clone();
            progress.window_ends_at = Some(window_ends_at);
            t.deadline_at = Some(window_ends_at.min(ttl_end));
            Ok(true)
        })?;
        if started.value {
            self.metrics.offers_made.inc_by(offers.len() as u64);
            tracing::debug!(
                task_id = %task_id,
                round = started.task.match_progress.rounds_started,
                candidates = offers.len(),
                "offer round started"
            );
            self.events.emit(EngineEvent::TaskOffered {
                task_id: *task_id,
                offers,
                window_ends_at,
            });
        }
        Ok(())
    }

    /// An offered node accepts, attesting its offer nonce.
    pub async fn accept_task(&self, req: &AttestedStep) -> Result<TaskStatus, EngineError> {
        let task = self.task(&req.task_id)?;
        let node = self
            .registry
            .get(&req.node_id)
            .ok_or(EngineError::UnknownNode(req.node_id))?;
        if task.state != TaskState::Open {
            return Err(EngineError::illegal(
                task.task_id,
                task.state.kind(),
                TaskStateKind::Matched,
            ));
        }
        let nonce = task.match_progress.offer_for(&req.node_id).ok_or_else(|| {
            EngineError::NotEligible(format!(
                "node {} holds no offer for task {} in the current round",
                req.node_id, task.task_id
            ))
        })?;
        let now = self.clock.now();
        if task
            .match_progress
            .window_ends_at
            .map_or(true, |end| now >= end)
        {
            return Err(EngineError::Stale("the offer window has closed".into()));
        }
        self.matcher
            .check_eligible(&task, &node, now)
            .map_err(EngineError::NotEligible)?;

        self.attestor
            .verify_quote(&req.node_id, &nonce, &req.attestation_quote)
            .await?;
        let start_nonce = self
            .attestor
            .issue_nonce_for(&req.node_id, self.params.match_timeout_secs)?;

        let now = self.clock.now();
        let node_id = req.node_id;
        let double = node.status == NodeStatus::Probation;
        let updated = self.tasks.update(&req.task_id, |t| {
            if t.state != TaskState::Open {
                return Err(EngineError::illegal(
                    t.task_id,
                    t.state.kind(),
                    TaskStateKind::Matched,
                ));
            }
            if t.match_progress.offer_for(&node_id) != Some(nonce) {
                return Err(EngineError::Stale("the offer round has ended".into()));
            }
            t.state = TaskState::Matched { node_id };
            t.matched_at = Some(now);
            t.deadline_at = Some(now.plus(self.params.match_timeout_secs));
            t.double_verification = double;
            t.challenge_nonce = Some(start_nonce);
            t.match_progress.clear_round();
            Ok(())
        })?;
        tracing::info!(task_id = %req.task_id, node_id = %node_id, double_verification = double, "task matched");
        self.transitioned(&updated);
        Ok(TaskStatus::from(&updated.task))
    }

    /// An offered node passes, or a matched node gives the task back. Either
    /// way the node attests the nonce it currently holds on the task.
    pub async fn decline_task(&self, req: &DeclineTaskRequest) -> Result<TaskStatus, EngineError> {
        let task = self.task(&req.task_id)?;
        let node_id = req.node_id;
        match task.state {
            TaskState::Open => {
                let nonce = task.match_progress.offer_for(&node_id).ok_or_else(|| {
                    EngineError::NotEligible(format!(
                        "node {node_id} has nothing to decline on task {}",
                        req.task_id
                    ))
                })?;
                self.attestor
                    .verify_quote(&node_id, &nonce, &req.attestation_quote)
                    .await?;

                let now = self.clock.now();
                let updated = self.tasks.update(&req.task_id, |t| {
                    if t.state != TaskState::Open || t.match_progress.offer_for(&node_id) != Some(nonce) {
                        return Err(EngineError::Stale("the offer round has ended".into()));
                    }
                    t.match_progress.current_offers.retain(|(n, _)| *n != node_id);
                    if t.match_progress.current_offers.is_empty() {
                        // Everyone passed: next round on the next tick.
                        t.match_progress.window_ends_at = Some(now);
                        t.deadline_at = Some(now);
                    }
                    Ok(())
                })?;
                tracing::debug!(task_id = %req.task_id, node_id = %node_id, "offer declined");
                Ok(TaskStatus::from(&updated.task))
            }
            TaskState::Matched { node_id: assigned } if assigned == node_id => {
                let challenge = self.challenge(&task)?;
                self.attestor
                    .verify_quote(&node_id, &challenge, &req.attestation_quote)
                    .await?;
                let task = self
                    .release(&task, node_id, ReputationEvent::Declined)
                    .await?;
                Ok(TaskStatus::from(&task))
            }
            TaskState::Matched { .. } => Err(EngineError::NotEligible(format!(
                "node {node_id} has nothing to decline on task {}",
                req.task_id
            ))),
            ref other => Err(EngineError::illegal(
                task.task_id,
                other.kind(),
                TaskStateKind::Open,
            )),
        }
    }

    /// The matched node starts work, attesting the start nonce.
    pub async fn start_task(&self, req: &AttestedStep) -> Result<TaskStatus, EngineError> {
        let task = self.task(&req.task_id)?;
        self.require_assigned(&task, &req.node_id, TaskStateKind::Matched, TaskStateKind::Active)?;
        let now = self.clock.now();
        if task.deadline_at.is_some_and(|d| now >= d) {
            return Err(EngineError::Stale("the start window has closed".into()));
        }
        let challenge = self.challenge(&task)?;
        self.attestor
            .verify_quote(&req.node_id, &challenge, &req.attestation_quote)
            .await?;
        let exec = task.execution_deadline_secs;
        let proof_nonce = self.attestor.issue_nonce_for(&req.node_id, exec)?;

        let now = self.clock.now();
        let node_id = req.node_id;
        let updated = self.tasks.update(&req.task_id, |t| {
            if t.version != task.version {
                return Err(EngineError::Stale("task changed while attesting".into()));
            }
            t.state = TaskState::Active {
                node_id,
                started_at: now,
                retries: 0,
            };
            t.active_at = Some(now);
            t.deadline_at = Some(now.plus(exec));
            t.challenge_nonce = Some(proof_nonce);
            Ok(())
        })?;
        tracing::info!(task_id = %req.task_id, node_id = %node_id, "task started");
        self.transitioned(&updated);
        Ok(TaskStatus::from(&updated.task))
    }

    /// The assigned node hands in its proof of completion.
    pub async fn submit_proof(&self, req: &SubmitProofRequest) -> Result<TaskStatus, EngineError> {
        let task = self.task(&req.task_id)?;
        self.require_assigned(
            &task,
            &req.node_id,
            TaskStateKind::Active,
            TaskStateKind::PendingVerification,
        )?;
        let TaskState::Active { retries, .. } = task.state else {
            return Err(EngineError::Invariant("active task lost its state".into()));
        };
        let now = self.clock.now();
        if task.deadline_at.is_some_and(|d| now >= d) {
            return Err(EngineError::Stale(
                "proof arrived at or after the execution deadline".into(),
            ));
        }
        let needed = if task.double_verification { 2 } else { 1 };
        if self.verifiers.len() < needed {
            return Err(EngineError::NotEligible(format!(
                "{needed} verifier(s) required, {} configured",
                self.verifiers.len()
            )));
        }
        let challenge = self.challenge(&task)?;
        self.attestor
            .verify_quote(&req.node_id, &challenge, &req.attestation_quote)
            .await?;

        let proof = proof_ref(&req.proof_blob);
        let verifier = self
            .verifiers
            .select(&req.task_id, &[])
            .ok_or_else(|| EngineError::NotEligible("no verifier available".into()))?;
        let now = self.clock.now();
        let node_id = req.node_id;
        let requested = verifier.clone();
        let updated = self.tasks.update(&req.task_id, |t| {
            if t.version != task.version {
                return Err(EngineError::Stale("task changed while attesting".into()));
            }
            t.state = TaskState::PendingVerification {
                node_id,
                proof_ref: proof,
                retries,
                requested: vec![requested],
                passes: Vec::new(),
            };
            t.deadline_at = Some(now.plus(self.params.verification_window_secs));
            t.challenge_nonce = None;
            Ok(())
        })?;
        tracing::info!(task_id = %req.task_id, verifier_id = %verifier, "proof submitted");
        self.transitioned(&updated);
        self.events.emit(EngineEvent::VerificationRequested {
            task_id: req.task_id,
            verifier_id: verifier,
            proof_ref: proof,
        });
        Ok(TaskStatus::from(&updated.task))
    }

    /// A requested verifier returns its signed verdict.
    pub async fn verify_callback(&self, req: &VerifyCallbackRequest) -> Result<TaskStatus, EngineError> {
        let key = self.verifiers.key(&req.verifier_id).ok_or_else(|| {
            EngineError::NotEligible(format!("unknown verifier {}", req.verifier_id))
        })?;
        if !verify_verdict(key, &req.task_id, req.decision, &req.verifier_id, &req.signature) {
            return Err(EngineError::BadSignature(format!(
                "verdict signature of {} does not verify",
                req.verifier_id
            )));
        }

        let task = self.task(&req.task_id)?;
        let TaskState::PendingVerification {
            node_id,
            retries,
            ref requested,
            ref passes,
            ..
        } = task.state
        else {
            let to = match req.decision {
                Decision::Retry => TaskStateKind::Active,
                Decision::Pass | Decision::Fail => TaskStateKind::Settled,
            };
            return Err(EngineError::illegal(task.task_id, task.state.kind(), to));
        };
        if !requested.contains(&req.verifier_id) || passes.contains(&req.verifier_id) {
            return Err(EngineError::NotEligible(format!(
                "verifier {} has no open request for task {}",
                req.verifier_id, req.task_id
            )));
        }
        let now = self.clock.now();
        if task.deadline_at.is_some_and(|d| now >= d) {
            return Err(EngineError::Stale("the verification window has closed".into()));
        }
        tracing::info!(
            task_id = %req.task_id,
            verifier_id = %req.verifier_id,
            decision = %req.decision,
            "verdict received"
        );

        let version = task.version;
        let still_pending = move |t: &PhysicalTask| {
            if t.version != version {
                return Err(EngineError::Stale("task changed, verdict not applied".into()));
            }
            Ok(())
        };

        match req.decision {
            Decision::Pass => {
                let needed = if task.double_verification { 2 } else { 1 };
                if passes.len() + 1 >= needed {
                    let task = self
                        .finish(&req.task_id, Terminal::Pay { node_id }, still_pending)
                        .await?;
                    return Ok(TaskStatus::from(&task));
                }
                let next = self
                    .verifiers
                    .select(&req.task_id, requested)
                    .ok_or_else(|| EngineError::NotEligible("no second verifier available".into()))?;
                let verifier_id = req.verifier_id.clone();
                let asked = next.clone();
                let window = self.params.verification_window_secs;
                let updated = self.tasks.update(&req.task_id, |t| {
                    still_pending(t)?;
                    if let TaskState::PendingVerification {
                        requested, passes, ..
                    } = &mut t.state
                    {
                        passes.push(verifier_id);
                        requested.push(asked);
                    }
                    t.deadline_at = Some(now.plus(window));
                    Ok(())
                })?;
                tracing::info!(task_id = %req.task_id, verifier_id = %next, "second verification requested");
                self.events.emit(EngineEvent::VerificationRequested {
                    task_id: req.task_id,
                    verifier_id: next,
                    proof_ref: match &updated.task.state {
                        TaskState::PendingVerification { proof_ref, .. } => *proof_ref,
                        _ => [0; 32],
                    },
                });
                Ok(TaskStatus::from(&updated.task))
            }
            Decision::Fail => {
                let task = self
                    .finish(&req.task_id, Terminal::Dispute, still_pending)
                    .await?;
                Ok(TaskStatus::from(&task))
            }
            Decision::Retry if retries >= self.params.max_verification_retries => {
                tracing::info!(task_id = %req.task_id, "retry budget spent, verdict treated as FAIL");
                let task = self
                    .finish(&req.task_id, Terminal::Dispute, still_pending)
                    .await?;
                Ok(TaskStatus::from(&task))
            }
            Decision::Retry => {
                let exec = task.execution_deadline_secs;
                let proof_nonce = self.attestor.issue_nonce_for(&node_id, exec)?;
                let updated = self.tasks.update(&req.task_id, |t| {
                    still_pending(t)?;
                    t.state = TaskState::Active {
                        node_id,
                        started_at: now,
                        retries: retries + 1,
                    };
                    t.active_at = Some(now);
                    t.deadline_at = Some(now.plus(exec));
                    t.challenge_nonce = Some(proof_nonce);
                    Ok(())
                })?;
                self.transitioned(&updated);
                Ok(TaskStatus::from(&updated.task))
            }
        }
    }

    /// Cancel on behalf of `caller_id`: the principal before the task is
    /// matched, an operator in any non-terminal state.
    pub async fn cancel_task(
        &self,
        caller_id: &str,
        req: &CancelTaskRequest,
    ) -> Result<TaskStatus, EngineError> {
        let task = self.task(&req.task_id)?;
        let operator = self.config.operators.iter().any(|op| op == caller_id);
        let reason = if operator {
            CancelReason::OperatorIntervention
        } else if caller_id == task.principal_agent_id {
            CancelReason::PrincipalCancelled
        } else {
            return Err(EngineError::NotEligible(format!(
                "{caller_id} may not cancel task {}",
                req.task_id
            )));
        };
        let allowed = move |t: &PhysicalTask| {
            let from = t.state.kind();
            if from.is_terminal() {
                return Err(EngineError::illegal(t.task_id, from, TaskStateKind::Cancelled));
            }
            if reason == CancelReason::PrincipalCancelled && from != TaskStateKind::Open {
                return Err(EngineError::NotEligible(format!(
                    "task {} is {from}; the principal may only cancel OPEN tasks",
                    t.task_id
                )));
            }
            Ok(())
        };
        allowed(&task)?;
        let task = self
            .finish(&req.task_id, Terminal::Cancel(reason), allowed)
            .await?;
        Ok(TaskStatus::from(&task))
    }

    // ── Deadlines ──────────────────────────────────────────────────────

    /// Handle a task whose deadline came due.
    pub async fn on_deadline(&self, task_id: &TaskId) -> Result<(), EngineError> {
        let Some(task) = self.tasks.get(task_id) else {
            return Ok(());
        };
        if self.tasks.is_settling(task_id) {
            tracing::debug!(task_id = %task_id, "deadline deferred behind a pending settlement");
            return Ok(());
        }
        let now = self.clock.now();
        if task.deadline_at.map_or(true, |d| now < d) {
            return Ok(());
        }
        match task.state {
            TaskState::Open => self.advance_open(task_id).await,
            TaskState::Matched { node_id } => {
                tracing::info!(task_id = %task_id, node_id = %node_id, "start window lapsed");
                self.release(&task, node_id, ReputationEvent::Declined)
                    .await
                    .map(drop)
            }
            TaskState::Active { node_id, .. } => {
                tracing::info!(task_id = %task_id, node_id = %node_id, "execution deadline missed");
                self.release(&task, node_id, ReputationEvent::Flake)
                    .await
                    .map(drop)
            }
            TaskState::PendingVerification { .. } => {
                let version = task.version;
                self.finish(
                    task_id,
                    Terminal::Cancel(CancelReason::VerificationTimeout),
                    move |t| {
                        if t.version != version {
                            return Err(EngineError::Stale("verdict arrived first".into()));
                        }
                        Ok(())
                    },
                )
                .await
                .map(drop)
            }
            TaskState::Settled(_) | TaskState::Cancelled(_) => Ok(()),
        }
    }

    /// One pass of the deadline driver: replay the journal, then run every
    /// due task's handler concurrently.
    ///
    /// Handler failures are logged and the task re-indexed so the next
    /// tick retries it. Only an invariant violation is returned.
    pub async fn tick(self: &Arc<Self>) -> Result<usize, EngineError> {
        if let Err(e) = self.replay_journal().await {
            if e.kind() == ErrorKind::InternalInvariantViolated {
                return Err(e);
            }
            tracing::warn!(error = %e, "journal replay incomplete");
        }

        let due = self.tasks.pop_due(self.clock.now());
        let count = due.len();
        let mut handlers = JoinSet::new();
        for task_id in due {
            let engine = Arc::clone(self);
            handlers.spawn(async move {
                let result = engine.on_deadline(&task_id).await;
                engine.tasks.reindex(&task_id);
                (task_id, result)
            });
        }

        let mut fatal = None;
        while let Some(joined) = handlers.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((task_id, Err(e))) if e.kind() == ErrorKind::InternalInvariantViolated => {
                    tracing::error!(task_id = %task_id, error = %e, "deadline handler broke an invariant");
                    fatal.get_or_insert(e);
                }
                Ok((task_id, Err(e))) => {
                    tracing::warn!(task_id = %task_id, error = %e, "deadline handler failed, will retry");
                }
                Err(e) => {
                    tracing::error!(error = %e, "deadline handler panicked");
                    fatal.get_or_insert(EngineError::Invariant(format!("deadline handler panicked: {e}")));
                }
            }
        }
        self.metrics.open_tasks.set(self.tasks.open_count() as i64);
        match fatal {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    // ── Helpers ────────────────────────────────────────────────────────

    /// Return an assigned task to OPEN and charge the node.
    async fn release(
        &self,
        task: &PhysicalTask,
        node_id: NodeId,
        event: ReputationEvent,
    ) -> Result<PhysicalTask, EngineError> {
        let now = self.clock.now();
        let version = task.version;
        let updated = self.tasks.update(&task.task_id, |t| {
            if t.version != version {
                return Err(EngineError::Stale("task changed before release".into()));
            }
            t.state = TaskState::Open;
            t.matched_at = None;
            t.active_at = None;
            t.challenge_nonce = None;
            t.double_verification = false;
            t.deadline_at = Some(now);
            t.match_progress.clear_round();
            Ok(())
        })?;
        let change = self.registry.update_reputation(&node_id, event, now)?;
        tracing::info!(
            task_id = %task.task_id,
            node_id = %node_id,
            reason = %event,
            reputation = change.after,
            "assignment released"
        );
        self.transitioned(&updated);

        if let Err(e) = self.advance_open(&task.task_id).await {
            if e.kind() == ErrorKind::InternalInvariantViolated {
                return Err(e);
            }
            tracing::warn!(task_id = %task.task_id, error = %e, "re-offer deferred to the tick");
        }
        Ok(self.tasks.get(&task.task_id).unwrap_or(updated.task))
    }

    async fn cancel_open(&self, task_id: &TaskId, reason: CancelReason) -> Result<(), EngineError> {
        self.finish(task_id, Terminal::Cancel(reason), |t| {
            if t.state != TaskState::Open {
                return Err(EngineError::Stale("task left OPEN".into()));
            }
            Ok(())
        })
        .await
        .map(drop)
    }

    fn task(&self, task_id: &TaskId) -> Result<PhysicalTask, EngineError> {
        self.tasks
            .get(task_id)
            .ok_or(EngineError::UnknownTask(*task_id))
    }

    /// Check that `task` is in `expected` and held by `node_id`.
    fn require_assigned(
        &self,
        task: &PhysicalTask,
        node_id: &NodeId,
        expected: TaskStateKind,
        to: TaskStateKind,
    ) -> Result<(), EngineError> {
        let from = task.state.kind();
        if from != expected {
            return Err(EngineError::illegal(task.task_id, from, to));
        }
        if task.assigned_node_id() != Some(*node_id) {
            return Err(EngineError::NotEligible(format!(
                "task {} is not assigned to node {node_id}",
                task.task_id
            )));
        }
        Ok(())
    }

    fn challenge(&self, task: &PhysicalTask) -> Result<proxy_types::Nonce, EngineError> {
        task.challenge_nonce.ok_or_else(|| {
            EngineError::Invariant(format!("task {} has no challenge nonce", task.task_id))
        })
    }

    pub(crate) fn transitioned<R>(&self, updated: &Updated<R>) {
        if updated.transitioned() {
            self.events.emit(EngineEvent::TaskTransitioned {
                task_id: updated.task.task_id,
                from: Some(updated.from),
                to: updated.task.state.kind(),
            });
        }
    }

    /// Run an escrow call under the retry policy, recording latency and
    /// retries.
    pub(crate) async fn escrow_call<T, F, Fut>(&self, name: &str, op: F) -> Result<T, EscrowError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EscrowError>>,
    {
        let started = Instant::now();
        let result = self
            .retry
            .run(name, op, |_, _| self.metrics.escrow_retries.inc())
            .await;
        self.metrics
            .escrow_call_ms
            .observe(started.elapsed().as_secs_f64() * 1_000.0);
        result
    }
}
