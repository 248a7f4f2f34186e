//! The API facade.
//!
//! Every mutating call carries a [`RequestContext`]. A successful response
//! is stored under `(caller_id, request_id)` and replayed verbatim for a
//! repeated request without touching state. The operation itself runs on
//! its own tokio task so a caller that gives up at its deadline never
//! leaves a half-applied change behind; the caller just sees `Timeout`.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use proxy_attestation::{Attestor, HeartbeatEnvelope};
use proxy_store::Store;
use proxy_types::{Clock, ErrorKind, NodeId, PhysicalTask, TaskId};

use crate::ingress::HeartbeatIngress;
use crate::lifecycle::LifecycleEngine;
use crate::registry::NodeRegistry;
use crate::requests::{
    AttestedStep, CancelTaskRequest, DeclineTaskRequest, HeartbeatAck, IssueNonceRequest,
    NodeRequest, NodeStanding, NodeView, NonceResponse, PostTaskRequest, PostTaskResponse,
    SubmitProofRequest, TaskStatus, VerifyCallbackRequest,
};
use crate::EngineError;

/// Caller identity, idempotency key and deadline of one request.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub caller_id: String,
    pub request_id: String,
    pub deadline: Instant,
}

impl RequestContext {
    pub fn new(caller_id: impl Into<String>, request_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            caller_id: caller_id.into(),
            request_id: request_id.into(),
            deadline: Instant::now() + timeout,
        }
    }
}

/// A stored response, tagged with the operation that produced it.
#[derive(Serialize, Deserialize)]
struct CachedResponse {
    op: String,
    response: serde_json::Value,
}

type InFlight = Arc<Mutex<HashSet<(String, String)>>>;

/// Marks a request as running until dropped.
struct InFlightGuard {
    set: InFlight,
    key: (String, String),
}

impl InFlightGuard {
    fn enter(set: &InFlight, ctx: &RequestContext) -> Result<Self, EngineError> {
        let key = (ctx.caller_id.clone(), ctx.request_id.clone());
        if !set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone())
        {
            return Err(EngineError::InFlight(ctx.request_id.clone()));
        }
        Ok(Self {
            set: Arc::clone(set),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// What to do when an operation reports a broken invariant.
#[derive(Clone)]
pub struct InvariantPolicy {
    store: Arc<dyn Store>,
    abort: bool,
}

impl InvariantPolicy {
    pub fn new(store: Arc<dyn Store>, abort: bool) -> Self {
        Self { store, abort }
    }

    /// Flush the store and abort if `result` is an invariant violation and
    /// aborting is enabled. Otherwise pass `result` through.
    pub fn check<T>(&self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(e) = &result {
            if e.kind() == ErrorKind::InternalInvariantViolated {
                tracing::error!(error = %e, "internal invariant violated");
                if let Err(flush) = self.store.flush() {
                    tracing::error!(error = %flush, "flush after invariant violation failed");
                }
                if self.abort {
                    std::process::abort();
                }
            }
        }
        result
    }
}

pub struct ProxyApi {
    lifecycle: Arc<LifecycleEngine>,
    ingress: Arc<HeartbeatIngress>,
    registry: Arc<NodeRegistry>,
    attestor: Arc<dyn Attestor>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    operators: Vec<String>,
    nonce_ttl_secs: u64,
    in_flight: InFlight,
    invariants: InvariantPolicy,
}

impl ProxyApi {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lifecycle: Arc<LifecycleEngine>,
        ingress: Arc<HeartbeatIngress>,
        registry: Arc<NodeRegistry>,
        attestor: Arc<dyn Attestor>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        operators: Vec<String>,
        nonce_ttl_secs: u64,
        invariants: InvariantPolicy,
    ) -> Self {
        Self {
            lifecycle,
            ingress,
            registry,
            attestor,
            store,
            clock,
            operators,
            nonce_ttl_secs,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            invariants,
        }
    }

    // ── Tasks ──────────────────────────────────────────────────────────

    pub async fn post_task(
        &self,
        ctx: &RequestContext,
        req: PostTaskRequest,
    ) -> Result<PostTaskResponse, EngineError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.mutate(ctx, "post_task", async move { lifecycle.post_task(req).await })
            .await
    }

    pub async fn accept_task(
        &self,
        ctx: &RequestContext,
        req: AttestedStep,
    ) -> Result<TaskStatus, EngineError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.mutate(ctx, "accept_task", async move { lifecycle.accept_task(&req).await })
            .await
    }

    pub async fn decline_task(
        &self,
        ctx: &RequestContext,
        req: DeclineTaskRequest,
    ) -> Result<TaskStatus, EngineError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.mutate(ctx, "decline_task", async move { lifecycle.decline_task(&req).await })
            .await
    }

    pub async fn start_task(
        &self,
        ctx: &RequestContext,
        req: AttestedStep,
    ) -> Result<TaskStatus, EngineError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.mutate(ctx, "start_task", async move { lifecycle.start_task(&req).await })
            .await
    }

    pub async fn submit_proof(
        &self,
        ctx: &RequestContext,
        req: SubmitProofRequest,
    ) -> Result<TaskStatus, EngineError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.mutate(ctx, "submit_proof", async move { lifecycle.submit_proof(&req).await })
            .await
    }

    pub async fn verify_callback(
        &self,
        ctx: &RequestContext,
        req: VerifyCallbackRequest,
    ) -> Result<TaskStatus, EngineError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.mutate(ctx, "verify_callback", async move {
            lifecycle.verify_callback(&req).await
        })
        .await
    }

    pub async fn cancel_task(
        &self,
        ctx: &RequestContext,
        req: CancelTaskRequest,
    ) -> Result<TaskStatus, EngineError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        let caller = ctx.caller_id.clone();
        self.mutate(ctx, "cancel_task", async move {
            lifecycle.cancel_task(&caller, &req).await
        })
        .await
    }

    pub fn get_task(&self, task_id: &TaskId) -> Result<PhysicalTask, EngineError> {
        self.lifecycle
            .tasks()
            .get(task_id)
            .ok_or(EngineError::UnknownTask(*task_id))
    }

    /// Every task the node has been assigned, oldest first.
    pub fn list_node_tasks(&self, node_id: &NodeId) -> Result<Vec<PhysicalTask>, EngineError> {
        if !self.registry.contains(node_id) {
            return Err(EngineError::UnknownNode(*node_id));
        }
        self.invariants
            .check(self.lifecycle.tasks().tasks_for_node(node_id))
    }

    // ── Nodes ──────────────────────────────────────────────────────────

    pub async fn heartbeat(
        &self,
        ctx: &RequestContext,
        envelope: HeartbeatEnvelope,
    ) -> Result<HeartbeatAck, EngineError> {
        let ingress = Arc::clone(&self.ingress);
        let result = self
            .mutate_inner(
                ctx,
                "heartbeat",
                async move { ingress.handle(&envelope).await },
                drop_heartbeat_key,
            )
            .await;
        self.finish("heartbeat", ctx, result)
    }

    /// A challenge nonce for `node_id`, e.g. to quote over at registration.
    pub async fn issue_nonce(
        &self,
        ctx: &RequestContext,
        req: IssueNonceRequest,
    ) -> Result<NonceResponse, EngineError> {
        let attestor = Arc::clone(&self.attestor);
        let expires_at = self.clock.now().plus(self.nonce_ttl_secs);
        self.mutate(ctx, "issue_nonce", async move {
            let nonce = attestor.issue_nonce(&req.node_id)?;
            Ok(NonceResponse {
                node_id: req.node_id,
                nonce,
                expires_at,
            })
        })
        .await
    }

    pub fn get_node(&self, node_id: &NodeId) -> Result<NodeView, EngineError> {
        self.registry
            .get(node_id)
            .map(|node| NodeView::new(&node, self.clock.now()))
            .ok_or(EngineError::UnknownNode(*node_id))
    }

    /// Operator: retire a node for good.
    pub async fn retire_node(
        &self,
        ctx: &RequestContext,
        req: NodeRequest,
    ) -> Result<NodeStanding, EngineError> {
        self.require_operator(ctx)?;
        let ingress = Arc::clone(&self.ingress);
        self.mutate(ctx, "retire_node", async move {
            ingress.retire(&req.node_id).map(|n| NodeStanding::from(&n))
        })
        .await
    }

    /// Operator: reset a SUSPENDED node to the re-certification score.
    pub async fn recertify_node(
        &self,
        ctx: &RequestContext,
        req: NodeRequest,
    ) -> Result<NodeStanding, EngineError> {
        self.require_operator(ctx)?;
        let registry = Arc::clone(&self.registry);
        let clock = Arc::clone(&self.clock);
        self.mutate(ctx, "recertify_node", async move {
            registry.recertify(&req.node_id, clock.now())?;
            tracing::info!(node_id = %req.node_id, "node re-certified");
            registry
                .get(&req.node_id)
                .map(|n| NodeStanding::from(&n))
                .ok_or(EngineError::UnknownNode(req.node_id))
        })
        .await
    }

    /// Drop stored responses older than `retention_secs`.
    pub fn purge_responses(&self, retention_secs: u64) -> Result<usize, EngineError> {
        let cutoff = proxy_types::Timestamp::new(
            self.clock.now().as_secs().saturating_sub(retention_secs),
        );
        Ok(self.store.purge_responses_before(cutoff)?)
    }

    // ── Plumbing ───────────────────────────────────────────────────────

    fn require_operator(&self, ctx: &RequestContext) -> Result<(), EngineError> {
        if self.operators.iter().any(|op| *op == ctx.caller_id) {
            Ok(())
        } else {
            Err(EngineError::NotEligible(format!(
                "{} is not an operator",
                ctx.caller_id
            )))
        }
    }

    /// Run a mutating operation with idempotency, in-flight exclusion and
    /// the caller's deadline.
    async fn mutate<T, Fut>(&self, ctx: &RequestContext, op: &'static str, fut: Fut) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let result = self.mutate_inner(ctx, op, fut, |_| {}).await;
        self.finish(op, ctx, result)
    }

    fn finish<T>(
        &self,
        op: &'static str,
        ctx: &RequestContext,
        result: Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        if let Err(e) = &result {
            tracing::debug!(
                op,
                caller_id = %ctx.caller_id,
                request_id = %ctx.request_id,
                error = %e,
                "request failed"
            );
        }
        self.invariants.check(result)
    }

    async fn mutate_inner<T, Fut>(
        &self,
        ctx: &RequestContext,
        op: &'static str,
        fut: Fut,
        redact: fn(&mut serde_json::Value),
    ) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        if let Some(cached) = self.cached(ctx, op)? {
            tracing::debug!(op, request_id = %ctx.request_id, "replaying stored response");
            return Ok(cached);
        }
        let guard = InFlightGuard::enter(&self.in_flight, ctx)?;
        // A request that finished between the lookup and the guard.
        if let Some(cached) = self.cached(ctx, op)? {
            return Ok(cached);
        }

        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let (caller_id, request_id) = (ctx.caller_id.clone(), ctx.request_id.clone());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let value = fut.await?;
            let mut response = serde_json::to_value(&value)
                .map_err(|e| EngineError::Invariant(format!("encode {op} response: {e}")))?;
            redact(&mut response);
            let cached = CachedResponse {
                op: op.to_string(),
                response,
            };
            let bytes = serde_json::to_vec(&cached)
                .map_err(|e| EngineError::Invariant(format!("encode {op} response: {e}")))?;
            store.put_response(&caller_id, &request_id, &bytes, clock.now())?;
            Ok::<T, EngineError>(value)
        });

        match tokio::time::timeout_at(ctx.deadline, handle).await {
            Err(_) => Err(EngineError::Timeout),
            Ok(Err(join)) => Err(EngineError::Invariant(format!("{op} did not complete: {join}"))),
            Ok(Ok(result)) => result,
        }
    }

    fn cached<T: DeserializeOwned>(&self, ctx: &RequestContext, op: &str) -> Result<Option<T>, EngineError> {
        let Some(bytes) = self.store.get_response(&ctx.caller_id, &ctx.request_id)? else {
            return Ok(None);
        };
        let cached: CachedResponse = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Invariant(format!("stored response is unreadable: {e}")))?;
        if cached.op != op {
            return Err(EngineError::NotEligible(format!(
                "request id {} was already used for {}",
                ctx.request_id, cached.op
            )));
        }
        serde_json::from_value(cached.response)
            .map(Some)
            .map_err(|e| EngineError::Invariant(format!("stored {op} response is unreadable: {e}")))
    }
}

/// A registration ack hands out the node's heartbeat key once; replays of
/// the same request get the ack without it.
fn drop_heartbeat_key(response: &mut serde_json::Value) {
    if let Some(fields) = response.as_object_mut() {
        fields.remove("heartbeat_key");
    }
}

