//! Shared wiring for the engine integration tests: an engine built from
//! nullables, with helpers that act as nodes, principals and verifiers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;

use proxy_attestation::{HeartbeatEnvelope, KeyRing, TpmAttestor};
use proxy_crypto::{sign_verdict, HeartbeatKey};
use proxy_engine::{
    AttestedStep, DeclineTaskRequest, Engine, EngineConfig, EngineDeps, EngineError, HeartbeatAck,
    IssueNonceRequest,
    PostTaskRequest, PostTaskResponse, ProxyApi, RequestContext, SubmitProofRequest, TaskStatus,
    VerifyCallbackRequest,
};
use proxy_escrow::RetryPolicy;
use proxy_nullables::{NullClock, NullDevice, NullEscrow, NullIds, NullQuoteEngine, NullStore};
use proxy_store::Store;
use proxy_types::{
    Clock, Decision, ErrorKind, Node, NodeId, Nonce, PhysicalTask, Sats, TaskId, TaskState, Tier, Timestamp,
    VerifierId,
};

pub const ROOT: [u8; 32] = [7; 32];
pub const T0: u64 = 1_700_000_000;
pub const OPERATOR: &str = "ops";

pub struct Harness {
    pub engine: Engine,
    pub api: Arc<ProxyApi>,
    pub clock: Arc<NullClock>,
    pub escrow: Arc<NullEscrow>,
    pub quotes: Arc<NullQuoteEngine>,
    pub store: Arc<dyn Store>,
    pub verifiers: Vec<(VerifierId, SigningKey)>,
    requests: AtomicU64,
}

/// A config with `verifiers` verifier keys and fast escrow retries.
pub fn test_config(verifiers: usize) -> (EngineConfig, Vec<(VerifierId, SigningKey)>) {
    let mut config = EngineConfig {
        abort_on_invariant_violation: false,
        escrow_retry: RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            max_attempts: 3,
        },
        operators: vec![OPERATOR.to_string()],
        ..EngineConfig::default()
    };
    let keys: Vec<(VerifierId, SigningKey)> = (0..verifiers)
        .map(|i| {
            let id = VerifierId::new(format!("verifier-{}", i + 1));
            (id, SigningKey::from_bytes(&[100 + i as u8; 32]))
        })
        .collect();
    for (id, key) in &keys {
        config.verifiers.insert(
            id.as_str().to_string(),
            hex::encode(key.verifying_key().as_bytes()),
        );
    }
    (config, keys)
}

impl Harness {
    pub async fn new(configure: impl FnOnce(&mut EngineConfig)) -> Self {
        Self::with_parts(
            Arc::new(NullStore::new()),
            Arc::new(NullClock::new(T0)),
            Arc::new(NullEscrow::new()),
            configure,
        )
        .await
    }

    /// An engine over existing state, as after a restart.
    pub async fn with_parts(
        store: Arc<dyn Store>,
        clock: Arc<NullClock>,
        escrow: Arc<NullEscrow>,
        configure: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        let (mut config, verifiers) = test_config(2);
        configure(&mut config);
        let quotes = Arc::new(NullQuoteEngine::new());
        let attestor = Arc::new(TpmAttestor::new(
            KeyRing::new(HeartbeatKey::new(ROOT)),
            quotes.clone(),
            clock.clone(),
            &config.params,
        ));
        let engine = Engine::new(
            config,
            EngineDeps {
                store: Arc::clone(&store),
                escrow: escrow.clone(),
                attestor,
                clock: clock.clone(),
                ids: Arc::new(NullIds::new()),
            },
        )
        .expect("engine");
        engine.start().await.expect("start");
        Self {
            api: engine.api(),
            engine,
            clock,
            escrow,
            quotes,
            store,
            verifiers,
            requests: AtomicU64::new(0),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// A fresh request context for `caller`.
    pub fn ctx(&self, caller: &str) -> RequestContext {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        RequestContext::new(caller, format!("req-{n}"), Duration::from_secs(30))
    }

    // ── Nodes ──────────────────────────────────────────────────────────

    /// Register `device` at the tier its hardware attests.
    pub async fn register(&self, device: &NullDevice) -> Result<HeartbeatAck, EngineError> {
        let nonce = self
            .api
            .issue_nonce(
                &self.ctx("node"),
                IssueNonceRequest {
                    node_id: device.node_id(),
                },
            )
            .await?
            .nonce;
        let envelope = device.registration(&nonce, device.tier, self.now());
        let ack = self.api.heartbeat(&self.ctx("node"), envelope).await?;
        if let Some(key) = &ack.heartbeat_key {
            device.learn_key(key);
        }
        Ok(ack)
    }

    pub async fn beat(&self, device: &NullDevice) -> Result<HeartbeatAck, EngineError> {
        self.send(device.heartbeat(self.now())).await
    }

    pub async fn send(&self, envelope: HeartbeatEnvelope) -> Result<HeartbeatAck, EngineError> {
        self.api.heartbeat(&self.ctx("node"), envelope).await
    }

    /// Advance the clock by `secs` in steps of at most a minute, with every
    /// device in `alive` heartbeating after each step.
    pub async fn pass(&self, secs: u64, alive: &[&NullDevice]) {
        let mut left = secs;
        while left > 0 {
            let step = left.min(60);
            self.clock.advance(step);
            left -= step;
            for device in alive {
                self.beat(device).await.expect("heartbeat");
            }
        }
    }

    /// The stored node record, key material included.
    pub fn node(&self, node_id: &NodeId) -> Node {
        self.engine.registry().get(node_id).expect("node")
    }

    pub fn set_reputation(&self, node_id: &NodeId, reputation: u32) {
        let params = self.engine.config().params.clone();
        self.engine
            .registry()
            .update(node_id, |n| {
                n.reputation = reputation;
                n.status = proxy_types::NodeStatus::for_reputation(reputation, &params);
                Ok(())
            })
            .expect("update reputation");
    }

    // ── Tasks ──────────────────────────────────────────────────────────

    pub fn task_request(bid: u64, tier: Tier) -> PostTaskRequest {
        PostTaskRequest {
            principal_agent_id: "agent-a".into(),
            task_type: "delivery".into(),
            bid_amount_sats: Sats::new(bid),
            required_tier: tier,
            geofence: None,
            metadata: vec![0xAB, 0xCD],
        }
    }

    pub async fn post(&self, bid: u64, tier: Tier) -> PostTaskResponse {
        self.api
            .post_task(&self.ctx("agent-a"), Self::task_request(bid, tier))
            .await
            .expect("post task")
    }

    pub fn task(&self, task_id: &TaskId) -> PhysicalTask {
        self.api.get_task(task_id).expect("task")
    }

    pub async fn accept(&self, task_id: &TaskId, device: &NullDevice) -> Result<TaskStatus, EngineError> {
        let nonce = self
            .task(task_id)
            .match_progress
            .offer_for(&device.node_id())
            .expect("device holds an offer");
        self.api
            .accept_task(
                &self.ctx("node"),
                AttestedStep {
                    task_id: *task_id,
                    node_id: device.node_id(),
                    attestation_quote: device.quote(&nonce),
                },
            )
            .await
    }

    /// Decline an offer while the task is open, or back out once matched.
    pub async fn decline(&self, task_id: &TaskId, device: &NullDevice) -> Result<TaskStatus, EngineError> {
        let task = self.task(task_id);
        let nonce = match task.state {
            TaskState::Open => task.match_progress.offer_for(&device.node_id()),
            _ => task.challenge_nonce,
        }
        .unwrap_or(Nonce::ZERO);
        self.decline_with(task_id, device, device.quote(&nonce)).await
    }

    pub async fn decline_with(
        &self,
        task_id: &TaskId,
        device: &NullDevice,
        attestation_quote: Vec<u8>,
    ) -> Result<TaskStatus, EngineError> {
        self.api
            .decline_task(
                &self.ctx("node"),
                DeclineTaskRequest {
                    task_id: *task_id,
                    node_id: device.node_id(),
                    attestation_quote,
                },
            )
            .await
    }

    pub async fn start(&self, task_id: &TaskId, device: &NullDevice) -> Result<TaskStatus, EngineError> {
        let nonce = self.task(task_id).challenge_nonce.expect("start nonce");
        self.api
            .start_task(
                &self.ctx("node"),
                AttestedStep {
                    task_id: *task_id,
                    node_id: device.node_id(),
                    attestation_quote: device.quote(&nonce),
                },
            )
            .await
    }

    pub async fn prove(&self, task_id: &TaskId, device: &NullDevice) -> Result<TaskStatus, EngineError> {
        let nonce = self.task(task_id).challenge_nonce.expect("proof nonce");
        self.api
            .submit_proof(
                &self.ctx("node"),
                SubmitProofRequest {
                    task_id: *task_id,
                    node_id: device.node_id(),
                    proof_blob: b"delivered at the door".to_vec(),
                    attestation_quote: device.quote(&nonce),
                },
            )
            .await
    }

    /// Accept, start and prove in one go.
    pub async fn run_to_proof(&self, task_id: &TaskId, device: &NullDevice) {
        self.accept(task_id, device).await.expect("accept");
        self.start(task_id, device).await.expect("start");
        self.prove(task_id, device).await.expect("proof");
    }

    /// The verifiers the task is waiting on, in request order.
    pub fn requested(&self, task_id: &TaskId) -> Vec<VerifierId> {
        match self.task(task_id).state {
            TaskState::PendingVerification { requested, .. } => requested,
            other => panic!("task is not pending verification: {other:?}"),
        }
    }

    pub async fn verdict(
        &self,
        task_id: &TaskId,
        verifier: &VerifierId,
        decision: Decision,
    ) -> Result<TaskStatus, EngineError> {
        let (_, key) = self
            .verifiers
            .iter()
            .find(|(id, _)| id == verifier)
            .expect("known verifier");
        self.api
            .verify_callback(
                &self.ctx(verifier.as_str()),
                VerifyCallbackRequest {
                    task_id: *task_id,
                    decision,
                    verifier_id: verifier.clone(),
                    signature: sign_verdict(key, task_id, decision, verifier).to_vec(),
                },
            )
            .await
    }
}

pub fn kind<T: std::fmt::Debug>(result: Result<T, EngineError>) -> ErrorKind {
    result.expect_err("expected an error").kind()
}
