//! End-to-end lifecycle scenarios against nullable infrastructure:
//! register → post → match → accept → start → proof → verdict → settle,
//! plus the failure paths around them.

mod common;

use std::time::Duration;

use common::{kind, Harness, OPERATOR};
use hmac::{Hmac, Mac};
use proxy_crypto::{sign_heartbeat, HeartbeatKey};
use proxy_engine::{CancelTaskRequest, EngineEvent, NodeRequest, RequestContext};
use proxy_escrow::HoldStatus;
use proxy_nullables::NullDevice;
use sha2::Sha256;

use proxy_types::{
    CancelReason, Decision, ErrorKind, NodeStatus, SettlementOutcome, TaskState, TaskStateKind,
    Tier,
};

use common::ROOT;

// ---------------------------------------------------------------------------
// Scenario 1: happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn verified_task_settles_and_rewards_the_node() {
    let h = Harness::new(|_| {}).await;
    let n1 = NullDevice::new(1, Tier::SILVER, ROOT);
    let ack = h.register(&n1).await.unwrap();
    assert!(ack.registered);
    assert_eq!(ack.reputation, 500);
    let mut events = h.engine.events().subscribe();

    let posted = h.post(1_500, Tier::SILVER).await;
    let task_id = posted.task_id;
    assert_eq!(posted.state, TaskStateKind::Open);
    assert!(
        h.task(&task_id).match_progress.offer_for(&n1.node_id()).is_some(),
        "the only eligible node is offered the task"
    );

    let status = h.accept(&task_id, &n1).await.unwrap();
    assert_eq!(status.state, TaskStateKind::Matched);
    assert_eq!(status.assigned_node_id, Some(n1.node_id()));
    let status = h.start(&task_id, &n1).await.unwrap();
    assert_eq!(status.state, TaskStateKind::Active);
    let status = h.prove(&task_id, &n1).await.unwrap();
    assert_eq!(status.state, TaskStateKind::PendingVerification);

    let requested = h.requested(&task_id);
    assert_eq!(requested.len(), 1);
    let status = h.verdict(&task_id, &requested[0], Decision::Pass).await.unwrap();
    assert_eq!(status.state, TaskStateKind::Settled);

    let task = h.task(&task_id);
    assert_eq!(
        task.state,
        TaskState::Settled(SettlementOutcome::Success {
            node_id: n1.node_id()
        })
    );
    assert!(task.settled_at.is_some());
    assert_eq!(h.node(&n1.node_id()).reputation, 510);

    let hold = h.escrow.hold(&posted.escrow_invoice_id).unwrap();
    assert_eq!(hold.status, HoldStatus::Settled);
    assert_eq!(hold.payee, Some(n1.node_id()));
    assert_eq!(hold.settle_calls, 1);

    let mut saw_offer = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::TaskOffered { task_id: id, .. } = event {
            saw_offer |= id == task_id;
        }
    }
    assert!(saw_offer);

    let history = h.api.list_node_tasks(&n1.node_id()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].task_id, task_id);
}

// ---------------------------------------------------------------------------
// Scenario 2: flake, then exhausted rounds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unstarted_match_is_released_and_rounds_run_out() {
    let h = Harness::new(|c| c.params.offer_batch_size = 1).await;
    let n2 = NullDevice::new(2, Tier::GOLD, ROOT);
    let filler_a = NullDevice::new(3, Tier::GOLD, ROOT);
    let filler_b = NullDevice::new(4, Tier::GOLD, ROOT);
    for device in [&n2, &filler_a, &filler_b] {
        h.register(device).await.unwrap();
    }
    h.set_reputation(&n2.node_id(), 600);
    let alive = [&n2, &filler_a, &filler_b];

    let posted = h.post(2_000, Tier::BRONZE).await;
    let task_id = posted.task_id;
    let task = h.task(&task_id);
    assert_eq!(task.match_progress.rounds_started, 1);
    assert_eq!(task.match_progress.current_offers.len(), 1);
    assert!(task.match_progress.offer_for(&n2.node_id()).is_some());

    h.accept(&task_id, &n2).await.unwrap();

    // N2 never starts; the start window closes after five minutes.
    h.pass(299, &alive).await;
    assert_eq!(h.engine.tick().await.unwrap(), 0);
    h.pass(1, &alive).await;
    assert_eq!(h.engine.tick().await.unwrap(), 1);

    let task = h.task(&task_id);
    assert_eq!(task.state, TaskState::Open);
    assert_eq!(h.node(&n2.node_id()).reputation, 595);
    assert_eq!(task.match_progress.rounds_started, 2);
    assert!(task.match_progress.offer_for(&n2.node_id()).is_none());

    // Rounds two and three lapse unanswered.
    h.pass(30, &alive).await;
    h.engine.tick().await.unwrap();
    assert_eq!(h.task(&task_id).match_progress.rounds_started, 3);
    h.pass(30, &alive).await;
    h.engine.tick().await.unwrap();

    let task = h.task(&task_id);
    assert_eq!(task.state, TaskState::Cancelled(CancelReason::MatchExhausted));
    assert_eq!(task.match_progress.offered.len(), 3);
    let hold = h.escrow.hold(&posted.escrow_invoice_id).unwrap();
    assert_eq!(hold.status, HoldStatus::Cancelled);
    assert_eq!(hold.cancel_calls, 1);
    assert_eq!(h.node(&filler_a.node_id()).reputation, 500);
}

// ---------------------------------------------------------------------------
// Scenario 3: probation double verification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn probation_node_needs_a_second_verdict() {
    let h = Harness::new(|c| c.params.initial_reputation = 420).await;
    let n3 = NullDevice::new(5, Tier::SILVER, ROOT);
    let ack = h.register(&n3).await.unwrap();
    assert_eq!(ack.status, NodeStatus::Probation);

    let posted = h.post(1_000, Tier::SILVER).await;
    let task_id = posted.task_id;
    h.run_to_proof(&task_id, &n3).await;
    assert!(h.task(&task_id).double_verification);

    let first = h.requested(&task_id);
    assert_eq!(first.len(), 1);
    let status = h.verdict(&task_id, &first[0], Decision::Pass).await.unwrap();
    assert_eq!(status.state, TaskStateKind::PendingVerification);

    let both = h.requested(&task_id);
    assert_eq!(both.len(), 2);
    assert_ne!(both[0], both[1]);
    // The first verifier has already answered.
    assert_eq!(
        kind(h.verdict(&task_id, &both[0], Decision::Pass).await),
        ErrorKind::NotEligible
    );

    let status = h.verdict(&task_id, &both[1], Decision::Fail).await.unwrap();
    assert_eq!(status.state, TaskStateKind::Settled);
    assert_eq!(
        h.task(&task_id).state,
        TaskState::Settled(SettlementOutcome::Disputed)
    );
    assert_eq!(h.node(&n3.node_id()).reputation, 370);
    let hold = h.escrow.hold(&posted.escrow_invoice_id).unwrap();
    assert_eq!(hold.status, HoldStatus::Cancelled);
}

// ---------------------------------------------------------------------------
// Scenario 4: replayed heartbeat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replayed_heartbeat_is_stale() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(6, Tier::BRONZE, ROOT);
    h.register(&n).await.unwrap();

    h.clock.advance(5);
    let envelope = n.heartbeat(h.now());
    let ack = h.send(envelope.clone()).await.unwrap();
    assert_eq!(ack.uptime_credited, 5);
    let before = h.node(&n.node_id());

    h.clock.advance(2);
    assert_eq!(kind(h.send(envelope.clone()).await), ErrorKind::Stale);
    assert_eq!(h.node(&n.node_id()), before);

    // The same request id replays the stored ack instead.
    let ctx = h.ctx("node");
    h.clock.advance(2);
    let fresh = n.heartbeat(h.now());
    let first = h.api.heartbeat(&ctx, fresh.clone()).await.unwrap();
    let again = h.api.heartbeat(&ctx, fresh).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(first.uptime_credited, 4);
    let uptime = |node: &proxy_types::Node| node.rolling_stats.totals(h.now()).uptime_seconds;
    assert_eq!(uptime(&h.node(&n.node_id())), uptime(&before) + 4);
}

#[tokio::test]
async fn heartbeats_faster_than_once_a_second_are_rate_limited() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(7, Tier::BRONZE, ROOT);
    h.register(&n).await.unwrap();
    h.clock.advance(1);
    h.beat(&n).await.unwrap();
    h.clock.advance_millis(400);
    let envelope = n.heartbeat(proxy_types::Timestamp::new(h.now().as_secs() + 1));
    assert_eq!(kind(h.send(envelope).await), ErrorKind::RateLimited);
}

// ---------------------------------------------------------------------------
// Scenario 5: escrow outage during settlement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn settlement_survives_an_escrow_outage() {
    let h = Harness::new(|_| {}).await;
    let n1 = NullDevice::new(8, Tier::SILVER, ROOT);
    h.register(&n1).await.unwrap();
    let posted = h.post(1_500, Tier::SILVER).await;
    let task_id = posted.task_id;
    h.run_to_proof(&task_id, &n1).await;
    let verifier = h.requested(&task_id)[0].clone();

    h.escrow.set_available(false);
    let err = h
        .verdict(&task_id, &verifier, Decision::Pass)
        .await
        .expect_err("escrow is down");
    assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    assert_eq!(h.task(&task_id).state.kind(), TaskStateKind::PendingVerification);
    assert_eq!(h.node(&n1.node_id()).reputation, 500);

    // Still down: the tick keeps the intent pending.
    h.engine.tick().await.unwrap();
    assert_eq!(h.task(&task_id).state.kind(), TaskStateKind::PendingVerification);

    h.escrow.set_available(true);
    h.engine.tick().await.unwrap();
    let task = h.task(&task_id);
    assert_eq!(task.state.kind(), TaskStateKind::Settled);
    assert_eq!(h.node(&n1.node_id()).reputation, 510);

    h.engine.tick().await.unwrap();
    let hold = h.escrow.hold(&posted.escrow_invoice_id).unwrap();
    assert_eq!(hold.status, HoldStatus::Settled);
    assert_eq!(hold.settle_calls, 1);
    assert_eq!(h.node(&n1.node_id()).reputation, 510);

    // A late duplicate verdict cannot settle twice.
    assert_eq!(
        kind(h.verdict(&task_id, &verifier, Decision::Pass).await),
        ErrorKind::IllegalStateTransition
    );
    assert_eq!(h.escrow.hold(&posted.escrow_invoice_id).unwrap().settle_calls, 1);
}

#[tokio::test]
async fn transient_escrow_failures_are_retried() {
    let h = Harness::new(|_| {}).await;
    let n1 = NullDevice::new(9, Tier::SILVER, ROOT);
    h.register(&n1).await.unwrap();
    let posted = h.post(1_200, Tier::SILVER).await;
    h.run_to_proof(&posted.task_id, &n1).await;
    let verifier = h.requested(&posted.task_id)[0].clone();

    h.escrow.fail_next(2);
    let status = h
        .verdict(&posted.task_id, &verifier, Decision::Pass)
        .await
        .unwrap();
    assert_eq!(status.state, TaskStateKind::Settled);
    assert_eq!(h.escrow.hold(&posted.escrow_invoice_id).unwrap().settle_calls, 1);
    assert!(h.engine.metrics().escrow_retries.get() >= 2);
}

// ---------------------------------------------------------------------------
// Scenario 6: clock skew
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heartbeat_from_the_future_is_rejected() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(10, Tier::BRONZE, ROOT);
    h.register(&n).await.unwrap();
    let before = h.node(&n.node_id());

    h.clock.advance(1);
    let skewed = n.heartbeat(h.now().plus(300));
    assert_eq!(kind(h.send(skewed).await), ErrorKind::ClockSkew);
    assert_eq!(h.node(&n.node_id()), before);

    // The rejection consumed nothing: an honest beat still goes through.
    assert!(h.beat(&n).await.is_ok());
}

// ---------------------------------------------------------------------------
// Heartbeat keys
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registration_hands_out_the_heartbeat_key_once() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(30, Tier::SILVER, ROOT);
    let nonce = h
        .api
        .issue_nonce(
            &h.ctx("node"),
            proxy_engine::IssueNonceRequest {
                node_id: n.node_id(),
            },
        )
        .await
        .unwrap()
        .nonce;
    let ctx = h.ctx("node");
    let envelope = n.registration(&nonce, Tier::SILVER, h.now());
    let first = h.api.heartbeat(&ctx, envelope.clone()).await.unwrap();
    let key = first.heartbeat_key.clone().expect("key on the registration ack");
    assert_eq!(key.len(), 32);
    assert_eq!(
        h.node(&n.node_id()).heartbeat_secret.as_bytes().as_slice(),
        key.as_slice()
    );

    // A replay of the registration request gets the ack without the key.
    let again = h.api.heartbeat(&ctx, envelope).await.unwrap();
    assert!(again.registered);
    assert_eq!(again.heartbeat_key, None);

    n.learn_key(&key);
    h.clock.advance(1);
    assert_eq!(h.beat(&n).await.unwrap().heartbeat_key, None);

    let view = serde_json::to_value(h.api.get_node(&n.node_id()).unwrap()).unwrap();
    assert_eq!(view["reputation"], 500);
    for hidden in ["public_key", "pubkey_fingerprint", "heartbeat_secret"] {
        assert!(view.get(hidden).is_none(), "{hidden} is exposed");
    }
}

#[tokio::test]
async fn heartbeat_under_a_key_derived_from_public_data_is_rejected() {
    let h = Harness::new(|_| {}).await;
    let victim = NullDevice::new(31, Tier::SILVER, ROOT);
    h.register(&victim).await.unwrap();
    let before = h.node(&victim.node_id());

    // The root key and the victim's fingerprint are all another node has.
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&ROOT).unwrap();
    mac.update(b"proxy-node-key");
    mac.update(victim.fingerprint().as_bytes());
    let derived = HeartbeatKey::new(mac.finalize().into_bytes().into());

    h.clock.advance(1);
    for key in [derived, HeartbeatKey::new(ROOT)] {
        let mut envelope = victim.heartbeat(h.now());
        envelope.signature = sign_heartbeat(&key, &victim.node_id(), h.now()).to_vec();
        assert_eq!(kind(h.send(envelope).await), ErrorKind::BadSignature);
    }
    assert_eq!(h.node(&victim.node_id()), before);

    // Nothing advanced the watermark: the genuine beat still lands.
    assert_eq!(h.beat(&victim).await.unwrap().uptime_credited, 1);
}

#[tokio::test]
async fn nonces_requested_for_one_node_are_capped() {
    let h = Harness::new(|c| c.params.max_nonces_per_node = 2).await;
    let n = NullDevice::new(34, Tier::SILVER, ROOT);
    let request = || proxy_engine::IssueNonceRequest {
        node_id: n.node_id(),
    };
    h.api.issue_nonce(&h.ctx("spam"), request()).await.unwrap();
    h.api.issue_nonce(&h.ctx("spam"), request()).await.unwrap();
    assert_eq!(
        kind(h.api.issue_nonce(&h.ctx("spam"), request()).await),
        ErrorKind::RateLimited
    );

    // Once the outstanding nonces lapse the node can register.
    h.clock.advance(300);
    h.register(&n).await.unwrap();
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registration_cannot_claim_more_than_the_hardware_attests() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(11, Tier::BRONZE, ROOT);
    let nonce = h
        .api
        .issue_nonce(
            &h.ctx("node"),
            proxy_engine::IssueNonceRequest {
                node_id: n.node_id(),
            },
        )
        .await
        .unwrap()
        .nonce;
    let envelope = n.registration(&nonce, Tier::GOLD, h.now());
    assert_eq!(kind(h.send(envelope).await), ErrorKind::NotEligible);
    assert_eq!(kind(h.api.get_node(&n.node_id())), ErrorKind::UnknownNode);
}

#[tokio::test]
async fn heartbeat_from_an_unregistered_node_is_unknown() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(12, Tier::BRONZE, ROOT);
    assert_eq!(kind(h.beat(&n).await), ErrorKind::UnknownNode);
}

#[tokio::test]
async fn registration_needs_an_issued_nonce() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(13, Tier::SILVER, ROOT);
    let envelope = n.registration(&proxy_types::Nonce::new([9; 16]), Tier::SILVER, h.now());
    assert_eq!(kind(h.send(envelope).await), ErrorKind::UnknownNode);

    // A nonce issued to another node does not count either.
    let other = NullDevice::new(26, Tier::SILVER, ROOT);
    let nonce = h
        .api
        .issue_nonce(
            &h.ctx("node"),
            proxy_engine::IssueNonceRequest {
                node_id: other.node_id(),
            },
        )
        .await
        .unwrap()
        .nonce;
    h.clock.advance(1);
    let envelope = n.registration(&nonce, Tier::SILVER, h.now());
    assert_eq!(kind(h.send(envelope).await), ErrorKind::UnknownNode);
}

#[tokio::test]
async fn expired_registration_nonce_is_a_bad_signature() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(27, Tier::SILVER, ROOT);
    let nonce = h
        .api
        .issue_nonce(
            &h.ctx("node"),
            proxy_engine::IssueNonceRequest {
                node_id: n.node_id(),
            },
        )
        .await
        .unwrap()
        .nonce;
    h.clock.advance(300);
    let envelope = n.registration(&nonce, Tier::SILVER, h.now());
    assert_eq!(kind(h.send(envelope).await), ErrorKind::BadSignature);
}

// ---------------------------------------------------------------------------
// Liveness sweep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn silent_nodes_are_flagged_charged_and_retired() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(14, Tier::SILVER, ROOT);
    h.register(&n).await.unwrap();

    h.clock.advance(121);
    let report = h.engine.sweep().unwrap();
    assert_eq!(report.missed_beats, 1);
    assert_eq!(report.intervals_charged, 0);
    assert!(h.node(&n.node_id()).stale);

    h.clock.advance(600 - 121);
    let report = h.engine.sweep().unwrap();
    assert_eq!(report.missed_beats, 0);
    assert_eq!(report.went_offline, 1);
    assert_eq!(report.intervals_charged, 1);
    assert_eq!(h.node(&n.node_id()).reputation, 498);

    // Sweeping again inside the same interval charges nothing more.
    h.clock.advance(30);
    assert_eq!(h.engine.sweep().unwrap().intervals_charged, 0);

    h.clock.advance(7 * 86_400);
    let report = h.engine.sweep().unwrap();
    assert_eq!(report.retired, 1);
    assert_eq!(h.node(&n.node_id()).status, NodeStatus::Retired);
    assert_eq!(kind(h.beat(&n).await), ErrorKind::UnknownNode);
    assert_eq!(kind(h.register(&n).await), ErrorKind::NotEligible);
}

#[tokio::test]
async fn heartbeat_after_silence_brings_a_node_back() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(15, Tier::SILVER, ROOT);
    h.register(&n).await.unwrap();
    h.clock.advance(700);
    h.engine.sweep().unwrap();
    assert!(h.node(&n.node_id()).offline);

    let ack = h.beat(&n).await.unwrap();
    assert_eq!(ack.uptime_credited, 90);
    let node = h.node(&n.node_id());
    assert!(!node.offline);
    assert!(!node.stale);
}

// ---------------------------------------------------------------------------
// Cancellation and timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn principal_may_cancel_only_open_tasks() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(16, Tier::SILVER, ROOT);
    h.register(&n).await.unwrap();

    let open = h.post(100, Tier::BRONZE).await;
    assert_eq!(
        kind(
            h.api
                .cancel_task(&h.ctx("agent-b"), CancelTaskRequest { task_id: open.task_id })
                .await
        ),
        ErrorKind::NotEligible
    );
    h.accept(&open.task_id, &n).await.unwrap();
    assert_eq!(
        kind(
            h.api
                .cancel_task(&h.ctx("agent-a"), CancelTaskRequest { task_id: open.task_id })
                .await
        ),
        ErrorKind::NotEligible
    );

    let status = h
        .api
        .cancel_task(&h.ctx(OPERATOR), CancelTaskRequest { task_id: open.task_id })
        .await
        .unwrap();
    assert_eq!(status.state, TaskStateKind::Cancelled);
    assert_eq!(
        h.task(&open.task_id).state,
        TaskState::Cancelled(CancelReason::OperatorIntervention)
    );
    assert_eq!(
        h.escrow.hold(&open.escrow_invoice_id).unwrap().status,
        HoldStatus::Cancelled
    );

    // Terminal is terminal.
    assert_eq!(
        kind(
            h.api
                .cancel_task(&h.ctx(OPERATOR), CancelTaskRequest { task_id: open.task_id })
                .await
        ),
        ErrorKind::IllegalStateTransition
    );
}

#[tokio::test]
async fn principal_cancels_an_unmatched_task() {
    let h = Harness::new(|_| {}).await;
    let posted = h.post(100, Tier::BRONZE).await;
    let status = h
        .api
        .cancel_task(&h.ctx("agent-a"), CancelTaskRequest { task_id: posted.task_id })
        .await
        .unwrap();
    assert_eq!(status.state, TaskStateKind::Cancelled);
    assert_eq!(
        h.task(&posted.task_id).state,
        TaskState::Cancelled(CancelReason::PrincipalCancelled)
    );
    assert_eq!(h.escrow.open_holds(), 0);
}

#[tokio::test]
async fn unmatched_task_expires_after_its_ttl() {
    let h = Harness::new(|_| {}).await;
    let posted = h.post(100, Tier::BRONZE).await;
    // No node ever qualifies; the task waits without using up rounds.
    h.clock.advance(31);
    h.engine.tick().await.unwrap();
    assert_eq!(h.task(&posted.task_id).match_progress.rounds_started, 0);

    h.clock.advance(3_600);
    h.engine.tick().await.unwrap();
    assert_eq!(
        h.task(&posted.task_id).state,
        TaskState::Cancelled(CancelReason::TtlExpired)
    );
    assert_eq!(h.escrow.open_holds(), 0);
}

#[tokio::test]
async fn missing_verdict_cancels_without_penalty() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(17, Tier::SILVER, ROOT);
    h.register(&n).await.unwrap();
    let posted = h.post(500, Tier::BRONZE).await;
    h.run_to_proof(&posted.task_id, &n).await;

    h.clock.advance(3_600);
    h.engine.tick().await.unwrap();
    assert_eq!(
        h.task(&posted.task_id).state,
        TaskState::Cancelled(CancelReason::VerificationTimeout)
    );
    assert_eq!(h.node(&n.node_id()).reputation, 500);
    assert_eq!(
        h.escrow.hold(&posted.escrow_invoice_id).unwrap().status,
        HoldStatus::Cancelled
    );
}

#[tokio::test]
async fn missed_execution_deadline_is_a_flake() {
    let h = Harness::new(|c| {
        c.params.offer_batch_size = 1;
        c.task_types.insert(
            "delivery".into(),
            proxy_engine::TaskTypePolicy {
                min_tier: Tier::BRONZE,
                deadline_s: Some(600),
            },
        );
    })
    .await;
    let n = NullDevice::new(18, Tier::SILVER, ROOT);
    let m = NullDevice::new(28, Tier::SILVER, ROOT);
    h.register(&n).await.unwrap();
    h.register(&m).await.unwrap();
    h.set_reputation(&n.node_id(), 600);

    let posted = h.post(500, Tier::BRONZE).await;
    h.accept(&posted.task_id, &n).await.unwrap();
    h.start(&posted.task_id, &n).await.unwrap();

    h.pass(600, &[&n, &m]).await;
    h.engine.tick().await.unwrap();
    let task = h.task(&posted.task_id);
    assert_eq!(task.state.kind(), TaskStateKind::Open);
    assert_eq!(h.node(&n.node_id()).reputation, 580);
    // Re-offered to someone else, never to the node that flaked.
    assert!(task.match_progress.offer_for(&n.node_id()).is_none());
    assert!(task.match_progress.offer_for(&m.node_id()).is_some());

    let late = h
        .api
        .submit_proof(
            &h.ctx("node"),
            proxy_engine::SubmitProofRequest {
                task_id: posted.task_id,
                node_id: n.node_id(),
                proof_blob: b"too late".to_vec(),
                attestation_quote: Vec::new(),
            },
        )
        .await;
    assert_eq!(kind(late), ErrorKind::IllegalStateTransition);
}

#[tokio::test]
async fn pending_refund_freezes_the_task_until_escrow_returns() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(35, Tier::SILVER, ROOT);
    h.register(&n).await.unwrap();
    let posted = h.post(500, Tier::BRONZE).await;
    let task_id = posted.task_id;
    h.accept(&task_id, &n).await.unwrap();
    h.start(&task_id, &n).await.unwrap();

    h.escrow.set_available(false);
    let result = h
        .api
        .cancel_task(&h.ctx(OPERATOR), CancelTaskRequest { task_id })
        .await;
    assert_eq!(kind(result), ErrorKind::BackendUnavailable);
    assert_eq!(h.task(&task_id).state.kind(), TaskStateKind::Active);

    // The pending refund holds the task where it is.
    assert_eq!(
        kind(h.prove(&task_id, &n).await),
        ErrorKind::IllegalStateTransition
    );
    assert_eq!(h.task(&task_id).state.kind(), TaskStateKind::Active);

    // Past the execution deadline the task is neither released nor charged.
    let deadline = h.task(&task_id).deadline_at.expect("execution deadline");
    h.clock.advance(deadline.as_secs() - h.now().as_secs() + 1);
    h.engine.tick().await.unwrap();
    assert_eq!(h.task(&task_id).state.kind(), TaskStateKind::Active);
    assert_eq!(h.node(&n.node_id()).reputation, 500);

    h.escrow.set_available(true);
    h.engine.tick().await.unwrap();
    assert_eq!(
        h.task(&task_id).state,
        TaskState::Cancelled(CancelReason::OperatorIntervention)
    );
    assert_eq!(h.node(&n.node_id()).reputation, 500);
    assert_eq!(
        h.escrow.hold(&posted.escrow_invoice_id).unwrap().status,
        HoldStatus::Cancelled
    );
}

#[tokio::test]
async fn released_task_with_nobody_left_is_exhausted() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(29, Tier::SILVER, ROOT);
    h.register(&n).await.unwrap();
    let posted = h.post(500, Tier::BRONZE).await;
    h.accept(&posted.task_id, &n).await.unwrap();

    let status = h.decline(&posted.task_id, &n).await.unwrap();
    assert_eq!(status.state, TaskStateKind::Cancelled);
    assert_eq!(
        h.task(&posted.task_id).state,
        TaskState::Cancelled(CancelReason::MatchExhausted)
    );
    assert_eq!(h.node(&n.node_id()).reputation, 495);
}

#[tokio::test]
async fn retry_verdict_reopens_execution_once() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(19, Tier::SILVER, ROOT);
    h.register(&n).await.unwrap();
    let posted = h.post(500, Tier::BRONZE).await;
    let task_id = posted.task_id;
    h.run_to_proof(&task_id, &n).await;

    let verifier = h.requested(&task_id)[0].clone();
    let status = h.verdict(&task_id, &verifier, Decision::Retry).await.unwrap();
    assert_eq!(status.state, TaskStateKind::Active);

    h.prove(&task_id, &n).await.unwrap();
    let verifier = h.requested(&task_id)[0].clone();
    let status = h.verdict(&task_id, &verifier, Decision::Retry).await.unwrap();
    assert_eq!(status.state, TaskStateKind::Settled);
    assert_eq!(
        h.task(&task_id).state,
        TaskState::Settled(SettlementOutcome::Disputed)
    );
    assert_eq!(h.node(&n.node_id()).reputation, 450);
}

#[tokio::test]
async fn forged_verdict_is_rejected() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(20, Tier::SILVER, ROOT);
    h.register(&n).await.unwrap();
    let posted = h.post(500, Tier::BRONZE).await;
    h.run_to_proof(&posted.task_id, &n).await;
    let verifier = h.requested(&posted.task_id)[0].clone();

    let (_, key) = &h.verifiers[0];
    // Signed for FAIL, submitted as PASS.
    let signature =
        proxy_crypto::sign_verdict(key, &posted.task_id, Decision::Fail, &verifier).to_vec();
    let result = h
        .api
        .verify_callback(
            &h.ctx("verifier"),
            proxy_engine::VerifyCallbackRequest {
                task_id: posted.task_id,
                decision: Decision::Pass,
                verifier_id: verifier,
                signature,
            },
        )
        .await;
    assert_eq!(kind(result), ErrorKind::BadSignature);
    assert_eq!(
        h.task(&posted.task_id).state.kind(),
        TaskStateKind::PendingVerification
    );
}

#[tokio::test]
async fn decline_needs_the_declining_nodes_attestation() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(32, Tier::SILVER, ROOT);
    let mallory = NullDevice::new(33, Tier::SILVER, ROOT);
    h.register(&n).await.unwrap();
    let posted = h.post(500, Tier::BRONZE).await;
    let task_id = posted.task_id;

    // Open: a third party cannot pass on the node's behalf.
    let offer = h
        .task(&task_id)
        .match_progress
        .offer_for(&n.node_id())
        .expect("n holds an offer");
    assert_eq!(
        kind(h.decline_with(&task_id, &n, mallory.quote(&offer)).await),
        ErrorKind::BadSignature
    );
    assert_eq!(
        kind(h.decline_with(&task_id, &n, Vec::new()).await),
        ErrorKind::BadSignature
    );
    assert_eq!(h.task(&task_id).match_progress.offer_for(&n.node_id()), Some(offer));

    // Matched: nor can it hand the task back and cost the node reputation.
    h.accept(&task_id, &n).await.unwrap();
    let challenge = h.task(&task_id).challenge_nonce.expect("start nonce");
    assert_eq!(
        kind(h.decline_with(&task_id, &n, mallory.quote(&challenge)).await),
        ErrorKind::BadSignature
    );
    let task = h.task(&task_id);
    assert_eq!(task.state, TaskState::Matched { node_id: n.node_id() });
    assert_eq!(h.node(&n.node_id()).reputation, 500);

    // The failed attempts used up nothing the node needs.
    let status = h.start(&task_id, &n).await.unwrap();
    assert_eq!(status.state, TaskStateKind::Active);
}

#[tokio::test]
async fn offered_node_declining_ends_the_round_early() {
    let h = Harness::new(|_| {}).await;
    let a = NullDevice::new(21, Tier::SILVER, ROOT);
    h.register(&a).await.unwrap();
    let posted = h.post(500, Tier::BRONZE).await;

    let status = h.decline(&posted.task_id, &a).await.unwrap();
    assert_eq!(status.state, TaskStateKind::Open);
    assert_eq!(h.node(&a.node_id()).reputation, 500);

    let b = NullDevice::new(22, Tier::SILVER, ROOT);
    h.clock.advance(1);
    h.register(&b).await.unwrap();
    h.engine.tick().await.unwrap();
    let task = h.task(&posted.task_id);
    assert_eq!(task.match_progress.rounds_started, 2);
    assert!(task.match_progress.offer_for(&b.node_id()).is_some());
}

#[tokio::test]
async fn node_holds_one_live_task_at_a_time() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(23, Tier::SILVER, ROOT);
    h.register(&n).await.unwrap();
    let first = h.post(500, Tier::BRONZE).await;
    h.accept(&first.task_id, &n).await.unwrap();

    let second = h.post(500, Tier::BRONZE).await;
    let task = h.task(&second.task_id);
    assert!(task.match_progress.offer_for(&n.node_id()).is_none());
    assert_eq!(task.match_progress.rounds_started, 0);
}

// ---------------------------------------------------------------------------
// Idempotency and deadlines
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_request_id_returns_the_first_response() {
    let h = Harness::new(|_| {}).await;
    let ctx = h.ctx("agent-a");
    let first = h
        .api
        .post_task(&ctx, Harness::task_request(100, Tier::BRONZE))
        .await
        .unwrap();
    let again = h
        .api
        .post_task(&ctx, Harness::task_request(100, Tier::BRONZE))
        .await
        .unwrap();
    assert_eq!(first, again);
    assert_eq!(h.escrow.holds().len(), 1);

    // The same id for a different operation is refused.
    let result = h
        .api
        .cancel_task(&ctx, CancelTaskRequest { task_id: first.task_id })
        .await;
    assert_eq!(kind(result), ErrorKind::NotEligible);
}

#[tokio::test]
async fn caller_deadline_does_not_abandon_the_operation() {
    let h = Harness::new(|_| {}).await;
    let ctx = RequestContext::new("agent-a", "late-1", Duration::ZERO);
    let result = h
        .api
        .post_task(&ctx, Harness::task_request(100, Tier::BRONZE))
        .await;
    assert_eq!(kind(result), ErrorKind::Timeout);

    // The post still completes in the background and is replayed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let retry = RequestContext::new("agent-a", "late-1", Duration::from_secs(5));
    let posted = h
        .api
        .post_task(&retry, Harness::task_request(100, Tier::BRONZE))
        .await
        .unwrap();
    assert_eq!(h.escrow.holds().len(), 1);
    assert_eq!(h.task(&posted.task_id).state, TaskState::Open);
}

#[tokio::test]
async fn invalid_task_input_is_not_eligible() {
    let h = Harness::new(|_| {}).await;
    let result = h
        .api
        .post_task(&h.ctx("agent-a"), Harness::task_request(0, Tier::BRONZE))
        .await;
    assert_eq!(kind(result), ErrorKind::NotEligible);
    assert!(h.escrow.holds().is_empty());

    assert_eq!(
        kind(h.api.get_task(&proxy_types::TaskId::new([0xEE; 16]))),
        ErrorKind::UnknownTask
    );
}

#[tokio::test]
async fn escrow_down_at_post_creates_nothing() {
    let h = Harness::new(|_| {}).await;
    h.escrow.set_available(false);
    let result = h
        .api
        .post_task(&h.ctx("agent-a"), Harness::task_request(100, Tier::BRONZE))
        .await;
    assert_eq!(kind(result), ErrorKind::BackendUnavailable);
    assert_eq!(h.engine.lifecycle().tasks().open_count(), 0);
}

// ---------------------------------------------------------------------------
// Operator actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn operator_recertifies_a_suspended_node() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(24, Tier::SILVER, ROOT);
    h.register(&n).await.unwrap();
    let req = NodeRequest {
        node_id: n.node_id(),
    };

    assert_eq!(
        kind(h.api.recertify_node(&h.ctx(OPERATOR), req.clone()).await),
        ErrorKind::NotEligible,
        "an ACTIVE node has nothing to re-certify"
    );
    h.set_reputation(&n.node_id(), 250);
    assert_eq!(h.node(&n.node_id()).status, NodeStatus::Suspended);
    assert_eq!(
        kind(h.api.recertify_node(&h.ctx("agent-a"), req.clone()).await),
        ErrorKind::NotEligible
    );

    let standing = h.api.recertify_node(&h.ctx(OPERATOR), req).await.unwrap();
    assert_eq!(standing.reputation, 400);
    assert_eq!(standing.status, NodeStatus::Probation);
}

#[tokio::test]
async fn operator_retires_a_node() {
    let h = Harness::new(|_| {}).await;
    let n = NullDevice::new(25, Tier::SILVER, ROOT);
    h.register(&n).await.unwrap();
    let standing = h
        .api
        .retire_node(
            &h.ctx(OPERATOR),
            NodeRequest {
                node_id: n.node_id(),
            },
        )
        .await
        .unwrap();
    assert_eq!(standing.status, NodeStatus::Retired);

    h.clock.advance(1);
    assert_eq!(kind(h.beat(&n).await), ErrorKind::UnknownNode);
    let posted = h.post(100, Tier::BRONZE).await;
    assert_eq!(h.task(&posted.task_id).match_progress.rounds_started, 0);
}
