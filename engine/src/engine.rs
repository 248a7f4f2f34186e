//! Engine assembly: builds every component from a config and its external
//! dependencies, restores state at startup, and runs the timers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use proxy_attestation::{Attestor, Enrollment};
use proxy_crypto::HeartbeatKey;
use proxy_escrow::EscrowBackend;
use proxy_reputation::ReputationEngine;
use proxy_store::Store;
use proxy_types::{Clock, IdSource};

use crate::api::{InvariantPolicy, ProxyApi};
use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::ingress::{HeartbeatIngress, SweepReport};
use crate::journal::Journal;
use crate::lifecycle::LifecycleEngine;
use crate::metrics::EngineMetrics;
use crate::registry::NodeRegistry;
use crate::shutdown::ShutdownController;
use crate::taskbook::TaskBook;
use crate::verifiers::VerifierPool;
use crate::EngineError;

/// External collaborators, swapped for nullables in tests.
pub struct EngineDeps {
    pub store: Arc<dyn Store>,
    pub escrow: Arc<dyn EscrowBackend>,
    pub attestor: Arc<dyn Attestor>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdSource>,
}

/// What [`Engine::start`] restored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub nodes: usize,
    pub tasks: usize,
    pub replayed: usize,
}

pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn Store>,
    attestor: Arc<dyn Attestor>,
    registry: Arc<NodeRegistry>,
    tasks: Arc<TaskBook>,
    lifecycle: Arc<LifecycleEngine>,
    ingress: Arc<HeartbeatIngress>,
    api: Arc<ProxyApi>,
    events: EventBus,
    metrics: Arc<EngineMetrics>,
    invariants: InvariantPolicy,
}

impl Engine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Result<Self, EngineError> {
        config.validate()?;
        let config = Arc::new(config);
        let params = config.params.clone();
        let metrics = Arc::new(EngineMetrics::new()?);
        let events = EventBus::default();
        let invariants =
            InvariantPolicy::new(Arc::clone(&deps.store), config.abort_on_invariant_violation);

        let registry = Arc::new(NodeRegistry::new(
            Arc::clone(&deps.store),
            ReputationEngine::new(params.clone()),
        ));
        let tasks = Arc::new(TaskBook::new(Arc::clone(&deps.store)));
        let journal = Journal::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.ids),
            Arc::clone(&deps.clock),
        );
        let lifecycle = Arc::new(LifecycleEngine::new(
            Arc::clone(&config),
            Arc::clone(&tasks),
            Arc::clone(&registry),
            VerifierPool::from_config(&config.verifiers)?,
            journal,
            Arc::clone(&deps.escrow),
            Arc::clone(&deps.attestor),
            Arc::clone(&deps.clock),
            Arc::clone(&deps.ids),
            events.clone(),
            Arc::clone(&metrics),
        ));
        let ingress = Arc::new(HeartbeatIngress::new(
            Arc::clone(&deps.attestor),
            Arc::clone(&registry),
            Arc::clone(&deps.clock),
            params.clone(),
            events.clone(),
            Arc::clone(&metrics),
        ));
        let api = Arc::new(ProxyApi::new(
            Arc::clone(&lifecycle),
            Arc::clone(&ingress),
            Arc::clone(&registry),
            Arc::clone(&deps.attestor),
            Arc::clone(&deps.store),
            Arc::clone(&deps.clock),
            config.operators.clone(),
            params.nonce_ttl_secs,
            invariants.clone(),
        ));

        Ok(Self {
            config,
            store: deps.store,
            attestor: deps.attestor,
            registry,
            tasks,
            lifecycle,
            ingress,
            api,
            events,
            metrics,
            invariants,
        })
    }

    /// Restore nodes and tasks from the store, re-enroll heartbeat keys and
    /// replay the escrow journal.
    pub async fn start(&self) -> Result<StartupReport, EngineError> {
        let nodes = self.registry.load()?;
        for node in self.registry.snapshot_all() {
            if node.is_retired() {
                continue;
            }
            if !node.heartbeat_secret.is_issued() {
                tracing::warn!(node_id = %node.node_id, "stored node has no heartbeat key, not enrolled");
                continue;
            }
            self.attestor.enroll(Enrollment {
                node_id: node.node_id,
                key: HeartbeatKey::new(*node.heartbeat_secret.as_bytes()),
                fingerprint: node.pubkey_fingerprint,
                tier: node.tier,
                last_accepted: node.last_heartbeat_at,
            });
        }
        let tasks = self.tasks.load()?;
        let replayed = self.invariants.check(self.lifecycle.replay_journal().await)?;

        self.metrics
            .registered_nodes
            .set(self.registry.active_count() as i64);
        self.metrics.open_tasks.set(self.tasks.open_count() as i64);
        tracing::info!(nodes, tasks, replayed, "engine state restored");
        Ok(StartupReport {
            nodes,
            tasks,
            replayed,
        })
    }

    pub fn api(&self) -> Arc<ProxyApi> {
        Arc::clone(&self.api)
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleEngine> {
        &self.lifecycle
    }

    pub fn ingress(&self) -> &Arc<HeartbeatIngress> {
        &self.ingress
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one deadline tick now.
    pub async fn tick(&self) -> Result<usize, EngineError> {
        self.invariants.check(self.lifecycle.tick().await)
    }

    /// Run one missed-heartbeat sweep now.
    pub fn sweep(&self) -> Result<SweepReport, EngineError> {
        self.invariants.check(self.ingress.sweep())
    }

    /// Force buffered writes to disk.
    pub fn flush(&self) -> Result<(), EngineError> {
        Ok(self.store.flush()?)
    }

    /// Spawn the deadline tick and the sweep loops. Both stop on shutdown.
    pub fn spawn_timers(&self, shutdown: &ShutdownController) -> Vec<JoinHandle<()>> {
        let tick_every = Duration::from_millis(self.config.deadline_tick_ms);
        let sweep_every = Duration::from_secs(self.config.params.sweep_interval_secs.max(1));
        let retention = self.config.idempotency_retention_secs;

        let lifecycle = Arc::clone(&self.lifecycle);
        let invariants = self.invariants.clone();
        let mut stop = shutdown.subscribe();
        let tick = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = invariants.check(lifecycle.tick().await) {
                            tracing::error!(error = %e, "deadline tick failed");
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
            tracing::debug!("deadline tick stopped");
        });

        let ingress = Arc::clone(&self.ingress);
        let api = Arc::clone(&self.api);
        let invariants = self.invariants.clone();
        let mut stop = shutdown.subscribe();
        let sweep = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match invariants.check(ingress.sweep()) {
                            Ok(report) if report != SweepReport::default() => {
                                tracing::debug!(?report, "sweep finished");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!(error = %e, "sweep failed"),
                        }
                        match invariants.check(api.purge_responses(retention)) {
                            Ok(0) => {}
                            Ok(purged) => tracing::debug!(purged, "expired idempotency records purged"),
                            Err(e) => tracing::warn!(error = %e, "idempotency purge failed"),
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
            tracing::debug!("sweep stopped");
        });

        vec![tick, sweep]
    }
}
