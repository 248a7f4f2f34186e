//! Prometheus metrics for the engine.
//!
//! [`EngineMetrics`] owns a dedicated [`Registry`] that the RPC `/metrics`
//! endpoint encodes into the Prometheus text exposition format.

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, Histogram,
    HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Central collection of all engine-level Prometheus metrics.
pub struct EngineMetrics {
    /// The Prometheus registry that owns every metric below.
    pub registry: Registry,

    // ── Counters ────────────────────────────────────────────────────────
    pub heartbeats_accepted: IntCounter,
    /// Rejected heartbeats, labelled by error kind.
    pub heartbeats_rejected: IntCounterVec,
    pub nodes_registered: IntCounter,
    pub tasks_posted: IntCounter,
    pub tasks_settled: IntCounter,
    pub tasks_disputed: IntCounter,
    pub tasks_cancelled: IntCounter,
    /// Offers sent to candidate nodes.
    pub offers_made: IntCounter,
    /// Escrow calls retried after `BackendUnavailable`.
    pub escrow_retries: IntCounter,
    /// Journal entries completed by replay rather than by their operation.
    pub journal_replays: IntCounter,

    // ── Gauges ──────────────────────────────────────────────────────────
    /// Registered, non-retired nodes.
    pub registered_nodes: IntGauge,
    /// Tasks not yet SETTLED or CANCELLED.
    pub open_tasks: IntGauge,

    // ── Histograms ──────────────────────────────────────────────────────
    /// Wall time of one escrow call including retries, milliseconds.
    pub escrow_call_ms: Histogram,
}

impl EngineMetrics {
    /// Create a fresh set of metrics, all registered under a new
    /// [`Registry`].
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| {
            register_int_counter_with_registry!(Opts::new(name, help), registry)
        };

        let heartbeats_accepted =
            counter("proxy_heartbeats_accepted_total", "Heartbeats accepted")?;
        let heartbeats_rejected = register_int_counter_vec_with_registry!(
            Opts::new("proxy_heartbeats_rejected_total", "Heartbeats rejected, by error kind"),
            &["kind"],
            registry
        )?;
        let nodes_registered = counter("proxy_nodes_registered_total", "Nodes registered")?;
        let tasks_posted = counter("proxy_tasks_posted_total", "Tasks posted")?;
        let tasks_settled = counter("proxy_tasks_settled_total", "Tasks settled to the node")?;
        let tasks_disputed = counter(
            "proxy_tasks_disputed_total",
            "Tasks settled as disputed and refunded",
        )?;
        let tasks_cancelled = counter("proxy_tasks_cancelled_total", "Tasks cancelled")?;
        let offers_made = counter("proxy_offers_made_total", "Offers sent to candidate nodes")?;
        let escrow_retries = counter("proxy_escrow_retries_total", "Escrow calls retried")?;
        let journal_replays = counter(
            "proxy_journal_replays_total",
            "Journal entries completed by replay",
        )?;

        let registered_nodes = register_int_gauge_with_registry!(
            Opts::new("proxy_registered_nodes", "Registered, non-retired nodes"),
            registry
        )?;
        let open_tasks = register_int_gauge_with_registry!(
            Opts::new("proxy_open_tasks", "Tasks in a non-terminal state"),
            registry
        )?;

        // 1 ms → ~16 s, matching the escrow retry ceiling.
        let escrow_call_ms = register_histogram_with_registry!(
            HistogramOpts::new("proxy_escrow_call_ms", "Escrow call latency in milliseconds")
                .buckets(prometheus::exponential_buckets(1.0, 2.0, 15)?),
            registry
        )?;

        Ok(Self {
            registry,
            heartbeats_accepted,
            heartbeats_rejected,
            nodes_registered,
            tasks_posted,
            tasks_settled,
            tasks_disputed,
            tasks_cancelled,
            offers_made,
            escrow_retries,
            journal_replays,
            registered_nodes,
            open_tasks,
            escrow_call_ms,
        })
    }

    /// Render every metric in the text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.tasks_posted.inc();
        metrics.heartbeats_rejected.with_label_values(&["Stale"]).inc();
        let text = metrics.encode().unwrap();
        assert!(text.contains("proxy_tasks_posted_total 1"));
        assert!(text.contains("kind=\"Stale\""));
    }
}
