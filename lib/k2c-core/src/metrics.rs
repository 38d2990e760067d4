//! Prometheus metrics for reconciliation activity

use crate::{CoreError, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Counters shared by the reconciler, the workers and resync.
///
/// Clones share the same underlying registry.
#[derive(Clone)]
pub struct SyncMetrics {
    /// Catalog service registrations written
    pub registrations_total: Counter,
    /// Catalog service instances deregistered
    pub deregistrations_total: Counter,
    /// Empty catalog nodes deregistered
    pub node_deregistrations_total: Counter,
    /// Catalog calls that failed
    pub registry_errors_total: Counter,
    /// Actions handled by workers, by action type
    pub actions_total: CounterVec,
    /// Actions whose handler failed, by action type
    pub action_errors_total: CounterVec,
    /// Completed resync passes
    pub resyncs_total: Counter,
    /// Resync pass duration in seconds
    pub resync_duration_seconds: Histogram,
    pub registry: Arc<Registry>,
}

impl SyncMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let registrations_total = Counter::new(
            "kube2consul_registrations_total",
            "Catalog service registrations written",
        )?;
        let deregistrations_total = Counter::new(
            "kube2consul_deregistrations_total",
            "Catalog service instances deregistered",
        )?;
        let node_deregistrations_total = Counter::new(
            "kube2consul_node_deregistrations_total",
            "Empty catalog nodes deregistered",
        )?;
        let registry_errors_total = Counter::new(
            "kube2consul_registry_errors_total",
            "Failed catalog calls",
        )?;
        let actions_total = CounterVec::new(
            Opts::new("kube2consul_actions_total", "Actions handled by workers"),
            &["action"],
        )?;
        let action_errors_total = CounterVec::new(
            Opts::new("kube2consul_action_errors_total", "Actions whose handler failed"),
            &["action"],
        )?;
        let resyncs_total = Counter::new(
            "kube2consul_resyncs_total",
            "Completed resync passes",
        )?;
        let resync_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "kube2consul_resync_duration_seconds",
            "Resync pass duration in seconds",
        ))?;

        registry.register(Box::new(registrations_total.clone()))?;
        registry.register(Box::new(deregistrations_total.clone()))?;
        registry.register(Box::new(node_deregistrations_total.clone()))?;
        registry.register(Box::new(registry_errors_total.clone()))?;
        registry.register(Box::new(actions_total.clone()))?;
        registry.register(Box::new(action_errors_total.clone()))?;
        registry.register(Box::new(resyncs_total.clone()))?;
        registry.register(Box::new(resync_duration_seconds.clone()))?;

        Ok(Self {
            registrations_total,
            deregistrations_total,
            node_deregistrations_total,
            registry_errors_total,
            actions_total,
            action_errors_total,
            resyncs_total,
            resync_duration_seconds,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| CoreError::Internal(e.to_string()))
    }
}
