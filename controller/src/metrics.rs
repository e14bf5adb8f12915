//! Metrics contains the metrics setup for the controller.
//!
//! Counters and gauges are recorded through the `metrics` facade so a single
//! `metrics-exporter-prometheus` HTTP listener in `main.rs` can serve them; `Metrics` just holds
//! the handles so reconcilers and the Dynamic Multiplexing Controller don't re-register them on
//! every call.

use crate::ImpersonationError;

/// Common metrics for the reconcilers.
#[derive(Clone, Default)]
pub struct Metrics {
    /// Metrics collected from reconcilers.
    pub reconcile: ReconcileMetrics,
    /// Metrics collected from the Dynamic Multiplexing Controller.
    pub dmc: DmcMetrics,
}

/// Metrics collected from reconcilers.
#[derive(Clone)]
pub struct ReconcileMetrics {
    /// Runs records the total number of calls to a reconciler.
    pub runs: metrics::Counter,
    /// Failures records the total number of reconciler calls that resulted in a failure.
    pub failures: metrics::Counter,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: metrics::counter!("kro_reconciles_total"),
            failures: metrics::counter!("kro_reconcile_failures_total"),
        }
    }
}

/// Metrics collected from the Dynamic Multiplexing Controller and the per-namespace
/// impersonated-client machinery it feeds.
#[derive(Clone)]
pub struct DmcMetrics {
    /// QueueDepth tracks the number of items currently enqueued but not yet picked up by a
    /// worker.
    pub queue_depth: metrics::Gauge,
    /// Informers tracks the number of GVRs the DMC currently runs an informer for.
    pub informers: metrics::Gauge,
}

impl Default for DmcMetrics {
    fn default() -> Self {
        Self {
            queue_depth: metrics::gauge!("kro_dmc_queue_depth"),
            informers: metrics::gauge!("kro_dmc_informers_active"),
        }
    }
}

impl DmcMetrics {
    /// Record_impersonation_error increments the counter for `err`'s kind, labeled per
    /// `spec.md` §7's `config_create`/`invalid_sa`/`client_create`/`permissions` taxonomy.
    pub fn record_impersonation_error(&self, err: &ImpersonationError) {
        metrics::counter!("kro_impersonation_errors_total", "kind" => err.name()).increment(1);
    }
}
