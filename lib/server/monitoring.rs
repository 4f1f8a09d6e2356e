use crate::build_info;
use crate::logging::SERVICE_NAME;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata for `/metrics` scraping as a labeled gauge fixed at `1`.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: SERVICE_NAME,
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

/// Per-endpoint-category label set for rate governor counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CategoryLabels {
    pub category: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TierLabels {
    pub tier: String,
}

#[derive(Clone)]
pub struct GovernorMetrics {
    /// Calls admitted into a category's window.
    pub authorized_total: Family<CategoryLabels, Counter>,
    /// Times a caller had to wait for budget or a penalty to expire.
    pub waits_total: Family<CategoryLabels, Counter>,
    pub cancelled_total: Family<CategoryLabels, Counter>,
    /// Authorized calls the upstream still answered with 429.
    pub remote_rejections_total: Family<CategoryLabels, Counter>,
}

impl GovernorMetrics {
    fn init() -> Self {
        Self {
            authorized_total: Family::default(),
            waits_total: Family::default(),
            cancelled_total: Family::default(),
            remote_rejections_total: Family::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "authorized",
            "Total number of calls admitted by the rate governor",
            metrics.authorized_total.clone(),
        );
        sub_registry.register(
            "waits",
            "Total number of authorizations that had to wait for budget",
            metrics.waits_total.clone(),
        );
        sub_registry.register(
            "cancelled",
            "Total number of authorizations abandoned by cancellation",
            metrics.cancelled_total.clone(),
        );
        sub_registry.register(
            "remote_rejections",
            "Total number of authorized calls rejected upstream with 429",
            metrics.remote_rejections_total.clone(),
        );
        metrics
    }
}

pub static GOVERNOR_METRICS: OnceCell<GovernorMetrics> = OnceCell::const_new();

#[derive(Clone)]
pub struct QueueMetrics {
    pub enqueued_total: Counter,
    pub duplicates_total: Counter,
    pub completed_total: Counter,
    pub failed_total: Counter,
    pub pending_jobs: Gauge,
    pub workers_alive: Gauge,
}

impl QueueMetrics {
    fn init() -> Self {
        Self {
            enqueued_total: Counter::default(),
            duplicates_total: Counter::default(),
            completed_total: Counter::default(),
            failed_total: Counter::default(),
            pending_jobs: Gauge::default(),
            workers_alive: Gauge::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "enqueued",
            "Total number of sync jobs accepted into the queue",
            metrics.enqueued_total.clone(),
        );
        sub_registry.register(
            "duplicates",
            "Total number of enqueue requests collapsed onto an existing job",
            metrics.duplicates_total.clone(),
        );
        sub_registry.register(
            "completed",
            "Total number of sync jobs that finished successfully",
            metrics.completed_total.clone(),
        );
        sub_registry.register(
            "failed",
            "Total number of sync jobs that ended in failure",
            metrics.failed_total.clone(),
        );
        sub_registry.register(
            "pending_jobs",
            "Current number of pending sync jobs",
            metrics.pending_jobs.clone(),
        );
        sub_registry.register(
            "workers_alive",
            "Number of live sync worker tasks",
            metrics.workers_alive.clone(),
        );
        metrics
    }
}

pub static QUEUE_METRICS: OnceCell<QueueMetrics> = OnceCell::const_new();

#[derive(Clone)]
pub struct ScanMetrics {
    pub items_scanned_total: Counter,
    pub matches_total: Counter,
    pub scans_paused_total: Counter,
    pub scans_completed_total: Counter,
    pub active_scans: Gauge,
}

impl ScanMetrics {
    fn init() -> Self {
        Self {
            items_scanned_total: Counter::default(),
            matches_total: Counter::default(),
            scans_paused_total: Counter::default(),
            scans_completed_total: Counter::default(),
            active_scans: Gauge::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "items_scanned",
            "Total number of positions fetched by range scans",
            metrics.items_scanned_total.clone(),
        );
        sub_registry.register(
            "matches",
            "Total number of scanned items involving the scan target",
            metrics.matches_total.clone(),
        );
        sub_registry.register(
            "paused",
            "Total number of scans paused by failure or cancellation",
            metrics.scans_paused_total.clone(),
        );
        sub_registry.register(
            "completed",
            "Total number of scans that reached a stop condition",
            metrics.scans_completed_total.clone(),
        );
        sub_registry.register(
            "active",
            "Number of scans currently running",
            metrics.active_scans.clone(),
        );
        metrics
    }
}

pub static SCAN_METRICS: OnceCell<ScanMetrics> = OnceCell::const_new();

#[derive(Clone)]
pub struct SchedulerMetrics {
    pub tier_runs_total: Family<TierLabels, Counter>,
    pub entities_queued_total: Family<TierLabels, Counter>,
}

impl SchedulerMetrics {
    fn init() -> Self {
        Self {
            tier_runs_total: Family::default(),
            entities_queued_total: Family::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "tier_runs",
            "Total number of scheduled tier runs",
            metrics.tier_runs_total.clone(),
        );
        sub_registry.register(
            "entities_queued",
            "Total number of entities newly queued by tier runs",
            metrics.entities_queued_total.clone(),
        );
        metrics
    }
}

pub static SCHEDULER_METRICS: OnceCell<SchedulerMetrics> = OnceCell::const_new();

#[cfg(test)]
mod tests {
    use super::{register_build_info_metric, CategoryLabels, GovernorMetrics};
    use crate::build_info;
    use prometheus_client::{encoding::text::encode, registry::Registry};

    #[test]
    fn build_info_metric_contains_version_and_commit_labels() {
        let mut registry = Registry::default();
        register_build_info_metric(&mut registry, "rider_sync");

        let mut encoded = String::new();
        encode(&mut encoded, &registry).expect("failed to encode metrics");

        assert!(
            encoded.contains("rider_sync_build_info"),
            "expected a rider_sync_build_info metric"
        );
        assert!(
            encoded.contains(&format!("version=\"{}\"", build_info::VERSION)),
            "expected build version label in metrics output"
        );
        assert!(
            encoded.contains(&format!("commit=\"{}\"", build_info::short_commit_hash())),
            "expected commit label in metrics output"
        );
    }

    #[test]
    fn governor_counters_are_labeled_by_category() {
        let mut registry = Registry::default();
        let metrics = GovernorMetrics::register(&mut registry, "governor");
        metrics
            .authorized_total
            .get_or_create(&CategoryLabels {
                category: "club-roster".to_string(),
            })
            .inc();

        let mut encoded = String::new();
        encode(&mut encoded, &registry).expect("failed to encode metrics");

        assert!(
            encoded.contains("governor_authorized_total{category=\"club-roster\"} 1"),
            "unexpected metrics output: {encoded}"
        );
    }
}
