use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

fn gauge(name: &str, help: &str) -> IntGauge {
    let g = IntGauge::with_opts(Opts::new(name, help)).unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
}

pub static EVENTS_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "maildrift_events_received_total",
        "Change events received on the intake endpoint",
    )
});

pub static EVENTS_ACCEPTED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "maildrift_events_accepted_total",
        "Change events that passed the filter",
    )
});

pub static EVENTS_ENQUEUED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "maildrift_events_enqueued_total",
        "Change events successfully enqueued",
    )
});

pub static ENQUEUE_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "maildrift_enqueue_errors_total",
        "Failed enqueue attempts from the intake endpoint",
    )
});

pub static SYNCS_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "maildrift_syncs_completed_total",
        "Successful sync operations",
    )
});

pub static SYNC_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "maildrift_sync_failures_total",
        "Sync operations that failed upstream",
    )
});

pub static SYNC_REQUEUES: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "maildrift_sync_requeues_total",
        "Users requeued after a failed sync",
    )
});

pub static RECONCILER_PASSES: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "maildrift_reconciler_passes_total",
        "Completed reconciliation passes",
    )
});

pub static RECONCILER_ENQUEUED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "maildrift_reconciler_enqueued_total",
        "Users enqueued by the reconciler",
    )
});

pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    gauge(
        "maildrift_queue_depth",
        "Users currently pending replication",
    )
});

pub static ACTIVE_WORKERS: Lazy<IntGauge> = Lazy::new(|| {
    gauge(
        "maildrift_active_workers",
        "Workers currently inside a sync call",
    )
});

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
