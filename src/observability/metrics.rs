//! # Metrics
//!
//! Prometheus metrics for monitoring the registry.
//!
//! ## Metrics Exposed
//!
//! - `registry_module_publishes_total` - Module versions published
//! - `registry_module_downloads_total` - Module download links served
//! - `registry_provider_downloads_total` - Provider download documents served
//! - `registry_mirror_syncs_total` - Provider mirror sync passes started
//! - `registry_binary_syncs_total` - Binary mirror sync passes started
//! - `registry_webhook_events_total` - Webhook events accepted

use prometheus::{IntCounter, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static MODULE_PUBLISHES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "registry_module_publishes_total",
        "Module versions published",
    )
    .expect("static metric construction cannot fail")
});

static MODULE_DOWNLOADS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "registry_module_downloads_total",
        "Module download links served",
    )
    .expect("static metric construction cannot fail")
});

static PROVIDER_DOWNLOADS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "registry_provider_downloads_total",
        "Provider download documents served",
    )
    .expect("static metric construction cannot fail")
});

static MIRROR_SYNCS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "registry_mirror_syncs_total",
        "Provider mirror sync passes started",
    )
    .expect("static metric construction cannot fail")
});

static BINARY_SYNCS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "registry_binary_syncs_total",
        "Binary mirror sync passes started",
    )
    .expect("static metric construction cannot fail")
});

static WEBHOOK_EVENTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("registry_webhook_events_total", "Webhook events accepted")
        .expect("static metric construction cannot fail")
});

/// Register all metrics; called once at startup.
pub fn register_metrics() {
    for metric in [
        &*MODULE_PUBLISHES,
        &*MODULE_DOWNLOADS,
        &*PROVIDER_DOWNLOADS,
        &*MIRROR_SYNCS,
        &*BINARY_SYNCS,
        &*WEBHOOK_EVENTS,
    ] {
        // Double registration only happens in tests; ignore it.
        REGISTRY.register(Box::new(metric.clone())).ok();
    }
}

pub fn increment_module_publishes() {
    MODULE_PUBLISHES.inc();
}

pub fn increment_module_downloads() {
    MODULE_DOWNLOADS.inc();
}

pub fn increment_provider_downloads() {
    PROVIDER_DOWNLOADS.inc();
}

pub fn increment_mirror_syncs() {
    MIRROR_SYNCS.inc();
}

pub fn increment_binary_syncs() {
    BINARY_SYNCS.inc();
}

pub fn increment_webhook_events() {
    WEBHOOK_EVENTS.inc();
}

/// Gather for the `/metrics` endpoint.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}
