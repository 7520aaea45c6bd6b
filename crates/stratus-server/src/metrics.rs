//! Prometheus metrics.
//!
//! All series live in one registry exported at `/metrics` on the admin
//! listener. Provider operations are labelled by provider config name and
//! operation; DNS requests by request kind and response code.

use std::sync::LazyLock;
use std::time::Duration;

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts,
    Registry, TextEncoder,
};

const NAMESPACE: &str = "stratus";

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// DNS requests and their response codes.
pub static DNS_REQUESTS: LazyLock<CounterVec> = LazyLock::new(|| {
    let m = CounterVec::new(
        Opts::new(
            format!("{NAMESPACE}_dns_request_total"),
            "DNS requests and response codes.",
        ),
        // Kind rather than opcode/qtype: DNS encodes some commands as
        // opcode and some as record type.
        &["kind", "rcode"],
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(m.clone())).expect("register metric");
    m
});

pub static SYNC_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let m = IntCounter::new(
        format!("{NAMESPACE}_sync_errors_total"),
        "Errors while processing updated records during sync.",
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(m.clone())).expect("register metric");
    m
});

pub static PROPAGATE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let m = IntCounter::new(
        format!("{NAMESPACE}_propagate_errors_total"),
        "Errors ensuring dns changes have propagated at the provider.",
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(m.clone())).expect("register metric");
    m
});

/// Provider operation latency, by provider config name and operation.
pub static PROVIDER_OP: LazyLock<HistogramVec> = LazyLock::new(|| {
    let m = HistogramVec::new(
        HistogramOpts::new(
            format!("{NAMESPACE}_provider_op_duration_seconds"),
            "Provider operation duration.",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 20.0, 30.0]),
        &["provider", "op"],
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(m.clone())).expect("register metric");
    m
});

pub static PROVIDER_OP_ERRORS: LazyLock<CounterVec> = LazyLock::new(|| {
    let m = CounterVec::new(
        Opts::new(
            format!("{NAMESPACE}_provider_op_errors_total"),
            "Provider request errors.",
        ),
        &["provider", "op"],
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(m.clone())).expect("register metric");
    m
});

pub static SOA_GET: LazyLock<IntCounter> = LazyLock::new(|| {
    let m = IntCounter::new(
        format!("{NAMESPACE}_soa_get_total"),
        "SOA requests sent directly to authoritative name servers.",
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(m.clone())).expect("register metric");
    m
});

pub static SOA_GET_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let m = IntCounter::new(
        format!("{NAMESPACE}_soa_get_errors_total"),
        "Failed SOA requests to authoritative name servers.",
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(m.clone())).expect("register metric");
    m
});

pub static PANICS: LazyLock<IntCounter> = LazyLock::new(|| {
    let m = IntCounter::new(
        format!("{NAMESPACE}_panics_total"),
        "Recovered panics in background workers.",
    )
    .expect("valid metric definition");
    REGISTRY.register(Box::new(m.clone())).expect("register metric");
    m
});

/// Observes one provider operation.
pub fn observe_provider_op(provider: &str, op: &str, took: Duration, failed: bool) {
    PROVIDER_OP
        .with_label_values(&[provider, op])
        .observe(took.as_secs_f64());
    if failed {
        PROVIDER_OP_ERRORS.with_label_values(&[provider, op]).inc();
    }
}

/// Renders the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
