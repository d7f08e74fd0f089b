// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Batches --------
// outcome: completed | partial | failed | rejected
pub static BATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("batches_total", "allocation batches by outcome"),
        &["outcome"],
    )
    .unwrap()
});

pub static PIPELINE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "pipeline_transitions_total",
            "swap pipeline transitions (labels: from stage, outcome)",
        ),
        &["stage", "outcome"],
    )
    .unwrap()
});

// outcome: sufficient | approved | confirmed | failed
pub static APPROVALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("allowance_checks_total", "allowance gate results"),
        &["outcome"],
    )
    .unwrap()
});

pub static DUST: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "stranded_dust_base_units_total",
        "sell-token base units left unspent by rounding",
    )
    .unwrap()
});

// Latency from quote request -> order accepted (milliseconds)
pub static QUOTE_TO_SUBMIT_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "latency_quote_to_submit_ms",
            "Latency from quote request to order submission (ms)",
        )
        .buckets(vec![50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0]),
    )
    .unwrap()
});

pub static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("http_requests_total", "http requests (labels: route, status)"),
        &["route", "status"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_EXECUTION_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_execution_mode", "execution mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; a second init is a no-op
    for m in [
        REGISTRY.register(Box::new(BATCHES.clone())),
        REGISTRY.register(Box::new(PIPELINE_TRANSITIONS.clone())),
        REGISTRY.register(Box::new(APPROVALS.clone())),
        REGISTRY.register(Box::new(DUST.clone())),
        REGISTRY.register(Box::new(QUOTE_TO_SUBMIT_MS.clone())),
        REGISTRY.register(Box::new(HTTP_REQUESTS.clone())),
        REGISTRY.register(Box::new(CONFIG_EXECUTION_MODE.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}
