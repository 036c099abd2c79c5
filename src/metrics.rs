//! Process-wide request counters, exposed in Prometheus text format on the
//! local `/metrics` endpoint. Observational only.

use std::sync::OnceLock;

use http::StatusCode;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn requests_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter =
            IntCounter::new("depot_requests_total", "Total requests").expect("metric");
        registry()
            .register(Box::new(counter.clone()))
            .expect("register metric");
        counter
    })
}

fn requests_status_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("depot_requests_status_total", "Responses by status code"),
            &["code"],
        )
        .expect("metric");
        registry()
            .register(Box::new(counter.clone()))
            .expect("register metric");
        counter
    })
}

fn cache_events_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("depot_cache_events_total", "Cache outcomes"),
            &["event"],
        )
        .expect("metric");
        registry()
            .register(Box::new(counter.clone()))
            .expect("register metric");
        counter
    })
}

pub fn record_request() {
    requests_total().inc();
}

pub fn record_status(status: StatusCode) {
    requests_status_total()
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn record_cache(event: &str) {
    cache_events_total().with_label_values(&[event]).inc();
}

pub fn render() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&registry().gather(), &mut buf) {
        log::warn!("metrics encode failed: {err}");
    }
    String::from_utf8(buf).unwrap_or_default()
}
