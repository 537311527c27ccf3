//! Prometheus metrics for the idempotency engine.
//!
//! Each recorder owns its registry, so several engines (or tests) can run in
//! one process without colliding in the global default registry.

use std::time::Duration;

use prometheus::{
    histogram_opts, opts, Encoder, Histogram, IntCounter, IntCounterVec, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct IdempotencyMetrics {
    registry: Registry,
    decisions_total: IntCounterVec,
    store_errors_total: IntCounter,
    lock_wait_seconds: Histogram,
}

impl Default for IdempotencyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let decisions_total = IntCounterVec::new(
            opts!("idempotency_decisions_total", "Requests classified by the idempotency engine"),
            &["outcome"],
        )
        .expect("failed to create idempotency_decisions_total");

        let store_errors_total = IntCounter::with_opts(opts!(
            "idempotency_store_errors_total",
            "Record store operations that failed"
        ))
        .expect("failed to create idempotency_store_errors_total");

        let lock_wait_seconds = Histogram::with_opts(histogram_opts!(
            "idempotency_lock_wait_seconds",
            "Time spent waiting for a per-key lock",
            vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 3.0]
        ))
        .expect("failed to create idempotency_lock_wait_seconds");

        registry
            .register(Box::new(decisions_total.clone()))
            .expect("failed to register idempotency_decisions_total");
        registry
            .register(Box::new(store_errors_total.clone()))
            .expect("failed to register idempotency_store_errors_total");
        registry
            .register(Box::new(lock_wait_seconds.clone()))
            .expect("failed to register idempotency_lock_wait_seconds");

        Self {
            registry,
            decisions_total,
            store_errors_total,
            lock_wait_seconds,
        }
    }

    pub fn record_decision(&self, outcome: &str) {
        self.decisions_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_store_error(&self) {
        self.store_errors_total.inc();
    }

    pub fn observe_lock_wait(&self, waited: Duration) {
        self.lock_wait_seconds.observe(waited.as_secs_f64());
    }

    /// Current count for one outcome label.
    pub fn decisions(&self, outcome: &str) -> u64 {
        self.decisions_total.with_label_values(&[outcome]).get()
    }

    pub fn store_errors(&self) -> u64 {
        self.store_errors_total.get()
    }

    /// Text exposition format for a `/metrics` endpoint.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
