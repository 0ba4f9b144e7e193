use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Process-wide counters surfaced by `/health`.
#[derive(Debug, Default)]
pub struct AppMetrics {
    requests_total: AtomicU64,
    refund_previews_total: AtomicU64,
    cancellations_total: AtomicU64,
    cancellation_conflicts_total: AtomicU64,
    chat_fallback_total: AtomicU64,
    llm_calls_total: AtomicU64,
    total_latency_millis: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub refund_previews_total: u64,
    pub cancellations_total: u64,
    pub cancellation_conflicts_total: u64,
    pub chat_fallback_total: u64,
    pub llm_calls_total: u64,
    pub avg_latency_millis: f64,
}

impl AppMetrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_refund_preview(&self) {
        self.refund_previews_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cancellation(&self) {
        self.cancellations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cancellation_conflict(&self) {
        self.cancellation_conflicts_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chat_fallback(&self) {
        self.chat_fallback_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_llm_call(&self) {
        self.llm_calls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_latency(&self, duration: Duration) {
        self.total_latency_millis
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.requests_total.load(Ordering::Relaxed);
        let latency = self.total_latency_millis.load(Ordering::Relaxed);

        MetricsSnapshot {
            requests_total: requests,
            refund_previews_total: self.refund_previews_total.load(Ordering::Relaxed),
            cancellations_total: self.cancellations_total.load(Ordering::Relaxed),
            cancellation_conflicts_total: self
                .cancellation_conflicts_total
                .load(Ordering::Relaxed),
            chat_fallback_total: self.chat_fallback_total.load(Ordering::Relaxed),
            llm_calls_total: self.llm_calls_total.load(Ordering::Relaxed),
            avg_latency_millis: if requests == 0 {
                0.0
            } else {
                latency as f64 / requests as f64
            },
        }
    }
}

/// JSON logs, filtered by `RUST_LOG` when set. Safe to call more than once.
pub fn init_tracing(service_name: &str) {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}=info,trustroute_api=info,trustroute_agents=info,trustroute_storage=info,audit=info",
                service_name.replace('-', "_")
            ))
        });

        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_span_list(true)
            .init();
    });
}
