//! Pipeline counters and their Prometheus mirror

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Register descriptions for every metric the pipeline emits.
///
/// Call once after installing a recorder.
pub fn describe_metrics() {
    ::metrics::describe_counter!(
        "postguard_messages_received_total",
        "Deliveries taken off the input queue"
    );
    ::metrics::describe_counter!(
        "postguard_messages_total",
        "Inbound messages by processing outcome"
    );
    ::metrics::describe_counter!(
        "postguard_reloads_total",
        "Scoring resource reload attempts by result"
    );
    ::metrics::describe_histogram!(
        "postguard_score_latency_us",
        ::metrics::Unit::Microseconds,
        "Time spent scoring one message"
    );
    ::metrics::describe_histogram!(
        "postguard_score",
        "Distribution of flag-class probabilities"
    );
}

/// Counters for the scoring consumer
#[derive(Clone, Default)]
pub struct PipelineMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    received: AtomicU64,
    published: AtomicU64,
    not_flagged: AtomicU64,
    malformed: AtomicU64,
    inference_failed: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    reloads: AtomicU64,
    reload_failures: AtomicU64,
    score_latency_us: AtomicU64,
    scored: AtomicU64,
}

fn outcome(name: &'static str) {
    ::metrics::counter!("postguard_messages_total", "outcome" => name).increment(1);
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A delivery was taken off the input queue
    pub fn record_received(&self) {
        self.inner.received.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("postguard_messages_received_total").increment(1);
    }

    /// A flagged result was republished
    pub fn record_published(&self) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        outcome("published");
    }

    /// Scored at or below the threshold
    pub fn record_not_flagged(&self) {
        self.inner.not_flagged.fetch_add(1, Ordering::Relaxed);
        outcome("not_flagged");
    }

    /// Undecodable payload or missing identifier
    pub fn record_malformed(&self) {
        self.inner.malformed.fetch_add(1, Ordering::Relaxed);
        outcome("malformed");
    }

    pub fn record_inference_failed(&self) {
        self.inner.inference_failed.fetch_add(1, Ordering::Relaxed);
        outcome("inference_failed");
    }

    /// Rejected back to the queue for redelivery
    pub fn record_requeued(&self) {
        self.inner.requeued.fetch_add(1, Ordering::Relaxed);
        outcome("requeued");
    }

    /// Rejected without requeue after reaching the delivery limit
    pub fn record_dead_lettered(&self) {
        self.inner.dead_lettered.fetch_add(1, Ordering::Relaxed);
        outcome("dead_lettered");
    }

    /// Record one scoring call and the probability it produced
    pub fn record_score(&self, score: f32, latency_us: u64) {
        self.inner.scored.fetch_add(1, Ordering::Relaxed);
        self.inner
            .score_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);
        ::metrics::histogram!("postguard_score_latency_us").record(latency_us as f64);
        ::metrics::histogram!("postguard_score").record(score as f64);
    }

    pub fn record_reload(&self, success: bool) {
        let result = if success {
            self.inner.reloads.fetch_add(1, Ordering::Relaxed);
            "success"
        } else {
            self.inner.reload_failures.fetch_add(1, Ordering::Relaxed);
            "failure"
        };
        ::metrics::counter!("postguard_reloads_total", "result" => result).increment(1);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.inner.received.load(Ordering::Relaxed),
            published: self.inner.published.load(Ordering::Relaxed),
            not_flagged: self.inner.not_flagged.load(Ordering::Relaxed),
            malformed: self.inner.malformed.load(Ordering::Relaxed),
            inference_failed: self.inner.inference_failed.load(Ordering::Relaxed),
            requeued: self.inner.requeued.load(Ordering::Relaxed),
            dead_lettered: self.inner.dead_lettered.load(Ordering::Relaxed),
            reloads: self.inner.reloads.load(Ordering::Relaxed),
            reload_failures: self.inner.reload_failures.load(Ordering::Relaxed),
            scored: self.inner.scored.load(Ordering::Relaxed),
            score_latency_us: self.inner.score_latency_us.load(Ordering::Relaxed),
        }
    }

    /// Emit the current counters as one structured log line
    pub fn log_summary(&self) {
        let s = self.snapshot();
        tracing::info!(
            received = s.received,
            published = s.published,
            not_flagged = s.not_flagged,
            malformed = s.malformed,
            inference_failed = s.inference_failed,
            requeued = s.requeued,
            dead_lettered = s.dead_lettered,
            reloads = s.reloads,
            reload_failures = s.reload_failures,
            avg_score_latency_us = s.avg_score_latency_us(),
            "Pipeline counters"
        );
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub published: u64,
    pub not_flagged: u64,
    pub malformed: u64,
    pub inference_failed: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub reloads: u64,
    pub reload_failures: u64,
    pub scored: u64,
    pub score_latency_us: u64,
}

impl MetricsSnapshot {
    /// Messages that reached a terminal outcome (acknowledged or dead-lettered)
    pub fn settled(&self) -> u64 {
        self.published + self.not_flagged + self.malformed + self.inference_failed + self.dead_lettered
    }

    pub fn avg_score_latency_us(&self) -> u64 {
        if self.scored == 0 {
            0
        } else {
            self.score_latency_us / self.scored
        }
    }

    /// Share of scored messages that were republished
    pub fn flag_rate(&self) -> f64 {
        let decided = self.published + self.not_flagged;
        if decided == 0 {
            0.0
        } else {
            self.published as f64 / decided as f64
        }
    }
}
