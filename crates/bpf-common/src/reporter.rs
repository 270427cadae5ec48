//! Internal accounting of what the tracer subsystem is doing.
//!
//! Every operation must be non-blocking and callable from any thread: the
//! pumps report from their read loops, the orchestrator from its control
//! thread, discovery from wherever it runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Default buckets for the batch-length histogram. Its maximum is bounded by
/// the configured batch length.
pub const DEFAULT_FLUSH_BUCKETS: &[u64] = &[0, 10, 20, 40, 80, 160, 320];

pub trait Reporter: Send + Sync + 'static {
    /// One batch of `batch_len` spans was flushed to the out channel.
    fn tracer_flush(&self, batch_len: usize);
    /// A ring-buffer record could not be decoded.
    fn tracer_decode_error(&self, kind: &str);
    fn instrument_process(&self, name: &str);
    fn uninstrument_process(&self, name: &str);
    fn otel_metric_export(&self, count: usize);
    fn otel_metric_export_error(&self, kind: &str);
    fn otel_trace_export(&self, count: usize);
    fn otel_trace_export_error(&self, kind: &str);
    fn informer_add_duration(&self, kind: &str, elapsed: Duration);
    fn informer_update_duration(&self, kind: &str, elapsed: Duration);
}

/// Reporter used when internal metrics are disabled.
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn tracer_flush(&self, _batch_len: usize) {}
    fn tracer_decode_error(&self, _kind: &str) {}
    fn instrument_process(&self, _name: &str) {}
    fn uninstrument_process(&self, _name: &str) {}
    fn otel_metric_export(&self, _count: usize) {}
    fn otel_metric_export_error(&self, _kind: &str) {}
    fn otel_trace_export(&self, _count: usize) {}
    fn otel_trace_export_error(&self, _kind: &str) {}
    fn informer_add_duration(&self, _kind: &str, _elapsed: Duration) {}
    fn informer_update_duration(&self, _kind: &str, _elapsed: Duration) {}
}

/// In-process reporter backed by atomics, scraped via [`snapshot`].
///
/// [`snapshot`]: AccountingReporter::snapshot
pub struct AccountingReporter {
    buckets: Vec<u64>,
    /// One counter per bucket, plus a trailing overflow slot.
    flush_counts: Vec<AtomicU64>,
    flushes: AtomicU64,
    decode_errors: AtomicU64,
    metric_exports: AtomicU64,
    metric_export_errors: AtomicU64,
    trace_exports: AtomicU64,
    trace_export_errors: AtomicU64,
    instrumented: Mutex<HashMap<String, i64>>,
    informer_durations: Mutex<HashMap<String, (u64, Duration)>>,
}

impl AccountingReporter {
    pub fn new(buckets: &[u64]) -> Self {
        let buckets = if buckets.is_empty() {
            DEFAULT_FLUSH_BUCKETS.to_vec()
        } else {
            buckets.to_vec()
        };
        let flush_counts = (0..=buckets.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            flush_counts,
            flushes: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            metric_exports: AtomicU64::new(0),
            metric_export_errors: AtomicU64::new(0),
            trace_exports: AtomicU64::new(0),
            trace_export_errors: AtomicU64::new(0),
            instrumented: Mutex::new(HashMap::new()),
            informer_durations: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self) -> ReporterSnapshot {
        ReporterSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_counts: self
                .flush_counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            metric_exports: self.metric_exports.load(Ordering::Relaxed),
            metric_export_errors: self.metric_export_errors.load(Ordering::Relaxed),
            trace_exports: self.trace_exports.load(Ordering::Relaxed),
            trace_export_errors: self.trace_export_errors.load(Ordering::Relaxed),
            instrumented: self.instrumented.lock().unwrap().clone(),
        }
    }

    fn gauge_add(&self, name: &str, delta: i64) {
        let mut gauges = self.instrumented.lock().unwrap();
        *gauges.entry(name.to_string()).or_insert(0) += delta;
    }
}

impl Default for AccountingReporter {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_BUCKETS)
    }
}

impl Reporter for AccountingReporter {
    fn tracer_flush(&self, batch_len: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        let idx = self
            .buckets
            .iter()
            .position(|&upper| batch_len as u64 <= upper)
            .unwrap_or(self.buckets.len());
        self.flush_counts[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn tracer_decode_error(&self, kind: &str) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        log::debug!("decode error: {kind}");
    }

    fn instrument_process(&self, name: &str) {
        self.gauge_add(name, 1);
    }

    fn uninstrument_process(&self, name: &str) {
        self.gauge_add(name, -1);
    }

    fn otel_metric_export(&self, count: usize) {
        self.metric_exports.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn otel_metric_export_error(&self, kind: &str) {
        self.metric_export_errors.fetch_add(1, Ordering::Relaxed);
        log::debug!("metric export error: {kind}");
    }

    fn otel_trace_export(&self, count: usize) {
        self.trace_exports.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn otel_trace_export_error(&self, kind: &str) {
        self.trace_export_errors.fetch_add(1, Ordering::Relaxed);
        log::debug!("trace export error: {kind}");
    }

    fn informer_add_duration(&self, kind: &str, elapsed: Duration) {
        let mut durations = self.informer_durations.lock().unwrap();
        let entry = durations
            .entry(format!("add/{kind}"))
            .or_insert((0, Duration::ZERO));
        entry.0 += 1;
        entry.1 += elapsed;
    }

    fn informer_update_duration(&self, kind: &str, elapsed: Duration) {
        let mut durations = self.informer_durations.lock().unwrap();
        let entry = durations
            .entry(format!("update/{kind}"))
            .or_insert((0, Duration::ZERO));
        entry.0 += 1;
        entry.1 += elapsed;
    }
}

#[derive(Debug, Clone)]
pub struct ReporterSnapshot {
    pub flushes: u64,
    pub flush_counts: Vec<u64>,
    pub decode_errors: u64,
    pub metric_exports: u64,
    pub metric_export_errors: u64,
    pub trace_exports: u64,
    pub trace_export_errors: u64,
    pub instrumented: HashMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_lengths_land_in_their_buckets() {
        let reporter = AccountingReporter::default();
        reporter.tracer_flush(0); // bucket 0
        reporter.tracer_flush(5); // bucket <=10
        reporter.tracer_flush(10); // bucket <=10
        reporter.tracer_flush(320); // last bucket
        reporter.tracer_flush(1000); // overflow

        let snap = reporter.snapshot();
        assert_eq!(snap.flushes, 5);
        assert_eq!(snap.flush_counts[0], 1);
        assert_eq!(snap.flush_counts[1], 2);
        assert_eq!(snap.flush_counts[6], 1);
        assert_eq!(*snap.flush_counts.last().unwrap(), 1);
    }

    #[test]
    fn process_gauge_moves_both_ways() {
        let reporter = AccountingReporter::default();
        reporter.instrument_process("api");
        reporter.instrument_process("api");
        reporter.uninstrument_process("api");

        let snap = reporter.snapshot();
        assert_eq!(snap.instrumented.get("api"), Some(&1));
    }

    #[test]
    fn export_counters_accumulate() {
        let reporter = AccountingReporter::default();
        reporter.otel_trace_export(12);
        reporter.otel_trace_export(3);
        reporter.otel_trace_export_error("timeout");
        reporter.tracer_decode_error("short record");

        let snap = reporter.snapshot();
        assert_eq!(snap.trace_exports, 15);
        assert_eq!(snap.trace_export_errors, 1);
        assert_eq!(snap.decode_errors, 1);
    }
}
