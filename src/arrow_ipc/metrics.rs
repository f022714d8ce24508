//! Process-wide metrics for the columnar serializer.
//!
//! Counters are monotonic, gauges track current/peak values via CAS
//! loops, and histograms keep min/max/sum aggregates without external
//! dependencies.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use crate::errors::SerializerErrorKind;

#[derive(Debug)]
pub struct ArrowCounters {
    pub total_requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub total_batches: AtomicU64,
    pub total_rows: AtomicU64,
    /// Bytes written pre-compression.
    pub total_bytes_written: AtomicU64,
    /// Bytes after compression.
    pub total_bytes_compressed: AtomicU64,
    pub compression_requests: AtomicU64,
    pub compression_errors: AtomicU64,
    pub memory_limit_errors: AtomicU64,
}

#[derive(Debug)]
pub struct ArrowGauges {
    pub active_streams: AtomicI64,
    pub peak_active_streams: AtomicI64,
    pub current_memory_bytes: AtomicU64,
    pub peak_memory_bytes: AtomicU64,
}

#[derive(Debug)]
pub struct ArrowHistograms {
    pub min_duration_us: AtomicU64,
    pub max_duration_us: AtomicU64,
    pub total_duration_us: AtomicU64,

    pub min_batch_rows: AtomicU64,
    pub max_batch_rows: AtomicU64,

    pub min_response_bytes: AtomicU64,
    pub max_response_bytes: AtomicU64,

    /// Compression ratio in parts-per-million of compressed/uncompressed.
    pub min_compression_ratio_ppm: AtomicU64,
    pub max_compression_ratio_ppm: AtomicU64,
    pub total_compression_ratio_ppm: AtomicU64,
    pub compression_ratio_count: AtomicU64,
}

#[derive(Debug)]
pub struct ArrowMetrics {
    pub counters: ArrowCounters,
    pub gauges: ArrowGauges,
    pub histograms: ArrowHistograms,
}

/// The process-wide metrics instance.
pub static ARROW_METRICS: ArrowMetrics = ArrowMetrics::new();

impl ArrowMetrics {
    pub const fn new() -> Self {
        Self {
            counters: ArrowCounters {
                total_requests: AtomicU64::new(0),
                successful_requests: AtomicU64::new(0),
                failed_requests: AtomicU64::new(0),
                total_batches: AtomicU64::new(0),
                total_rows: AtomicU64::new(0),
                total_bytes_written: AtomicU64::new(0),
                total_bytes_compressed: AtomicU64::new(0),
                compression_requests: AtomicU64::new(0),
                compression_errors: AtomicU64::new(0),
                memory_limit_errors: AtomicU64::new(0),
            },
            gauges: ArrowGauges {
                active_streams: AtomicI64::new(0),
                peak_active_streams: AtomicI64::new(0),
                current_memory_bytes: AtomicU64::new(0),
                peak_memory_bytes: AtomicU64::new(0),
            },
            histograms: ArrowHistograms {
                min_duration_us: AtomicU64::new(u64::MAX),
                max_duration_us: AtomicU64::new(0),
                total_duration_us: AtomicU64::new(0),
                min_batch_rows: AtomicU64::new(u64::MAX),
                max_batch_rows: AtomicU64::new(0),
                min_response_bytes: AtomicU64::new(u64::MAX),
                max_response_bytes: AtomicU64::new(0),
                min_compression_ratio_ppm: AtomicU64::new(u64::MAX),
                max_compression_ratio_ppm: AtomicU64::new(0),
                total_compression_ratio_ppm: AtomicU64::new(0),
                compression_ratio_count: AtomicU64::new(0),
            },
        }
    }

    /// Track a chunk of serializer working memory against the gauges.
    pub fn add_memory(&self, bytes: u64) {
        let current = self
            .gauges
            .current_memory_bytes
            .fetch_add(bytes, Ordering::Relaxed)
            + bytes;
        update_peak_u64(&self.gauges.peak_memory_bytes, current);
    }

    pub fn release_memory(&self, bytes: u64) {
        self.gauges
            .current_memory_bytes
            .fetch_sub(bytes.min(self.gauges.current_memory_bytes.load(Ordering::Relaxed)),
                Ordering::Relaxed);
    }

    fn record_batch_rows(&self, rows: u64) {
        update_min_u64(&self.histograms.min_batch_rows, rows);
        update_peak_u64(&self.histograms.max_batch_rows, rows);
    }

    fn record_success(
        &self,
        started: Instant,
        rows: u64,
        batches: u64,
        bytes_written: u64,
        bytes_compressed: Option<u64>,
    ) {
        let duration_us = started.elapsed().as_micros() as u64;

        self.counters
            .successful_requests
            .fetch_add(1, Ordering::Relaxed);
        self.counters.total_batches.fetch_add(batches, Ordering::Relaxed);
        self.counters.total_rows.fetch_add(rows, Ordering::Relaxed);
        self.counters
            .total_bytes_written
            .fetch_add(bytes_written, Ordering::Relaxed);

        update_min_u64(&self.histograms.min_duration_us, duration_us);
        update_peak_u64(&self.histograms.max_duration_us, duration_us);
        self.histograms
            .total_duration_us
            .fetch_add(duration_us, Ordering::Relaxed);

        let response_bytes = bytes_compressed.unwrap_or(bytes_written);
        update_min_u64(&self.histograms.min_response_bytes, response_bytes);
        update_peak_u64(&self.histograms.max_response_bytes, response_bytes);

        if let Some(compressed) = bytes_compressed {
            self.counters
                .compression_requests
                .fetch_add(1, Ordering::Relaxed);
            self.counters
                .total_bytes_compressed
                .fetch_add(compressed, Ordering::Relaxed);
            if bytes_written > 0 {
                let ppm = compressed.saturating_mul(1_000_000) / bytes_written;
                update_min_u64(&self.histograms.min_compression_ratio_ppm, ppm);
                update_peak_u64(&self.histograms.max_compression_ratio_ppm, ppm);
                self.histograms
                    .total_compression_ratio_ppm
                    .fetch_add(ppm, Ordering::Relaxed);
                self.histograms
                    .compression_ratio_count
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn record_failure(&self, kind: SerializerErrorKind) {
        self.counters.failed_requests.fetch_add(1, Ordering::Relaxed);
        match kind {
            SerializerErrorKind::Memory => {
                self.counters
                    .memory_limit_errors
                    .fetch_add(1, Ordering::Relaxed);
            }
            SerializerErrorKind::Compression => {
                self.counters
                    .compression_errors
                    .fetch_add(1, Ordering::Relaxed);
            }
            SerializerErrorKind::Abandoned => {}
        }
    }
}

fn update_peak_u64(slot: &AtomicU64, candidate: u64) {
    let mut current = slot.load(Ordering::Relaxed);
    while candidate > current {
        match slot.compare_exchange_weak(current, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

fn update_min_u64(slot: &AtomicU64, candidate: u64) {
    let mut current = slot.load(Ordering::Relaxed);
    while candidate < current {
        match slot.compare_exchange_weak(current, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

fn update_peak_i64(slot: &AtomicI64, candidate: i64) {
    let mut current = slot.load(Ordering::Relaxed);
    while candidate > current {
        match slot.compare_exchange_weak(current, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

/// Scoped lifecycle marker for one serialization request.
///
/// Construction increments `active_streams` and `total_requests`. The
/// request must be closed with [`StreamMarker::success`] or
/// [`StreamMarker::failure`]; dropping an unmarked marker records a
/// failure of kind `abandoned`.
pub struct StreamMarker {
    metrics: &'static ArrowMetrics,
    started: Instant,
    completed: bool,
}

impl StreamMarker {
    pub fn start() -> Self {
        Self::start_with(&ARROW_METRICS)
    }

    pub fn start_with(metrics: &'static ArrowMetrics) -> Self {
        metrics.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        let active = metrics.gauges.active_streams.fetch_add(1, Ordering::Relaxed) + 1;
        update_peak_i64(&metrics.gauges.peak_active_streams, active);
        Self {
            metrics,
            started: Instant::now(),
            completed: false,
        }
    }

    pub fn record_batch(&self, rows: u64) {
        self.metrics.record_batch_rows(rows);
    }

    pub fn success(
        mut self,
        rows: u64,
        batches: u64,
        bytes_written: u64,
        bytes_compressed: Option<u64>,
    ) {
        self.metrics
            .record_success(self.started, rows, batches, bytes_written, bytes_compressed);
        self.finish();
    }

    pub fn failure(mut self, kind: SerializerErrorKind) {
        self.metrics.record_failure(kind);
        self.finish();
    }

    /// Count a compression fallback without failing the request.
    pub fn compression_error(&self) {
        self.metrics
            .counters
            .compression_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    fn finish(&mut self) {
        self.completed = true;
        self.metrics.gauges.active_streams.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for StreamMarker {
    fn drop(&mut self) {
        if !self.completed {
            self.metrics.record_failure(SerializerErrorKind::Abandoned);
            self.metrics.gauges.active_streams.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
