//! Pipeline counters for health and stats reporting.
//!
//! Counters are atomics and latency is a bounded rolling window, so recording
//! from concurrent queries never blocks on anything but a short mutex.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Query and ingestion counters.
#[derive(Debug)]
pub struct PipelineMetrics {
    documents_processed: AtomicU64,
    documents_failed: AtomicU64,
    chunks_indexed: AtomicU64,
    total_queries: AtomicU64,
    failed_queries: AtomicU64,
    no_source_queries: AtomicU64,
    fallback_answers: AtomicU64,
    timeouts: AtomicU64,
    latencies: Mutex<VecDeque<u64>>,
    window: usize,
    last_updated: Mutex<DateTime<Utc>>,
    start_time: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new(500)
    }
}

impl PipelineMetrics {
    pub fn new(window: usize) -> Self {
        Self {
            documents_processed: AtomicU64::new(0),
            documents_failed: AtomicU64::new(0),
            chunks_indexed: AtomicU64::new(0),
            total_queries: AtomicU64::new(0),
            failed_queries: AtomicU64::new(0),
            no_source_queries: AtomicU64::new(0),
            fallback_answers: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(window.max(1))),
            window: window.max(1),
            last_updated: Mutex::new(Utc::now()),
            start_time: Instant::now(),
        }
    }

    fn touch(&self) {
        if let Ok(mut ts) = self.last_updated.lock() {
            *ts = Utc::now();
        }
    }

    fn push_latency(&self, ms: u64) {
        if let Ok(mut window) = self.latencies.lock() {
            if window.len() == self.window {
                window.pop_front();
            }
            window.push_back(ms);
        }
    }

    /// Seed document and chunk counts, e.g. after rehydrating from the store.
    pub fn seed(&self, documents: u64, chunks: u64) {
        self.documents_processed.store(documents, Ordering::Relaxed);
        self.chunks_indexed.store(chunks, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_document(&self, chunks: usize) {
        self.documents_processed.fetch_add(1, Ordering::Relaxed);
        self.chunks_indexed
            .fetch_add(chunks as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Chunks added to the index outside a full ingest.
    pub fn record_chunks_indexed(&self, chunks: usize) {
        self.chunks_indexed
            .fetch_add(chunks as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_document_failed(&self) {
        self.documents_failed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// A document and its chunks were removed.
    pub fn record_document_removed(&self, chunks: usize) {
        let _ = self
            .documents_processed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        let _ = self
            .chunks_indexed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(chunks as u64))
            });
        self.touch();
    }

    pub fn record_answered(&self, latency_ms: u64, fallback_used: bool) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        if fallback_used {
            self.fallback_answers.fetch_add(1, Ordering::Relaxed);
        }
        self.push_latency(latency_ms);
        self.touch();
    }

    pub fn record_no_sources(&self, latency_ms: u64) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.no_source_queries.fetch_add(1, Ordering::Relaxed);
        self.push_latency(latency_ms);
        self.touch();
    }

    pub fn record_failed(&self, latency_ms: u64, timed_out: bool) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.failed_queries.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        self.push_latency(latency_ms);
        self.touch();
    }

    pub fn documents_processed(&self) -> u64 {
        self.documents_processed.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Mean latency over the rolling window, 0 when empty.
    pub fn avg_response_time_ms(&self) -> f64 {
        let Ok(window) = self.latencies.lock() else {
            return 0.0;
        };
        if window.is_empty() {
            return 0.0;
        }
        window.iter().sum::<u64>() as f64 / window.len() as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_processed: self.documents_processed.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            total_chunks: self.chunks_indexed.load(Ordering::Relaxed),
            total_queries: self.total_queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            no_source_queries: self.no_source_queries.load(Ordering::Relaxed),
            fallback_answers: self.fallback_answers.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            avg_response_time_ms: self.avg_response_time_ms(),
            last_updated: self
                .last_updated
                .lock()
                .map(|ts| *ts)
                .unwrap_or_else(|_| Utc::now()),
        }
    }
}

/// Point-in-time view of `PipelineMetrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub documents_processed: u64,
    pub documents_failed: u64,
    pub total_chunks: u64,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub no_source_queries: u64,
    pub fallback_answers: u64,
    pub timeouts: u64,
    pub avg_response_time_ms: f64,
    pub last_updated: DateTime<Utc>,
}
