//! Per-run counters for provider calls, spend and concurrency.
//!
//! One `RunStats` exists per run and is threaded to every gated call. There
//! is no process-wide tracker.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::gateway::ChatResponse;

#[derive(Debug, Default)]
pub struct RunStats {
    calls_started: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
    calls_skipped: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    cost_nanodollars: AtomicI64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    active_pipelines: AtomicUsize,
    peak_active_pipelines: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatsSnapshot {
    pub calls_started: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    /// Calls abandoned before issue because cancellation was observed.
    pub calls_skipped: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
    pub peak_in_flight: usize,
    pub peak_active_pipelines: usize,
}

impl RunStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark a provider call as issued. The returned guard holds the call's
    /// in-flight slot until dropped.
    pub fn begin_call(&self) -> InFlightCall<'_> {
        self.calls_started.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightCall { stats: self }
    }

    pub fn record_success(&self, resp: &ChatResponse) {
        self.calls_succeeded.fetch_add(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(resp.input_tokens as u64, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(resp.output_tokens as u64, Ordering::Relaxed);
        self.cost_nanodollars
            .fetch_add(resp.cost_nanodollars, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        self.calls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.calls_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a pipeline as active. The guard releases it on drop.
    pub fn begin_pipeline(self: &Arc<Self>) -> ActivePipeline {
        let now = self.active_pipelines.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active_pipelines.fetch_max(now, Ordering::SeqCst);
        ActivePipeline {
            stats: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn active_pipelines(&self) -> usize {
        self.active_pipelines.load(Ordering::SeqCst)
    }

    pub fn cost_nanodollars(&self) -> i64 {
        self.cost_nanodollars.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            calls_started: self.calls_started.load(Ordering::Relaxed),
            calls_succeeded: self.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            calls_skipped: self.calls_skipped.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            cost_nanodollars: self.cost_nanodollars.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            peak_active_pipelines: self.peak_active_pipelines.load(Ordering::SeqCst),
        }
    }
}

pub struct InFlightCall<'a> {
    stats: &'a RunStats,
}

impl Drop for InFlightCall<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ActivePipeline {
    stats: Arc<RunStats>,
}

impl Drop for ActivePipeline {
    fn drop(&mut self) {
        self.stats.active_pipelines.fetch_sub(1, Ordering::SeqCst);
    }
}
