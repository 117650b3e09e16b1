//! Cancellation signal and the two concurrency gates.
//!
//! - `ApiGate` bounds provider calls in flight across every document and phase.
//! - `PipelineGate` bounds how many document pipelines run at once.
//!
//! The gates are independent: a pipeline slot never implies an API permit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::gateway::{ChatGateway, ChatRequest, ChatResponse, ProviderError};

use super::stats::{ActivePipeline, RunStats};

// =============================================================================
// Cancellation
// =============================================================================

/// Run-wide cooperative cancellation. Cheap to clone; `cancel()` may be called
/// from any thread at any time.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.inner.flag.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel can't slip between.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// =============================================================================
// API gate
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GatedCallError {
    #[error("cancelled before the call was issued")]
    Cancelled,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Every provider call goes through here: acquire a permit, call, release.
#[derive(Clone)]
pub struct ApiGate {
    gateway: Arc<dyn ChatGateway>,
    permits: Arc<Semaphore>,
    stats: Arc<RunStats>,
    cancel: CancelSignal,
    run_id: Uuid,
    budget_nanodollars: Option<i64>,
    budget_exhausted: Arc<AtomicBool>,
}

impl ApiGate {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        max_in_flight: usize,
        stats: Arc<RunStats>,
        cancel: CancelSignal,
        run_id: Uuid,
    ) -> Self {
        Self {
            gateway,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            stats,
            cancel,
            run_id,
            budget_nanodollars: None,
            budget_exhausted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the run once recorded spend reaches `limit`.
    pub fn with_budget(mut self, limit: Option<i64>) -> Self {
        self.budget_nanodollars = limit;
        self
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub fn stats(&self) -> &Arc<RunStats> {
        &self.stats
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn budget_exhausted(&self) -> bool {
        self.budget_exhausted.load(Ordering::SeqCst)
    }

    pub async fn call(&self, mut req: ChatRequest) -> Result<ChatResponse, GatedCallError> {
        if self.cancel.is_cancelled() {
            self.stats.record_skipped();
            return Err(GatedCallError::Cancelled);
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            // The semaphore is never closed, so an error here only means shutdown.
            permit = self.permits.acquire() => permit.ok(),
        };
        let Some(_permit) = permit else {
            self.stats.record_skipped();
            return Err(GatedCallError::Cancelled);
        };
        if self.cancel.is_cancelled() {
            self.stats.record_skipped();
            return Err(GatedCallError::Cancelled);
        }

        req.attribution.run_id = Some(self.run_id);
        let result = {
            let _in_flight = self.stats.begin_call();
            self.gateway.chat(req).await
        };

        match result {
            Ok(resp) => {
                self.stats.record_success(&resp);
                self.check_budget();
                Ok(resp)
            }
            Err(err) => {
                self.stats.record_failure();
                Err(err.into())
            }
        }
    }

    fn check_budget(&self) {
        let Some(limit) = self.budget_nanodollars else {
            return;
        };
        let spent = self.stats.cost_nanodollars();
        if spent >= limit && !self.budget_exhausted.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                run_id = %self.run_id,
                spent,
                limit,
                "cost budget exhausted, cancelling run"
            );
            self.cancel.cancel();
        }
    }
}

// =============================================================================
// Pipeline gate
// =============================================================================

/// Held by a running pipeline; releases its slot on drop.
pub struct PipelineSlot {
    // Fields drop in order: the active count falls before the permit frees.
    _active: ActivePipeline,
    _permit: OwnedSemaphorePermit,
}

#[derive(Clone)]
pub struct PipelineGate {
    permits: Arc<Semaphore>,
    stats: Arc<RunStats>,
}

impl PipelineGate {
    pub fn new(max_active: usize, stats: Arc<RunStats>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_active)),
            stats,
        }
    }

    /// Wait for a free slot. Returns `None` if cancellation wins.
    pub async fn admit(&self, cancel: &CancelSignal) -> Option<PipelineSlot> {
        if cancel.is_cancelled() {
            return None;
        }
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        }?;
        if cancel.is_cancelled() {
            return None;
        }
        Some(PipelineSlot {
            _active: self.stats.begin_pipeline(),
            _permit: permit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelled_resolves_for_waiters_registered_before_cancel() {
        let cancel = CancelSignal::new();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { cancel.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
        // Already-cancelled signals resolve immediately.
        cancel.cancelled().await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn admit_gives_up_when_cancelled_while_waiting() {
        let stats = RunStats::new();
        let gate = PipelineGate::new(1, stats.clone());
        let cancel = CancelSignal::new();

        let held = gate.admit(&cancel).await.expect("first slot");
        assert_eq!(stats.active_pipelines(), 1);

        let waiting = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.admit(&cancel).await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(!waiting.await.unwrap());

        drop(held);
        assert_eq!(stats.active_pipelines(), 0);
        assert!(gate.admit(&cancel).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn active_count_never_exceeds_cap_under_contention() {
        let stats = RunStats::new();
        let gate = PipelineGate::new(1, stats.clone());
        let cancel = CancelSignal::new();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    for _ in 0..200 {
                        let slot = gate.admit(&cancel).await.expect("slot");
                        tokio::task::yield_now().await;
                        drop(slot);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.peak_active_pipelines, 1);
        assert_eq!(stats.active_pipelines(), 0);
    }
}
