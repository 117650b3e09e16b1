//! RunCoordinator: validate, fan out one pipeline per document, aggregate.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::gateway::ChatGateway;

use super::config::{validate_run_configuration, DocumentInput, RunConfiguration};
use super::gate::{ApiGate, CancelSignal, PipelineGate};
use super::pipeline::DocumentPipeline;
use super::stats::RunStats;
use super::store::RunStore;
use super::timeline::{NoopTimelineSink, TimelineSink};
use super::types::{DocumentResult, DocumentStatus, RunResult, RunStatus};

/// Handles a caller keeps to observe or cancel a run from outside.
#[derive(Clone)]
pub struct RunControls {
    pub run_id: Uuid,
    pub cancel: CancelSignal,
    pub stats: Arc<RunStats>,
}

impl RunControls {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cancel: CancelSignal::new(),
            stats: RunStats::new(),
        }
    }
}

impl Default for RunControls {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RunCoordinator {
    gateway: Arc<dyn ChatGateway>,
    timeline: Arc<dyn TimelineSink>,
    store: Option<Arc<dyn RunStore>>,
}

impl RunCoordinator {
    pub fn new(gateway: Arc<dyn ChatGateway>) -> Self {
        Self {
            gateway,
            timeline: Arc::new(NoopTimelineSink),
            store: None,
        }
    }

    pub fn with_timeline(mut self, sink: Arc<dyn TimelineSink>) -> Self {
        self.timeline = sink;
        self
    }

    /// Persist each document as it finishes and the run at the end.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn execute(&self, config: RunConfiguration) -> RunResult {
        self.execute_with(config, RunControls::new()).await
    }

    /// Run every document to a terminal status. Never fails: an invalid
    /// configuration yields a FAILED run with the reason in `errors`.
    pub async fn execute_with(&self, config: RunConfiguration, controls: RunControls) -> RunResult {
        let started_at = Utc::now();
        let run_started = Instant::now();
        let RunControls {
            run_id,
            cancel,
            stats,
        } = controls;

        if let Err(e) = validate_run_configuration(&config) {
            tracing::error!(%run_id, error = %e, "invalid run configuration");
            let result = RunResult {
                run_id,
                status: RunStatus::Failed,
                cancelled: cancel.is_cancelled(),
                documents: Vec::new(),
                total_cost_nanodollars: 0,
                total_duration_ms: 0,
                wall_duration_ms: run_started.elapsed().as_millis() as u64,
                errors: vec![e.to_string()],
                stats: stats.snapshot(),
                started_at,
                finished_at: Utc::now(),
            };
            self.save_run(&result).await;
            return result;
        }

        tracing::info!(
            %run_id,
            documents = config.documents.len(),
            generations_per_document = config.generations_per_document(),
            max_api_concurrency = config.max_api_concurrency,
            max_active_pipelines = config.max_active_pipelines,
            "run started"
        );

        let settings = Arc::new(config);
        let gate = ApiGate::new(
            Arc::clone(&self.gateway),
            settings.max_api_concurrency,
            Arc::clone(&stats),
            cancel.clone(),
            run_id,
        )
        .with_budget(settings.cost_budget_nanodollars);
        let pipelines = PipelineGate::new(settings.max_active_pipelines, Arc::clone(&stats));

        // Admission happens in configuration order; a document waits here
        // until a slot frees up or the run is cancelled.
        let mut handles = Vec::with_capacity(settings.documents.len());
        for document in &settings.documents {
            let Some(slot) = pipelines.admit(&cancel).await else {
                handles.push(Admission::Skipped(document.clone()));
                continue;
            };
            let pipeline = DocumentPipeline::new(document.clone(), Arc::clone(&settings), gate.clone())
                .with_timeline(Arc::clone(&self.timeline), run_started);
            let store = self.store.clone();
            let handle = tokio::spawn(async move {
                let _slot = slot;
                let result = pipeline.run().await;
                if let Some(store) = store {
                    if let Err(e) = store.save_document(run_id, &result).await {
                        tracing::warn!(%run_id, document_id = %result.document_id, error = %e, "failed to persist document");
                    }
                }
                result
            });
            handles.push(Admission::Spawned(document.clone(), handle));
        }

        let mut documents = Vec::with_capacity(handles.len());
        for admission in handles {
            let result = match admission {
                Admission::Spawned(document, handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        let reason = join_failure(e);
                        tracing::error!(%run_id, document_id = %document.id, error = %reason, "pipeline task failed");
                        placeholder(&document, DocumentStatus::Failed, reason)
                    }
                },
                Admission::Skipped(document) => {
                    let result = placeholder(&document, DocumentStatus::Cancelled, "cancelled before start".to_string());
                    if let Some(store) = &self.store {
                        if let Err(e) = store.save_document(run_id, &result).await {
                            tracing::warn!(%run_id, document_id = %result.document_id, error = %e, "failed to persist document");
                        }
                    }
                    result
                }
            };
            documents.push(result);
        }

        let cancelled = cancel.is_cancelled();
        let mut errors = Vec::new();
        if gate.budget_exhausted() {
            errors.push("cost budget exhausted".to_string());
        }
        let statuses: Vec<DocumentStatus> = documents.iter().map(|d| d.status).collect();
        let status = RunStatus::derive(&statuses, cancelled);

        let result = RunResult {
            run_id,
            status,
            cancelled,
            total_cost_nanodollars: documents.iter().map(|d| d.cost_nanodollars).sum(),
            total_duration_ms: documents.iter().map(|d| d.duration_ms).sum(),
            wall_duration_ms: run_started.elapsed().as_millis() as u64,
            documents,
            errors,
            stats: stats.snapshot(),
            started_at,
            finished_at: Utc::now(),
        };

        tracing::info!(
            %run_id,
            status = %result.status,
            completed = result.count(DocumentStatus::Completed),
            with_errors = result.count(DocumentStatus::CompletedWithErrors),
            failed = result.count(DocumentStatus::Failed),
            cancelled = result.count(DocumentStatus::Cancelled),
            cost_nanodollars = result.total_cost_nanodollars,
            wall_ms = result.wall_duration_ms,
            "run finished"
        );

        self.save_run(&result).await;
        result
    }

    async fn save_run(&self, result: &RunResult) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_run(result).await {
                tracing::warn!(run_id = %result.run_id, error = %e, "failed to persist run");
            }
        }
    }
}

enum Admission {
    Spawned(DocumentInput, tokio::task::JoinHandle<DocumentResult>),
    Skipped(DocumentInput),
}

fn join_failure(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return format!("pipeline task failed: {err}");
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("pipeline panicked: {message}")
}

/// Terminal result for a document whose pipeline produced nothing itself.
fn placeholder(document: &DocumentInput, status: DocumentStatus, error: String) -> DocumentResult {
    let mut result = DocumentResult::new(document);
    result.status = status;
    result.errors.push(error);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panics_become_failure_messages() {
        let handle = tokio::spawn(async {
            if true {
                panic!("boom in pipeline");
            }
        });
        let err = handle.await.unwrap_err();
        assert_eq!(join_failure(err), "pipeline panicked: boom in pipeline");
    }

    #[test]
    fn placeholders_are_terminal_and_explain_themselves() {
        let doc = DocumentInput::new("d1", "", "text");
        let result = placeholder(&doc, DocumentStatus::Cancelled, "cancelled before start".into());
        assert!(result.status.is_terminal());
        assert_eq!(result.document_name, "d1");
        assert_eq!(result.errors, vec!["cancelled before start"]);
        assert!(result.variants.is_empty());
    }
}
