//! DocumentPipeline: the per-document state machine.
//!
//! ```text
//! PENDING → GENERATING → PAIRWISE_EVAL → COMBINING → POST_COMBINE_EVAL → COMPLETED
//!                 │             │              │              │
//!                 └─────────────┴──────────────┴──────────────┴──→ COMPLETED_WITH_ERRORS
//!                                                                  FAILED | CANCELLED
//! ```
//!
//! Disabled phases are skipped (with a `phase_skipped` event). Per-call
//! failures are recorded in `errors` and swallowed; a phase that fails as a
//! whole degrades the document to COMPLETED_WITH_ERRORS, except generation
//! producing nothing (FAILED) and a combine failure under
//! `CombineFailurePolicy::FailDocument` (FAILED). Cancellation is observed
//! between phases and inside every gated call, and keeps partial results.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};

use super::combine::{CombineError, CombineStage};
use super::config::{CombineFailurePolicy, DocumentInput, RunConfiguration};
use super::gate::ApiGate;
use super::generation::{generation_tasks, EvalOutcome, GenerationOutput, GenerationUnit};
use super::timeline::{now_epoch_ms, NoopTimelineSink, TimelineSink};
use super::tournament::{Candidate, PairwiseTournament, TournamentError};
use super::types::{
    ComparisonRecord, DocumentResult, DocumentStatus, SingleEvalResult, TimelineEvent,
    TimelineEventKind, Variant, WinnerSource,
};
use super::DocumentScope;

/// Tournament id of the combined output in the post-combine comparison.
pub const COMBINED_CANDIDATE_ID: &str = "combined";

/// Why a pipeline stopped before reaching the end of its phases.
enum PipelineAbort {
    Cancelled(&'static str),
    /// Carries the timeline event kind the failure is reported under.
    Failed(TimelineEventKind, String),
}

pub struct DocumentPipeline {
    document: DocumentInput,
    settings: Arc<RunConfiguration>,
    gate: ApiGate,
    timeline: Arc<dyn TimelineSink>,
    run_started: Instant,
}

impl DocumentPipeline {
    pub fn new(document: DocumentInput, settings: Arc<RunConfiguration>, gate: ApiGate) -> Self {
        Self {
            document,
            settings,
            gate,
            timeline: Arc::new(NoopTimelineSink),
            run_started: Instant::now(),
        }
    }

    /// Mirror timeline events to `sink`; `elapsed_ms` is measured from `run_started`.
    pub fn with_timeline(mut self, sink: Arc<dyn TimelineSink>, run_started: Instant) -> Self {
        self.timeline = sink;
        self.run_started = run_started;
        self
    }

    /// Drive the document to a terminal status. Never fails: every outcome,
    /// including cancellation, is expressed in the returned result.
    pub async fn run(self) -> DocumentResult {
        let started = Instant::now();
        let mut record = DocumentRecord {
            result: DocumentResult::new(&self.document),
            timeline: Arc::clone(&self.timeline),
            run_started: self.run_started,
            next_seq: 0,
        };
        tracing::debug!(document_id = %self.document.id, "pipeline started");

        let status = match self.drive(&mut record).await {
            Ok(status) => status,
            Err(PipelineAbort::Cancelled(phase)) => {
                record.emit(TimelineEventKind::Error, format!("cancelled during {phase}"));
                DocumentStatus::Cancelled
            }
            Err(PipelineAbort::Failed(kind, reason)) => {
                record.fail(kind, reason);
                DocumentStatus::Failed
            }
        };
        record.transition(status);

        let mut result = record.result;
        result.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            document_id = %result.document_id,
            status = %result.status,
            variants = result.variants.len(),
            errors = result.errors.len(),
            cost_nanodollars = result.cost_nanodollars,
            duration_ms = result.duration_ms,
            "document finished"
        );
        result
    }

    async fn drive(&self, record: &mut DocumentRecord) -> Result<DocumentStatus, PipelineAbort> {
        let scope = DocumentScope {
            document: &self.document,
            settings: &self.settings,
            gate: &self.gate,
        };
        let mut degraded = false;

        self.checkpoint("generation")?;
        record.transition(DocumentStatus::Generating);
        self.generate(scope, record).await?;

        self.checkpoint("pairwise evaluation")?;
        degraded |= self.select_winner(scope, record).await?;

        self.checkpoint("combine")?;
        degraded |= self.combine(scope, record).await?;

        self.checkpoint("post-combine evaluation")?;
        degraded |= self.post_combine_eval(scope, record).await?;

        Ok(if degraded {
            DocumentStatus::CompletedWithErrors
        } else {
            DocumentStatus::Completed
        })
    }

    fn checkpoint(&self, phase: &'static str) -> Result<(), PipelineAbort> {
        if self.gate.cancel_signal().is_cancelled() {
            return Err(PipelineAbort::Cancelled(phase));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Phase 1: generation (+ inline single eval)
    // -------------------------------------------------------------------------

    async fn generate(
        &self,
        scope: DocumentScope<'_>,
        record: &mut DocumentRecord,
    ) -> Result<(), PipelineAbort> {
        let tasks = generation_tasks(&self.settings.generators, self.settings.iterations);
        let unit = GenerationUnit::new(scope);
        let unit = &unit;
        let mut cancelled = false;

        // All tasks are in flight at once; the API gate does the limiting.
        let width = tasks.len().max(1);
        let runs: Vec<_> = tasks.iter().map(|task| unit.run(task)).collect();
        let mut results = stream::iter(runs).buffer_unordered(width);
        while let Some(result) = results.next().await {
            match result {
                Ok(output) => cancelled |= record.store_variant(output),
                Err(e) if e.is_cancelled() => cancelled = true,
                Err(e) => record.fail(TimelineEventKind::GenerationFailed, e.to_string()),
            }
        }
        drop(results);

        if cancelled || self.gate.cancel_signal().is_cancelled() {
            return Err(PipelineAbort::Cancelled("generation"));
        }
        if record.result.variants.is_empty() {
            return Err(PipelineAbort::Failed(
                TimelineEventKind::Error,
                "no variants generated".to_string(),
            ));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Phase 2: pairwise tournament, or fallback winner
    // -------------------------------------------------------------------------

    /// Returns whether the phase degraded the document.
    async fn select_winner(
        &self,
        scope: DocumentScope<'_>,
        record: &mut DocumentRecord,
    ) -> Result<bool, PipelineAbort> {
        let mut degraded = false;
        let variant_count = record.result.variants.len();

        if !self.settings.enable_pairwise {
            record.emit(TimelineEventKind::PhaseSkipped, "pairwise evaluation disabled");
        } else if variant_count < 2 {
            record.emit(
                TimelineEventKind::PhaseSkipped,
                format!("pairwise evaluation needs 2 variants, have {variant_count}"),
            );
        } else {
            record.transition(DocumentStatus::PairwiseEval);
            let pool: Vec<(String, String)> = record
                .result
                .variants
                .iter()
                .map(|v| (v.variant_id.clone(), v.content.clone()))
                .collect();
            let candidates: Vec<Candidate<'_>> = pool
                .iter()
                .map(|(id, content)| Candidate { id, content })
                .collect();

            let outcome = PairwiseTournament::new(scope)
                .run(&candidates, |cmp| record.note_comparison(cmp))
                .await;
            match outcome {
                Ok(outcome) => {
                    record.result.cost_nanodollars += outcome.cost_nanodollars;
                    record.choose_winner(outcome.winner_id.clone(), WinnerSource::Tournament);
                    record.result.pairwise = Some(outcome);
                    return Ok(false);
                }
                Err(TournamentError::Cancelled) => {
                    return Err(PipelineAbort::Cancelled("pairwise evaluation"))
                }
                Err(TournamentError::NoSuccessfulComparisons {
                    attempted,
                    last_error,
                    cost_nanodollars,
                }) => {
                    record.result.cost_nanodollars += cost_nanodollars;
                    record.fail(
                        TimelineEventKind::Error,
                        format!(
                            "pairwise evaluation failed: all {attempted} comparisons failed ({last_error})"
                        ),
                    );
                    degraded = true;
                }
                Err(e @ TournamentError::TooFewCandidates(_)) => {
                    record.fail(TimelineEventKind::Error, e.to_string());
                    degraded = true;
                }
            }
        }

        if let Some((winner_id, source)) =
            fallback_winner(&record.result.variants, |id| record.result.evaluations.get(id))
        {
            record.choose_winner(winner_id, source);
        }
        Ok(degraded)
    }

    // -------------------------------------------------------------------------
    // Phase 3: combine
    // -------------------------------------------------------------------------

    async fn combine(
        &self,
        scope: DocumentScope<'_>,
        record: &mut DocumentRecord,
    ) -> Result<bool, PipelineAbort> {
        if !self.settings.enable_combine {
            record.emit(TimelineEventKind::PhaseSkipped, "combine disabled");
            return Ok(false);
        }
        let Some(winner) = record.result.winner().cloned() else {
            record.emit(TimelineEventKind::PhaseSkipped, "no winner to combine");
            return Ok(false);
        };

        record.transition(DocumentStatus::Combining);
        let runner_up_ids = runner_ups(&record.result, self.settings.combine_runner_ups);
        let runner_up_variants: Vec<&Variant> = runner_up_ids
            .iter()
            .filter_map(|id| record.result.variant(id))
            .collect();

        match CombineStage::new(scope).run(&winner, &runner_up_variants).await {
            Ok(combined) => {
                record.result.add_usage(
                    combined.input_tokens,
                    combined.output_tokens,
                    combined.cost_nanodollars,
                );
                record.emit(
                    TimelineEventKind::Combined,
                    format!(
                        "combined {} with {} runner-up(s) using {}",
                        combined.winner_variant_id,
                        combined.runner_up_ids.len(),
                        combined.model
                    ),
                );
                record.result.combined = Some(combined);
                Ok(false)
            }
            Err(CombineError::Cancelled) => Err(PipelineAbort::Cancelled("combine")),
            Err(err) => {
                if let CombineError::EmptyContent { cost_nanodollars } = err {
                    record.result.cost_nanodollars += cost_nanodollars;
                }
                let message = err.to_string();
                match self.settings.combine_failure {
                    CombineFailurePolicy::Degrade => {
                        record.fail(TimelineEventKind::CombineFailed, message);
                        Ok(true)
                    }
                    CombineFailurePolicy::FailDocument => {
                        Err(PipelineAbort::Failed(TimelineEventKind::CombineFailed, message))
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Phase 4: post-combine evaluation
    // -------------------------------------------------------------------------

    async fn post_combine_eval(
        &self,
        scope: DocumentScope<'_>,
        record: &mut DocumentRecord,
    ) -> Result<bool, PipelineAbort> {
        if !self.settings.enable_post_combine_eval {
            record.emit(TimelineEventKind::PhaseSkipped, "post-combine evaluation disabled");
            return Ok(false);
        }
        let (Some(winner), Some(combined)) = (
            record.result.winner().cloned(),
            record.result.combined.clone(),
        ) else {
            record.emit(
                TimelineEventKind::PhaseSkipped,
                "post-combine evaluation needs a combined output",
            );
            return Ok(false);
        };

        record.transition(DocumentStatus::PostCombineEval);
        let candidates = [
            Candidate {
                id: &winner.variant_id,
                content: &winner.content,
            },
            Candidate {
                id: COMBINED_CANDIDATE_ID,
                content: &combined.content,
            },
        ];
        let outcome = PairwiseTournament::new(scope)
            .run(&candidates, |cmp| record.note_comparison(cmp))
            .await;
        match outcome {
            Ok(outcome) => {
                record.result.cost_nanodollars += outcome.cost_nanodollars;
                record.emit(
                    TimelineEventKind::WinnerSelected,
                    format!("post-combine preferred {}", outcome.winner_id),
                );
                record.result.post_combine = Some(outcome);
                Ok(false)
            }
            Err(TournamentError::Cancelled) => Err(PipelineAbort::Cancelled("post-combine evaluation")),
            Err(err) => {
                if let TournamentError::NoSuccessfulComparisons {
                    cost_nanodollars, ..
                } = &err
                {
                    record.result.cost_nanodollars += cost_nanodollars;
                }
                record.fail(
                    TimelineEventKind::Error,
                    format!("post-combine evaluation failed: {err}"),
                );
                Ok(true)
            }
        }
    }
}

// =============================================================================
// Document record: result + timeline emission
// =============================================================================

struct DocumentRecord {
    result: DocumentResult,
    timeline: Arc<dyn TimelineSink>,
    run_started: Instant,
    next_seq: u64,
}

impl DocumentRecord {
    fn emit(&mut self, kind: TimelineEventKind, message: impl Into<String>) {
        let event = TimelineEvent {
            document_id: self.result.document_id.clone(),
            seq: self.next_seq,
            phase: self.result.status,
            kind,
            message: message.into(),
            elapsed_ms: self.run_started.elapsed().as_millis() as u64,
            timestamp_ms: now_epoch_ms(),
        };
        self.next_seq += 1;
        if let Err(e) = self.timeline.record(&event) {
            tracing::warn!(document_id = %event.document_id, error = %e, "timeline sink rejected event");
        }
        self.result.timeline.push(event);
    }

    /// Record a non-fatal error on the document.
    fn fail(&mut self, kind: TimelineEventKind, message: String) {
        tracing::warn!(document_id = %self.result.document_id, error = %message, "document error");
        self.emit(kind, message.clone());
        self.result.errors.push(message);
    }

    /// Move to `status` unless already terminal.
    fn transition(&mut self, status: DocumentStatus) {
        if self.result.status.is_terminal() || self.result.status == status {
            return;
        }
        let from = self.result.status;
        self.result.status = status;
        tracing::debug!(document_id = %self.result.document_id, %from, to = %status, "status changed");
        self.emit(TimelineEventKind::StatusChanged, format!("{from} -> {status}"));
    }

    /// Store a finished generation. Returns whether its evaluation observed cancellation.
    fn store_variant(&mut self, output: GenerationOutput) -> bool {
        let GenerationOutput {
            mut variant,
            evaluation,
            eval_input_tokens,
            eval_output_tokens,
            eval_cost_nanodollars,
        } = output;
        variant.sequence = self.result.variants.len();
        self.result
            .add_usage(variant.input_tokens, variant.output_tokens, variant.cost_nanodollars);
        self.result
            .add_usage(eval_input_tokens, eval_output_tokens, eval_cost_nanodollars);
        self.emit(
            TimelineEventKind::VariantGenerated,
            format!(
                "{} from {}/{}#{}",
                variant.variant_id, variant.generator, variant.model, variant.iteration
            ),
        );

        let variant_id = variant.variant_id.clone();
        self.result.variants.push(variant);

        match evaluation {
            EvalOutcome::Skipped => false,
            EvalOutcome::Cancelled => true,
            EvalOutcome::Scored(eval) => {
                self.emit(
                    TimelineEventKind::VariantEvaluated,
                    format!("{variant_id} scored {:.2}", eval.score),
                );
                self.result.evaluations.insert(variant_id, eval);
                false
            }
            EvalOutcome::Failed(reason) => {
                self.fail(TimelineEventKind::EvaluationFailed, reason);
                false
            }
        }
    }

    fn note_comparison(&mut self, cmp: &ComparisonRecord) {
        match (&cmp.verdict, &cmp.error) {
            (Some(verdict), _) => self.emit(
                TimelineEventKind::ComparisonCompleted,
                format!("{} vs {}: {verdict:?}", cmp.candidate_a, cmp.candidate_b),
            ),
            (None, error) => self.fail(
                TimelineEventKind::ComparisonFailed,
                format!(
                    "comparison {} vs {} failed: {}",
                    cmp.candidate_a,
                    cmp.candidate_b,
                    error.as_deref().unwrap_or("no verdict")
                ),
            ),
        }
    }

    fn choose_winner(&mut self, winner_id: String, source: WinnerSource) {
        self.emit(
            TimelineEventKind::WinnerSelected,
            format!("{winner_id} ({})", winner_source_label(source)),
        );
        self.result.winner_id = Some(winner_id);
        self.result.winner_source = Some(source);
    }
}

fn winner_source_label(source: WinnerSource) -> &'static str {
    match source {
        WinnerSource::Tournament => "tournament",
        WinnerSource::SingleEval => "single eval",
        WinnerSource::SoleVariant => "sole variant",
        WinnerSource::FirstGenerated => "first generated",
    }
}

/// Winner without a tournament: the only variant, else the best single-eval
/// score (earliest wins ties), else the first generated.
pub fn fallback_winner<'a, F>(variants: &[Variant], eval_of: F) -> Option<(String, WinnerSource)>
where
    F: Fn(&str) -> Option<&'a SingleEvalResult>,
{
    match variants {
        [] => None,
        [only] => Some((only.variant_id.clone(), WinnerSource::SoleVariant)),
        [first, ..] => {
            let mut best: Option<(&Variant, f64)> = None;
            for variant in variants {
                let Some(eval) = eval_of(&variant.variant_id) else {
                    continue;
                };
                if best.map_or(true, |(_, score)| eval.score > score) {
                    best = Some((variant, eval.score));
                }
            }
            Some(match best {
                Some((variant, _)) => (variant.variant_id.clone(), WinnerSource::SingleEval),
                None => (first.variant_id.clone(), WinnerSource::FirstGenerated),
            })
        }
    }
}

/// Up to `limit` non-winner variant ids, best first: tournament ranking when
/// there is one, else single-eval score, else generation order.
pub fn runner_ups(result: &DocumentResult, limit: usize) -> Vec<String> {
    let winner = result.winner_id.as_deref();
    let is_runner_up = |id: &str| Some(id) != winner && result.variant(id).is_some();

    if let Some(pairwise) = &result.pairwise {
        return pairwise
            .ranking
            .iter()
            .filter(|id| is_runner_up(id))
            .take(limit)
            .cloned()
            .collect();
    }

    let mut ordered: Vec<&Variant> = result
        .variants
        .iter()
        .filter(|v| is_runner_up(&v.variant_id))
        .collect();
    let score = |v: &Variant| result.evaluations.get(&v.variant_id).map(|e| e.score);
    // Stable: unscored variants and equal scores keep generation order.
    ordered.sort_by(|a, b| match (score(a), score(b)) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(std::cmp::Ordering::Equal),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    ordered
        .into_iter()
        .take(limit)
        .map(|v| v.variant_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn variant(id: &str, sequence: usize) -> Variant {
        Variant {
            variant_id: id.into(),
            document_id: "doc".into(),
            generator: "g".into(),
            model: "m".into(),
            iteration: 0,
            sequence,
            content: format!("content of {id}"),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            latency_ms: 0,
        }
    }

    fn eval(id: &str, score: f64) -> SingleEvalResult {
        SingleEvalResult {
            variant_id: id.into(),
            model: "judge".into(),
            score,
            criteria: BTreeMap::new(),
            rationale: String::new(),
            cost_nanodollars: 0,
        }
    }

    #[test]
    fn sole_variant_wins_without_scores() {
        let variants = vec![variant("a", 0)];
        let winner = fallback_winner(&variants, |_| None);
        assert_eq!(winner, Some(("a".to_string(), WinnerSource::SoleVariant)));
    }

    #[test]
    fn best_score_wins_and_ties_go_to_earliest() {
        let variants = vec![variant("a", 0), variant("b", 1), variant("c", 2)];
        let evals: BTreeMap<String, SingleEvalResult> = [eval("a", 6.0), eval("b", 8.0), eval("c", 8.0)]
            .into_iter()
            .map(|e| (e.variant_id.clone(), e))
            .collect();
        let winner = fallback_winner(&variants, |id| evals.get(id));
        assert_eq!(winner, Some(("b".to_string(), WinnerSource::SingleEval)));
    }

    #[test]
    fn unscored_variants_fall_back_to_first_generated() {
        let variants = vec![variant("a", 0), variant("b", 1)];
        let winner = fallback_winner(&variants, |_| None);
        assert_eq!(winner, Some(("a".to_string(), WinnerSource::FirstGenerated)));
        assert_eq!(fallback_winner(&[], |_| None), None);
    }

    #[test]
    fn runner_ups_follow_scores_then_generation_order() {
        let doc = DocumentInput::new("doc", "Doc", "text");
        let mut result = DocumentResult::new(&doc);
        result.variants = vec![variant("a", 0), variant("b", 1), variant("c", 2), variant("d", 3)];
        result.evaluations.insert("c".into(), eval("c", 9.0));
        result.evaluations.insert("b".into(), eval("b", 5.0));
        result.winner_id = Some("c".into());

        assert_eq!(runner_ups(&result, 2), vec!["b", "a"]);
        assert_eq!(runner_ups(&result, 10), vec!["b", "a", "d"]);
        assert!(runner_ups(&result, 0).is_empty());
    }
}
