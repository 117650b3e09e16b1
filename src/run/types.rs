//! Result data model for runs and documents.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::DocumentInput;
use super::stats::RunStatsSnapshot;

// =============================================================================
// Variants and evaluations
// =============================================================================

/// One generated candidate for a document. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variant {
    pub variant_id: String,
    pub document_id: String,
    pub generator: String,
    pub model: String,
    pub iteration: u32,
    /// Position in the document's generation (completion) order.
    pub sequence: usize,
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub latency_ms: u64,
}

/// Deterministic variant id for `(document, generator, model, iteration)`.
pub fn variant_id(document_id: &str, generator: &str, model: &str, iteration: u32) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in [document_id, generator, model].iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.update(b"|");
    hasher.update(&iteration.to_le_bytes());
    let hex = hasher.finalize().to_hex();
    format!("v-{}", &hex.as_str()[..12])
}

/// Score for a single variant from the single-document evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SingleEvalResult {
    pub variant_id: String,
    pub model: String,
    /// Overall score in `[0, 10]`.
    pub score: f64,
    #[serde(default)]
    pub criteria: BTreeMap<String, f64>,
    #[serde(default)]
    pub rationale: String,
    pub cost_nanodollars: i64,
}

// =============================================================================
// Pairwise
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    A,
    B,
    Tie,
}

/// One comparison between two candidates. `candidate_a` is always the one
/// generated first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonRecord {
    pub candidate_a: String,
    pub candidate_b: String,
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub error: Option<String>,
    pub cost_nanodollars: i64,
}

impl ComparisonRecord {
    pub fn succeeded(&self) -> bool {
        self.verdict.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tally {
    pub candidate_id: String,
    pub wins: u32,
    pub losses: u32,
    pub ties: u32,
    /// Win = 1, tie = 0.5.
    pub points: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairwiseOutcome {
    /// Candidate ids, best first.
    pub ranking: Vec<String>,
    /// Tallies in ranking order.
    pub tallies: Vec<Tally>,
    pub winner_id: String,
    pub comparisons: Vec<ComparisonRecord>,
    pub attempted: usize,
    pub failed: usize,
    pub cost_nanodollars: i64,
}

// =============================================================================
// Combine
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CombinedOutput {
    pub document_id: String,
    pub winner_variant_id: String,
    pub runner_up_ids: Vec<String>,
    pub model: String,
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Generating,
    PairwiseEval,
    Combining,
    PostCombineEval,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Generating => "GENERATING",
            DocumentStatus::PairwiseEval => "PAIRWISE_EVAL",
            DocumentStatus::Combining => "COMBINING",
            DocumentStatus::PostCombineEval => "POST_COMBINE_EVAL",
            DocumentStatus::Completed => "COMPLETED",
            DocumentStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            DocumentStatus::Failed => "FAILED",
            DocumentStatus::Cancelled => "CANCELLED",
        }
    }

    /// Terminal states are sinks: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Completed
                | DocumentStatus::CompletedWithErrors
                | DocumentStatus::Failed
                | DocumentStatus::Cancelled
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "COMPLETED",
            RunStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    /// Overall status from the terminal document statuses.
    ///
    /// | documents                                   | run                    |
    /// |---------------------------------------------|------------------------|
    /// | none                                        | FAILED                 |
    /// | all COMPLETED                               | COMPLETED              |
    /// | all FAILED                                  | FAILED                 |
    /// | all CANCELLED                               | CANCELLED              |
    /// | some CANCELLED, cancellation observed       | CANCELLED              |
    /// | anything else                               | COMPLETED_WITH_ERRORS  |
    pub fn derive(statuses: &[DocumentStatus], cancel_observed: bool) -> RunStatus {
        let all = |s: DocumentStatus| statuses.iter().all(|d| *d == s);

        if statuses.is_empty() {
            return RunStatus::Failed;
        }
        if all(DocumentStatus::Completed) {
            return RunStatus::Completed;
        }
        if all(DocumentStatus::Failed) {
            return RunStatus::Failed;
        }
        if all(DocumentStatus::Cancelled) {
            return RunStatus::Cancelled;
        }
        if cancel_observed && statuses.contains(&DocumentStatus::Cancelled) {
            return RunStatus::Cancelled;
        }
        RunStatus::CompletedWithErrors
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Timeline
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    StatusChanged,
    PhaseSkipped,
    VariantGenerated,
    GenerationFailed,
    VariantEvaluated,
    EvaluationFailed,
    ComparisonCompleted,
    ComparisonFailed,
    WinnerSelected,
    Combined,
    CombineFailed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEvent {
    pub document_id: String,
    /// Per-document emission order, starting at 0.
    pub seq: u64,
    pub phase: DocumentStatus,
    pub kind: TimelineEventKind,
    pub message: String,
    /// Monotonic milliseconds since the run started.
    pub elapsed_ms: u64,
    pub timestamp_ms: i64,
}

// =============================================================================
// Document and run results
// =============================================================================

/// How a document's winner was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerSource {
    Tournament,
    SingleEval,
    SoleVariant,
    FirstGenerated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentResult {
    pub document_id: String,
    pub document_name: String,
    pub status: DocumentStatus,
    pub variants: Vec<Variant>,
    pub evaluations: BTreeMap<String, SingleEvalResult>,
    pub pairwise: Option<PairwiseOutcome>,
    pub winner_id: Option<String>,
    pub winner_source: Option<WinnerSource>,
    pub combined: Option<CombinedOutput>,
    pub post_combine: Option<PairwiseOutcome>,
    pub timeline: Vec<TimelineEvent>,
    pub errors: Vec<String>,
    pub cost_nanodollars: i64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
}

impl DocumentResult {
    pub fn new(document: &DocumentInput) -> Self {
        Self {
            document_id: document.id.clone(),
            document_name: document.display_name().to_string(),
            status: DocumentStatus::Pending,
            variants: Vec::new(),
            evaluations: BTreeMap::new(),
            pairwise: None,
            winner_id: None,
            winner_source: None,
            combined: None,
            post_combine: None,
            timeline: Vec::new(),
            errors: Vec::new(),
            cost_nanodollars: 0,
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: 0,
        }
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.variant_id == variant_id)
    }

    pub fn winner(&self) -> Option<&Variant> {
        self.winner_id.as_deref().and_then(|id| self.variant(id))
    }

    pub(crate) fn add_usage(&mut self, input_tokens: u32, output_tokens: u32, cost: i64) {
        self.input_tokens += input_tokens as u64;
        self.output_tokens += output_tokens as u64;
        self.cost_nanodollars += cost;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Whether the cancellation signal fired during the run.
    pub cancelled: bool,
    /// One entry per configured document, in configuration order.
    pub documents: Vec<DocumentResult>,
    pub total_cost_nanodollars: i64,
    /// Sum of per-document durations.
    pub total_duration_ms: u64,
    pub wall_duration_ms: u64,
    pub errors: Vec<String>,
    pub stats: RunStatsSnapshot,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn document(&self, document_id: &str) -> Option<&DocumentResult> {
        self.documents.iter().find(|d| d.document_id == document_id)
    }

    pub fn count(&self, status: DocumentStatus) -> usize {
        self.documents.iter().filter(|d| d.status == status).count()
    }
}
