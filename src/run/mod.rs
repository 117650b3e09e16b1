//! Batch orchestration: one pipeline per document, fanned out by the
//! coordinator under shared API and pipeline concurrency limits.
//!
//! ```text
//! RunCoordinator
//!   └─ DocumentPipeline (one per document, bounded by PipelineGate)
//!        ├─ GenerationUnit × (generator × model × iteration)
//!        ├─ PairwiseTournament
//!        ├─ CombineStage
//!        └─ PairwiseTournament (post-combine, optional)
//! ```
//!
//! Every provider call in every phase goes through the one `ApiGate`.

pub mod combine;
pub mod config;
pub mod coordinator;
pub mod gate;
pub mod generation;
pub mod judging;
pub mod pipeline;
pub mod stats;
pub mod store;
pub mod timeline;
pub mod tournament;
pub mod types;

use crate::gateway::{Attribution, CallKind, ChatModel, ChatRequest, Message};

pub use combine::{CombineError, CombineStage};
pub use config::{
    validate_run_configuration, CombineFailurePolicy, ConfigError, DocumentInput, GeneratorSpec,
    RunConfiguration,
};
pub use coordinator::{RunControls, RunCoordinator};
pub use gate::{ApiGate, CancelSignal, GatedCallError, PipelineGate};
pub use generation::{GenerationError, GenerationUnit};
pub use pipeline::DocumentPipeline;
pub use stats::{RunStats, RunStatsSnapshot};
pub use store::{JsonDirStore, RunStore, SqliteRunStore, StoreError};
pub use timeline::{
    ChannelTimelineSink, JsonlTimelineSink, NoopTimelineSink, TimelineError, TimelineSink,
    TimelineWorker,
};
pub use tournament::{Candidate, PairwiseTournament, TournamentError};
pub use types::*;

/// What a phase component needs to issue calls on behalf of one document.
#[derive(Clone, Copy)]
pub struct DocumentScope<'a> {
    pub document: &'a DocumentInput,
    pub settings: &'a RunConfiguration,
    pub gate: &'a ApiGate,
}

impl DocumentScope<'_> {
    pub fn request(&self, kind: CallKind, model: &str, messages: Vec<Message>) -> ChatRequest {
        ChatRequest::new(
            ChatModel::openrouter(model),
            messages,
            Attribution::for_kind(kind)
                .with_run(self.gate.run_id())
                .with_document(self.document.id.as_str()),
        )
    }
}
