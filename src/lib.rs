#![forbid(unsafe_code)]

//! # refinery-harness
//!
//! Batch document refinement with LLMs. Each document goes through its own
//! pipeline: generate several candidate variants, optionally score each,
//! run a pairwise tournament to pick a winner, merge the winner with its
//! runner-ups, and optionally check the merge against the winner.
//!
//! Many documents run at once. A single API gate caps in-flight provider
//! calls across the whole run, a pipeline gate caps concurrently active
//! documents, and one cancellation signal reaches every pending call.
//! A document's failure never aborts its siblings; the run's status is
//! derived from the terminal status of every document.

pub mod gateway;
pub mod prompts;
pub mod run;

pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use run::{
    CancelSignal, DocumentInput, DocumentResult, DocumentStatus, GeneratorSpec, RunConfiguration,
    RunControls, RunCoordinator, RunResult, RunStats, RunStatus, RunStore, TimelineEvent,
    TimelineSink,
};
