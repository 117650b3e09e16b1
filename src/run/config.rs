//! Run configuration: documents, generator strategies and feature toggles.
//!
//! Everything optional has a serde default so a minimal JSON file is a valid
//! configuration:
//!
//! ```json
//! {
//!   "documents": [{"id": "intro", "content": "..."}],
//!   "generators": [{"name": "tighten", "instructions": "...", "models": ["openai/gpt-5-mini"]}]
//! }
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub const DEFAULT_JUDGE_MODEL: &str = "openai/gpt-5-mini";
pub const DEFAULT_EVALUATION_CRITERIA: &str =
    "Faithfulness to the source document, clarity, structure, and overall quality of writing.";

/// Upper bound for both concurrency caps; the gates are tokio semaphores.
pub const MAX_CONCURRENCY: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// One input document. `id` must be unique within the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentInput {
    pub id: String,
    /// Display name; falls back to the id when empty.
    #[serde(default)]
    pub name: String,
    pub content: String,
}

impl DocumentInput {
    pub fn new(id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A generation strategy: one prompt style applied with each of its models.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratorSpec {
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    pub models: Vec<String>,
    /// Overrides `generation_temperature` for this generator.
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// What a failed combine call does to the document's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineFailurePolicy {
    /// Keep everything collected and finish as COMPLETED_WITH_ERRORS.
    #[default]
    Degrade,
    /// Mark the document FAILED.
    FailDocument,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfiguration {
    pub documents: Vec<DocumentInput>,
    pub generators: Vec<GeneratorSpec>,
    #[serde(default = "default_iterations")]
    pub iterations: u32,

    #[serde(default = "default_true")]
    pub enable_single_eval: bool,
    #[serde(default = "default_true")]
    pub enable_pairwise: bool,
    #[serde(default = "default_true")]
    pub enable_combine: bool,
    #[serde(default)]
    pub enable_post_combine_eval: bool,

    #[serde(default = "default_max_api_concurrency")]
    pub max_api_concurrency: usize,
    #[serde(default = "default_max_active_pipelines")]
    pub max_active_pipelines: usize,

    /// Model for single evaluation and pairwise comparison calls.
    #[serde(default = "default_judge_model")]
    pub judge_model: String,
    /// Model for the combine call; defaults to `judge_model`.
    #[serde(default)]
    pub combine_model: Option<String>,
    #[serde(default = "default_combine_runner_ups")]
    pub combine_runner_ups: usize,
    #[serde(default)]
    pub combine_failure: CombineFailurePolicy,
    #[serde(default = "default_evaluation_criteria")]
    pub evaluation_criteria: String,

    #[serde(default = "default_generation_temperature")]
    pub generation_temperature: f32,
    #[serde(default = "default_max_generation_tokens")]
    pub max_generation_tokens: u32,
    #[serde(default = "default_max_combine_tokens")]
    pub max_combine_tokens: u32,
    #[serde(default = "default_max_eval_tokens")]
    pub max_eval_tokens: u32,

    /// Run-wide spend cap. Reaching it cancels the run.
    #[serde(default)]
    pub cost_budget_nanodollars: Option<i64>,
}

fn default_iterations() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_api_concurrency() -> usize {
    8
}

fn default_max_active_pipelines() -> usize {
    4
}

fn default_judge_model() -> String {
    DEFAULT_JUDGE_MODEL.to_string()
}

fn default_combine_runner_ups() -> usize {
    1
}

fn default_evaluation_criteria() -> String {
    DEFAULT_EVALUATION_CRITERIA.to_string()
}

fn default_generation_temperature() -> f32 {
    0.7
}

fn default_max_generation_tokens() -> u32 {
    4096
}

fn default_max_combine_tokens() -> u32 {
    8192
}

fn default_max_eval_tokens() -> u32 {
    512
}

impl RunConfiguration {
    /// Configuration with every optional field at its default.
    pub fn new(documents: Vec<DocumentInput>, generators: Vec<GeneratorSpec>) -> Self {
        Self {
            documents,
            generators,
            iterations: default_iterations(),
            enable_single_eval: true,
            enable_pairwise: true,
            enable_combine: true,
            enable_post_combine_eval: false,
            max_api_concurrency: default_max_api_concurrency(),
            max_active_pipelines: default_max_active_pipelines(),
            judge_model: default_judge_model(),
            combine_model: None,
            combine_runner_ups: default_combine_runner_ups(),
            combine_failure: CombineFailurePolicy::default(),
            evaluation_criteria: default_evaluation_criteria(),
            generation_temperature: default_generation_temperature(),
            max_generation_tokens: default_max_generation_tokens(),
            max_combine_tokens: default_max_combine_tokens(),
            max_eval_tokens: default_max_eval_tokens(),
            cost_budget_nanodollars: None,
        }
    }

    pub fn combine_model(&self) -> &str {
        self.combine_model.as_deref().unwrap_or(&self.judge_model)
    }

    /// Number of generation units each document runs in phase 1.
    pub fn generations_per_document(&self) -> usize {
        let models: usize = self.generators.iter().map(|g| g.models.len()).sum();
        models * self.iterations as usize
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("run has no documents")]
    NoDocuments,
    #[error("document at position {0} has an empty id")]
    EmptyDocumentId(usize),
    #[error("duplicate document id: {0}")]
    DuplicateDocumentId(String),
    #[error("document {0} has empty content")]
    EmptyContent(String),
    #[error("run has no generators")]
    NoGenerators,
    #[error("duplicate generator name: {0}")]
    DuplicateGenerator(String),
    #[error("generator {0} has no models")]
    GeneratorWithoutModels(String),
    #[error("generator {0} lists an empty model id")]
    EmptyModel(String),
    #[error("generator {generator} lists model {model} more than once")]
    DuplicateModel { generator: String, model: String },
    #[error("iterations must be >= 1")]
    ZeroIterations,
    #[error("max_api_concurrency must be >= 1")]
    ZeroApiConcurrency,
    #[error("max_active_pipelines must be >= 1")]
    ZeroPipelineConcurrency,
    #[error("{field} must be <= {max}, got {value}")]
    ConcurrencyTooLarge {
        field: &'static str,
        value: usize,
        max: usize,
    },
    #[error("{field} must be within [0, 2], got {value}")]
    TemperatureOutOfRange { field: String, value: f32 },
    #[error("judge_model must not be empty")]
    EmptyJudgeModel,
    #[error("cost_budget_nanodollars must be positive, got {0}")]
    NonPositiveBudget(i64),
}

/// Check a configuration before any pipeline is created.
pub fn validate_run_configuration(config: &RunConfiguration) -> Result<(), ConfigError> {
    if config.documents.is_empty() {
        return Err(ConfigError::NoDocuments);
    }

    let mut seen = HashSet::new();
    for (idx, doc) in config.documents.iter().enumerate() {
        if doc.id.trim().is_empty() {
            return Err(ConfigError::EmptyDocumentId(idx));
        }
        if !seen.insert(doc.id.as_str()) {
            return Err(ConfigError::DuplicateDocumentId(doc.id.clone()));
        }
        if doc.content.trim().is_empty() {
            return Err(ConfigError::EmptyContent(doc.id.clone()));
        }
    }

    if config.generators.is_empty() {
        return Err(ConfigError::NoGenerators);
    }
    let mut names = HashSet::new();
    for generator in &config.generators {
        if !names.insert(generator.name.as_str()) {
            return Err(ConfigError::DuplicateGenerator(generator.name.clone()));
        }
        if generator.models.is_empty() {
            return Err(ConfigError::GeneratorWithoutModels(generator.name.clone()));
        }
        if generator.models.iter().any(|m| m.trim().is_empty()) {
            return Err(ConfigError::EmptyModel(generator.name.clone()));
        }
        // Variant ids hash (generator, model, iteration); a repeated model would collide.
        let mut models = HashSet::new();
        for model in &generator.models {
            if !models.insert(model.as_str()) {
                return Err(ConfigError::DuplicateModel {
                    generator: generator.name.clone(),
                    model: model.clone(),
                });
            }
        }
        if let Some(t) = generator.temperature {
            check_temperature(&format!("generators[{}].temperature", generator.name), t)?;
        }
    }

    if config.iterations == 0 {
        return Err(ConfigError::ZeroIterations);
    }
    if config.max_api_concurrency == 0 {
        return Err(ConfigError::ZeroApiConcurrency);
    }
    if config.max_active_pipelines == 0 {
        return Err(ConfigError::ZeroPipelineConcurrency);
    }
    for (field, value) in [
        ("max_api_concurrency", config.max_api_concurrency),
        ("max_active_pipelines", config.max_active_pipelines),
    ] {
        if value > MAX_CONCURRENCY {
            return Err(ConfigError::ConcurrencyTooLarge {
                field,
                value,
                max: MAX_CONCURRENCY,
            });
        }
    }
    check_temperature("generation_temperature", config.generation_temperature)?;
    if config.judge_model.trim().is_empty() {
        return Err(ConfigError::EmptyJudgeModel);
    }
    if let Some(budget) = config.cost_budget_nanodollars {
        if budget <= 0 {
            return Err(ConfigError::NonPositiveBudget(budget));
        }
    }

    Ok(())
}

fn check_temperature(field: &str, value: f32) -> Result<(), ConfigError> {
    if !(0.0..=2.0).contains(&value) {
        return Err(ConfigError::TemperatureOutOfRange {
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> RunConfiguration {
        RunConfiguration::new(
            vec![DocumentInput::new("a", "A", "alpha")],
            vec![GeneratorSpec {
                name: "plain".into(),
                instructions: String::new(),
                models: vec!["m1".into()],
                temperature: None,
            }],
        )
    }

    #[test]
    fn minimal_json_fills_defaults() {
        let raw = r#"{
            "documents": [{"id": "a", "content": "alpha"}],
            "generators": [{"name": "plain", "models": ["m1", "m2"]}]
        }"#;
        let config: RunConfiguration = serde_json::from_str(raw).unwrap();
        assert_eq!(config.iterations, 1);
        assert!(config.enable_pairwise);
        assert!(config.enable_combine);
        assert!(!config.enable_post_combine_eval);
        assert_eq!(config.max_api_concurrency, 8);
        assert_eq!(config.max_active_pipelines, 4);
        assert_eq!(config.combine_model(), DEFAULT_JUDGE_MODEL);
        assert_eq!(config.combine_failure, CombineFailurePolicy::Degrade);
        assert_eq!(config.generations_per_document(), 2);
        assert_eq!(config.documents[0].display_name(), "a");
        assert!(validate_run_configuration(&config).is_ok());
    }

    #[test]
    fn rejects_empty_document_set() {
        let mut config = minimal();
        config.documents.clear();
        assert_eq!(
            validate_run_configuration(&config),
            Err(ConfigError::NoDocuments)
        );
    }

    #[test]
    fn rejects_duplicate_ids_and_empty_content() {
        let mut config = minimal();
        config.documents.push(DocumentInput::new("a", "again", "beta"));
        assert_eq!(
            validate_run_configuration(&config),
            Err(ConfigError::DuplicateDocumentId("a".into()))
        );

        let mut config = minimal();
        config.documents[0].content = "   ".into();
        assert_eq!(
            validate_run_configuration(&config),
            Err(ConfigError::EmptyContent("a".into()))
        );
    }

    #[test]
    fn rejects_model_listed_twice_in_one_generator() {
        let mut config = minimal();
        config.generators[0].models = vec!["m1".into(), "m2".into(), "m1".into()];
        assert_eq!(
            validate_run_configuration(&config),
            Err(ConfigError::DuplicateModel {
                generator: "plain".into(),
                model: "m1".into(),
            })
        );

        // The same model under two generators yields distinct variant ids.
        let mut config = minimal();
        let mut other = config.generators[0].clone();
        other.name = "other".into();
        config.generators.push(other);
        assert!(validate_run_configuration(&config).is_ok());
    }

    #[test]
    fn rejects_concurrency_beyond_semaphore_capacity() {
        let mut config = minimal();
        config.max_api_concurrency = usize::MAX;
        assert_eq!(
            validate_run_configuration(&config),
            Err(ConfigError::ConcurrencyTooLarge {
                field: "max_api_concurrency",
                value: usize::MAX,
                max: MAX_CONCURRENCY,
            })
        );

        let mut config = minimal();
        config.max_active_pipelines = MAX_CONCURRENCY + 1;
        assert!(matches!(
            validate_run_configuration(&config),
            Err(ConfigError::ConcurrencyTooLarge {
                field: "max_active_pipelines",
                ..
            })
        ));

        let mut config = minimal();
        config.max_api_concurrency = MAX_CONCURRENCY;
        assert!(validate_run_configuration(&config).is_ok());
    }

    #[test]
    fn rejects_zero_concurrency_and_iterations() {
        let mut config = minimal();
        config.max_api_concurrency = 0;
        assert_eq!(
            validate_run_configuration(&config),
            Err(ConfigError::ZeroApiConcurrency)
        );

        let mut config = minimal();
        config.max_active_pipelines = 0;
        assert_eq!(
            validate_run_configuration(&config),
            Err(ConfigError::ZeroPipelineConcurrency)
        );

        let mut config = minimal();
        config.iterations = 0;
        assert_eq!(
            validate_run_configuration(&config),
            Err(ConfigError::ZeroIterations)
        );
    }

    #[test]
    fn rejects_generator_without_models() {
        let mut config = minimal();
        config.generators[0].models.clear();
        assert_eq!(
            validate_run_configuration(&config),
            Err(ConfigError::GeneratorWithoutModels("plain".into()))
        );
    }

    #[test]
    fn rejects_out_of_range_temperature() {
        let mut config = minimal();
        config.generators[0].temperature = Some(3.5);
        assert!(matches!(
            validate_run_configuration(&config),
            Err(ConfigError::TemperatureOutOfRange { .. })
        ));
    }
}
