//! GenerationUnit: one variant for one `(generator, model, iteration)`,
//! optionally scored right away by the single-document evaluator.

use std::sync::Arc;
use std::time::Instant;

use crate::gateway::CallKind;
use crate::prompts::{EVALUATE_V1, GENERATE_V1};

use super::config::GeneratorSpec;
use super::gate::GatedCallError;
use super::judging::parse_eval_response;
use super::types::{variant_id, SingleEvalResult, Variant};
use super::DocumentScope;

/// One cell of the generator × model × iteration grid.
#[derive(Debug, Clone)]
pub struct GenerationTask {
    pub generator: Arc<GeneratorSpec>,
    pub model: String,
    pub iteration: u32,
}

impl GenerationTask {
    pub fn label(&self) -> String {
        format!("{}/{}#{}", self.generator.name, self.model, self.iteration)
    }
}

/// All tasks for one document, in configuration order.
pub fn generation_tasks(generators: &[GeneratorSpec], iterations: u32) -> Vec<GenerationTask> {
    let mut tasks = Vec::new();
    for generator in generators {
        let generator = Arc::new(generator.clone());
        for model in &generator.models {
            for iteration in 0..iterations {
                tasks.push(GenerationTask {
                    generator: Arc::clone(&generator),
                    model: model.clone(),
                    iteration,
                });
            }
        }
    }
    tasks
}

#[derive(Debug, Clone)]
pub enum EvalOutcome {
    Skipped,
    Scored(SingleEvalResult),
    /// The evaluation call failed; the variant is still kept.
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// `sequence` is assigned by the pipeline when the variant is stored.
    pub variant: Variant,
    pub evaluation: EvalOutcome,
    /// Tokens and cost of the evaluation call, if one was made.
    pub eval_input_tokens: u32,
    pub eval_output_tokens: u32,
    pub eval_cost_nanodollars: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generation {task} cancelled")]
    Cancelled { task: String },
    #[error("generation {task} failed: {source}")]
    Provider {
        task: String,
        #[source]
        source: crate::gateway::ProviderError,
    },
    #[error("generation {task} returned empty content")]
    EmptyContent { task: String },
}

impl GenerationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GenerationError::Cancelled { .. })
    }
}

pub struct GenerationUnit<'a> {
    scope: DocumentScope<'a>,
}

impl<'a> GenerationUnit<'a> {
    pub fn new(scope: DocumentScope<'a>) -> Self {
        Self { scope }
    }

    pub async fn run(&self, task: &GenerationTask) -> Result<GenerationOutput, GenerationError> {
        let document = self.scope.document;
        let settings = self.scope.settings;
        let label = task.label();

        let prompt = GENERATE_V1.render(&[
            ("generator_name", task.generator.name.as_str()),
            ("instructions", task.generator.instructions.as_str()),
            ("document_name", document.display_name()),
            ("document", document.content.as_str()),
        ]);
        let req = self
            .scope
            .request(CallKind::Generate, &task.model, prompt.to_messages())
            .temperature(
                task.generator
                    .temperature
                    .unwrap_or(settings.generation_temperature),
            )
            .max_tokens(settings.max_generation_tokens);

        let start = Instant::now();
        let resp = self.scope.gate.call(req).await.map_err(|e| match e {
            GatedCallError::Cancelled => GenerationError::Cancelled {
                task: label.clone(),
            },
            GatedCallError::Provider(source) => GenerationError::Provider {
                task: label.clone(),
                source,
            },
        })?;

        if resp.content.trim().is_empty() {
            return Err(GenerationError::EmptyContent { task: label });
        }

        let variant = Variant {
            variant_id: variant_id(
                &document.id,
                &task.generator.name,
                &task.model,
                task.iteration,
            ),
            document_id: document.id.clone(),
            generator: task.generator.name.clone(),
            model: task.model.clone(),
            iteration: task.iteration,
            sequence: 0,
            content: resp.content,
            input_tokens: resp.input_tokens,
            output_tokens: resp.output_tokens,
            cost_nanodollars: resp.cost_nanodollars,
            latency_ms: start.elapsed().as_millis() as u64,
        };

        if !settings.enable_single_eval {
            return Ok(GenerationOutput {
                variant,
                evaluation: EvalOutcome::Skipped,
                eval_input_tokens: 0,
                eval_output_tokens: 0,
                eval_cost_nanodollars: 0,
            });
        }

        Ok(self.evaluate(variant).await)
    }

    async fn evaluate(&self, variant: Variant) -> GenerationOutput {
        let settings = self.scope.settings;
        let prompt = EVALUATE_V1.render(&[
            ("criteria", settings.evaluation_criteria.as_str()),
            ("document", self.scope.document.content.as_str()),
            ("candidate", variant.content.as_str()),
        ]);
        let req = self
            .scope
            .request(CallKind::Evaluate, &settings.judge_model, prompt.to_messages())
            .max_tokens(settings.max_eval_tokens)
            .json();

        let (evaluation, input_tokens, output_tokens, cost) = match self.scope.gate.call(req).await {
            Err(GatedCallError::Cancelled) => (EvalOutcome::Cancelled, 0, 0, 0),
            Err(GatedCallError::Provider(e)) => (EvalOutcome::Failed(e.to_string()), 0, 0, 0),
            Ok(resp) => {
                let outcome = match parse_eval_response(&resp.content) {
                    Ok(parsed) => EvalOutcome::Scored(SingleEvalResult {
                        variant_id: variant.variant_id.clone(),
                        model: settings.judge_model.clone(),
                        score: parsed.score,
                        criteria: parsed.criteria,
                        rationale: parsed.rationale,
                        cost_nanodollars: resp.cost_nanodollars,
                    }),
                    Err(e) => EvalOutcome::Failed(format!(
                        "evaluation of {} unparseable: {e}",
                        variant.variant_id
                    )),
                };
                (
                    outcome,
                    resp.input_tokens,
                    resp.output_tokens,
                    resp.cost_nanodollars,
                )
            }
        };

        GenerationOutput {
            variant,
            evaluation,
            eval_input_tokens: input_tokens,
            eval_output_tokens: output_tokens,
            eval_cost_nanodollars: cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_cover_the_full_grid_in_order() {
        let generators = vec![
            GeneratorSpec {
                name: "tighten".into(),
                instructions: String::new(),
                models: vec!["m1".into(), "m2".into()],
                temperature: None,
            },
            GeneratorSpec {
                name: "expand".into(),
                instructions: String::new(),
                models: vec!["m1".into()],
                temperature: Some(0.2),
            },
        ];
        let labels: Vec<String> = generation_tasks(&generators, 2)
            .iter()
            .map(GenerationTask::label)
            .collect();
        assert_eq!(
            labels,
            vec![
                "tighten/m1#0",
                "tighten/m1#1",
                "tighten/m2#0",
                "tighten/m2#1",
                "expand/m1#0",
                "expand/m1#1",
            ]
        );
    }
}
